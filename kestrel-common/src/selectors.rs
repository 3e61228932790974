use crate::{ARGS_PER_SELECTOR, PIDS_INLINE_MAX, SELECTORS_MAX, SELECTOR_TAG, STR_VAL_LEN, VALUES_INLINE_MAX};

/// Parse helper for the closed enums below. Policy files carry lowercase
/// names; anything unrecognized maps to the Undefined discriminant and is
/// rejected by the compiler.
pub trait KsVar {
    fn from_str(_: &mut str) -> Self;
    fn is_undefined(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub enum KsPidOp {
    Undefined = -1,
    In = 0,
    NotIn = 1,
}

impl KsVar for KsPidOp {
    fn from_str(s: &mut str) -> Self {
        s.make_ascii_lowercase();
        match s.trim() {
            "in" => KsPidOp::In,
            "not_in" => KsPidOp::NotIn,
            _ => KsPidOp::Undefined,
        }
    }

    fn is_undefined(&self) -> bool {
        matches!(self, KsPidOp::Undefined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub enum KsOp {
    Undefined = -1,
    Eq = 0,
    Neq = 1,
    InTable = 2,
    Gt = 3,
    Lt = 4,
    Range = 5,
    Prefix = 6,
    Postfix = 7,
}

impl KsVar for KsOp {
    fn from_str(s: &mut str) -> Self {
        s.make_ascii_lowercase();
        match s.trim() {
            "eq" => KsOp::Eq,
            "neq" => KsOp::Neq,
            "in_map" => KsOp::InTable,
            "gt" => KsOp::Gt,
            "lt" => KsOp::Lt,
            "range" => KsOp::Range,
            "prefix" => KsOp::Prefix,
            "postfix" => KsOp::Postfix,
            _ => KsOp::Undefined,
        }
    }

    fn is_undefined(&self) -> bool {
        matches!(self, KsOp::Undefined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub enum KsArgType {
    Undefined = -1,
    Int = 0,
    UInt = 1,
    Long = 2,
    ULong = 3,
    Str = 4,
}

impl KsArgType {
    pub fn is_string(&self) -> bool {
        matches!(self, KsArgType::Str)
    }
}

impl KsVar for KsArgType {
    fn from_str(s: &mut str) -> Self {
        s.make_ascii_lowercase();
        match s.trim() {
            "int" => KsArgType::Int,
            "uint" => KsArgType::UInt,
            "long" => KsArgType::Long,
            "ulong" => KsArgType::ULong,
            "string" => KsArgType::Str,
            _ => KsArgType::Undefined,
        }
    }

    fn is_undefined(&self) -> bool {
        matches!(self, KsArgType::Undefined)
    }
}

/// PID descriptor flag: compare against the namespace-local PID instead of
/// the host PID.
pub const PID_FLAG_NS: u32 = 1;
/// PID descriptor flag: on match, pre-approve the process and its future
/// descendants until the policy is replaced.
pub const PID_FLAG_FOLLOW_FORKS: u32 = 2;

/// One encoded literal. Integers live in `int`, strings in `sbuf`.
/// All padding is explicit and zeroed so compiled blobs are byte-stable.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KsValue {
    pub int: i64,
    pub sbuf: [u8; STR_VAL_LEN],
    pub sbuf_len: u16,
    pub _pad: [u8; 6],
}

impl KsValue {
    pub const fn zeroed() -> KsValue {
        KsValue {
            int: 0,
            sbuf: [0; STR_VAL_LEN],
            sbuf_len: 0,
            _pad: [0; 6],
        }
    }

    pub fn str_bytes(&self) -> &[u8] {
        let len = self.sbuf_len as usize;
        if len > STR_VAL_LEN {
            &self.sbuf[..]
        } else {
            &self.sbuf[..len]
        }
    }
}

/// Compiled process-identity filter. `op == Undefined` means no constraint.
/// `pid_count` is the inline count; larger sets reference a value table.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KsPidDesc {
    pub op: KsPidOp,
    pub flags: u32,
    pub pid_count: u32,
    pub table_id: u32,
    pub pids: [u32; PIDS_INLINE_MAX],
}

impl KsPidDesc {
    pub const fn match_all() -> KsPidDesc {
        KsPidDesc {
            op: KsPidOp::Undefined,
            flags: 0,
            pid_count: 0,
            table_id: 0,
            pids: [0; PIDS_INLINE_MAX],
        }
    }

    pub fn namespaced(&self) -> bool {
        self.flags & PID_FLAG_NS != 0
    }

    pub fn follow_forks(&self) -> bool {
        self.flags & PID_FLAG_FOLLOW_FORKS != 0
    }
}

/// Compiled argument filter: argument index, operator, declared type and
/// either inline values or a table reference (`table_id != 0`).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KsArgDesc {
    pub index: u32,
    pub op: KsOp,
    pub vtype: KsArgType,
    pub value_count: u32,
    pub table_id: u32,
    pub _pad: u32,
    pub values: [KsValue; VALUES_INLINE_MAX],
}

impl KsArgDesc {
    pub const fn zeroed() -> KsArgDesc {
        KsArgDesc {
            index: 0,
            op: KsOp::Undefined,
            vtype: KsArgType::Undefined,
            value_count: 0,
            table_id: 0,
            _pad: 0,
            values: [KsValue::zeroed(); VALUES_INLINE_MAX],
        }
    }
}

/// One alternative match rule as the kernel matcher walks it. Records are
/// laid out back to back in a `KsSelectorBuffer`; a zero tag terminates the
/// sequence.
///
/// Walk contract: selectors are evaluated in order. The PID descriptor
/// (Undefined op counts as true) AND every argument descriptor must hold;
/// the first selector that evaluates true accepts the event and reports its
/// position, otherwise the event is rejected.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KsSelector {
    pub tag: u32,
    pub arg_count: u32,
    pub pid: KsPidDesc,
    pub args: [KsArgDesc; ARGS_PER_SELECTOR],
}

impl KsSelector {
    pub const fn empty() -> KsSelector {
        KsSelector {
            tag: SELECTOR_TAG,
            arg_count: 0,
            pid: KsPidDesc::match_all(),
            args: [KsArgDesc::zeroed(); ARGS_PER_SELECTOR],
        }
    }

    pub fn to_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }

    /// Reads one record from the front of `buf`. The buffer has no alignment
    /// guarantee, so this copies via an unaligned read.
    pub fn read_from(buf: &[u8]) -> Option<KsSelector> {
        if buf.len() < core::mem::size_of::<KsSelector>() {
            return None;
        }
        let sel = unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const KsSelector) };
        if sel.tag != SELECTOR_TAG {
            return None;
        }
        Some(sel)
    }
}

pub const SELECTOR_BUF_CAP: usize = SELECTORS_MAX * core::mem::size_of::<KsSelector>() + 4;

/// Fixed-capacity blob as stored in one slot of the per-attachment config
/// region. `len` covers the records plus the 4-byte sentinel.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KsSelectorBuffer {
    pub len: u32,
    pub data: [u8; SELECTOR_BUF_CAP],
}

impl KsSelectorBuffer {
    pub const fn zeroed() -> KsSelectorBuffer {
        KsSelectorBuffer {
            len: 0,
            data: [0; SELECTOR_BUF_CAP],
        }
    }
}

/// Iterates selector records in a compiled blob, stopping at the sentinel
/// or after `SELECTORS_MAX` records.
pub struct KsSelectorWalker<'a> {
    data: &'a [u8],
    off: usize,
    seen: usize,
}

impl<'a> KsSelectorWalker<'a> {
    pub fn new(data: &'a [u8]) -> KsSelectorWalker<'a> {
        KsSelectorWalker { data, off: 0, seen: 0 }
    }
}

impl Iterator for KsSelectorWalker<'_> {
    type Item = KsSelector;

    fn next(&mut self) -> Option<KsSelector> {
        if self.seen >= SELECTORS_MAX || self.off >= self.data.len() {
            return None;
        }
        let sel = KsSelector::read_from(&self.data[self.off..])?;
        self.off += core::mem::size_of::<KsSelector>();
        self.seen += 1;
        Some(sel)
    }
}

/// Key into the shared value-table map: a registry-assigned table id plus
/// one member value. Present keys mean set membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct KsTableKey {
    pub table_id: u32,
    pub _pad: u32,
    pub value: i64,
}

impl KsTableKey {
    pub fn new(table_id: u32, value: i64) -> KsTableKey {
        KsTableKey {
            table_id,
            _pad: 0,
            value,
        }
    }
}

#[cfg(feature = "user")]
mod maps {
    use super::{KsArgDesc, KsPidDesc, KsSelector, KsSelectorBuffer, KsTableKey, KsValue};
    use aya::Pod;
    unsafe impl Pod for KsSelector {}
    unsafe impl Pod for KsSelectorBuffer {}
    unsafe impl Pod for KsPidDesc {}
    unsafe impl Pod for KsArgDesc {}
    unsafe impl Pod for KsValue {}
    unsafe impl Pod for KsTableKey {}
}
