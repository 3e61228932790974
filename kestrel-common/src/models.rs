use crate::ARGS_PER_SELECTOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub enum KsProbeClass {
    Undefined = -1,
    Tracepoint = 0,
    Kprobe = 1,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub enum KsEventType {
    Undefined = -1,
    Enter = 0,
    Exec = 1,
    Fork = 2,
    Exit = 3,
}

/// Event record carried over the per-CPU perf buffers. The kernel matcher
/// only emits records that passed the active selector blob; `selector_id`
/// is the 1-based position of the selector that accepted the event.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct KsEvent {
    pub class: KsProbeClass,
    pub event_type: KsEventType,
    pub attach_idx: u32,
    pub selector_id: u32,
    pub pid: u32,
    pub tgid: u32,
    pub ppid: u32,
    pub ns_pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub arg_count: u32,
    pub _pad: u32,
    pub args: [i64; ARGS_PER_SELECTOR],
    pub comm: [u8; 64],
}

impl KsEvent {
    pub fn to_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}
