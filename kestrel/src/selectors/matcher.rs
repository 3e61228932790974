use kestrel_common::selectors::{
    KsArgDesc, KsOp, KsPidDesc, KsPidOp, KsSelectorWalker, KsVar,
};
use std::collections::HashSet;

/// Read side of the membership tables, mirroring what the kernel matcher
/// resolves with a map lookup.
pub(crate) trait TableLookup {
    fn contains(&self, table_id: u32, value: i64) -> bool;
}

/// Follow-forks state: processes approved by a matching selector, extended
/// to their descendants as fork events arrive. Cleared when the policy that
/// granted the approvals is replaced.
#[derive(Debug, Default)]
pub(crate) struct Approvals {
    pids: HashSet<u32>,
}

impl Approvals {
    pub(crate) fn new() -> Approvals {
        Approvals::default()
    }

    pub(crate) fn approve(&mut self, pid: u32) {
        self.pids.insert(pid);
    }

    pub(crate) fn note_fork(&mut self, parent: u32, child: u32) {
        if self.pids.contains(&parent) {
            self.pids.insert(child);
        }
    }

    pub(crate) fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    pub(crate) fn clear(&mut self) {
        self.pids.clear();
    }
}

/// One intercepted call as the matcher sees it.
#[derive(Debug, Clone)]
pub(crate) struct EventInput<'a> {
    pub pid: u32,
    pub ns_pid: u32,
    pub args: &'a [(u32, ArgValue)],
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ArgValue {
    Int(i64),
    Str(String),
}

/// Walks a compiled blob against one event. Selectors are OR-ed
/// alternatives tried in order; the first whose PID descriptor and every
/// argument descriptor hold wins, and its 1-based position is returned (the
/// kernel reports the same id in its events, with 0 meaning no match).
/// A winning selector with follow-forks set approves the event's process.
pub(crate) fn match_event(
    blob: &[u8],
    ev: &EventInput,
    tables: &dyn TableLookup,
    approvals: &mut Approvals,
) -> Option<u32> {
    for (i, sel) in KsSelectorWalker::new(blob).enumerate() {
        if !eval_pid(&sel.pid, ev, tables, approvals) {
            continue;
        }
        let args_hold = sel.args[..sel.arg_count as usize]
            .iter()
            .all(|d| eval_arg(d, ev, tables));
        if args_hold {
            if sel.pid.follow_forks() {
                approvals.approve(ev.pid);
            }
            return Some(i as u32 + 1);
        }
    }
    None
}

fn eval_pid(
    desc: &KsPidDesc,
    ev: &EventInput,
    tables: &dyn TableLookup,
    approvals: &Approvals,
) -> bool {
    if desc.op.is_undefined() {
        return true;
    }
    if desc.follow_forks() && approvals.contains(ev.pid) {
        return true;
    }
    let pid = if desc.namespaced() { ev.ns_pid } else { ev.pid };
    let member = if desc.table_id != 0 {
        tables.contains(desc.table_id, i64::from(pid))
    } else {
        desc.pids[..desc.pid_count as usize].contains(&pid)
    };
    match desc.op {
        KsPidOp::In => member,
        KsPidOp::NotIn => !member,
        KsPidOp::Undefined => true,
    }
}

fn eval_arg(desc: &KsArgDesc, ev: &EventInput, tables: &dyn TableLookup) -> bool {
    let value = match ev.args.iter().find(|(i, _)| *i == desc.index) {
        Some((_, v)) => v,
        None => return false,
    };

    match desc.op {
        KsOp::Eq => inline(desc).any(|i| value_eq(desc, i, value)),
        KsOp::Neq => !inline(desc).any(|i| value_eq(desc, i, value)),
        KsOp::InTable => match value {
            ArgValue::Int(v) => tables.contains(desc.table_id, *v),
            ArgValue::Str(_) => false,
        },
        KsOp::Gt => int_of(value).map(|v| v > desc.values[0].int).unwrap_or(false),
        KsOp::Lt => int_of(value).map(|v| v < desc.values[0].int).unwrap_or(false),
        KsOp::Range => int_of(value)
            .map(|v| v >= desc.values[0].int && v <= desc.values[1].int)
            .unwrap_or(false),
        KsOp::Prefix => match value {
            ArgValue::Str(s) => inline(desc).any(|i| s.as_bytes().starts_with(desc.values[i].str_bytes())),
            ArgValue::Int(_) => false,
        },
        // Suffix literals are stored reversed; compare them against the
        // event string walked from its end.
        KsOp::Postfix => match value {
            ArgValue::Str(s) => inline(desc).any(|i| {
                let pat = desc.values[i].str_bytes();
                pat.len() <= s.len()
                    && pat.iter().zip(s.as_bytes().iter().rev()).all(|(a, b)| a == b)
            }),
            ArgValue::Int(_) => false,
        },
        KsOp::Undefined => false,
    }
}

fn inline(desc: &KsArgDesc) -> impl Iterator<Item = usize> {
    0..desc.value_count as usize
}

fn value_eq(desc: &KsArgDesc, i: usize, value: &ArgValue) -> bool {
    match value {
        ArgValue::Int(v) => desc.values[i].int == *v,
        ArgValue::Str(s) => desc.values[i].str_bytes() == s.as_bytes(),
    }
}

fn int_of(value: &ArgValue) -> Option<i64> {
    match value {
        ArgValue::Int(v) => Some(*v),
        ArgValue::Str(_) => None,
    }
}
