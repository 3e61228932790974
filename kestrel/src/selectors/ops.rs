use crate::errors::KsError;
use kestrel_common::selectors::{KsArgType, KsOp, KsPidOp, KsVar};
use kestrel_common::VALUES_INLINE_MAX;

/// How many literal values an operator takes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Arity {
    /// One or more values, OR-ed (for `neq`: the argument must differ
    /// from every value).
    Multi,
    /// Exactly one value.
    Single,
    /// Exactly two values: inclusive low and high bounds.
    Pair,
}

pub(crate) fn resolve(name: &str) -> Result<KsOp, KsError> {
    let mut s = name.to_string();
    let op = KsOp::from_str(s.as_mut_str());
    if op.is_undefined() {
        return Err(KsError::UnknownOperator(name.to_string()));
    }
    Ok(op)
}

pub(crate) fn resolve_pid(name: &str) -> Result<KsPidOp, KsError> {
    let mut s = name.to_string();
    let op = KsPidOp::from_str(s.as_mut_str());
    if op.is_undefined() {
        return Err(KsError::UnknownOperator(name.to_string()));
    }
    Ok(op)
}

pub(crate) fn arity(op: KsOp) -> Arity {
    match op {
        KsOp::Gt | KsOp::Lt => Arity::Single,
        KsOp::Range => Arity::Pair,
        _ => Arity::Multi,
    }
}

pub(crate) fn supports(op: KsOp, vtype: KsArgType) -> bool {
    match op {
        KsOp::Eq | KsOp::Neq => true,
        KsOp::InTable | KsOp::Gt | KsOp::Lt | KsOp::Range => !vtype.is_string(),
        KsOp::Prefix | KsOp::Postfix => vtype.is_string(),
        KsOp::Undefined => false,
    }
}

/// Whether the compiled descriptor must reference a membership table.
/// Past the inline limit, sequential compares in the kernel matcher are no
/// longer acceptable; membership becomes a single table lookup. Only
/// operators whose multi-value form already means "is one of" may take
/// this path — lowering a `neq` set to a table would invert it into
/// membership.
pub(crate) fn needs_table(op: KsOp, value_count: usize) -> bool {
    match op {
        KsOp::InTable => true,
        KsOp::Eq => value_count > VALUES_INLINE_MAX,
        _ => false,
    }
}
