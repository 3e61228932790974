use super::ops;
use super::tables::{entries_from, intern, TableKind, TableSpec};
use crate::errors::KsError;
use crate::policy::PidSelector;
use crate::tracker::IdentityContext;
use kestrel_common::selectors::{KsPidDesc, PID_FLAG_FOLLOW_FORKS, PID_FLAG_NS};
use kestrel_common::PIDS_INLINE_MAX;
use serde_json::Value;

/// Compiles a `match_pid` clause into its fixed descriptor. No clause, or a
/// clause with no values, compiles to the match-all descriptor so the kernel
/// matcher needs no special case for "unfiltered".
pub(crate) fn compile_pid(
    sel: Option<&PidSelector>,
    ident: &IdentityContext,
    tables: &mut Vec<TableSpec>,
) -> Result<KsPidDesc, KsError> {
    let sel = match sel {
        Some(s) if !s.values.is_empty() => s,
        _ => return Ok(KsPidDesc::match_all()),
    };

    let op = ops::resolve_pid(&sel.operator)?;
    let mut flags = 0;
    if sel.namespaced {
        flags |= PID_FLAG_NS;
    }
    if sel.follow_forks {
        flags |= PID_FLAG_FOLLOW_FORKS;
    }

    let mut pids = Vec::with_capacity(sel.values.len());
    for v in &sel.values {
        pids.push(pid_literal(v, sel.namespaced, ident)?);
    }

    let mut desc = KsPidDesc::match_all();
    desc.op = op;
    desc.flags = flags;

    if pids.len() <= PIDS_INLINE_MAX {
        pids.sort_unstable();
        pids.dedup();
        desc.pid_count = pids.len() as u32;
        for (i, pid) in pids.iter().enumerate() {
            desc.pids[i] = *pid;
        }
    } else {
        let entries = entries_from(pids.into_iter().map(i64::from));
        desc.pid_count = entries.len() as u32;
        desc.table_id = intern(tables, TableSpec::new(TableKind::Pid, 0, entries))?;
    }

    Ok(desc)
}

/// A PID literal is a JSON number in u32 range or the string `"self"`,
/// which resolves against the loading process at compile time (host PID,
/// or its namespace-local PID when the clause is namespaced).
fn pid_literal(v: &Value, namespaced: bool, ident: &IdentityContext) -> Result<u32, KsError> {
    if let Some(s) = v.as_str() {
        if s == "self" {
            return Ok(if namespaced { ident.ns_pid } else { ident.pid });
        }
        return Err(KsError::Encoding {
            attribute: "pid",
            value: s.to_string(),
        });
    }
    match v.as_u64() {
        Some(n) if n <= u64::from(u32::MAX) => Ok(n as u32),
        _ => Err(KsError::Encoding {
            attribute: "pid",
            value: format!("{:?}", v),
        }),
    }
}
