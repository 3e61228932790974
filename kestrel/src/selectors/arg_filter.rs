use super::encode::encode_value;
use super::ops::{self, Arity};
use super::tables::{entries_from, intern, TableKind, TableSpec};
use crate::errors::KsError;
use crate::policy::{ArgSelector, ArgSpec};
use kestrel_common::selectors::{KsArgDesc, KsOp};

/// Compiles one `match_args` clause against the attachment's declared
/// argument list. Equality sets past the inline capacity are lowered to a
/// membership table and the descriptor's operator becomes the table lookup;
/// string sets never take that path because tables hold integers only, and
/// negated sets never do because a table lookup means membership.
pub(crate) fn compile_arg(
    sel: &ArgSelector,
    args: &[ArgSpec],
    tables: &mut Vec<TableSpec>,
) -> Result<KsArgDesc, KsError> {
    let spec = args
        .iter()
        .find(|a| a.index == sel.index)
        .ok_or(KsError::InvalidAttribute {
            attribute: "index",
            value: sel.index.to_string(),
        })?;
    let vtype = spec.parsed_type()?;

    let op = ops::resolve(&sel.operator)?;
    if !ops::supports(op, vtype) {
        return Err(KsError::TypeMismatch {
            operator: sel.operator.clone(),
            arg_type: spec.arg_type.clone(),
        });
    }
    if sel.values.is_empty() {
        return Err(KsError::MissingAttribute("values".to_string()));
    }
    match ops::arity(op) {
        Arity::Single if sel.values.len() != 1 => {
            return Err(KsError::InvalidAttribute {
                attribute: "values",
                value: format!("{} takes exactly one value", sel.operator),
            });
        }
        Arity::Pair if sel.values.len() != 2 => {
            return Err(KsError::InvalidAttribute {
                attribute: "values",
                value: format!("{} takes a low and a high bound", sel.operator),
            });
        }
        _ => {}
    }

    let mut desc = KsArgDesc::zeroed();
    desc.index = sel.index;
    desc.vtype = vtype;

    if ops::needs_table(op, sel.values.len()) {
        if vtype.is_string() {
            return Err(KsError::ArrayLimitReached {
                attribute: "string values",
                limit: kestrel_common::VALUES_INLINE_MAX,
            });
        }
        let mut raw = Vec::with_capacity(sel.values.len());
        for v in &sel.values {
            raw.push(encode_value(op, vtype, v)?.int);
        }
        let entries = entries_from(raw);
        desc.op = KsOp::InTable;
        desc.value_count = entries.len() as u32;
        desc.table_id = intern(tables, TableSpec::new(TableKind::Arg, sel.index, entries))?;
        return Ok(desc);
    }

    // Everything else stays inline; past the inline capacity there is no
    // faithful lowering (a table means membership), so the set is rejected.
    if sel.values.len() > kestrel_common::VALUES_INLINE_MAX {
        return Err(KsError::ArrayLimitReached {
            attribute: "values",
            limit: kestrel_common::VALUES_INLINE_MAX,
        });
    }

    desc.op = op;
    desc.value_count = sel.values.len() as u32;
    for (i, v) in sel.values.iter().enumerate() {
        desc.values[i] = encode_value(op, vtype, v)?;
    }
    if matches!(op, KsOp::Range) && desc.values[0].int > desc.values[1].int {
        return Err(KsError::InvalidAttribute {
            attribute: "values",
            value: format!(
                "range bounds out of order: {} > {}",
                desc.values[0].int, desc.values[1].int
            ),
        });
    }

    Ok(desc)
}
