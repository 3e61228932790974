use super::arg_filter::compile_arg;
use super::pid_filter::compile_pid;
use super::tables::TableSpec;
use crate::errors::KsError;
use crate::policy::{ArgSpec, SelectorSpec};
use crate::tracker::IdentityContext;
use kestrel_common::selectors::{KsSelector, KsSelectorBuffer};
use kestrel_common::{ARGS_PER_SELECTOR, SELECTORS_MAX};
use std::collections::HashSet;

/// Output of compiling one attachment's selector list: the packed record
/// blob plus the membership tables it references. Compilation is pure;
/// nothing here has touched the kernel yet.
#[derive(Debug)]
pub(crate) struct CompiledBlob {
    pub buffer: KsSelectorBuffer,
    pub tables: Vec<TableSpec>,
}

impl CompiledBlob {
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buffer.data[..self.buffer.len as usize]
    }

    pub(crate) fn table_ids(&self) -> HashSet<u32> {
        self.tables.iter().map(|t| t.id).collect()
    }
}

/// Compiles an ordered selector list into the blob form the kernel matcher
/// walks. An empty list compiles to a single match-all record, so an
/// attachment with no selectors still reports every event. The result is a
/// pure function of its inputs: equal lists yield byte-identical blobs.
pub(crate) fn compile_selectors(
    attachment: &str,
    selectors: &[SelectorSpec],
    args: &[ArgSpec],
    ident: &IdentityContext,
) -> Result<CompiledBlob, KsError> {
    if selectors.len() > SELECTORS_MAX {
        return Err(KsError::ArrayLimitReached {
            attribute: "selectors",
            limit: SELECTORS_MAX,
        });
    }

    let mut tables = Vec::new();
    let mut records = Vec::with_capacity(selectors.len().max(1));
    if selectors.is_empty() {
        records.push(KsSelector::empty());
    }
    for (i, sel) in selectors.iter().enumerate() {
        let rec = compile_one(sel, args, ident, &mut tables).map_err(|e| KsError::Selector {
            attachment: attachment.to_string(),
            selector: i,
            source: Box::new(e),
        })?;
        records.push(rec);
    }

    let mut buffer = KsSelectorBuffer::zeroed();
    let mut off = 0;
    for rec in &records {
        let bytes = rec.to_bytes();
        buffer.data[off..off + bytes.len()].copy_from_slice(bytes);
        off += bytes.len();
    }
    // The zero-tag sentinel is already there: the buffer is pre-zeroed.
    buffer.len = (off + 4) as u32;

    Ok(CompiledBlob { buffer, tables })
}

fn compile_one(
    sel: &SelectorSpec,
    args: &[ArgSpec],
    ident: &IdentityContext,
    tables: &mut Vec<TableSpec>,
) -> Result<KsSelector, KsError> {
    if sel.match_args.len() > ARGS_PER_SELECTOR {
        return Err(KsError::ArrayLimitReached {
            attribute: "match_args",
            limit: ARGS_PER_SELECTOR,
        });
    }

    let mut rec = KsSelector::empty();
    rec.pid = compile_pid(sel.match_pid.as_ref(), ident, tables)?;
    rec.arg_count = sel.match_args.len() as u32;
    for (i, m) in sel.match_args.iter().enumerate() {
        rec.args[i] = compile_arg(m, args, tables)?;
    }
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::selectors::{KsOp, KsSelectorWalker, KsVar};
    use serde_json::json;

    fn ident() -> IdentityContext {
        IdentityContext::for_test(1000, 1)
    }

    fn args() -> Vec<ArgSpec> {
        serde_json::from_value(json!([{ "index": 7, "type": "ulong" }])).unwrap()
    }

    fn selectors(v: serde_json::Value) -> Vec<SelectorSpec> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn equal_inputs_compile_to_identical_bytes() {
        let spec = json!([
            {
                "match_pid": { "operator": "in", "values": [42], "follow_forks": true },
                "match_args": [{ "index": 7, "operator": "eq", "values": [4443] }]
            },
            {
                "match_args": [{ "index": 7, "operator": "in_map", "values": [9, 3, 5, 3] }]
            }
        ]);
        let a = compile_selectors("tp", &selectors(spec.clone()), &args(), &ident()).unwrap();
        let b = compile_selectors("tp", &selectors(spec), &args(), &ident()).unwrap();

        assert_eq!(a.bytes(), b.bytes());
        assert_eq!(a.table_ids(), b.table_ids());
    }

    #[test]
    fn records_walk_back_in_order() {
        let spec = json!([
            { "match_args": [{ "index": 7, "operator": "eq", "values": [4443] }] },
            { "match_args": [{ "index": 7, "operator": "eq", "values": [9999] }] }
        ]);
        let blob = compile_selectors("tp", &selectors(spec), &args(), &ident()).unwrap();

        let recs: Vec<_> = KsSelectorWalker::new(blob.bytes()).collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].args[0].values[0].int, 4443);
        assert_eq!(recs[1].args[0].values[0].int, 9999);
        assert_eq!(
            blob.buffer.len as usize,
            2 * core::mem::size_of::<KsSelector>() + 4
        );
    }

    #[test]
    fn no_selectors_means_match_all() {
        let blob = compile_selectors("tp", &[], &args(), &ident()).unwrap();
        let recs: Vec<_> = KsSelectorWalker::new(blob.bytes()).collect();
        assert_eq!(recs.len(), 1);
        assert!(recs[0].pid.op.is_undefined());
        assert_eq!(recs[0].arg_count, 0);
        assert!(blob.tables.is_empty());
    }

    #[test]
    fn identical_filters_share_one_table() {
        let spec = json!([
            { "match_args": [{ "index": 7, "operator": "in_map", "values": [1, 2, 3] }] },
            { "match_args": [{ "index": 7, "operator": "in_map", "values": [3, 2, 1] }] }
        ]);
        let blob = compile_selectors("tp", &selectors(spec), &args(), &ident()).unwrap();

        assert_eq!(blob.tables.len(), 1);
        let recs: Vec<_> = KsSelectorWalker::new(blob.bytes()).collect();
        assert_eq!(recs[0].args[0].op, KsOp::InTable);
        assert_eq!(recs[0].args[0].table_id, recs[1].args[0].table_id);
    }

    #[test]
    fn errors_carry_attachment_and_selector_position() {
        let spec = json!([
            { "match_args": [{ "index": 7, "operator": "eq", "values": [1] }] },
            { "match_args": [{ "index": 7, "operator": "approx", "values": [1] }] }
        ]);
        let err =
            compile_selectors("syscalls/sys_enter_lseek", &selectors(spec), &args(), &ident())
                .unwrap_err();

        match err {
            KsError::Selector { attachment, selector, source } => {
                assert_eq!(attachment, "syscalls/sys_enter_lseek");
                assert_eq!(selector, 1);
                assert!(matches!(*source, KsError::UnknownOperator(_)));
            }
            other => panic!("expected Selector error, got {:?}", other),
        }
    }

    #[test]
    fn too_many_selectors_is_rejected() {
        let many: Vec<_> = (0..SELECTORS_MAX + 1)
            .map(|_| json!({ "match_args": [{ "index": 7, "operator": "eq", "values": [1] }] }))
            .collect();
        let err = compile_selectors("tp", &selectors(json!(many)), &args(), &ident()).unwrap_err();
        assert!(matches!(err, KsError::ArrayLimitReached { .. }));
    }
}
