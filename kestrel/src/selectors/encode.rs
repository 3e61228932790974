use crate::errors::KsError;
use kestrel_common::selectors::{KsArgType, KsOp, KsValue};
use kestrel_common::STR_VAL_LEN;
use serde_json::Value;

/// Encodes one policy literal into the fixed-width form the kernel matcher
/// compares against. Width and type violations are hard errors; a string is
/// never silently truncated.
pub(crate) fn encode_value(op: KsOp, vtype: KsArgType, src: &Value) -> Result<KsValue, KsError> {
    let mut out = KsValue::zeroed();

    match vtype {
        KsArgType::Int => {
            let v = int_literal(src)?;
            if v < i64::from(i32::MIN) || v > i64::from(i32::MAX) {
                return Err(KsError::Encoding {
                    attribute: "int width",
                    value: v.to_string(),
                });
            }
            out.int = v;
        }
        KsArgType::UInt => {
            let v = int_literal(src)?;
            if v < 0 || v > i64::from(u32::MAX) {
                return Err(KsError::Encoding {
                    attribute: "uint width",
                    value: v.to_string(),
                });
            }
            out.int = v;
        }
        KsArgType::Long => {
            out.int = int_literal(src)?;
        }
        KsArgType::ULong => {
            let v = match src.as_u64() {
                Some(v) => v,
                None => {
                    return Err(KsError::Encoding {
                        attribute: "ulong",
                        value: format!("{:?}", src),
                    });
                }
            };
            out.int = v as i64;
        }
        KsArgType::Str => {
            let s = match src.as_str() {
                Some(s) => s,
                None => {
                    return Err(KsError::Encoding {
                        attribute: "string",
                        value: format!("{:?}", src),
                    });
                }
            };
            if s.len() > STR_VAL_LEN {
                return Err(KsError::Encoding {
                    attribute: "string length",
                    value: format!("{} exceeds {} bytes", s.len(), STR_VAL_LEN),
                });
            }

            // Suffix values are stored reversed so the kernel side can run
            // the same bounded forward compare for both ends of the string.
            if matches!(op, KsOp::Postfix) {
                for (i, ch) in s.as_bytes().iter().rev().enumerate() {
                    out.sbuf[i] = *ch;
                }
            } else {
                out.sbuf[..s.len()].copy_from_slice(s.as_bytes());
            }
            out.sbuf_len = s.len() as u16;
        }
        KsArgType::Undefined => {
            return Err(KsError::Encoding {
                attribute: "type",
                value: "undefined argument type".to_string(),
            });
        }
    }

    Ok(out)
}

fn int_literal(src: &Value) -> Result<i64, KsError> {
    src.as_i64().ok_or(KsError::Encoding {
        attribute: "int",
        value: format!("{:?}", src),
    })
}
