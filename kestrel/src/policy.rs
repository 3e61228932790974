use crate::errors::KsError;
use config::{Config, File, FileFormat};
use kestrel_common::selectors::{KsArgType, KsVar};
use kestrel_common::{ARGS_PER_SELECTOR, SELECTORS_MAX};
use serde_json::Value;

/// Top level declarative policy: a named set of tracepoint and kprobe
/// attachment specs. Immutable once compiled; a reload replaces it
/// wholesale.
#[derive(Debug, Clone, PartialEq, serde_derive::Deserialize)]
pub(crate) struct TracingPolicy {
    pub name: String,
    #[serde(default)]
    pub tracepoints: Vec<TracepointSpec>,
    #[serde(default)]
    pub kprobes: Vec<KprobeSpec>,
}

#[derive(Debug, Clone, PartialEq, serde_derive::Deserialize)]
pub(crate) struct TracepointSpec {
    pub category: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub selectors: Vec<SelectorSpec>,
}

#[derive(Debug, Clone, PartialEq, serde_derive::Deserialize)]
pub(crate) struct KprobeSpec {
    pub call: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub selectors: Vec<SelectorSpec>,
}

#[derive(Debug, Clone, PartialEq, serde_derive::Deserialize)]
pub(crate) struct ArgSpec {
    pub index: u32,
    #[serde(rename = "type")]
    pub arg_type: String,
}

impl ArgSpec {
    pub(crate) fn parsed_type(&self) -> Result<KsArgType, KsError> {
        let mut s = self.arg_type.clone();
        let vtype = KsArgType::from_str(s.as_mut_str());
        if vtype.is_undefined() {
            return Err(KsError::InvalidAttribute {
                attribute: "type",
                value: self.arg_type.clone(),
            });
        }
        Ok(vtype)
    }
}

/// One alternative match rule. Selectors in a list are OR-ed; within one
/// selector the PID condition (if any) and every argument condition must
/// all hold.
#[derive(Debug, Clone, PartialEq, serde_derive::Deserialize)]
pub(crate) struct SelectorSpec {
    #[serde(default)]
    pub match_pid: Option<PidSelector>,
    #[serde(default)]
    pub match_args: Vec<ArgSelector>,
}

/// PID values are JSON numbers or the literal `"self"`, resolved against
/// the caller's identity context at compile time.
#[derive(Debug, Clone, PartialEq, serde_derive::Deserialize)]
pub(crate) struct PidSelector {
    pub operator: String,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub namespaced: bool,
    #[serde(default)]
    pub follow_forks: bool,
}

#[derive(Debug, Clone, PartialEq, serde_derive::Deserialize)]
pub(crate) struct ArgSelector {
    pub index: u32,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl TracingPolicy {
    /// Checks the structural invariants before anything is compiled:
    /// argument indices referenced by selectors must exist in the
    /// attachment's argument list, declared types must parse, and the
    /// per-attachment limits must hold.
    pub(crate) fn validate(&self) -> Result<(), KsError> {
        for tp in &self.tracepoints {
            validate_attachment(&tp.args, &tp.selectors)?;
        }
        for kp in &self.kprobes {
            validate_attachment(&kp.args, &kp.selectors)?;
        }
        Ok(())
    }
}

fn validate_attachment(args: &[ArgSpec], selectors: &[SelectorSpec]) -> Result<(), KsError> {
    if args.len() > ARGS_PER_SELECTOR {
        return Err(KsError::ArrayLimitReached {
            attribute: "args",
            limit: ARGS_PER_SELECTOR,
        });
    }
    if selectors.len() > SELECTORS_MAX {
        return Err(KsError::ArrayLimitReached {
            attribute: "selectors",
            limit: SELECTORS_MAX,
        });
    }
    for (i, arg) in args.iter().enumerate() {
        arg.parsed_type()?;
        if args[..i].iter().any(|a| a.index == arg.index) {
            return Err(KsError::InvalidAttribute {
                attribute: "index",
                value: format!("duplicate argument index {}", arg.index),
            });
        }
    }
    for sel in selectors {
        for m in &sel.match_args {
            if !args.iter().any(|a| a.index == m.index) {
                return Err(KsError::InvalidAttribute {
                    attribute: "index",
                    value: format!("selector references undeclared argument {}", m.index),
                });
            }
        }
    }
    Ok(())
}

pub(crate) fn load_policy(path: &str) -> Result<TracingPolicy, anyhow::Error> {
    let config = Config::builder()
        .add_source(File::new(path, FileFormat::Json5))
        .build()?;

    let policy: TracingPolicy = config
        .try_deserialize()
        .map_err(|e| KsError::Deserialize(e.to_string()))?;
    policy.validate()?;

    Ok(policy)
}
