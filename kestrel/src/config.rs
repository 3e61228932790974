use crate::errors::KsError;
use config::{Config, File, FileFormat};

#[derive(Debug, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub(crate) struct KsLogEntry {
    pub enable: bool,
    pub target: String,
    pub directory: Option<String>,
    pub prefix: Option<String>,
    pub rotation: Option<String>,
    pub max_files: Option<usize>,
    pub format: Option<String>,
}

#[derive(Debug, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub(crate) struct KsLogsConfig {
    pub default: KsLogEntry,
    pub errors: Option<KsLogEntry>,
    pub events: Option<KsLogEntry>,
    pub alerts: Option<KsLogEntry>,
}

#[derive(Debug, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub(crate) struct KsFeatures {
    pub tracepoints: bool,
    pub kprobes: bool,
}

#[derive(Debug, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub(crate) struct KsLimits {
    pub max_tracked: u64,
    pub channel_depth: usize,
}

#[derive(Debug, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub(crate) struct KsBpfConfig {
    pub object_path: String,
}

#[derive(Debug, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub(crate) struct KestrelConfig {
    pub features: KsFeatures,
    pub limits: KsLimits,
    pub bpf: KsBpfConfig,
    pub logs: KsLogsConfig,
}

pub(crate) fn load_config(config_dir: &str) -> Result<KestrelConfig, anyhow::Error> {
    let mut dir = config_dir.to_string();
    if !dir.ends_with('/') {
        dir.push('/');
    }

    let config = Config::builder()
        .add_source(File::new(&format!("{}config.json5", dir), FileFormat::Json5))
        .build()?;

    let conf: KestrelConfig = config
        .try_deserialize()
        .map_err(|e| KsError::Deserialize(e.to_string()))?;

    Ok(conf)
}
