use crate::config::{KestrelConfig, KsLogEntry};
use crate::errors::KsError;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt::{format, layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Holds the non-blocking writer guards for the lifetime of the process.
pub struct KsLogs {
    _guards: Vec<WorkerGuard>,
}

impl KsLogs {
    fn writer_for(entry: &KsLogEntry) -> Result<(NonBlocking, WorkerGuard), anyhow::Error> {
        match entry.target.as_str() {
            "stderr" => Ok(tracing_appender::non_blocking(std::io::stderr())),
            "stdout" => Ok(tracing_appender::non_blocking(std::io::stdout())),
            "file" => {
                let directory = entry
                    .directory
                    .as_deref()
                    .ok_or_else(|| KsError::MissingAttribute("directory".to_string()))?;
                let prefix = entry
                    .prefix
                    .as_deref()
                    .ok_or_else(|| KsError::MissingAttribute("prefix".to_string()))?;

                let s_rotation = entry.rotation.as_deref().unwrap_or("daily");
                let rotation = match s_rotation.trim().to_ascii_lowercase().as_str() {
                    "hourly" => rolling::Rotation::HOURLY,
                    "daily" => rolling::Rotation::DAILY,
                    "never" => rolling::Rotation::NEVER,
                    _ => {
                        return Err(KsError::InvalidAttribute {
                            attribute: "rotation",
                            value: s_rotation.to_string(),
                        }
                        .into());
                    }
                };

                let appender = rolling::RollingFileAppender::builder()
                    .rotation(rotation)
                    .filename_prefix(prefix)
                    .max_log_files(entry.max_files.unwrap_or(5))
                    .build(directory)?;
                Ok(tracing_appender::non_blocking(appender))
            }
            _ => Err(KsError::InvalidAttribute {
                attribute: "log target",
                value: entry.target.to_string(),
            }
            .into()),
        }
    }

    fn fmt_layer(w: NonBlocking, fmt: Option<&String>) -> BoxedLayer {
        let s_format = fmt.map(|f| f.trim().to_ascii_lowercase());
        let base = layer().with_writer(w);
        match s_format.as_deref() {
            Some("compact") => base
                .event_format(format().with_target(true).with_level(false).compact())
                .boxed(),
            Some("pretty") => base
                .event_format(format().with_target(true).with_level(false).pretty())
                .boxed(),
            Some("json") => base
                .event_format(
                    format()
                        .with_target(true)
                        .with_level(false)
                        .json()
                        .flatten_event(true),
                )
                .boxed(),
            _ => base
                .event_format(format().with_target(true).with_level(false))
                .boxed(),
        }
    }

    pub fn new(config: &KestrelConfig) -> Result<KsLogs, anyhow::Error> {
        let logs_conf = &config.logs;

        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guards = Vec::new();

        if logs_conf.default.enable {
            let (w, guard) = KsLogs::writer_for(&logs_conf.default)?;
            guards.push(guard);

            // Targets with dedicated sinks are excluded from the default one.
            let mut reserved = Vec::new();
            if logs_conf.errors.is_some() {
                reserved.push("error");
            }
            if logs_conf.events.is_some() {
                reserved.push("event");
            }
            if logs_conf.alerts.is_some() {
                reserved.push("alert");
            }

            let f = filter::filter_fn(move |metadata| !reserved.contains(&metadata.target()));
            layers.push(
                KsLogs::fmt_layer(w, logs_conf.default.format.as_ref())
                    .with_filter(f)
                    .boxed(),
            );
        }

        for (entry, target) in [
            (&logs_conf.errors, "error"),
            (&logs_conf.events, "event"),
            (&logs_conf.alerts, "alert"),
        ] {
            if let Some(e) = entry {
                if e.enable {
                    let (w, guard) = KsLogs::writer_for(e)?;
                    guards.push(guard);

                    let f = filter::filter_fn(move |metadata| metadata.target() == target);
                    layers.push(KsLogs::fmt_layer(w, e.format.as_ref()).with_filter(f).boxed());
                }
            }
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(EnvFilter::from_default_env())
            .init();

        Ok(KsLogs { _guards: guards })
    }
}
