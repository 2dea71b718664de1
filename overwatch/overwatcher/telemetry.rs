use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventKind, EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord, NightlyJsonLogger};
use tokio::runtime::Handle;

use crate::module::NightId;

const NO_NIGHT: i64 = i64::MIN;

/// Builder for overwatcher telemetry sinks.
pub struct OverwatcherTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    nightly: Option<(PathBuf, String)>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl OverwatcherTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            nightly: None,
            event_publisher: None,
        }
    }

    /// Sets a single log file.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Writes one log file per observing night under `dir`.
    #[must_use]
    pub fn nightly_logs(mut self, dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.nightly = Some((dir.into(), prefix.into()));
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<OverwatcherTelemetry> {
        let logger = self.log_path.map(JsonLogger::new).transpose()?;
        let nightly = self
            .nightly
            .map(|(dir, prefix)| NightlyJsonLogger::new(dir, prefix))
            .transpose()?;
        Ok(OverwatcherTelemetry {
            module: Arc::from(self.module.as_str()),
            sinks: Arc::new(Sinks {
                logger,
                nightly,
                publisher: self.event_publisher,
                night: AtomicI64::new(NO_NIGHT),
            }),
        })
    }
}

/// Telemetry handle shared across overwatcher components.
///
/// Handles are cheap to clone; [`OverwatcherTelemetry::scoped`] derives a
/// handle for another component that writes to the same sinks.
#[derive(Clone)]
pub struct OverwatcherTelemetry {
    module: Arc<str>,
    sinks: Arc<Sinks>,
}

impl fmt::Debug for OverwatcherTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverwatcherTelemetry")
            .field("module", &self.module)
            .finish()
    }
}

struct Sinks {
    logger: Option<JsonLogger>,
    nightly: Option<NightlyJsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
    night: AtomicI64,
}

impl OverwatcherTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> OverwatcherTelemetryBuilder {
        OverwatcherTelemetryBuilder::new(module)
    }

    /// Handle that only forwards to `tracing`.
    #[must_use]
    pub fn disabled(module: impl Into<String>) -> Self {
        Self {
            module: Arc::from(module.into().as_str()),
            sinks: Arc::new(Sinks {
                logger: None,
                nightly: None,
                publisher: None,
                night: AtomicI64::new(NO_NIGHT),
            }),
        }
    }

    /// Handle for another component sharing these sinks.
    #[must_use]
    pub fn scoped(&self, module: &str) -> Self {
        Self {
            module: Arc::from(module),
            sinks: Arc::clone(&self.sinks),
        }
    }

    /// Component name.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Sets the observing night used to key nightly logs.
    pub fn set_night(&self, night: NightId) {
        self.sinks.night.store(night.0, Ordering::Relaxed);
    }

    fn night(&self) -> Option<i64> {
        let night = self.sinks.night.load(Ordering::Relaxed);
        (night != NO_NIGHT).then_some(night)
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let module = &*self.module;
        match level {
            LogLevel::Debug => tracing::debug!(module, %metadata, "{message}"),
            LogLevel::Info => tracing::info!(module, %metadata, "{message}"),
            LogLevel::Warn => tracing::warn!(module, %metadata, "{message}"),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(module, %metadata, "{message}");
            }
        }
        if self.sinks.logger.is_none() && self.sinks.nightly.is_none() {
            return Ok(());
        }
        let mut record = LogRecord::new(module, level, message);
        if let Some(obj) = metadata.as_object() {
            record.metadata = obj.clone();
        }
        let night = self.night();
        if let Some(night) = night {
            record = record.with_night(night);
        }
        if let Some(logger) = &self.sinks.logger {
            logger.log(&record)?;
        }
        if let (Some(nightly), Some(night)) = (&self.sinks.nightly, night) {
            nightly.log(night, &record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, kind: EventKind, payload: Value) -> Result<()> {
        let Some(publisher) = &self.sinks.publisher else {
            return Ok(());
        };
        let record = EventRecord::new(&*self.module, kind, payload);
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!(?err, "telemetry event publish failed");
                }
            });
            Ok(())
        } else {
            futures::executor::block_on(publisher.publish(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("overwatcher.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = OverwatcherTelemetry::builder("dome")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "dome.close.start", json!({ "requestor": "safety" }))
            .unwrap();
        telemetry
            .event(EventKind::DomeClosed, json!({ "forced": false }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("dome.close.start"));
        assert_eq!(bus.of_kind(EventKind::DomeClosed).len(), 1);
    }

    #[test]
    fn nightly_logs_follow_the_night() {
        let tmp = tempdir().unwrap();
        let telemetry = OverwatcherTelemetry::builder("overwatcher")
            .nightly_logs(tmp.path(), "overwatcher")
            .build()
            .unwrap();
        let safety = telemetry.scoped("safety");
        telemetry.set_night(NightId(60_400));
        safety
            .log(LogLevel::Warn, "safety.alert.raised", json!({ "kind": "rain" }))
            .unwrap();
        telemetry.set_night(NightId(60_401));
        telemetry
            .log(LogLevel::Info, "overwatcher.tick", json!({}))
            .unwrap();
        assert!(tmp.path().join("overwatcher-60400.log.jsonl").exists());
        assert!(tmp.path().join("overwatcher-60401.log.jsonl").exists());
    }
}
