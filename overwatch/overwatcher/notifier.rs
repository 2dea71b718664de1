//! Operator notification channel with duplicate suppression.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use shared_event_bus::EventKind;
use shared_logging::LogLevel;
use tokio::time::Instant;

use crate::telemetry::OverwatcherTelemetry;

/// A notification that was actually emitted.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Key used for duplicate suppression.
    pub dedupe_key: String,
    /// Emission time.
    pub sent_at: DateTime<Utc>,
}

/// Emits operator notifications, suppressing repeats of the same key within a
/// cooldown window.
#[derive(Debug, Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

#[derive(Debug)]
struct NotifierInner {
    telemetry: OverwatcherTelemetry,
    default_cooldown: Mutex<Duration>,
    last_sent: Mutex<IndexMap<String, Instant>>,
    history: Mutex<Vec<Notification>>,
}

impl Notifier {
    /// Creates a notifier.
    #[must_use]
    pub fn new(telemetry: OverwatcherTelemetry, default_cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                telemetry,
                default_cooldown: Mutex::new(default_cooldown),
                last_sent: Mutex::new(IndexMap::new()),
                history: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Updates the cooldown used when a caller does not pass one.
    pub fn set_default_cooldown(&self, cooldown: Duration) {
        *self.inner.default_cooldown.lock() = cooldown;
    }

    /// Sends a notification unless the same `dedupe_key` was sent within
    /// `cooldown`. Returns whether it was sent.
    pub fn notify(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        dedupe_key: impl Into<String>,
        cooldown: Option<Duration>,
    ) -> bool {
        let message = message.into();
        let dedupe_key = dedupe_key.into();
        let cooldown = cooldown.unwrap_or_else(|| *self.inner.default_cooldown.lock());
        let now = Instant::now();
        {
            let mut last_sent = self.inner.last_sent.lock();
            if let Some(previous) = last_sent.get(&dedupe_key) {
                if now.duration_since(*previous) < cooldown {
                    tracing::debug!(%dedupe_key, "notification suppressed");
                    return false;
                }
            }
            last_sent.insert(dedupe_key.clone(), now);
        }
        let notification = Notification {
            level,
            message,
            dedupe_key,
            sent_at: Utc::now(),
        };
        let payload = json!({
            "level": notification.level,
            "message": notification.message,
            "dedupe_key": notification.dedupe_key,
        });
        let _ = self
            .inner
            .telemetry
            .log(level, "notification", payload.clone());
        let _ = self.inner.telemetry.event(EventKind::Notification, payload);
        self.inner.history.lock().push(notification);
        true
    }

    /// Notifications emitted so far.
    #[must_use]
    pub fn history(&self) -> Vec<Notification> {
        self.inner.history.lock().clone()
    }

    /// Number of emitted notifications whose key starts with `prefix`.
    #[must_use]
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|n| n.dedupe_key.starts_with(prefix))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn suppresses_duplicates_within_cooldown() {
        let notifier = Notifier::new(
            OverwatcherTelemetry::disabled("notifier"),
            Duration::from_secs(60),
        );
        assert!(notifier.notify(LogLevel::Critical, "rain", "alert:rain", None));
        assert!(!notifier.notify(LogLevel::Critical, "rain", "alert:rain", None));
        assert!(notifier.notify(LogLevel::Warn, "door", "alert:door", None));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(notifier.notify(LogLevel::Critical, "rain", "alert:rain", None));
        assert_eq!(notifier.count_with_prefix("alert:rain"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cooldown_overrides_default() {
        let notifier = Notifier::new(
            OverwatcherTelemetry::disabled("notifier"),
            Duration::from_secs(600),
        );
        let short = Some(Duration::from_secs(5));
        assert!(notifier.notify(LogLevel::Info, "tick", "loop", short));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(notifier.notify(LogLevel::Info, "tick", "loop", short));
    }
}
