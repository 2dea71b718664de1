//! Uniform remote-command interface to observatory actors.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DeviceError;

/// Typed wrappers per device kind.
pub mod wrappers;

/// In-memory observatory and scripted collaborators.
pub mod sim;

/// Ordered command arguments.
pub type Args = IndexMap<String, Value>;

/// Builds an [`Args`] map from key/value pairs.
#[must_use]
pub fn args<const N: usize>(pairs: [(&str, Value); N]) -> Args {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Successful reply of a remote device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceReply {
    /// Reply payload.
    pub payload: Map<String, Value>,
}

impl DeviceReply {
    /// Empty reply.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reply carrying the fields of a JSON object.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(payload) => Self { payload },
            _ => Self::default(),
        }
    }

    /// Boolean field.
    #[must_use]
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    /// String field.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Remote device invocation.
///
/// Implementations report device-side failures as [`DeviceError::Failed`];
/// [`DeviceClient`] enforces the timeout.
#[async_trait]
pub trait DeviceFacade: Send + Sync + fmt::Debug {
    /// Invokes `command` on `device`.
    async fn invoke(
        &self,
        device: &str,
        command: &str,
        args: Args,
        timeout: Duration,
    ) -> Result<DeviceReply, DeviceError>;
}

/// Facade wrapper that enforces timeouts and logs every call.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    facade: Arc<dyn DeviceFacade>,
    default_timeout: Duration,
}

impl DeviceClient {
    /// Creates a client.
    #[must_use]
    pub fn new(facade: Arc<dyn DeviceFacade>, default_timeout: Duration) -> Self {
        Self {
            facade,
            default_timeout,
        }
    }

    /// Default command timeout.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Invokes a command with the default timeout.
    pub async fn call(
        &self,
        device: &str,
        command: &str,
        args: Args,
    ) -> Result<DeviceReply, DeviceError> {
        self.call_with_timeout(device, command, args, self.default_timeout)
            .await
    }

    /// Invokes a command, turning an expired timeout into [`DeviceError::Timeout`].
    pub async fn call_with_timeout(
        &self,
        device: &str,
        command: &str,
        args: Args,
        timeout: Duration,
    ) -> Result<DeviceReply, DeviceError> {
        tracing::debug!(device, command, ?args, "device command");
        let result = tokio::time::timeout(
            timeout,
            self.facade.invoke(device, command, args, timeout),
        )
        .await;
        match result {
            Ok(reply) => reply,
            Err(_) => Err(DeviceError::Timeout {
                device: device.to_string(),
                command: command.to_string(),
                after: timeout,
            }),
        }
    }

    /// Liveness ping.
    pub async fn ping(&self, device: &str) -> Result<(), DeviceError> {
        self.call(device, "ping", Args::new()).await.map(|_| ())
    }

    /// Re-establishes the connection between the actor and its hardware.
    pub async fn reconnect(&self, device: &str) -> Result<(), DeviceError> {
        self.call(device, "reconnect", Args::new()).await.map(|_| ())
    }

    /// Resets the device controller.
    pub async fn reset(&self, device: &str) -> Result<(), DeviceError> {
        self.call(device, "reset", Args::new()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Silent;

    #[async_trait]
    impl DeviceFacade for Silent {
        async fn invoke(
            &self,
            _device: &str,
            _command: &str,
            _args: Args,
            _timeout: Duration,
        ) -> Result<DeviceReply, DeviceError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_command_times_out() {
        let client = DeviceClient::new(Arc::new(Silent), Duration::from_secs(3));
        let err = client.ping("lvm.sci.pwi").await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { after, .. } if after == Duration::from_secs(3)));
    }

    #[test]
    fn reply_fields() {
        let reply = DeviceReply::from_value(json!({ "dome": "closed", "local": false }));
        assert_eq!(reply.str_field("dome"), Some("closed"));
        assert_eq!(reply.bool_field("local"), Some(false));
        assert_eq!(args([("force", json!(true))])["force"], json!(true));
    }
}
