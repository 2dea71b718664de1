use std::{fmt, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{args, Args, DeviceClient};
use crate::{config::DevicesConfig, errors::DeviceError};

/// Reported enclosure position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DomeStatus {
    /// Fully open.
    Open,
    /// Fully closed.
    Closed,
    /// Moving towards open.
    Opening,
    /// Moving towards closed.
    Closing,
    /// Position not known (stopped mid-way, fault, lost encoder).
    Unknown,
}

impl DomeStatus {
    /// Whether the enclosure is moving.
    #[must_use]
    pub const fn is_moving(self) -> bool {
        matches!(self, Self::Opening | Self::Closing)
    }

    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Closing => "closing",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a wire label; anything unrecognised is `Unknown`.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label {
            "open" => Self::Open,
            "closed" => Self::Closed,
            "opening" => Self::Opening,
            "closing" => Self::Closing,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reply of the enclosure controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclosureStatus {
    /// Dome position.
    pub dome: DomeStatus,
    /// Under local (manual) control.
    pub local: bool,
}

/// Enclosure controller.
#[derive(Debug, Clone)]
pub struct Enclosure {
    client: DeviceClient,
    id: String,
}

impl Enclosure {
    /// Wraps the enclosure actor `id`.
    #[must_use]
    pub fn new(client: DeviceClient, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
        }
    }

    /// Actor identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current position and control mode.
    pub async fn status(&self) -> Result<EnclosureStatus, DeviceError> {
        let reply = self.client.call(&self.id, "status", Args::new()).await?;
        let dome = reply
            .str_field("dome")
            .map(DomeStatus::from_label)
            .ok_or_else(|| DeviceError::InvalidReply {
                device: self.id.clone(),
                reason: "missing 'dome' field".into(),
            })?;
        Ok(EnclosureStatus {
            dome,
            local: reply.bool_field("local").unwrap_or(false),
        })
    }

    /// Opens the dome, waiting up to `timeout` for completion.
    pub async fn open(&self, timeout: Duration) -> Result<(), DeviceError> {
        self.client
            .call_with_timeout(&self.id, "open", Args::new(), timeout)
            .await
            .map(|_| ())
    }

    /// Closes the dome; `force` selects the overcurrent mode.
    pub async fn close(&self, force: bool, timeout: Duration) -> Result<(), DeviceError> {
        self.client
            .call_with_timeout(&self.id, "close", args([("force", json!(force))]), timeout)
            .await
            .map(|_| ())
    }

    /// Stops any motion.
    pub async fn stop(&self) -> Result<(), DeviceError> {
        self.client
            .call(&self.id, "stop", Args::new())
            .await
            .map(|_| ())
    }
}

/// The telescope mounts, commanded together.
#[derive(Debug, Clone)]
pub struct Telescopes {
    client: DeviceClient,
    ids: Vec<String>,
}

impl Telescopes {
    /// Wraps the given mount actors.
    #[must_use]
    pub const fn new(client: DeviceClient, ids: Vec<String>) -> Self {
        Self { client, ids }
    }

    /// Mount identifiers.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Parks every mount concurrently.
    pub async fn park_all(&self) -> Result<(), DeviceError> {
        let calls = self
            .ids
            .iter()
            .map(|id| self.client.call(id, "park", Args::new()));
        join_all(calls)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map(|_| ())
    }

    /// Whether every mount reports parked.
    pub async fn all_parked(&self) -> Result<bool, DeviceError> {
        let calls = self
            .ids
            .iter()
            .map(|id| self.client.call(id, "status", Args::new()));
        let replies = join_all(calls)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(replies
            .iter()
            .all(|reply| reply.bool_field("parked").unwrap_or(false)))
    }

    /// Pings every mount.
    pub async fn ping_all(&self) -> Result<(), DeviceError> {
        let calls = self.ids.iter().map(|id| self.client.ping(id));
        join_all(calls)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map(|_| ())
    }
}

/// Spectrograph controller.
#[derive(Debug, Clone)]
pub struct Spectrographs {
    client: DeviceClient,
    id: String,
}

impl Spectrographs {
    /// Wraps the spectrograph actor `id`.
    #[must_use]
    pub fn new(client: DeviceClient, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
        }
    }

    /// Actor identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Takes one exposure and waits for readout.
    pub async fn expose(&self, flavour: &str, exposure_time: f64) -> Result<(), DeviceError> {
        let timeout =
            crate::config::secs(exposure_time.max(0.0)) + self.client.default_timeout();
        self.client
            .call_with_timeout(
                &self.id,
                "expose",
                args([
                    ("flavour", json!(flavour)),
                    ("exposure_time", json!(exposure_time)),
                ]),
                timeout,
            )
            .await
            .map(|_| ())
    }

    /// Aborts any running exposure.
    pub async fn abort(&self) -> Result<(), DeviceError> {
        self.client
            .call(&self.id, "abort", Args::new())
            .await
            .map(|_| ())
    }

    /// Resets the controllers.
    pub async fn reset(&self) -> Result<(), DeviceError> {
        self.client.reset(&self.id).await
    }

    /// Liveness ping.
    pub async fn ping(&self) -> Result<(), DeviceError> {
        self.client.ping(&self.id).await
    }
}

/// Calibration lamp power switch.
#[derive(Debug, Clone)]
pub struct CalibrationLamps {
    client: DeviceClient,
    id: String,
}

impl CalibrationLamps {
    /// Wraps the lamp actor `id`.
    #[must_use]
    pub fn new(client: DeviceClient, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
        }
    }

    /// Powers a lamp on.
    pub async fn on(&self, lamp: &str) -> Result<(), DeviceError> {
        self.client
            .call(&self.id, "on", args([("lamp", json!(lamp))]))
            .await
            .map(|_| ())
    }

    /// Powers a lamp off.
    pub async fn off(&self, lamp: &str) -> Result<(), DeviceError> {
        self.client
            .call(&self.id, "off", args([("lamp", json!(lamp))]))
            .await
            .map(|_| ())
    }

    /// Powers every lamp off.
    pub async fn all_off(&self) -> Result<(), DeviceError> {
        self.client
            .call(&self.id, "all_off", Args::new())
            .await
            .map(|_| ())
    }
}

/// Fibre selector mechanism.
#[derive(Debug, Clone)]
pub struct FibreSelector {
    client: DeviceClient,
    id: String,
}

impl FibreSelector {
    /// Wraps the fibre selector actor `id`.
    #[must_use]
    pub fn new(client: DeviceClient, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
        }
    }

    /// Moves to a named position.
    pub async fn move_to(&self, position: &str) -> Result<(), DeviceError> {
        self.client
            .call(&self.id, "move", args([("position", json!(position))]))
            .await
            .map(|_| ())
    }
}

/// Guider actors.
#[derive(Debug, Clone)]
pub struct Guiders {
    client: DeviceClient,
    ids: Vec<String>,
}

impl Guiders {
    /// Wraps the given guider actors.
    #[must_use]
    pub const fn new(client: DeviceClient, ids: Vec<String>) -> Self {
        Self { client, ids }
    }

    /// Stops guiding on every telescope.
    pub async fn stop_all(&self) -> Result<(), DeviceError> {
        let calls = self
            .ids
            .iter()
            .map(|id| self.client.call(id, "stop", Args::new()));
        join_all(calls)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map(|_| ())
    }

    /// Reconnects every guider.
    pub async fn reconnect_all(&self) -> Result<(), DeviceError> {
        let calls = self.ids.iter().map(|id| self.client.reconnect(id));
        join_all(calls)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map(|_| ())
    }
}

/// Networked power switch.
#[derive(Debug, Clone)]
pub struct PowerSwitch {
    client: DeviceClient,
    id: String,
}

impl PowerSwitch {
    /// Wraps the power switch actor `id`.
    #[must_use]
    pub fn new(client: DeviceClient, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
        }
    }

    /// Turns an outlet off and on again.
    pub async fn cycle(&self, outlet: &str) -> Result<(), DeviceError> {
        self.client
            .call(&self.id, "cycle", args([("outlet", json!(outlet))]))
            .await
            .map(|_| ())
    }
}

/// Heartbeat service.
#[derive(Debug, Clone)]
pub struct HeartbeatChannel {
    client: DeviceClient,
    id: String,
}

impl HeartbeatChannel {
    /// Wraps the heartbeat actor `id`.
    #[must_use]
    pub fn new(client: DeviceClient, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
        }
    }

    /// Publishes one beat for `component`.
    pub async fn beat(&self, component: &str) -> Result<(), DeviceError> {
        self.client
            .call(&self.id, "set", args([("component", json!(component))]))
            .await
            .map(|_| ())
    }
}

/// Every device the overwatcher commands.
#[derive(Debug, Clone)]
pub struct Devices {
    /// Raw client for generic commands.
    pub client: DeviceClient,
    /// Enclosure.
    pub enclosure: Enclosure,
    /// Telescope mounts.
    pub telescopes: Telescopes,
    /// Guiders.
    pub guiders: Guiders,
    /// Spectrographs.
    pub spectrographs: Spectrographs,
    /// Calibration lamps.
    pub lamps: CalibrationLamps,
    /// Fibre selector.
    pub fibre_selector: FibreSelector,
    /// Power switch.
    pub power: PowerSwitch,
    /// Heartbeat service.
    pub heartbeat: HeartbeatChannel,
}

impl Devices {
    /// Builds the wrappers for the configured actor identifiers.
    #[must_use]
    pub fn new(client: DeviceClient, config: &DevicesConfig) -> Self {
        Self {
            enclosure: Enclosure::new(client.clone(), &config.enclosure),
            telescopes: Telescopes::new(client.clone(), config.telescopes.clone()),
            guiders: Guiders::new(client.clone(), config.guiders.clone()),
            spectrographs: Spectrographs::new(client.clone(), &config.spectrographs),
            lamps: CalibrationLamps::new(client.clone(), &config.calibration_lamps),
            fibre_selector: FibreSelector::new(client.clone(), &config.fibre_selector),
            power: PowerSwitch::new(client.clone(), &config.power_switch),
            heartbeat: HeartbeatChannel::new(client.clone(), &config.heartbeat),
            client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimulatedObservatory;
    use std::sync::Arc;

    fn devices(sim: &Arc<SimulatedObservatory>) -> Devices {
        let config = DevicesConfig::default();
        let client = DeviceClient::new(sim.clone(), Duration::from_secs(5));
        Devices::new(client, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn park_all_reaches_every_mount() {
        let sim = Arc::new(SimulatedObservatory::new(&DevicesConfig::default()));
        let devices = devices(&sim);
        assert!(!devices.telescopes.all_parked().await.unwrap());
        devices.telescopes.park_all().await.unwrap();
        assert!(devices.telescopes.all_parked().await.unwrap());
        assert_eq!(sim.count("lvm.sci.pwi", "park"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enclosure_reports_status_and_local_mode() {
        let sim = Arc::new(SimulatedObservatory::new(&DevicesConfig::default()));
        sim.set_local(true);
        let status = devices(&sim).enclosure.status().await.unwrap();
        assert_eq!(status.dome, DomeStatus::Closed);
        assert!(status.local);
        assert_eq!(DomeStatus::from_label("jammed"), DomeStatus::Unknown);
    }
}
