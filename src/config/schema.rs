use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collab::{BackoffPolicy, LinkSettings, MIN_INTERVAL, ManagerConfig};
use crate::core::{Limits, NodeAddress};

use super::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub limits: Limits,
    pub collab: CollabConfig,
}

impl Config {
    /// Resolve the collaboration settings into what the manager consumes.
    pub fn manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        self.collab.manager_config(&self.limits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Tree,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(7),
            retention_max_files: Some(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub listen_addr: String,
    pub advertise_addr: Option<String>,
    pub server_name: String,
    pub peers: Vec<String>,
    pub check_interval_ms: u64,
    pub status_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub connect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub linger_ms: u64,
    pub startup_sync_timeout_ms: u64,
    pub isolation_alert_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7400".to_string(),
            advertise_addr: None,
            server_name: "qcollab".to_string(),
            peers: Vec::new(),
            check_interval_ms: 1_000,
            status_interval_ms: 5_000,
            connect_timeout_ms: 5_000,
            connect_attempts: 3,
            max_reconnect_attempts: 5,
            reconnect_backoff_base_ms: 500,
            reconnect_backoff_max_ms: 30_000,
            linger_ms: 30_000,
            startup_sync_timeout_ms: 30 * 60 * 1_000,
            isolation_alert_ms: 5 * 60 * 1_000,
        }
    }
}

impl CollabConfig {
    pub fn startup_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_sync_timeout_ms)
    }

    pub fn peer_addresses(&self) -> Result<Vec<NodeAddress>, ConfigError> {
        self.peers
            .iter()
            .map(|raw| parse_address("collab.peers", raw))
            .collect()
    }

    pub fn manager_config(&self, limits: &Limits) -> Result<ManagerConfig, ConfigError> {
        for (field, value) in [
            ("collab.check_interval_ms", self.check_interval_ms),
            ("collab.status_interval_ms", self.status_interval_ms),
        ] {
            if Duration::from_millis(value) <= MIN_INTERVAL {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("must exceed {}ms", MIN_INTERVAL.as_millis()),
                });
            }
        }
        if self.server_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "collab.server_name",
                reason: "empty".into(),
            });
        }
        if self.reconnect_backoff_base_ms > self.reconnect_backoff_max_ms {
            return Err(ConfigError::Invalid {
                field: "collab.reconnect_backoff_base_ms",
                reason: "exceeds reconnect_backoff_max_ms".into(),
            });
        }
        let advertise_addr = self
            .advertise_addr
            .as_deref()
            .map(|raw| parse_address("collab.advertise_addr", raw))
            .transpose()?;

        Ok(ManagerConfig {
            listen_addr: self.listen_addr.clone(),
            advertise_addr,
            server_name: self.server_name.clone(),
            peers: self.peer_addresses()?,
            check_interval: Duration::from_millis(self.check_interval_ms),
            status_interval: Duration::from_millis(self.status_interval_ms),
            isolation_alert: Duration::from_millis(self.isolation_alert_ms),
            link: LinkSettings {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                connect_attempts: self.connect_attempts.max(1),
                max_reconnect_attempts: self.max_reconnect_attempts,
                reconnect_backoff: BackoffPolicy {
                    base: Duration::from_millis(self.reconnect_backoff_base_ms),
                    max: Duration::from_millis(self.reconnect_backoff_max_ms),
                },
                linger: Duration::from_millis(self.linger_ms),
                limits: limits.clone(),
            },
        })
    }
}

fn parse_address(field: &'static str, raw: &str) -> Result<NodeAddress, ConfigError> {
    NodeAddress::parse(raw).map_err(|err| ConfigError::Invalid {
        field,
        reason: err.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub file: Option<FileLoggingConfigOverride>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = self.filter.as_ref() {
            target.filter = Some(filter.clone());
        }
        if let Some(file) = self.file.as_ref() {
            file.apply_to(&mut target.file);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfigOverride {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub format: Option<LogFormat>,
    pub rotation: Option<LogRotation>,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl FileLoggingConfigOverride {
    pub fn apply_to(&self, target: &mut FileLoggingConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(dir) = self.dir.as_ref() {
            target.dir = Some(dir.clone());
        }
        if let Some(format) = self.format {
            target.format = format;
        }
        if let Some(rotation) = self.rotation {
            target.rotation = rotation;
        }
        if let Some(days) = self.retention_max_age_days {
            target.retention_max_age_days = Some(days);
        }
        if let Some(files) = self.retention_max_files {
            target.retention_max_files = Some(files);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LimitsOverride {
    pub max_frame_bytes: Option<usize>,
    pub max_transfer_payload_bytes: Option<usize>,
    pub max_sync_payload_bytes: Option<usize>,
    pub max_cbor_depth: Option<usize>,
    pub max_cbor_map_entries: Option<usize>,
    pub max_cbor_array_entries: Option<usize>,
    pub max_cbor_bytes_string_len: Option<usize>,
    pub max_cbor_text_string_len: Option<usize>,
}

impl LimitsOverride {
    pub fn apply_to(&self, limits: &mut Limits) {
        if let Some(value) = self.max_frame_bytes {
            limits.max_frame_bytes = value;
        }
        if let Some(value) = self.max_transfer_payload_bytes {
            limits.max_transfer_payload_bytes = value;
        }
        if let Some(value) = self.max_sync_payload_bytes {
            limits.max_sync_payload_bytes = value;
        }
        if let Some(value) = self.max_cbor_depth {
            limits.max_cbor_depth = value;
        }
        if let Some(value) = self.max_cbor_map_entries {
            limits.max_cbor_map_entries = value;
        }
        if let Some(value) = self.max_cbor_array_entries {
            limits.max_cbor_array_entries = value;
        }
        if let Some(value) = self.max_cbor_bytes_string_len {
            limits.max_cbor_bytes_string_len = value;
        }
        if let Some(value) = self.max_cbor_text_string_len {
            limits.max_cbor_text_string_len = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CollabConfigOverride {
    pub listen_addr: Option<String>,
    pub advertise_addr: Option<String>,
    pub server_name: Option<String>,
    pub peers: Option<Vec<String>>,
    pub check_interval_ms: Option<u64>,
    pub status_interval_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub connect_attempts: Option<u32>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_backoff_base_ms: Option<u64>,
    pub reconnect_backoff_max_ms: Option<u64>,
    pub linger_ms: Option<u64>,
    pub startup_sync_timeout_ms: Option<u64>,
    pub isolation_alert_ms: Option<u64>,
}

impl CollabConfigOverride {
    pub fn apply_to(&self, target: &mut CollabConfig) {
        if let Some(addr) = self.listen_addr.as_ref() {
            target.listen_addr = addr.clone();
        }
        if let Some(addr) = self.advertise_addr.as_ref() {
            target.advertise_addr = Some(addr.clone());
        }
        if let Some(name) = self.server_name.as_ref() {
            target.server_name = name.clone();
        }
        if let Some(peers) = self.peers.as_ref() {
            target.peers = peers.clone();
        }
        if let Some(value) = self.check_interval_ms {
            target.check_interval_ms = value;
        }
        if let Some(value) = self.status_interval_ms {
            target.status_interval_ms = value;
        }
        if let Some(value) = self.connect_timeout_ms {
            target.connect_timeout_ms = value;
        }
        if let Some(value) = self.connect_attempts {
            target.connect_attempts = value;
        }
        if let Some(value) = self.max_reconnect_attempts {
            target.max_reconnect_attempts = value;
        }
        if let Some(value) = self.reconnect_backoff_base_ms {
            target.reconnect_backoff_base_ms = value;
        }
        if let Some(value) = self.reconnect_backoff_max_ms {
            target.reconnect_backoff_max_ms = value;
        }
        if let Some(value) = self.linger_ms {
            target.linger_ms = value;
        }
        if let Some(value) = self.startup_sync_timeout_ms {
            target.startup_sync_timeout_ms = value;
        }
        if let Some(value) = self.isolation_alert_ms {
            target.isolation_alert_ms = value;
        }
    }
}

/// A partial config as read from one file; unset fields keep the value of
/// the layer below.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub logging: LoggingConfigOverride,
    pub limits: LimitsOverride,
    pub collab: CollabConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.logging.apply_to(&mut base.logging);
        self.limits.apply_to(&mut base.limits);
        self.collab.apply_to(&mut base.collab);
    }
}
