//! Node status snapshots exchanged during handshake and heartbeats.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use super::address::NodeAddress;

pub const META_ADDRESS: &str = "address";
pub const META_SERVER_NAME: &str = "server_name";
pub const META_HEARTBEAT_INTERVAL_MS: &str = "heartbeat_interval_ms";

/// Queue depth information, the part of the metadata that is piggy-backed
/// on transfer responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub queue_length: u64,
    pub max_queue_length: u64,
    pub blocked: bool,
}

/// A node's status snapshot.
///
/// `extra` is only populated on full snapshots (handshake, heartbeats); a
/// snapshot with an empty `extra` map is piggy-backed and only refreshes the
/// queue status of whatever was learned before.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeMetadata {
    pub status: QueueStatus,
    pub extra: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("metadata field {0} missing")]
    Missing(&'static str),
    #[error("metadata field {field} invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl NodeMetadata {
    pub fn piggy_backed(status: QueueStatus) -> Self {
        Self {
            status,
            extra: BTreeMap::new(),
        }
    }

    pub fn full(
        status: QueueStatus,
        address: &NodeAddress,
        server_name: &str,
        heartbeat_interval: Duration,
    ) -> Self {
        let mut extra = BTreeMap::new();
        extra.insert(META_ADDRESS.to_string(), address.to_string());
        extra.insert(META_SERVER_NAME.to_string(), server_name.to_string());
        extra.insert(
            META_HEARTBEAT_INTERVAL_MS.to_string(),
            heartbeat_interval.as_millis().to_string(),
        );
        Self { status, extra }
    }

    pub fn is_piggy_backed(&self) -> bool {
        self.extra.is_empty()
    }

    /// Merge an incoming snapshot into this cached one.
    pub fn merge(&mut self, incoming: NodeMetadata) {
        if incoming.is_piggy_backed() {
            self.status = incoming.status;
        } else {
            *self = incoming;
        }
    }

    pub fn address(&self) -> Result<NodeAddress, MetadataError> {
        let raw = self
            .extra
            .get(META_ADDRESS)
            .ok_or(MetadataError::Missing(META_ADDRESS))?;
        NodeAddress::parse(raw).map_err(|err| MetadataError::Invalid {
            field: META_ADDRESS,
            reason: err.to_string(),
        })
    }

    pub fn server_name(&self) -> Option<&str> {
        self.extra.get(META_SERVER_NAME).map(String::as_str)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.extra
            .get(META_HEARTBEAT_INTERVAL_MS)
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    /// Check that a handshake snapshot carries everything a link needs.
    pub fn validate_handshake(&self) -> Result<NodeAddress, MetadataError> {
        let address = self.address()?;
        match self.server_name() {
            Some(name) if !name.trim().is_empty() => {}
            Some(_) => {
                return Err(MetadataError::Invalid {
                    field: META_SERVER_NAME,
                    reason: "empty".into(),
                });
            }
            None => return Err(MetadataError::Missing(META_SERVER_NAME)),
        }
        let raw = self
            .extra
            .get(META_HEARTBEAT_INTERVAL_MS)
            .ok_or(MetadataError::Missing(META_HEARTBEAT_INTERVAL_MS))?;
        match raw.parse::<u64>() {
            Ok(ms) if ms > 0 => {}
            Ok(_) => {
                return Err(MetadataError::Invalid {
                    field: META_HEARTBEAT_INTERVAL_MS,
                    reason: "must be positive".into(),
                });
            }
            Err(err) => {
                return Err(MetadataError::Invalid {
                    field: META_HEARTBEAT_INTERVAL_MS,
                    reason: err.to_string(),
                });
            }
        }
        Ok(address)
    }
}
