//! State shared by the manager, its proxies and their link tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::directory::Directory;
use super::heartbeat::BackoffPolicy;
use super::transport::Transport;
use crate::core::{CommandId, Limits, NodeAddress, NodeMetadata};
use crate::queue::QueueManager;

/// Connection tuning that stays fixed for the manager's lifetime.
#[derive(Clone, Debug)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: BackoffPolicy,
    pub linger: Duration,
    pub limits: Limits,
}

impl LinkSettings {
    /// Time a proxy may spend dialing before the check loop gives up on it.
    pub fn connecting_timeout(&self) -> Duration {
        self.connect_timeout * self.connect_attempts.max(1) * 2
    }

    /// Time a proxy may spend negotiating and synchronizing.
    pub fn negotiating_timeout(&self) -> Duration {
        self.connect_timeout * self.connect_attempts.max(1) * 60
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 3,
            max_reconnect_attempts: 5,
            reconnect_backoff: BackoffPolicy {
                base: Duration::from_millis(500),
                max: Duration::from_secs(30),
            },
            linger: Duration::from_secs(30),
            limits: Limits::default(),
        }
    }
}

pub(crate) struct CollabContext {
    pub(crate) queue: Arc<dyn QueueManager>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) directory: Directory,
    pub(crate) settings: LinkSettings,
    pub(crate) local_address: NodeAddress,
    local_canonical: NodeAddress,
    pub(crate) server_name: String,
    pub(crate) shutdown: AtomicBool,
    check_interval_ms: AtomicU64,
    status_interval_ms: AtomicU64,
    local_metadata: Mutex<NodeMetadata>,
    next_command_id: AtomicU64,
}

impl CollabContext {
    pub(crate) fn new(
        queue: Arc<dyn QueueManager>,
        transport: Arc<dyn Transport>,
        settings: LinkSettings,
        local_address: NodeAddress,
        server_name: String,
        check_interval: Duration,
        status_interval: Duration,
    ) -> Self {
        Self {
            queue,
            transport,
            directory: Directory::default(),
            settings,
            local_canonical: local_address.canonical(),
            local_address,
            server_name,
            shutdown: AtomicBool::new(false),
            check_interval_ms: AtomicU64::new(check_interval.as_millis() as u64),
            status_interval_ms: AtomicU64::new(status_interval.as_millis() as u64),
            local_metadata: Mutex::new(NodeMetadata::default()),
            next_command_id: AtomicU64::new(1),
        }
    }

    /// Whether `address` names this node, as advertised or resolved.
    pub(crate) fn is_local(&self, address: &NodeAddress) -> bool {
        address == &self.local_address || address == &self.local_canonical
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_check_interval(&self, interval: Duration) {
        self.check_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_status_interval(&self, interval: Duration) {
        self.status_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn next_command_id(&self) -> CommandId {
        CommandId(self.next_command_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild this node's full metadata from the queue manager's snapshot.
    pub(crate) fn refresh_local_metadata(&self) -> NodeMetadata {
        let snapshot = self.queue.local_status_snapshot();
        let mut metadata = NodeMetadata::full(
            snapshot.status,
            &self.local_address,
            &self.server_name,
            self.status_interval(),
        );
        for (key, value) in snapshot.extra {
            metadata.extra.entry(key).or_insert(value);
        }
        *self
            .local_metadata
            .lock()
            .expect("local metadata lock poisoned") = metadata.clone();
        metadata
    }

    pub(crate) fn local_metadata(&self) -> NodeMetadata {
        self.local_metadata
            .lock()
            .expect("local metadata lock poisoned")
            .clone()
    }
}
