//! Contract between the collaboration layer and the local work queue.

mod memory;

use std::fmt;
use std::time::Duration;

use crate::collab::RemoteNodeProxy;
use crate::core::{
    Command, NodeMetadata, SynchronizationRequest, SynchronizationResponse, TransferRequest,
    TransferResponse,
};

pub use memory::{DeliveryRecord, MemoryQueue, QueueEvents};

/// Conditions that leave the collaboration subsystem unable to do its job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CriticalAlert {
    /// Peers are configured but none has had a link for `for_duration`.
    Isolated {
        configured_peers: usize,
        for_duration: Duration,
    },
    /// The manager's check or heartbeat timer stopped ticking on time.
    TimerFailure {
        timer: &'static str,
        consecutive: u32,
    },
}

impl fmt::Display for CriticalAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CriticalAlert::Isolated {
                configured_peers,
                for_duration,
            } => write!(
                f,
                "no link to any of {configured_peers} configured peers for {}s",
                for_duration.as_secs()
            ),
            CriticalAlert::TimerFailure { timer, consecutive } => {
                write!(f, "{timer} timer missed {consecutive} ticks in a row")
            }
        }
    }
}

/// The local queue as seen by the collaboration manager.
///
/// Every method is called from link or manager threads with no collaboration
/// lock held, so implementations may dispatch commands from inside them.
pub trait QueueManager: Send + Sync + 'static {
    /// Current queue status plus any extra key/value fields to advertise.
    fn local_status_snapshot(&self) -> NodeMetadata;

    fn initiate_synchronization(&self, peer: &RemoteNodeProxy) -> SynchronizationRequest;

    fn handle_synchronization_request(
        &self,
        peer: &RemoteNodeProxy,
        request: SynchronizationRequest,
    ) -> SynchronizationResponse;

    fn handle_synchronization_response(
        &self,
        peer: &RemoteNodeProxy,
        response: SynchronizationResponse,
    );

    /// Called exactly once per dispatched command.
    fn on_command_delivery_outcome(&self, command: &Command, success: bool);

    fn on_link_lost(&self, peer: &RemoteNodeProxy);

    fn handle_transfer_request(
        &self,
        peer: &RemoteNodeProxy,
        request: TransferRequest,
    ) -> TransferResponse;

    fn handle_transfer_response(&self, peer: &RemoteNodeProxy, response: TransferResponse);

    fn on_critical(&self, alert: &CriticalAlert) {
        tracing::error!("collaboration critical: {alert}");
    }
}
