//! What each inbound command does to the receiving proxy and queue.

use thiserror::Error;

use super::proxy::{ProxyState, RemoteNodeProxy};
use crate::core::{Command, CommandKind, MetadataError, NodeAddress, NodeMetadata};
use crate::queue::QueueManager;

/// Follow-up the link task performs after a command ran.
#[derive(Debug)]
pub(crate) enum Execution {
    Done,
    /// Write a negotiation reply straight to the endpoint.
    Reply(Command),
    Established,
    /// Write the reply, then consider the link up.
    ReplyAndEstablish(Command),
}

#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("{kind} not expected while {state}")]
    UnexpectedCommand { kind: CommandKind, state: ProxyState },
    #[error("handshake not expected while {state}")]
    UnexpectedHandshake { state: ProxyState },
    #[error("handshake echoed magic {echoed}, sent {sent}")]
    MagicMismatch { sent: u64, echoed: u64 },
    #[error("invalid handshake metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error("peer advertises our own address {0}")]
    SelfConnection(NodeAddress),
    #[error("peer address unknown")]
    UnknownPeer,
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl Command {
    /// Apply an inbound command. `state` is the proxy state it arrived in;
    /// negotiation commands are only valid while synchronizing and
    /// application commands only on an established link.
    pub(crate) fn execute(
        self,
        peer: &RemoteNodeProxy,
        queue: &dyn QueueManager,
        state: ProxyState,
    ) -> Result<Execution, ProtocolViolation> {
        let kind = self.kind();
        let expected = if kind.is_negotiation() {
            ProxyState::Synchronizing
        } else {
            ProxyState::LinkEstablished
        };
        if state != expected {
            return Err(ProtocolViolation::UnexpectedCommand { kind, state });
        }

        match self {
            Command::LinkEstablish { .. } => Ok(Execution::Established),
            Command::SyncRequest { request, .. } => {
                let target = peer.address().ok_or(ProtocolViolation::UnknownPeer)?;
                let response = queue.handle_synchronization_request(peer, request);
                Ok(Execution::Reply(Command::SyncResponse { target, response }))
            }
            Command::SyncResponse { response, .. } => {
                let target = peer.address().ok_or(ProtocolViolation::UnknownPeer)?;
                queue.handle_synchronization_response(peer, response);
                Ok(Execution::ReplyAndEstablish(Command::LinkEstablish { target }))
            }
            Command::Status { metadata, .. } => {
                peer.remote_metadata_updated(metadata);
                peer.status_received();
                Ok(Execution::Done)
            }
            Command::TransferRequest { request, .. } => {
                let target = peer.address().ok_or(ProtocolViolation::UnknownPeer)?;
                let response = queue.handle_transfer_request(peer, request);
                peer.dispatch_command(Command::TransferResponse { target, response });
                Ok(Execution::Done)
            }
            Command::TransferResponse { response, .. } => {
                if let Some(status) = response.status {
                    peer.remote_metadata_updated(NodeMetadata::piggy_backed(status));
                }
                queue.handle_transfer_response(peer, response);
                Ok(Execution::Done)
            }
        }
    }
}
