//! Commands exchanged between collaborating nodes.

use bytes::Bytes;

use super::address::NodeAddress;
use super::metadata::{NodeMetadata, QueueStatus};

/// Identifier assigned to a command when it enters a proxy's outbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub u64);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

/// Opaque queue synchronization payload produced by the queue manager.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SynchronizationRequest {
    pub payload: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SynchronizationResponse {
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueItem {
    pub id: String,
    pub payload: Bytes,
}

/// Ask the peer to take over a queue item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub request_id: u64,
    pub item: QueueItem,
}

/// Answer to a [`TransferRequest`].
///
/// `status` is filled in by the sending proxy right before transmission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferResponse {
    pub request_id: u64,
    pub accepted: bool,
    pub status: Option<QueueStatus>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    LinkEstablish,
    SyncRequest,
    SyncResponse,
    Status,
    TransferRequest,
    TransferResponse,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::LinkEstablish => "LINK_ESTABLISH",
            CommandKind::SyncRequest => "SYNC_REQUEST",
            CommandKind::SyncResponse => "SYNC_RESPONSE",
            CommandKind::Status => "STATUS",
            CommandKind::TransferRequest => "TRANSFER_REQUEST",
            CommandKind::TransferResponse => "TRANSFER_RESPONSE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "LINK_ESTABLISH" => Some(CommandKind::LinkEstablish),
            "SYNC_REQUEST" => Some(CommandKind::SyncRequest),
            "SYNC_RESPONSE" => Some(CommandKind::SyncResponse),
            "STATUS" => Some(CommandKind::Status),
            "TRANSFER_REQUEST" => Some(CommandKind::TransferRequest),
            "TRANSFER_RESPONSE" => Some(CommandKind::TransferResponse),
            _ => None,
        }
    }

    /// Whether this kind belongs to link negotiation rather than to the
    /// application command stream.
    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            CommandKind::LinkEstablish | CommandKind::SyncRequest | CommandKind::SyncResponse
        )
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work sent to one peer. Immutable once dispatched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    LinkEstablish {
        target: NodeAddress,
    },
    SyncRequest {
        target: NodeAddress,
        request: SynchronizationRequest,
    },
    SyncResponse {
        target: NodeAddress,
        response: SynchronizationResponse,
    },
    Status {
        target: NodeAddress,
        metadata: NodeMetadata,
    },
    TransferRequest {
        target: NodeAddress,
        request: TransferRequest,
    },
    TransferResponse {
        target: NodeAddress,
        response: TransferResponse,
    },
}

impl Command {
    pub fn target(&self) -> &NodeAddress {
        match self {
            Command::LinkEstablish { target }
            | Command::SyncRequest { target, .. }
            | Command::SyncResponse { target, .. }
            | Command::Status { target, .. }
            | Command::TransferRequest { target, .. }
            | Command::TransferResponse { target, .. } => target,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::LinkEstablish { .. } => CommandKind::LinkEstablish,
            Command::SyncRequest { .. } => CommandKind::SyncRequest,
            Command::SyncResponse { .. } => CommandKind::SyncResponse,
            Command::Status { .. } => CommandKind::Status,
            Command::TransferRequest { .. } => CommandKind::TransferRequest,
            Command::TransferResponse { .. } => CommandKind::TransferResponse,
        }
    }

    pub fn is_transfer_request(&self) -> bool {
        matches!(self, Command::TransferRequest { .. })
    }
}

/// A command sitting in (or taken from) a proxy's outbound queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundCommand {
    pub id: CommandId,
    pub command: Command,
}
