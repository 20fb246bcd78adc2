//! Value types shared by the collaboration subsystem.

pub mod address;
pub mod command;
pub mod limits;
pub mod metadata;

pub use address::{AddressParseError, NodeAddress};
pub use command::{
    Command, CommandId, CommandKind, OutboundCommand, QueueItem, SynchronizationRequest,
    SynchronizationResponse, TransferRequest, TransferResponse,
};
pub use limits::Limits;
pub use metadata::{
    META_ADDRESS, META_HEARTBEAT_INTERVAL_MS, META_SERVER_NAME, MetadataError, NodeMetadata,
    QueueStatus,
};
