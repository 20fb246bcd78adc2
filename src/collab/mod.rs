//! Peer collaboration: links between queue nodes, collision resolution,
//! heartbeats and the manager that drives them.

pub mod collision;
mod context;
mod directory;
pub mod endpoint;
mod execute;
pub mod frame;
pub mod heartbeat;
mod link;
pub mod mailbox;
mod manager;
pub mod proto;
mod proxy;
pub mod transport;

pub use context::LinkSettings;
pub use endpoint::{Direction, Endpoint, SendError};
pub use execute::ProtocolViolation;
pub use frame::{FrameError, FrameReader, FrameWriter};
pub use heartbeat::{BackoffPolicy, Staleness, TickHealth};
pub use mailbox::{MessageQueue, PopError};
pub use manager::{
    CollaborationManager, CollaborationManagerHandle, MIN_INTERVAL, ManagerConfig, ManagerError,
    StartupSyncReport,
};
pub use proto::{Handshake, ProtoDecodeError, ProtoEncodeError, WireMessage};
pub use proxy::{CheckFailure, ProxyState, ReconnectOutcome, RemoteNodeProxy};
pub use transport::{
    Connection, ConnectionCloser, Listener, TcpTransport, Transport, TransportError,
};
