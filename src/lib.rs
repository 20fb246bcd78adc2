#![forbid(unsafe_code)]

pub mod cli;
pub mod collab;
pub mod config;
pub mod core;
pub mod error;
mod paths;
pub mod queue;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the common types at crate root for convenience
pub use crate::collab::{
    CollaborationManager, CollaborationManagerHandle, LinkSettings, ManagerConfig, ProxyState,
    RemoteNodeProxy, StartupSyncReport, TcpTransport, Transport,
};
pub use crate::core::{Command, CommandId, NodeAddress, NodeMetadata, QueueStatus};
pub use crate::queue::{CriticalAlert, MemoryQueue, QueueManager};
