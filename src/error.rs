use thiserror::Error;

use crate::collab::{FrameError, ManagerError, ProtoDecodeError, TransportError};
use crate::config::ConfigError;
use crate::core::AddressParseError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-module errors; peer I/O failures never reach
/// it because proxies turn them into state transitions.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Address(#[from] AddressParseError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Decode(#[from] ProtoDecodeError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(_) | Error::Address(_) | Error::Decode(_) => Transience::Permanent,
            Error::Manager(ManagerError::IntervalTooShort { .. }) => Transience::Permanent,
            Error::Manager(ManagerError::Stopped(_)) => Transience::Unknown,
            Error::Manager(ManagerError::Transport(err)) | Error::Transport(err) => {
                transport_transience(err)
            }
            Error::Frame(err) if err.is_disconnect() => Transience::Retryable,
            Error::Frame(_) => Transience::Permanent,
        }
    }
}

fn transport_transience(err: &TransportError) -> Transience {
    match err {
        TransportError::Unresolved(_) => Transience::Unknown,
        TransportError::Connect { .. } => Transience::Retryable,
        TransportError::Io(io) => match io.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::TimedOut => Transience::Retryable,
            std::io::ErrorKind::AddrNotAvailable | std::io::ErrorKind::PermissionDenied => {
                Transience::Permanent
            }
            _ => Transience::Unknown,
        },
    }
}
