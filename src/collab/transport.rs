//! Byte-stream transport used by the collaboration links.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use thiserror::Error;

use crate::core::NodeAddress;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("address {0} did not resolve")]
    Unresolved(NodeAddress),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: NodeAddress,
        #[source]
        source: io::Error,
    },
}

/// Closes a connection from any thread, unblocking its reader.
pub trait ConnectionCloser: Send + Sync {
    fn close(&self);
}

/// An established bidirectional stream split into independently owned halves.
pub struct Connection {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub closer: Box<dyn ConnectionCloser>,
    pub peer: Option<SocketAddr>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

pub trait Listener: Send {
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;

    /// Poll for a pending inbound connection without blocking.
    fn accept(&mut self) -> Result<Option<Connection>, TransportError>;
}

pub trait Transport: Send + Sync + 'static {
    fn connect(&self, addr: &NodeAddress, timeout: Duration) -> Result<Connection, TransportError>;

    fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

struct TcpCloser(TcpStream);

impl ConnectionCloser for TcpCloser {
    fn close(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

fn tcp_connection(stream: TcpStream) -> Result<Connection, TransportError> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr().ok();
    let reader = stream.try_clone()?;
    let closer = stream.try_clone()?;
    Ok(Connection {
        reader: Box::new(reader),
        writer: Box::new(stream),
        closer: Box::new(TcpCloser(closer)),
        peer,
    })
}

impl Transport for TcpTransport {
    fn connect(&self, addr: &NodeAddress, timeout: Duration) -> Result<Connection, TransportError> {
        let candidates = addr.to_socket_addrs().map_err(|source| TransportError::Connect {
            addr: addr.clone(),
            source,
        })?;
        let mut last_err = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => return tcp_connection(stream),
                Err(err) => last_err = Some(err),
            }
        }
        match last_err {
            Some(source) => Err(TransportError::Connect {
                addr: addr.clone(),
                source,
            }),
            None => Err(TransportError::Unresolved(addr.clone())),
        }
    }

    fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

impl Listener for TcpAcceptor {
    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    fn accept(&mut self) -> Result<Option<Connection>, TransportError> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                // Accepted sockets inherit the listener's mode on some platforms.
                stream.set_nonblocking(false)?;
                tcp_connection(stream).map(Some)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
