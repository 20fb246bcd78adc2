//! Per-connection tasks: the dial/handshake driver, the receiver and the
//! sender.
//!
//! Each live endpoint has exactly one receiver thread, which runs the
//! handshake and executes inbound commands, and one sender thread, which
//! drains the proxy's outbound queue once the link is established.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use super::context::CollabContext;
use super::directory::InboundResolution;
use super::endpoint::{Direction, Endpoint, EndpointReader, SendError};
use super::execute::ProtocolViolation;
use super::frame::{FrameError, FrameReader};
use super::proto::{Handshake, ProtoDecodeError, WireMessage, decode_message};
use super::proxy::{ProxyState, RemoteNodeProxy};
use super::transport::Connection;

/// How long the sender blocks before re-checking its endpoint.
const SENDER_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
enum InboundError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] ProtoDecodeError),
    #[error("send error: {0}")]
    Send(#[from] SendError),
    #[error("protocol failure: {0}")]
    Protocol(#[from] ProtocolViolation),
}

pub(crate) fn spawn_dial(proxy: Arc<RemoteNodeProxy>) {
    thread::spawn(move || run_dial(proxy));
}

pub(crate) fn spawn_inbound(ctx: Arc<CollabContext>, connection: Connection) {
    thread::spawn(move || {
        let peer = connection.peer;
        if let Err(err) = run_inbound(ctx, connection) {
            match &err {
                InboundError::Frame(frame) if frame.is_disconnect() => {
                    tracing::debug!(?peer, "inbound connection closed before handshake");
                }
                _ => tracing::warn!(?peer, "inbound connection rejected: {err}"),
            }
        }
    });
}

fn run_dial(proxy: Arc<RemoteNodeProxy>) {
    let Some((addr, magic)) = proxy.begin_dial() else {
        return;
    };
    let ctx = proxy.ctx();
    let settings = &ctx.settings;

    let mut connection = None;
    let mut last_err = None;
    for attempt in 1..=settings.connect_attempts.max(1) {
        if ctx.is_shutting_down() || !proxy.is_dialing(magic) {
            return;
        }
        match ctx.transport.connect(&addr, settings.connect_timeout) {
            Ok(conn) => {
                connection = Some(conn);
                break;
            }
            Err(err) => {
                tracing::debug!(peer = %addr, attempt, "connect attempt failed: {err}");
                last_err = Some(err);
            }
        }
    }
    let Some(connection) = connection else {
        let reason = last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no connect attempts".to_string());
        proxy.dial_failed(magic, &reason);
        return;
    };

    let (endpoint, reader) = Endpoint::from_connection(
        connection,
        magic,
        Direction::Outbound,
        settings.limits.max_frame_bytes,
    );
    let endpoint = Arc::new(endpoint);
    if !proxy.attach_outbound(&endpoint) {
        tracing::debug!(peer = %addr, magic, "dial superseded; dropping connection");
        endpoint.close();
        return;
    }

    let hello = WireMessage::Handshake(Handshake {
        magic,
        metadata: ctx.refresh_local_metadata(),
    });
    if let Err(err) = endpoint.send(&hello) {
        proxy.endpoint_failed(&endpoint, &err.to_string());
        return;
    }
    spawn_sender(Arc::clone(&proxy), Arc::clone(&endpoint));
    run_reader(proxy, endpoint, reader);
}

fn run_inbound(ctx: Arc<CollabContext>, connection: Connection) -> Result<(), InboundError> {
    let Connection {
        reader,
        writer,
        closer,
        peer,
    } = connection;
    let limits = &ctx.settings.limits;
    let mut reader = FrameReader::new(reader, limits.max_frame_bytes);

    let Some(bytes) = reader.read_next()? else {
        return Ok(());
    };
    let WireMessage::Handshake(handshake) = decode_message(&bytes, limits)? else {
        return Err(ProtocolViolation::Malformed("expected HANDSHAKE".into()).into());
    };
    let address = handshake
        .metadata
        .validate_handshake()
        .map_err(ProtocolViolation::from)?
        .canonical();
    if ctx.is_local(&address) {
        return Err(ProtocolViolation::SelfConnection(address).into());
    }
    if ctx.is_shutting_down() {
        return Ok(());
    }

    let endpoint = Arc::new(Endpoint::new(
        writer,
        closer,
        peer,
        handshake.magic,
        Direction::Inbound,
        limits.max_frame_bytes,
    ));
    let proxy = match ctx.directory.resolve_inbound(&ctx, &address, &endpoint) {
        InboundResolution::Registered(proxy) | InboundResolution::Reused(proxy) => proxy,
        InboundResolution::Rejected => {
            tracing::info!(
                peer = %address,
                magic = handshake.magic,
                "inbound connection lost collision"
            );
            endpoint.close();
            return Ok(());
        }
    };

    if !proxy.handshake_accepted(&endpoint, handshake.metadata) {
        endpoint.close();
        return Ok(());
    }
    let echo = WireMessage::Handshake(Handshake {
        magic: handshake.magic,
        metadata: ctx.refresh_local_metadata(),
    });
    if let Err(err) = endpoint.send(&echo) {
        proxy.endpoint_failed(&endpoint, &err.to_string());
        return Err(err.into());
    }

    spawn_sender(Arc::clone(&proxy), Arc::clone(&endpoint));
    run_reader(proxy, endpoint, reader);
    Ok(())
}

fn run_reader(proxy: Arc<RemoteNodeProxy>, endpoint: Arc<Endpoint>, mut reader: EndpointReader) {
    let limits = proxy.ctx().settings.limits.clone();
    loop {
        let bytes = match reader.read_next() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                proxy.endpoint_failed(&endpoint, "peer closed connection");
                return;
            }
            Err(err) => {
                proxy.endpoint_failed(&endpoint, &err.to_string());
                return;
            }
        };
        let message = match decode_message(&bytes, &limits) {
            Ok(message) => message,
            Err(err) => {
                if proxy.is_current(&endpoint) {
                    proxy.protocol_failure(&ProtocolViolation::Malformed(err.to_string()));
                }
                endpoint.close();
                return;
            }
        };
        if let Err(violation) = proxy.handle_message(&endpoint, message) {
            proxy.protocol_failure(&violation);
            return;
        }
        if !endpoint.is_active() {
            return;
        }
    }
}

fn spawn_sender(proxy: Arc<RemoteNodeProxy>, endpoint: Arc<Endpoint>) {
    thread::spawn(move || run_sender(proxy, endpoint));
}

fn run_sender(proxy: Arc<RemoteNodeProxy>, endpoint: Arc<Endpoint>) {
    while endpoint.is_active() && !proxy.ctx().is_shutting_down() {
        if !proxy.wait_for_link_established(SENDER_POLL) {
            if proxy.state() == ProxyState::Destroyed {
                break;
            }
            continue;
        }
        if !proxy.is_current(&endpoint) {
            break;
        }
        let Ok(item) = proxy.next_outgoing_command(Some(SENDER_POLL)) else {
            continue;
        };
        if !proxy.is_current(&endpoint) {
            proxy.requeue_unsent(item);
            break;
        }
        match endpoint.send(&WireMessage::Command(item.command.clone())) {
            Ok(()) => proxy.report_delivery(&item.command, true),
            Err(err) => {
                tracing::debug!(command_id = %item.id, "send failed, requeueing: {err}");
                proxy.requeue_unsent(item);
                proxy.endpoint_failed(&endpoint, &err.to_string());
                break;
            }
        }
    }
}
