//! Per-peer proxy: link state machine, outbound command queue and the
//! metadata learned from the peer.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::collision::{self, CollisionOutcome};
use super::context::CollabContext;
use super::endpoint::{Direction, Endpoint};
use super::execute::{Execution, ProtocolViolation};
use super::heartbeat::{Backoff, Staleness, StalenessTracker};
use super::link;
use super::mailbox::{MessageQueue, PopError};
use super::proto::{Handshake, WireMessage};
use crate::core::{Command, CommandId, NodeAddress, NodeMetadata, OutboundCommand};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyState {
    Connecting,
    Negotiating,
    Synchronizing,
    LinkEstablished,
    Error,
    Reconnecting,
    Destroyed,
}

impl ProxyState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyState::Connecting => "CONNECTING",
            ProxyState::Negotiating => "NEGOTIATING",
            ProxyState::Synchronizing => "SYNCHRONIZING",
            ProxyState::LinkEstablished => "LINK_ESTABLISHED",
            ProxyState::Error => "ERROR",
            ProxyState::Reconnecting => "RECONNECTING",
            ProxyState::Destroyed => "DESTROYED",
        }
    }

    /// The handshake completed on this connection.
    pub fn is_negotiated(self) -> bool {
        matches!(self, ProxyState::Synchronizing | ProxyState::LinkEstablished)
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckFailure {
    /// Heartbeats stopped long enough for a soft failure.
    Stale,
    Disconnected,
    Timeout {
        state: ProxyState,
        elapsed: Duration,
    },
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckFailure::Stale => f.write_str("heartbeats stale"),
            CheckFailure::Disconnected => f.write_str("endpoint disconnected"),
            CheckFailure::Timeout { state, elapsed } => {
                write!(f, "stuck in {state} for {}ms", elapsed.as_millis())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Started,
    /// Backing off; try again on a later check.
    Deferred,
    NotPossible,
}

struct ProxyInner {
    state: ProxyState,
    state_since: Instant,
    address: Option<NodeAddress>,
    endpoint: Option<Arc<Endpoint>>,
    /// Magic number of the dial in flight, if any.
    dial_magic: Option<u64>,
    remote_metadata: NodeMetadata,
    last_connect_attempt: Instant,
    last_status_message: Option<Instant>,
    reconnect_attempts: u32,
    next_reconnect_at: Option<Instant>,
    backoff: Backoff,
    staleness: StalenessTracker,
    stale: bool,
}

impl ProxyInner {
    fn new(ctx: &CollabContext, state: ProxyState, address: Option<NodeAddress>) -> Self {
        let now = Instant::now();
        Self {
            state,
            state_since: now,
            address,
            endpoint: None,
            dial_magic: None,
            remote_metadata: NodeMetadata::default(),
            last_connect_attempt: now,
            last_status_message: None,
            reconnect_attempts: 0,
            next_reconnect_at: None,
            backoff: Backoff::new(ctx.settings.reconnect_backoff),
            staleness: StalenessTracker::default(),
            stale: false,
        }
    }

    fn label(&self) -> String {
        self.address
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    fn set_state(&mut self, next: ProxyState) {
        if self.state == next {
            return;
        }
        tracing::debug!(
            peer = %self.label(),
            from = %self.state,
            to = %next,
            "proxy state change"
        );
        self.state = next;
        self.state_since = Instant::now();
    }

    fn is_current(&self, endpoint: &Endpoint) -> bool {
        self.endpoint
            .as_ref()
            .is_some_and(|current| current.id() == endpoint.id())
    }
}

/// Local stand-in for one remote node.
///
/// State lives behind the proxy's own lock; the outbound queue has an
/// independent lock. Queue manager callbacks are always made with neither
/// held.
pub struct RemoteNodeProxy {
    ctx: Arc<CollabContext>,
    inner: Mutex<ProxyInner>,
    state_changed: Condvar,
    outbound: MessageQueue<OutboundCommand>,
    expected_remote_queue_length: AtomicI64,
}

impl fmt::Debug for RemoteNodeProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("RemoteNodeProxy")
            .field("address", &inner.address)
            .field("state", &inner.state)
            .field("endpoint", &inner.endpoint.as_ref().map(|e| e.id()))
            .field("pending", &self.outbound.len())
            .finish()
    }
}

fn new_magic() -> u64 {
    rand::random::<u64>()
}

impl RemoteNodeProxy {
    /// A proxy about to dial `address`.
    pub(crate) fn outbound(ctx: Arc<CollabContext>, address: NodeAddress) -> Arc<Self> {
        Self::dialing(ctx, address, new_magic())
    }

    pub(crate) fn dialing(ctx: Arc<CollabContext>, address: NodeAddress, magic: u64) -> Arc<Self> {
        let mut inner = ProxyInner::new(&ctx, ProxyState::Connecting, Some(address));
        inner.dial_magic = Some(magic);
        Self::with_inner(ctx, inner)
    }

    /// A proxy created for an accepted connection whose handshake named
    /// `address`.
    pub(crate) fn inbound(
        ctx: Arc<CollabContext>,
        address: NodeAddress,
        endpoint: Arc<Endpoint>,
    ) -> Arc<Self> {
        let mut inner = ProxyInner::new(&ctx, ProxyState::Negotiating, Some(address));
        inner.endpoint = Some(endpoint);
        Self::with_inner(ctx, inner)
    }

    fn with_inner(ctx: Arc<CollabContext>, inner: ProxyInner) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            inner: Mutex::new(inner),
            state_changed: Condvar::new(),
            outbound: MessageQueue::new(),
            expected_remote_queue_length: AtomicI64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ProxyInner> {
        self.inner.lock().expect("proxy lock poisoned")
    }

    pub(crate) fn ctx(&self) -> &CollabContext {
        &self.ctx
    }

    pub fn address(&self) -> Option<NodeAddress> {
        self.lock().address.clone()
    }

    pub fn state(&self) -> ProxyState {
        self.lock().state
    }

    /// Magic number of the live endpoint, or of the dial in flight.
    pub fn magic(&self) -> Option<u64> {
        let inner = self.lock();
        inner
            .endpoint
            .as_ref()
            .map(|endpoint| endpoint.magic())
            .or(inner.dial_magic)
    }

    pub fn remote_metadata(&self) -> NodeMetadata {
        self.lock().remote_metadata.clone()
    }

    pub fn expected_remote_queue_length(&self) -> i64 {
        self.expected_remote_queue_length.load(Ordering::Acquire)
    }

    pub fn pending_commands(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    pub fn last_connect_attempt(&self) -> Instant {
        self.lock().last_connect_attempt
    }

    pub fn last_status_message(&self) -> Option<Instant> {
        self.lock().last_status_message
    }

    /// Queue `command` behind everything already pending.
    pub fn dispatch_command(&self, command: Command) -> CommandId {
        self.enqueue(command, false)
    }

    /// Queue `command` ahead of everything already pending.
    pub fn dispatch_urgent_command(&self, command: Command) -> CommandId {
        self.enqueue(command, true)
    }

    fn enqueue(&self, command: Command, urgent: bool) -> CommandId {
        let id = self.ctx.next_command_id();
        if self.state() == ProxyState::Destroyed {
            tracing::debug!(
                command_id = %id,
                kind = %command.kind(),
                "dispatch to destroyed proxy"
            );
            // Never counted towards the expected remote queue length.
            self.ctx.queue.on_command_delivery_outcome(&command, false);
            return id;
        }
        if command.is_transfer_request() {
            self.expected_remote_queue_length.fetch_add(1, Ordering::AcqRel);
        }
        let item = OutboundCommand { id, command };
        if urgent {
            self.outbound.push_front(item);
        } else {
            self.outbound.push_back(item);
        }
        self.fail_if_destroyed(id);
        id
    }

    /// A destroy that raced with an enqueue may have drained the queue
    /// before the item landed; whoever removes the item reports it.
    fn fail_if_destroyed(&self, id: CommandId) {
        if self.state() != ProxyState::Destroyed {
            return;
        }
        if let Some(item) = self.outbound.remove_first(|pending| pending.id == id) {
            self.report_delivery(&item.command, false);
        }
    }

    /// Block for the next command to transmit. Transfer responses leave
    /// with the local queue status attached.
    pub fn next_outgoing_command(
        &self,
        timeout: Option<Duration>,
    ) -> Result<OutboundCommand, PopError> {
        let mut item = self.outbound.pop_timeout(timeout)?;
        if let Command::TransferResponse { response, .. } = &mut item.command {
            response.status = Some(self.ctx.queue.local_status_snapshot().status);
        }
        Ok(item)
    }

    /// Remove a pending command and report `success` for it. Returns
    /// whether the command was still pending.
    pub fn cancel_command(&self, id: CommandId, success: bool) -> bool {
        match self.outbound.remove_first(|pending| pending.id == id) {
            Some(item) => {
                self.report_delivery(&item.command, success);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all_commands(&self, success: bool) -> usize {
        let drained = self.outbound.drain();
        let count = drained.len();
        for item in drained {
            self.report_delivery(&item.command, success);
        }
        count
    }

    pub(crate) fn report_delivery(&self, command: &Command, success: bool) {
        if !success && command.is_transfer_request() {
            self.expected_remote_queue_length.fetch_sub(1, Ordering::AcqRel);
        }
        self.ctx.queue.on_command_delivery_outcome(command, success);
    }

    /// Put back a command that could not be written.
    pub(crate) fn requeue_unsent(&self, item: OutboundCommand) {
        let id = item.id;
        self.outbound.push_front(item);
        self.fail_if_destroyed(id);
    }

    /// Ingest peer metadata. Piggy-backed snapshots only refresh the queue
    /// status and keep what the full handshake taught us.
    pub fn remote_metadata_updated(&self, metadata: NodeMetadata) {
        let queue_length = metadata.status.queue_length;
        self.lock().remote_metadata.merge(metadata);
        self.expected_remote_queue_length
            .store(i64::try_from(queue_length).unwrap_or(i64::MAX), Ordering::Release);
    }

    pub(crate) fn status_received(&self) {
        let mut inner = self.lock();
        inner.last_status_message = Some(Instant::now());
        inner.staleness.reset();
        inner.stale = false;
    }

    /// Wait until the link is up. Returns `false` on timeout or once the
    /// proxy is destroyed.
    pub fn wait_for_link_established(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            match inner.state {
                ProxyState::LinkEstablished => return true,
                ProxyState::Destroyed => return false,
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .state_changed
                .wait_timeout(inner, deadline - now)
                .expect("proxy lock poisoned");
            inner = next;
        }
    }

    pub fn check(&self) -> Result<(), CheckFailure> {
        self.check_at(Instant::now())
    }

    /// Hard health check: endpoint liveness and per-state deadlines.
    pub fn check_at(&self, now: Instant) -> Result<(), CheckFailure> {
        let inner = self.lock();
        if inner.stale {
            return Err(CheckFailure::Stale);
        }
        let elapsed = now.saturating_duration_since(inner.state_since);
        let endpoint_active = inner
            .endpoint
            .as_ref()
            .is_some_and(|endpoint| endpoint.is_active());
        match inner.state {
            ProxyState::Destroyed => Ok(()),
            ProxyState::Error => Err(CheckFailure::Disconnected),
            ProxyState::Connecting | ProxyState::Reconnecting => {
                if elapsed > self.ctx.settings.connecting_timeout() {
                    Err(CheckFailure::Timeout {
                        state: inner.state,
                        elapsed,
                    })
                } else {
                    Ok(())
                }
            }
            ProxyState::Negotiating | ProxyState::Synchronizing => {
                if !endpoint_active {
                    Err(CheckFailure::Disconnected)
                } else if elapsed > self.ctx.settings.negotiating_timeout() {
                    Err(CheckFailure::Timeout {
                        state: inner.state,
                        elapsed,
                    })
                } else {
                    Ok(())
                }
            }
            ProxyState::LinkEstablished => {
                if endpoint_active {
                    Ok(())
                } else {
                    Err(CheckFailure::Disconnected)
                }
            }
        }
    }

    pub fn check_heartbeat(&self) -> Staleness {
        self.check_heartbeat_at(Instant::now())
    }

    /// Soft liveness check on an established link. A soft failure marks the
    /// proxy stale so the next hard check fails.
    pub fn check_heartbeat_at(&self, now: Instant) -> Staleness {
        let mut inner = self.lock();
        if inner.state != ProxyState::LinkEstablished {
            return Staleness::Fresh;
        }
        let interval = inner
            .remote_metadata
            .heartbeat_interval()
            .unwrap_or_else(|| self.ctx.status_interval());
        let last = inner.last_status_message.unwrap_or(inner.state_since);
        let silent_for = now.saturating_duration_since(last);
        let staleness = inner.staleness.observe(silent_for, interval);
        match staleness {
            Staleness::SoftFailure => {
                inner.stale = true;
                tracing::warn!(
                    peer = %inner.label(),
                    silent_ms = silent_for.as_millis() as u64,
                    "no heartbeat from peer; link degraded"
                );
            }
            Staleness::Stale { cycles } => {
                tracing::debug!(peer = %inner.label(), cycles, "heartbeat overdue");
            }
            Staleness::Fresh => {}
        }
        staleness
    }

    /// Start a fresh dial to the peer.
    pub fn reconnect(self: &Arc<Self>) -> ReconnectOutcome {
        let now = Instant::now();
        let old = {
            let mut inner = self.lock();
            if matches!(
                inner.state,
                ProxyState::Reconnecting | ProxyState::Destroyed
            ) || inner.address.is_none()
            {
                return ReconnectOutcome::NotPossible;
            }
            if inner.reconnect_attempts >= self.ctx.settings.max_reconnect_attempts {
                return ReconnectOutcome::NotPossible;
            }
            if inner.next_reconnect_at.is_some_and(|at| now < at) {
                return ReconnectOutcome::Deferred;
            }
            inner.reconnect_attempts += 1;
            let delay = inner.backoff.next_delay();
            inner.next_reconnect_at = Some(now + delay);
            inner.stale = false;
            inner.staleness.reset();
            inner.dial_magic = Some(new_magic());
            inner.set_state(ProxyState::Reconnecting);
            tracing::info!(
                peer = %inner.label(),
                attempt = inner.reconnect_attempts,
                "reconnecting to peer"
            );
            inner.endpoint.take()
        };
        self.state_changed.notify_all();
        if let Some(endpoint) = old {
            endpoint.close();
        }
        self.outbound.interrupt();
        link::spawn_dial(Arc::clone(self));
        ReconnectOutcome::Started
    }

    /// Tear the proxy down for good. Pending commands are failed. Returns
    /// `false` if it was already destroyed.
    pub fn destroy(&self, reason: &str) -> bool {
        self.destroy_inner(reason).is_some()
    }

    /// Returns the state the proxy was in when this call destroyed it.
    pub(crate) fn destroy_inner(&self, reason: &str) -> Option<ProxyState> {
        let (previous, endpoint, label) = {
            let mut inner = self.lock();
            if inner.state == ProxyState::Destroyed {
                return None;
            }
            let previous = inner.state;
            inner.set_state(ProxyState::Destroyed);
            inner.dial_magic = None;
            (previous, inner.endpoint.take(), inner.label())
        };
        self.state_changed.notify_all();
        if let Some(endpoint) = endpoint {
            endpoint.close();
        }
        self.outbound.interrupt();
        let cancelled = self.cancel_all_commands(false);
        tracing::info!(peer = %label, reason, cancelled, "proxy destroyed");
        Some(previous)
    }

    /// Destroy after the peer broke the protocol.
    pub(crate) fn protocol_failure(&self, violation: &ProtocolViolation) {
        let label = self.lock().label();
        tracing::warn!(peer = %label, "protocol failure: {violation}");
        if self.destroy_inner(&violation.to_string()) == Some(ProxyState::LinkEstablished) {
            self.ctx.queue.on_link_lost(self);
        }
    }

    pub(crate) fn is_current(&self, endpoint: &Endpoint) -> bool {
        self.lock().is_current(endpoint)
    }

    /// Begin the dial for the current attempt. Returns the target and the
    /// attempt's magic number, or `None` if the attempt was superseded.
    pub(crate) fn begin_dial(&self) -> Option<(NodeAddress, u64)> {
        let result = {
            let mut inner = self.lock();
            if inner.state == ProxyState::Reconnecting {
                inner.set_state(ProxyState::Connecting);
            }
            if inner.state != ProxyState::Connecting {
                return None;
            }
            inner.last_connect_attempt = Instant::now();
            let address = inner.address.clone()?;
            let magic = inner.dial_magic?;
            Some((address, magic))
        };
        self.state_changed.notify_all();
        result
    }

    pub(crate) fn is_dialing(&self, magic: u64) -> bool {
        let inner = self.lock();
        inner.state == ProxyState::Connecting && inner.dial_magic == Some(magic)
    }

    pub(crate) fn dial_failed(&self, magic: u64, reason: &str) {
        {
            let mut inner = self.lock();
            if inner.state != ProxyState::Connecting || inner.dial_magic != Some(magic) {
                return;
            }
            tracing::warn!(peer = %inner.label(), "connect failed: {reason}");
            inner.dial_magic = None;
            inner.set_state(ProxyState::Error);
        }
        self.state_changed.notify_all();
    }

    /// Adopt the endpoint produced by our own dial.
    pub(crate) fn attach_outbound(&self, endpoint: &Arc<Endpoint>) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != ProxyState::Connecting
                || inner.dial_magic != Some(endpoint.magic())
                || inner.endpoint.is_some()
            {
                return false;
            }
            inner.endpoint = Some(Arc::clone(endpoint));
            inner.set_state(ProxyState::Negotiating);
        }
        self.state_changed.notify_all();
        true
    }

    /// Run the collision duel against `incoming` under this proxy's lock.
    /// The caller holds the directory lock. When the existing connection
    /// loses, `incoming` is swapped in and the replaced endpoint returned so
    /// the caller can close it after releasing its locks.
    pub(crate) fn duel_inbound(
        &self,
        incoming: &Arc<Endpoint>,
        after_tie: bool,
    ) -> (CollisionOutcome, Option<Arc<Endpoint>>) {
        let (outcome, replaced) = {
            let mut inner = self.lock();
            let existing_magic = inner
                .endpoint
                .as_ref()
                .map(|endpoint| endpoint.magic())
                .or(inner.dial_magic);
            let outcome = if after_tie {
                collision::settle_tie(inner.state)
            } else {
                collision::duel(inner.state, existing_magic, incoming.magic())
            };
            tracing::info!(
                peer = %inner.label(),
                state = %inner.state,
                existing_magic = ?existing_magic,
                incoming_magic = incoming.magic(),
                outcome = ?outcome,
                "connection collision"
            );
            if outcome != CollisionOutcome::NewWinsProxyReused {
                return (outcome, None);
            }
            let replaced = inner.endpoint.replace(Arc::clone(incoming));
            inner.dial_magic = None;
            inner.stale = false;
            inner.staleness.reset();
            inner.set_state(ProxyState::Negotiating);
            (outcome, replaced)
        };
        self.state_changed.notify_all();
        (outcome, replaced)
    }

    /// The acceptor validated the dialer's handshake on `endpoint`.
    pub(crate) fn handshake_accepted(&self, endpoint: &Endpoint, metadata: NodeMetadata) -> bool {
        {
            let mut inner = self.lock();
            if !inner.is_current(endpoint) || inner.state != ProxyState::Negotiating {
                return false;
            }
            inner.remote_metadata.merge(metadata);
            inner.set_state(ProxyState::Synchronizing);
        }
        self.state_changed.notify_all();
        true
    }

    fn link_established(&self, endpoint: &Endpoint) {
        {
            let mut inner = self.lock();
            if !inner.is_current(endpoint) || inner.state != ProxyState::Synchronizing {
                return;
            }
            inner.set_state(ProxyState::LinkEstablished);
            inner.reconnect_attempts = 0;
            inner.next_reconnect_at = None;
            inner.backoff.reset();
            inner.last_status_message = Some(Instant::now());
            inner.staleness.reset();
            inner.stale = false;
            tracing::info!(
                peer = %inner.label(),
                magic = endpoint.magic(),
                "link established"
            );
        }
        self.state_changed.notify_all();
    }

    /// The connection behind `endpoint` broke. Stale endpoints from lost
    /// collisions are only closed.
    pub(crate) fn endpoint_failed(&self, endpoint: &Endpoint, reason: &str) {
        let was_current = {
            let mut inner = self.lock();
            if inner.is_current(endpoint) && inner.state != ProxyState::Destroyed {
                tracing::warn!(
                    peer = %inner.label(),
                    state = %inner.state,
                    "link failed: {reason}"
                );
                inner.endpoint = None;
                inner.set_state(ProxyState::Error);
                true
            } else {
                false
            }
        };
        endpoint.close();
        if was_current {
            self.state_changed.notify_all();
            self.outbound.interrupt();
        }
    }

    /// Handle one decoded message read from `endpoint`.
    pub(crate) fn handle_message(
        &self,
        endpoint: &Arc<Endpoint>,
        message: WireMessage,
    ) -> Result<(), ProtocolViolation> {
        if !self.is_current(endpoint) {
            endpoint.close();
            return Ok(());
        }
        match message {
            WireMessage::Handshake(handshake) => self.handshake_echoed(endpoint, handshake),
            WireMessage::Command(command) => {
                let state = self.state();
                if !self.ctx.is_local(command.target()) {
                    tracing::debug!(
                        target_addr = %command.target(),
                        local = %self.ctx.local_address,
                        "command target differs from advertised address"
                    );
                }
                match command.execute(self, self.ctx.queue.as_ref(), state)? {
                    Execution::Done => {}
                    Execution::Reply(reply) => {
                        self.send_direct(endpoint, reply);
                    }
                    Execution::Established => self.link_established(endpoint),
                    Execution::ReplyAndEstablish(reply) => {
                        if self.send_direct(endpoint, reply) {
                            self.link_established(endpoint);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn handshake_echoed(
        &self,
        endpoint: &Arc<Endpoint>,
        handshake: Handshake,
    ) -> Result<(), ProtocolViolation> {
        let state = self.state();
        if endpoint.direction() != Direction::Outbound || state != ProxyState::Negotiating {
            return Err(ProtocolViolation::UnexpectedHandshake { state });
        }
        if handshake.magic != endpoint.magic() {
            return Err(ProtocolViolation::MagicMismatch {
                sent: endpoint.magic(),
                echoed: handshake.magic,
            });
        }
        let advertised = handshake.metadata.validate_handshake()?.canonical();
        if self.ctx.is_local(&advertised) {
            return Err(ProtocolViolation::SelfConnection(advertised));
        }
        let target = {
            let mut inner = self.lock();
            if !inner.is_current(endpoint) || inner.state != ProxyState::Negotiating {
                return Ok(());
            }
            if inner.address.as_ref() != Some(&advertised) {
                tracing::warn!(
                    dialed = %inner.label(),
                    advertised = %advertised,
                    "peer advertises a different address; its advertise_addr should match what peers dial"
                );
            }
            inner.remote_metadata.merge(handshake.metadata);
            inner.set_state(ProxyState::Synchronizing);
            inner.address.clone().unwrap_or(advertised)
        };
        self.state_changed.notify_all();

        let request = self.ctx.queue.initiate_synchronization(self);
        self.send_direct(
            endpoint,
            Command::SyncRequest {
                target,
                request,
            },
        );
        Ok(())
    }

    /// Write a negotiation command straight to the endpoint.
    fn send_direct(&self, endpoint: &Endpoint, command: Command) -> bool {
        match endpoint.send(&WireMessage::Command(command)) {
            Ok(()) => true,
            Err(err) => {
                self.endpoint_failed(endpoint, &err.to_string());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use bytes::Bytes;

    use crate::collab::context::LinkSettings;
    use crate::collab::transport::{Listener, Transport, TransportError};
    use crate::core::{
        CommandKind, QueueItem, QueueStatus, TransferRequest, TransferResponse, META_ADDRESS,
    };
    use crate::queue::MemoryQueue;

    struct RefusingTransport;

    impl Transport for RefusingTransport {
        fn connect(
            &self,
            addr: &NodeAddress,
            _timeout: Duration,
        ) -> Result<crate::collab::transport::Connection, TransportError> {
            Err(TransportError::Unresolved(addr.clone()))
        }

        fn listen(&self, _addr: &str) -> Result<Box<dyn Listener>, TransportError> {
            Err(TransportError::Io(std::io::Error::other("no listener")))
        }
    }

    fn context(queue: Arc<MemoryQueue>, settings: LinkSettings) -> Arc<CollabContext> {
        Arc::new(CollabContext::new(
            queue,
            Arc::new(RefusingTransport),
            settings,
            NodeAddress::new("127.0.0.1", 7400),
            "local".to_string(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        ))
    }

    fn peer() -> NodeAddress {
        NodeAddress::new("127.0.0.1", 7401)
    }

    fn status(target: &NodeAddress) -> Command {
        Command::Status {
            target: target.clone(),
            metadata: NodeMetadata::default(),
        }
    }

    fn transfer(target: &NodeAddress, request_id: u64) -> Command {
        Command::TransferRequest {
            target: target.clone(),
            request: TransferRequest {
                request_id,
                item: QueueItem {
                    id: format!("job-{request_id}"),
                    payload: Bytes::from_static(b"x"),
                },
            },
        }
    }

    fn force_state(proxy: &RemoteNodeProxy, state: ProxyState) {
        proxy.lock().set_state(state);
        proxy.state_changed.notify_all();
    }

    #[test]
    fn urgent_commands_overtake_queued_ones() {
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(context(queue, LinkSettings::default()), peer());

        let first = proxy.dispatch_command(transfer(&peer(), 1));
        let second = proxy.dispatch_command(transfer(&peer(), 2));
        let urgent = proxy.dispatch_urgent_command(status(&peer()));
        assert_eq!(proxy.expected_remote_queue_length(), 2);

        let order = (0..3)
            .map(|_| proxy.next_outgoing_command(Some(Duration::ZERO)).unwrap().id)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![urgent, first, second]);
        assert_eq!(
            proxy.next_outgoing_command(Some(Duration::from_millis(10))),
            Err(PopError::Timeout)
        );
    }

    #[test]
    fn destroy_fails_every_pending_command_once() {
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(
            context(Arc::clone(&queue), LinkSettings::default()),
            peer(),
        );
        for id in 0..5 {
            proxy.dispatch_command(transfer(&peer(), id));
        }
        proxy.dispatch_urgent_command(status(&peer()));

        assert!(proxy.destroy("test"));
        assert!(!proxy.destroy("again"));
        assert_eq!(proxy.state(), ProxyState::Destroyed);
        assert_eq!(proxy.pending_commands(), 0);
        assert_eq!(proxy.expected_remote_queue_length(), 0);

        let events = queue.events();
        assert_eq!(events.deliveries.len(), 6);
        assert!(events.deliveries.iter().all(|record| !record.success));

        proxy.dispatch_command(status(&peer()));
        assert_eq!(proxy.pending_commands(), 0);
        assert_eq!(queue.events().deliveries.len(), 7);
    }

    #[test]
    fn transfer_to_destroyed_proxy_leaves_expected_length_alone() {
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(
            context(Arc::clone(&queue), LinkSettings::default()),
            peer(),
        );
        assert!(proxy.destroy("test"));

        proxy.dispatch_command(transfer(&peer(), 1));
        proxy.dispatch_urgent_command(transfer(&peer(), 2));
        assert_eq!(proxy.expected_remote_queue_length(), 0);
        assert_eq!(proxy.pending_commands(), 0);

        let events = queue.events();
        let failed = events
            .deliveries_of(CommandKind::TransferRequest)
            .filter(|record| !record.success)
            .count();
        assert_eq!(failed, 2);
    }

    #[test]
    fn concurrent_dispatch_and_destroy_report_each_command_once() {
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(
            context(Arc::clone(&queue), LinkSettings::default()),
            peer(),
        );
        let dispatchers = (0..4)
            .map(|_| {
                let proxy = Arc::clone(&proxy);
                thread::spawn(move || {
                    for _ in 0..250 {
                        proxy.dispatch_command(status(&peer()));
                    }
                })
            })
            .collect::<Vec<_>>();
        thread::sleep(Duration::from_millis(1));
        proxy.destroy("shutdown");
        for dispatcher in dispatchers {
            dispatcher.join().unwrap();
        }

        assert_eq!(proxy.pending_commands(), 0);
        assert_eq!(queue.events().deliveries.len(), 1_000);
    }

    #[test]
    fn cancel_command_reports_caller_outcome() {
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(
            context(Arc::clone(&queue), LinkSettings::default()),
            peer(),
        );
        let id = proxy.dispatch_command(status(&peer()));
        assert!(proxy.cancel_command(id, true));
        assert!(!proxy.cancel_command(id, true));
        let events = queue.events();
        assert_eq!(events.deliveries.len(), 1);
        assert!(events.deliveries[0].success);
        assert_eq!(events.deliveries[0].kind, CommandKind::Status);
    }

    #[test]
    fn transfer_responses_carry_local_status() {
        let queue = Arc::new(MemoryQueue::new(3));
        queue.push(QueueItem {
            id: "a".into(),
            payload: Bytes::new(),
        });
        let proxy = RemoteNodeProxy::outbound(context(queue, LinkSettings::default()), peer());
        proxy.dispatch_command(Command::TransferResponse {
            target: peer(),
            response: TransferResponse {
                request_id: 4,
                accepted: true,
                status: None,
            },
        });
        let sent = proxy.next_outgoing_command(Some(Duration::ZERO)).unwrap();
        let Command::TransferResponse { response, .. } = sent.command else {
            panic!("expected transfer response");
        };
        assert_eq!(
            response.status,
            Some(QueueStatus {
                queue_length: 1,
                max_queue_length: 3,
                blocked: false,
            })
        );
    }

    #[test]
    fn piggy_backed_metadata_keeps_handshake_fields() {
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(context(queue, LinkSettings::default()), peer());
        proxy.dispatch_command(transfer(&peer(), 1));
        proxy.dispatch_command(transfer(&peer(), 2));
        assert_eq!(proxy.expected_remote_queue_length(), 2);

        proxy.remote_metadata_updated(NodeMetadata::full(
            QueueStatus::default(),
            &peer(),
            "remote",
            Duration::from_millis(500),
        ));
        proxy.remote_metadata_updated(NodeMetadata::piggy_backed(QueueStatus {
            queue_length: 7,
            max_queue_length: 10,
            blocked: false,
        }));

        let metadata = proxy.remote_metadata();
        assert_eq!(metadata.status.queue_length, 7);
        assert_eq!(metadata.server_name(), Some("remote"));
        assert_eq!(metadata.extra.get(META_ADDRESS), Some(&peer().to_string()));
        assert_eq!(proxy.expected_remote_queue_length(), 7);
    }

    #[test]
    fn wait_for_link_respects_timeout_and_destroy() {
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(context(queue, LinkSettings::default()), peer());

        let start = Instant::now();
        assert!(!proxy.wait_for_link_established(Duration::from_millis(50)));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(2));

        let waiter = {
            let proxy = Arc::clone(&proxy);
            thread::spawn(move || proxy.wait_for_link_established(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        force_state(&proxy, ProxyState::LinkEstablished);
        assert!(waiter.join().unwrap());

        force_state(&proxy, ProxyState::Negotiating);
        let waiter = {
            let proxy = Arc::clone(&proxy);
            thread::spawn(move || {
                let start = Instant::now();
                (proxy.wait_for_link_established(Duration::from_secs(10)), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        proxy.destroy("test");
        let (linked, waited) = waiter.join().unwrap();
        assert!(!linked);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn connecting_times_out_after_attempt_budget() {
        let settings = LinkSettings {
            connect_timeout: Duration::from_millis(100),
            connect_attempts: 2,
            ..LinkSettings::default()
        };
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(context(queue, settings), peer());
        let now = Instant::now();
        assert_eq!(proxy.check_at(now), Ok(()));
        assert!(matches!(
            proxy.check_at(now + Duration::from_millis(500)),
            Err(CheckFailure::Timeout {
                state: ProxyState::Connecting,
                ..
            })
        ));
    }

    #[test]
    fn silent_link_goes_stale_then_fails_check() {
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(context(queue, LinkSettings::default()), peer());
        force_state(&proxy, ProxyState::LinkEstablished);
        let interval = Duration::from_millis(200);
        let silent = Instant::now() + interval * 6;

        for cycles in 1..5 {
            assert_eq!(proxy.check_heartbeat_at(silent), Staleness::Stale { cycles });
        }
        assert_eq!(proxy.check_heartbeat_at(silent), Staleness::SoftFailure);
        assert!(proxy.is_stale());
        assert_eq!(proxy.check_at(silent), Err(CheckFailure::Stale));

        proxy.status_received();
        assert!(!proxy.is_stale());
    }

    #[test]
    fn reconnect_is_refused_without_budget() {
        let settings = LinkSettings {
            max_reconnect_attempts: 0,
            ..LinkSettings::default()
        };
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(context(queue, settings), peer());
        force_state(&proxy, ProxyState::Error);
        assert_eq!(proxy.reconnect(), ReconnectOutcome::NotPossible);

        proxy.destroy("test");
        assert_eq!(proxy.reconnect(), ReconnectOutcome::NotPossible);
    }

    #[test]
    fn reconnect_backs_off_between_attempts() {
        let queue = Arc::new(MemoryQueue::new(8));
        let proxy = RemoteNodeProxy::outbound(context(queue, LinkSettings::default()), peer());
        force_state(&proxy, ProxyState::Error);
        let first_magic = proxy.magic();

        assert_eq!(proxy.reconnect(), ReconnectOutcome::Started);
        assert_ne!(proxy.magic(), first_magic);
        assert_eq!(proxy.reconnect_attempts(), 1);

        // The refusing transport fails the dial quickly.
        let deadline = Instant::now() + Duration::from_secs(5);
        while proxy.state() != ProxyState::Error {
            assert!(Instant::now() < deadline, "dial did not fail");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(proxy.reconnect(), ReconnectOutcome::Deferred);
        proxy.destroy("test");
    }
}
