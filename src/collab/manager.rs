//! Collaboration manager: owns the proxy directory, accepts inbound links,
//! and runs the heartbeat and check loop.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use super::context::{CollabContext, LinkSettings};
use super::heartbeat::{IntervalTimer, TickHealth};
use super::link;
use super::proxy::{ProxyState, ReconnectOutcome, RemoteNodeProxy};
use super::transport::{Listener, Transport, TransportError};
use crate::core::{Command, CommandId, NodeAddress, NodeMetadata};
use crate::queue::{CriticalAlert, QueueManager};

/// Check and heartbeat intervals must be strictly longer than this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

const ACCEPT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{name} interval {interval_ms}ms must exceed {}ms", MIN_INTERVAL.as_millis())]
    IntervalTooShort { name: &'static str, interval_ms: u64 },
    #[error("collaboration manager stopped: {0}")]
    Stopped(CriticalAlert),
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub listen_addr: String,
    /// Address peers should dial to reach this node. Defaults to the bound
    /// listen address.
    pub advertise_addr: Option<NodeAddress>,
    pub server_name: String,
    pub peers: Vec<NodeAddress>,
    pub check_interval: Duration,
    pub status_interval: Duration,
    pub isolation_alert: Duration,
    pub link: LinkSettings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7400".to_string(),
            advertise_addr: None,
            server_name: "qcollab".to_string(),
            peers: Vec::new(),
            check_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(5),
            isolation_alert: Duration::from_secs(300),
            link: LinkSettings::default(),
        }
    }
}

fn validate_interval(name: &'static str, interval: Duration) -> Result<(), ManagerError> {
    if interval <= MIN_INTERVAL {
        return Err(ManagerError::IntervalTooShort {
            name,
            interval_ms: interval.as_millis() as u64,
        });
    }
    Ok(())
}

/// Per-address outcome of [`CollaborationManager::synchronize_with_peers`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartupSyncReport {
    pub linked: Vec<NodeAddress>,
    pub failed: Vec<NodeAddress>,
}

/// Cheap, cloneable access to a running node's collaboration state.
#[derive(Clone)]
pub struct CollaborationManager {
    ctx: Arc<CollabContext>,
}

impl std::fmt::Debug for CollaborationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborationManager")
            .field("local_address", &self.ctx.local_address)
            .field("proxies", &self.ctx.directory.len())
            .finish()
    }
}

pub struct CollaborationManagerHandle {
    manager: CollaborationManager,
    local_addr: SocketAddr,
    shutdown_tx: Sender<()>,
    fatal: Arc<Mutex<Option<CriticalAlert>>>,
    joins: Vec<JoinHandle<()>>,
}

impl CollaborationManagerHandle {
    pub fn manager(&self) -> &CollaborationManager {
        &self.manager
    }

    /// Socket address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The timer failure that stopped the check loop, if any.
    pub fn fatal(&self) -> Option<CriticalAlert> {
        self.fatal.lock().expect("fatal lock poisoned").clone()
    }

    /// Stop the accept and check loops and join them, then destroy every
    /// proxy. Destroying closes each endpoint, which ends that connection's
    /// detached dial, reader and sender threads.
    pub fn shutdown(self) {
        let ctx = Arc::clone(&self.manager.ctx);
        ctx.shutdown.store(true, Ordering::Release);
        drop(self.shutdown_tx);
        for join in self.joins {
            let _ = join.join();
        }
        for proxy in ctx.directory.drain() {
            proxy.destroy("manager shutdown");
        }
        tracing::info!(local = %ctx.local_address, "collaboration manager stopped");
    }
}

impl CollaborationManager {
    pub fn start(
        transport: Arc<dyn Transport>,
        queue: Arc<dyn QueueManager>,
        config: ManagerConfig,
    ) -> Result<CollaborationManagerHandle, ManagerError> {
        validate_interval("check", config.check_interval)?;
        validate_interval("status", config.status_interval)?;
        let peers = config
            .peers
            .iter()
            .map(NodeAddress::canonical)
            .collect::<Vec<_>>();

        let listener = transport.listen(&config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        let local_address = config.advertise_addr.clone().unwrap_or_else(|| {
            if local_addr.ip().is_unspecified() {
                tracing::warn!(
                    "listening on unspecified address {local_addr}; set advertise_addr so peers can key this node"
                );
            }
            NodeAddress::from(local_addr)
        });

        let ctx = Arc::new(CollabContext::new(
            queue,
            transport,
            config.link.clone(),
            local_address,
            config.server_name.clone(),
            config.check_interval,
            config.status_interval,
        ));
        ctx.refresh_local_metadata();
        let manager = CollaborationManager { ctx };

        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let fatal = Arc::new(Mutex::new(None));
        let mut joins = Vec::new();

        {
            let ctx = Arc::clone(&manager.ctx);
            joins.push(thread::spawn(move || run_accept_loop(listener, ctx)));
        }
        {
            let manager = manager.clone();
            let peers = peers.clone();
            let fatal = Arc::clone(&fatal);
            let isolation_alert = config.isolation_alert;
            joins.push(thread::spawn(move || {
                run_check_loop(manager, peers, isolation_alert, shutdown_rx, fatal)
            }));
        }

        tracing::info!(
            local = %manager.ctx.local_address,
            listen = %local_addr,
            peers = peers.len(),
            "collaboration manager started"
        );
        for peer in &peers {
            manager.get_or_create_remote_node(peer, true);
        }

        Ok(CollaborationManagerHandle {
            manager,
            local_addr,
            shutdown_tx,
            fatal,
            joins,
        })
    }

    /// The address this node advertises to peers.
    pub fn local_address(&self) -> &NodeAddress {
        &self.ctx.local_address
    }

    /// This node's metadata as of the last heartbeat or handshake.
    pub fn local_metadata(&self) -> NodeMetadata {
        self.ctx.local_metadata()
    }

    /// Look up the proxy for `address`, creating one and starting its dial
    /// when `create_if_absent` is set. Concurrent callers for the same
    /// address always get the same proxy. Host names are resolved first, so
    /// `localhost:7401` and `127.0.0.1:7401` share a proxy.
    pub fn get_or_create_remote_node(
        &self,
        address: &NodeAddress,
        create_if_absent: bool,
    ) -> Option<Arc<RemoteNodeProxy>> {
        let address = address.canonical();
        if !create_if_absent || self.ctx.is_local(&address) || self.ctx.is_shutting_down() {
            return self.ctx.directory.get(&address);
        }
        let (proxy, created) = self.ctx.directory.get_or_insert_with(&address, || {
            RemoteNodeProxy::outbound(Arc::clone(&self.ctx), address.clone())
        });
        if created {
            tracing::debug!(peer = %address, "created proxy");
            link::spawn_dial(Arc::clone(&proxy));
        }
        Some(proxy)
    }

    pub fn list_remote_nodes(&self) -> Vec<Arc<RemoteNodeProxy>> {
        self.ctx.directory.list()
    }

    /// Route `command` to the proxy for its target. When no proxy can be had
    /// the command is reported failed right away.
    pub fn dispatch_command(&self, command: Command) -> Option<CommandId> {
        self.route(command, false)
    }

    pub fn dispatch_urgent_command(&self, command: Command) -> Option<CommandId> {
        self.route(command, true)
    }

    fn route(&self, command: Command, urgent: bool) -> Option<CommandId> {
        let Some(proxy) = self.get_or_create_remote_node(command.target(), true) else {
            tracing::debug!(target_addr = %command.target(), "no proxy for command target");
            self.ctx.queue.on_command_delivery_outcome(&command, false);
            return None;
        };
        Some(if urgent {
            proxy.dispatch_urgent_command(command)
        } else {
            proxy.dispatch_command(command)
        })
    }

    pub fn wait_for_link_established(&self, address: &NodeAddress, timeout: Duration) -> bool {
        match self.ctx.directory.get(&address.canonical()) {
            Some(proxy) => proxy.wait_for_link_established(timeout),
            None => false,
        }
    }

    /// Drop the proxy for `address` from the directory and destroy it.
    pub fn unregister(&self, address: &NodeAddress) -> bool {
        let Some(proxy) = self.ctx.directory.get(&address.canonical()) else {
            return false;
        };
        if !self.ctx.directory.unregister(&proxy) {
            return false;
        }
        proxy.destroy("unregistered");
        true
    }

    pub fn check_interval(&self) -> Duration {
        self.ctx.check_interval()
    }

    pub fn set_check_interval(&self, interval: Duration) -> Result<(), ManagerError> {
        validate_interval("check", interval)?;
        self.ctx.set_check_interval(interval);
        Ok(())
    }

    pub fn status_interval(&self) -> Duration {
        self.ctx.status_interval()
    }

    pub fn set_status_interval(&self, interval: Duration) -> Result<(), ManagerError> {
        validate_interval("status", interval)?;
        self.ctx.set_status_interval(interval);
        Ok(())
    }

    /// Bring up links to `peers` and wait for each, sharing one deadline.
    /// Failures are logged and reported but never stop the others.
    pub fn synchronize_with_peers(
        &self,
        peers: &[NodeAddress],
        timeout: Duration,
    ) -> StartupSyncReport {
        let deadline = Instant::now() + timeout;
        let proxies = peers
            .iter()
            .map(|peer| (peer.clone(), self.get_or_create_remote_node(peer, true)))
            .collect::<Vec<_>>();

        let mut report = StartupSyncReport::default();
        for (peer, proxy) in proxies {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let linked = proxy.is_some_and(|proxy| proxy.wait_for_link_established(remaining));
            if linked {
                tracing::info!(peer = %peer, "startup synchronization complete");
                report.linked.push(peer);
            } else {
                tracing::warn!(peer = %peer, "startup synchronization failed");
                report.failed.push(peer);
            }
        }
        report
    }

    fn dispatch_status(&self) {
        let metadata = self.ctx.refresh_local_metadata();
        for proxy in self.ctx.directory.list() {
            if proxy.state() != ProxyState::LinkEstablished {
                continue;
            }
            if let Some(target) = proxy.address() {
                proxy.dispatch_urgent_command(Command::Status {
                    target,
                    metadata: metadata.clone(),
                });
            }
        }
    }

    /// One pass of the endpoint check. Returns the number of established
    /// links.
    fn check_endpoints(&self, now: Instant, peers: &[NodeAddress]) -> usize {
        let mut linked = 0usize;
        for proxy in self.ctx.directory.list() {
            if proxy.state() == ProxyState::Destroyed {
                let since = now.saturating_duration_since(proxy.last_connect_attempt());
                if since >= self.ctx.settings.linger && self.ctx.directory.unregister(&proxy) {
                    let cancelled = proxy.cancel_all_commands(false);
                    tracing::debug!(
                        peer = ?proxy.address(),
                        cancelled,
                        "unregistered destroyed proxy"
                    );
                }
                continue;
            }

            match proxy.check_at(now) {
                Ok(()) => {
                    proxy.check_heartbeat_at(now);
                    if proxy.state() == ProxyState::LinkEstablished {
                        linked += 1;
                    }
                }
                Err(failure) => match proxy.reconnect() {
                    ReconnectOutcome::Started => {
                        tracing::info!(
                            peer = ?proxy.address(),
                            "check failed ({failure}); reconnect started"
                        );
                    }
                    ReconnectOutcome::Deferred => {}
                    ReconnectOutcome::NotPossible => {
                        if proxy.destroy(&failure.to_string()) {
                            tracing::warn!(peer = ?proxy.address(), "link lost: {failure}");
                            self.ctx.queue.on_link_lost(&proxy);
                        }
                    }
                },
            }
        }

        for peer in peers {
            if self.ctx.directory.get(peer).is_none() {
                self.get_or_create_remote_node(peer, true);
            }
        }
        linked
    }
}

fn run_accept_loop(mut listener: Box<dyn Listener>, ctx: Arc<CollabContext>) {
    while !ctx.is_shutting_down() {
        match listener.accept() {
            Ok(Some(connection)) => link::spawn_inbound(Arc::clone(&ctx), connection),
            Ok(None) => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                tracing::warn!("collaboration accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Raises one isolation alert per stretch of time without any link.
#[derive(Debug)]
struct IsolationMonitor {
    configured_peers: usize,
    threshold: Duration,
    isolated_since: Option<Instant>,
    alerted: bool,
}

impl IsolationMonitor {
    fn new(configured_peers: usize, threshold: Duration, now: Instant) -> Self {
        Self {
            configured_peers,
            threshold,
            isolated_since: Some(now),
            alerted: false,
        }
    }

    fn observe(&mut self, linked: usize, now: Instant) -> Option<CriticalAlert> {
        if self.configured_peers == 0 {
            return None;
        }
        if linked > 0 {
            self.isolated_since = None;
            self.alerted = false;
            return None;
        }
        let since = *self.isolated_since.get_or_insert(now);
        let isolated_for = now.saturating_duration_since(since);
        if self.alerted || isolated_for < self.threshold {
            return None;
        }
        self.alerted = true;
        Some(CriticalAlert::Isolated {
            configured_peers: self.configured_peers,
            for_duration: isolated_for,
        })
    }
}

fn run_check_loop(
    manager: CollaborationManager,
    peers: Vec<NodeAddress>,
    isolation_alert: Duration,
    shutdown: Receiver<()>,
    fatal: Arc<Mutex<Option<CriticalAlert>>>,
) {
    let ctx = Arc::clone(&manager.ctx);
    let start = Instant::now();
    let mut status_timer = IntervalTimer::new("status", ctx.status_interval(), start);
    let mut check_timer = IntervalTimer::new("check", ctx.check_interval(), start);
    let mut isolation = IsolationMonitor::new(peers.len(), isolation_alert, start);

    loop {
        status_timer.set_interval(ctx.status_interval());
        check_timer.set_interval(ctx.check_interval());
        let next_due = status_timer.next_due().min(check_timer.next_due());
        match shutdown.recv_timeout(next_due.saturating_duration_since(Instant::now())) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if ctx.is_shutting_down() {
            break;
        }

        let now = Instant::now();
        if status_timer.is_due(now) {
            let health = status_timer.fire(now);
            if !timer_ok(&ctx, &status_timer, health, &fatal) {
                break;
            }
            manager.dispatch_status();
        }
        if check_timer.is_due(now) {
            let health = check_timer.fire(now);
            if !timer_ok(&ctx, &check_timer, health, &fatal) {
                break;
            }
            let linked = manager.check_endpoints(now, &peers);
            if let Some(alert) = isolation.observe(linked, now) {
                tracing::error!("{alert}");
                ctx.queue.on_critical(&alert);
            }
        }
    }
}

fn timer_ok(
    ctx: &CollabContext,
    timer: &IntervalTimer,
    health: TickHealth,
    fatal: &Mutex<Option<CriticalAlert>>,
) -> bool {
    match health {
        TickHealth::OnTime => true,
        TickHealth::Late { consecutive } => {
            tracing::warn!(
                timer = timer.name(),
                consecutive,
                interval_ms = timer.interval().as_millis() as u64,
                "collaboration timer tick late"
            );
            true
        }
        TickHealth::Failed { consecutive } => {
            let alert = CriticalAlert::TimerFailure {
                timer: timer.name(),
                consecutive,
            };
            tracing::error!("collaboration manager stopping: {alert}");
            *fatal.lock().expect("fatal lock poisoned") = Some(alert.clone());
            ctx.queue.on_critical(&alert);
            false
        }
    }
}
