#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use qcollab::collab::BackoffPolicy;
use qcollab::core::{Limits, QueueItem};
use qcollab::{
    CollaborationManager, CollaborationManagerHandle, LinkSettings, ManagerConfig, MemoryQueue,
    NodeAddress, RemoteNodeProxy, TcpTransport,
};

pub const LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Loopback settings with short intervals so failures surface quickly.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        advertise_addr: None,
        server_name: "test-node".to_string(),
        peers: Vec::new(),
        check_interval: Duration::from_millis(150),
        status_interval: Duration::from_millis(200),
        isolation_alert: Duration::from_secs(60),
        link: LinkSettings {
            connect_timeout: Duration::from_millis(500),
            connect_attempts: 2,
            max_reconnect_attempts: 3,
            reconnect_backoff: BackoffPolicy {
                base: Duration::from_millis(50),
                max: Duration::from_millis(500),
            },
            linger: Duration::from_secs(1),
            limits: Limits::default(),
        },
    }
}

/// A running manager over loopback TCP backed by a [`MemoryQueue`].
pub struct TestNode {
    pub queue: Arc<MemoryQueue>,
    handle: Option<CollaborationManagerHandle>,
}

impl TestNode {
    pub fn start() -> Self {
        Self::start_with(fast_config())
    }

    pub fn start_with(config: ManagerConfig) -> Self {
        let queue = Arc::new(MemoryQueue::new(64));
        let handle = CollaborationManager::start(Arc::new(TcpTransport), queue.clone(), config)
            .expect("start collaboration manager");
        Self {
            queue,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> &CollaborationManagerHandle {
        self.handle.as_ref().expect("node running")
    }

    pub fn manager(&self) -> &CollaborationManager {
        self.handle().manager()
    }

    pub fn address(&self) -> NodeAddress {
        self.manager().local_address().clone()
    }

    pub fn proxy(&self, peer: &NodeAddress) -> Option<Arc<RemoteNodeProxy>> {
        self.manager().get_or_create_remote_node(peer, false)
    }

    pub fn link_to(&self, peer: &TestNode) -> Arc<RemoteNodeProxy> {
        let proxy = self
            .manager()
            .get_or_create_remote_node(&peer.address(), true)
            .expect("proxy created");
        assert!(
            proxy.wait_for_link_established(LINK_TIMEOUT),
            "link to {} not established: {proxy:?}",
            peer.address()
        );
        proxy
    }

    pub fn push_items(&self, ids: &[&str]) {
        for id in ids {
            assert!(self.queue.push(QueueItem {
                id: (*id).to_string(),
                payload: bytes::Bytes::from(format!("payload-{id}")),
            }));
        }
    }

    pub fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// A loopback address nothing is listening on.
pub fn unused_address() -> NodeAddress {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind throwaway listener");
    let addr = listener.local_addr().expect("throwaway addr");
    drop(listener);
    NodeAddress::from(addr)
}
