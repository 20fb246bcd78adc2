//! Directory of proxies keyed by peer address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use super::collision::{self, CollisionOutcome};
use super::context::CollabContext;
use super::endpoint::Endpoint;
use super::proxy::RemoteNodeProxy;
use crate::core::NodeAddress;

/// Result of offering an accepted connection to the directory.
#[derive(Debug)]
pub(crate) enum InboundResolution {
    /// A fresh proxy now owns the connection.
    Registered(Arc<RemoteNodeProxy>),
    /// An existing proxy lost its duel and adopted the connection.
    Reused(Arc<RemoteNodeProxy>),
    Rejected,
}

/// All registration, unregistration and collision handling happens under the
/// directory lock. A proxy lock may be taken while it is held, never the
/// other way around.
#[derive(Default)]
pub(crate) struct Directory {
    proxies: Mutex<HashMap<String, Arc<RemoteNodeProxy>>>,
}

impl Directory {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<RemoteNodeProxy>>> {
        self.proxies.lock().expect("proxy directory lock poisoned")
    }

    pub(crate) fn get(&self, address: &NodeAddress) -> Option<Arc<RemoteNodeProxy>> {
        self.lock().get(&address.key()).cloned()
    }

    /// Look up `address`, registering the proxy built by `create` if there is
    /// none. The boolean is `true` when `create` ran.
    pub(crate) fn get_or_insert_with(
        &self,
        address: &NodeAddress,
        create: impl FnOnce() -> Arc<RemoteNodeProxy>,
    ) -> (Arc<RemoteNodeProxy>, bool) {
        let mut proxies = self.lock();
        if let Some(existing) = proxies.get(&address.key()) {
            return (Arc::clone(existing), false);
        }
        let proxy = create();
        proxies.insert(address.key(), Arc::clone(&proxy));
        (proxy, true)
    }

    /// Remove `proxy` if it is still the registered one for its address.
    pub(crate) fn unregister(&self, proxy: &Arc<RemoteNodeProxy>) -> bool {
        let Some(address) = proxy.address() else {
            return false;
        };
        let mut proxies = self.lock();
        match proxies.get(&address.key()) {
            Some(registered) if Arc::ptr_eq(registered, proxy) => {
                proxies.remove(&address.key());
                true
            }
            _ => false,
        }
    }

    pub(crate) fn list(&self) -> Vec<Arc<RemoteNodeProxy>> {
        self.lock().values().cloned().collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<RemoteNodeProxy>> {
        self.lock().drain().map(|(_, proxy)| proxy).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Register the connection behind `endpoint`, whose handshake named
    /// `address`, resolving a collision with any existing proxy.
    pub(crate) fn resolve_inbound(
        &self,
        ctx: &Arc<CollabContext>,
        address: &NodeAddress,
        endpoint: &Arc<Endpoint>,
    ) -> InboundResolution {
        let key = address.key();
        let mut after_tie = false;
        loop {
            let (resolution, replaced, loser) = {
                let mut proxies = self.lock();
                let Some(existing) = proxies.get(&key).cloned() else {
                    let proxy = RemoteNodeProxy::inbound(
                        Arc::clone(ctx),
                        address.clone(),
                        Arc::clone(endpoint),
                    );
                    proxies.insert(key, Arc::clone(&proxy));
                    return InboundResolution::Registered(proxy);
                };

                let (outcome, replaced) = existing.duel_inbound(endpoint, after_tie);
                match outcome {
                    CollisionOutcome::NewWins => {
                        let proxy = RemoteNodeProxy::inbound(
                            Arc::clone(ctx),
                            address.clone(),
                            Arc::clone(endpoint),
                        );
                        proxies.insert(key.clone(), Arc::clone(&proxy));
                        (Some(InboundResolution::Registered(proxy)), None, Some(existing))
                    }
                    CollisionOutcome::NewWinsProxyReused => {
                        (Some(InboundResolution::Reused(existing)), replaced, None)
                    }
                    CollisionOutcome::ExistingWins => {
                        (Some(InboundResolution::Rejected), None, None)
                    }
                    CollisionOutcome::Tie => (None, None, None),
                }
            };

            if let Some(endpoint) = replaced {
                endpoint.close();
            }
            if let Some(loser) = loser {
                loser.destroy("replaced by inbound connection");
            }
            match resolution {
                Some(resolution) => return resolution,
                None => {
                    thread::sleep(collision::tie_jitter());
                    if ctx.is_shutting_down() {
                        return InboundResolution::Rejected;
                    }
                    after_tie = true;
                }
            }
        }
    }
}
