//! Bounded in-memory work queue.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;

use super::{CriticalAlert, QueueManager};
use crate::collab::RemoteNodeProxy;
use crate::core::{
    Command, CommandKind, NodeAddress, NodeMetadata, QueueItem, QueueStatus,
    SynchronizationRequest, SynchronizationResponse, TransferRequest, TransferResponse,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub kind: CommandKind,
    pub target: NodeAddress,
    pub success: bool,
}

/// Everything the collaboration layer told this queue, in arrival order.
#[derive(Clone, Debug, Default)]
pub struct QueueEvents {
    pub deliveries: Vec<DeliveryRecord>,
    pub links_lost: Vec<NodeAddress>,
    pub synchronized_with: Vec<NodeAddress>,
    pub alerts: Vec<CriticalAlert>,
    /// Item ids each peer reported during synchronization.
    pub peer_items: BTreeMap<NodeAddress, Vec<String>>,
}

impl QueueEvents {
    pub fn deliveries_of(&self, kind: CommandKind) -> impl Iterator<Item = &DeliveryRecord> {
        self.deliveries.iter().filter(move |record| record.kind == kind)
    }
}

#[derive(Debug)]
struct InFlight {
    peer: NodeAddress,
    item: QueueItem,
}

#[derive(Debug, Default)]
struct MemoryState {
    items: VecDeque<QueueItem>,
    in_flight: HashMap<u64, InFlight>,
    next_request_id: u64,
    events: QueueEvents,
}

/// A [`QueueManager`] that keeps items in memory and hands them to peers on
/// request. Items whose transfer fails or is refused return to the head of
/// the queue.
#[derive(Debug)]
pub struct MemoryQueue {
    max_len: usize,
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Returns `false` when the queue is full.
    pub fn push(&self, item: QueueItem) -> bool {
        let mut state = self.state.lock().expect("memory queue lock poisoned");
        if state.items.len() >= self.max_len {
            return false;
        }
        state.items.push_back(item);
        true
    }

    pub fn pop(&self) -> Option<QueueItem> {
        self.state
            .lock()
            .expect("memory queue lock poisoned")
            .items
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("memory queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item_ids(&self) -> Vec<String> {
        let state = self.state.lock().expect("memory queue lock poisoned");
        state.items.iter().map(|item| item.id.clone()).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .expect("memory queue lock poisoned")
            .in_flight
            .len()
    }

    /// Take the head item and wrap it in a transfer request for `target`.
    pub fn begin_transfer(&self, target: &NodeAddress) -> Option<Command> {
        let mut state = self.state.lock().expect("memory queue lock poisoned");
        let item = state.items.pop_front()?;
        state.next_request_id += 1;
        let request_id = state.next_request_id;
        state.in_flight.insert(
            request_id,
            InFlight {
                peer: target.clone(),
                item: item.clone(),
            },
        );
        Some(Command::TransferRequest {
            target: target.clone(),
            request: TransferRequest { request_id, item },
        })
    }

    pub fn events(&self) -> QueueEvents {
        self.state
            .lock()
            .expect("memory queue lock poisoned")
            .events
            .clone()
    }

    fn status(&self, state: &MemoryState) -> QueueStatus {
        QueueStatus {
            queue_length: state.items.len() as u64,
            max_queue_length: self.max_len as u64,
            blocked: state.items.len() >= self.max_len,
        }
    }

    fn item_list(state: &MemoryState) -> Bytes {
        let ids = state
            .items
            .iter()
            .map(|item| item.id.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Bytes::from(ids)
    }

    fn record_peer_items(state: &mut MemoryState, peer: &RemoteNodeProxy, payload: &[u8]) {
        let Some(addr) = peer.address() else {
            return;
        };
        let ids = String::from_utf8_lossy(payload)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        state.events.peer_items.insert(addr.clone(), ids);
        state.events.synchronized_with.push(addr);
    }

    fn requeue(state: &mut MemoryState, request_id: u64) {
        if let Some(in_flight) = state.in_flight.remove(&request_id) {
            state.items.push_front(in_flight.item);
        }
    }
}

impl QueueManager for MemoryQueue {
    fn local_status_snapshot(&self) -> NodeMetadata {
        let state = self.state.lock().expect("memory queue lock poisoned");
        NodeMetadata::piggy_backed(self.status(&state))
    }

    fn initiate_synchronization(&self, _peer: &RemoteNodeProxy) -> SynchronizationRequest {
        let state = self.state.lock().expect("memory queue lock poisoned");
        SynchronizationRequest {
            payload: Self::item_list(&state),
        }
    }

    fn handle_synchronization_request(
        &self,
        peer: &RemoteNodeProxy,
        request: SynchronizationRequest,
    ) -> SynchronizationResponse {
        let mut state = self.state.lock().expect("memory queue lock poisoned");
        Self::record_peer_items(&mut state, peer, &request.payload);
        SynchronizationResponse {
            payload: Self::item_list(&state),
        }
    }

    fn handle_synchronization_response(
        &self,
        peer: &RemoteNodeProxy,
        response: SynchronizationResponse,
    ) {
        let mut state = self.state.lock().expect("memory queue lock poisoned");
        Self::record_peer_items(&mut state, peer, &response.payload);
    }

    fn on_command_delivery_outcome(&self, command: &Command, success: bool) {
        let mut state = self.state.lock().expect("memory queue lock poisoned");
        if !success && let Command::TransferRequest { request, .. } = command {
            Self::requeue(&mut state, request.request_id);
        }
        state.events.deliveries.push(DeliveryRecord {
            kind: command.kind(),
            target: command.target().clone(),
            success,
        });
    }

    fn on_link_lost(&self, peer: &RemoteNodeProxy) {
        let Some(addr) = peer.address() else {
            return;
        };
        let mut state = self.state.lock().expect("memory queue lock poisoned");
        let orphaned = state
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.peer == addr)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for request_id in orphaned {
            Self::requeue(&mut state, request_id);
        }
        state.events.links_lost.push(addr);
    }

    fn handle_transfer_request(
        &self,
        _peer: &RemoteNodeProxy,
        request: TransferRequest,
    ) -> TransferResponse {
        let mut state = self.state.lock().expect("memory queue lock poisoned");
        let accepted = state.items.len() < self.max_len;
        if accepted {
            state.items.push_back(request.item);
        }
        TransferResponse {
            request_id: request.request_id,
            accepted,
            status: None,
        }
    }

    fn handle_transfer_response(&self, _peer: &RemoteNodeProxy, response: TransferResponse) {
        let mut state = self.state.lock().expect("memory queue lock poisoned");
        if response.accepted {
            state.in_flight.remove(&response.request_id);
        } else {
            Self::requeue(&mut state, response.request_id);
        }
    }

    fn on_critical(&self, alert: &CriticalAlert) {
        tracing::error!("collaboration critical: {alert}");
        self.state
            .lock()
            .expect("memory queue lock poisoned")
            .events
            .alerts
            .push(alert.clone());
    }
}
