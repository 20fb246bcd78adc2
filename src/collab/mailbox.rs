//! Blocking double-ended mailbox used for outbound command buffering.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PopError {
    #[error("timed out waiting for an item")]
    Timeout,
    #[error("wait interrupted")]
    Interrupted,
}

#[derive(Debug)]
struct MailboxState<T> {
    items: VecDeque<T>,
    generation: u64,
}

/// FIFO queue with head insertion for urgent items.
///
/// Waiters blocked in [`MessageQueue::pop_timeout`] return
/// [`PopError::Interrupted`] once [`MessageQueue::interrupt`] is called after
/// they started waiting. The lock is only held for the duration of a single
/// queue operation.
#[derive(Debug)]
pub struct MessageQueue<T> {
    state: Mutex<MailboxState<T>>,
    available: Condvar,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState {
                items: VecDeque::new(),
                generation: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn push_back(&self, item: T) {
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
    }

    pub fn push_front(&self, item: T) {
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        state.items.push_front(item);
        drop(state);
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state
            .lock()
            .expect("mailbox lock poisoned")
            .items
            .pop_front()
    }

    /// Block until an item is available, the timeout elapses, or the queue
    /// is interrupted. `None` waits without a deadline.
    pub fn pop_timeout(&self, timeout: Option<Duration>) -> Result<T, PopError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        let generation = state.generation;
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.generation != generation {
                return Err(PopError::Interrupted);
            }
            match deadline {
                None => {
                    state = self
                        .available
                        .wait(state)
                        .expect("mailbox lock poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PopError::Timeout);
                    }
                    let (next, _) = self
                        .available
                        .wait_timeout(state, deadline - now)
                        .expect("mailbox lock poisoned");
                    state = next;
                }
            }
        }
    }

    /// Wake every current waiter without handing it an item.
    pub fn interrupt(&self) {
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        state.generation = state.generation.wrapping_add(1);
        drop(state);
        self.available.notify_all();
    }

    /// Remove the first item matching `pred`.
    pub fn remove_first(&self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        let index = state.items.iter().position(|item| pred(item))?;
        state.items.remove(index)
    }

    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        state.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("mailbox lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
