//! Bounded event queue of a CS104 redundancy group.
//!
//! Entries stay in the queue after they are handed to a connection and are
//! only removed once the peer acknowledges the I-frame that carried them.
//! Entries of a connection that goes away are put back in front so the next
//! active connection sends them again.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::Asdu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Sent,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    asdu: Asdu,
    state: EntryState,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    next_id: u64,
}

/// Shared queue of spontaneous and periodic ASDUs.
#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an ASDU. When the queue is full the oldest entry is dropped.
    pub fn enqueue(&self, asdu: Asdu) {
        {
            let mut inner = self.lock();
            if inner.entries.len() >= self.capacity {
                if let Some(dropped) = inner.entries.pop_front() {
                    warn!(
                        id = dropped.id,
                        type_id = %dropped.asdu.type_id(),
                        "event queue full, dropping oldest entry"
                    );
                }
            }
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            inner.entries.push_back(Entry {
                id,
                asdu,
                state: EntryState::Waiting,
            });
        }
        self.notify.notify_one();
    }

    /// Oldest entry not yet handed to a connection. The entry is marked sent.
    pub fn take_next(&self) -> Option<(u64, Asdu)> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.state == EntryState::Waiting)?;
        entry.state = EntryState::Sent;
        Some((entry.id, entry.asdu.clone()))
    }

    /// Remove entries acknowledged by the peer.
    pub fn confirm(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.entries.retain(|e| !ids.contains(&e.id));
    }

    /// Mark sent but unconfirmed entries as waiting again.
    pub fn requeue(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            for entry in inner.entries.iter_mut().filter(|e| ids.contains(&e.id)) {
                entry.state = EntryState::Waiting;
            }
        }
        debug!(count = ids.len(), "requeued unconfirmed events");
        self.notify.notify_one();
    }

    /// Wait until an entry may be available.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Wake a waiting connection task.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Number of queued entries (sent or waiting).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True if no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if some entry is waiting to be sent.
    pub fn has_waiting(&self) -> bool {
        self.lock()
            .entries
            .iter()
            .any(|e| e.state == EntryState::Waiting)
    }
}
