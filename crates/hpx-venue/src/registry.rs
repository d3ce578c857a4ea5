//! Correlation registry: one cohesive store of pending waits and delivered
//! replies, keyed by [`CorrelationId`].
//!
//! Every compound operation (register-then-check, deliver-then-signal,
//! remove-then-close) runs under the per-key lock of `scc::HashMap`, so a
//! delivery and a cancellation for the same id can never interleave: the
//! first one to take the entry wins and the other sees a consistent state.
//!
//! The lock is never held across an `.await`. Waiters park on a
//! [`tokio::sync::Notify`] stored next to the entry; each wait handle also
//! carries a one-time [`Closure`] so the first of {cancel, connection loss}
//! decides the outcome and later signals are no-ops.

use std::{
    collections::VecDeque,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use scc::hash_map::Entry;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::{
    error::{VenueError, VenueResult},
    id::CorrelationId,
    message::Reply,
};

/// Sentinel a wait resolves with when no real answer will come.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Closure {
    /// Released by an explicit cancellation.
    Cancelled,
    /// The session carrying the exchange was torn down.
    ConnectionLost(String),
}

impl Closure {
    /// Map the sentinel onto the public error taxonomy.
    pub fn into_error(self, id: CorrelationId) -> VenueError {
        match self {
            Self::Cancelled => VenueError::Cancelled { id },
            Self::ConnectionLost(reason) => VenueError::ConnectionLost { reason },
        }
    }
}

/// How a registered wait consumes deliveries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// One reply, then the entry is removed.
    OneShot,
    /// Repeated pushes until cancelled.
    Stream,
}

/// Outcome of [`CorrelationRegistry::deliver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A registered wait was signalled.
    Signaled,
    /// No wait was registered; the reply is parked for a late registration.
    Stored,
}

#[derive(Debug, Default)]
struct Signal {
    notify: Notify,
    closure: OnceLock<Closure>,
}

impl Signal {
    fn wake(&self) {
        self.notify.notify_one();
    }

    /// Returns `false` when another closure already won.
    fn close(&self, closure: Closure) -> bool {
        let won = self.closure.set(closure).is_ok();
        if won {
            self.notify.notify_waiters();
            self.notify.notify_one();
        }
        won
    }
}

struct Slot {
    mode: WaitMode,
    signal: Option<Arc<Signal>>,
    inbox: VecDeque<Reply>,
    touched_at: Instant,
}

impl Slot {
    fn waiting(mode: WaitMode, signal: Arc<Signal>) -> Self {
        Self {
            mode,
            signal: Some(signal),
            inbox: VecDeque::new(),
            touched_at: Instant::now(),
        }
    }

    fn orphan(reply: Reply) -> Self {
        Self {
            mode: WaitMode::OneShot,
            signal: None,
            inbox: VecDeque::from([reply]),
            touched_at: Instant::now(),
        }
    }

    fn owned_by(&self, handle: &WaitHandle) -> bool {
        self.signal
            .as_ref()
            .is_some_and(|signal| Arc::ptr_eq(signal, &handle.signal))
    }
}

/// Token a caller awaits on for one correlation id.
#[derive(Clone, Debug)]
pub struct WaitHandle {
    id: CorrelationId,
    mode: WaitMode,
    signal: Arc<Signal>,
}

impl WaitHandle {
    /// Id this handle waits for.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Consumption mode of this handle.
    pub fn mode(&self) -> WaitMode {
        self.mode
    }

    /// The sentinel this handle was closed with, if any.
    pub fn closure(&self) -> Option<Closure> {
        self.signal.closure.get().cloned()
    }

    /// Whether a cancellation or connection loss already resolved this wait.
    pub fn is_closed(&self) -> bool {
        self.signal.closure.get().is_some()
    }
}

/// Default bound on undelivered replies kept per id.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Thread-safe map from correlation id to pending wait and delivered replies.
pub struct CorrelationRegistry {
    slots: scc::HashMap<CorrelationId, Slot>,
    inbox_capacity: usize,
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::with_inbox_capacity(DEFAULT_INBOX_CAPACITY)
    }
}

impl CorrelationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry keeping at most `capacity` unread replies per
    /// id. A full inbox drops its oldest reply to make room.
    pub fn with_inbox_capacity(capacity: usize) -> Self {
        Self {
            slots: scc::HashMap::new(),
            inbox_capacity: capacity.max(1),
        }
    }

    /// Register a wait for `id`.
    ///
    /// A reply that arrived before registration is picked up immediately.
    /// A second registration for an id that already has a wait fails with
    /// [`VenueError::DuplicateId`] and leaves the first wait untouched.
    pub fn register_wait(&self, id: CorrelationId, mode: WaitMode) -> VenueResult<WaitHandle> {
        let signal = Arc::new(Signal::default());

        match self.slots.entry_sync(id) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.signal.is_some() {
                    error!(%id, "correlation id registered twice");
                    return Err(VenueError::DuplicateId { id });
                }
                if !slot.inbox.is_empty() {
                    signal.wake();
                }
                slot.mode = mode;
                slot.signal = Some(Arc::clone(&signal));
                slot.touched_at = Instant::now();
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(Slot::waiting(mode, Arc::clone(&signal)));
            }
        }

        Ok(WaitHandle { id, mode, signal })
    }

    /// Store `reply` under its id and signal the registered wait, if any.
    ///
    /// When the inbox for the id is full the oldest unread reply is dropped.
    pub fn deliver(&self, reply: Reply) -> Delivery {
        let id = reply.id();
        match self.slots.entry_sync(id) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.touched_at = Instant::now();
                if slot.inbox.len() >= self.inbox_capacity {
                    slot.inbox.pop_front();
                    warn!(%id, capacity = self.inbox_capacity, "Inbox full, dropping oldest reply");
                }
                slot.inbox.push_back(reply);
                match &slot.signal {
                    Some(signal) => {
                        signal.wake();
                        Delivery::Signaled
                    }
                    None => Delivery::Stored,
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(Slot::orphan(reply));
                Delivery::Stored
            }
        }
    }

    /// Await the next reply for `handle`.
    ///
    /// One-shot handles remove their entry when the reply is taken. Resolves
    /// with [`VenueError::Cancelled`] or [`VenueError::ConnectionLost`] once
    /// the handle is closed and nothing is left to read.
    pub async fn wait(&self, handle: &WaitHandle) -> VenueResult<Reply> {
        loop {
            if let Some(reply) = self.pop_for(handle) {
                return Ok(reply);
            }
            if let Some(closure) = handle.closure() {
                return Err(closure.into_error(handle.id));
            }
            handle.signal.notify.notified().await;
        }
    }

    /// Blocking consumption by id.
    ///
    /// Waits on the registered handle if there is one; otherwise behaves like
    /// [`Self::try_take`].
    pub async fn take(&self, id: CorrelationId) -> VenueResult<Reply> {
        let handle = self.slots.read_sync(&id, |_, slot| {
            slot.signal.as_ref().map(|signal| WaitHandle {
                id,
                mode: slot.mode,
                signal: Arc::clone(signal),
            })
        });

        match handle.flatten() {
            Some(handle) => self.wait(&handle).await,
            None => self.try_take(id),
        }
    }

    /// Non-blocking consumption by id.
    pub fn try_take(&self, id: CorrelationId) -> VenueResult<Reply> {
        let removed = self
            .slots
            .remove_if_sync(&id, |slot| slot.mode == WaitMode::OneShot && !slot.inbox.is_empty());
        if let Some((_, mut slot)) = removed {
            return slot
                .inbox
                .pop_front()
                .ok_or(VenueError::NotYetDelivered { id });
        }

        self.slots
            .update_sync(&id, |_, slot| slot.inbox.pop_front())
            .flatten()
            .ok_or(VenueError::NotYetDelivered { id })
    }

    /// Close the wait for `id` with [`Closure::Cancelled`] and drop its entry.
    ///
    /// Returns `true` if anything was registered or stored for `id`.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        match self.slots.remove_sync(&id) {
            Some((_, slot)) => {
                if let Some(signal) = slot.signal {
                    signal.close(Closure::Cancelled);
                }
                debug!(%id, "correlation entry cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether `id` has a wait that is still open.
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.slots
            .read_sync(&id, |_, slot| {
                slot.signal
                    .as_ref()
                    .is_some_and(|signal| signal.closure.get().is_none())
            })
            .unwrap_or(false)
    }

    /// Resolve every entry with [`Closure::ConnectionLost`] and clear the map.
    ///
    /// Returns the number of waits that were resolved.
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut ids = Vec::new();
        self.slots.retain_sync(|id, _| {
            ids.push(*id);
            true
        });

        let mut resolved = 0;
        for id in ids {
            if let Some((_, slot)) = self.slots.remove_sync(&id)
                && let Some(signal) = slot.signal
                && signal.close(Closure::ConnectionLost(reason.to_string()))
            {
                resolved += 1;
            }
        }
        resolved
    }

    /// Drop replies nobody registered for within `ttl`.
    pub fn sweep_orphans(&self, ttl: Duration) -> usize {
        let mut swept = 0;
        self.slots.retain_sync(|_, slot| {
            let keep = slot.signal.is_some() || slot.touched_at.elapsed() < ttl;
            if !keep {
                swept += 1;
            }
            keep
        });
        swept
    }

    /// Whether anything is registered or stored for `id`.
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.slots.contains_sync(&id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn pop_for(&self, handle: &WaitHandle) -> Option<Reply> {
        match handle.mode {
            WaitMode::OneShot => self
                .slots
                .remove_if_sync(&handle.id, |slot| {
                    slot.owned_by(handle) && !slot.inbox.is_empty()
                })
                .and_then(|(_, mut slot)| slot.inbox.pop_front()),
            WaitMode::Stream => self
                .slots
                .update_sync(&handle.id, |_, slot| {
                    if slot.owned_by(handle) {
                        slot.inbox.pop_front()
                    } else {
                        None
                    }
                })
                .flatten(),
        }
    }
}
