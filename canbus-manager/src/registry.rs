//! Owns the set of clients. A single `std::sync::Mutex` serialises
//! every mutation; it is never held across adapter I/O or across a
//! user callback invocation (see `dispatcher.rs`).
//!
//! Handles are `(index, id)` pairs rather than raw pointers: `index`
//! locates a slot for O(1) lookup, `id` is the process-wide
//! monotonically increasing identifier assigned at `register` and is
//! compared against the slot's current occupant to detect both
//! never-issued and stale (unregistered, slot recycled) handles
//! without ambiguity.

use canbus_api::{ClientMode, Error, Frame, Result};
use std::sync::{Arc, Mutex};

/// Invoked by the dispatcher with the registry mutex released. A
/// callback that needs to mutate the registry (e.g. unregister
/// itself) must defer that call -- `spawn` it -- rather than call
/// back in synchronously; the mutex is a plain, non-reentrant
/// `std::sync::Mutex`.
pub type Callback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// A client's declared acceptance-filter intent. Recorded as metadata
/// only -- the dispatcher never consults it; per-client filtering is
/// out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterIntent {
    pub id_filter: u32,
    pub id_mask: u32,
    pub extended_only: bool,
}

/// Opaque, stable identifier for a client record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    id: u64,
}

impl Handle {
    /// The monotonically increasing identifier assigned at
    /// `register`. Exposed for diagnostics (`status`, logging); not
    /// meant to be parsed or relied on for anything but ordering and
    /// uniqueness.
    pub fn diagnostic_id(&self) -> u64 {
        self.id
    }
}

pub(crate) struct ClientRecord {
    pub registered: bool,
    pub activated: bool,
    pub pending_delete: bool,
    pub mode: ClientMode,
    pub callback: Option<Callback>,
    pub filter: Option<FilterIntent>,
}

enum Slot {
    Empty,
    Occupied { id: u64, record: Arc<Mutex<ClientRecord>> },
}

struct Inner {
    slots: Vec<Slot>,
    free_indices: Vec<u32>,
    pending_free: Vec<Arc<Mutex<ClientRecord>>>,
    next_id: u64,
    registered_total: u32,
    activated_total: u32,
    activated_tx_total: u32,
}

impl Inner {
    fn find(&self, handle: Handle) -> Option<Arc<Mutex<ClientRecord>>> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied { id, record }) if *id == handle.id => {
                Some(record.clone())
            }
            _ => None,
        }
    }
}

/// Snapshot counters; the authoritative input to the bus state
/// engine. Scanning the active set is never required to compute
/// these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub registered_total: u32,
    pub activated_total: u32,
    pub activated_tx_total: u32,
}

/// Returned by every mutating registry operation so the caller (the
/// manager's API surface) can decide whether to invoke the state
/// engine without re-reading the registry.
#[derive(Debug, Clone, Copy)]
pub struct MutationOutcome {
    pub counters: Counters,
    pub engine_pass_needed: bool,
}

/// One entry the dispatcher will invoke for a single received frame.
/// `_keep_alive` is the refcount: as long as a snapshot holds this
/// clone, `reclaim` will not drop the record's storage even if it has
/// since been unregistered.
pub(crate) struct Snapshot {
    pub id: u64,
    pub callback: Callback,
    _keep_alive: Arc<Mutex<ClientRecord>>,
}

pub struct Registry {
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free_indices: Vec::new(),
                pending_free: Vec::new(),
                next_id: 1,
                registered_total: 0,
                activated_total: 0,
                activated_tx_total: 0,
            }),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> Counters {
        let inner = self.inner.lock().unwrap();
        Counters {
            registered_total: inner.registered_total,
            activated_total: inner.activated_total,
            activated_tx_total: inner.activated_tx_total,
        }
    }

    /// Allocates a record, assigns the next identifier, and adds it
    /// to the active set. Never touches bus state.
    pub fn register(&self, mode: ClientMode) -> Result<Handle> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id = inner.next_id.checked_add(1).ok_or(Error::AllocError)?;

        let record = Arc::new(Mutex::new(ClientRecord {
            registered: true,
            activated: false,
            pending_delete: false,
            mode,
            callback: None,
            filter: None,
        }));

        let index = if let Some(index) = inner.free_indices.pop() {
            inner.slots[index as usize] = Slot::Occupied { id, record };
            index
        } else {
            let index = inner.slots.len() as u32;
            inner.slots.push(Slot::Occupied { id, record });
            index
        };

        inner.registered_total += 1;

        Ok(Handle { index, id })
    }

    pub fn is_registered(&self, handle: Handle) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(
            inner.find(handle).map(|r| r.lock().unwrap().registered),
            Some(true)
        )
    }

    pub fn activate(&self, handle: Handle) -> Result<MutationOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.find(handle).ok_or(Error::InvalidHandle)?;
        let mut rec = record.lock().unwrap();

        if !rec.registered {
            return Err(Error::InvalidHandle);
        }

        let mut crossed = false;
        if !rec.activated {
            rec.activated = true;
            inner.activated_total += 1;
            if rec.mode == ClientMode::TxEnabled {
                inner.activated_tx_total += 1;
            }
            crossed = true;
        }
        drop(rec);

        Ok(MutationOutcome {
            counters: Counters {
                registered_total: inner.registered_total,
                activated_total: inner.activated_total,
                activated_tx_total: inner.activated_tx_total,
            },
            engine_pass_needed: crossed,
        })
    }

    pub fn deactivate(&self, handle: Handle) -> Result<MutationOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.find(handle).ok_or(Error::InvalidHandle)?;
        let mut rec = record.lock().unwrap();

        if !rec.registered {
            return Err(Error::InvalidHandle);
        }

        let mut crossed = false;
        if rec.activated {
            rec.activated = false;
            inner.activated_total -= 1;
            if rec.mode == ClientMode::TxEnabled {
                inner.activated_tx_total -= 1;
            }
            crossed = true;
        }
        drop(rec);

        Ok(MutationOutcome {
            counters: Counters {
                registered_total: inner.registered_total,
                activated_total: inner.activated_total,
                activated_tx_total: inner.activated_tx_total,
            },
            engine_pass_needed: crossed,
        })
    }

    pub fn set_mode(&self, handle: Handle, new_mode: ClientMode) -> Result<MutationOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.find(handle).ok_or(Error::InvalidHandle)?;
        let mut rec = record.lock().unwrap();

        if !rec.registered {
            return Err(Error::InvalidHandle);
        }

        if rec.mode == new_mode {
            drop(rec);
            return Ok(MutationOutcome {
                counters: Counters {
                    registered_total: inner.registered_total,
                    activated_total: inner.activated_total,
                    activated_tx_total: inner.activated_tx_total,
                },
                engine_pass_needed: false,
            });
        }

        if rec.activated
            && rec.mode == ClientMode::TxEnabled
            && new_mode == ClientMode::RxOnly
            && inner.activated_tx_total > 1
        {
            return Err(Error::ModeConflict);
        }

        let was_tx = rec.activated && rec.mode == ClientMode::TxEnabled;
        rec.mode = new_mode;
        let is_tx = rec.activated && rec.mode == ClientMode::TxEnabled;

        if was_tx && !is_tx {
            inner.activated_tx_total -= 1;
        } else if !was_tx && is_tx {
            inner.activated_tx_total += 1;
        }
        drop(rec);

        Ok(MutationOutcome {
            counters: Counters {
                registered_total: inner.registered_total,
                activated_total: inner.activated_total,
                activated_tx_total: inner.activated_tx_total,
            },
            engine_pass_needed: was_tx != is_tx,
        })
    }

    /// Infallible and idempotent: an already-invalid handle is simply
    /// a no-op with `engine_pass_needed: false`.
    pub fn unregister(&self, handle: Handle) -> MutationOutcome {
        let mut inner = self.inner.lock().unwrap();

        let record = match inner.find(handle) {
            Some(r) => r,
            None => {
                return MutationOutcome {
                    counters: Counters {
                        registered_total: inner.registered_total,
                        activated_total: inner.activated_total,
                        activated_tx_total: inner.activated_tx_total,
                    },
                    engine_pass_needed: false,
                }
            }
        };

        let mut crossed = false;
        {
            let mut rec = record.lock().unwrap();
            if !rec.registered {
                drop(rec);
                return MutationOutcome {
                    counters: Counters {
                        registered_total: inner.registered_total,
                        activated_total: inner.activated_total,
                        activated_tx_total: inner.activated_tx_total,
                    },
                    engine_pass_needed: false,
                };
            }

            if rec.activated {
                rec.activated = false;
                inner.activated_total -= 1;
                if rec.mode == ClientMode::TxEnabled {
                    inner.activated_tx_total -= 1;
                }
                crossed = true;
            }

            rec.registered = false;
            rec.pending_delete = true;
            rec.callback = None;
        }

        inner.registered_total -= 1;
        inner.slots[handle.index as usize] = Slot::Empty;
        inner.free_indices.push(handle.index);
        inner.pending_free.push(record);

        MutationOutcome {
            counters: Counters {
                registered_total: inner.registered_total,
                activated_total: inner.activated_total,
                activated_tx_total: inner.activated_tx_total,
            },
            engine_pass_needed: crossed,
        }
    }

    /// The client must be registered, activated, and TX_ENABLED.
    /// Does not touch bus state or the adapter.
    pub fn check_tx_permission(&self, handle: Handle) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let record = inner.find(handle).ok_or(Error::InvalidHandle)?;
        let rec = record.lock().unwrap();
        if rec.registered && rec.activated && rec.mode == ClientMode::TxEnabled {
            Ok(())
        } else {
            Err(Error::NotPermitted)
        }
    }

    pub fn set_rx_callback(&self, handle: Handle, callback: Option<Callback>) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let record = inner.find(handle).ok_or(Error::InvalidHandle)?;
        let mut rec = record.lock().unwrap();
        if !rec.registered {
            return Err(Error::InvalidHandle);
        }
        rec.callback = callback;
        Ok(())
    }

    pub fn set_filter(&self, handle: Handle, filter: Option<FilterIntent>) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let record = inner.find(handle).ok_or(Error::InvalidHandle)?;
        let mut rec = record.lock().unwrap();
        if !rec.registered {
            return Err(Error::InvalidHandle);
        }
        rec.filter = filter;
        Ok(())
    }

    /// Dispatcher step 4: walk the active set once and build a
    /// bounded-size snapshot of callbacks to invoke for one frame.
    /// Returns the snapshots plus a count of activated subscribers
    /// that didn't fit and were dropped for this frame.
    pub(crate) fn snapshot_for_dispatch(&self, capacity: usize) -> (Vec<Snapshot>, u32) {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(capacity);
        let mut dropped = 0u32;

        for slot in &inner.slots {
            if let Slot::Occupied { id, record } = slot {
                let rec = record.lock().unwrap();
                if rec.registered && rec.activated && !rec.pending_delete {
                    if let Some(callback) = rec.callback.clone() {
                        if out.len() < capacity {
                            out.push(Snapshot {
                                id: *id,
                                callback,
                                _keep_alive: record.clone(),
                            });
                        } else {
                            dropped += 1;
                        }
                    }
                }
            }
        }

        (out, dropped)
    }

    /// Dispatcher step 2: drop any pending-free record whose only
    /// remaining strong reference is the registry's own (i.e. no
    /// in-flight snapshot still holds a clone). Returns the number of
    /// records reclaimed, for diagnostics/tests.
    pub(crate) fn reclaim_pending(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.pending_free.len();
        inner
            .pending_free
            .retain(|record| Arc::strong_count(record) > 1);
        before - inner.pending_free.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_free_len(&self) -> usize {
        self.inner.lock().unwrap().pending_free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_unregister_round_trip() {
        let reg = Registry::new();
        let before = reg.counters();
        let h = reg.register(ClientMode::RxOnly).unwrap();
        assert_eq!(reg.counters().registered_total, before.registered_total + 1);
        reg.unregister(h);
        assert_eq!(reg.counters().registered_total, before.registered_total);
    }

    #[test]
    fn activate_is_idempotent() {
        let reg = Registry::new();
        let h = reg.register(ClientMode::TxEnabled).unwrap();
        let first = reg.activate(h).unwrap();
        let second = reg.activate(h).unwrap();
        assert_eq!(first.counters, second.counters);
        assert!(first.engine_pass_needed);
        assert!(!second.engine_pass_needed);
    }

    #[test]
    fn deactivate_is_idempotent() {
        let reg = Registry::new();
        let h = reg.register(ClientMode::RxOnly).unwrap();
        reg.activate(h).unwrap();
        let first = reg.deactivate(h).unwrap();
        let second = reg.deactivate(h).unwrap();
        assert_eq!(first.counters, second.counters);
        assert!(first.engine_pass_needed);
        assert!(!second.engine_pass_needed);
    }

    #[test]
    fn mode_conflict_leaves_state_unchanged() {
        let reg = Registry::new();
        let a = reg.register(ClientMode::TxEnabled).unwrap();
        reg.activate(a).unwrap();
        let b = reg.register(ClientMode::TxEnabled).unwrap();
        reg.activate(b).unwrap();

        let before = reg.counters();
        let result = reg.set_mode(b, ClientMode::RxOnly);
        assert_eq!(result.unwrap_err(), Error::ModeConflict);
        assert_eq!(reg.counters(), before);
    }

    #[test]
    fn stale_handle_after_unregister_is_invalid() {
        let reg = Registry::new();
        let h = reg.register(ClientMode::RxOnly).unwrap();
        reg.unregister(h);
        assert!(!reg.is_registered(h));
        assert_eq!(reg.activate(h).unwrap_err(), Error::InvalidHandle);
    }

    #[test]
    fn handle_reuse_never_aliases_a_new_client() {
        let reg = Registry::new();
        let a = reg.register(ClientMode::RxOnly).unwrap();
        reg.unregister(a);
        let b = reg.register(ClientMode::RxOnly).unwrap();

        // `b` may reuse `a`'s slot index, but never its identifier.
        assert_ne!(a.diagnostic_id(), b.diagnostic_id());
        assert!(!reg.is_registered(a));
        assert!(reg.is_registered(b));
    }

    #[test]
    fn identifiers_are_strictly_increasing() {
        let reg = Registry::new();
        let a = reg.register(ClientMode::RxOnly).unwrap();
        let b = reg.register(ClientMode::TxEnabled).unwrap();
        reg.unregister(a);
        let c = reg.register(ClientMode::RxOnly).unwrap();

        assert!(b.diagnostic_id() > a.diagnostic_id());
        assert!(c.diagnostic_id() > b.diagnostic_id());
    }

    #[test]
    fn pending_free_reclaimed_only_when_refcount_drops() {
        let reg = Registry::new();
        let h = reg.register(ClientMode::RxOnly).unwrap();
        reg.activate(h).unwrap();
        reg.set_rx_callback(h, Some(Arc::new(|_f| {}))).unwrap();

        let (snapshots, dropped) = reg.snapshot_for_dispatch(8);
        assert_eq!(dropped, 0);
        assert_eq!(snapshots.len(), 1);

        reg.unregister(h);
        assert_eq!(reg.reclaim_pending(), 0, "snapshot still holds a clone");

        drop(snapshots);
        assert_eq!(reg.reclaim_pending(), 1);
        assert_eq!(reg.pending_free_len(), 0);
    }
}
