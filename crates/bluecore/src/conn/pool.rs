//! Fixed-size connection pool
//!
//! Slots are claimed by a compare-and-swap of their reference count from 0
//! to 1 and recycled when the count drops back to 0. Handles carry the slot
//! generation so a stale [`ConnId`] never resolves to a recycled slot.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

use super::Connection;
use crate::error::{Error, Result};

/// Reference count value held while a slot is being reset
const RELEASING: usize = usize::MAX;

/// Generational handle of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId {
    pub index: u16,
    pub generation: u32,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.generation)
    }
}

struct Slot {
    refs: AtomicUsize,
    generation: AtomicU32,
    conn: Mutex<Connection>,
}

struct PoolInner {
    slots: Vec<Slot>,
    recycled: Mutex<Vec<ConnId>>,
}

impl PoolInner {
    fn slot(&self, id: ConnId) -> &Slot {
        &self.slots[id.index as usize]
    }

    /// Take an extra reference if the slot is live and still `id`
    fn upgrade(self: &Arc<Self>, id: ConnId) -> Option<ConnRef> {
        let slot = self.slots.get(id.index as usize)?;
        let mut current = slot.refs.load(Ordering::Acquire);
        loop {
            if current == 0 || current == RELEASING {
                return None;
            }
            if slot.generation.load(Ordering::Acquire) != id.generation {
                return None;
            }
            match slot.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // The slot may have been recycled and claimed again between the
        // generation check and the increment.
        let generation = slot.generation.load(Ordering::Acquire);
        if generation != id.generation {
            self.release(ConnId {
                index: id.index,
                generation,
            });
            return None;
        }
        Some(ConnRef {
            pool: Arc::clone(self),
            id,
        })
    }

    fn release(&self, id: ConnId) {
        let slot = self.slot(id);
        let mut current = slot.refs.load(Ordering::Acquire);
        loop {
            debug_assert!(current != 0 && current != RELEASING, "unref of a free slot");
            if current == 1 {
                match slot.refs.compare_exchange_weak(
                    1,
                    RELEASING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            } else {
                match slot.refs.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => current = actual,
                }
            }
        }

        // Last reference: reset the slot, then hand it back.
        *slot.conn.lock().unwrap_or_else(PoisonError::into_inner) = Connection::default();
        slot.generation.fetch_add(1, Ordering::AcqRel);
        slot.refs.store(0, Ordering::Release);
        trace!("{} recycled", id);
        self.recycled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }
}

/// Connection pool shared by the host and the handles it gives out
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl ConnPool {
    pub fn new(size: usize) -> Self {
        let slots = (0..size)
            .map(|_| Slot {
                refs: AtomicUsize::new(0),
                generation: AtomicU32::new(0),
                conn: Mutex::new(Connection::default()),
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                slots,
                recycled: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Claim a free slot. The returned reference is the only one.
    pub fn allocate(&self) -> Result<ConnRef> {
        for (index, slot) in self.inner.slots.iter().enumerate() {
            if slot
                .refs
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let id = ConnId {
                    index: index as u16,
                    generation: slot.generation.load(Ordering::Acquire),
                };
                trace!("{} allocated", id);
                return Ok(ConnRef {
                    pool: Arc::clone(&self.inner),
                    id,
                });
            }
        }
        Err(Error::ResourceExhausted("connection"))
    }

    /// Resolve a handle to a new reference, if the connection still exists
    pub fn get(&self, id: ConnId) -> Option<ConnRef> {
        self.inner.upgrade(id)
    }

    /// References to every live connection
    pub fn live(&self) -> Vec<ConnRef> {
        (0..self.inner.slots.len())
            .filter_map(|index| {
                let slot = &self.inner.slots[index];
                let id = ConnId {
                    index: index as u16,
                    generation: slot.generation.load(Ordering::Acquire),
                };
                self.inner.upgrade(id)
            })
            .collect()
    }

    /// First live connection matching `pred`
    pub fn find(&self, mut pred: impl FnMut(&Connection) -> bool) -> Option<ConnRef> {
        self.live().into_iter().find(|conn| pred(&conn.lock()))
    }

    /// Number of slots currently in use
    pub fn in_use(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.refs.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Slots recycled since the last call
    pub fn take_recycled(&self) -> Vec<ConnId> {
        std::mem::take(
            &mut *self
                .inner
                .recycled
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Counted reference to a pooled connection.
///
/// Cloning takes a reference, dropping releases it; the last drop recycles
/// the slot. Never drop a reference while holding the guard returned by
/// [`ConnRef::lock`] for the same connection.
pub struct ConnRef {
    pool: Arc<PoolInner>,
    id: ConnId,
}

impl ConnRef {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Lock the connection data
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.pool
            .slot(self.id)
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current reference count
    pub fn ref_count(&self) -> usize {
        self.pool.slot(self.id).refs.load(Ordering::Acquire)
    }
}

impl Clone for ConnRef {
    fn clone(&self) -> Self {
        let prev = self.pool.slot(self.id).refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev != 0 && prev != RELEASING, "ref of a free slot");
        Self {
            pool: Arc::clone(&self.pool),
            id: self.id,
        }
    }
}

impl Drop for ConnRef {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

impl PartialEq for ConnRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.pool, &other.pool)
    }
}

impl fmt::Debug for ConnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnRef({})", self.id)
    }
}
