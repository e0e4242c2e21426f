//! Auto-removing keyed async lock table.
//!
//! At most one task at a time holds the logical lock for a given key, while
//! the table stays proportional to currently contended keys: each entry
//! counts its waiters and is removed when the count reaches zero.
//!
//! The table itself is only ever locked for short critical sections; waiting
//! on a key happens outside it, on that key's own async mutex. Tokio's mutex
//! queues waiters fairly, so acquisitions on one key are granted in the
//! order their table registration completed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    waiters: u32,
}

type Table = Arc<Mutex<HashMap<String, Slot>>>;

/// Per-key mutual exclusion with reference-counted auto-removal.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    table: Table,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`.
    ///
    /// With `take == false` a no-op guard is returned immediately; the
    /// caller asserts the key is already serialized (replication apply).
    /// Otherwise the caller waits in FIFO order behind other holders.
    ///
    /// Cancelling the returned future while waiting still decrements the
    /// waiter count: the registration is taken before the await and its
    /// drop handler runs on the cancellation path.
    pub async fn acquire(&self, key: &str, take: bool) -> KeyGuard {
        if !take {
            return KeyGuard { held: None };
        }

        let mutex = {
            let mut table = self.table.lock();
            let slot = table.entry(key.to_string()).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                waiters: 0,
            });
            slot.waiters += 1;
            Arc::clone(&slot.mutex)
        };

        let registration = Registration {
            key: key.to_string(),
            table: Arc::clone(&self.table),
        };
        let guard = mutex.lock_owned().await;

        KeyGuard {
            held: Some(Held {
                _guard: guard,
                _registration: registration,
            }),
        }
    }

    /// Number of keys currently in the table (contended or held).
    pub fn contended(&self) -> usize {
        self.table.lock().len()
    }
}

/// Releases the key lock on drop.
pub struct KeyGuard {
    held: Option<Held>,
}

struct Held {
    // Field order matters: the mutex is released before the waiter count
    // is decremented, so a removed table entry can never hide a held lock.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}

impl KeyGuard {
    /// Whether this guard actually holds a lock.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

struct Registration {
    key: String,
    table: Table,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(slot) = table.get_mut(&self.key) {
            slot.waiters -= 1;
            if slot.waiters == 0 {
                table.remove(&self.key);
            }
        }
    }
}
