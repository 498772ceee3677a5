//! Per-sandbox lock registry.
//!
//! Holding a sandbox's mutex is a precondition for any operation that
//! transitions sandbox state (ensure_running, extend_ttl, stop, delete, GC
//! tasks). The registry hands out handles on demand, counts outstanding
//! holders, and removes the entry when the last holder drops. The database
//! row lock is the outer fence for multi-process deployments; this is the
//! tight inner lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as RegistryMutex;
use tokio::sync::{Mutex, MutexGuard};

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    holders: usize,
}

#[derive(Default)]
pub struct LockRegistry {
    entries: RegistryMutex<HashMap<String, LockEntry>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hands out a handle to the sandbox's mutex, creating the entry on
    /// demand. Lock with [`LockHandle::lock`]; the entry is reclaimed when
    /// the last outstanding handle drops.
    pub fn handle(self: &Arc<Self>, sandbox_id: &str) -> LockHandle {
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(sandbox_id.to_string())
                .or_insert_with(|| LockEntry {
                    mutex: Arc::new(Mutex::new(())),
                    holders: 0,
                });
            entry.holders += 1;
            Arc::clone(&entry.mutex)
        };

        LockHandle {
            registry: Arc::clone(self),
            sandbox_id: sandbox_id.to_string(),
            mutex,
        }
    }

    /// Number of sandboxes with outstanding handles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, sandbox_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(sandbox_id) {
            entry.holders -= 1;
            if entry.holders == 0 {
                entries.remove(sandbox_id);
            }
        }
    }
}

/// A counted reference to one sandbox's mutex.
pub struct LockHandle {
    registry: Arc<LockRegistry>,
    sandbox_id: String,
    mutex: Arc<Mutex<()>>,
}

impl LockHandle {
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.registry.release(&self.sandbox_id);
    }
}
