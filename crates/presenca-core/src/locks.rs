//! Per-student async locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Lazily created async mutex per key. An entry lives only while someone
/// holds or waits for it.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.entry(key.to_string()).or_default().clone()
        };
        let held = entry.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            held: Some(held),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Releases the key on drop, on every exit path.
pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut entries = self.locks.entries.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map's own reference left: nobody holds or waits.
        if entries.get(&self.key).is_some_and(|e| Arc::strong_count(e) == 1) {
            entries.remove(&self.key);
        }
    }
}
