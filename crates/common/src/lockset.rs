use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/**
 * LockSet
 * =======
 * An async map of per-key exclusive locks. `acquire` installs a handle
 *  for the key or waits for the current holder to release; release
 *  removes the map entry and wakes all waiters, who race to install
 *  next (no fairness guarantee). `acquire_all` sorts its keys first,
 *  so any code path that needs several keys at once takes them in one
 *  fixed global order and cannot deadlock against another such path.
 */
pub struct LockSet<K> {
    entries: Mutex<HashMap<K, Arc<Notify>>>,
}

impl<K> Default for LockSet<K>
where
    K: Eq + Hash + Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LockSet<K>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the exclusive lock for `key`, waiting for any current
    /// holder. The lock is held until the returned handle is dropped.
    pub async fn acquire(&self, key: K) -> LockHandle<'_, K> {
        loop {
            let holder = {
                let mut entries = self.entries.lock();
                match entries.get(&key) {
                    None => {
                        let notify = Arc::new(Notify::new());
                        entries.insert(key.clone(), notify);
                        return LockHandle { set: self, key };
                    }
                    Some(holder) => holder.clone(),
                }
            };

            let notified = holder.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // The holder may have released between dropping the map
            // lock and enabling the waiter; only wait while the same
            // entry is still installed.
            let still_held = {
                let entries = self.entries.lock();
                matches!(entries.get(&key), Some(current) if Arc::ptr_eq(current, &holder))
            };
            if still_held {
                notified.await;
            }
        }
    }

    /// Acquire a set of keys in sorted order (duplicates collapsed).
    /// The handles may be dropped in any order.
    pub async fn acquire_all<I>(&self, keys: I) -> Vec<LockHandle<'_, K>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut keys: Vec<K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            handles.push(self.acquire(key).await);
        }
        handles
    }

    fn release(&self, key: &K) {
        let holder = self.entries.lock().remove(key);
        if let Some(holder) = holder {
            holder.notify_waiters();
        }
    }
}

/// Holds the lock for one key; releases on drop.
pub struct LockHandle<'a, K>
where
    K: Eq + Hash + Ord + Clone,
{
    set: &'a LockSet<K>,
    key: K,
}

impl<K> LockHandle<'_, K>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for LockHandle<'_, K>
where
    K: Eq + Hash + Ord + Clone,
{
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}
