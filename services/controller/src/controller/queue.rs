//! Deduplicating work queue keyed by cluster identity.
//!
//! A key is either waiting, being processed, or both (re-added while a pass
//! runs). A key that is being processed is never handed to a second worker;
//! when its pass finishes, a pending re-add puts it back in line. Any number
//! of adds before a worker picks the key up collapse into one pass.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

/// Cancellation flag for one pass. Checked between mutations.
#[derive(Debug, Clone, Default)]
pub struct PassToken(Arc<AtomicBool>);

impl PassToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Inner<K> {
    queue: VecDeque<K>,
    /// Keys waiting for a pass.
    dirty: BTreeSet<K>,
    /// Keys with a pass in flight.
    processing: BTreeMap<K, PassToken>,
    shutdown: bool,
}

pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K: Ord + Clone> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: BTreeSet::new(),
                processing: BTreeMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing a pass.
    pub fn add(&self, key: K) {
        let mut inner = self.lock();
        if inner.shutdown || !inner.dirty.insert(key.clone()) {
            return;
        }
        if !inner.processing.contains_key(&key) {
            inner.queue.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<(K, PassToken)> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.shutdown {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    let token = PassToken::new();
                    inner.processing.insert(key.clone(), token.clone());
                    return Some((key, token));
                }
            }

            notified.await;
        }
    }

    /// Finish the pass for `key`; requeues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutdown {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Cancel the in-flight pass for `key`, if any.
    pub fn cancel(&self, key: &K) -> bool {
        let inner = self.lock();
        match inner.processing.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord + Clone + Send + 'static> WorkQueue<K> {
    /// Add `key` after `delay`.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        let (first, _) = queue.get().await.unwrap();
        let (second, _) = queue.get().await.unwrap();
        assert_eq!((first, second), ("a", "b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.add("a");
        let (key, _) = queue.get().await.unwrap();

        // Re-added during its pass: held back until done.
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        let (again, _) = queue.get().await.unwrap();
        assert_eq!(again, "a");
        queue.done(&again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_flags_in_flight_pass() {
        let queue = WorkQueue::new();
        queue.add("a");
        let (key, token) = queue.get().await.unwrap();

        assert!(queue.cancel(&key));
        assert!(token.is_cancelled());
        assert!(!queue.cancel(&"b"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let queue = Arc::new(WorkQueue::<String>::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_get_wakes_on_add() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await.map(|(k, _)| k) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add(7u32);

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn test_add_after_delays() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after("a", Duration::from_millis(20));
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.len(), 1);
    }
}
