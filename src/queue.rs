//! A deduplicating, rate-limited work queue that drives a pool of reconcile workers.
//!
//! Keys are opaque strings (`namespace/name` or `name`). A key is held at most once in the pending
//! queue and is handed to at most one worker at a time; adding a key while it is being processed
//! only marks it dirty, and it is re-queued once the worker releases it.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use log::{debug, error, info, warn};
use tokio::{sync::Notify, task::JoinSet};

use crate::{Outcome, Result};

/// Per-key exponential backoff applied to failed keys.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl Backoff {
    /// Delay before the `failures`-th retry (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    waiting: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    backoff: Backoff,
    state: Mutex<State>,
    notify: Notify,
}

///
/// A work queue for one watched resource kind. Cloning yields another handle to the same queue.
///
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, Backoff::default())
    }

    pub fn with_backoff(name: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                backoff,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking worker must not wedge the whole queue.
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueues `key` unless it is already pending. A key that is currently being processed is
    /// delivered again after the running attempt finishes.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Re-enqueues `key` after its backoff delay. Only one delayed re-add is armed per key.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state();
            if state.shutting_down || !state.waiting.insert(key.clone()) {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            self.inner.backoff.delay(*failures)
        };
        debug!("[{}] requeueing `{key}` in {delay:?}", self.name());
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.state().waiting.remove(&key);
            queue.add(key);
        });
    }

    /// Clears the backoff state of `key`.
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten.
    pub fn failures(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be picked up.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next key and marks it as being processed. Returns `None` once the queue is
    /// shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Releases `key` after processing. If it was added again meanwhile it goes back to the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops handing out keys and wakes every idle worker so it can observe the stop.
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Runs `workers` tasks that feed keys to `reconcile` until [`WorkQueue::shutdown`] is called.
    /// Resolves once every worker has exited; in-flight reconciles are allowed to finish.
    pub async fn run<F, Fut>(&self, workers: usize, reconcile: F)
    where
        F: Fn(String) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for _ in 0..workers.max(1) {
            let queue = self.clone();
            let reconcile = reconcile.clone();
            tasks.spawn(async move { queue.worker(reconcile).await });
        }
        info!("[{}] started {} worker(s)", self.name(), workers.max(1));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("[{}] worker terminated abnormally: {e}", self.name());
            }
        }
        info!("[{}] all workers stopped", self.name());
    }

    async fn worker<F, Fut>(&self, reconcile: F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Outcome>>,
    {
        while let Some(key) = self.get().await {
            debug!("[{}] syncing `{key}`", self.name());
            match reconcile(key.clone()).await {
                Ok(Outcome::Applied) => {
                    self.forget(&key);
                }
                Ok(Outcome::Deferred(reason)) => {
                    info!("[{}] deferred `{key}`: {reason}", self.name());
                    self.forget(&key);
                }
                Err(e) => {
                    warn!("[{}] requeueing `{key}`, err: {e}", self.name());
                    self.add_rate_limited(key.clone());
                }
            }
            self.done(&key);
        }
    }
}

/// Builds the work key of an object: `namespace/name`, or `name` for cluster-scoped objects.
pub fn object_key(meta: &ObjectMeta) -> Option<String> {
    let name = meta.name.as_deref()?;
    Some(match meta.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name.to_string(),
    })
}

/// Splits a work key into its optional namespace and its name.
pub fn split_key(key: &str) -> Option<(Option<&str>, &str)> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Some((None, name)),
        (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
            Some((Some(namespace), name))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::{Semaphore, mpsc};

    use super::*;
    use crate::Error;

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let backoff = Backoff {
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(4), Duration::from_millis(80));
        assert_eq!(backoff.delay(8), Duration::from_secs(1));
        assert_eq!(backoff.delay(500), Duration::from_secs(1));
    }

    #[test]
    fn keys() {
        let meta = ObjectMeta {
            name: Some("shop".into()),
            namespace: Some("acme".into()),
            ..Default::default()
        };
        assert_eq!(object_key(&meta).as_deref(), Some("acme/shop"));
        let meta = ObjectMeta {
            name: Some("node-1".into()),
            ..Default::default()
        };
        assert_eq!(object_key(&meta).as_deref(), Some("node-1"));
        assert_eq!(split_key("acme/shop"), Some((Some("acme"), "shop")));
        assert_eq!(split_key("node-1"), Some((None, "node-1")));
        assert_eq!(split_key("a/b/c"), None);
        assert_eq!(split_key("/shop"), None);
        assert_eq!(split_key(""), None);
    }

    #[tokio::test]
    async fn dedup_while_pending() {
        let queue = WorkQueue::new("test");
        queue.add("acme/shop");
        queue.add("acme/shop");
        queue.add("acme/cart");
        assert_eq!(queue.len(), 2);

        let key = queue.get().await.unwrap();
        assert_eq!(key, "acme/shop");
        queue.done(&key);
        let key = queue.get().await.unwrap();
        assert_eq!(key, "acme/cart");
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dedup_while_active() {
        let queue = WorkQueue::new("test");
        queue.add("acme/shop");
        let key = queue.get().await.unwrap();

        // Re-added twice while in flight: not handed out concurrently, delivered once afterwards.
        queue.add("acme/shop");
        queue.add("acme/shop");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn run_invokes_reconcile_once_per_pending_key() {
        let queue = WorkQueue::new("test");
        queue.add("acme/shop");
        queue.add("acme/shop");

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = {
            let queue = queue.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                queue
                    .run(4, move |key: String| {
                        let calls = calls.clone();
                        let tx = tx.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tx.send(key).unwrap();
                            Ok(Outcome::Applied)
                        }
                    })
                    .await
            })
        };

        assert_eq!(rx.recv().await.as_deref(), Some("acme/shop"));
        queue.shutdown();
        runner.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_redelivers_key_added_while_in_flight() {
        let queue = WorkQueue::new("test");
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let runner = {
            let queue = queue.clone();
            let gate = gate.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                queue
                    .run(4, move |_key: String| {
                        let gate = gate.clone();
                        let calls = calls.clone();
                        let tx = tx.clone();
                        async move {
                            let call = calls.fetch_add(1, Ordering::SeqCst);
                            tx.send(call).unwrap();
                            if call == 0 {
                                gate.acquire().await.unwrap().forget();
                            }
                            Ok(Outcome::Applied)
                        }
                    })
                    .await
            })
        };

        queue.add("acme/shop");
        assert_eq!(rx.recv().await, Some(0));
        queue.add("acme/shop");
        queue.add("acme/shop");
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate.add_permits(1);
        assert_eq!(rx.recv().await, Some(1));
        queue.shutdown();
        runner.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_with_backoff_and_forgotten_on_success() {
        let queue = WorkQueue::with_backoff(
            "test",
            Backoff {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
            },
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = {
            let queue = queue.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                queue
                    .run(1, move |_key: String| {
                        let calls = calls.clone();
                        let tx = tx.clone();
                        async move {
                            let call = calls.fetch_add(1, Ordering::SeqCst);
                            let result = if call < 2 {
                                Err(Error::UnexpectedError("store unavailable".into()))
                            } else {
                                Ok(Outcome::Applied)
                            };
                            tx.send(call).unwrap();
                            result
                        }
                    })
                    .await
            })
        };

        queue.add("acme");
        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        tokio::task::yield_now().await;
        assert_eq!(queue.failures("acme"), 0);

        queue.shutdown();
        runner.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deferred_keys_are_not_retried() {
        let queue = WorkQueue::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = {
            let queue = queue.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                queue
                    .run(1, move |_key: String| {
                        let calls = calls.clone();
                        let tx = tx.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tx.send(()).unwrap();
                            Ok(Outcome::Deferred("no free ports".into()))
                        }
                    })
                    .await
            })
        };

        queue.add("acme");
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.failures("acme"), 0);
        assert!(queue.is_empty());

        queue.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_reconcile() {
        let queue = WorkQueue::new("test");
        let gate = Arc::new(Semaphore::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = {
            let queue = queue.clone();
            let gate = gate.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                queue
                    .run(2, move |_key: String| {
                        let gate = gate.clone();
                        let finished = finished.clone();
                        let tx = tx.clone();
                        async move {
                            tx.send(()).unwrap();
                            gate.acquire().await.unwrap().forget();
                            finished.fetch_add(1, Ordering::SeqCst);
                            Ok(Outcome::Applied)
                        }
                    })
                    .await
            })
        };

        queue.add("acme");
        rx.recv().await.unwrap();
        queue.shutdown();
        queue.add("other");
        assert!(queue.is_empty());
        assert!(!runner.is_finished());

        gate.add_permits(1);
        runner.await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
