//! Reconcile functions for the three watched kinds.
//!
//! Every function takes a work key and returns `Ok(Outcome::Applied)` once the object has converged
//! (including when it vanished before it could be processed), `Ok(Outcome::Deferred(_))` when
//! nothing can be done until the cluster changes, and `Err(_)` for failures worth retrying.

use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{Error, Outcome, Result, config::Config, ports::SharedPortAllocator, store::ClusterStore};

mod ingress;
mod namespace;
mod node;

pub use ingress::reconcile_ingress;
pub use namespace::reconcile_namespace;
pub use node::reconcile_node;

/// State shared by all reconcile calls.
pub struct ReconcileContext {
    pub store: Arc<dyn ClusterStore>,
    pub ports: SharedPortAllocator,
    pub config: Arc<Config>,
    /// Keys whose ownership conflict has already been reported with an event.
    conflicts: Mutex<HashSet<String>>,
}

impl ReconcileContext {
    pub fn new(store: Arc<dyn ClusterStore>, ports: SharedPortAllocator, config: Config) -> Self {
        Self {
            store,
            ports,
            config: Arc::new(config),
            conflicts: Mutex::default(),
        }
    }

    fn conflicts(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.conflicts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks `key` as conflicting. Returns `true` only for the first report since it was cleared.
    pub fn report_conflict(&self, key: &str) -> bool {
        self.conflicts().insert(key.to_string())
    }

    pub fn clear_conflict(&self, key: &str) {
        self.conflicts().remove(key);
    }
}

/// Fails a reconcile call that does not finish within `limit`.
pub async fn with_timeout<F>(limit: Duration, reconcile: F) -> Result<Outcome>
where
    F: Future<Output = Result<Outcome>>,
{
    tokio::time::timeout(limit, reconcile)
        .await
        .unwrap_or(Err(Error::Timeout(limit)))
}
