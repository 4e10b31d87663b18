//! Keyed single-flight registry
//!
//! Concurrent callers for one key share a single execution of the work and
//! all observe its outcome. The entry is dropped by the task running the
//! work as soon as it finishes, whether or not anyone is still waiting, so
//! the next call after that starts fresh.
//!
//! The work runs on its own task: it completes even if every caller is
//! cancelled, and a panic inside it surfaces as an error instead of
//! poisoning the waiters.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{Error, Result};

type Flight<T> = Shared<BoxFuture<'static, std::result::Result<T, Arc<Error>>>>;

/// Registered flights tagged with the id of the run that owns each entry
type Registry<T> = Arc<Mutex<HashMap<String, (u64, Flight<T>)>>>;

/// In-flight registry keyed by string
pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    inflight: Registry<T>,
    next_id: AtomicU64,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work in progress
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Run `work` for `key` unless a run is already in progress, in which
    /// case wait for that one. Errors come back as [`Error::Shared`].
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let flight = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some((_, flight)) => flight.clone(),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight =
                        Self::launch(Arc::clone(&self.inflight), key.to_string(), id, work());
                    inflight.insert(key.to_string(), (id, flight.clone()));
                    flight
                }
            }
        };

        flight.await.map_err(Error::Shared)
    }

    fn launch<Fut>(registry: Registry<T>, key: String, id: u64, work: Fut) -> Flight<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let owner = key.clone();
        let task = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result.map_err(Arc::new),
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Err(Arc::new(Error::Internal(format!(
                        "single-flight task for {} panicked: {}",
                        owner, reason
                    ))))
                }
            };

            // a newer flight may already own the key
            let mut inflight = registry.lock();
            if inflight.get(&owner).is_some_and(|(current, _)| *current == id) {
                inflight.remove(&owner);
            }
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Arc::new(Error::Internal(format!(
                    "single-flight task for {} failed: {}",
                    key, e
                )))),
            }
        }
        .boxed()
        .shared()
    }
}
