use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Spawns conversion tasks keyed by job id, at most one live task per id.
#[derive(Clone, Default)]
pub struct TaskScheduler {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    tracker: TaskTracker,
}

/// Removes the id from the in-flight set when the task ends, panics included.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.id);
    }
}

fn lock(set: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    // the set stays consistent even if a holder panicked
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fut` in the background unless a task for `id` is already live.
    /// Returns whether the task was spawned.
    pub fn spawn<F>(&self, id: Uuid, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !lock(&self.in_flight).insert(id) {
            return false;
        }

        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            id,
        };
        self.tracker.spawn(async move {
            let _guard = guard;
            fut.await;
        });
        true
    }

    pub fn is_in_flight(&self, id: Uuid) -> bool {
        lock(&self.in_flight).contains(&id)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Waits until every spawned task has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Waits up to `limit` for in-flight tasks. Returns `false` if some were
    /// still running when the limit expired.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(limit, self.tracker.wait()).await.is_ok()
    }
}
