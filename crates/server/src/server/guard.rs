use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// One exclusive lock per machine id.
///
/// Every load-mutate-persist cycle on a machine record runs while holding its
/// guard, so two cycles on the same machine never overlap. Cycles on different
/// machines proceed independently. Remote commands are never run while a guard
/// is held.
#[derive(Debug, Default, Clone)]
pub struct MachineLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl MachineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `machine_id`. Access ends when the guard drops.
    pub async fn lock(&self, machine_id: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is not held across the await.
        let lock = self
            .locks
            .entry(machine_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        trace!(machine = %machine_id, "Waiting for machine lock.");
        lock.lock_owned().await
    }
}
