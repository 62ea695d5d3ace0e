//! Per-region request locks
//!
//! Requests touching the same entities queue behind each other before they
//! reach the journal writer; unrelated requests proceed in parallel. Keys
//! are always locked in sorted order, so two requests can never wait on
//! each other in a cycle.

use crate::state::EntityKey;
use dashmap::DashMap;
use meridian_common::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

type Regions = Arc<DashMap<EntityKey, Arc<Mutex<()>>>>;

/// Lock table keyed by entity region
#[derive(Clone, Default)]
pub struct RegionLocks {
    regions: Regions,
}

/// Held regions; released on drop
pub struct RegionGuard {
    regions: Regions,
    held: Vec<(EntityKey, OwnedMutexGuard<()>)>,
}

impl RegionLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key, waiting at most `timeout` for all of them together
    pub async fn acquire(
        &self,
        keys: impl IntoIterator<Item = EntityKey>,
        timeout: Duration,
    ) -> Result<RegionGuard> {
        let keys: BTreeSet<EntityKey> = keys.into_iter().collect();
        let deadline = Instant::now() + timeout;
        let mut guard = RegionGuard {
            regions: Arc::clone(&self.regions),
            held: Vec::with_capacity(keys.len()),
        };

        for key in keys {
            let lock = Arc::clone(self.regions.entry(key.clone()).or_default().value());
            match tokio::time::timeout_at(deadline, lock.lock_owned()).await {
                Ok(held) => guard.held.push((key, held)),
                Err(_) => {
                    return Err(Error::LockTimeout {
                        region: key.to_string(),
                        waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
        }
        Ok(guard)
    }

    /// Number of regions currently tracked
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.regions.len()
    }
}

impl RegionGuard {
    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        while let Some((key, held)) = self.held.pop() {
            drop(held);
            // Forget the slot once nobody holds or waits on it
            self.regions
                .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}
