use std::sync::Arc;

use inkvault_core::{IngestError, ProcessingLease};
use tracing::{debug, error};

use crate::store::CatalogStore;

/// Result of asking for a series lease. `Held` is the normal signal that
/// another run is already on the series, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAttempt {
    Acquired(ProcessingLease),
    Held,
}

impl LeaseAttempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Per-series mutual exclusion backed by a unique row in the catalog.
///
/// Acquisition is a single insert-if-absent, so two runs racing on the same
/// key cannot both win. Leases never expire: a run that dies while holding
/// one leaves the series locked until the row is deleted by hand.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn CatalogStore>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn try_acquire(&self, series_key: &str) -> Result<LeaseAttempt, IngestError> {
        match self.store.try_create_lease(series_key).await? {
            Some(lease) => {
                debug!(series = series_key, lease_id = lease.id, "lease acquired");
                Ok(LeaseAttempt::Acquired(lease))
            }
            None => Ok(LeaseAttempt::Held),
        }
    }

    /// Delete the lease row. A failure is logged, since the series stays
    /// locked until someone clears it.
    pub async fn release(&self, lease: &ProcessingLease) {
        match self.store.delete_lease(lease).await {
            Ok(()) => debug!(series = %lease.series_key, lease_id = lease.id, "lease released"),
            Err(err) => error!(
                series = %lease.series_key,
                lease_id = lease.id,
                error = %err,
                "failed to release lease; series stays locked"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCatalogStore;

    #[tokio::test]
    async fn second_acquire_is_refused_until_release() {
        let store = Arc::new(MemoryCatalogStore::new());
        let leases = LeaseManager::new(store.clone());

        let first = leases.try_acquire("Naruto").await.unwrap();
        let LeaseAttempt::Acquired(lease) = first else {
            panic!("expected first acquire to win");
        };
        assert_eq!(leases.try_acquire("Naruto").await.unwrap(), LeaseAttempt::Held);
        assert!(leases.try_acquire("Bleach").await.unwrap().is_acquired());

        leases.release(&lease).await;
        assert!(leases.try_acquire("Naruto").await.unwrap().is_acquired());
        assert_eq!(store.leases().await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_acquires_have_a_single_winner() {
        let store = Arc::new(MemoryCatalogStore::new());
        let leases = LeaseManager::new(store);

        let attempts = acquire_concurrently(&leases, "One Piece", 8).await;
        assert_eq!(attempts.iter().filter(|a| a.is_acquired()).count(), 1);
    }

    async fn acquire_concurrently(leases: &LeaseManager, key: &str, n: usize) -> Vec<LeaseAttempt> {
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..n {
            let leases = leases.clone();
            let key = key.to_string();
            set.spawn(async move { leases.try_acquire(&key).await.unwrap() });
        }
        let mut out = Vec::new();
        while let Some(res) = set.join_next().await {
            out.push(res.unwrap());
        }
        out
    }
}
