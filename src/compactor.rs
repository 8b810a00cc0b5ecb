use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::DurableStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Compact once `threshold` appends have piled up since the last rewrite.
/// Returns whether a compaction ran.
pub async fn compact_if_due(store: &DurableStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task: periodic WAL compaction and cleanup of idle change feeds.
pub async fn run_compactor(store: Arc<DurableStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
        store.notify.prune_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyHub;
    use crate::store::Catalog;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rentable_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = DurableStore::open(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let company = Ulid::new();
        store.register_company(company, "Acme".into()).await.unwrap();
        for i in 0..9 {
            store
                .register_client(Ulid::new(), format!("client {i}"), None)
                .await
                .unwrap();
        }
        assert!(!compact_if_due(&store, 100).await);
        assert_eq!(store.wal_appends_since_compact().await, 10);

        assert!(compact_if_due(&store, 10).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);

        drop(store);
        let reopened = DurableStore::open(path, Arc::new(NotifyHub::new())).unwrap();
        assert!(reopened.find_company(company).await.unwrap().is_some());
    }
}
