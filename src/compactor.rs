use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Compact once at least `threshold` commits were appended since the last
/// snapshot. Returns whether it compacted.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
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

/// Background task that periodically rewrites a tenant's WAL as a snapshot.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if !compact_if_due(&engine, threshold).await {
            debug!("compactor: nothing to do");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Settings;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("featured_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), Settings::default()).unwrap();

        let id = engine.add(NewSlot::new("evt").at_rank(1)).await.unwrap().id;
        assert!(!compact_if_due(&engine, 3).await);

        for rank in 2..5 {
            engine
                .update(id, SlotPatch { rank: Some(rank), ..Default::default() })
                .await
                .unwrap();
        }
        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let reopened = Engine::new(path, Arc::new(NotifyHub::new()), Settings::default()).unwrap();
        assert_eq!(reopened.get_slot(id).await.unwrap().rank, 4);
    }
}
