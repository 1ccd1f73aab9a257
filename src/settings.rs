//! Runtime-mutable settings backed by the ledger, with a lock-free snapshot
//! for hot-path reads.

use crate::error::Result;
use crate::ledger::Ledger;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::Arc;

/// Settings keys recognized at runtime.
pub const KEY_WORK_REPO_PATH: &str = "work_repo_path";
pub const KEY_GROUP_ACTIVE: &str = "group_active";
pub const KEY_SILENT_MODE: &str = "silent_mode";

/// Snapshot of the runtime-mutable settings.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Overrides the configured work repo when set.
    pub work_repo_path: Option<PathBuf>,
    /// Gates group fabric participation without a restart.
    pub group_active: Option<bool>,
    /// Suppresses outbound chatter (deliveries still complete tasks).
    pub silent_mode: bool,
}

/// Narrow capability over the ledger settings table. No ambient singletons;
/// holders get exactly this handle.
pub struct SettingsStore {
    ledger: Arc<Ledger>,
    snapshot: ArcSwap<Snapshot>,
}

impl SettingsStore {
    /// Load the current values and build the store.
    pub async fn load(ledger: Arc<Ledger>) -> Result<Self> {
        let snapshot = Self::read_snapshot(&ledger).await?;
        Ok(Self { ledger, snapshot: ArcSwap::from_pointee(snapshot) })
    }

    async fn read_snapshot(ledger: &Ledger) -> Result<Snapshot> {
        Ok(Snapshot {
            work_repo_path: ledger
                .get_setting(KEY_WORK_REPO_PATH)
                .await?
                .map(PathBuf::from),
            group_active: ledger
                .get_setting(KEY_GROUP_ACTIVE)
                .await?
                .map(|v| v == "true"),
            silent_mode: ledger
                .get_setting(KEY_SILENT_MODE)
                .await?
                .map(|v| v == "true")
                .unwrap_or(false),
        })
    }

    /// Current snapshot, lock-free.
    pub fn get(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Write one setting and refresh the snapshot.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ledger.set_setting(key, value).await?;
        let snapshot = Self::read_snapshot(&self.ledger).await?;
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_refreshes_snapshot() {
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let store = SettingsStore::load(ledger).await.expect("store");
        assert!(!store.get().silent_mode);

        store.set(KEY_SILENT_MODE, "true").await.expect("set");
        assert!(store.get().silent_mode);

        store.set(KEY_WORK_REPO_PATH, "/tmp/repo").await.expect("set");
        assert_eq!(store.get().work_repo_path.as_deref(), Some(std::path::Path::new("/tmp/repo")));
    }
}
