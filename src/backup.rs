use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;

use crate::error::{PanelError, Result};
use crate::notify::{AuditAction, AuditEntry, AuditSink};
use crate::path_guard;
use crate::store::InstanceStore;

const ARCHIVE_SUFFIX: &str = ".tar.gz";

#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Gzipped tar snapshots of a room directory, kept per room under the
/// backup root.
#[derive(Clone)]
pub struct Backups {
    store: InstanceStore,
    audit: Arc<dyn AuditSink>,
    root: PathBuf,
}

impl Backups {
    pub fn new(store: InstanceStore, audit: Arc<dyn AuditSink>, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            audit,
            root: root.into(),
        }
    }

    pub async fn create(&self, id: &str) -> Result<BackupEntry> {
        let result = self.create_archive(id).await;
        self.audit.record(AuditEntry::new(
            id,
            AuditAction::Backup,
            result.as_ref().map(|_| ()),
        ));
        result
    }

    /// Newest first.
    pub async fn list(&self, id: &str) -> Result<Vec<BackupEntry>> {
        self.store.require(id)?;
        let mut read_dir = match tokio::fs::read_dir(self.room_dir(id)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(ARCHIVE_SUFFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_file() {
                entries.push(BackupEntry {
                    name,
                    size: meta.len(),
                    created: meta.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(entries)
    }

    /// Unpacks `name` over the room directory. The room must be stopped and
    /// stays locked until extraction finishes, so it cannot start mid-restore.
    pub async fn restore(&self, id: &str, name: &str) -> Result<()> {
        let result = self.restore_archive(id, name).await;
        self.audit.record(AuditEntry::new(
            id,
            AuditAction::Restore,
            result.as_ref().map(|_| ()),
        ));
        result
    }

    async fn create_archive(&self, id: &str) -> Result<BackupEntry> {
        let source = self.source_dir(id).await?;
        let dir = self.room_dir(id);
        tokio::fs::create_dir_all(&dir).await?;

        let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S%.3f");
        let name = format!("{id}_{timestamp}{ARCHIVE_SUFFIX}");
        let path = dir.join(&name);
        let tmp = dir.join(format!("{name}.tmp"));

        let mut cmd = Command::new("tar");
        cmd.arg("-czf").arg(&tmp).arg("-C").arg(&source).arg(".");
        if let Err(e) = run_tar(cmd).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, &path).await?;

        let meta = tokio::fs::metadata(&path).await?;
        tracing::info!(room = %id, backup = %name, bytes = meta.len(), "Created backup");
        Ok(BackupEntry {
            name,
            size: meta.len(),
            created: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn restore_archive(&self, id: &str, name: &str) -> Result<()> {
        let slot = self.store.require(id)?;
        if name.contains('/') || !name.ends_with(ARCHIVE_SUFFIX) {
            return Err(PanelError::IllegalPath(name.to_string()));
        }
        let archive = self.room_dir(id).join(name);
        match tokio::fs::symlink_metadata(&archive).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(PanelError::IllegalPath(name.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PanelError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let state = slot.state.lock().await;
        if state.removed {
            return Err(PanelError::UnknownRoom(id.to_string()));
        }
        if state.status.is_active() {
            return Err(PanelError::InstanceBusy);
        }
        let target = self.source_dir(id).await?;

        let mut cmd = Command::new("tar");
        cmd.arg("-xzf").arg(&archive).arg("-C").arg(&target);
        run_tar(cmd).await?;
        drop(state);

        tracing::info!(room = %id, backup = %name, "Restored backup");
        Ok(())
    }

    async fn source_dir(&self, id: &str) -> Result<PathBuf> {
        let directory = self.store.require(id)?.config().directory;
        if directory.is_empty() {
            return Err(PanelError::NotProvisioned(id.to_string()));
        }
        path_guard::resolve(Path::new(&directory), "").await
    }

    fn room_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

async fn run_tar(mut cmd: Command) -> Result<()> {
    let output = cmd
        .output()
        .await
        .map_err(|e| PanelError::BackupFailed(format!("failed to run tar: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PanelError::BackupFailed(format!(
            "tar exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_room;
    use crate::lifecycle::LifecycleEvent;
    use crate::notify::AuditLog;

    struct Fixture {
        dir: tempfile::TempDir,
        store: InstanceStore,
        audit: Arc<AuditLog>,
        backups: Backups,
    }

    impl Fixture {
        fn room_file(&self, rel: &str) -> PathBuf {
            self.dir.path().join("room1").join(rel)
        }
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("room1");
        tokio::fs::create_dir_all(root.join("worlds")).await.unwrap();
        let store = InstanceStore::from_configs([
            test_room("room1", 7777, &root, "TerrariaServer"),
            test_room("bare", 7778, Path::new(""), "TerrariaServer"),
        ]);
        let audit = Arc::new(AuditLog::new());
        let backups = Backups::new(store.clone(), audit.clone(), dir.path().join("backups"));
        Fixture {
            dir,
            store,
            audit,
            backups,
        }
    }

    #[tokio::test]
    async fn restore_rolls_room_back_to_snapshot() {
        let f = fixture().await;
        tokio::fs::write(f.room_file("worlds/main.wld"), b"v1").await.unwrap();

        let entry = f.backups.create("room1").await.unwrap();
        assert!(entry.name.starts_with("room1_"));
        assert!(entry.name.ends_with(ARCHIVE_SUFFIX));
        assert!(entry.size > 0);

        tokio::fs::write(f.room_file("worlds/main.wld"), b"v2").await.unwrap();
        f.backups.restore("room1", &entry.name).await.unwrap();

        assert_eq!(
            tokio::fs::read(f.room_file("worlds/main.wld")).await.unwrap(),
            b"v1"
        );
        let actions: Vec<_> = f.audit.recent(2).iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Restore, AuditAction::Backup]);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let f = fixture().await;
        assert!(f.backups.list("room1").await.unwrap().is_empty());

        let first = f.backups.create("room1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let second = f.backups.create("room1").await.unwrap();

        let names: Vec<_> = f
            .backups
            .list("room1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![second.name, first.name]);
    }

    #[tokio::test]
    async fn restore_refused_while_room_is_active() {
        let f = fixture().await;
        let entry = f.backups.create("room1").await.unwrap();
        f.store
            .get("room1")
            .unwrap()
            .state
            .lock()
            .await
            .apply(LifecycleEvent::Launched { pid: 10, run: 1 })
            .unwrap();

        assert!(matches!(
            f.backups.restore("room1", &entry.name).await,
            Err(PanelError::InstanceBusy)
        ));
        assert!(!f.audit.recent(1)[0].success);
    }

    #[tokio::test]
    async fn restore_rejects_foreign_and_missing_archives() {
        let f = fixture().await;
        assert!(matches!(
            f.backups.restore("room1", "../room2/x.tar.gz").await,
            Err(PanelError::IllegalPath(_))
        ));
        assert!(matches!(
            f.backups.restore("room1", "notes.txt").await,
            Err(PanelError::IllegalPath(_))
        ));
        assert!(matches!(
            f.backups.restore("room1", "room1_missing.tar.gz").await,
            Err(PanelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unprovisioned_and_unknown_rooms() {
        let f = fixture().await;
        assert!(matches!(
            f.backups.create("bare").await,
            Err(PanelError::NotProvisioned(_))
        ));
        assert!(matches!(
            f.backups.list("ghost").await,
            Err(PanelError::UnknownRoom(_))
        ));
        assert!(!f.dir.path().join("backups").join("bare").exists());
    }
}
