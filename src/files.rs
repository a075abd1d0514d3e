use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{PanelError, Result};
use crate::path_guard;
use crate::store::InstanceStore;

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Relative to the room root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// File access inside a room's directory. Every call resolves the caller's
/// path through `path_guard` before touching the disk.
///
/// Nothing here coordinates with the running game server: a write that races
/// the server's own write to the same file is last-write-wins.
#[derive(Clone)]
pub struct FileGateway {
    store: InstanceStore,
}

impl FileGateway {
    pub fn new(store: InstanceStore) -> Self {
        Self { store }
    }

    fn root(&self, id: &str) -> Result<PathBuf> {
        let directory = self.store.require(id)?.config().directory;
        if directory.is_empty() {
            return Err(PanelError::NotProvisioned(id.to_string()));
        }
        Ok(PathBuf::from(directory))
    }

    pub async fn list(&self, id: &str, rel_dir: &str) -> Result<Vec<FileEntry>> {
        let root = self.root(id)?;
        let base = path_guard::resolve(&root, "").await?;
        let dir = path_guard::resolve(&root, rel_dir).await?;

        let meta = tokio::fs::metadata(&dir)
            .await
            .map_err(|e| io_error(e, rel_dir))?;
        if !meta.is_dir() {
            return Err(PanelError::IllegalPath(format!("{rel_dir} is not a directory")));
        }

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let full = entry.path();
            // describe links themselves, never what they point at
            let Ok(info) = tokio::fs::symlink_metadata(&full).await else {
                continue;
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: relative_display(&base, &full),
                size: info.len(),
                is_dir: info.is_dir(),
                modified: info.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    pub async fn read(&self, id: &str, rel_path: &str) -> Result<Vec<u8>> {
        let path = path_guard::resolve(&self.root(id)?, rel_path).await?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(e, rel_path))?;
        if meta.is_dir() {
            return Err(PanelError::IllegalPath(format!("{rel_path} is a directory")));
        }
        tokio::fs::read(&path).await.map_err(|e| io_error(e, rel_path))
    }

    pub async fn write(&self, id: &str, rel_path: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve_file_target(id, rel_path).await?;
        let mut reader = data;
        replace_file(&path, &mut reader).await?;
        tracing::debug!(room = %id, path = %rel_path, bytes = data.len(), "Wrote file");
        Ok(())
    }

    pub async fn delete(&self, id: &str, rel_path: &str) -> Result<()> {
        let root = self.root(id)?;
        let base = path_guard::resolve(&root, "").await?;
        let path = path_guard::resolve_entry(&root, rel_path).await?;
        if path == base {
            return Err(PanelError::IllegalPath(
                "refusing to delete the room root".to_string(),
            ));
        }

        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| io_error(e, rel_path))?;
        // symlink_metadata reports a link as a non-directory, so a link is
        // unlinked and its target left alone
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        tracing::info!(room = %id, path = %rel_path, "Deleted file");
        Ok(())
    }

    /// Streams `reader` into `rel_path`, creating parent directories. Returns
    /// the number of bytes written. The old file is untouched if the stream
    /// fails.
    pub async fn upload<R>(&self, id: &str, rel_path: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.resolve_file_target(id, rel_path).await?;
        let written = replace_file(&path, reader).await?;
        tracing::info!(room = %id, path = %rel_path, bytes = written, "Uploaded file");
        Ok(written)
    }

    async fn resolve_file_target(&self, id: &str, rel_path: &str) -> Result<PathBuf> {
        let root = self.root(id)?;
        let base = path_guard::resolve(&root, "").await?;
        let path = path_guard::resolve(&root, rel_path).await?;
        if path == base {
            return Err(PanelError::IllegalPath(rel_path.to_string()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }
}

/// Copies `reader` into a sibling temp file and renames it over `path` once
/// everything has been written.
async fn replace_file<R>(path: &Path, reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tmp = temp_sibling(path);
    let copied = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        let written = tokio::io::copy(&mut *reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok::<_, std::io::Error>(written)
    }
    .await;

    match copied {
        Ok(written) => Ok(written),
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %tmp.display(), "Failed to remove temp file: {}", cleanup);
                }
            }
            Err(PanelError::Io(e))
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn io_error(e: std::io::Error, rel: &str) -> PanelError {
    if e.kind() == std::io::ErrorKind::NotFound {
        PanelError::NotFound(rel.to_string())
    } else {
        PanelError::Io(e)
    }
}

fn relative_display(base: &Path, full: &Path) -> String {
    let rel = full.strip_prefix(base).unwrap_or(full);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
