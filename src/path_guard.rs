use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::error::{PanelError, Result};

/// Maps a caller-supplied path onto a room's root directory.
///
/// Containment is checked on the normalized path: `..` segments are folded
/// lexically and the deepest existing ancestor is canonicalized, so symlinks
/// that point out of the root are rejected too. Absolute input is accepted
/// only when it already lies under the root.
pub async fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    let canon_root = canonical_root(root).await?;
    let relative = relative_within(rel, root, &canon_root)?;
    contain(&canon_root, &relative, rel).await
}

/// Like [`resolve`], but the last component is left as-is: a symlink named by
/// `rel` is returned as the link itself, not its target. The parent directory
/// is still fully resolved and must lie under the root.
pub async fn resolve_entry(root: &Path, rel: &str) -> Result<PathBuf> {
    let canon_root = canonical_root(root).await?;
    let relative = relative_within(rel, root, &canon_root)?;
    let Some(name) = relative.file_name().map(|n| n.to_os_string()) else {
        return Ok(canon_root);
    };
    let parent = relative.parent().unwrap_or_else(|| Path::new(""));
    let dir = contain(&canon_root, parent, rel).await?;
    Ok(dir.join(name))
}

async fn canonical_root(root: &Path) -> Result<PathBuf> {
    if root.as_os_str().is_empty() {
        return Err(PanelError::IllegalPath(
            "room root is not configured".to_string(),
        ));
    }

    match tokio::fs::canonicalize(root).await {
        Ok(p) => Ok(p),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PanelError::NotProvisioned(root.display().to_string()))
        }
        Err(e) => Err(PanelError::Io(e)),
    }
}

fn relative_within(rel: &str, root: &Path, canon_root: &Path) -> Result<PathBuf> {
    let requested = Path::new(rel);
    if requested.is_absolute() {
        strip_root(requested, root, canon_root)
    } else {
        normalize_relative(requested)
    }
}

async fn contain(canon_root: &Path, relative: &Path, rel: &str) -> Result<PathBuf> {
    let candidate = canon_root.join(relative);

    // Walk up to the deepest component that exists; only that part can
    // contain symlinks.
    let mut existing = candidate;
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        match tokio::fs::symlink_metadata(&existing).await {
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name() else {
                    return Err(PanelError::IllegalPath(rel.to_string()));
                };
                missing.push(name.to_os_string());
                existing.pop();
            }
            Err(e) => return Err(PanelError::Io(e)),
        }
    }

    let real = tokio::fs::canonicalize(&existing)
        .await
        .map_err(|_| PanelError::IllegalPath(rel.to_string()))?;
    if !real.starts_with(canon_root) {
        return Err(PanelError::IllegalPath(rel.to_string()));
    }

    Ok(missing.into_iter().rev().fold(real, |mut acc, seg| {
        acc.push(seg);
        acc
    }))
}

/// Folds `.` and `..` without touching the filesystem. Fails if the path
/// climbs above its starting point.
fn normalize_relative(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(PanelError::IllegalPath(path.display().to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PanelError::IllegalPath(path.display().to_string()));
            }
        }
    }
    Ok(out)
}

fn normalize_absolute(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn strip_root(requested: &Path, root: &Path, canon_root: &Path) -> Result<PathBuf> {
    let requested = normalize_absolute(requested);
    let declared_root = normalize_absolute(root);
    for base in [canon_root, declared_root.as_path()] {
        if let Ok(rest) = requested.strip_prefix(base) {
            return normalize_relative(rest);
        }
    }
    Err(PanelError::IllegalPath(requested.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn room_root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("room1");
        tokio::fs::create_dir_all(root.join("a")).await.unwrap();
        let canon = tokio::fs::canonicalize(&root).await.unwrap();
        (dir, canon)
    }

    #[tokio::test]
    async fn parent_segments_fold_inside_root() {
        let (_dir, root) = room_root().await;
        assert_eq!(resolve(&root, "a/b/../c").await.unwrap(), root.join("a/c"));
        assert_eq!(resolve(&root, "./a").await.unwrap(), root.join("a"));
        assert_eq!(resolve(&root, "").await.unwrap(), root);
    }

    #[tokio::test]
    async fn escapes_are_illegal() {
        let (_dir, root) = room_root().await;
        for rel in ["../../etc/passwd", "a/../../b", "..", "a/../../room1/a"] {
            assert!(
                matches!(resolve(&root, rel).await, Err(PanelError::IllegalPath(_))),
                "{rel} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn absolute_paths_must_already_be_inside_root() {
        let (dir, root) = room_root().await;
        let inside = root.join("a").join("x.json");
        assert_eq!(
            resolve(&root, inside.to_str().unwrap()).await.unwrap(),
            inside
        );

        assert!(matches!(
            resolve(&root, "/etc/passwd").await,
            Err(PanelError::IllegalPath(_))
        ));

        // same string prefix, different directory
        let sibling = dir.path().join("room10");
        tokio::fs::create_dir_all(&sibling).await.unwrap();
        let sneaky = format!("{}0/secret", root.display());
        assert!(matches!(
            resolve(&root, &sneaky).await,
            Err(PanelError::IllegalPath(_))
        ));
    }

    #[tokio::test]
    async fn empty_root_fails_closed() {
        assert!(matches!(
            resolve(Path::new(""), "a").await,
            Err(PanelError::IllegalPath(_))
        ));
    }

    #[tokio::test]
    async fn missing_root_is_not_provisioned() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve(&dir.path().join("ghost"), "a").await,
            Err(PanelError::NotProvisioned(_))
        ));
    }

    #[tokio::test]
    async fn symlink_out_of_root_is_illegal() {
        let (dir, root) = room_root().await;
        let outside = dir.path().join("outside");
        tokio::fs::create_dir_all(&outside).await.unwrap();
        std::os::unix::fs::symlink(&outside, root.join("escape")).unwrap();
        std::os::unix::fs::symlink(root.join("a"), root.join("alias")).unwrap();

        assert!(matches!(
            resolve(&root, "escape/file.txt").await,
            Err(PanelError::IllegalPath(_))
        ));
        assert_eq!(
            resolve(&root, "alias/file.txt").await.unwrap(),
            root.join("a").join("file.txt")
        );
    }

    #[tokio::test]
    async fn entry_keeps_final_symlink_unresolved() {
        let (dir, root) = room_root().await;
        std::os::unix::fs::symlink(root.join("a"), root.join("alias")).unwrap();
        std::os::unix::fs::symlink(dir.path(), root.join("escape")).unwrap();

        assert_eq!(
            resolve_entry(&root, "alias").await.unwrap(),
            root.join("alias")
        );
        assert_eq!(
            resolve_entry(&root, "alias/x.txt").await.unwrap(),
            root.join("a").join("x.txt")
        );
        assert_eq!(resolve_entry(&root, "").await.unwrap(), root);

        // the link itself is in the root, anything behind it is not
        assert_eq!(
            resolve_entry(&root, "escape").await.unwrap(),
            root.join("escape")
        );
        assert!(matches!(
            resolve_entry(&root, "escape/secret").await,
            Err(PanelError::IllegalPath(_))
        ));
        assert!(matches!(
            resolve_entry(&root, "../x").await,
            Err(PanelError::IllegalPath(_))
        ));
    }
}
