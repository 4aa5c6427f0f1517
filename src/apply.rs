// src/apply.rs
use crate::error::{MirrorError, Result};
use crate::event::{ChangeEvent, ChangeKind};
use crate::paths;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Applies received change events to a local root directory.
///
/// Every operation is safe to replay: the same event applied twice leaves the
/// tree as applying it once would. A path that would land outside the root is
/// rejected before anything on disk is touched.
#[derive(Debug, Clone)]
pub struct ApplyEngine {
    root: PathBuf,
}

impl ApplyEngine {
    /// The root must exist; it is canonicalized once here.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|e| MirrorError::io(root, e))?;
        Ok(ApplyEngine { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a root-relative event path to an absolute path inside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        paths::resolve_within(&self.root, relative)
    }

    /// Performs the filesystem operation a change event describes.
    pub async fn apply(&self, event: &ChangeEvent) -> Result<()> {
        let target = self.resolve(event.path())?;

        match (event.kind(), event.is_directory()) {
            (ChangeKind::Create, true) => {
                fs::create_dir_all(&target)
                    .await
                    .map_err(|e| MirrorError::io(&target, e))?;
                info!("Apply: folder created {}", target.display());
            }
            (ChangeKind::Create, false) => {
                // No parent fallback: a missing parent directory fails the event.
                fs::write(&target, event.body().unwrap_or_default())
                    .await
                    .map_err(|e| MirrorError::io(&target, e))?;
                info!("Apply: file created {}", target.display());
            }
            (ChangeKind::Update, _) => {
                let mut file = fs::OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(&target)
                    .await
                    .map_err(|e| MirrorError::io(&target, e))?;
                file.write_all(event.body().unwrap_or_default())
                    .await
                    .map_err(|e| MirrorError::io(&target, e))?;
                file.flush().await.map_err(|e| MirrorError::io(&target, e))?;
                info!("Apply: file updated {}", target.display());
            }
            (ChangeKind::Delete, true) => match fs::remove_dir_all(&target).await {
                Ok(()) => info!("Apply: folder deleted {}", target.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Apply: folder {} already gone", target.display())
                }
                Err(e) => return Err(MirrorError::io(&target, e)),
            },
            (ChangeKind::Delete, false) => match fs::remove_file(&target).await {
                Ok(()) => info!("Apply: file deleted {}", target.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Apply: file {} already gone", target.display())
                }
                Err(e) => return Err(MirrorError::io(&target, e)),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (tempfile::TempDir, ApplyEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = ApplyEngine::new(dir.path()).unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn create_directory_is_idempotent() {
        let (_dir, engine) = engine();
        let event = ChangeEvent::create_dir("/a/b/c").unwrap();
        engine.apply(&event).await.unwrap();
        engine.apply(&event).await.unwrap();
        assert!(engine.root().join("a/b/c").is_dir());
        assert_eq!(std::fs::read_dir(engine.root().join("a/b")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn create_file_requires_parent() {
        let (_dir, engine) = engine();
        let event = ChangeEvent::create_file("/missing/todo.txt", "buy milk").unwrap();
        assert!(matches!(
            engine.apply(&event).await,
            Err(MirrorError::Io { .. })
        ));
        assert!(!engine.root().join("missing").exists());
    }

    #[tokio::test]
    async fn update_leaves_no_residual_bytes() {
        let (_dir, engine) = engine();
        std::fs::write(engine.root().join("greeting.txt"), "hello world").unwrap();

        let event = ChangeEvent::update("/greeting.txt", "hi").unwrap();
        engine.apply(&event).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(engine.root().join("greeting.txt")).unwrap(),
            "hi"
        );
    }

    #[tokio::test]
    async fn update_of_missing_file_fails() {
        let (_dir, engine) = engine();
        let event = ChangeEvent::update("/nope.txt", "x").unwrap();
        assert!(engine.apply(&event).await.is_err());
        assert!(!engine.root().join("nope.txt").exists());
    }

    #[tokio::test]
    async fn delete_directory_removes_descendants() {
        let (_dir, engine) = engine();
        let archive = engine.root().join("archive");
        std::fs::create_dir(&archive).unwrap();
        std::fs::write(archive.join("a.txt"), "a").unwrap();
        std::fs::write(archive.join("b.txt"), "b").unwrap();

        let event = ChangeEvent::delete("/archive", true).unwrap();
        engine.apply(&event).await.unwrap();
        assert!(!archive.join("a.txt").exists());
        assert!(!archive.join("b.txt").exists());
        assert!(!archive.exists());

        // replay is harmless
        engine.apply(&event).await.unwrap();
    }

    #[tokio::test]
    async fn delete_file_is_replayable() {
        let (_dir, engine) = engine();
        std::fs::write(engine.root().join("a.txt"), "a").unwrap();
        let event = ChangeEvent::delete("/a.txt", false).unwrap();
        engine.apply(&event).await.unwrap();
        engine.apply(&event).await.unwrap();
        assert!(!engine.root().join("a.txt").exists());
    }

    #[tokio::test]
    async fn escaping_paths_never_touch_disk() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("victim.txt"), "keep").unwrap();
        let engine = ApplyEngine::new(&root).unwrap();

        let delete = ChangeEvent::delete("/../victim.txt", false).unwrap();
        assert!(matches!(
            engine.apply(&delete).await,
            Err(MirrorError::PathEscape { .. })
        ));
        let create = ChangeEvent::create_file("/a/../../planted.txt", "x").unwrap();
        assert!(matches!(
            engine.apply(&create).await,
            Err(MirrorError::PathEscape { .. })
        ));

        assert_eq!(
            std::fs::read_to_string(outer.path().join("victim.txt")).unwrap(),
            "keep"
        );
        assert!(!outer.path().join("planted.txt").exists());
    }

    #[tokio::test]
    async fn root_itself_cannot_be_deleted() {
        let (_dir, engine) = engine();
        let event = ChangeEvent::delete("/", true).unwrap();
        assert!(matches!(
            engine.apply(&event).await,
            Err(MirrorError::EmptyPath)
        ));
        assert!(engine.root().is_dir());
    }
}
