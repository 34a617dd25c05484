//! Content-addressed, atomic-write local blob storage (spec.md §4.A).
//!
//! Refs are opaque strings of the form
//! `{safe(task_id)}/{safe(stage)}/{safe(name)}-{hex16}.bin`, resolved
//! relative to a configured base directory. Every write lands via a
//! `.tmp-{uuid}` sibling file that is fsynced then renamed into place, so a
//! reader never observes a partial write.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("path escapes artifact store base: {0}")]
    PathEscape(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Collapse any byte outside `[A-Za-z0-9._-]` to `_`, then truncate to 64
/// bytes on a UTF-8 boundary (spec.md §4.A "Name sanitization").
pub fn sanitize_component(raw: &str) -> String {
    let collapsed: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut truncated = collapsed;
    while truncated.len() > 64 {
        // Pop chars (not bytes) so we never split inside a UTF-8 sequence;
        // after collapsing, every char in `truncated` is single-byte ASCII.
        truncated.pop();
    }
    if truncated.is_empty() {
        "_".to_string()
    } else {
        truncated
    }
}

fn content_suffix(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Local, content-addressed artifact store rooted at `base`.
#[derive(Clone)]
pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn ref_path(task_id: &str, stage: &str, name: &str, bytes: &[u8]) -> String {
        format!(
            "{}/{}/{}-{}.bin",
            sanitize_component(task_id),
            sanitize_component(stage),
            sanitize_component(name),
            content_suffix(bytes),
        )
    }

    /// Resolve a `ref` to an absolute path, rejecting anything that
    /// normalizes outside `base`. Normalization is purely lexical (no
    /// filesystem access) so a not-yet-existing artifact still resolves.
    fn resolve(&self, artifact_ref: &str) -> Result<PathBuf> {
        let base_canon = self
            .base
            .canonicalize()
            .unwrap_or_else(|_| self.base.clone());

        let mut normalized = base_canon.clone();
        for component in Path::new(artifact_ref).components() {
            use std::path::Component;
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(ArtifactError::PathEscape(artifact_ref.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ArtifactError::PathEscape(artifact_ref.to_string()));
                }
            }
        }

        if !normalized.starts_with(&base_canon) {
            return Err(ArtifactError::PathEscape(artifact_ref.to_string()));
        }
        Ok(normalized)
    }

    /// Write `bytes` under `(task_id, stage, name)`, returning the ref.
    /// Idempotent: saving identical bytes twice yields the same ref and is a
    /// no-op on the second call (content-hash suffix makes the rename target
    /// stable, so a concurrent duplicate write just clobbers itself with
    /// identical content).
    pub async fn save(
        &self,
        task_id: &str,
        stage: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let rel = Self::ref_path(task_id, stage, name, bytes);
        let dest = self.base.join(&rel);
        let dir = dest.parent().expect("ref_path always has a parent");
        tokio::fs::create_dir_all(dir).await?;

        let tmp_name = format!(".tmp-{}", uuid::Uuid::new_v4());
        let tmp_path = dir.join(tmp_name);

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            use tokio::io::AsyncWriteExt;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp_path, &dest).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        Ok(rel)
    }

    pub async fn load(&self, artifact_ref: &str) -> Result<Vec<u8>> {
        let path = self.resolve(artifact_ref)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ArtifactError::NotFound(artifact_ref.to_string())
                }
                _ => ArtifactError::Io(e),
            })
    }

    pub async fn exists(&self, artifact_ref: &str) -> bool {
        match self.resolve(artifact_ref) {
            Ok(path) => tokio::fs::metadata(&path).await.is_ok(),
            Err(_) => false,
        }
    }

    pub async fn delete(&self, artifact_ref: &str) -> Result<bool> {
        let path = self.resolve(artifact_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Sorted, ref-returning listing of everything saved under
    /// `(task_id, stage)`. Temp files (`.tmp-*`) are never listed.
    pub async fn list(&self, task_id: &str, stage: &str) -> Result<Vec<String>> {
        let dir = self
            .base
            .join(sanitize_component(task_id))
            .join(sanitize_component(stage));
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name.starts_with(".tmp-") {
                continue;
            }
            out.push(format!(
                "{}/{}/{}",
                sanitize_component(task_id),
                sanitize_component(stage),
                name
            ));
        }
        out.sort();
        Ok(out)
    }

    /// Best-effort URL for the given ref. The local store has no serving
    /// surface of its own (HTTP is an external collaborator per spec.md
    /// §1), so this always returns `None`; kept as part of the contract so
    /// a caller behind a web server can implement it without changing this
    /// trait's shape.
    pub fn get_url(&self, _artifact_ref: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_collapses_and_truncates() {
        assert_eq!(sanitize_component("a/b:c"), "a_b_c");
        let long = "x".repeat(100);
        assert_eq!(sanitize_component(&long).len(), 64);
        assert_eq!(sanitize_component(""), "_");
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let bytes = b"hello world";
        let r = store.save("t1", "pdf_to_images", "page_1", bytes).await.unwrap();
        let loaded = store.load(&r).await.unwrap();
        assert_eq!(loaded, bytes);
        assert!(store.exists(&r).await);
    }

    #[tokio::test]
    async fn identical_content_same_ref_differing_content_differs() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let r1 = store.save("t1", "s", "n", b"aaa").await.unwrap();
        let r2 = store.save("t1", "s", "n", b"aaa").await.unwrap();
        let r3 = store.save("t1", "s", "n", b"bbb").await.unwrap();
        assert_eq!(r1, r2);
        assert_ne!(r1, r3);
    }

    #[tokio::test]
    async fn list_sorted_and_excludes_temp() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save("t1", "s", "b", b"2").await.unwrap();
        store.save("t1", "s", "a", b"1").await.unwrap();
        let listed = store.list("t1", "s").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.windows(2).all(|w| w[0] <= w[1]));
        assert!(listed.iter().all(|n| !n.contains(".tmp-")));
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let err = store.load("t1/s/missing-0000000000000000.bin").await;
        assert!(matches!(err, Err(ArtifactError::NotFound(_))));
    }

    #[tokio::test]
    async fn resolve_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save("t1", "s", "n", b"x").await.unwrap();
        let escaped = store.load("../outside.bin").await;
        assert!(matches!(escaped, Err(ArtifactError::PathEscape(_))));
    }

    #[tokio::test]
    async fn delete_missing_returns_false() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(!store.delete("t1/s/missing-0000000000000000.bin").await.unwrap());
    }
}
