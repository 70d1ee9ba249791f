use super::{BlobError, BlobStore};
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Filesystem-backed blob store. A key such as `documents/ab.docx` maps to
/// `<root>/documents/ab.docx`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Writes land under a temporary name and are renamed into place, so a
    /// reader never observes a partially written object.
    async fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.path_of(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::io(key, e))?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("{file_name}.part"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| BlobError::io(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BlobError::io(key, e))
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        match tokio::fs::read(self.path_of(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::io(key, e)),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        self.write_atomic(key, bytes).await
    }

    async fn write_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, BlobError> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.write_atomic(key, bytes).await?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        match tokio::fs::metadata(self.path_of(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::io(key, e)),
        }
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, BlobError>> {
        let walk = Walk {
            root: self.root.clone(),
            prefix: prefix.to_string(),
            stack: None,
            files: VecDeque::new(),
        };
        Box::pin(futures::stream::try_unfold(walk, |mut walk| async move {
            if walk.stack.is_none() {
                walk.stack = Some(walk.start_dirs().await?);
            }
            loop {
                if let Some(key) = walk.files.pop_front() {
                    return Ok(Some((key, walk)));
                }
                let dir = match walk.stack.as_mut().and_then(Vec::pop) {
                    Some(dir) => dir,
                    None => return Ok(None),
                };
                walk.read_dir(dir).await?;
            }
        }))
    }
}

struct Walk {
    root: PathBuf,
    prefix: String,
    stack: Option<Vec<PathBuf>>,
    files: VecDeque<String>,
}

impl Walk {
    /// Start the traversal at the deepest directory implied by the prefix,
    /// falling back to the root when the prefix is not a whole directory.
    async fn start_dirs(&self) -> Result<Vec<PathBuf>, BlobError> {
        let trimmed = self.prefix.trim_end_matches('/');
        if !trimmed.is_empty() {
            let candidate = self.root.join(trimmed);
            if let Ok(meta) = tokio::fs::metadata(&candidate).await {
                if meta.is_dir() {
                    return Ok(vec![candidate]);
                }
            }
        }
        match tokio::fs::metadata(&self.root).await {
            Ok(_) => Ok(vec![self.root.clone()]),
            Err(_) => Ok(vec![]),
        }
    }

    async fn read_dir(&mut self, dir: PathBuf) -> Result<(), BlobError> {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| BlobError::io(&self.prefix, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BlobError::io(&self.prefix, e))?
        {
            let path = entry.path();
            let kind = entry
                .file_type()
                .await
                .map_err(|e| BlobError::io(&self.prefix, e))?;
            if kind.is_dir() {
                if let Some(stack) = self.stack.as_mut() {
                    stack.push(path);
                }
            } else if kind.is_file() {
                let key = key_of(&self.root, &path);
                if key.starts_with(&self.prefix) && !key.ends_with(".part") {
                    self.files.push_back(key);
                }
            }
        }
        Ok(())
    }
}

/// A key is the path relative to the root, with `/` separators on every
/// platform.
fn key_of(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::TryStreamExt;

    fn store() -> (tempfile::TempDir, LocalBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let (_dir, store) = store();
        assert_eq!(store.read("documents/nope.docx").await.unwrap(), None);
        assert!(!store.exists("documents/nope.docx").await.unwrap());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, store) = store();
        store.write("documents/a.docx", b"payload").await.unwrap();
        assert_eq!(
            store.read("documents/a.docx").await.unwrap(),
            Some(b"payload".to_vec())
        );
        assert!(store.exists("documents/a.docx").await.unwrap());
    }

    #[tokio::test]
    async fn write_if_absent_reports_creation() {
        let (_dir, store) = store();
        assert!(store.write_if_absent("k", b"one").await.unwrap());
        assert!(!store.write_if_absent("k", b"one").await.unwrap());
        assert_eq!(store.read("k").await.unwrap(), Some(b"one".to_vec()));
    }

    #[tokio::test]
    async fn rewrites_converge_on_one_object() {
        let (_dir, store) = store();
        store.write("k", b"same").await.unwrap();
        store.write("k", b"same").await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), Some(b"same".to_vec()));
        let keys: Vec<String> = store.list("").try_collect().await.unwrap();
        assert_eq!(keys, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn list_honors_prefix() {
        let (_dir, store) = store();
        store.write("cdx-filtered/CC/0.jsonl", b"x").await.unwrap();
        store.write("cdx-filtered/CC/1.jsonl", b"y").await.unwrap();
        store.write("documents/a.docx", b"z").await.unwrap();

        let mut keys: Vec<String> = store
            .list("cdx-filtered/CC/")
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cdx-filtered/CC/0.jsonl", "cdx-filtered/CC/1.jsonl"]);

        let missing: Vec<String> = store.list("cdx-filtered/XX/").try_collect().await.unwrap();
        assert!(missing.is_empty());
    }
}
