//! Snapshot of the uploaded set: one id per line, ASCII-sorted, trailing
//! newline. Written locally and mirrored to the blob store when one is
//! configured.

use std::path::{Path, PathBuf};
use stores::{keys, BlobStore, MetaStore};

#[derive(Debug, Clone)]
pub struct ManifestSummary {
    pub count: usize,
    pub path: PathBuf,
}

pub async fn generate_manifest(
    meta: &MetaStore,
    local_root: &Path,
    mirror: Option<&dyn BlobStore>,
) -> anyhow::Result<ManifestSummary> {
    let ids = meta.uploaded_ids().await?;
    let mut contents = String::with_capacity(ids.len() * 65);
    for id in &ids {
        contents.push_str(id);
        contents.push('\n');
    }

    tokio::fs::create_dir_all(local_root).await?;
    let path = local_root.join(keys::MANIFEST);
    tokio::fs::write(&path, contents.as_bytes()).await?;

    if let Some(store) = mirror {
        store.write(keys::MANIFEST, contents.as_bytes()).await?;
    }

    tracing::info!(count = ids.len(), path = %path.display(), "manifest written");
    Ok(ManifestSummary {
        count: ids.len(),
        path,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use stores::{DocStatus, DocumentPatch, LocalBlobStore};

    async fn meta_with_uploads(ids: &[&str]) -> (tempfile::TempDir, MetaStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let meta = MetaStore::connect(&url).await.unwrap();
        for id in ids {
            meta.upsert(
                id,
                DocumentPatch {
                    status: Some(DocStatus::Uploaded),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        (dir, meta)
    }

    #[tokio::test]
    async fn manifest_is_sorted_with_trailing_newline() {
        let (dir, meta) = meta_with_uploads(&["beta", "alpha", "gamma"]).await;
        let summary = generate_manifest(&meta, dir.path(), None).await.unwrap();

        assert_eq!(summary.count, 3);
        let written = tokio::fs::read_to_string(&summary.path).await.unwrap();
        assert_eq!(written, "alpha\nbeta\ngamma\n");
    }

    #[tokio::test]
    async fn manifest_skips_failed_rows_and_mirrors() {
        let (dir, meta) = meta_with_uploads(&["only"]).await;
        meta.upsert(
            "failed-x",
            DocumentPatch {
                status: Some(DocStatus::Failed),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let blob_dir = tempfile::tempdir().unwrap();
        let blob = LocalBlobStore::new(blob_dir.path());
        generate_manifest(&meta, dir.path(), Some(&blob)).await.unwrap();

        let mirrored = blob.read(keys::MANIFEST).await.unwrap().unwrap();
        assert_eq!(mirrored, b"only\n");
    }
}
