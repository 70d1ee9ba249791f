use crate::CdxRecord;
use futures::TryStreamExt;
use std::sync::Arc;
use stores::{keys, BlobError, BlobStore};

#[derive(Debug, thiserror::Error)]
pub enum CdxStreamError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("index shard {key} vanished between listing and read")]
    ShardVanished { key: String },
    #[error("index shard {key} is not UTF-8")]
    ShardEncoding { key: String },
    #[error("index shard {key} line {line}: malformed record")]
    MalformedRecord {
        key: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Pull-based, single-pass stream of filtered index records for one crawl.
///
/// Shards under `cdx-filtered/<crawl-id>/` are visited in sorted key order
/// (the listing itself is unordered); records within a shard are yielded in
/// file order. Each shard is read fully before parsing; shards are small.
pub struct CdxStream {
    store: Arc<dyn BlobStore>,
    shards: std::vec::IntoIter<String>,
    pending: std::vec::IntoIter<CdxRecord>,
}

impl CdxStream {
    pub async fn open(
        store: Arc<dyn BlobStore>,
        crawl_id: &str,
    ) -> Result<Self, CdxStreamError> {
        let prefix = keys::cdx_shard_prefix(crawl_id);
        let mut shards: Vec<String> = store
            .list(&prefix)
            .try_filter(|key| futures::future::ready(key.ends_with(".jsonl")))
            .try_collect()
            .await?;
        shards.sort();
        tracing::debug!(crawl_id, shards = shards.len(), "opened cdx stream");
        Ok(Self {
            store,
            shards: shards.into_iter(),
            pending: Vec::new().into_iter(),
        })
    }

    /// Next record, or None once every shard is drained.
    pub async fn next(&mut self) -> Result<Option<CdxRecord>, CdxStreamError> {
        loop {
            if let Some(record) = self.pending.next() {
                return Ok(Some(record));
            }
            let key = match self.shards.next() {
                Some(key) => key,
                None => return Ok(None),
            };
            self.pending = self.read_shard(&key).await?.into_iter();
        }
    }

    async fn read_shard(&self, key: &str) -> Result<Vec<CdxRecord>, CdxStreamError> {
        let bytes = self
            .store
            .read(key)
            .await?
            .ok_or_else(|| CdxStreamError::ShardVanished {
                key: key.to_string(),
            })?;
        let text = String::from_utf8(bytes).map_err(|_| CdxStreamError::ShardEncoding {
            key: key.to_string(),
        })?;

        let mut records = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|source| {
                CdxStreamError::MalformedRecord {
                    key: key.to_string(),
                    line: idx + 1,
                    source,
                }
            })?;
            records.push(record);
        }
        tracing::trace!(key, records = records.len(), "read cdx shard");
        Ok(records)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::WORD_MIME;
    use stores::LocalBlobStore;

    fn record_json(url: &str, offset: u64) -> String {
        format!(
            r#"{{"url": "{url}", "mime": "{WORD_MIME}", "status": "200", "digest": "D", "length": "100", "offset": "{offset}", "filename": "crawl-data/x.warc.gz"}}"#
        )
    }

    async fn seeded_store() -> (tempfile::TempDir, Arc<dyn BlobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let shard0 = format!(
            "{}\n\n{}\n",
            record_json("https://a.example/one.docx", 10),
            record_json("https://a.example/two.docx", 20),
        );
        let shard1 = format!("{}\n", record_json("https://b.example/three.docx", 30));
        store
            .write("cdx-filtered/CC-TEST/part-00000.jsonl", shard0.as_bytes())
            .await
            .unwrap();
        store
            .write("cdx-filtered/CC-TEST/part-00001.jsonl", shard1.as_bytes())
            .await
            .unwrap();
        store
            .write("cdx-filtered/CC-TEST/notes.txt", b"not a shard")
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn yields_shards_in_key_order_and_lines_in_file_order() {
        let (_dir, store) = seeded_store().await;
        let mut stream = CdxStream::open(store, "CC-TEST").await.unwrap();

        let mut urls = Vec::new();
        while let Some(record) = stream.next().await.unwrap() {
            urls.push(record.url);
        }
        assert_eq!(
            urls,
            vec![
                "https://a.example/one.docx",
                "https://a.example/two.docx",
                "https://b.example/three.docx",
            ]
        );
    }

    #[tokio::test]
    async fn empty_prefix_is_an_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let mut stream = CdxStream::open(store, "CC-NONE").await.unwrap();
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_shard_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store
            .write("cdx-filtered/CC-BAD/part-00000.jsonl", b"{broken\n")
            .await
            .unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(store);
        let mut stream = CdxStream::open(store, "CC-BAD").await.unwrap();
        let err = stream.next().await.unwrap_err();
        assert!(matches!(err, CdxStreamError::MalformedRecord { line: 1, .. }));
    }
}
