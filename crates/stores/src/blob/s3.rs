use super::{BlobError, BlobStore};
use aws_sdk_s3::primitives::ByteStream;
use futures::stream::BoxStream;
use std::collections::VecDeque;

/// Credentials and addressing for an S3-compatible bucket (Cloudflare R2).
#[derive(Debug, Clone)]
pub struct R2Config {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
}

impl R2Config {
    pub fn endpoint(&self) -> String {
        format!("https://{}.r2.cloudflarestorage.com", self.account_id)
    }
}

/// Blob store over the S3 API. All operations address a single bucket.
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn connect(cfg: &R2Config) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            cfg.access_key_id.clone(),
            cfg.secret_access_key.clone(),
            None,
            None,
            "r2-static",
        );
        let sdk = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("auto"))
            .endpoint_url(cfg.endpoint())
            .credentials_provider(credentials)
            .load()
            .await;
        Self {
            client: aws_sdk_s3::Client::new(&sdk),
            bucket: cfg.bucket.clone(),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for S3BlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let resp = self
            .client
            .get_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .send()
            .await;
        match resp {
            Ok(object) => {
                let data = object
                    .body
                    .collect()
                    .await
                    .map_err(|e| BlobError::api(key, e))?;
                Ok(Some(data.into_bytes().to_vec()))
            }
            Err(err) => {
                let err = err.into_service_error();
                if err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(BlobError::api(key, err))
                }
            }
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        // Explicit length: R2 rejects unsized streaming puts.
        self.client
            .put_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .content_length(bytes.len() as i64)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| BlobError::api(key, e.into_service_error()))?;
        Ok(())
    }

    async fn write_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, BlobError> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.write(key, bytes).await?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        let resp = self
            .client
            .head_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .send()
            .await;
        match resp {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(BlobError::api(key, err))
                }
            }
        }
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, BlobError>> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let prefix = prefix.to_string();
        let pages = Pages {
            buffered: VecDeque::new(),
            continuation: None,
            exhausted: false,
        };
        Box::pin(futures::stream::try_unfold(pages, move |mut pages| {
            let client = client.clone();
            let bucket = bucket.clone();
            let prefix = prefix.clone();
            async move {
                loop {
                    if let Some(key) = pages.buffered.pop_front() {
                        return Ok(Some((key, pages)));
                    }
                    if pages.exhausted {
                        return Ok(None);
                    }
                    let mut req = client
                        .list_objects_v2()
                        .bucket(bucket.as_str())
                        .prefix(prefix.as_str());
                    if let Some(token) = &pages.continuation {
                        req = req.continuation_token(token.clone());
                    }
                    let page = req
                        .send()
                        .await
                        .map_err(|e| BlobError::api(&prefix, e.into_service_error()))?;
                    pages.buffered = page
                        .contents()
                        .iter()
                        .filter_map(|o| o.key().map(str::to_owned))
                        .collect();
                    pages.continuation = page.next_continuation_token().map(str::to_owned);
                    pages.exhausted = pages.continuation.is_none();
                }
            }
        }))
    }
}

struct Pages {
    buffered: VecDeque<String>,
    continuation: Option<String>,
    exhausted: bool,
}
