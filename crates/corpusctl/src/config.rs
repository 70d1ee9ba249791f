//! Store selection shared by every subcommand: a local filesystem blob
//! root or an R2 bucket, plus the SQLite metadata database.

use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::Arc;
use stores::{BlobStore, LocalBlobStore, MetaStore, R2Config, S3BlobStore};

#[derive(Debug, clap::Args)]
pub struct StoreArgs {
    /// Root directory for local blob storage and the manifest
    #[clap(long, env = "STORAGE_PATH", default_value = "./storage")]
    pub storage_path: PathBuf,

    /// Metadata database location, e.g. sqlite://corpus.db
    #[clap(long, env = "DATABASE_URL", default_value = "sqlite://corpus.db")]
    pub database_url: String,

    /// Cloudflare account id. When this and both R2 keys are set, blobs
    /// go to R2 instead of the local filesystem
    #[clap(long, env = "CLOUDFLARE_ACCOUNT_ID", default_value = "")]
    pub cloudflare_account_id: String,

    #[clap(long, env = "R2_ACCESS_KEY_ID", default_value = "", hide_env_values = true)]
    pub r2_access_key_id: String,

    #[clap(long, env = "R2_SECRET_ACCESS_KEY", default_value = "", hide_env_values = true)]
    pub r2_secret_access_key: String,

    #[clap(long, env = "R2_BUCKET_NAME", default_value = "docx-corpus")]
    pub r2_bucket_name: String,
}

impl StoreArgs {
    /// The R2 backend is selected only when every credential is present.
    pub fn uses_remote_blobs(&self) -> bool {
        !self.cloudflare_account_id.is_empty()
            && !self.r2_access_key_id.is_empty()
            && !self.r2_secret_access_key.is_empty()
    }

    pub async fn open_blob(&self) -> anyhow::Result<Arc<dyn BlobStore>> {
        if self.uses_remote_blobs() {
            tracing::info!(bucket = %self.r2_bucket_name, "using R2 blob store");
            let cfg = R2Config {
                account_id: self.cloudflare_account_id.clone(),
                access_key_id: self.r2_access_key_id.clone(),
                secret_access_key: self.r2_secret_access_key.clone(),
                bucket: self.r2_bucket_name.clone(),
            };
            Ok(Arc::new(S3BlobStore::connect(&cfg).await))
        } else {
            tracing::info!(root = %self.storage_path.display(), "using local blob store");
            Ok(Arc::new(LocalBlobStore::new(self.storage_path.clone())))
        }
    }

    pub async fn open_meta(&self) -> anyhow::Result<MetaStore> {
        MetaStore::connect(&self.database_url)
            .await
            .with_context(|| format!("failed to open metadata store at {}", self.database_url))
    }
}
