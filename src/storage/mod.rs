//! Blob storage backends.
//!
//! The [`provider::StorageProvider`] trait abstracts over where records
//! physically live: a local directory tree or an S3-compatible bucket.

pub mod filesystem;
pub mod provider;
pub mod s3;

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::errors::StoreError;
use provider::{RecordKind, StorageProvider};

/// Build the configured provider, failing with `Configuration` if the
/// backend is unusable.
pub async fn initialize(
    config: &StorageConfig,
    kind: RecordKind,
) -> Result<Arc<dyn StorageProvider>, StoreError> {
    let provider: Arc<dyn StorageProvider> = match config {
        StorageConfig::Filesystem(fs) => {
            Arc::new(filesystem::FilesystemProvider::initialize(fs, kind).await?)
        }
        StorageConfig::S3(s3) => Arc::new(s3::ObjectStoreProvider::initialize(s3, kind).await?),
    };
    Ok(provider)
}
