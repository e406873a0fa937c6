//! blobgate library -- blob storage gateway.
//!
//! This crate provides the components of a gateway that stores opaque blobs
//! on a local filesystem or an S3-compatible bucket and guards each one with
//! its own access policy: request handling, token verification, the policy
//! engine, and the pluggable storage providers.

use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod policy;
pub mod server;
pub mod storage;

use crate::auth::IdentityVerifier;
use crate::config::Config;
use crate::storage::provider::StorageProvider;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Blob storage provider (filesystem or object store).
    pub storage: Arc<dyn StorageProvider>,
    /// Bearer token verifier.
    pub identity: IdentityVerifier,
}

impl AppState {
    /// Initialize the storage provider and identity verifier from `config`.
    pub async fn initialize(config: Config) -> anyhow::Result<Self> {
        let storage = storage::initialize(&config.storage, config.records.kind).await?;
        let identity = IdentityVerifier::from_config(&config.auth.identity_providers)?;

        Ok(Self {
            config,
            storage,
            identity,
        })
    }
}
