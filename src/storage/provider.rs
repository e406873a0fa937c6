//! Storage provider contract.
//!
//! Every backend implements [`StorageProvider`].  A record is a pair of
//! artifacts addressed by a caller-supplied id: the raw payload (`data`) and
//! a JSON document (`metadata.json`).  Metadata is only written after the
//! payload has been fully persisted, so its presence marks a committed
//! record.
//!
//! Payloads move as [`BlobStream`]s in both directions; providers never hold
//! a whole object in memory.

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::errors::StoreError;
use crate::policy::{AuthorizationPolicy, Owner};

/// Name of the payload artifact inside a record.
pub const DATA_FILE: &str = "data";

/// Name of the metadata artifact inside a record.
pub const METADATA_FILE: &str = "metadata.json";

/// Content type recorded when the caller supplies none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A finite, single-pass stream of payload chunks.
pub type BlobStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Boxed future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Which metadata shape a deployment stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Per-record policy, content length, ownership transfer, re-authorization.
    #[default]
    Full,
    /// No per-record policy and no content length.
    Simple,
}

/// Parameters of [`StorageProvider::add`].
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: String,
    pub file_name: String,
    /// Falls back to [`DEFAULT_CONTENT_TYPE`].
    pub content_type: Option<String>,
    /// Required for full records, forbidden for simple ones.
    pub is_authorized: Option<AuthorizationPolicy>,
}

impl NewRecord {
    /// Check the record against the deployment's kind before anything is written.
    pub fn check(&self, kind: RecordKind) -> Result<(), StoreError> {
        validate_id(&self.id)?;
        match (kind, &self.is_authorized) {
            (RecordKind::Full, None) => Err(StoreError::validation(
                "isAuthorized is required for full records",
            )),
            (RecordKind::Simple, Some(_)) => Err(StoreError::validation(
                "simple records carry no authorization policy",
            )),
            _ => Ok(()),
        }
    }

    /// Build the committed metadata once `content_length` bytes have been stored.
    pub fn into_metadata(self, kind: RecordKind, content_length: u64) -> Metadata {
        Metadata {
            id: self.id,
            file_name: self.file_name,
            content_type: self
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            content_length: match kind {
                RecordKind::Full => Some(content_length),
                RecordKind::Simple => None,
            },
            is_authorized: self.is_authorized,
        }
    }
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_authorized: Option<AuthorizationPolicy>,
}

impl Metadata {
    /// The record's policy; simple records have none.
    pub fn policy(&self) -> Result<&AuthorizationPolicy, StoreError> {
        self.is_authorized.as_ref().ok_or_else(|| {
            StoreError::validation(format!("blob {} has no authorization policy", self.id))
        })
    }

    /// Change only the owner, keeping every flag.
    pub fn transfer_to(&mut self, owner: Owner) -> Result<(), StoreError> {
        let id = self.id.clone();
        let policy = self.is_authorized.as_mut().ok_or_else(|| {
            StoreError::validation(format!("blob {id} has no authorization policy"))
        })?;
        policy.owner = owner;
        Ok(())
    }

    /// Replace the whole policy.
    pub fn replace_policy(&mut self, policy: AuthorizationPolicy) -> Result<(), StoreError> {
        if self.is_authorized.is_none() {
            return Err(StoreError::validation(format!(
                "blob {} has no authorization policy",
                self.id
            )));
        }
        self.is_authorized = Some(policy);
        Ok(())
    }

    /// Serialize to the persisted JSON form.
    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Backend(e.into()))
    }

    /// Parse the persisted JSON form.
    pub fn from_json(id: &str, raw: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(raw)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("corrupt metadata for blob {id}: {e}")))
    }
}

/// Reject ids that cannot be used as a single path segment / key prefix.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::validation("id is missing"));
    }
    if id == "." || id == ".." || id.contains(|c: char| matches!(c, '/' | '\\' | '\0')) {
        return Err(StoreError::validation(format!("invalid blob id: {id:?}")));
    }
    Ok(())
}

/// Async blob storage contract.
pub trait StorageProvider: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// The record kind this provider stores.
    fn kind(&self) -> RecordKind;

    /// Persist a new record, streaming `data` before committing metadata.
    ///
    /// Fails with `AlreadyExists` without writing when the id is taken.
    fn add(&self, record: NewRecord, data: BlobStream) -> ProviderFuture<'_, Metadata>;

    /// Read a committed record's metadata.
    fn get_metadata(&self, id: &str) -> ProviderFuture<'_, Metadata>;

    /// Open a committed record's payload.
    fn get(&self, id: &str) -> ProviderFuture<'_, BlobStream>;

    /// Delete both artifacts of a record.
    fn remove(&self, id: &str) -> ProviderFuture<'_, ()>;

    /// Replace only the owner of a record's policy.
    fn transfer_ownership(&self, id: &str, to: Owner) -> ProviderFuture<'_, ()>;

    /// Replace a record's policy wholesale.
    fn authorize(&self, id: &str, policy: AuthorizationPolicy) -> ProviderFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AccessLevel;

    fn policy() -> AuthorizationPolicy {
        AuthorizationPolicy::with_defaults(Owner::Id("alice".into()))
    }

    fn new_record(is_authorized: Option<AuthorizationPolicy>) -> NewRecord {
        NewRecord {
            id: "4f1c".into(),
            file_name: "report.pdf".into(),
            content_type: None,
            is_authorized,
        }
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("0b6c3f0e-1e2b-4a51-9c1e-2f3f6a0d2b11").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id(".").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a\\b").is_err());
    }

    #[test]
    fn test_kind_checks() {
        assert!(new_record(Some(policy())).check(RecordKind::Full).is_ok());
        assert!(new_record(None).check(RecordKind::Full).is_err());
        assert!(new_record(None).check(RecordKind::Simple).is_ok());
        assert!(new_record(Some(policy())).check(RecordKind::Simple).is_err());
    }

    #[test]
    fn test_into_metadata_defaults_content_type() {
        let metadata = new_record(Some(policy())).into_metadata(RecordKind::Full, 12);
        assert_eq!(metadata.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(metadata.content_length, Some(12));
    }

    #[test]
    fn test_simple_metadata_shape() {
        let metadata = new_record(None).into_metadata(RecordKind::Simple, 12);
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": "4f1c",
                "fileName": "report.pdf",
                "contentType": "application/octet-stream"
            })
        );
    }

    #[test]
    fn test_transfer_keeps_flags() {
        let mut full = policy();
        full.queries.get_blob = AccessLevel::new(true, true);
        let mut metadata = new_record(Some(full.clone())).into_metadata(RecordKind::Full, 1);

        metadata.transfer_to(Owner::Id("bob".into())).unwrap();

        let after = metadata.is_authorized.unwrap();
        assert_eq!(after.owner, Owner::Id("bob".into()));
        assert_eq!(after.commands, full.commands);
        assert_eq!(after.queries, full.queries);
    }

    #[test]
    fn test_policy_mutations_fail_on_simple_records() {
        let mut metadata = new_record(None).into_metadata(RecordKind::Simple, 1);
        assert!(metadata.policy().is_err());
        assert!(metadata.transfer_to(Owner::Id("bob".into())).is_err());
        assert!(metadata.replace_policy(policy()).is_err());
    }

    #[test]
    fn test_corrupt_metadata_is_backend_error() {
        let err = Metadata::from_json("x", b"{not json").unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
