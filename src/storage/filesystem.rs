//! Local filesystem storage provider.
//!
//! Each record is a directory under the configured root:
//!
//! ```text
//! {root}/{id}/data            raw payload
//! {root}/{id}/metadata.json   UTF-8 JSON metadata
//! ```
//!
//! The payload is streamed to disk and fsynced before `metadata.json` is
//! written.  Metadata writes follow the temp-fsync-rename pattern so a
//! reader never sees a truncated document.

use bytes::BytesMut;
use futures_util::{stream, StreamExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::provider::{
    validate_id, BlobStream, Metadata, NewRecord, ProviderFuture, RecordKind, StorageProvider,
    DATA_FILE, METADATA_FILE,
};
use crate::config::FilesystemConfig;
use crate::errors::StoreError;
use crate::policy::{AuthorizationPolicy, Owner};

/// Read size for payload streams.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Stores records as directories on the local filesystem.
pub struct FilesystemProvider {
    /// Root directory holding one subdirectory per record.
    root: PathBuf,
    kind: RecordKind,
}

impl FilesystemProvider {
    /// Create or validate the root directory.
    ///
    /// Without a configured root a fresh temporary directory is used; it is
    /// not removed on shutdown.
    pub async fn initialize(
        config: &FilesystemConfig,
        kind: RecordKind,
    ) -> Result<Self, StoreError> {
        let root = match config.root_directory.as_deref() {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => tempfile::Builder::new()
                .prefix("blobgate-")
                .tempdir()
                .map_err(|e| {
                    StoreError::configuration(format!("cannot create temporary root: {e}"))
                })?
                .keep(),
        };

        fs::create_dir_all(&root).await.map_err(|e| {
            StoreError::configuration(format!("cannot create root {}: {e}", root.display()))
        })?;

        let meta = fs::metadata(&root).await.map_err(|e| {
            StoreError::configuration(format!("cannot access root {}: {e}", root.display()))
        })?;
        if !meta.is_dir() {
            return Err(StoreError::configuration(format!(
                "root {} is not a directory",
                root.display()
            )));
        }

        info!("Filesystem provider initialized at {}", root.display());
        Ok(Self { root, kind })
    }

    /// The root directory records live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a record id to its directory.
    fn record_dir(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }

    /// Temp path next to `metadata.json`, so the rename stays on one filesystem.
    fn temp_metadata_path(dir: &Path) -> PathBuf {
        dir.join(format!(".{METADATA_FILE}.{}.tmp", uuid::Uuid::new_v4()))
    }

    async fn read_metadata(&self, id: &str) -> Result<Metadata, StoreError> {
        let path = self.record_dir(id)?.join(METADATA_FILE);
        match fs::read(&path).await {
            Ok(raw) => Metadata::from_json(id, &raw),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Crash-only: write to temp file, fsync, rename over `metadata.json`.
    async fn write_metadata(&self, dir: &Path, metadata: &Metadata) -> Result<(), StoreError> {
        let body = metadata.to_json()?;
        let tmp_path = Self::temp_metadata_path(dir);

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, dir.join(METADATA_FILE)).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Stream `data` into `path`, returning the number of bytes written.
    async fn write_data(path: &Path, mut data: BlobStream) -> std::io::Result<u64> {
        let mut file = File::create(path).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.sync_all().await?;
        Ok(written)
    }
}

/// Record directory of an `add` that has not committed its metadata yet.
///
/// Dropping it uncommitted removes the directory, whether `add` returned an
/// error or its future was dropped mid-upload.
struct PendingRecord {
    dir: PathBuf,
    committed: bool,
}

impl PendingRecord {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Discarded uncommitted record {}", self.dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.dir.display(), e),
        }
    }
}

/// Turn an open file into a lazily read payload stream.
fn file_stream(file: File) -> BlobStream {
    Box::pin(stream::try_unfold(file, |mut file| async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let n = file.read_buf(&mut buf).await?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some((buf.freeze(), file)))
        }
    }))
}

impl StorageProvider for FilesystemProvider {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn kind(&self) -> RecordKind {
        self.kind
    }

    fn add(&self, record: NewRecord, data: BlobStream) -> ProviderFuture<'_, Metadata> {
        Box::pin(async move {
            record.check(self.kind)?;
            let dir = self.record_dir(&record.id)?;

            if fs::try_exists(&dir).await? {
                return Err(StoreError::AlreadyExists { id: record.id });
            }

            // Exclusive create closes most of the window between the check and the write.
            match fs::create_dir(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(StoreError::AlreadyExists { id: record.id });
                }
                Err(e) => return Err(e.into()),
            }

            debug!("Filesystem add: id={} dir={}", record.id, dir.display());
            let pending = PendingRecord::new(dir.clone());

            let content_length = Self::write_data(&dir.join(DATA_FILE), data)
                .await
                .map_err(|e| {
                    warn!("Upload of blob {} failed, discarding partial data: {}", record.id, e);
                    e
                })?;

            let metadata = record.into_metadata(self.kind, content_length);
            self.write_metadata(&dir, &metadata).await?;
            pending.commit();

            Ok(metadata)
        })
    }

    fn get_metadata(&self, id: &str) -> ProviderFuture<'_, Metadata> {
        let id = id.to_string();
        Box::pin(async move { self.read_metadata(&id).await })
    }

    fn get(&self, id: &str) -> ProviderFuture<'_, BlobStream> {
        let id = id.to_string();
        Box::pin(async move {
            let dir = self.record_dir(&id)?;

            // Uncommitted records are invisible.
            if !fs::try_exists(dir.join(METADATA_FILE)).await? {
                return Err(StoreError::NotFound { id });
            }

            match File::open(dir.join(DATA_FILE)).await {
                Ok(file) => Ok(file_stream(file)),
                Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound { id }),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn remove(&self, id: &str) -> ProviderFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let dir = self.record_dir(&id)?;

            match fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    debug!("Filesystem remove: id={}", id);
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound { id }),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn transfer_ownership(&self, id: &str, to: Owner) -> ProviderFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut metadata = self.read_metadata(&id).await?;
            metadata.transfer_to(to)?;
            self.write_metadata(&self.record_dir(&id)?, &metadata).await
        })
    }

    fn authorize(&self, id: &str, policy: AuthorizationPolicy) -> ProviderFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut metadata = self.read_metadata(&id).await?;
            metadata.replace_policy(policy)?;
            self.write_metadata(&self.record_dir(&id)?, &metadata).await
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{prepare_policy, AccessLevel};
    use bytes::Bytes;
    use futures_util::TryStreamExt;

    async fn test_provider(kind: RecordKind) -> (tempfile::TempDir, FilesystemProvider) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let config = FilesystemConfig {
            root_directory: Some(dir.path().to_string_lossy().into_owned()),
        };
        let provider = FilesystemProvider::initialize(&config, kind)
            .await
            .expect("failed to create provider");
        (dir, provider)
    }

    fn body(chunks: &[&'static str]) -> BlobStream {
        let chunks: Vec<std::io::Result<Bytes>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
        Box::pin(stream::iter(chunks))
    }

    fn failing_body() -> BlobStream {
        Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ]))
    }

    fn alice_policy() -> AuthorizationPolicy {
        prepare_policy(None, Owner::Id("alice".into())).unwrap()
    }

    fn record(id: &str, content_type: Option<&str>) -> NewRecord {
        NewRecord {
            id: id.to_string(),
            file_name: "wolkenkit.png".to_string(),
            content_type: content_type.map(str::to_string),
            is_authorized: Some(alice_policy()),
        }
    }

    async fn read_all(stream: BlobStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_add_and_get_metadata() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;

        provider
            .add(record("blob-1", Some("image/png")), body(&["hello ", "world"]))
            .await
            .unwrap();

        let metadata = provider.get_metadata("blob-1").await.unwrap();
        assert_eq!(metadata.id, "blob-1");
        assert_eq!(metadata.file_name, "wolkenkit.png");
        assert_eq!(metadata.content_type, "image/png");
        assert_eq!(metadata.content_length, Some(11));
        assert_eq!(metadata.is_authorized, Some(alice_policy()));
    }

    #[tokio::test]
    async fn test_content_type_defaults() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        provider.add(record("blob-1", None), body(&["x"])).await.unwrap();

        let metadata = provider.get_metadata("blob-1").await.unwrap();
        assert_eq!(metadata.content_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_get_streams_payload() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        provider
            .add(record("blob-1", None), body(&["hello ", "world"]))
            .await
            .unwrap();

        let data = read_all(provider.get("blob-1").await.unwrap()).await;
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_large_payload_streams_in_chunks() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        let payload = vec![7u8; READ_CHUNK_SIZE * 3 + 5];
        let upload: BlobStream = Box::pin(stream::iter(
            payload
                .chunks(1000)
                .map(|c| Ok::<_, std::io::Error>(Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>(),
        ));

        let metadata = provider.add(record("big", None), upload).await.unwrap();
        assert_eq!(metadata.content_length, Some(payload.len() as u64));

        let chunks: Vec<Bytes> = provider.get("big").await.unwrap().try_collect().await.unwrap();
        assert!(chunks.len() >= 4);
        assert!(chunks.iter().all(|c| c.len() <= READ_CHUNK_SIZE));
        assert_eq!(chunks.concat(), payload);
    }

    #[tokio::test]
    async fn test_layout_on_disk() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        provider.add(record("blob-1", None), body(&["abc"])).await.unwrap();

        let record_dir = provider.root().join("blob-1");
        assert_eq!(std::fs::read(record_dir.join("data")).unwrap(), b"abc");

        let raw = std::fs::read_to_string(record_dir.join("metadata.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["id"], "blob-1");
        assert_eq!(value["fileName"], "wolkenkit.png");
        assert_eq!(value["contentLength"], 3);
        assert_eq!(value["isAuthorized"]["owner"], "alice");

        // Only the two artifacts remain; temp files are renamed away.
        let entries = std::fs::read_dir(&record_dir).unwrap().count();
        assert_eq!(entries, 2);
    }

    #[tokio::test]
    async fn test_duplicate_add_leaves_original() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        provider
            .add(record("blob-1", Some("text/plain")), body(&["original"]))
            .await
            .unwrap();

        let err = provider
            .add(record("blob-1", Some("image/png")), body(&["imposter"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { ref id } if id == "blob-1"));

        let metadata = provider.get_metadata("blob-1").await.unwrap();
        assert_eq!(metadata.content_type, "text/plain");
        assert_eq!(metadata.content_length, Some(8));
        let data = read_all(provider.get("blob-1").await.unwrap()).await;
        assert_eq!(data, b"original");
    }

    #[tokio::test]
    async fn test_failed_upload_commits_nothing() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;

        let err = provider.add(record("blob-1", None), failing_body()).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(ref e) if e.kind() == ErrorKind::ConnectionReset));

        assert!(matches!(
            provider.get_metadata("blob-1").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(!provider.root().join("blob-1").exists());

        // The id is free again.
        provider.add(record("blob-1", None), body(&["ok"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_upload_frees_id() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;

        let stalled: BlobStream = Box::pin(
            stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"partial"))])
                .chain(stream::pending()),
        );
        let upload = provider.add(record("cut-off", None), stalled);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(200), upload)
                .await
                .is_err()
        );

        assert!(!provider.root().join("cut-off").exists());
        provider.add(record("cut-off", None), body(&["complete"])).await.unwrap();
        assert_eq!(read_all(provider.get("cut-off").await.unwrap()).await, b"complete");
    }

    #[tokio::test]
    async fn test_uncommitted_record_is_invisible() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        let record_dir = provider.root().join("in-flight");
        std::fs::create_dir(&record_dir).unwrap();
        std::fs::write(record_dir.join("data"), b"half").unwrap();

        assert!(matches!(
            provider.get("in-flight").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            provider.get_metadata("in-flight").await,
            Err(StoreError::NotFound { .. })
        ));
        // But the id is still taken.
        assert!(matches!(
            provider.add(record("in-flight", None), body(&["x"])).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_then_get_not_found() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        provider.add(record("blob-1", None), body(&["abc"])).await.unwrap();

        provider.remove("blob-1").await.unwrap();

        assert!(matches!(
            provider.get("blob-1").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            provider.remove("blob-1").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_record_not_found() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        assert!(matches!(
            provider.get_metadata("nope").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(provider.get("nope").await, Err(StoreError::NotFound { .. })));
        assert!(matches!(provider.remove("nope").await, Err(StoreError::NotFound { .. })));
        assert!(matches!(
            provider.transfer_ownership("nope", Owner::Id("bob".into())).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            provider.authorize("nope", alice_policy()).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        assert!(matches!(
            provider.add(record("../escape", None), body(&["x"])).await,
            Err(StoreError::Validation { .. })
        ));
        assert!(matches!(
            provider.get_metadata("a/b").await,
            Err(StoreError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_transfer_ownership_changes_only_owner() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        let mut policy = alice_policy();
        policy.commands.remove_blob = AccessLevel::new(true, false);
        policy.queries.get_blob = AccessLevel::new(true, true);
        let mut new = record("blob-1", None);
        new.is_authorized = Some(policy.clone());
        provider.add(new, body(&["abc"])).await.unwrap();

        provider
            .transfer_ownership("blob-1", Owner::Id("bob".into()))
            .await
            .unwrap();

        let after = provider.get_metadata("blob-1").await.unwrap();
        let after_policy = after.is_authorized.unwrap();
        assert_eq!(after_policy.owner, Owner::Id("bob".into()));
        assert_eq!(after_policy.commands, policy.commands);
        assert_eq!(after_policy.queries, policy.queries);
        assert_eq!(after.content_length, Some(3));
    }

    #[tokio::test]
    async fn test_authorize_replaces_whole_policy() {
        let (_dir, provider) = test_provider(RecordKind::Full).await;
        let open = prepare_policy(
            Some(&serde_json::json!({ "queries": { "getBlob": { "forPublic": true } } })),
            Owner::Id("alice".into()),
        )
        .unwrap();
        let mut new = record("blob-1", None);
        new.is_authorized = Some(open);
        provider.add(new, body(&["abc"])).await.unwrap();

        let replacement = prepare_policy(
            Some(&serde_json::json!({ "commands": { "removeBlob": { "forAuthenticated": true } } })),
            Owner::Id("alice".into()),
        )
        .unwrap();
        provider.authorize("blob-1", replacement.clone()).await.unwrap();

        let after = provider.get_metadata("blob-1").await.unwrap().is_authorized.unwrap();
        assert_eq!(after, replacement);
        assert!(!after.queries.get_blob.for_public);
    }

    #[tokio::test]
    async fn test_simple_records() {
        let (_dir, provider) = test_provider(RecordKind::Simple).await;
        let new = NewRecord {
            id: "blob-1".into(),
            file_name: "notes.txt".into(),
            content_type: Some("text/plain".into()),
            is_authorized: None,
        };
        provider.add(new, body(&["abc"])).await.unwrap();

        let metadata = provider.get_metadata("blob-1").await.unwrap();
        assert_eq!(metadata.content_length, None);
        assert_eq!(metadata.is_authorized, None);

        assert!(matches!(
            provider.transfer_ownership("blob-1", Owner::Id("bob".into())).await,
            Err(StoreError::Validation { .. })
        ));

        // A policy is refused before anything is written.
        assert!(matches!(
            provider.add(record("blob-2", None), body(&["x"])).await,
            Err(StoreError::Validation { .. })
        ));
        assert!(!provider.root().join("blob-2").exists());
    }

    #[tokio::test]
    async fn test_initialize_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let config = FilesystemConfig {
            root_directory: Some(file.to_string_lossy().into_owned()),
        };
        let result = FilesystemProvider::initialize(&config, RecordKind::Full).await;
        assert!(matches!(result, Err(StoreError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_initialize_without_root_uses_temp_dir() {
        let config = FilesystemConfig {
            root_directory: None,
        };
        let provider = FilesystemProvider::initialize(&config, RecordKind::Full)
            .await
            .unwrap();
        assert!(provider.root().is_dir());
        std::fs::remove_dir_all(provider.root()).unwrap();
    }
}
