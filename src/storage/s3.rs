//! S3-compatible object store provider.
//!
//! Key mapping inside the configured bucket:
//!   Payload:   `{id}/data`
//!   Metadata:  `{id}/metadata.json`
//!
//! Payloads that fit in a single part go up with one `PutObject`; larger
//! ones use a multipart upload, so at most one part is buffered at a time.
//! Until the metadata object is written the upload is pending: if `add`
//! fails or its future is dropped, the multipart upload is aborted or the
//! payload object deleted.

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client;
use bytes::BytesMut;
use futures_util::{stream, StreamExt};
use tracing::{debug, info, warn};

use super::provider::{
    validate_id, BlobStream, Metadata, NewRecord, ProviderFuture, RecordKind, StorageProvider,
    DATA_FILE, METADATA_FILE,
};
use crate::config::ObjectStoreConfig;
use crate::errors::StoreError;
use crate::policy::{AuthorizationPolicy, Owner};

/// Size of each multipart upload part; also the single-put threshold.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Region that must not be sent as a location constraint.
const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Stores records as object pairs in one S3 bucket.
pub struct ObjectStoreProvider {
    /// S3 SDK client; cheap to clone and safe to share.
    client: Client,
    bucket: String,
    kind: RecordKind,
}

impl ObjectStoreProvider {
    /// Build the client and make sure the bucket is usable.
    ///
    /// Static credentials from the config take precedence; without them
    /// the standard AWS credential chain applies.
    pub async fn initialize(
        config: &ObjectStoreConfig,
        kind: RecordKind,
    ) -> Result<Self, StoreError> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        let endpoint_url = config.endpoint_url();
        if let Some(ref endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let (Some(ak), Some(sk)) = (&config.access_key, &config.secret_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                ak,
                sk,
                None, // session_token
                None, // expiry
                "blobgate-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        // Custom endpoints (MinIO and friends) rarely support virtual-hosted buckets.
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint_url.is_some())
            .build();

        let provider = Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket_name.clone(),
            kind,
        };
        provider
            .ensure_bucket(&config.region, config.auto_create_bucket)
            .await?;

        info!(
            "Object store provider initialized: endpoint={} bucket={}",
            endpoint_url.as_deref().unwrap_or("aws"),
            provider.bucket
        );
        Ok(provider)
    }

    /// `HeadBucket`, creating the bucket when allowed and missing.
    async fn ensure_bucket(&self, region: &str, auto_create: bool) -> Result<(), StoreError> {
        let err = match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        let context = DisplayErrorContext(&err).to_string();
        if !err.into_service_error().is_not_found() {
            return Err(StoreError::configuration(format!(
                "cannot access bucket {}: {context}",
                self.bucket
            )));
        }
        if !auto_create {
            return Err(StoreError::configuration(format!(
                "bucket {} does not exist",
                self.bucket
            )));
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if region != DEFAULT_AWS_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("Created bucket {}", self.bucket);
                Ok(())
            }
            Err(e) => {
                let context = DisplayErrorContext(&e).to_string();
                if e.into_service_error().is_bucket_already_owned_by_you() {
                    Ok(())
                } else {
                    Err(StoreError::configuration(format!(
                        "cannot create bucket {}: {context}",
                        self.bucket
                    )))
                }
            }
        }
    }

    /// Object key of the payload.
    fn data_key(id: &str) -> String {
        format!("{id}/{DATA_FILE}")
    }

    /// Object key of the metadata document.
    fn metadata_key(id: &str) -> String {
        format!("{id}/{METADATA_FILE}")
    }

    /// Map an AWS SDK error to a backend error with context.
    fn map_sdk_error(context: &str, err: impl std::error::Error) -> StoreError {
        StoreError::Backend(anyhow::anyhow!(
            "S3 {context}: {}",
            DisplayErrorContext(err)
        ))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        debug!("S3 head_object: bucket={} key={}", self.bucket, key);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(Self::map_sdk_error("head_object", service_err))
                }
            }
        }
    }

    async fn read_metadata(&self, id: &str) -> Result<Metadata, StoreError> {
        validate_id(id)?;
        let key = Self::metadata_key(id);
        debug!("S3 get_object: bucket={} key={}", self.bucket, key);

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    StoreError::NotFound { id: id.to_string() }
                } else {
                    Self::map_sdk_error("get_object", service_err)
                }
            })?;

        let raw = resp
            .body
            .collect()
            .await
            .map_err(|e| Self::map_sdk_error("get_object body", e))?
            .into_bytes();

        Metadata::from_json(id, &raw)
    }

    async fn write_metadata(&self, metadata: &Metadata) -> Result<(), StoreError> {
        let key = Self::metadata_key(&metadata.id);
        debug!("S3 put_object: bucket={} key={}", self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/json")
            .body(ByteStream::from(metadata.to_json()?))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error("put_object", e))?;
        Ok(())
    }

    /// Upload the payload, returning the number of bytes stored.
    async fn upload_data(
        &self,
        pending: &mut PendingUpload,
        mut data: BlobStream,
    ) -> Result<u64, StoreError> {
        let key = pending.key.as_str();
        let mut buf = BytesMut::new();
        let exhausted = fill_part(&mut data, &mut buf, PART_SIZE).await?;

        if exhausted {
            let len = buf.len() as u64;
            debug!("S3 put_object: bucket={} key={} size={}", self.bucket, key, len);
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(buf.freeze()))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;
            return Ok(len);
        }

        let create_resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error("create_multipart_upload", e))?;

        let upload_id = create_resp
            .upload_id()
            .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("S3 did not return upload ID")))?
            .to_string();
        pending.upload_id = Some(upload_id.clone());

        let len = self.upload_parts(key, &upload_id, data, buf).await?;
        pending.upload_id = None;
        Ok(len)
    }

    /// Send `buf` and the rest of `data` as parts, then complete the upload.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut data: BlobStream,
        mut buf: BytesMut,
    ) -> Result<u64, StoreError> {
        let mut completed_parts = Vec::new();
        let mut total: u64 = 0;
        let mut part_number: i32 = 1;
        let mut exhausted = false;

        loop {
            let part = buf.split_to(buf.len().min(PART_SIZE)).freeze();
            total += part.len() as u64;

            debug!(
                "S3 upload_part: key={} part={} size={}",
                key,
                part_number,
                part.len()
            );
            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("upload_part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(resp.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;

            if !exhausted {
                exhausted = fill_part(&mut data, &mut buf, PART_SIZE).await?;
            }
            if exhausted && buf.is_empty() {
                break;
            }
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error("complete_multipart_upload", e))?;

        Ok(total)
    }
}

/// Payload of an `add` whose metadata object has not been written yet.
///
/// `upload_id` is set while a multipart upload is open. Discarding aborts
/// that upload, or deletes the payload object once it exists.
struct PendingUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: Option<String>,
    armed: bool,
}

impl PendingUpload {
    fn new(client: Client, bucket: &str, key: String) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            key,
            upload_id: None,
            armed: true,
        }
    }

    fn commit(mut self) {
        self.armed = false;
    }

    async fn discard(mut self) {
        self.armed = false;
        discard_upload(&self.client, &self.bucket, &self.key, self.upload_id.take()).await;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Dropped mid-upload; cleanup needs the runtime, so it runs detached.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let bucket = std::mem::take(&mut self.bucket);
                let key = std::mem::take(&mut self.key);
                let upload_id = self.upload_id.take();
                handle.spawn(async move {
                    discard_upload(&client, &bucket, &key, upload_id).await;
                });
            }
            Err(_) => warn!("No runtime left to discard pending upload of {}", self.key),
        }
    }
}

/// Abort an open multipart upload, or delete the payload object.
async fn discard_upload(client: &Client, bucket: &str, key: &str, upload_id: Option<String>) {
    let result = match upload_id {
        Some(upload_id) => {
            debug!("S3 abort_multipart_upload: key={} upload_id={}", key, upload_id);
            client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| DisplayErrorContext(e).to_string())
        }
        None => {
            debug!("S3 delete_object: bucket={} key={}", bucket, key);
            client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| DisplayErrorContext(e).to_string())
        }
    };

    if let Err(e) = result {
        warn!("Failed to discard pending upload of {}: {}", key, e);
    }
}

/// Pull chunks from `data` into `buf` until it holds at least `part_size`
/// bytes. Returns `true` once the stream is exhausted.
async fn fill_part(
    data: &mut BlobStream,
    buf: &mut BytesMut,
    part_size: usize,
) -> std::io::Result<bool> {
    while buf.len() < part_size {
        match data.next().await {
            Some(chunk) => buf.extend_from_slice(&chunk?),
            None => return Ok(true),
        }
    }
    Ok(false)
}

/// Adapt an SDK response body to a payload stream.
fn body_stream(body: ByteStream) -> BlobStream {
    Box::pin(stream::try_unfold(body, |mut body| async move {
        match body.try_next().await {
            Ok(Some(chunk)) => Ok(Some((chunk, body))),
            Ok(None) => Ok(None),
            Err(e) => Err(std::io::Error::other(e)),
        }
    }))
}

impl StorageProvider for ObjectStoreProvider {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn kind(&self) -> RecordKind {
        self.kind
    }

    fn add(&self, record: NewRecord, data: BlobStream) -> ProviderFuture<'_, Metadata> {
        Box::pin(async move {
            record.check(self.kind)?;

            let data_key = Self::data_key(&record.id);
            if self.exists(&data_key).await? || self.exists(&Self::metadata_key(&record.id)).await?
            {
                return Err(StoreError::AlreadyExists { id: record.id });
            }

            let id = record.id.clone();
            let mut pending = PendingUpload::new(self.client.clone(), &self.bucket, data_key);
            let upload = &mut pending;
            let result: Result<Metadata, StoreError> = async move {
                let content_length = self.upload_data(upload, data).await?;
                let metadata = record.into_metadata(self.kind, content_length);
                self.write_metadata(&metadata).await?;
                Ok::<_, StoreError>(metadata)
            }
            .await;

            match result {
                Ok(metadata) => {
                    pending.commit();
                    Ok(metadata)
                }
                Err(e) => {
                    warn!("Upload of blob {} failed, discarding payload: {}", id, e);
                    pending.discard().await;
                    Err(e)
                }
            }
        })
    }

    fn get_metadata(&self, id: &str) -> ProviderFuture<'_, Metadata> {
        let id = id.to_string();
        Box::pin(async move { self.read_metadata(&id).await })
    }

    fn get(&self, id: &str) -> ProviderFuture<'_, BlobStream> {
        let id = id.to_string();
        Box::pin(async move {
            validate_id(&id)?;
            if !self.exists(&Self::metadata_key(&id)).await? {
                return Err(StoreError::NotFound { id });
            }

            let key = Self::data_key(&id);
            debug!("S3 get_object: bucket={} key={}", self.bucket, key);

            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        StoreError::NotFound { id: id.clone() }
                    } else {
                        Self::map_sdk_error("get_object", service_err)
                    }
                })?;

            Ok(body_stream(resp.body))
        })
    }

    fn remove(&self, id: &str) -> ProviderFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            validate_id(&id)?;

            // Metadata first: a visible record always has its payload.
            let mut missing = 0;
            for key in [Self::metadata_key(&id), Self::data_key(&id)] {
                if !self.exists(&key).await? {
                    missing += 1;
                    continue;
                }

                debug!("S3 delete_object: bucket={} key={}", self.bucket, key);
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("delete_object", e))?;
            }

            if missing == 2 {
                return Err(StoreError::NotFound { id });
            }
            Ok(())
        })
    }

    fn transfer_ownership(&self, id: &str, to: Owner) -> ProviderFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut metadata = self.read_metadata(&id).await?;
            metadata.transfer_to(to)?;
            self.write_metadata(&metadata).await
        })
    }

    fn authorize(&self, id: &str, policy: AuthorizationPolicy) -> ProviderFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut metadata = self.read_metadata(&id).await?;
            metadata.replace_policy(policy)?;
            self.write_metadata(&metadata).await
        })
    }
}

// -- Tests -------------------------------------------------------------------
