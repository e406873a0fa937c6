//! Blob handlers: add, get, remove, transfer ownership, authorize.
//!
//! Request parameters travel in the `x-metadata` header as JSON so the
//! request body can carry the raw payload.  Every check that can fail on
//! caller input runs before the storage provider is touched.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures_util::TryStreamExt;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::auth::Identity;
use crate::errors::StoreError;
use crate::metrics::{BLOB_OPERATIONS_TOTAL, BYTES_RECEIVED_TOTAL, BYTES_SENT_TOTAL};
use crate::policy::{
    can_create, ensure_access, prepare_policy, Action, Owner, Principal, ANONYMOUS_OWNER,
};
use crate::storage::provider::{BlobStream, Metadata, NewRecord, RecordKind};
use crate::AppState;

/// Header carrying the JSON request envelope and response metadata.
pub const X_METADATA: &str = "x-metadata";

/// Action name of the creation gate, used in denial messages.
const ADD_BLOB_ACTION: &str = "commands.addBlob";

// -- Request envelopes --------------------------------------------------------

/// `x-metadata` of `POST /add-blob`.
#[derive(Debug, Deserialize, garde::Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddBlobEnvelope {
    /// Echoed in `content-disposition`, so no control characters.
    #[garde(length(min = 1, max = 1024), pattern(r"^[^\x00-\x1f\x7f]+$"))]
    pub file_name: String,

    #[serde(default)]
    #[garde(length(min = 1, max = 255), pattern(r"^[^\x00-\x1f\x7f]+$"))]
    pub content_type: Option<String>,

    /// Partial policy; merged onto the defaults.
    #[serde(default)]
    #[garde(skip)]
    pub is_authorized: Option<Value>,
}

/// `x-metadata` of `POST /remove-blob`.
#[derive(Debug, Deserialize, garde::Validate)]
pub struct RemoveBlobEnvelope {
    #[garde(length(min = 1))]
    pub id: String,
}

/// `x-metadata` of `POST /transfer-ownership`.
#[derive(Debug, Deserialize, garde::Validate)]
pub struct TransferOwnershipEnvelope {
    #[garde(length(min = 1))]
    pub id: String,

    #[garde(skip)]
    pub to: Owner,
}

/// `x-metadata` of `POST /authorize`.
#[derive(Debug, Deserialize, garde::Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeEnvelope {
    #[garde(length(min = 1))]
    pub id: String,

    #[serde(default)]
    #[garde(skip)]
    pub is_authorized: Option<Value>,
}

/// Parse and validate the `x-metadata` header.
pub fn parse_envelope<T>(headers: &HeaderMap) -> Result<T, StoreError>
where
    T: DeserializeOwned + garde::Validate,
    T::Context: Default,
{
    let raw = headers
        .get(X_METADATA)
        .ok_or_else(|| StoreError::validation("x-metadata header is missing"))?;
    let raw = std::str::from_utf8(raw.as_bytes())
        .map_err(|_| StoreError::validation("x-metadata header is not valid UTF-8"))?;

    let envelope: T = serde_json::from_str(raw)
        .map_err(|e| StoreError::validation(format!("x-metadata is malformed: {e}")))?;
    envelope
        .validate()
        .map_err(|e| StoreError::validation(format!("x-metadata is invalid: {e}")))?;
    Ok(envelope)
}

// -- Helpers ------------------------------------------------------------------

/// Count the outcome of a storage call and log server-side failures.
fn observe<T>(
    operation: &'static str,
    id: &str,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    counter!(BLOB_OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);

    if let Err(e) = &result {
        if e.is_internal() {
            error!("{} failed for blob {}: {}", operation, id, e);
        } else {
            debug!("{} rejected for blob {}: {}", operation, id, e);
        }
    }
    result
}

/// Load metadata and run the policy check for `action`, full records only.
async fn authorize_action(
    state: &AppState,
    principal: Option<&Principal>,
    id: &str,
    action: Action,
) -> Result<Metadata, StoreError> {
    let metadata = state.storage.get_metadata(id).await?;
    if state.storage.kind() == RecordKind::Full {
        ensure_access(principal, metadata.policy()?, action)?;
    }
    Ok(metadata)
}

fn header_value(value: &str) -> Result<HeaderValue, StoreError> {
    HeaderValue::from_str(value).map_err(|e| StoreError::Backend(e.into()))
}

/// Adapt the request body to a payload stream.
fn request_stream(body: Body) -> BlobStream {
    Box::pin(
        body.into_data_stream()
            .map_err(std::io::Error::other)
            .inspect_ok(|chunk| counter!(BYTES_RECEIVED_TOTAL).increment(chunk.len() as u64)),
    )
}

// -- Handlers -----------------------------------------------------------------

/// `POST /api/v1/add-blob` -- Store a new blob.
#[utoipa::path(
    post,
    path = "/api/v1/add-blob",
    tag = "Blob",
    operation_id = "AddBlob",
    params(
        ("x-metadata" = String, Header, description = "JSON {fileName, contentType?, isAuthorized?}"),
    ),
    request_body(content = String, description = "Raw blob payload", content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Blob stored; body is {\"id\": ...}"),
        (status = 400, description = "Malformed x-metadata or policy"),
        (status = 401, description = "Not allowed to add blobs"),
        (status = 500, description = "Internal error")
    )
)]
pub async fn add_blob(
    State(state): State<Arc<AppState>>,
    Extension(Identity(principal)): Extension<Identity>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, StoreError> {
    if !can_create(principal.as_ref(), &state.config.auth.add_blob) {
        return Err(StoreError::AuthorizationDenied {
            action: ADD_BLOB_ACTION.to_string(),
            authenticated: principal.is_some(),
        });
    }

    let envelope: AddBlobEnvelope = parse_envelope(&headers)?;

    let is_authorized = match state.storage.kind() {
        RecordKind::Full => {
            let owner = principal
                .as_ref()
                .map(Owner::from)
                .unwrap_or_else(|| Owner::Id(ANONYMOUS_OWNER.to_string()));
            Some(prepare_policy(envelope.is_authorized.as_ref(), owner)?)
        }
        RecordKind::Simple => match envelope.is_authorized {
            None | Some(Value::Null) => None,
            Some(_) => {
                return Err(StoreError::validation(
                    "isAuthorized is not supported for simple records",
                ))
            }
        },
    };

    let id = uuid::Uuid::new_v4().to_string();
    let record = NewRecord {
        id: id.clone(),
        file_name: envelope.file_name,
        content_type: envelope.content_type,
        is_authorized,
    };

    let metadata = observe(
        "addBlob",
        &id,
        state.storage.add(record, request_stream(body)).await,
    )?;
    info!(
        "Added blob {} ({}, {} bytes)",
        metadata.id,
        metadata.content_type,
        metadata
            .content_length
            .map_or_else(|| "?".to_string(), |n| n.to_string())
    );

    Ok(Json(json!({ "id": id })).into_response())
}

/// `GET /api/v1/blob/{id}` -- Stream a blob's payload.
#[utoipa::path(
    get,
    path = "/api/v1/blob/{id}",
    tag = "Blob",
    operation_id = "GetBlob",
    params(("id" = String, Path, description = "Blob id")),
    responses(
        (status = 200, description = "Blob payload; x-metadata carries {id, fileName, contentType}"),
        (status = 401, description = "Anonymous caller denied"),
        (status = 403, description = "Authenticated caller denied"),
        (status = 404, description = "Blob not found"),
        (status = 500, description = "Internal error")
    )
)]
pub async fn get_blob(
    State(state): State<Arc<AppState>>,
    Extension(Identity(principal)): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<Response, StoreError> {
    let metadata = observe(
        "getBlob",
        &id,
        authorize_action(&state, principal.as_ref(), &id, Action::GetBlob).await,
    )?;
    let data = observe("getBlob", &id, state.storage.get(&id).await)?;

    let body = Body::from_stream(
        data.inspect_ok(|chunk| counter!(BYTES_SENT_TOTAL).increment(chunk.len() as u64)),
    );

    let envelope = json!({
        "id": metadata.id,
        "fileName": metadata.file_name,
        "contentType": metadata.content_type,
    });

    let mut response = (StatusCode::OK, body).into_response();
    let hdrs = response.headers_mut();
    hdrs.insert("content-type", header_value(&metadata.content_type)?);
    hdrs.insert(
        "content-disposition",
        header_value(&format!("inline; filename={}", metadata.file_name))?,
    );
    hdrs.insert(X_METADATA, header_value(&envelope.to_string())?);
    Ok(response)
}

/// `POST /api/v1/remove-blob` -- Delete a blob.
#[utoipa::path(
    post,
    path = "/api/v1/remove-blob",
    tag = "Blob",
    operation_id = "RemoveBlob",
    params(("x-metadata" = String, Header, description = "JSON {id}")),
    responses(
        (status = 200, description = "Blob removed"),
        (status = 400, description = "Malformed x-metadata"),
        (status = 401, description = "Anonymous caller denied"),
        (status = 403, description = "Authenticated caller denied"),
        (status = 404, description = "Blob not found"),
        (status = 500, description = "Internal error")
    )
)]
pub async fn remove_blob(
    State(state): State<Arc<AppState>>,
    Extension(Identity(principal)): Extension<Identity>,
    headers: HeaderMap,
) -> Result<Response, StoreError> {
    let envelope: RemoveBlobEnvelope = parse_envelope(&headers)?;
    let id = envelope.id;

    observe(
        "removeBlob",
        &id,
        authorize_action(&state, principal.as_ref(), &id, Action::RemoveBlob).await,
    )?;
    observe("removeBlob", &id, state.storage.remove(&id).await)?;

    info!("Removed blob {}", id);
    Ok(StatusCode::OK.into_response())
}

/// `POST /api/v1/transfer-ownership` -- Hand a blob to a new owner.
#[utoipa::path(
    post,
    path = "/api/v1/transfer-ownership",
    tag = "Blob",
    operation_id = "TransferOwnership",
    params(("x-metadata" = String, Header, description = "JSON {id, to}")),
    responses(
        (status = 200, description = "Owner changed"),
        (status = 400, description = "Malformed x-metadata"),
        (status = 401, description = "Anonymous caller denied"),
        (status = 403, description = "Authenticated caller denied"),
        (status = 404, description = "Blob not found"),
        (status = 500, description = "Internal error")
    )
)]
pub async fn transfer_ownership(
    State(state): State<Arc<AppState>>,
    Extension(Identity(principal)): Extension<Identity>,
    headers: HeaderMap,
) -> Result<Response, StoreError> {
    let envelope: TransferOwnershipEnvelope = parse_envelope(&headers)?;
    let id = envelope.id;

    observe(
        "transferOwnership",
        &id,
        authorize_action(&state, principal.as_ref(), &id, Action::TransferOwnership).await,
    )?;
    observe(
        "transferOwnership",
        &id,
        state.storage.transfer_ownership(&id, envelope.to.clone()).await,
    )?;

    info!("Transferred blob {} to {}", id, envelope.to);
    Ok(StatusCode::OK.into_response())
}

/// `POST /api/v1/authorize` -- Replace a blob's policy.
#[utoipa::path(
    post,
    path = "/api/v1/authorize",
    tag = "Blob",
    operation_id = "Authorize",
    params(("x-metadata" = String, Header, description = "JSON {id, isAuthorized}")),
    responses(
        (status = 200, description = "Policy replaced"),
        (status = 400, description = "Malformed x-metadata or policy"),
        (status = 401, description = "Anonymous caller denied"),
        (status = 403, description = "Authenticated caller denied"),
        (status = 404, description = "Blob not found"),
        (status = 500, description = "Internal error")
    )
)]
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Extension(Identity(principal)): Extension<Identity>,
    headers: HeaderMap,
) -> Result<Response, StoreError> {
    let envelope: AuthorizeEnvelope = parse_envelope(&headers)?;
    let id = envelope.id;

    let owner = principal
        .as_ref()
        .map(Owner::from)
        .unwrap_or_else(|| Owner::Id(ANONYMOUS_OWNER.into()));
    let mut policy = prepare_policy(envelope.is_authorized.as_ref(), owner)?;

    let metadata = observe(
        "authorize",
        &id,
        authorize_action(&state, principal.as_ref(), &id, Action::Authorize).await,
    )?;

    // An anonymous caller cannot become owner; the current owner stays.
    if principal.is_none() {
        policy.owner = metadata.policy()?.owner.clone();
    }

    observe("authorize", &id, state.storage.authorize(&id, policy).await)?;

    info!("Replaced policy of blob {}", id);
    Ok(StatusCode::OK.into_response())
}
