//! Per-blob access policies.
//!
//! Every full record carries an `isAuthorized` structure naming its owner and
//! an [`AccessLevel`] for each command and query.  Submitted policies are
//! partial: they are deep-merged onto the all-`false` defaults, the owner is
//! forced by the system, and only then is the result validated.  Validation
//! is strict deserialization: unknown keys, missing keys and non-boolean
//! flags are all rejected.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::StoreError;

/// Owner recorded for blobs created without an authenticated principal.
///
/// No principal can ever carry this identity through the decision function,
/// so such blobs have no effective owner.
pub const ANONYMOUS_OWNER: &str = "anonymous";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Subject identifier from the verified token.
    pub id: String,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Gate for a single action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AccessLevel {
    /// Any authenticated principal may perform the action.
    pub for_authenticated: bool,
    /// Anonymous callers may perform the action.
    pub for_public: bool,
}

impl AccessLevel {
    pub const fn new(for_authenticated: bool, for_public: bool) -> Self {
        Self {
            for_authenticated,
            for_public,
        }
    }
}

/// Blob owner identifier, a JSON string or number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Owner {
    Id(String),
    Number(serde_json::Number),
}

impl Owner {
    /// Strict identity comparison; a numeric owner never matches a subject string.
    pub fn is(&self, principal: &Principal) -> bool {
        match self {
            Owner::Id(id) => *id == principal.id,
            Owner::Number(_) => false,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Owner::Id(id) => Value::String(id.clone()),
            Owner::Number(n) => Value::Number(n.clone()),
        }
    }
}

impl From<&Principal> for Owner {
    fn from(principal: &Principal) -> Self {
        Owner::Id(principal.id.clone())
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::Id(id) => f.write_str(id),
            Owner::Number(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Commands {
    pub remove_blob: AccessLevel,
    pub transfer_ownership: AccessLevel,
    pub authorize: AccessLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Queries {
    pub get_blob: AccessLevel,
}

/// The `isAuthorized` structure stored with every full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationPolicy {
    pub owner: Owner,
    pub commands: Commands,
    pub queries: Queries,
}

/// Actions gated by a per-blob policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RemoveBlob,
    TransferOwnership,
    Authorize,
    GetBlob,
}

impl Action {
    /// Dotted path of the action inside `isAuthorized`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::RemoveBlob => "commands.removeBlob",
            Action::TransferOwnership => "commands.transferOwnership",
            Action::Authorize => "commands.authorize",
            Action::GetBlob => "queries.getBlob",
        }
    }
}

impl AuthorizationPolicy {
    /// The default policy for `owner`: every action closed to non-owners.
    pub fn with_defaults(owner: Owner) -> Self {
        Self {
            owner,
            commands: Commands::default(),
            queries: Queries::default(),
        }
    }

    /// The access level configured for `action`.
    pub fn level(&self, action: Action) -> AccessLevel {
        match action {
            Action::RemoveBlob => self.commands.remove_blob,
            Action::TransferOwnership => self.commands.transfer_ownership,
            Action::Authorize => self.commands.authorize,
            Action::GetBlob => self.queries.get_blob,
        }
    }
}

/// Default `isAuthorized` without an owner, as JSON.
pub fn default_policy_value() -> Value {
    json!({
        "commands": Commands::default(),
        "queries": Queries::default(),
    })
}

/// Recursively merge `overlay` onto `target`.
///
/// Objects merge key by key; any other overlay value replaces the target.
pub fn merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overlay) => *target = overlay.clone(),
    }
}

/// Validate a complete `isAuthorized` structure.
pub fn validate(value: Value) -> Result<AuthorizationPolicy, StoreError> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::validation(format!("isAuthorized is malformed: {e}")))
}

/// Turn a caller-submitted partial policy into a stored policy.
///
/// The order is fixed: merge onto the defaults, force the owner, validate.
/// `None` and JSON `null` mean "no overrides".
pub fn prepare_policy(
    submission: Option<&Value>,
    owner: Owner,
) -> Result<AuthorizationPolicy, StoreError> {
    let mut merged = default_policy_value();

    match submission {
        None | Some(Value::Null) => {}
        Some(overlay @ Value::Object(_)) => merge(&mut merged, overlay),
        Some(_) => return Err(StoreError::validation("isAuthorized must be an object")),
    }

    if let Value::Object(map) = &mut merged {
        map.insert("owner".to_string(), owner.to_value());
    }

    validate(merged)
}

/// Decide whether `principal` may perform `action` on a blob guarded by `policy`.
pub fn has_access(
    principal: Option<&Principal>,
    policy: &AuthorizationPolicy,
    action: Action,
) -> bool {
    let level = policy.level(action);
    match principal {
        Some(principal) if policy.owner.is(principal) => true,
        Some(_) => level.for_authenticated,
        None => level.for_public,
    }
}

/// Like [`has_access`], but as a `Result` suitable for `?`.
pub fn ensure_access(
    principal: Option<&Principal>,
    policy: &AuthorizationPolicy,
    action: Action,
) -> Result<(), StoreError> {
    if has_access(principal, policy, action) {
        Ok(())
    } else {
        Err(StoreError::AuthorizationDenied {
            action: action.as_str().to_string(),
            authenticated: principal.is_some(),
        })
    }
}

/// Creation gate: a deployment-wide level with no owner override.
pub fn can_create(principal: Option<&Principal>, gate: &AccessLevel) -> bool {
    match principal {
        Some(_) => gate.for_authenticated,
        None => gate.for_public,
    }
}
