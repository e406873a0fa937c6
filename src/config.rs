//! Configuration loading and types for blobgate.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, identity, record shape, storage backend, logging
//! and metrics.

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::path::Path;

use crate::policy::AccessLevel;
use crate::storage::provider::RecordKind;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity and creation-gate settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Which metadata shape records carry.
    #[serde(default)]
    pub records: RecordsConfig,

    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Allowed CORS origins; `*` allows any.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// Identity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Who may create blobs. There is no owner yet, so this is a plain level.
    #[serde(default = "default_add_blob")]
    pub add_blob: AccessLevel,

    /// Token issuers whose signatures are trusted.
    #[serde(default)]
    pub identity_providers: Vec<IdentityProviderConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            add_blob: default_add_blob(),
            identity_providers: Vec::new(),
        }
    }
}

/// One trusted token issuer.
///
/// RS*/ES*/PS* algorithms need `public_key_file` (PEM); HS* need `secret`.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityProviderConfig {
    /// Expected `iss` claim.
    pub issuer: String,

    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,

    #[serde(default)]
    pub public_key_file: Option<String>,

    #[serde(default)]
    pub secret: Option<String>,
}

/// Record shape settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RecordsConfig {
    /// `full` (per-blob policies) or `simple`.
    #[serde(default)]
    pub kind: RecordKind,
}

/// Storage backend configuration, selected by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Records as directories on local disk.
    Filesystem(FilesystemConfig),
    /// Records as object pairs in an S3-compatible bucket.
    S3(ObjectStoreConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Filesystem(FilesystemConfig::default())
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilesystemConfig {
    /// Root directory for records; a fresh temporary directory when omitted.
    #[serde(default)]
    pub root_directory: Option<String>,
}

/// S3-compatible object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Host of a custom S3-compatible endpoint (e.g. MinIO); AWS when omitted.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_true")]
    pub use_tls: bool,

    /// Explicit access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key: Option<String>,

    /// Explicit secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_key: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_bucket_name")]
    pub bucket_name: String,

    /// Create the bucket on startup if it does not exist.
    #[serde(default = "default_true")]
    pub auto_create_bucket: bool,
}

impl ObjectStoreConfig {
    /// Endpoint URL for a custom endpoint, `None` for AWS itself.
    pub fn endpoint_url(&self) -> Option<String> {
        let host = self.endpoint.as_deref().filter(|h| !h.is_empty())?;
        let scheme = if self.use_tls { "https" } else { "http" };
        Some(match self.port {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_add_blob() -> AccessLevel {
    AccessLevel::new(true, false)
}

fn default_algorithm() -> Algorithm {
    Algorithm::RS256
}

fn default_region() -> String {
    "eu-central-1".to_string()
}

fn default_bucket_name() -> String {
    "blobgate".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.cors_origins, vec!["*"]);
        assert_eq!(config.auth.add_blob, AccessLevel::new(true, false));
        assert!(config.auth.identity_providers.is_empty());
        assert_eq!(config.records.kind, RecordKind::Full);
        assert!(matches!(
            config.storage,
            StorageConfig::Filesystem(FilesystemConfig {
                root_directory: None
            })
        ));
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 8080
  cors_origins: ["https://app.example.com"]
auth:
  add_blob: { forAuthenticated: true, forPublic: true }
  identity_providers:
    - issuer: https://auth.example.com
      algorithm: HS256
      secret: hunter2
records:
  kind: simple
storage:
  type: s3
  endpoint: localhost
  port: 9001
  use_tls: false
  access_key: wolkenkit
  secret_key: wolkenkit
  bucket_name: integration-tests
logging:
  level: debug
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.auth.add_blob.for_public);
        assert_eq!(config.auth.identity_providers[0].algorithm, Algorithm::HS256);
        assert_eq!(
            config.auth.identity_providers[0].secret.as_deref(),
            Some("hunter2")
        );
        assert_eq!(config.records.kind, RecordKind::Simple);
        assert_eq!(config.logging.format, "json");

        let StorageConfig::S3(s3) = config.storage else {
            panic!("expected s3 storage");
        };
        assert_eq!(s3.bucket_name, "integration-tests");
        assert_eq!(s3.region, "eu-central-1");
        assert!(s3.auto_create_bucket);
        assert_eq!(s3.endpoint_url().as_deref(), Some("http://localhost:9001"));
    }

    #[test]
    fn test_endpoint_url() {
        let mut s3: ObjectStoreConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(s3.endpoint_url(), None);

        s3.endpoint = Some("minio.internal".into());
        assert_eq!(s3.endpoint_url().as_deref(), Some("https://minio.internal"));

        s3.port = Some(9000);
        s3.use_tls = false;
        assert_eq!(
            s3.endpoint_url().as_deref(),
            Some("http://minio.internal:9000")
        );
    }

    #[test]
    fn test_filesystem_storage() {
        let yaml = "storage:\n  type: filesystem\n  root_directory: /var/lib/blobgate\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let StorageConfig::Filesystem(fs) = config.storage else {
            panic!("expected filesystem storage");
        };
        assert_eq!(fs.root_directory.as_deref(), Some("/var/lib/blobgate"));
    }

    #[test]
    fn test_unknown_gate_flag_rejected() {
        let yaml = "auth:\n  add_blob: { forEveryone: true }\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
