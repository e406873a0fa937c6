//! Bearer token verification.
//!
//! Callers identify themselves with `Authorization: Bearer <jwt>`.  A token
//! is accepted when it verifies against one of the configured issuers: the
//! signature checks out with that issuer's key, `iss` matches and `exp` lies
//! in the future.  The `sub` claim becomes the [`Principal`] id.
//!
//! No header at all means an anonymous caller, which is not an error; the
//! policy engine decides what anonymous callers may do.

use anyhow::Context;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::IdentityProviderConfig;
use crate::errors::StoreError;
use crate::policy::Principal;

/// Identity of the caller, attached to each request by the auth middleware.
#[derive(Debug, Clone, Default)]
pub struct Identity(pub Option<Principal>);

/// Claims read from a verified token.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// A token issuer whose signatures are trusted.
pub struct TrustedIssuer {
    issuer: String,
    key: DecodingKey,
    algorithm: Algorithm,
}

impl TrustedIssuer {
    pub fn new(issuer: impl Into<String>, key: DecodingKey, algorithm: Algorithm) -> Self {
        Self {
            issuer: issuer.into(),
            key,
            algorithm,
        }
    }

    /// Load the issuer's key from configuration.
    ///
    /// HMAC algorithms use `secret`; everything else reads a PEM public key
    /// from `public_key_file`.
    pub fn from_config(config: &IdentityProviderConfig) -> anyhow::Result<Self> {
        let key = match config.algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = config.secret.as_deref().with_context(|| {
                    format!("issuer {} uses {:?} but has no secret", config.issuer, config.algorithm)
                })?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            algorithm => {
                let path = config.public_key_file.as_deref().with_context(|| {
                    format!("issuer {} uses {algorithm:?} but has no public_key_file", config.issuer)
                })?;
                let pem = std::fs::read(path)
                    .with_context(|| format!("cannot read public key {path}"))?;
                match algorithm {
                    Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(&pem),
                    Algorithm::EdDSA => DecodingKey::from_ed_pem(&pem),
                    _ => DecodingKey::from_rsa_pem(&pem),
                }
                .with_context(|| format!("invalid public key {path}"))?
            }
        };

        Ok(Self::new(config.issuer.clone(), key, config.algorithm))
    }
}

/// Verifies bearer tokens against a fixed set of issuers.
#[derive(Default)]
pub struct IdentityVerifier {
    issuers: Vec<TrustedIssuer>,
}

impl IdentityVerifier {
    pub fn new(issuers: Vec<TrustedIssuer>) -> Self {
        Self { issuers }
    }

    /// Build a verifier from the configured identity providers.
    pub fn from_config(providers: &[IdentityProviderConfig]) -> anyhow::Result<Self> {
        let issuers = providers
            .iter()
            .map(TrustedIssuer::from_config)
            .collect::<anyhow::Result<Vec<_>>>()?;

        for issuer in &issuers {
            info!("Trusting identity provider {} ({:?})", issuer.issuer, issuer.algorithm);
        }
        Ok(Self::new(issuers))
    }

    /// Resolve the value of an `Authorization` header to a caller.
    ///
    /// `None` means anonymous.  A header that is present but unusable is an
    /// error rather than a silent downgrade to anonymous.
    pub fn identify(&self, header: Option<&str>) -> Result<Option<Principal>, StoreError> {
        let Some(header) = header else {
            return Ok(None);
        };

        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StoreError::Unauthenticated {
                message: "expected a bearer token".to_string(),
            })?;

        self.verify_token(token).map(Some)
    }

    /// Verify `token` against each issuer using the token's algorithm.
    pub fn verify_token(&self, token: &str) -> Result<Principal, StoreError> {
        let header = decode_header(token).map_err(|e| StoreError::Unauthenticated {
            message: e.to_string(),
        })?;

        let mut last_error = "no identity provider accepts this token".to_string();
        for issuer in self.issuers.iter().filter(|i| i.algorithm == header.alg) {
            let mut validation = Validation::new(issuer.algorithm);
            validation.set_issuer(&[issuer.issuer.as_str()]);
            validation.validate_aud = false;

            match decode::<Claims>(token, &issuer.key, &validation) {
                Ok(data) => {
                    debug!("Token verified: sub={} iss={}", data.claims.sub, issuer.issuer);
                    return Ok(Principal::new(data.claims.sub));
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(StoreError::Unauthenticated {
            message: last_error,
        })
    }
}
