//! Signed access tokens presented as the MQTT password.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::CredentialConfig;
use crate::error::{GatewayError, Result};

/// Token claims: issued-at, expiry, and the project as audience.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

/// Signs tokens for one device.
pub struct CredentialIssuer {
    algorithm: Algorithm,
    key: EncodingKey,
    audience: String,
    lifetime: Duration,
}

impl std::fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("algorithm", &self.algorithm)
            .field("audience", &self.audience)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl CredentialIssuer {
    /// Load the signing key named in the settings.
    pub fn from_config(config: &CredentialConfig, project_id: &str) -> Result<Self> {
        let key = read_key(&config.private_key_file)?;
        Self::new(&config.algorithm, &key, project_id, config.lifetime())
    }

    /// `key` is a PEM private key, or the raw secret for HS* algorithms.
    pub fn new(
        algorithm: &str,
        key: &[u8],
        audience: impl Into<String>,
        lifetime: Duration,
    ) -> Result<Self> {
        let algorithm = Algorithm::from_str(algorithm)
            .map_err(|_| GatewayError::credential(format!("unknown algorithm {}", algorithm)))?;

        let key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => EncodingKey::from_secret(key),
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => EncodingKey::from_rsa_pem(key)?,
            Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(key)?,
            Algorithm::EdDSA => EncodingKey::from_ed_pem(key)?,
        };

        Ok(Self {
            algorithm,
            key,
            audience: audience.into(),
            lifetime,
        })
    }

    /// Sign a fresh token valid for the configured lifetime.
    pub fn issue(&self) -> Result<Credential> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iat: now,
            exp: now + self.lifetime.as_secs() as i64,
            aud: self.audience.clone(),
        };
        let token = jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.key)?;

        tracing::debug!(
            algorithm = ?self.algorithm,
            expires_in = ?self.lifetime,
            "Issued access token"
        );

        Ok(Credential {
            token,
            issued_at: Instant::now(),
            lifetime: self.lifetime,
        })
    }
}

fn read_key(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        GatewayError::credential(format!("failed to read key {}: {}", path.display(), e))
    })
}

/// An issued token and when it stops being valid.
#[derive(Debug, Clone)]
pub struct Credential {
    token: String,
    issued_at: Instant,
    lifetime: Duration,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.lifetime
    }

    /// Whether less than `margin` of validity is left.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        self.needs_refresh_at(Instant::now(), margin)
    }

    pub fn needs_refresh_at(&self, now: Instant, margin: Duration) -> bool {
        self.expires_at().saturating_duration_since(now) < margin
    }
}
