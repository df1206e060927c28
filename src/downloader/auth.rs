// Managed auth: attestation-backed short-lived API credentials

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use super::config::{KeyValueStore, KEY_AUTH_CREDENTIAL};
use super::errors::AuthError;
use super::traits::ProgressEmitter;
use super::utils::response_error_detail;

/// Authorization scheme of managed credentials
pub const MANAGED_AUTH_SCHEME: &str = "Nickel-Auth";

/// Source of a bearer credential for the orchestration API
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Return a credential the server currently accepts, regenerating it
    /// when the cached one is missing or rejected
    async fn ensure_valid(&self, progress: &ProgressEmitter) -> Result<String, AuthError>;
}

/// Device attestation collaborator (key generation and key attestation)
#[async_trait]
pub trait Attestor: Send + Sync {
    /// Create a new attestation key and return its identifier
    async fn generate_key(&self) -> Result<String, AuthError>;

    /// Attest `key_id`, binding it to `client_data_hash`
    async fn attest_key(&self, key_id: &str, client_data_hash: &[u8]) -> Result<Vec<u8>, AuthError>;
}

/// Attestor for platforms without device attestation
pub struct UnsupportedAttestor;

#[async_trait]
impl Attestor for UnsupportedAttestor {
    async fn generate_key(&self) -> Result<String, AuthError> {
        Err(AuthError::Unsupported(
            "no attestation service on this platform".to_string(),
        ))
    }

    async fn attest_key(&self, _key_id: &str, _hash: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(AuthError::Unsupported(
            "no attestation service on this platform".to_string(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    challenge: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttestationRequest<'a> {
    attestation: String,
    challenge: &'a str,
    key_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttestationResponse {
    temp_key: String,
}

/// Auth provider talking to the managed-auth server
pub struct ManagedAuthProvider {
    http: reqwest::Client,
    base_url: Url,
    store: Arc<dyn KeyValueStore>,
    attestor: Arc<dyn Attestor>,
}

impl ManagedAuthProvider {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        store: Arc<dyn KeyValueStore>,
        attestor: Arc<dyn Attestor>,
    ) -> Self {
        Self {
            http,
            base_url,
            store,
            attestor,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path)
            .map_err(|e| AuthError::Parse(format!("bad auth endpoint `{}`: {}", path, e)))
    }

    async fn fetch_challenge(&self) -> Result<String, AuthError> {
        let response = self.http.get(self.endpoint("ios-challenge")?).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(AuthError::Server {
                status: status.as_u16(),
                detail: response_error_detail(&body),
            });
        }
        let parsed: ChallengeResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::Parse(e.to_string()))?;
        Ok(parsed.challenge)
    }

    /// Run the full challenge/attest/exchange flow and cache the new credential
    pub async fn attest(&self) -> Result<String, AuthError> {
        let challenge = self.fetch_challenge().await?;
        debug!("Received auth challenge");

        let key_id = self.attestor.generate_key().await?;
        let client_data_hash = Sha256::digest(challenge.as_bytes());
        let attestation = self.attestor.attest_key(&key_id, &client_data_hash).await?;

        let request = AttestationRequest {
            attestation: BASE64.encode(attestation),
            challenge: &challenge,
            key_id: &key_id,
        };
        let response = self
            .http
            .post(self.endpoint("ios-auth")?)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(AuthError::Server {
                status: status.as_u16(),
                detail: response_error_detail(&body),
            });
        }
        let parsed: AttestationResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::Parse(e.to_string()))?;

        self.store
            .set(KEY_AUTH_CREDENTIAL, &parsed.temp_key)
            .map_err(|e| AuthError::Store(e.to_string()))?;
        info!("Obtained new managed credential");
        Ok(parsed.temp_key)
    }

    /// Ask the server whether `credential` is still accepted. 401/403 mean
    /// "no", any other non-200 status is a hard error.
    pub async fn validate(&self, credential: &str) -> Result<bool, AuthError> {
        let response = self
            .http
            .post(self.endpoint("ios-validate")?)
            .header(AUTHORIZATION, format!("{} {}", MANAGED_AUTH_SCHEME, credential))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(AuthError::Server {
                    status: status.as_u16(),
                    detail: response_error_detail(&body),
                })
            }
        }
    }

    pub fn cached_credential(&self) -> Option<String> {
        self.store
            .get(KEY_AUTH_CREDENTIAL)
            .filter(|c| !c.trim().is_empty())
    }

    /// Forget the cached credential
    pub fn invalidate(&self) -> Result<(), AuthError> {
        self.store
            .remove(KEY_AUTH_CREDENTIAL)
            .map_err(|e| AuthError::Store(e.to_string()))
    }
}

#[async_trait]
impl AuthProvider for ManagedAuthProvider {
    async fn ensure_valid(&self, progress: &ProgressEmitter) -> Result<String, AuthError> {
        if let Some(credential) = self.cached_credential() {
            progress.status("Validating credential");
            match self.validate(&credential).await {
                Ok(true) => {
                    debug!("Cached credential is valid");
                    return Ok(credential);
                }
                Ok(false) => info!("Cached credential was rejected, regenerating"),
                Err(e) => warn!("Credential validation failed ({}), regenerating", e),
            }
            // A failed attestation must not leave the rejected credential cached
            self.invalidate()?;
            progress.status("Regenerating credential");
        } else {
            progress.status("Authenticating device");
        }

        self.attest().await
    }
}
