pub mod signature;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::GithubConfig;
use crate::github::{API_VERSION, USER_AGENT};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("GitHub App credentials are not configured (app_id and private_key_path required)")]
    NotConfigured,

    #[error("Failed to read app private key: {0}")]
    PrivateKey(String),

    #[error("Failed to sign app JWT: {0}")]
    Jwt(String),

    #[error("Token exchange rejected: status {status}: {message}")]
    Exchange { status: u16, message: String },

    #[error("Token exchange request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A short-lived installation access token. Lives only in process memory;
/// the manager replaces it once `expires_at` is near.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Tokens are treated as expired this many seconds early, so a request
    /// never goes out with a token at its validity boundary.
    const EXPIRY_SKEW_SECS: i64 = 60;

    pub fn is_expired(&self) -> bool {
        Utc::now() + chrono::Duration::seconds(Self::EXPIRY_SKEW_SECS) >= self.expires_at
    }
}

/// Exchanges app credentials for an installation access token.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, installation_id: u64) -> Result<AccessToken, AuthError>;
}

/// Production exchanger: signs a short-lived RS256 app JWT and trades it for
/// an installation token via the GitHub REST API.
pub struct AppTokenExchanger {
    app_id: String,
    private_key: SecretString,
    api_base_url: String,
    http: reqwest::Client,
}

impl AppTokenExchanger {
    pub fn new(
        app_id: String,
        private_key: SecretString,
        api_base_url: String,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            app_id,
            private_key,
            api_base_url,
            http,
        })
    }

    /// Build the self-signed app assertion: issuer is the app id, issued-at
    /// backdated a minute against clock skew, expiry the GitHub maximum of
    /// ten minutes.
    fn generate_jwt(&self, now: i64) -> Result<String, AuthError> {
        #[derive(Debug, Serialize)]
        struct Claims {
            iat: i64,
            exp: i64,
            iss: String,
        }

        let claims = Claims {
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id.clone(),
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(
            self.private_key.expose_secret().as_bytes(),
        )
        .map_err(|e| AuthError::Jwt(e.to_string()))?;

        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .map_err(|e| AuthError::Jwt(e.to_string()))
    }
}

#[async_trait]
impl TokenExchanger for AppTokenExchanger {
    async fn exchange(&self, installation_id: u64) -> Result<AccessToken, AuthError> {
        #[derive(Debug, Deserialize)]
        struct ExchangeResponse {
            token: String,
            expires_at: String,
        }

        let jwt = self.generate_jwt(Utc::now().timestamp())?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base_url.trim_end_matches('/'),
            installation_id
        );

        let response = self
            .http
            .post(url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(jwt)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read token exchange response body".to_string());
            return Err(AuthError::Exchange {
                status: status.as_u16(),
                message,
            });
        }

        let payload: ExchangeResponse = response.json().await?;
        let expires_at = DateTime::parse_from_rfc3339(&payload.expires_at)
            .map_err(|e| AuthError::Exchange {
                status: status.as_u16(),
                message: format!("unparseable expires_at '{}': {}", payload.expires_at, e),
            })?
            .with_timezone(&Utc);

        Ok(AccessToken {
            token: SecretString::from(payload.token),
            expires_at,
        })
    }
}

type TokenSlot = Arc<Mutex<Option<AccessToken>>>;

/// Per-installation token cache with single-flight refresh.
///
/// Each installation gets its own slot guarded by an async mutex. A caller
/// that finds the slot empty or expired performs the exchange while holding
/// the slot lock, so concurrent misses collapse into one in-flight exchange;
/// waiters observe the refreshed token when the lock is released. A failed
/// exchange leaves the slot empty and the next caller retries. State is
/// rebuilt from zero on process restart.
pub struct TokenManager {
    exchanger: Option<Arc<dyn TokenExchanger>>,
    slots: Mutex<HashMap<u64, TokenSlot>>,
}

impl TokenManager {
    pub fn new(exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            exchanger: Some(exchanger),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// A manager that fails every `get_token` with `NotConfigured`. Lets the
    /// server start (and reject deliveries) without app credentials.
    pub fn unconfigured() -> Self {
        Self {
            exchanger: None,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Build a manager from config. Missing credentials produce an
    /// unconfigured manager; a present but unreadable key file is an error.
    pub fn from_config(config: &GithubConfig) -> Result<Self, AuthError> {
        let (Some(app_id), Some(key_path)) = (&config.app_id, &config.private_key_path) else {
            warn!("GitHub App credentials not configured; token requests will fail");
            return Ok(Self::unconfigured());
        };
        let pem = std::fs::read_to_string(key_path)
            .map_err(|e| AuthError::PrivateKey(format!("{}: {}", key_path.display(), e)))?;
        let exchanger = AppTokenExchanger::new(
            app_id.clone(),
            SecretString::from(pem),
            config.api_base_url.clone(),
        )?;
        Ok(Self::new(Arc::new(exchanger)))
    }

    async fn slot(&self, installation_id: u64) -> TokenSlot {
        self.slots
            .lock()
            .await
            .entry(installation_id)
            .or_default()
            .clone()
    }

    /// Return a valid token for the installation, reusing the cached one
    /// when it has not expired.
    #[instrument(skip(self))]
    pub async fn get_token(&self, installation_id: u64) -> Result<AccessToken, AuthError> {
        let exchanger = self
            .exchanger
            .as_ref()
            .ok_or(AuthError::NotConfigured)?
            .clone();
        let slot = self.slot(installation_id).await;
        let mut cached = slot.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.is_expired() {
                debug!("installation token cache hit");
                return Ok(token.clone());
            }
        }
        debug!("exchanging app JWT for installation token");
        let fresh = exchanger.exchange(installation_id).await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drop the cached token after an upstream authorization failure. The
    /// replacement happens on the next `get_token` call, not here.
    pub async fn invalidate(&self, installation_id: u64) {
        let slot = self.slot(installation_id).await;
        *slot.lock().await = None;
        info!(installation_id, "invalidated cached installation token");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts exchanges and hands out sequentially numbered tokens.
    struct MockExchanger {
        exchanges: AtomicUsize,
        ttl_secs: i64,
    }

    impl MockExchanger {
        fn new(ttl_secs: i64) -> Self {
            Self {
                exchanges: AtomicUsize::new(0),
                ttl_secs,
            }
        }

        fn count(&self) -> usize {
            self.exchanges.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenExchanger for MockExchanger {
        async fn exchange(&self, installation_id: u64) -> Result<AccessToken, AuthError> {
            let n = self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: SecretString::from(format!("ghs_test_{installation_id}_{n}")),
                expires_at: Utc::now() + chrono::Duration::seconds(self.ttl_secs),
            })
        }
    }

    #[tokio::test]
    async fn test_second_call_hits_cache() {
        let exchanger = Arc::new(MockExchanger::new(3600));
        let manager = TokenManager::new(exchanger.clone());

        let first = manager.get_token(42).await.unwrap();
        let second = manager.get_token(42).await.unwrap();

        assert_eq!(first.token.expose_secret(), second.token.expose_secret());
        assert_eq!(exchanger.count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_burst_triggers_one_exchange() {
        let exchanger = Arc::new(MockExchanger::new(3600));
        let manager = Arc::new(TokenManager::new(exchanger.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.get_token(7).await }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            tokens.push(token.token.expose_secret().to_string());
        }

        assert_eq!(exchanger.count(), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }

    #[tokio::test]
    async fn test_installations_cached_independently() {
        let exchanger = Arc::new(MockExchanger::new(3600));
        let manager = TokenManager::new(exchanger.clone());

        let a = manager.get_token(1).await.unwrap();
        let b = manager.get_token(2).await.unwrap();

        assert_ne!(a.token.expose_secret(), b.token.expose_secret());
        assert_eq!(exchanger.count(), 2);
    }

    #[tokio::test]
    async fn test_expired_token_is_replaced() {
        // TTL inside the skew window, so the token is already "expired"
        let exchanger = Arc::new(MockExchanger::new(10));
        let manager = TokenManager::new(exchanger.clone());

        let first = manager.get_token(42).await.unwrap();
        assert!(first.is_expired());
        let second = manager.get_token(42).await.unwrap();

        assert_ne!(first.token.expose_secret(), second.token.expose_secret());
        assert_eq!(exchanger.count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_exchange() {
        let exchanger = Arc::new(MockExchanger::new(3600));
        let manager = TokenManager::new(exchanger.clone());

        manager.get_token(42).await.unwrap();
        manager.invalidate(42).await;
        manager.get_token(42).await.unwrap();

        assert_eq!(exchanger.count(), 2);
    }

    #[tokio::test]
    async fn test_unconfigured_manager_fails_closed() {
        let manager = TokenManager::unconfigured();
        let result = manager.get_token(42).await;
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_from_config_without_credentials_is_unconfigured() {
        let config = GithubConfig::default();
        let manager = TokenManager::from_config(&config).unwrap();
        assert!(manager.exchanger.is_none());
    }

    #[tokio::test]
    async fn test_generate_jwt_rejects_invalid_pem() {
        let exchanger = AppTokenExchanger::new(
            "123456".to_string(),
            SecretString::from("not-a-valid-pem".to_string()),
            "https://api.github.com".to_string(),
        )
        .unwrap();
        let result = exchanger.generate_jwt(1_700_000_000);
        assert!(matches!(result, Err(AuthError::Jwt(_))));
    }
}
