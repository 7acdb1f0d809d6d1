// =============================================================================
// Broker Auth — OAuth2 access token and POST-body hashkey management
// =============================================================================
//
// The broker issues 24-hour bearer tokens via /oauth2/tokenP. Tokens are
// cached to a JSON file so a restart does not burn the daily issuance quota,
// and refreshed one hour before expiry by a scheduled background task.
//
// Order-related POST requests additionally require a `hashkey` header: a
// server-computed hash of the request body obtained from /uapi/hashkey.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Refresh this long before the token actually expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(3600);

const TOKEN_ENDPOINT: &str = "/oauth2/tokenP";
const HASHKEY_ENDPOINT: &str = "/uapi/hashkey";
const TOKEN_CACHE_FILE: &str = "token_cache.json";

// -----------------------------------------------------------------------------
// Provider traits — the exact surface the REST client needs
// -----------------------------------------------------------------------------

/// Supplies a valid bearer token plus the app credentials that go into the
/// request headers.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<String>;
    fn app_key(&self) -> &str;
    fn app_secret(&self) -> &str;
}

/// Computes the `hashkey` header value for a POST body.
#[async_trait]
pub trait HashkeyProvider: Send + Sync {
    async fn get_hashkey(&self, body: &serde_json::Value) -> Result<String>;
}

// -----------------------------------------------------------------------------
// TokenManager
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    /// Broker-reported expiry, naive local datetime "YYYY-MM-DD HH:MM:SS".
    expired_at: String,
}

#[derive(Default)]
struct TokenState {
    token: Option<String>,
    /// Epoch seconds of expiry.
    expires_at: Option<i64>,
}

/// OAuth2 access-token manager with file caching and auto-refresh.
pub struct TokenManager {
    app_key: String,
    app_secret: String,
    base_url: String,
    client: reqwest::Client,
    state: tokio::sync::Mutex<TokenState>,
    cache_path: PathBuf,
    refresh_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        base_url: impl Into<String>,
        cache_dir: Option<PathBuf>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let cache_path = cache_dir
            .unwrap_or_else(|| PathBuf::from("."))
            .join(TOKEN_CACHE_FILE);

        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            base_url: base_url.into(),
            client,
            state: tokio::sync::Mutex::new(TokenState::default()),
            cache_path,
            refresh_task: parking_lot::Mutex::new(None),
        }
    }

    /// Issue a brand-new token from the broker and persist it to the cache
    /// file.
    async fn issue_new_token(&self, state: &mut TokenState) -> Result<String> {
        let url = format!("{}{}", self.base_url, TOKEN_ENDPOINT);
        let payload = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "appsecret": self.app_secret,
        });

        info!(url = %url, "issuing new access token");

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("token issuance request failed")?;

        let data: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse token response")?;

        let token = data["access_token"]
            .as_str()
            .context("token response missing 'access_token'")?
            .to_string();
        let expired_at_raw = data["access_token_token_expired"]
            .as_str()
            .context("token response missing 'access_token_token_expired'")?
            .to_string();

        let expires_at = parse_expiry(&expired_at_raw)
            .with_context(|| format!("unparseable token expiry '{expired_at_raw}'"))?;

        state.token = Some(token.clone());
        state.expires_at = Some(expires_at);

        self.save_cache(&CachedToken {
            access_token: token.clone(),
            expired_at: expired_at_raw,
        });

        info!(expires_at, "access token issued");
        Ok(token)
    }

    fn is_valid(state: &TokenState) -> bool {
        match (&state.token, state.expires_at) {
            (Some(_), Some(exp)) => {
                Utc::now().timestamp() < exp - REFRESH_MARGIN.as_secs() as i64
            }
            _ => false,
        }
    }

    fn load_cache(&self, state: &mut TokenState) {
        let raw = match std::fs::read_to_string(&self.cache_path) {
            Ok(raw) => raw,
            Err(_) => {
                debug!(path = %self.cache_path.display(), "no token cache file");
                return;
            }
        };

        match serde_json::from_str::<CachedToken>(&raw) {
            Ok(cached) => match parse_expiry(&cached.expired_at) {
                Ok(exp) => {
                    state.token = Some(cached.access_token);
                    state.expires_at = Some(exp);
                    debug!(expires_at = exp, "token cache loaded");
                }
                Err(e) => warn!(error = %e, "token cache has unparseable expiry"),
            },
            Err(e) => warn!(error = %e, "token cache corrupted"),
        }
    }

    fn save_cache(&self, cached: &CachedToken) {
        match serde_json::to_string_pretty(cached) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.cache_path, json) {
                    warn!(error = %e, path = %self.cache_path.display(), "token cache save failed");
                }
            }
            Err(e) => warn!(error = %e, "token cache serialise failed"),
        }
    }

    /// Issue a websocket approval key (POST /oauth2/Approval). The key is
    /// session-scoped and goes into every subscribe message header.
    pub async fn issue_approval_key(&self) -> Result<String> {
        let url = format!("{}/oauth2/Approval", self.base_url);
        let payload = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "secretkey": self.app_secret,
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("approval key request failed")?;

        let data: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse approval key response")?;

        let key = data["approval_key"]
            .as_str()
            .context("approval response missing 'approval_key'")?
            .to_string();

        info!("websocket approval key issued");
        Ok(key)
    }

    /// Spawn a background task that re-issues the token one hour before
    /// expiry. Idempotent: a previous task is aborted.
    pub fn spawn_auto_refresh(self: &Arc<Self>) {
        let mgr = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let delay = {
                    let state = mgr.state.lock().await;
                    match state.expires_at {
                        Some(exp) => {
                            let refresh_at = exp - REFRESH_MARGIN.as_secs() as i64;
                            (refresh_at - Utc::now().timestamp()).max(60)
                        }
                        // No token yet; check back shortly.
                        None => 60,
                    }
                };
                tokio::time::sleep(Duration::from_secs(delay as u64)).await;

                let mut state = mgr.state.lock().await;
                if !Self::is_valid(&state) {
                    info!("auto-refreshing access token");
                    if let Err(e) = mgr.issue_new_token(&mut state).await {
                        warn!(error = %e, "token auto-refresh failed");
                    }
                }
            }
        });

        if let Some(prev) = self.refresh_task.lock().replace(handle) {
            prev.abort();
        }
    }

    /// Cancel the refresh task on teardown.
    pub fn shutdown(&self) {
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        info!("token manager shut down");
    }
}

#[async_trait]
impl TokenProvider for TokenManager {
    /// Return a valid access token, issuing or reloading one as needed.
    async fn get_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;

        if Self::is_valid(&state) {
            if let Some(token) = state.token.clone() {
                return Ok(token);
            }
        }

        // Try the file cache before hitting the broker.
        self.load_cache(&mut state);
        if Self::is_valid(&state) {
            if let Some(token) = state.token.clone() {
                info!("token loaded from cache");
                return Ok(token);
            }
        }

        self.issue_new_token(&mut state).await
    }

    fn app_key(&self) -> &str {
        &self.app_key
    }

    fn app_secret(&self) -> &str {
        &self.app_secret
    }
}

/// Parse the broker's "YYYY-MM-DD HH:MM:SS" expiry into epoch seconds.
/// The broker reports local (KST) wall time; treated as-is for margin math.
fn parse_expiry(raw: &str) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .context("expiry not in YYYY-MM-DD HH:MM:SS format")?;
    Ok(naive.and_utc().timestamp() - 9 * 3600)
}

// -----------------------------------------------------------------------------
// HashkeyManager
// -----------------------------------------------------------------------------

/// POST-body integrity hashkey client.
pub struct HashkeyManager {
    app_key: String,
    app_secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl HashkeyManager {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl HashkeyProvider for HashkeyManager {
    async fn get_hashkey(&self, body: &serde_json::Value) -> Result<String> {
        let url = format!("{}{}", self.base_url, HASHKEY_ENDPOINT);

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json; charset=utf-8")
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .json(body)
            .send()
            .await
            .context("hashkey request failed")?;

        let data: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse hashkey response")?;

        let hashkey = data["HASH"]
            .as_str()
            .context("hashkey response missing 'HASH'")?
            .to_string();

        debug!(hashkey_prefix = &hashkey[..hashkey.len().min(8)], "hashkey generated");
        Ok(hashkey)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("cache_path", &self.cache_path)
            .finish()
    }
}

impl std::fmt::Debug for HashkeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashkeyManager")
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // ---- parse_expiry ----------------------------------------------------

    #[test]
    fn parse_expiry_valid() {
        let ts = parse_expiry("2026-08-02 09:30:00").unwrap();
        // 09:30 KST == 00:30 UTC same day.
        let naive = NaiveDateTime::parse_from_str("2026-08-02 00:30:00", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        assert_eq!(ts, naive.and_utc().timestamp());
    }

    #[test]
    fn parse_expiry_rejects_garbage() {
        assert!(parse_expiry("not a date").is_err());
        assert!(parse_expiry("2026/08/02 09:30:00").is_err());
    }

    // ---- token state validity --------------------------------------------

    #[test]
    fn empty_state_is_invalid() {
        let state = TokenState::default();
        assert!(!TokenManager::is_valid(&state));
    }

    #[test]
    fn fresh_token_is_valid() {
        let state = TokenState {
            token: Some("tok".into()),
            expires_at: Some(Utc::now().timestamp() + 24 * 3600),
        };
        assert!(TokenManager::is_valid(&state));
    }

    #[test]
    fn token_inside_refresh_margin_is_invalid() {
        // Expires in 30 minutes — inside the 1-hour refresh margin.
        let state = TokenState {
            token: Some("tok".into()),
            expires_at: Some(Utc::now().timestamp() + 1800),
        };
        assert!(!TokenManager::is_valid(&state));
    }
}
