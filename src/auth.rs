use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::Account;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const LOAD_CODE_ASSIST_URL: &str =
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:loadCodeAssist";

// Refresh the access token this many seconds before it actually expires.
const EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

// Bearer-token and project-id plumbing for the dispatch engine. Tokens come
// from the stored refresh token; project ids from `loadCodeAssist`, with a
// generated placeholder for accounts the API deems ineligible.
pub struct AuthBroker {
    http: reqwest::Client,
    token_url: String,
    load_assist_url: String,
    client_id: String,
    client_secret: Option<String>,
    tokens: DashMap<String, CachedToken>,
    projects: DashMap<String, String>,
}

impl AuthBroker {
    pub fn new(client_id: String, client_secret: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(20))
            .timeout(std::time::Duration::from_secs(60))
            .user_agent(crate::constants::USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            token_url: TOKEN_URL.to_string(),
            load_assist_url: LOAD_CODE_ASSIST_URL.to_string(),
            client_id,
            client_secret,
            tokens: DashMap::new(),
            projects: DashMap::new(),
        }
    }

    pub fn from_env() -> Self {
        let client_id = std::env::var("TRESTLE_OAUTH_CLIENT_ID").unwrap_or_default();
        let client_secret = std::env::var("TRESTLE_OAUTH_CLIENT_SECRET").ok();
        Self::new(client_id, client_secret)
    }

    // Returns a bearer valid for at least EXPIRY_MARGIN_SECS more seconds,
    // refreshing through the OAuth endpoint when the cache misses.
    pub async fn token_for(&self, account: &Account) -> AppResult<String> {
        let now = chrono::Utc::now().timestamp();
        if let Some(cached) = self.tokens.get(&account.email) {
            if cached.expires_at - EXPIRY_MARGIN_SECS > now {
                return Ok(cached.access_token.clone());
            }
        }

        debug!(email = %account.email, "refreshing access token");
        let mut params: Vec<(&str, String)> = vec![
            ("client_id", self.client_id.clone()),
            ("refresh_token", account.refresh_token.clone()),
            ("grant_type", "refresh_token".to_string()),
        ];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::OAuth(format!("token refresh request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // The body text carries invalid_grant / revocation markers that
            // the dispatcher classifies as permanent.
            return Err(AppError::OAuth(format!(
                "token refresh returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::OAuth(format!("token refresh parse failed: {}", e)))?;

        info!(
            email = %account.email,
            expires_in = token.expires_in,
            "access token refreshed"
        );
        self.tokens.insert(
            account.email.clone(),
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at: now + token.expires_in,
            },
        );
        Ok(token.access_token)
    }

    // Resolves the cloudaicompanionProject for the account: pinned id first,
    // then the cache, then a loadCodeAssist round-trip.
    pub async fn project_for(&self, account: &Account, access_token: &str) -> AppResult<String> {
        if let Some(pinned) = &account.project_id {
            return Ok(pinned.clone());
        }
        if let Some(cached) = self.projects.get(&account.email) {
            return Ok(cached.clone());
        }

        let response = self
            .http
            .post(&self.load_assist_url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "metadata": { "ideType": "IDE_UNSPECIFIED" } }))
            .send()
            .await
            .map_err(|e| AppError::OAuth(format!("loadCodeAssist request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::OAuth(format!(
                "loadCodeAssist returned {}: {}",
                status, body
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::OAuth(format!("loadCodeAssist parse failed: {}", e)))?;

        let project = match data.get("cloudaicompanionProject").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => {
                let generated = generate_project_id();
                warn!(
                    email = %account.email,
                    "account has no cloudaicompanionProject, using generated id {}",
                    generated
                );
                generated
            }
        };
        self.projects.insert(account.email.clone(), project.clone());
        Ok(project)
    }

    pub fn clear_token_cache(&self, email: &str) {
        self.tokens.remove(email);
    }

    pub fn clear_project_cache(&self, email: &str) {
        self.projects.remove(email);
    }

    #[cfg(test)]
    pub fn seed_token(&self, email: &str, access_token: &str, expires_at: i64) {
        self.tokens.insert(
            email.to_string(),
            CachedToken {
                access_token: access_token.to_string(),
                expires_at,
            },
        );
    }

    #[cfg(test)]
    pub fn has_cached_token(&self, email: &str) -> bool {
        self.tokens.contains_key(email)
    }
}

// {adjective}-{noun}-{5 base36 chars}, same shape Google hands out
fn generate_project_id() -> String {
    use rand::Rng;

    let adjectives = ["useful", "bright", "swift", "calm", "bold"];
    let nouns = ["span", "wave", "spark", "flow", "core"];
    let mut rng = rand::thread_rng();
    let adj = adjectives[rng.gen_range(0..adjectives.len())];
    let noun = nouns[rng.gen_range(0..nouns.len())];
    let suffix: String = (0..5)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.gen_range(0..chars.len())] as char
        })
        .collect();
    format!("{}-{}-{}", adj, noun, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_cached_token_is_served_without_network() {
        let broker = AuthBroker::new("client".to_string(), None);
        let account = Account::new("a@example.com", "rt");
        broker.seed_token(
            "a@example.com",
            "cached-token",
            chrono::Utc::now().timestamp() + 3_600,
        );

        let token = broker.token_for(&account).await.unwrap();
        assert_eq!(token, "cached-token");
    }

    #[tokio::test]
    async fn pinned_project_id_short_circuits() {
        let broker = AuthBroker::new("client".to_string(), None);
        let mut account = Account::new("a@example.com", "rt");
        account.project_id = Some("pinned-project".to_string());

        let project = broker.project_for(&account, "token").await.unwrap();
        assert_eq!(project, "pinned-project");
    }

    #[test]
    fn clear_token_cache_drops_entry() {
        let broker = AuthBroker::new("client".to_string(), None);
        broker.seed_token("a@example.com", "t", i64::MAX);
        assert!(broker.has_cached_token("a@example.com"));
        broker.clear_token_cache("a@example.com");
        assert!(!broker.has_cached_token("a@example.com"));
    }

    #[test]
    fn generated_project_id_has_expected_shape() {
        let id = generate_project_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 5);
    }
}
