//! Moderation-host session lifecycle: create, parse token expiries,
//! proactively refresh.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Refresh when the access token is within this many seconds of expiring.
pub const ACCESS_EXPIRY_BUFFER_SECS: i64 = 120;
const RETRY_LIMIT: usize = 5;
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("transient session error: {0}")]
    Transient(String),
    #[error("malformed token: {0}")]
    MalformedToken(String),
}

#[derive(Debug, Clone, Serialize)]
struct LoginInfo<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionTokens {
    #[serde(rename = "accessJwt")]
    pub access_jwt: String,
    #[serde(rename = "refreshJwt")]
    pub refresh_jwt: String,
}

pub struct Session {
    tokens: SessionTokens,
    access_expiry: DateTime<Utc>,
    refresh_expiry: DateTime<Utc>,
}

impl Session {
    /// Create a session from credentials, with bounded retry on transient
    /// failures. An explicit rejection from the server is unrecoverable.
    pub async fn create(
        http: &reqwest::Client,
        base_url: &str,
        identifier: &str,
        password: &str,
    ) -> Result<Self, SessionError> {
        let mut last_error = String::new();
        for attempt in 0..RETRY_LIMIT {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let response = http
                .post(format!("{base_url}com.atproto.server.createSession"))
                .header("Content-Type", "application/json")
                .json(&LoginInfo {
                    identifier,
                    password,
                })
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {
                    let tokens: SessionTokens = response
                        .json()
                        .await
                        .map_err(|e| SessionError::Transient(e.to_string()))?;
                    return Self::from_tokens(tokens);
                }
                Ok(response) if response.status().as_u16() == 401 => {
                    return Err(SessionError::AuthFailed(format!(
                        "createSession rejected for {identifier}"
                    )));
                }
                Ok(response) => {
                    last_error = format!("createSession status {}", response.status());
                    warn!(%last_error, attempt, "session create failed, retrying");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(%last_error, attempt, "session create failed, retrying");
                }
            }
        }
        Err(SessionError::Transient(last_error))
    }

    fn from_tokens(tokens: SessionTokens) -> Result<Self, SessionError> {
        let access_expiry = jwt_expiry(&tokens.access_jwt)?;
        let refresh_expiry = jwt_expiry(&tokens.refresh_jwt)?;
        info!(%access_expiry, %refresh_expiry, "session tokens parsed");
        Ok(Session {
            tokens,
            access_expiry,
            refresh_expiry,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.tokens.access_jwt
    }

    pub fn access_expiry(&self) -> DateTime<Utc> {
        self.access_expiry
    }

    pub fn refresh_expiry(&self) -> DateTime<Utc> {
        self.refresh_expiry
    }

    pub fn needs_refresh(&self) -> bool {
        self.access_expiry - Utc::now() < chrono::Duration::seconds(ACCESS_EXPIRY_BUFFER_SECS)
    }

    /// Refresh the access token if expiry is close. Transient failures are
    /// retried; a rejection of the refresh token is unrecoverable and the
    /// caller rebuilds the session or gives up.
    pub async fn check_refresh(
        &mut self,
        http: &reqwest::Client,
        base_url: &str,
    ) -> Result<(), SessionError> {
        if !self.needs_refresh() {
            return Ok(());
        }
        info!(expiry = %self.access_expiry, "refreshing access token");
        let mut last_error = String::new();
        for attempt in 0..RETRY_LIMIT {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let response = http
                .post(format!("{base_url}com.atproto.server.refreshSession"))
                .header("Content-Type", "application/json")
                .bearer_auth(&self.tokens.refresh_jwt)
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {
                    let tokens: SessionTokens = response
                        .json()
                        .await
                        .map_err(|e| SessionError::Transient(e.to_string()))?;
                    *self = Self::from_tokens(tokens)?;
                    return Ok(());
                }
                Ok(response) if response.status().as_u16() == 401 => {
                    return Err(SessionError::AuthFailed(
                        "refresh token rejected".to_owned(),
                    ));
                }
                Ok(response) => {
                    last_error = format!("refreshSession status {}", response.status());
                    warn!(%last_error, attempt, "session refresh failed, retrying");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(%last_error, attempt, "session refresh failed, retrying");
                }
            }
        }
        Err(SessionError::Transient(last_error))
    }
}

/// Pull the `exp` claim out of a JWT without verifying the signature; the
/// token is our own, expiry is all we need.
pub fn jwt_expiry(token: &str) -> Result<DateTime<Utc>, SessionError> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| SessionError::MalformedToken("not a three-part JWT".to_owned()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| SessionError::MalformedToken(e.to_string()))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::MalformedToken(e.to_string()))?;
    Utc.timestamp_opt(claims.exp, 0)
        .single()
        .ok_or_else(|| SessionError::MalformedToken(format!("exp {} out of range", claims.exp)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload = URL_SAFE_NO_PAD.encode(format!("{{\"exp\":{exp}}}").as_bytes());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn expiry_extracted_from_jwt() {
        let expiry = jwt_expiry(&fake_jwt(1_900_000_000)).unwrap();
        assert_eq!(expiry.timestamp(), 1_900_000_000);
    }

    #[test]
    fn malformed_tokens_rejected() {
        assert!(matches!(
            jwt_expiry("no-dots-here"),
            Err(SessionError::MalformedToken(_))
        ));
        assert!(matches!(
            jwt_expiry("a.####.c"),
            Err(SessionError::MalformedToken(_))
        ));
    }

    #[test]
    fn refresh_buffer_logic() {
        let soon = fake_jwt(Utc::now().timestamp() + 60);
        let later = fake_jwt(Utc::now().timestamp() + 3600);
        let session = Session::from_tokens(SessionTokens {
            access_jwt: soon,
            refresh_jwt: later.clone(),
        })
        .unwrap();
        assert!(session.needs_refresh());
        let session = Session::from_tokens(SessionTokens {
            access_jwt: later.clone(),
            refresh_jwt: later,
        })
        .unwrap();
        assert!(!session.needs_refresh());
    }
}
