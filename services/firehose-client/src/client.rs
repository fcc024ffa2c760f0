//! Typed HTTP client for the platform's XRPC surface.
//!
//! Wraps reqwest with session management, JSON (de)serialization, and
//! bounded retry on transient connection loss. Wire field names that clash
//! with reserved identifiers (`$type`) are mapped with serde renames on the
//! request/response types themselves, in both directions.

use crate::session::{Session, SessionError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::error::Error as _;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const RETRY_LIMIT: usize = 5;

/// Per-phase network budget: connect, send, and receive each get this long.
pub const HTTP_PHASE_TIMEOUT: Duration = Duration::from_secs(2);
/// Whole-request ceiling: the three phases back to back.
pub const HTTP_TOTAL_TIMEOUT: Duration = Duration::from_secs(6);

/// Base builder for every outbound HTTP client in the service (the XRPC
/// client here, the embed checker's link chaser), so the timeout budget
/// changes in one place.
pub fn http_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(HTTP_PHASE_TIMEOUT)
        .timeout(HTTP_TOTAL_TIMEOUT)
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transient i/o failure: {0}")]
    Transient(String),
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode failure: {0}")]
    Decode(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ClientError {
    /// Already a member / already exists conflicts are routinely ignored.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Status { status: 409, .. })
            || matches!(self, ClientError::Status { body, .. } if body.contains("already exists"))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::Status { status: 429, .. })
    }
}

/// Connection resets and truncated responses are retryable; anything else
/// surfaces to the caller.
fn is_transient(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

pub struct BskyClient {
    http: reqwest::Client,
    base_url: String,
    identifier: String,
    password: String,
    session: Option<Session>,
}

impl BskyClient {
    /// `host:port` become `https://host:port/xrpc/`.
    pub fn new(
        host: &str,
        port: u16,
        identifier: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let http = http_client_builder()
            .build()
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        Ok(BskyClient {
            http,
            base_url: format!("https://{host}:{port}/xrpc/"),
            identifier: identifier.into(),
            password: password.into(),
            session: None,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn login(&mut self) -> Result<(), ClientError> {
        let session = Session::create(
            &self.http,
            &self.base_url,
            &self.identifier,
            &self.password,
        )
        .await?;
        info!(identifier = %self.identifier, "session established");
        self.session = Some(session);
        Ok(())
    }

    /// Refresh the access token when close to expiry; if the refresh token
    /// itself is rejected, rebuild the session from credentials once.
    pub async fn check_refresh(&mut self) -> Result<(), ClientError> {
        let Some(session) = self.session.as_mut() else {
            return self.login().await;
        };
        match session.check_refresh(&self.http, &self.base_url).await {
            Ok(()) => Ok(()),
            Err(SessionError::AuthFailed(reason)) => {
                warn!(%reason, "refresh rejected, rebuilding session");
                self.login().await
            }
            Err(e) => Err(e.into()),
        }
    }

    fn bearer(&self) -> Result<String, ClientError> {
        self.session
            .as_ref()
            .map(|s| s.access_token().to_owned())
            .ok_or_else(|| {
                ClientError::Session(SessionError::AuthFailed("no session".to_owned()))
            })
    }

    pub async fn xrpc_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let token = self.bearer()?;
        let mut last = ClientError::Transient("no attempts made".to_owned());
        for attempt in 0..RETRY_LIMIT {
            let request = self
                .http
                .get(format!("{}{endpoint}", self.base_url))
                .query(query)
                .bearer_auth(&token);
            match Self::execute::<T>(request).await {
                Ok(value) => return Ok(value),
                Err(e @ ClientError::Transient(_)) => {
                    warn!(endpoint, attempt, error = %e, "GET retry on transient failure");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    pub async fn xrpc_post<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
        extra_headers: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let token = self.bearer()?;
        let mut last = ClientError::Transient("no attempts made".to_owned());
        for attempt in 0..RETRY_LIMIT {
            let mut request = self
                .http
                .post(format!("{}{endpoint}", self.base_url))
                .header("Content-Type", "application/json")
                .bearer_auth(&token)
                .json(body);
            for (name, value) in extra_headers {
                request = request.header(*name, value);
            }
            match Self::execute::<T>(request).await {
                Ok(value) => return Ok(value),
                Err(e @ ClientError::Transient(_)) => {
                    warn!(endpoint, attempt, error = %e, "POST retry on transient failure");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    async fn execute<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = request.send().await.map_err(|e| {
            if is_transient(&e) {
                ClientError::Transient(e.to_string())
            } else {
                ClientError::Decode(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Repo record operations
    // -----------------------------------------------------------------------

    pub async fn create_record<R: Serialize, T: DeserializeOwned>(
        &self,
        repo: &str,
        collection: &str,
        record: &R,
    ) -> Result<T, ClientError> {
        #[derive(Serialize)]
        struct CreateRecordRequest<'a, R: Serialize> {
            repo: &'a str,
            collection: &'a str,
            record: &'a R,
        }
        self.xrpc_post(
            "com.atproto.repo.createRecord",
            &CreateRecordRequest {
                repo,
                collection,
                record,
            },
            &[],
        )
        .await
    }

    pub async fn get_record<T: DeserializeOwned>(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<T, ClientError> {
        self.xrpc_get(
            "com.atproto.repo.getRecord",
            &[
                ("repo", repo.to_owned()),
                ("collection", collection.to_owned()),
                ("rkey", rkey.to_owned()),
            ],
        )
        .await
    }

    pub async fn put_record<R: Serialize, T: DeserializeOwned>(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
        record: &R,
    ) -> Result<T, ClientError> {
        #[derive(Serialize)]
        struct PutRecordRequest<'a, R: Serialize> {
            repo: &'a str,
            collection: &'a str,
            rkey: &'a str,
            record: &'a R,
        }
        self.xrpc_post(
            "com.atproto.repo.putRecord",
            &PutRecordRequest {
                repo,
                collection,
                rkey,
                record,
            },
            &[],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_budget_is_three_phases() {
        // connect + send + receive, each on the per-phase budget
        assert_eq!(HTTP_TOTAL_TIMEOUT, HTTP_PHASE_TIMEOUT * 3);
    }

    #[test]
    fn conflict_detection() {
        let conflict = ClientError::Status {
            status: 409,
            body: String::new(),
        };
        assert!(conflict.is_conflict());
        let dup = ClientError::Status {
            status: 400,
            body: "record already exists".to_owned(),
        };
        assert!(dup.is_conflict());
        let rate = ClientError::Status {
            status: 429,
            body: String::new(),
        };
        assert!(rate.is_rate_limited());
        assert!(!rate.is_conflict());
    }

    #[test]
    fn transient_io_kinds_are_retryable() {
        // reqwest errors cannot be constructed directly; exercise the io
        // source walk through a nested error chain instead.
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapper")
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }
        let wrapped = Wrapper(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&wrapped);
        let mut transient = false;
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                transient = matches!(io.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            source = cause.source();
        }
        assert!(transient);
    }
}
