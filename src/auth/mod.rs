//! Auth - identity token verification and worker-secret checks
//!
//! Token verification is delegated to an external identity provider; this
//! module only resolves a token to an owner identity. The frame-pull
//! worker authenticates with a shared secret header instead of a user
//! token and acts as the fixed `worker-service` identity.

use crate::error::{Error, Result};
use axum::http::HeaderMap;
use serde::Deserialize;
use std::time::Duration;

/// Identity assigned to requests authenticated by the worker secret
pub const WORKER_IDENTITY: &str = "worker-service";

/// Header carrying the shared worker secret
pub const WORKER_SECRET_HEADER: &str = "x-worker-secret";

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    uid: String,
}

/// TokenVerifier instance
pub struct TokenVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl TokenVerifier {
    /// Create new TokenVerifier
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    /// Verify an identity token, returning the owner identity it belongs to
    pub async fn verify(&self, token: &str) -> Result<String> {
        let url = format!("{}/verify", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("identity provider unreachable: {}", e)))?;

        match resp.status() {
            s if s.is_success() => {
                let verified: VerifyResponse = resp.json().await?;
                Ok(verified.uid)
            }
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(Error::Forbidden("Invalid token".to_string()))
            }
            s => Err(Error::Upstream(format!("identity provider returned {}", s))),
        }
    }
}

/// Check the shared worker secret header against the configured value
pub fn worker_secret_valid(headers: &HeaderMap, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    headers
        .get(WORKER_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

/// Extract a bearer token from `Authorization: Bearer <t>` or a `token`
/// query value, in that order
pub fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = auth.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    query_token.filter(|t| !t.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn worker_secret_must_match_exactly() {
        let mut headers = HeaderMap::new();
        headers.insert(WORKER_SECRET_HEADER, "s3cret".parse().unwrap());

        assert!(worker_secret_valid(&headers, "s3cret"));
        assert!(!worker_secret_valid(&headers, "other"));
        assert!(!worker_secret_valid(&HeaderMap::new(), "s3cret"));
    }

    #[test]
    fn empty_configured_secret_never_matches() {
        let mut headers = HeaderMap::new();
        headers.insert(WORKER_SECRET_HEADER, "".parse().unwrap());
        assert!(!worker_secret_valid(&headers, ""));
    }

    #[test]
    fn bearer_header_takes_precedence_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());

        assert_eq!(
            bearer_token(&headers, Some("query-token")).as_deref(),
            Some("abc")
        );
        assert_eq!(
            bearer_token(&HeaderMap::new(), Some("query-token")).as_deref(),
            Some("query-token")
        );
        assert!(bearer_token(&HeaderMap::new(), None).is_none());
    }
}
