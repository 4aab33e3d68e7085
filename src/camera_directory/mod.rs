//! CameraDirectory - external camera metadata/ownership store adapter
//!
//! ## Responsibilities
//!
//! - Owner-scoped camera document lookup (stream endpoint authorization)
//! - Source URI resolution with a short TTL cache (shields the store
//!   from repeated reads during alert bursts)
//! - Full owner-set resolution for alert fan-out
//! - Cache invalidation when a camera's decoding process dies

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Camera document as stored by the external directory
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDoc {
    pub stream_url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwnersResponse {
    owners: Vec<String>,
}

struct CachedUri {
    stream_url: String,
    cached_at: Instant,
}

/// CameraDirectory instance
pub struct CameraDirectory {
    client: reqwest::Client,
    base_url: String,
    /// Fallback identity used when a lookup arrives without an owner
    admin_identity: Option<String>,
    cache: RwLock<HashMap<String, CachedUri>>,
    ttl: Duration,
}

impl CameraDirectory {
    /// Create new CameraDirectory
    pub fn new(base_url: String, admin_identity: Option<String>, ttl: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url,
            admin_identity,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Fetch a camera document scoped to an owner identity.
    ///
    /// Used by the stream endpoint: a missing document doubles as the
    /// ownership check. Bypasses the cache so authorization never sees a
    /// stale view.
    pub async fn camera_for_owner(
        &self,
        owner_id: &str,
        camera_id: &str,
    ) -> Result<Option<CameraDoc>> {
        let url = format!("{}/users/{}/cameras/{}", self.base_url, owner_id, camera_id);
        let resp = self.client.get(&url).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "camera directory returned {}",
                resp.status()
            )));
        }

        let doc: CameraDoc = resp.json().await?;
        Ok(Some(doc))
    }

    /// Resolve a camera's source URI, serving from cache when fresh.
    ///
    /// `owner_id` falls back to the configured admin identity; with
    /// neither available the lookup cannot be scoped and returns None.
    pub async fn source_uri(&self, camera_id: &str, owner_id: Option<&str>) -> Result<Option<String>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(camera_id) {
                if entry.cached_at.elapsed() < self.ttl {
                    return Ok(Some(entry.stream_url.clone()));
                }
            }
        }

        let owner = match owner_id.or(self.admin_identity.as_deref()) {
            Some(o) => o.to_string(),
            None => {
                tracing::error!(camera_id = %camera_id, "Missing owner identity for camera lookup");
                return Ok(None);
            }
        };

        let doc = match self.camera_for_owner(&owner, camera_id).await? {
            Some(d) => d,
            None => return Ok(None),
        };

        let mut cache = self.cache.write().await;
        cache.insert(
            camera_id.to_string(),
            CachedUri {
                stream_url: doc.stream_url.clone(),
                cached_at: Instant::now(),
            },
        );

        Ok(Some(doc.stream_url))
    }

    /// Drop the cached source URI for a camera.
    ///
    /// Called when a decoding process exits so the next request
    /// re-resolves the source (the URI may have changed).
    pub async fn invalidate(&self, camera_id: &str) {
        let mut cache = self.cache.write().await;
        if cache.remove(camera_id).is_some() {
            tracing::debug!(camera_id = %camera_id, "Invalidated cached source URI");
        }
    }

    /// Resolve all identities entitled to a camera
    pub async fn owners_of(&self, camera_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/cameras/{}/owners", self.base_url, camera_id);
        let resp = self.client.get(&url).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "owner lookup returned {}",
                resp.status()
            )));
        }

        let owners: OwnersResponse = resp.json().await?;
        Ok(owners.owners)
    }

    /// Check directory reachability
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Cached camera count (debug)
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }
}
