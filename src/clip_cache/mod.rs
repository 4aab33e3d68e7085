//! ClipCache - per-camera reuse of the most recent evidence clip
//!
//! Cutting and uploading a clip is the most expensive step of the alert
//! pipeline. During a burst of alerts for the same camera the previous
//! clip's URL is reused for a configurable window instead.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct ClipEntry {
    url: String,
    produced_at: Instant,
}

/// ClipCache instance
pub struct ClipCache {
    entries: RwLock<HashMap<String, ClipEntry>>,
    reuse_window: Duration,
}

impl ClipCache {
    /// Create new ClipCache with the given reuse window
    pub fn new(reuse_window: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            reuse_window,
        }
    }

    /// Return the cached clip URL if it is still inside the reuse window
    pub async fn fresh_url(&self, camera_id: &str) -> Option<String> {
        let entries = self.entries.read().await;
        let entry = entries.get(camera_id)?;
        if entry.produced_at.elapsed() < self.reuse_window {
            tracing::debug!(camera_id = %camera_id, url = %entry.url, "Reusing cached clip");
            Some(entry.url.clone())
        } else {
            None
        }
    }

    /// Record a freshly produced clip URL for a camera
    pub async fn store(&self, camera_id: &str, url: String) {
        let mut entries = self.entries.write().await;
        entries.insert(
            camera_id.to_string(),
            ClipEntry {
                url,
                produced_at: Instant::now(),
            },
        );
    }

    /// Number of cameras with a cached clip (debug)
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
