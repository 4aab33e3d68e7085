//! AlertHub - live alert subscriber registry and event fan-out
//!
//! ## Responsibilities
//!
//! - WebSocket subscriber registry keyed by owner identity
//! - Event delivery to every open connection of an identity
//! - Camera-scoped broadcast: direct owner first (lowest latency for the
//!   identity currently watching), then the full entitled set from the
//!   ownership store
//!
//! Many connections may share one identity (multiple open sessions).
//! Disconnect is idempotent; an identity whose connection set empties is
//! pruned from the registry.

use crate::camera_directory::CameraDirectory;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Alert event pushed to live subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    /// Detected class ("fire", "smoke", ...)
    #[serde(rename = "type")]
    pub kind: String,
    pub camera_id: String,
    pub camera_name: Option<String>,
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub is_early: bool,
}

/// One live subscriber connection
struct Subscriber {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

/// AlertHub instance
pub struct AlertHub {
    /// owner identity -> open connections
    connections: RwLock<HashMap<String, Vec<Subscriber>>>,
    connection_count: AtomicU64,
    directory: Arc<CameraDirectory>,
}

impl AlertHub {
    /// Create new AlertHub
    pub fn new(directory: Arc<CameraDirectory>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
            directory,
        }
    }

    /// Register a connection for an owner identity
    pub async fn connect(&self, owner_id: &str) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections
                .entry(owner_id.to_string())
                .or_default()
                .push(Subscriber { id, tx });
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(owner_id = %owner_id, connection_id = %id, "Alert subscriber connected");

        (id, rx)
    }

    /// Remove a connection. Idempotent; prunes the identity when its set
    /// becomes empty.
    pub async fn disconnect(&self, owner_id: &str, connection_id: &Uuid) {
        let mut connections = self.connections.write().await;
        let Some(subs) = connections.get_mut(owner_id) else {
            return;
        };

        let before = subs.len();
        subs.retain(|s| s.id != *connection_id);
        if subs.len() < before {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(owner_id = %owner_id, connection_id = %connection_id, "Alert subscriber disconnected");
        }
        if subs.is_empty() {
            connections.remove(owner_id);
        }
    }

    /// Push an event to every open connection of an identity.
    ///
    /// Connections whose channel has closed are skipped, not pruned;
    /// pruning happens on explicit disconnect. Returns the delivered count.
    pub async fn push_to_owner(&self, owner_id: &str, event: &AlertEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize alert event");
                return 0;
            }
        };

        let connections = self.connections.read().await;
        let Some(subs) = connections.get(owner_id) else {
            tracing::debug!(owner_id = %owner_id, "No open alert connections for owner");
            return 0;
        };

        let mut delivered = 0;
        for sub in subs {
            match sub.tx.send(json.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::debug!(
                        owner_id = %owner_id,
                        connection_id = %sub.id,
                        "Skipping closed alert connection"
                    );
                }
            }
        }
        delivered
    }

    /// Broadcast an event to every identity entitled to a camera.
    ///
    /// The direct owner (the identity the triggering frame was pulled
    /// for) is pushed first, then the full set from the ownership store,
    /// skipping anyone already notified. Ownership-store failures are
    /// contained here: the direct push has already happened.
    pub async fn broadcast_to_camera_owners(
        &self,
        camera_id: &str,
        event: &AlertEvent,
        direct_owner: Option<&str>,
    ) {
        let mut notified: HashSet<String> = HashSet::new();

        if let Some(owner) = direct_owner {
            self.push_to_owner(owner, event).await;
            notified.insert(owner.to_string());
        }

        let owners = match self.directory.owners_of(camera_id).await {
            Ok(owners) => owners,
            Err(e) => {
                tracing::warn!(
                    camera_id = %camera_id,
                    error = %e,
                    "Owner resolution failed, alert delivered to direct owner only"
                );
                return;
            }
        };

        for owner in owners {
            if notified.contains(&owner) {
                continue;
            }
            self.push_to_owner(&owner, event).await;
            notified.insert(owner);
        }
    }

    /// Open connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_hub() -> AlertHub {
        let directory = Arc::new(CameraDirectory::new(
            "http://127.0.0.1:0".to_string(),
            None,
            Duration::from_secs(60),
        ));
        AlertHub::new(directory)
    }

    fn test_event(is_early: bool) -> AlertEvent {
        AlertEvent {
            kind: "fire".to_string(),
            camera_id: "cam-b".to_string(),
            camera_name: Some("Backyard".to_string()),
            location: Some("North fence".to_string()),
            confidence: Some(0.92),
            timestamp: 1_700_000_000_000,
            image_url: None,
            video_url: None,
            is_early,
        }
    }

    #[tokio::test]
    async fn push_reaches_every_connection_of_an_owner() {
        let hub = test_hub();
        let (_id1, mut rx1) = hub.connect("u1").await;
        let (_id2, mut rx2) = hub.connect("u1").await;

        let delivered = hub.push_to_owner("u1", &test_event(true)).await;
        assert_eq!(delivered, 2);

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a, b);

        let parsed: serde_json::Value = serde_json::from_str(&a).unwrap();
        assert_eq!(parsed["type"], "fire");
        assert_eq!(parsed["isEarly"], true);
        assert_eq!(parsed["imageUrl"], serde_json::Value::Null);
        assert_eq!(parsed["videoUrl"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn push_to_unknown_owner_is_a_noop() {
        let hub = test_hub();
        assert_eq!(hub.push_to_owner("nobody", &test_event(true)).await, 0);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_prunes_empty_identities() {
        let hub = test_hub();
        let (id, _rx) = hub.connect("u1").await;
        assert_eq!(hub.connection_count(), 1);

        hub.disconnect("u1", &id).await;
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.connections.read().await.get("u1").is_none());

        // Removing again must be a no-op
        hub.disconnect("u1", &id).await;
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn closed_connections_are_skipped_not_pruned() {
        let hub = test_hub();
        let (_id1, rx1) = hub.connect("u1").await;
        let (_id2, mut rx2) = hub.connect("u1").await;
        drop(rx1);

        let delivered = hub.push_to_owner("u1", &test_event(false)).await;
        assert_eq!(delivered, 1);
        assert!(rx2.recv().await.is_some());

        // The closed connection stays registered until explicit disconnect
        assert_eq!(hub.connections.read().await.get("u1").unwrap().len(), 2);
    }

    #[test]
    fn event_wire_shape_is_camel_case() {
        let json = serde_json::to_value(test_event(false)).unwrap();
        assert_eq!(json["cameraId"], "cam-b");
        assert_eq!(json["cameraName"], "Backyard");
        assert!((json["confidence"].as_f64().unwrap() - 0.92).abs() < 1e-6);
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
        assert_eq!(json["isEarly"], false);
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn confidence_is_omitted_when_absent() {
        let mut event = test_event(true);
        event.confidence = None;
        let json = serde_json::to_value(event).unwrap();
        assert!(json.get("confidence").is_none());
        // Media URLs stay present as explicit nulls
        assert!(json.get("imageUrl").is_some());
    }
}
