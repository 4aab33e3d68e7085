//! AlertStore - external alert-record API adapter
//!
//! Alert persistence lives behind an external REST API. This adapter
//! creates the alert record during the full phase and patches it with
//! the clip URL once the clip exists. Requests carry the shared worker
//! secret header.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const WORKER_SECRET_HEADER: &str = "x-worker-secret";

/// Alert record creation request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAlertRequest {
    pub camera_id: String,
    pub camera_name: Option<String>,
    pub location: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub image_url: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateAlertResponse {
    #[serde(rename = "alertId")]
    alert_id: Option<String>,
}

/// AlertStore instance
pub struct AlertStore {
    client: reqwest::Client,
    base_url: String,
    worker_secret: String,
}

impl AlertStore {
    /// Create new AlertStore
    pub fn new(base_url: String, worker_secret: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url,
            worker_secret,
        }
    }

    /// Create an alert record, returning its id when the API provides one
    pub async fn create_alert(&self, req: &CreateAlertRequest) -> Result<Option<String>> {
        let resp = self
            .client
            .post(&self.base_url)
            .header(WORKER_SECRET_HEADER, &self.worker_secret)
            .json(req)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("alert API unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "alert API returned {}",
                resp.status()
            )));
        }

        let created: CreateAlertResponse = resp.json().await?;
        Ok(created.alert_id)
    }

    /// Patch an existing alert record with its clip URL
    pub async fn patch_video_url(&self, alert_id: &str, video_url: &str) -> Result<()> {
        let url = format!("{}/{}", self.base_url, alert_id);
        let resp = self
            .client
            .patch(&url)
            .header(WORKER_SECRET_HEADER, &self.worker_secret)
            .json(&json!({ "videoUrl": video_url }))
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("alert API unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "alert patch returned {}",
                resp.status()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_wire_shape() {
        let req = CreateAlertRequest {
            camera_id: "cam-1".to_string(),
            camera_name: Some("Garage".to_string()),
            location: None,
            kind: "smoke".to_string(),
            image_url: Some("https://cdn/img.jpg".to_string()),
            user_id: Some("u1".to_string()),
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["cameraId"], "cam-1");
        assert_eq!(json["type"], "smoke");
        assert_eq!(json["imageUrl"], "https://cdn/img.jpg");
        assert_eq!(json["userId"], "u1");
        assert!(json.get("kind").is_none());
    }
}
