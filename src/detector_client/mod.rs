//! DetectorClient - external fire/smoke detector adapter
//!
//! The classifier itself is out of scope: this adapter forwards one JPEG
//! frame over HTTP multipart and parses the raw classification result.

use crate::error::{Error, Result};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Alert-worthy classes
const ALERT_CLASSES: [&str; 2] = ["fire", "smoke"];

/// Raw classification result from the detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub fire_detected: bool,
    #[serde(rename = "class")]
    pub label: String,
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Detection {
    /// Whether this result should raise an alert
    pub fn is_alert(&self) -> bool {
        self.fire_detected && ALERT_CLASSES.contains(&self.label.as_str())
    }
}

/// DetectorClient instance
pub struct DetectorClient {
    client: reqwest::Client,
    base_url: String,
}

impl DetectorClient {
    /// Create new DetectorClient
    pub fn new(base_url: String) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    /// Create new DetectorClient with custom timeout
    pub fn with_timeout(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    /// Submit one frame for classification
    pub async fn detect(&self, image: Vec<u8>) -> Result<Detection> {
        let url = format!("{}/detect", self.base_url);

        let form = Form::new().part(
            "image",
            Part::bytes(image)
                .file_name("frame.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("detector unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "detector returned {}",
                resp.status()
            )));
        }

        let detection: Detection = resp.json().await?;
        Ok(detection)
    }

    /// Check detector reachability
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/detect", self.base_url);
        match self.client.head(&url).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
            Err(_) => Ok(true),
        }
    }
}
