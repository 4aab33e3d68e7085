//! MediaStore - external media storage upload adapter
//!
//! Evidence images and clips are uploaded to an external storage service
//! that returns a public URL per object. Folder names partition uploads
//! per purpose/camera.

use crate::error::{Error, Result};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: String,
}

/// MediaStore instance
pub struct MediaStore {
    client: reqwest::Client,
    base_url: String,
}

impl MediaStore {
    /// Create new MediaStore
    pub fn new(base_url: String) -> Self {
        // Clip uploads can be tens of MB; allow a generous timeout
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    /// Upload an evidence image, returning its public URL
    pub async fn upload_image(&self, data: Vec<u8>, folder: &str) -> Result<String> {
        let part = Part::bytes(data)
            .file_name("evidence.jpg")
            .mime_str("image/jpeg")?;
        self.upload(part, folder).await
    }

    /// Upload an evidence clip from disk, returning its public URL
    pub async fn upload_video(&self, path: &Path, folder: &str) -> Result<String> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "clip.mp4".to_string());

        let part = Part::bytes(data)
            .file_name(file_name)
            .mime_str("video/mp4")?;
        self.upload(part, folder).await
    }

    async fn upload(&self, part: Part, folder: &str) -> Result<String> {
        let url = format!("{}/upload", self.base_url);
        let form = Form::new()
            .part("file", part)
            .text("folder", folder.to_string());

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("media store unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "media store returned {}",
                resp.status()
            )));
        }

        let uploaded: UploadResponse = resp.json().await?;
        Ok(uploaded.secure_url)
    }
}
