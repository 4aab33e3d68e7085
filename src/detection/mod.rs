//! Detection pipeline - two-phase alert orchestration
//!
//! ## Responsibilities
//!
//! - Forward one frame plus camera context to the external detector
//! - On a hit, broadcast an early alert event before the caller gets
//!   its response, then run the full phase in the background
//! - Full phase: evidence image upload, alert record creation, clip
//!   production (recorder + cutter + cache), full event broadcast and
//!   alert record patch
//! - Temporary frame file cleanup on every path
//!
//! Full-phase steps fail independently: the full event is always sent
//! with whatever media URLs were produced, and nothing in the full phase
//! can surface back to the detection caller.

use crate::alert_hub::{AlertEvent, AlertHub};
use crate::alert_store::{AlertStore, CreateAlertRequest};
use crate::camera_directory::CameraDirectory;
use crate::clip_cache::ClipCache;
use crate::clip_cutter::cut_last_seconds;
use crate::detector_client::{Detection, DetectorClient};
use crate::error::Result;
use crate::evidence_recorder::EvidenceRecorder;
use crate::media_store::MediaStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Detection pipeline configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Working directory for temporary frame files and cut clips
    pub upload_dir: PathBuf,
    /// Clip length in seconds
    pub clip_seconds: u64,
    /// Attempts when waiting for the first recorded segment
    pub segment_poll_attempts: u32,
    /// Delay between segment polls
    pub segment_poll_interval: Duration,
    /// Minimum spacing between alerts per camera; None disables the gate
    pub cooldown: Option<Duration>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            upload_dir: std::env::temp_dir(),
            clip_seconds: 30,
            segment_poll_attempts: 6,
            segment_poll_interval: Duration::from_millis(500),
            cooldown: None,
        }
    }
}

/// Camera context accompanying a detection frame
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub camera_id: String,
    pub camera_name: Option<String>,
    pub location: Option<String>,
    pub user_id: Option<String>,
}

/// Detection pipeline instance
pub struct DetectionPipeline {
    detector: Arc<DetectorClient>,
    hub: Arc<AlertHub>,
    recorder: Arc<EvidenceRecorder>,
    clip_cache: Arc<ClipCache>,
    directory: Arc<CameraDirectory>,
    media: Arc<MediaStore>,
    alerts: Arc<AlertStore>,
    last_alert: RwLock<HashMap<String, Instant>>,
    config: DetectionConfig,
}

impl DetectionPipeline {
    /// Create new DetectionPipeline
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detector: Arc<DetectorClient>,
        hub: Arc<AlertHub>,
        recorder: Arc<EvidenceRecorder>,
        clip_cache: Arc<ClipCache>,
        directory: Arc<CameraDirectory>,
        media: Arc<MediaStore>,
        alerts: Arc<AlertStore>,
        config: DetectionConfig,
    ) -> Self {
        Self {
            detector,
            hub,
            recorder,
            clip_cache,
            directory,
            media,
            alerts,
            last_alert: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Run one detection call end to end.
    ///
    /// Returns the detector's classification immediately after the early
    /// phase; the full phase continues in the background.
    pub async fn process(self: &Arc<Self>, frame: Vec<u8>, ctx: FrameContext) -> Result<Detection> {
        tokio::fs::create_dir_all(&self.config.upload_dir).await?;
        let frame_path = self
            .config
            .upload_dir
            .join(format!("{}.jpg", chrono::Utc::now().timestamp_millis()));
        tokio::fs::write(&frame_path, &frame).await?;

        let detection = match self.detector.detect(frame).await {
            Ok(d) => d,
            Err(e) => {
                let _ = tokio::fs::remove_file(&frame_path).await;
                return Err(e);
            }
        };

        if !detection.is_alert() {
            let _ = tokio::fs::remove_file(&frame_path).await;
            return Ok(detection);
        }

        if !self.cooldown_open(&ctx.camera_id).await {
            tracing::debug!(camera_id = %ctx.camera_id, "Alert suppressed by cooldown");
            let _ = tokio::fs::remove_file(&frame_path).await;
            return Ok(detection);
        }

        tracing::info!(
            camera_id = %ctx.camera_id,
            class = %detection.label,
            confidence = ?detection.confidence,
            "Detection hit"
        );

        let early = AlertEvent {
            kind: detection.label.clone(),
            camera_id: ctx.camera_id.clone(),
            camera_name: ctx.camera_name.clone(),
            location: ctx.location.clone(),
            confidence: detection.confidence,
            timestamp: chrono::Utc::now().timestamp_millis(),
            image_url: None,
            video_url: None,
            is_early: true,
        };
        self.hub
            .broadcast_to_camera_owners(&ctx.camera_id, &early, ctx.user_id.as_deref())
            .await;

        let pipeline = self.clone();
        let full_ctx = ctx.clone();
        let full_detection = detection.clone();
        tokio::spawn(async move {
            pipeline
                .full_phase(frame_path, full_ctx, full_detection)
                .await;
        });

        Ok(detection)
    }

    /// Full phase: evidence media, alert record, full event. The frame is
    /// handed over through the temp file, read back here for the evidence
    /// upload. Each step's failure is contained so the remaining steps
    /// still run.
    async fn full_phase(self: Arc<Self>, frame_path: PathBuf, ctx: FrameContext, detection: Detection) {
        let image_url = match tokio::fs::read(&frame_path).await {
            Ok(frame) => match self.media.upload_image(frame, "alerts").await {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::error!(camera_id = %ctx.camera_id, error = %e, "Evidence image upload failed");
                    None
                }
            },
            Err(e) => {
                tracing::error!(camera_id = %ctx.camera_id, error = %e, "Evidence frame read failed");
                None
            }
        };

        let alert_id = match self
            .alerts
            .create_alert(&CreateAlertRequest {
                camera_id: ctx.camera_id.clone(),
                camera_name: ctx.camera_name.clone(),
                location: ctx.location.clone(),
                kind: detection.label.clone(),
                image_url: image_url.clone(),
                user_id: ctx.user_id.clone(),
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(camera_id = %ctx.camera_id, error = %e, "Alert record creation failed");
                None
            }
        };

        let video_url = self.produce_clip(&ctx).await;

        let full = AlertEvent {
            kind: detection.label.clone(),
            camera_id: ctx.camera_id.clone(),
            camera_name: ctx.camera_name.clone(),
            location: ctx.location.clone(),
            confidence: detection.confidence,
            timestamp: chrono::Utc::now().timestamp_millis(),
            image_url,
            video_url: video_url.clone(),
            is_early: false,
        };
        self.hub
            .broadcast_to_camera_owners(&ctx.camera_id, &full, ctx.user_id.as_deref())
            .await;

        if let (Some(alert_id), Some(video_url)) = (alert_id, video_url) {
            if let Err(e) = self.alerts.patch_video_url(&alert_id, &video_url).await {
                tracing::error!(camera_id = %ctx.camera_id, error = %e, "Alert record patch failed");
            }
        }

        // Always runs, whatever the phase produced
        let _ = tokio::fs::remove_file(&frame_path).await;
    }

    /// Produce a clip URL for the camera, reusing a fresh cached one if
    /// available. Returns None when any step fails; the full event then
    /// goes out without a clip.
    async fn produce_clip(&self, ctx: &FrameContext) -> Option<String> {
        if let Some(url) = self.clip_cache.fresh_url(&ctx.camera_id).await {
            return Some(url);
        }

        let source_uri = match self
            .directory
            .source_uri(&ctx.camera_id, ctx.user_id.as_deref())
            .await
        {
            Ok(Some(uri)) => uri,
            Ok(None) => {
                tracing::warn!(camera_id = %ctx.camera_id, "No source URI for clip production");
                return None;
            }
            Err(e) => {
                tracing::error!(camera_id = %ctx.camera_id, error = %e, "Source URI lookup failed");
                return None;
            }
        };

        if let Err(e) = self.recorder.start(&ctx.camera_id, &source_uri).await {
            tracing::error!(camera_id = %ctx.camera_id, error = %e, "Evidence recorder start failed");
            return None;
        }

        let segment = self.wait_for_segment(&ctx.camera_id).await?;

        let clip = match cut_last_seconds(&segment, self.config.clip_seconds, &self.config.upload_dir).await
        {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(camera_id = %ctx.camera_id, error = %e, "Clip cut failed");
                return None;
            }
        };

        let url = match self.media.upload_video(&clip, "alert_clips").await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::error!(camera_id = %ctx.camera_id, error = %e, "Clip upload failed");
                None
            }
        };

        if let Some(url) = &url {
            self.clip_cache.store(&ctx.camera_id, url.clone()).await;
        }
        let _ = tokio::fs::remove_file(&clip).await;
        url
    }

    /// Poll for the recorder's first flushed segment with bounded retries
    async fn wait_for_segment(&self, camera_id: &str) -> Option<PathBuf> {
        for _ in 0..self.config.segment_poll_attempts {
            if let Some(path) = self.recorder.latest_segment(camera_id).await {
                return Some(path);
            }
            tokio::time::sleep(self.config.segment_poll_interval).await;
        }
        tracing::warn!(camera_id = %camera_id, "No recorded segment appeared in time");
        None
    }

    /// Check the per-camera alert cooldown and, when open, record this
    /// alert's time. Always open when no cooldown is configured.
    async fn cooldown_open(&self, camera_id: &str) -> bool {
        let Some(window) = self.config.cooldown else {
            return true;
        };

        let mut last_alert = self.last_alert.write().await;
        let now = Instant::now();
        match last_alert.get(camera_id) {
            Some(last) if now.duration_since(*last) < window => false,
            _ => {
                last_alert.insert(camera_id.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_store::AlertStore;
    use crate::camera_directory::CameraDirectory;
    use crate::clip_cache::ClipCache;
    use crate::detector_client::DetectorClient;
    use crate::evidence_recorder::{EvidenceRecorder, RecorderConfig};
    use crate::media_store::MediaStore;
    use crate::mjpeg::EMPTY_JPEG;
    use axum::http::StatusCode;
    use axum::routing::{get, patch, post};
    use axum::Json;
    use serde_json::json;

    /// Stand-in for every external collaborator (detector, media store,
    /// alert API, camera directory) on an ephemeral port. The directory
    /// has no camera documents, so clip production bails out and the full
    /// event carries `videoUrl=null`.
    async fn spawn_backend(upload_ok: bool) -> String {
        let upload = move || async move {
            if upload_ok {
                (
                    StatusCode::OK,
                    Json(json!({ "secure_url": "http://cdn.test/evidence.jpg" })),
                )
            } else {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "storage down" })),
                )
            }
        };

        let app = axum::Router::new()
            .route(
                "/detect",
                post(|| async {
                    Json(json!({ "fire_detected": true, "class": "fire", "confidence": 0.92 }))
                }),
            )
            .route("/upload", post(upload))
            .route(
                "/alerts",
                post(|| async { Json(json!({ "alertId": "alert-1" })) }),
            )
            .route("/alerts/:id", patch(|| async { StatusCode::OK }))
            .route(
                "/cameras/:id/owners",
                get(|| async { Json(json!({ "owners": ["u1"] })) }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn wired_pipeline(
        base: &str,
        upload_dir: std::path::PathBuf,
    ) -> (Arc<DetectionPipeline>, Arc<AlertHub>) {
        let directory = Arc::new(CameraDirectory::new(
            base.to_string(),
            None,
            Duration::from_secs(300),
        ));
        let hub = Arc::new(AlertHub::new(directory.clone()));
        let pipeline = Arc::new(DetectionPipeline::new(
            Arc::new(DetectorClient::new(base.to_string())),
            hub.clone(),
            Arc::new(EvidenceRecorder::new(RecorderConfig::default())),
            Arc::new(ClipCache::new(Duration::from_secs(60))),
            directory,
            Arc::new(MediaStore::new(base.to_string())),
            Arc::new(AlertStore::new(format!("{}/alerts", base), "secret".to_string())),
            DetectionConfig {
                upload_dir,
                ..DetectionConfig::default()
            },
        ));
        (pipeline, hub)
    }

    fn test_ctx() -> FrameContext {
        FrameContext {
            camera_id: "cam-b".to_string(),
            camera_name: Some("Backyard".to_string()),
            location: Some("North fence".to_string()),
            user_id: Some("u1".to_string()),
        }
    }

    fn pipeline_with(cooldown: Option<Duration>) -> Arc<DetectionPipeline> {
        let directory = Arc::new(CameraDirectory::new(
            "http://localhost:0".to_string(),
            None,
            Duration::from_secs(300),
        ));
        Arc::new(DetectionPipeline::new(
            Arc::new(DetectorClient::new("http://localhost:0".to_string())),
            Arc::new(AlertHub::new(directory.clone())),
            Arc::new(EvidenceRecorder::new(RecorderConfig::default())),
            Arc::new(ClipCache::new(Duration::from_secs(60))),
            directory,
            Arc::new(MediaStore::new("http://localhost:0".to_string())),
            Arc::new(AlertStore::new(
                "http://localhost:0".to_string(),
                "secret".to_string(),
            )),
            DetectionConfig {
                cooldown,
                ..DetectionConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn two_phase_alert_delivers_early_then_full_event() {
        let base = spawn_backend(true).await;
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, hub) = wired_pipeline(&base, tmp.path().to_path_buf());
        let (_conn, mut rx) = hub.connect("u1").await;

        let detection = pipeline
            .process(EMPTY_JPEG.to_vec(), test_ctx())
            .await
            .unwrap();
        assert!(detection.is_alert());
        assert_eq!(detection.label, "fire");

        // The early event is in the subscriber's channel before process()
        // returned, with no media yet
        let early: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(early["isEarly"], true);
        assert_eq!(early["type"], "fire");
        assert_eq!(early["imageUrl"], serde_json::Value::Null);
        assert_eq!(early["videoUrl"], serde_json::Value::Null);

        let full_json = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("full event timed out")
            .unwrap();
        let full: serde_json::Value = serde_json::from_str(&full_json).unwrap();
        assert_eq!(full["isEarly"], false);
        assert_eq!(full["imageUrl"], "http://cdn.test/evidence.jpg");
        assert_eq!(full["videoUrl"], serde_json::Value::Null);

        // The temp frame file is removed once the full phase finishes
        for _ in 0..20 {
            if frame_files(tmp.path()) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(frame_files(tmp.path()), 0);
    }

    #[tokio::test]
    async fn full_event_still_sent_when_image_upload_fails() {
        let base = spawn_backend(false).await;
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, hub) = wired_pipeline(&base, tmp.path().to_path_buf());
        let (_conn, mut rx) = hub.connect("u1").await;

        let detection = pipeline
            .process(EMPTY_JPEG.to_vec(), test_ctx())
            .await
            .unwrap();
        assert!(detection.is_alert());

        let early: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(early["isEarly"], true);

        let full_json = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("full event timed out")
            .unwrap();
        let full: serde_json::Value = serde_json::from_str(&full_json).unwrap();
        assert_eq!(full["isEarly"], false);
        assert_eq!(full["imageUrl"], serde_json::Value::Null);
        assert_eq!(full["videoUrl"], serde_json::Value::Null);
    }

    fn frame_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .map(|x| x == "jpg")
                    .unwrap_or(false)
            })
            .count()
    }

    #[tokio::test]
    async fn cooldown_disabled_is_always_open() {
        let pipeline = pipeline_with(None);
        assert!(pipeline.cooldown_open("cam-1").await);
        assert!(pipeline.cooldown_open("cam-1").await);
    }

    #[tokio::test]
    async fn cooldown_blocks_repeat_alert_within_window() {
        let pipeline = pipeline_with(Some(Duration::from_secs(60)));
        assert!(pipeline.cooldown_open("cam-1").await);
        assert!(!pipeline.cooldown_open("cam-1").await);
        // Independent per camera
        assert!(pipeline.cooldown_open("cam-2").await);
    }

    #[tokio::test]
    async fn cooldown_reopens_after_window() {
        let pipeline = pipeline_with(Some(Duration::from_millis(20)));
        assert!(pipeline.cooldown_open("cam-1").await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(pipeline.cooldown_open("cam-1").await);
    }
}
