//! Application configuration and shared state

use crate::alert_hub::AlertHub;
use crate::alert_store::AlertStore;
use crate::auth::TokenVerifier;
use crate::camera_directory::CameraDirectory;
use crate::clip_cache::ClipCache;
use crate::detection::{DetectionConfig, DetectionPipeline};
use crate::detector_client::DetectorClient;
use crate::evidence_recorder::{EvidenceRecorder, RecorderConfig};
use crate::frame_supplier::{FrameSupplier, FrameSupplierConfig};
use crate::live_broadcaster::{BroadcasterConfig, LiveBroadcaster};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration, loaded from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Base URL of the external fire/smoke detector
    pub detector_url: String,
    /// Base URL of the external alert-record API
    pub alert_api_url: String,
    /// Base URL of the camera ownership/metadata store
    pub directory_url: String,
    /// Base URL of the identity provider used for token verification
    pub identity_url: String,
    /// Base URL of the media storage service
    pub media_store_url: String,
    /// Shared secret for the frame-pull worker
    pub worker_secret: String,
    /// Fallback identity for camera lookups without an owner
    pub admin_identity: Option<String>,
    /// Working directory for temporary frames and clips
    pub upload_dir: PathBuf,
    /// Base directory for per-camera recording segments
    pub recording_dir: PathBuf,
    pub segment_seconds: u64,
    pub max_segments: usize,
    pub clip_seconds: u64,
    pub clip_reuse_minutes: u64,
    pub camera_info_ttl_seconds: u64,
    pub segment_poll_attempts: u32,
    pub segment_poll_interval_ms: u64,
    /// Minimum minutes between alerts per camera; unset disables the gate
    pub alert_cooldown_minutes: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            detector_url: "http://localhost:5000".to_string(),
            alert_api_url: "http://localhost:3000/api/alerts".to_string(),
            directory_url: "http://localhost:3000/api/directory".to_string(),
            identity_url: "http://localhost:3000/api/auth".to_string(),
            media_store_url: "http://localhost:3000/api/media".to_string(),
            worker_secret: String::new(),
            admin_identity: None,
            upload_dir: PathBuf::from("uploads"),
            recording_dir: PathBuf::from("recordings"),
            segment_seconds: 60,
            max_segments: 3,
            clip_seconds: 30,
            clip_reuse_minutes: 30,
            camera_info_ttl_seconds: 300,
            segment_poll_attempts: 6,
            segment_poll_interval_ms: 500,
            alert_cooldown_minutes: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("HOST", &defaults.host),
            port: env_parsed("PORT", defaults.port),
            detector_url: env_or("DETECTOR_URL", &defaults.detector_url),
            alert_api_url: env_or("ALERT_API_URL", &defaults.alert_api_url),
            directory_url: env_or("DIRECTORY_URL", &defaults.directory_url),
            identity_url: env_or("IDENTITY_URL", &defaults.identity_url),
            media_store_url: env_or("MEDIA_STORE_URL", &defaults.media_store_url),
            worker_secret: env_or("WORKER_SECRET", &defaults.worker_secret),
            admin_identity: std::env::var("ADMIN_IDENTITY").ok().filter(|v| !v.is_empty()),
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", "uploads")),
            recording_dir: PathBuf::from(env_or("RECORDING_DIR", "recordings")),
            segment_seconds: env_parsed("VIDEO_SEGMENT_SECONDS", defaults.segment_seconds),
            max_segments: env_parsed("VIDEO_MAX_SEGMENTS", defaults.max_segments),
            clip_seconds: env_parsed("CLIP_SECONDS", defaults.clip_seconds),
            clip_reuse_minutes: env_parsed("CLIP_REUSE_MINUTES", defaults.clip_reuse_minutes),
            camera_info_ttl_seconds: env_parsed("CAMERA_INFO_TTL_SECONDS", defaults.camera_info_ttl_seconds),
            segment_poll_attempts: env_parsed("SEGMENT_POLL_ATTEMPTS", defaults.segment_poll_attempts),
            segment_poll_interval_ms: env_parsed("SEGMENT_POLL_INTERVAL_MS", defaults.segment_poll_interval_ms),
            alert_cooldown_minutes: std::env::var("ALERT_COOLDOWN_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub directory: Arc<CameraDirectory>,
    pub verifier: Arc<TokenVerifier>,
    pub detector: Arc<DetectorClient>,
    pub supplier: Arc<FrameSupplier>,
    pub broadcaster: Arc<LiveBroadcaster>,
    pub recorder: Arc<EvidenceRecorder>,
    pub hub: Arc<AlertHub>,
    pub pipeline: Arc<DetectionPipeline>,
}

impl AppState {
    /// Wire up all services from configuration
    pub fn new(config: AppConfig) -> Self {
        let directory = Arc::new(CameraDirectory::new(
            config.directory_url.clone(),
            config.admin_identity.clone(),
            Duration::from_secs(config.camera_info_ttl_seconds),
        ));
        let verifier = Arc::new(TokenVerifier::new(config.identity_url.clone()));
        let detector = Arc::new(DetectorClient::new(config.detector_url.clone()));
        let supplier = Arc::new(FrameSupplier::new(
            directory.clone(),
            FrameSupplierConfig::default(),
        ));
        let broadcaster = Arc::new(LiveBroadcaster::new(BroadcasterConfig::default()));
        let recorder = Arc::new(EvidenceRecorder::new(RecorderConfig {
            segment_seconds: config.segment_seconds,
            max_segments: config.max_segments,
            base_dir: config.recording_dir.clone(),
            ..RecorderConfig::default()
        }));
        let hub = Arc::new(AlertHub::new(directory.clone()));
        let clip_cache = Arc::new(ClipCache::new(Duration::from_secs(
            config.clip_reuse_minutes * 60,
        )));
        let media = Arc::new(crate::media_store::MediaStore::new(
            config.media_store_url.clone(),
        ));
        let alerts = Arc::new(AlertStore::new(
            config.alert_api_url.clone(),
            config.worker_secret.clone(),
        ));
        let pipeline = Arc::new(DetectionPipeline::new(
            detector.clone(),
            hub.clone(),
            recorder.clone(),
            clip_cache,
            directory.clone(),
            media,
            alerts,
            DetectionConfig {
                upload_dir: config.upload_dir.clone(),
                clip_seconds: config.clip_seconds,
                segment_poll_attempts: config.segment_poll_attempts,
                segment_poll_interval: Duration::from_millis(config.segment_poll_interval_ms),
                cooldown: config
                    .alert_cooldown_minutes
                    .map(|m| Duration::from_secs(m * 60)),
            },
        ));

        Self {
            config: Arc::new(config),
            directory,
            verifier,
            detector,
            supplier,
            broadcaster,
            recorder,
            hub,
            pipeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_cooldown_disabled() {
        let config = AppConfig::default();
        assert!(config.alert_cooldown_minutes.is_none());
        assert_eq!(config.clip_seconds, 30);
        assert_eq!(config.max_segments, 3);
    }
}
