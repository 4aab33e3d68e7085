//! FrameSupplier - on-demand latest-frame capture per camera
//!
//! ## Responsibilities
//!
//! - One low-rate ffmpeg decoding process per camera, started lazily on
//!   the first frame request
//! - JPEG frame extraction from the process stdout stream
//! - "Latest frame" slot exposed to the detection worker's pull loop
//! - Session removal and source-URI cache invalidation on process exit
//!
//! There is no restart loop: a request arriving after the process died
//! simply starts a fresh session (pull-based recovery).

use crate::camera_directory::CameraDirectory;
use crate::error::{Error, Result};
use crate::mjpeg::{FrameScanner, DEFAULT_BUFFER_LIMIT};
use bytes::Bytes;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use uuid::Uuid;

/// FrameSupplier configuration
#[derive(Debug, Clone)]
pub struct FrameSupplierConfig {
    /// Frames per second requested from ffmpeg (low rate, detection only)
    pub fps: u32,
    /// Frame buffer overflow threshold
    pub buffer_limit: usize,
}

impl Default for FrameSupplierConfig {
    fn default() -> Self {
        Self {
            fps: 2,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

struct SupplierSession {
    id: Uuid,
    latest_frame: Arc<RwLock<Option<Bytes>>>,
}

/// FrameSupplier instance
pub struct FrameSupplier {
    sessions: RwLock<HashMap<String, SupplierSession>>,
    directory: Arc<CameraDirectory>,
    config: FrameSupplierConfig,
}

impl FrameSupplier {
    /// Create new FrameSupplier
    pub fn new(directory: Arc<CameraDirectory>, config: FrameSupplierConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            directory,
            config,
        }
    }

    /// Return the most recently decoded frame for a camera.
    ///
    /// Starts a decoding session on the first call and returns `None`
    /// until the first frame has been extracted; the caller polls.
    pub async fn latest_frame(
        self: &Arc<Self>,
        camera_id: &str,
        owner_id: Option<&str>,
    ) -> Result<Option<Bytes>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(camera_id) {
                return Ok(session.latest_frame.read().await.clone());
            }
        }

        let source_uri = self
            .directory
            .source_uri(camera_id, owner_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Camera {} not found", camera_id)))?;

        self.start_session(camera_id, &source_uri).await?;
        Ok(None)
    }

    /// Number of live supplier sessions (debug)
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn start_session(self: &Arc<Self>, camera_id: &str, source_uri: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(camera_id) {
            // Lost the race to another request; that session wins
            return Ok(());
        }

        let mut child = Command::new("ffmpeg")
            .args([
                "-nostdin",
                "-hide_banner",
                "-loglevel",
                "error",
                "-rtsp_transport",
                "udp",
                "-analyzeduration",
                "5000000",
                "-probesize",
                "5000000",
                "-timeout",
                "10000000",
                "-i",
                source_uri,
                "-vf",
                &format!("fps={}", self.config.fps),
                "-f",
                "image2pipe",
                "-vcodec",
                "mjpeg",
                "-q:v",
                "5",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("ffmpeg spawn failed: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("ffmpeg stdout unavailable".to_string()))?;

        let session_id = Uuid::new_v4();
        let latest_frame = Arc::new(RwLock::new(None));

        sessions.insert(
            camera_id.to_string(),
            SupplierSession {
                id: session_id,
                latest_frame: latest_frame.clone(),
            },
        );
        drop(sessions);

        tracing::info!(camera_id = %camera_id, session_id = %session_id, "Frame supplier session started");

        let supplier = self.clone();
        let camera = camera_id.to_string();
        let buffer_limit = self.config.buffer_limit;
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut scanner = FrameScanner::new(buffer_limit);
            let mut chunk = vec![0u8; 64 * 1024];

            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for frame in scanner.push(&chunk[..n]) {
                            *latest_frame.write().await = Some(frame);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(camera_id = %camera, error = %e, "Frame supplier read error");
                        break;
                    }
                }
            }

            let status = child.wait().await;
            tracing::info!(
                camera_id = %camera,
                session_id = %session_id,
                status = ?status.ok().and_then(|s| s.code()),
                "Frame supplier process exited"
            );

            supplier.remove_session(&camera, &session_id).await;
        });

        Ok(())
    }

    /// Remove an exited session and invalidate its cached source URI so
    /// the next request re-resolves the camera cleanly.
    async fn remove_session(&self, camera_id: &str, session_id: &Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(camera_id).map(|s| s.id) == Some(*session_id) {
            sessions.remove(camera_id);
            drop(sessions);
            self.directory.invalidate(camera_id).await;
        }
    }
}
