//! EvidenceRecorder - rolling segment recording per camera
//!
//! ## Responsibilities
//!
//! - One stream-copy ffmpeg segment writer per camera, started lazily on
//!   the first alert and kept alive across alerts
//! - Retention of the newest K segment files (oldest deleted first)
//! - Automatic restart with a short backoff when the process exits
//! - Latest-segment lookup for the clip cutter
//!
//! Liveness is an explicit state flag owned by the session's monitor
//! task, never inferred from process internals.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;

/// EvidenceRecorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Segment duration in seconds
    pub segment_seconds: u64,
    /// Segments retained per camera
    pub max_segments: usize,
    /// Delay before restarting an exited process
    pub restart_delay: Duration,
    /// Base directory for per-camera segment directories
    pub base_dir: PathBuf,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            segment_seconds: 60,
            max_segments: 3,
            restart_delay: Duration::from_secs(2),
            base_dir: std::env::temp_dir(),
        }
    }
}

struct RecorderSession {
    dir: PathBuf,
    running: Arc<AtomicBool>,
    abort: tokio::task::AbortHandle,
}

/// EvidenceRecorder instance
pub struct EvidenceRecorder {
    sessions: RwLock<HashMap<String, RecorderSession>>,
    config: RecorderConfig,
}

impl EvidenceRecorder {
    /// Create new EvidenceRecorder
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Start recording a camera. Idempotent: an existing session keeps
    /// running (its monitor handles restarts), so repeated alerts for the
    /// same camera are free.
    pub async fn start(self: &Arc<Self>, camera_id: &str, source_uri: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(camera_id) {
            return Ok(());
        }

        let dir = self.config.base_dir.join(format!("rec_{}", camera_id));
        tokio::fs::create_dir_all(&dir).await?;

        let running = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(record_loop(
            camera_id.to_string(),
            source_uri.to_string(),
            dir.clone(),
            running.clone(),
            self.config.clone(),
        ));

        sessions.insert(
            camera_id.to_string(),
            RecorderSession {
                dir,
                running,
                abort: handle.abort_handle(),
            },
        );

        tracing::info!(camera_id = %camera_id, "Evidence recorder started");
        Ok(())
    }

    /// Most recently modified retained segment for a camera, or None if
    /// the recorder has not flushed one yet.
    pub async fn latest_segment(&self, camera_id: &str) -> Option<PathBuf> {
        let dir = {
            let sessions = self.sessions.read().await;
            sessions.get(camera_id)?.dir.clone()
        };
        latest_segment_in(&dir).await
    }

    /// Whether the camera's recording process is currently alive
    pub async fn is_running(&self, camera_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(camera_id)
            .map(|s| s.running.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Stop recording a camera and discard its session
    pub async fn stop(&self, camera_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.remove(camera_id) {
            session.abort.abort();
            tracing::info!(camera_id = %camera_id, "Evidence recorder stopped");
        }
    }
}

/// Spawn-monitor-restart loop for one camera's recording process.
async fn record_loop(
    camera_id: String,
    source_uri: String,
    dir: PathBuf,
    running: Arc<AtomicBool>,
    config: RecorderConfig,
) {
    let pattern = dir.join(format!("{}_%03d.mp4", camera_id));
    let pattern = pattern.to_string_lossy().into_owned();

    loop {
        let spawned = Command::new("ffmpeg")
            .args([
                "-nostdin",
                "-hide_banner",
                "-loglevel",
                "warning",
                "-rtsp_transport",
                "udp",
                "-i",
                &source_uri,
                "-c",
                "copy",
                "-f",
                "segment",
                "-segment_time",
                &config.segment_seconds.to_string(),
                "-reset_timestamps",
                "1",
                "-map",
                "0",
                &pattern,
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(camera_id = %camera_id, error = %e, "Recorder spawn failed");
                tokio::time::sleep(config.restart_delay).await;
                continue;
            }
        };

        running.store(true, Ordering::Relaxed);

        let mut prune_tick = tokio::time::interval(Duration::from_secs(5));
        prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = prune_tick.tick() => {
                    prune_segments(&dir, config.max_segments).await;
                }
            }
        };

        running.store(false, Ordering::Relaxed);
        tracing::warn!(
            camera_id = %camera_id,
            status = ?status.ok().and_then(|s| s.code()),
            "Recorder process exited, restarting"
        );

        tokio::time::sleep(config.restart_delay).await;
    }
}

/// Delete all but the `keep` most recently modified segments in a directory
async fn prune_segments(dir: &Path, keep: usize) {
    let mut segments = match list_segments(dir).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Segment listing failed");
            return;
        }
    };

    // Newest first
    segments.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in segments.into_iter().skip(keep) {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "Segment delete failed");
        } else {
            tracing::debug!(path = %path.display(), "Pruned old segment");
        }
    }
}

/// Most recently modified segment in a directory
async fn latest_segment_in(dir: &Path) -> Option<PathBuf> {
    let segments = list_segments(dir).await.ok()?;
    segments
        .into_iter()
        .max_by_key(|(_, mtime)| *mtime)
        .map(|(path, _)| path)
}

async fn list_segments(dir: &Path) -> Result<Vec<(PathBuf, std::time::SystemTime)>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(Error::Io)?;
    let mut segments = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map(|e| e == "mp4").unwrap_or(false) {
            let meta = entry.metadata().await?;
            let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            segments.push((path, mtime));
        }
    }

    Ok(segments)
}
