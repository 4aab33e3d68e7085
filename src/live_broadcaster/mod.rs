//! LiveBroadcaster - one decoding process per camera, fanned out to all
//! connected viewers
//!
//! ## Responsibilities
//!
//! - Lazy ffmpeg session start on the first viewer for a camera
//! - Per-frame fan-out to every registered viewer sink as
//!   `multipart/x-mixed-replace` parts
//! - Sink removal on write failure or viewer disconnect, without
//!   disturbing other viewers
//! - Process teardown when the viewer set empties or the process exits
//!
//! Per-viewer delivery stays in order (each sink is its own channel); no
//! ordering is promised across viewers.

use crate::error::{Error, Result};
use crate::mjpeg::{encode_part, FrameScanner, DEFAULT_BUFFER_LIMIT};
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

/// LiveBroadcaster configuration
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Frames per second for live viewing
    pub fps: u32,
    /// Normalized output width
    pub width: u32,
    /// Normalized output height
    pub height: u32,
    /// JPEG quality (ffmpeg -q:v, lower is better)
    pub quality: u32,
    /// Frame buffer overflow threshold
    pub buffer_limit: usize,
    /// Per-viewer queue depth; a full queue drops frames for that viewer
    pub viewer_queue: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            fps: 7,
            width: 640,
            height: 360,
            quality: 4,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            viewer_queue: 8,
        }
    }
}

type ViewerMap = HashMap<Uuid, mpsc::Sender<Bytes>>;

struct BroadcastSession {
    id: Uuid,
    viewers: Mutex<ViewerMap>,
    abort: std::sync::Mutex<Option<tokio::task::AbortHandle>>,
}

/// LiveBroadcaster instance
pub struct LiveBroadcaster {
    sessions: RwLock<HashMap<String, Arc<BroadcastSession>>>,
    config: BroadcasterConfig,
}

impl LiveBroadcaster {
    /// Create new LiveBroadcaster
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Attach a viewer to a camera's live stream, starting the decoding
    /// session if this is the first viewer.
    pub async fn attach_viewer(
        self: &Arc<Self>,
        camera_id: &str,
        source_uri: &str,
    ) -> Result<ViewerStream> {
        let viewer_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.viewer_queue);

        let mut sessions = self.sessions.write().await;
        let viewer_count = match sessions.get(camera_id) {
            Some(session) => {
                let mut viewers = session.viewers.lock().await;
                viewers.insert(viewer_id, tx);
                viewers.len()
            }
            None => {
                // The first sink is seeded before the reader task spawns so
                // it can never observe an empty viewer set at startup
                let session = self.start_session(camera_id, source_uri, viewer_id, tx)?;
                sessions.insert(camera_id.to_string(), session);
                1
            }
        };
        drop(sessions);

        tracing::info!(
            camera_id = %camera_id,
            viewer_id = %viewer_id,
            viewers = viewer_count,
            "Viewer attached"
        );

        Ok(ViewerStream {
            camera_id: camera_id.to_string(),
            viewer_id,
            rx,
            broadcaster: self.clone(),
        })
    }

    /// Detach a viewer. Tears the session down when the last viewer leaves.
    pub async fn detach_viewer(&self, camera_id: &str, viewer_id: &Uuid) {
        let session = {
            let sessions = self.sessions.read().await;
            match sessions.get(camera_id) {
                Some(s) => s.clone(),
                None => return,
            }
        };

        let remaining = {
            let mut viewers = session.viewers.lock().await;
            viewers.remove(viewer_id);
            viewers.len()
        };

        tracing::info!(
            camera_id = %camera_id,
            viewer_id = %viewer_id,
            viewers = remaining,
            "Viewer detached"
        );

        if remaining == 0 {
            self.teardown(camera_id, &session.id).await;
        }
    }

    /// Number of live broadcaster sessions (debug)
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn start_session(
        self: &Arc<Self>,
        camera_id: &str,
        source_uri: &str,
        first_viewer: Uuid,
        first_sink: mpsc::Sender<Bytes>,
    ) -> Result<Arc<BroadcastSession>> {
        let scale = format!(
            "fps={},scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
            self.config.fps,
            w = self.config.width,
            h = self.config.height,
        );

        let mut child = Command::new("ffmpeg")
            .args([
                "-nostdin",
                "-hide_banner",
                "-loglevel",
                "error",
                "-rtsp_transport",
                "udp",
                "-probesize",
                "5000000",
                "-analyzeduration",
                "5000000",
                "-max_delay",
                "1000000",
                "-reorder_queue_size",
                "1000",
                "-i",
                source_uri,
                "-vf",
                &scale,
                "-q:v",
                &self.config.quality.to_string(),
                "-f",
                "image2pipe",
                "-vcodec",
                "mjpeg",
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

        let session = Arc::new(BroadcastSession {
            id: Uuid::new_v4(),
            viewers: Mutex::new(HashMap::from([(first_viewer, first_sink)])),
            abort: std::sync::Mutex::new(None),
        });

        tracing::info!(camera_id = %camera_id, session_id = %session.id, "Broadcast session started");

        let broadcaster = self.clone();
        let camera = camera_id.to_string();
        let reader_session = session.clone();
        let buffer_limit = self.config.buffer_limit;
        let handle = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut scanner = FrameScanner::new(buffer_limit);
            let mut chunk = vec![0u8; 64 * 1024];

            'read: loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for frame in scanner.push(&chunk[..n]) {
                            let part = encode_part(&frame);
                            let mut viewers = reader_session.viewers.lock().await;
                            if fan_out(&mut viewers, &part) == 0 {
                                tracing::info!(camera_id = %camera, "Last viewer gone, stopping broadcast");
                                break 'read;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(camera_id = %camera, error = %e, "Broadcast read error");
                        break;
                    }
                }
            }

            // Closes every remaining viewer's channel; a process that died
            // on its own disconnects its viewers here.
            reader_session.viewers.lock().await.clear();

            let code = reap(child).await;
            tracing::info!(camera_id = %camera, status = ?code, "Broadcast process exited");

            broadcaster.teardown(&camera, &reader_session.id).await;
        });

        *session.abort.lock().expect("abort handle lock") = Some(handle.abort_handle());

        Ok(session)
    }

    /// Remove a session from the registry and stop its reader task (which
    /// drops the process handle and kills ffmpeg).
    async fn teardown(&self, camera_id: &str, session_id: &Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(camera_id).map(|s| s.id) != Some(*session_id) {
            return;
        }
        let session = sessions.remove(camera_id).expect("session present");
        drop(sessions);

        if let Some(abort) = session.abort.lock().expect("abort handle lock").take() {
            abort.abort();
        }
        tracing::info!(camera_id = %camera_id, session_id = %session_id, "Broadcast session removed");
    }
}

/// Terminate and reap a decoding process.
///
/// The zero-viewer exit path leaves the process running, so it is killed
/// before the wait; on an already-exited process the kill is a no-op.
async fn reap(mut child: tokio::process::Child) -> Option<i32> {
    let _ = child.start_kill();
    child.wait().await.ok().and_then(|s| s.code())
}

/// Deliver one encoded part to every viewer sink.
///
/// A closed sink is removed; a full sink just misses this frame (the
/// viewer is lagging, not gone). Returns the remaining viewer count.
fn fan_out(viewers: &mut ViewerMap, part: &Bytes) -> usize {
    let mut dead = Vec::new();
    for (id, tx) in viewers.iter() {
        match tx.try_send(part.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
        }
    }
    for id in dead {
        viewers.remove(&id);
        tracing::debug!(viewer_id = %id, "Removed dead viewer sink");
    }
    viewers.len()
}

/// One viewer's live stream: yields encoded multipart chunks and detaches
/// itself from the broadcaster when dropped (connection closed).
pub struct ViewerStream {
    camera_id: String,
    viewer_id: Uuid,
    rx: mpsc::Receiver<Bytes>,
    broadcaster: Arc<LiveBroadcaster>,
}

impl ViewerStream {
    pub fn viewer_id(&self) -> Uuid {
        self.viewer_id
    }
}

impl Stream for ViewerStream {
    type Item = std::result::Result<Bytes, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|opt| opt.map(Ok))
    }
}

impl Drop for ViewerStream {
    fn drop(&mut self) {
        let broadcaster = self.broadcaster.clone();
        let camera_id = self.camera_id.clone();
        let viewer_id = self.viewer_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                broadcaster.detach_viewer(&camera_id, &viewer_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn viewer_map(n: usize) -> (ViewerMap, Vec<(Uuid, mpsc::Receiver<Bytes>)>) {
        let mut viewers = HashMap::new();
        let mut receivers = Vec::new();
        for _ in 0..n {
            let id = Uuid::new_v4();
            let (tx, rx) = mpsc::channel(8);
            viewers.insert(id, tx);
            receivers.push((id, rx));
        }
        (viewers, receivers)
    }

    #[tokio::test]
    async fn fan_out_delivers_to_all_viewers() {
        let (mut viewers, mut receivers) = viewer_map(3);
        let part = encode_part(&[0xFF, 0xD8, 0xFF, 0xD9]);

        assert_eq!(fan_out(&mut viewers, &part), 3);
        for (_, rx) in receivers.iter_mut() {
            assert_eq!(rx.recv().await.unwrap(), part);
        }
    }

    #[tokio::test]
    async fn disconnected_viewer_is_removed_without_disturbing_others() {
        let (mut viewers, mut receivers) = viewer_map(3);
        let part = encode_part(&[0xFF, 0xD8, 0xFF, 0xD9]);

        // One viewer closes its connection
        let (_gone, gone_rx) = receivers.remove(0);
        drop(gone_rx);

        assert_eq!(fan_out(&mut viewers, &part), 2);
        for (_, rx) in receivers.iter_mut() {
            assert_eq!(rx.recv().await.unwrap(), part);
        }

        // Subsequent frames keep flowing to the survivors
        assert_eq!(fan_out(&mut viewers, &part), 2);
        for (_, rx) in receivers.iter_mut() {
            assert_eq!(rx.recv().await.unwrap(), part);
        }
    }

    #[tokio::test]
    async fn empty_viewer_set_reports_zero() {
        let (mut viewers, receivers) = viewer_map(1);
        drop(receivers);
        let part = encode_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(fan_out(&mut viewers, &part), 0);
        assert!(viewers.is_empty());
    }

    #[tokio::test]
    async fn reap_terminates_a_live_process_promptly() {
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let started = Instant::now();
        reap(child).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn reap_reports_the_code_of_an_exited_process() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        assert_eq!(reap(child).await, Some(0));
    }

    #[tokio::test]
    async fn lagging_viewer_drops_frames_but_stays_attached() {
        let mut viewers = HashMap::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(1);
        viewers.insert(id, tx);

        let part = encode_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(fan_out(&mut viewers, &part), 1);
        // Queue is full now; the next frame is dropped for this viewer
        assert_eq!(fan_out(&mut viewers, &part), 1);
        assert!(viewers.contains_key(&id));

        assert_eq!(rx.recv().await.unwrap(), part);
    }
}
