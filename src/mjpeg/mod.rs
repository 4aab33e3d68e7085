//! MJPEG framing - JPEG marker scanning and multipart part encoding
//!
//! ## Responsibilities
//!
//! - Extract complete JPEG frames from a streaming byte source (ffmpeg stdout)
//! - Bound buffer growth against stalled or malformed streams
//! - Encode frames as `multipart/x-mixed-replace` parts for live viewers

use bytes::{BufMut, Bytes, BytesMut};

/// JPEG start-of-image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Minimal valid JPEG, served when no frame is available yet
pub const EMPTY_JPEG: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xD9];

/// Multipart boundary used by the live stream endpoint
pub const STREAM_BOUNDARY: &str = "frame";

/// Content type for the live stream endpoint
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Buffer reset threshold (5 MB)
pub const DEFAULT_BUFFER_LIMIT: usize = 5 * 1024 * 1024;

/// Incremental JPEG frame scanner over a chunked byte stream.
///
/// Bytes are appended as they arrive; each call drains every complete
/// SOI..=EOI frame found so far. Bytes before a frame's SOI are discarded
/// together with the frame, and the buffer is reset to empty if it grows
/// past the limit without yielding a marker pair.
pub struct FrameScanner {
    buf: BytesMut,
    limit: usize,
}

impl FrameScanner {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Append a chunk and return all frames completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let Some(start) = find_marker(&self.buf, SOI, 0) else {
                break;
            };
            let Some(end) = find_marker(&self.buf, EOI, start + 2) else {
                break;
            };

            // Everything up to and including EOI is consumed; leading
            // garbage before SOI goes with it.
            let consumed = self.buf.split_to(end + 2);
            frames.push(consumed.freeze().slice(start..));
        }

        if frames.is_empty() && self.buf.len() > self.limit {
            tracing::warn!(
                buffered = self.buf.len(),
                limit = self.limit,
                "Frame buffer overflow, resetting"
            );
            self.buf.clear();
        }

        frames
    }

    /// Bytes currently held without a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_LIMIT)
    }
}

/// Find a two-byte marker at or after `from`
fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < 2 || from + 1 >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| from + pos)
}

/// Encode one JPEG frame as a multipart part:
/// `--frame\r\nContent-Type: image/jpeg\r\nContent-Length: <n>\r\n\r\n<frame>\r\n`
pub fn encode_part(frame: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        STREAM_BOUNDARY,
        frame.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(frame);
    part.put_slice(b"\r\n");
    part.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(payload: &[u8]) -> Vec<u8> {
        let mut frame = SOI.to_vec();
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&EOI);
        frame
    }

    #[test]
    fn single_frame_in_one_chunk() {
        let frame = fake_jpeg(b"abc");
        let mut scanner = FrameScanner::default();
        let frames = scanner.push(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn frame_reassembled_from_arbitrary_chunk_sizes() {
        let frame = fake_jpeg(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);

        for chunk_size in 1..=frame.len() {
            let mut scanner = FrameScanner::default();
            let mut frames = Vec::new();
            for chunk in frame.chunks(chunk_size) {
                frames.extend(scanner.push(chunk));
            }
            assert_eq!(frames.len(), 1, "chunk_size={}", chunk_size);
            assert_eq!(&frames[0][..], &frame[..], "chunk_size={}", chunk_size);
        }
    }

    #[test]
    fn marker_split_across_chunk_boundary() {
        let frame = fake_jpeg(b"xy");
        let mut scanner = FrameScanner::default();

        // Split right in the middle of the EOI marker
        let split = frame.len() - 1;
        assert!(scanner.push(&frame[..split]).is_empty());
        let frames = scanner.push(&frame[split..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
    }

    #[test]
    fn leading_garbage_is_discarded() {
        let frame = fake_jpeg(b"data");
        let mut input = vec![0x00, 0x11, 0x22];
        input.extend_from_slice(&frame);

        let mut scanner = FrameScanner::default();
        let frames = scanner.push(&input);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let a = fake_jpeg(b"aaaa");
        let b = fake_jpeg(b"bb");
        let mut input = a.clone();
        input.extend_from_slice(&b);

        let mut scanner = FrameScanner::default();
        let frames = scanner.push(&input);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &a[..]);
        assert_eq!(&frames[1][..], &b[..]);
    }

    #[test]
    fn overflow_resets_buffer() {
        let mut scanner = FrameScanner::new(64);

        // Markerless garbage never yields a frame and must not grow unbounded
        for _ in 0..3 {
            let frames = scanner.push(&[0x00; 32]);
            assert!(frames.is_empty());
            assert!(scanner.buffered() <= 64 + 32);
        }
        // Third push crossed the limit and cleared the buffer
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn frame_still_parses_after_reset() {
        let mut scanner = FrameScanner::new(16);
        scanner.push(&[0x00; 32]);
        assert_eq!(scanner.buffered(), 0);

        let frame = fake_jpeg(b"ok");
        let frames = scanner.push(&frame);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn encode_part_layout() {
        let part = encode_part(&EMPTY_JPEG);
        let text = String::from_utf8_lossy(&part[..]);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));
        assert!(part.ends_with(b"\r\n"));
        assert_eq!(
            &part[part.len() - 6..part.len() - 2],
            &EMPTY_JPEG[..]
        );
    }
}
