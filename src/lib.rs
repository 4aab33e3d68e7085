//! Emberwatch - camera monitoring core for fire/smoke detection
//!
//! Real-time video fan-out and a two-phase alert-event pipeline around an
//! external frame classifier: per-camera frame supply for the detection
//! worker, live MJPEG broadcast to viewers, rolling evidence recording
//! with clip extraction, and alert delivery over WebSockets.

pub mod alert_hub;
pub mod alert_store;
pub mod auth;
pub mod camera_directory;
pub mod clip_cache;
pub mod clip_cutter;
pub mod detection;
pub mod detector_client;
pub mod error;
pub mod evidence_recorder;
pub mod frame_supplier;
pub mod live_broadcaster;
pub mod media_store;
pub mod mjpeg;
pub mod models;
pub mod state;
pub mod web_api;

pub use error::{Error, Result};
