//! Shared API response models

use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub detector_reachable: bool,
    pub directory_reachable: bool,
    pub active_connections: u64,
}
