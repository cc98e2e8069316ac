//! API response types

use serde::{Deserialize, Serialize};

use crate::storage::StoredRecord;

/// Response for GET /api/v1/data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataResponse {
    pub items: Vec<StoredRecord>,
}

/// Storage part of the health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHealth {
    pub healthy: bool,
    pub message: String,
}

/// Response for GET /api/v1/health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`
    pub status: String,
    pub timestamp: String,

    /// Guests currently held in the cache
    pub guests: usize,

    pub storage: StorageHealth,
}
