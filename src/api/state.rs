//! API shared state

use std::sync::Arc;

use crate::actors::Manager;
use crate::storage::StorageBackend;

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Owner of the freshness cache
    pub manager: Arc<Manager>,

    /// Storage backend for drained records
    pub storage: Arc<dyn StorageBackend>,
}

impl ApiState {
    pub fn new(manager: Arc<Manager>) -> Self {
        let storage = manager.backend();
        Self { manager, storage }
    }
}
