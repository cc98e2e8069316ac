//! Freshness cache endpoint

use std::collections::HashMap;

use axum::Json;
use axum::extract::State;

use crate::api::state::ApiState;
use crate::{EntityId, Sample};

/// GET /api/v1/manager
///
/// Latest sample of every guest, keyed by vmid
pub async fn list_latest(State(state): State<ApiState>) -> Json<HashMap<EntityId, Sample>> {
    Json(state.manager.snapshot().await)
}
