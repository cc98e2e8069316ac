//! Stored record endpoint

use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

use crate::EntityId;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::ApiState;
use crate::api::types::DataResponse;
use crate::storage::RecordFilter;

const DEFAULT_LIMIT: usize = 1000;
const MAX_LIMIT: usize = 10_000;

/// Query parameters for GET /api/v1/data
#[derive(Debug, Default, Deserialize)]
pub struct DataQuery {
    /// Comma separated vmids, e.g. `100,101`
    vmids: Option<String>,

    /// Inclusive lower bound (unix seconds)
    from: Option<i64>,

    /// Inclusive upper bound (unix seconds)
    to: Option<i64>,

    /// Max results (default: 1000)
    limit: Option<usize>,
}

impl DataQuery {
    fn into_filter(self) -> ApiResult<RecordFilter> {
        let vmids = match self.vmids.as_deref() {
            None | Some("") => Vec::new(),
            Some(list) => list
                .split(',')
                .map(|id| {
                    id.trim().parse::<EntityId>().map_err(|_| {
                        ApiError::InvalidRequest(format!("invalid vmid {:?}", id.trim()))
                    })
                })
                .collect::<ApiResult<_>>()?,
        };

        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(ApiError::InvalidRequest(
                    "`from` must not be after `to`".to_string(),
                ));
            }
        }

        Ok(RecordFilter {
            vmids,
            from: self.from,
            to: self.to,
            limit: Some(self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)),
        })
    }
}

/// GET /api/v1/data
///
/// Stored records, newest first
pub async fn list_data(
    State(state): State<ApiState>,
    Query(query): Query<DataQuery>,
) -> ApiResult<Json<DataResponse>> {
    let filter = query.into_filter()?;
    let items = state.storage.query_records(filter).await?;
    Ok(Json(DataResponse { items }))
}
