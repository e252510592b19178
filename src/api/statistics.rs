//! `GET /statistics/flow?userId=` — the hourly rollup history the
//! scheduler writes (§4.7). Owner-or-admin, same predicate as forward
//! mutation endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::{ok, Principal};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FlowQuery {
    #[serde(rename = "userId")]
    pub user_id: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    48
}

pub async fn flow(
    principal: Principal,
    State(state): State<AppState>,
    Query(q): Query<FlowQuery>,
) -> AppResult<Json<serde_json::Value>> {
    if !principal.owns_or_admin(q.user_id) {
        return Err(AppError::Forbidden);
    }
    let rows = state.store.list_recent_statistics(q.user_id, q.limit).await?;
    Ok(ok(rows))
}
