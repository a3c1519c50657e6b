use axum::extract::{Path, Query, State};
use axum::Json;
use cbc_core::workflow::Run;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    /// pending, running, succeeded or failed
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/runs: Newest first.
pub async fn list_runs(
    State(app): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, AppError> {
    let runs = app.blocking(|engine| engine.db().list_all()).await?;
    let runs = runs
        .into_iter()
        .filter(|r| query.status.as_deref().is_none_or(|s| r.status.label() == s))
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();
    Ok(Json(runs))
}

/// GET /api/runs/{id}: Full id or unique prefix.
pub async fn get_run(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    let run = app.blocking(move |engine| engine.db().find(&id)).await?;
    Ok(Json(run))
}
