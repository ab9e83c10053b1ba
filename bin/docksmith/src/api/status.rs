use axum::extract::{Path, Query};
use docksmith_client::{
  entities::{
    container::Container,
    update::{CheckHistoryEntry, StatusView},
  },
  error::CoreError,
};
use serde::Deserialize;

use crate::{
  api::{ApiResult, respond, respond_any},
  checker,
  state::app_state,
};

/// Last cached check result.
pub async fn get_status() -> ApiResult<StatusView> {
  let view = app_state().status.load_full();
  respond(Ok((*view).clone()))
}

/// Run a fresh cycle and return its result. Concurrent calls
/// serialize behind the cycle lock.
pub async fn check_now() -> ApiResult<StatusView> {
  let state = app_state();
  respond(
    checker::run_cycle(state)
      .await
      .map(|view| (*view).clone())
      .map_err(|e| CoreError::External(format!("{e:#}"))),
  )
}

/// Fire-and-forget trigger; coalesced with any running cycle.
pub async fn trigger_check() -> ApiResult<&'static str> {
  checker::trigger(app_state());
  respond(Ok("check triggered"))
}

pub async fn recheck_container(
  Path(name): Path<String>,
) -> ApiResult<Container> {
  respond(checker::check_one(app_state(), &name).await)
}

#[derive(Deserialize)]
pub struct HistoryQuery {
  container: Option<String>,
  limit: Option<i64>,
}

pub async fn check_history(
  Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<CheckHistoryEntry>> {
  let state = app_state();
  let result = match state.db() {
    Ok(db) => {
      db.list_check_history(
        query.container.as_deref(),
        query.limit.unwrap_or(100),
      )
      .await
    }
    Err(e) => return respond(Err(e)),
  };
  respond_any(result)
}
