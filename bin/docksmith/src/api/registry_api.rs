use axum::extract::Path;

use crate::{
  api::{ApiResult, respond},
  state::app_state,
};

/// All tags the registry offers for an image reference.
pub async fn tags(
  Path(image_ref): Path<String>,
) -> ApiResult<Vec<String>> {
  let state = app_state();
  respond(state.registry.list_tags(&image_ref).await)
}
