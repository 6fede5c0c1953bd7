//! 镜像源管理 API
//!
//! 包含 /mirrors, /mirrors/active, /mirrors/:id, /mirrors/:id/activate 端点

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::domain::{MirrorSource, MirrorUpdate};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// 新增镜像源请求
#[derive(Debug, Deserialize)]
pub struct CreateMirrorRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// 创建镜像源路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/mirrors", get(list_mirrors).post(create_mirror))
        .route("/mirrors/active", get(active_mirror))
        .route("/mirrors/:id", get(get_mirror).put(update_mirror).delete(delete_mirror))
        .route("/mirrors/:id/activate", post(activate_mirror))
}

async fn list_mirrors(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<MirrorSource>>> {
    Ok(Json(state.mirrors.list().await?))
}

async fn create_mirror(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateMirrorRequest>,
) -> ApiResult<(StatusCode, Json<MirrorSource>)> {
    let mirror = state
        .mirrors
        .create(&request.name, &request.url, request.description)
        .await?;
    Ok((StatusCode::CREATED, Json(mirror)))
}

/// 当前激活的镜像源
///
/// GET /mirrors/active
async fn active_mirror(State(state): State<Arc<AppState>>) -> ApiResult<Json<MirrorSource>> {
    state
        .mirrors
        .active()
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Active mirror"))
}

async fn get_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<MirrorSource>> {
    Ok(Json(state.mirrors.get(&id).await?))
}

async fn update_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<MirrorUpdate>,
) -> ApiResult<Json<MirrorSource>> {
    Ok(Json(state.mirrors.update(&id, update).await?))
}

/// 删除镜像源（激活中的不可删除）
///
/// DELETE /mirrors/:id
async fn delete_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.mirrors.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 切换激活的镜像源
///
/// POST /mirrors/:id/activate
async fn activate_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<MirrorSource>> {
    Ok(Json(state.mirrors.set_active(&id).await?))
}
