//! 健康检查和运行时 API
//!
//! 包含 /health, /python_versions 端点

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::error::ApiResult;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    environments: usize,
    log_channels: usize,
    active_log_channels: usize,
}

/// 可用运行时响应
#[derive(Debug, Serialize)]
struct PythonVersionsResponse {
    versions: Vec<String>,
    root: String,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/python_versions", get(list_python_versions))
}

/// 健康检查 - 返回状态、版本、运行时间等信息
///
/// GET /health
async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Json<HealthResponse>> {
    let environments = state.environments.list_environments().await?.len();
    let log_hub = state.environments.log_hub();

    Ok(Json(HealthResponse {
        status: "ok",
        service: "venv-agent",
        version: VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.uptime_secs(),
        environments,
        log_channels: log_hub.count().await,
        active_log_channels: log_hub.active_count().await,
    }))
}

/// 托管目录中可用的 Python 版本
///
/// GET /python_versions
async fn list_python_versions(State(state): State<Arc<AppState>>) -> Json<PythonVersionsResponse> {
    let runtimes = state.environments.runtimes();
    Json(PythonVersionsResponse {
        versions: runtimes.available_versions().await,
        root: runtimes.versions_root().display().to_string(),
    })
}
