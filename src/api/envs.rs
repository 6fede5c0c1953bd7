//! 环境管理 API
//!
//! 包含 /envs, /envs/:id, /envs/:id/install, /envs/:id/jobs 端点

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::requirements::parse_requirements;
use crate::domain::{InstallJob, VirtualEnvironment};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// 创建环境请求
#[derive(Debug, Deserialize)]
pub struct CreateEnvRequest {
    pub name: String,
    pub python_version: String,
    /// 依赖列表
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// requirements.txt 格式的文本，与 `dependencies` 合并
    #[serde(default)]
    pub requirements: Option<String>,
}

/// 更新依赖请求
#[derive(Debug, Deserialize)]
pub struct UpdateEnvRequest {
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub requirements: Option<String>,
}

/// 环境详情
#[derive(Debug, Serialize)]
pub struct EnvironmentView {
    #[serde(flatten)]
    pub environment: VirtualEnvironment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_job_id: Option<String>,
}

/// 提交任务响应
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub env_id: String,
    pub status: String,
    pub stream_url: String,
}

impl From<&InstallJob> for JobAccepted {
    fn from(job: &InstallJob) -> Self {
        Self {
            job_id: job.id.clone(),
            env_id: job.env_id.clone(),
            status: job.state.as_str().to_string(),
            stream_url: format!("/jobs/{}/logs/stream", job.id),
        }
    }
}

/// 创建环境响应
#[derive(Debug, Serialize)]
pub struct CreateEnvResponse {
    pub environment: VirtualEnvironment,
    pub job: JobAccepted,
}

/// 创建环境管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/envs", get(list_envs).post(create_env))
        .route("/envs/:id", get(get_env).put(update_env).delete(delete_env))
        .route("/envs/:id/install", post(install_env))
        .route("/envs/:id/jobs", get(list_env_jobs))
}

/// 合并依赖列表与 requirements 文本
fn merge_dependencies(
    mut dependencies: Vec<String>,
    requirements: Option<&str>,
) -> ApiResult<Vec<String>> {
    if let Some(text) = requirements {
        dependencies.extend(parse_requirements(text).map_err(ApiError::bad_request)?);
    }
    Ok(dependencies)
}

/// 列出环境
///
/// GET /envs
async fn list_envs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<EnvironmentView>>> {
    let manager = &state.environments;
    let mut views = Vec::new();
    for environment in manager.list_environments().await? {
        let active_job_id = manager.active_job(&environment.id).await;
        views.push(EnvironmentView {
            environment,
            active_job_id,
        });
    }
    Ok(Json(views))
}

/// 创建环境
///
/// POST /envs
async fn create_env(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateEnvRequest>,
) -> ApiResult<(StatusCode, Json<CreateEnvResponse>)> {
    let dependencies = merge_dependencies(request.dependencies, request.requirements.as_deref())?;
    let submission = state
        .environments
        .create(&request.name, &request.python_version, dependencies)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateEnvResponse {
            job: JobAccepted::from(&submission.job),
            environment: submission.environment,
        }),
    ))
}

/// 环境详情
///
/// GET /envs/:id
async fn get_env(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<EnvironmentView>> {
    let environment = state.environments.get_environment(&id).await?;
    let active_job_id = state.environments.active_job(&id).await;
    Ok(Json(EnvironmentView {
        environment,
        active_job_id,
    }))
}

/// 替换依赖并重新安装
///
/// PUT /envs/:id
async fn update_env(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateEnvRequest>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let dependencies = merge_dependencies(request.dependencies, request.requirements.as_deref())?;
    let job = state.environments.update(&id, dependencies).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

/// 删除环境
///
/// DELETE /envs/:id
async fn delete_env(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.environments.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 按当前依赖重新安装
///
/// POST /envs/:id/install
async fn install_env(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let job = state.environments.install(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

/// 环境的任务历史
///
/// GET /envs/:id/jobs
async fn list_env_jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<InstallJob>>> {
    Ok(Json(state.environments.list_jobs(&id).await?))
}
