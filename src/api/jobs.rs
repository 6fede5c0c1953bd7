//! 任务与日志 API
//!
//! 包含 /jobs/:id, /jobs/:id/cancel, /jobs/:id/logs, /jobs/:id/logs/stream 端点

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tracing::warn;

use crate::config::env::constants::SSE_KEEPALIVE_SECS;
use crate::domain::{InstallJob, LogLine};
use crate::error::ApiResult;
use crate::state::AppState;

/// 日志查询参数
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    /// 起始序号（含）
    #[serde(default)]
    pub from_seq: Option<u64>,
}

/// 历史日志响应
#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub job_id: String,
    pub state: String,
    pub lines: Vec<LogLine>,
    /// 续传时使用的下一个序号
    pub next_seq: u64,
}

/// 创建任务路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/logs", get(get_logs))
        .route("/jobs/:id/logs/stream", get(stream_logs))
}

/// 任务详情
///
/// GET /jobs/:id
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstallJob>> {
    Ok(Json(state.environments.get_job(&id).await?))
}

/// 取消任务
///
/// POST /jobs/:id/cancel
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.environments.cancel_job(&id).await?;
    Ok(Json(serde_json::json!({
        "job_id": job.id,
        "cancel_requested": true,
    })))
}

/// 历史日志（不等待新数据）
///
/// GET /jobs/:id/logs?from_seq=N
async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let from_seq = query.from_seq.unwrap_or(0);
    let job = state.environments.get_job(&id).await?;
    let lines = state.environments.history(&id, from_seq).await?;
    let next_seq = lines.last().map_or(from_seq, |l| l.seq + 1);

    Ok(Json(LogsResponse {
        job_id: job.id,
        state: job.state.as_str().to_string(),
        lines,
        next_seq,
    }))
}

/// 起始序号：`Last-Event-ID` 优先于查询参数
fn resume_from(headers: &HeaderMap, query: &LogQuery) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|last| last + 1)
        .or(query.from_seq)
        .unwrap_or(0)
}

/// 单行日志对应的 SSE 事件，事件 id 为序号
fn line_event(line: &LogLine) -> Result<Event, serde_json::Error> {
    let json = serde_json::to_string(line)?;
    Ok(Event::default().id(line.seq.to_string()).data(json))
}

/// 流式日志
///
/// GET /jobs/:id/logs/stream?from_seq=N
///
/// 每行一个事件，事件 id 为序号；通道关闭后发送 `complete` 事件
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let from_seq = resume_from(&headers, &query);
    let mut logs = state.environments.get_logs(&id, from_seq).await?;

    let state_clone = state.clone();
    let job_id = id.clone();

    let stream = async_stream::stream! {
        while let Some(item) = logs.next().await {
            match item {
                Ok(line) => match line_event(&line) {
                    Ok(event) => {
                        yield Ok(event);
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, seq = line.seq, error = %e, "Skipping unserializable log line");
                    }
                },
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Log stream aborted");
                    yield Ok(Event::default().event("error").data(e.to_string()));
                    return;
                }
            }
        }

        // 发送结束事件
        if let Ok(job) = state_clone.environments.get_job(&job_id).await {
            yield Ok(Event::default().event("complete").data(
                serde_json::json!({
                    "state": job.state.as_str(),
                    "exit_code": job.exit_code,
                }).to_string()
            ));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
            .text("keepalive"),
    ))
}
