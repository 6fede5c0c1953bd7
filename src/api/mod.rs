//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod envs;
pub mod health;
pub mod jobs;
pub mod mirrors;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & runtimes
        .merge(health::router())
        // Environments
        .merge(envs::router())
        // Jobs & logs
        .merge(jobs::router())
        // Mirrors
        .merge(mirrors::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
