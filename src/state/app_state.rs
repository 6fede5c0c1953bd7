//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

use crate::config::env::EnvConfig;
use crate::services::{EnvironmentManager, MirrorRegistry};

/// 应用状态
pub struct AppState {
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
    /// 环境与任务管理
    pub environments: Arc<EnvironmentManager>,
    /// 镜像源管理
    pub mirrors: Arc<MirrorRegistry>,
}

impl AppState {
    pub fn new(
        config: EnvConfig,
        environments: Arc<EnvironmentManager>,
        mirrors: Arc<MirrorRegistry>,
    ) -> Self {
        Self {
            config,
            started_at: Utc::now(),
            environments,
            mirrors,
        }
    }

    /// 运行时长（秒）
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
