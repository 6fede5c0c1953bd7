//! Venv Agent - Python 虚拟环境供应代理
//!
//! 按需创建隔离的 Python 环境，以后台任务安装依赖，
//! 并通过 HTTP/SSE 实时推送安装日志

pub mod error;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use config::env::constants::{JANITOR_INTERVAL_SECS, LOG_RETENTION_HOURS, VERSION};
use config::EnvConfig;
use services::{EnvironmentManager, MirrorRegistry};
use state::app_state::{get_shutdown_token, trigger_shutdown};
use state::{AppState, EnvironmentStore, FileStore, LogHub, MemoryStore};

/// 命令行覆盖的运行参数
#[derive(Debug, Default, Clone)]
pub struct RuntimeConfig {
    /// 覆盖监听端口
    pub port_override: Option<u16>,
    /// 使用内存存储（重启后数据丢失）
    pub in_memory: bool,
}

/// 初始化存储与服务并运行 HTTP 服务，直到收到 Ctrl-C
pub async fn run(runtime: RuntimeConfig) -> anyhow::Result<()> {
    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }

    info!(
        version = VERSION,
        port = config.port,
        env_root = %config.provision.env_root.display(),
        python_versions_root = %config.provision.python_versions_root.display(),
        "Starting venv agent"
    );

    let store: Arc<dyn EnvironmentStore> = if runtime.in_memory {
        warn!("Using in-memory store, state will not survive restart");
        Arc::new(MemoryStore::new())
    } else {
        let store = FileStore::open(&config.data_dir)
            .await
            .with_context(|| format!("failed to open data dir {}", config.data_dir.display()))?;
        info!(data_dir = %config.data_dir.display(), "File store opened");
        Arc::new(store)
    };

    let mirrors = Arc::new(MirrorRegistry::new(store.clone()));
    mirrors.seed_defaults().await?;

    let environments = Arc::new(EnvironmentManager::new(
        store,
        mirrors.clone(),
        config.provision.clone(),
    ));

    let recovered = environments.recover_interrupted().await?;
    if recovered > 0 {
        warn!(count = recovered, "Marked jobs interrupted by previous shutdown");
    }

    spawn_log_janitor(environments.log_hub().clone());

    let port = config.port;
    let state = Arc::new(AppState::new(config, environments.clone(), mirrors));
    let app = api::router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let cancelled = environments.shutdown().await;
    info!(cancelled_jobs = cancelled, "Venv agent stopped");
    Ok(())
}

/// 等待 Ctrl-C 并触发全局 shutdown
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
    trigger_shutdown();
}

/// 定期清理已关闭且过期的日志通道
fn spawn_log_janitor(log_hub: Arc<LogHub>) {
    let shutdown = get_shutdown_token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(JANITOR_INTERVAL_SECS));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let removed = log_hub.cleanup_expired(LOG_RETENTION_HOURS).await;
                    if removed > 0 {
                        info!(removed, "Cleaned up expired log channels");
                    }
                }
            }
        }
    });
}
