//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 服务监听端口
    pub port: u16,
    /// 持久化数据目录
    pub data_dir: PathBuf,
    /// 环境创建与安装配置
    pub provision: ProvisionConfig,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        // Port - 支持通用名称兼容
        let port = load_with_fallback("VENV_AGENT_PORT", "PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(constants::DEFAULT_PORT);

        let data_dir = env::var("VENV_AGENT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        Self {
            port,
            data_dir,
            provision: ProvisionConfig::from_env(),
        }
    }
}

/// 环境创建与依赖安装配置
#[derive(Clone, Debug)]
pub struct ProvisionConfig {
    /// 环境目录的父目录
    pub env_root: PathBuf,
    /// 托管运行时目录（`python-<version>/bin/python3`）
    pub python_versions_root: PathBuf,
    /// 是否在 PATH 中查找 `python<major>.<minor>`
    pub search_path: bool,
    /// 任务最长运行时间，超时自动取消并标记失败
    pub job_timeout: Duration,
    /// SIGTERM 到 SIGKILL 的宽限期
    pub cancel_grace: Duration,
    /// 任务结束到关闭日志通道的间隔
    pub log_close_grace: Duration,
    /// 传给 pip 的 `--timeout`
    pub pip_timeout_secs: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            env_root: PathBuf::from("./envs"),
            python_versions_root: PathBuf::from("./python_versions"),
            search_path: true,
            job_timeout: Duration::from_secs(constants::JOB_TIMEOUT_SECS),
            cancel_grace: Duration::from_secs(constants::CANCEL_GRACE_SECS),
            log_close_grace: Duration::from_millis(constants::LOG_CLOSE_GRACE_MS),
            pip_timeout_secs: constants::PIP_TIMEOUT_SECS,
        }
    }
}

impl ProvisionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let env_root = env::var("ENV_ROOT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.env_root);
        let python_versions_root = env::var("PYTHON_VERSIONS_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.python_versions_root);

        let search_path = env::var("RUNTIME_SEARCH_PATH")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.search_path);

        let job_timeout = Duration::from_secs(parse_or("JOB_TIMEOUT_SECS", constants::JOB_TIMEOUT_SECS));
        let cancel_grace =
            Duration::from_secs(parse_or("CANCEL_GRACE_SECS", constants::CANCEL_GRACE_SECS));
        let log_close_grace =
            Duration::from_millis(parse_or("LOG_CLOSE_GRACE_MS", constants::LOG_CLOSE_GRACE_MS));
        let pip_timeout_secs = parse_or("PIP_TIMEOUT_SECS", constants::PIP_TIMEOUT_SECS);

        Self {
            env_root,
            python_versions_root,
            search_path,
            job_timeout,
            cancel_grace,
            log_close_grace,
            pip_timeout_secs,
        }
    }
}

/// 加载环境变量，支持备用名称
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 解析数值型环境变量，格式错误时告警并使用默认值
fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = %default, "Invalid numeric value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// 常量
pub mod constants {
    /// 默认监听端口
    pub const DEFAULT_PORT: u16 = 5001;

    /// 任务超时（秒）
    pub const JOB_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 取消宽限期（秒）
    pub const CANCEL_GRACE_SECS: u64 = 5;

    /// 关闭日志通道前的等待（毫秒）
    pub const LOG_CLOSE_GRACE_MS: u64 = 500;

    /// pip 网络超时（秒）
    pub const PIP_TIMEOUT_SECS: u64 = 30;

    /// 已结束日志通道的保留时长（小时）
    pub const LOG_RETENTION_HOURS: i64 = 1;

    /// 清理任务间隔（秒）
    pub const JANITOR_INTERVAL_SECS: u64 = 300;

    /// 环境名称最大长度
    pub const MAX_ENV_NAME_LEN: usize = 64;

    /// SSE 心跳间隔（秒）
    pub const SSE_KEEPALIVE_SECS: u64 = 15;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
