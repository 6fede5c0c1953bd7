//! 安装任务领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 进程启动失败时记录的退出码
pub const EXIT_CODE_SPAWN_FAILED: i32 = -1;

/// 进程被取消/强制终止时记录的退出码
pub const EXIT_CODE_KILLED: i32 = -2;

/// 任务状态
///
/// `queued → running → {succeeded, failed, cancelled}`，终态不可变
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// 是否占用环境的活跃任务槽位
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    /// 状态机是否允许该转换
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running) => true,
            // 排队期间被取消或启动前失败（如存储不可用）
            (JobState::Queued, JobState::Cancelled | JobState::Failed) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// 任务类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// 创建虚拟环境（`python -m venv`）
    Create,
    /// 安装依赖（`python -m pip install`）
    Install,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Create => "create",
            JobKind::Install => "install",
        }
    }
}

/// 任务失败原因
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    /// 解释器或包管理器无法启动
    Spawn { message: String },
    /// 进程以非零退出码结束
    Exit { code: i32 },
    /// 超过最大运行时长被自动取消
    Timeout { after_secs: u64 },
    /// 代理重启时任务仍在运行
    Interrupted,
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::Spawn { message } => write!(f, "failed to start process: {}", message),
            JobFailure::Exit { code } => write!(f, "process exited with code {}", code),
            JobFailure::Timeout { after_secs } => write!(f, "timed out after {}s", after_secs),
            JobFailure::Interrupted => write!(f, "interrupted by agent restart"),
        }
    }
}

/// 非法状态转换
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id}: illegal transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub job_id: String,
    pub from: JobState,
    pub to: JobState,
}

/// 任务信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallJob {
    pub id: String,
    pub env_id: String,
    pub kind: JobKind,
    /// 本次任务要安装的依赖（提交时的快照）
    pub dependencies: Vec<String>,
    /// 启动时选定的镜像源 ID
    pub mirror_id: Option<String>,
    /// 启动时解析出的索引 URL（之后镜像源变化不影响本任务）
    pub index_url: Option<String>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
}

impl InstallJob {
    /// 创建排队中的任务
    pub fn new_queued(env_id: &str, kind: JobKind, dependencies: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            env_id: env_id.to_string(),
            kind,
            dependencies,
            mirror_id: None,
            index_url: None,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure: None,
        }
    }

    fn transition(&mut self, to: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                job_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// 进入运行状态，同时固定镜像源快照
    pub fn start(
        &mut self,
        mirror_id: Option<String>,
        index_url: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobState::Running)?;
        self.started_at = Some(Utc::now());
        self.mirror_id = mirror_id;
        self.index_url = index_url;
        Ok(())
    }

    /// 成功结束
    pub fn succeed(&mut self, exit_code: i32) -> Result<(), InvalidTransition> {
        self.complete(JobState::Succeeded, Some(exit_code), None)
    }

    /// 失败结束
    pub fn fail(&mut self, failure: JobFailure, exit_code: Option<i32>) -> Result<(), InvalidTransition> {
        self.complete(JobState::Failed, exit_code, Some(failure))
    }

    /// 被取消
    pub fn cancel(&mut self, exit_code: Option<i32>) -> Result<(), InvalidTransition> {
        self.complete(JobState::Cancelled, exit_code, None)
    }

    fn complete(
        &mut self,
        state: JobState,
        exit_code: Option<i32>,
        failure: Option<JobFailure>,
    ) -> Result<(), InvalidTransition> {
        self.transition(state)?;
        self.finished_at = Some(Utc::now());
        self.exit_code = exit_code;
        self.failure = failure;
        Ok(())
    }
}
