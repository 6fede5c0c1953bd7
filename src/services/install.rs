//! 任务执行
//!
//! 在后台驱动单个任务：环境创建（`python -m venv`）或依赖安装（`python -m pip install`）。
//! 子进程输出逐行写入任务的日志通道；结束时更新任务与环境状态、释放环境槽位，
//! 并在短暂延迟后关闭日志通道，让在线订阅者先看到结束标记。

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProvisionConfig;
use crate::domain::job::{EXIT_CODE_KILLED, EXIT_CODE_SPAWN_FAILED};
use crate::domain::{
    EnvStatus, InstallJob, JobFailure, JobKind, JobState, LogStream, VirtualEnvironment,
};
use crate::infra::{CommandRunner, CommandSpec, ProcessExit, RuntimeLocator};
use crate::services::mirror::MirrorRegistry;
use crate::state::log_hub::{LogChannel, LogHub};
use crate::state::store::EnvironmentStore;
use crate::state::ActiveJobs;

/// 进程运行结果
#[derive(Debug)]
enum Outcome {
    Exited(ProcessExit),
    SpawnFailed(String),
    Cancelled(Option<i32>),
    TimedOut(i32),
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

/// 任务执行上下文
struct JobContext {
    job_id: String,
    channel: Arc<LogChannel>,
}

impl JobContext {
    /// 写入日志，失败只告警，不中断任务
    async fn log(&self, stream: LogStream, content: &str) {
        if let Err(e) = self.channel.append(stream, content).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to append log line");
        }
    }

    async fn log_stdout(&self, content: &str) {
        self.log(LogStream::Stdout, content).await;
    }

    async fn log_stderr(&self, content: &str) {
        self.log(LogStream::Stderr, content).await;
    }
}

/// 任务执行器
pub struct InstallJobRunner {
    store: Arc<dyn EnvironmentStore>,
    log_hub: Arc<LogHub>,
    active_jobs: Arc<ActiveJobs>,
    mirrors: Arc<MirrorRegistry>,
    runtimes: RuntimeLocator,
    config: ProvisionConfig,
}

impl InstallJobRunner {
    pub fn new(
        store: Arc<dyn EnvironmentStore>,
        log_hub: Arc<LogHub>,
        active_jobs: Arc<ActiveJobs>,
        mirrors: Arc<MirrorRegistry>,
        runtimes: RuntimeLocator,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            store,
            log_hub,
            active_jobs,
            mirrors,
            runtimes,
            config,
        }
    }

    /// 在后台执行已排队的任务
    ///
    /// 调用方已占用环境槽位，`cancel_token` 即槽位上的取消令牌
    pub fn spawn(self: &Arc<Self>, job: InstallJob, cancel_token: CancellationToken) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            match job.kind {
                JobKind::Create => runner.run_create(job, cancel_token).await,
                JobKind::Install => runner.run_install(job, cancel_token).await,
            }
        })
    }

    /// 环境创建任务，成功且声明了依赖时把槽位直接交给安装任务
    async fn run_create(&self, mut job: InstallJob, cancel_token: CancellationToken) {
        let ctx = self.context(&job.id).await;
        let Some(mut env) = self.load_environment(&job.env_id).await else {
            let outcome = Outcome::SpawnFailed(format!("environment {} not found", job.env_id));
            self.complete(&ctx, &mut job, None, outcome).await;
            self.release(&ctx, &job).await;
            return;
        };

        if cancel_token.is_cancelled() {
            self.complete(&ctx, &mut job, Some(&mut env), Outcome::Cancelled(None)).await;
            self.release(&ctx, &job).await;
            return;
        }

        if let Err(e) = job.start(None, None) {
            error!(job_id = %job.id, error = %e, "Cannot start job");
            self.release(&ctx, &job).await;
            return;
        }
        self.persist_job(&job).await;
        info!(job_id = %job.id, env_id = %env.id, version = %env.python_version, "Creating environment");
        ctx.log_stdout(&format!(
            "=== Creating environment '{}' with Python {} ===",
            env.name, env.python_version
        ))
        .await;

        let outcome = match self.create_command(&env).await {
            Ok(spec) => self.drive(&ctx, &spec, &cancel_token).await,
            Err(message) => Outcome::SpawnFailed(message),
        };
        let succeeded = self.complete(&ctx, &mut job, Some(&mut env), outcome).await;

        if !succeeded || job.dependencies.is_empty() {
            self.release(&ctx, &job).await;
            return;
        }

        // 自动安装：槽位不经释放直接移交，期间不会有其他请求插入
        let install_job = InstallJob::new_queued(&env.id, JobKind::Install, job.dependencies.clone());
        let Some(install_token) = self
            .active_jobs
            .hand_over(&env.id, &job.id, &install_job.id)
            .await
        else {
            warn!(job_id = %job.id, env_id = %env.id, "Lost environment slot before auto-install");
            self.schedule_close(ctx.channel.clone());
            return;
        };
        // 通道先于任务记录可见，订阅者总能拿到实时流
        self.log_hub.create(&install_job.id).await;
        if let Err(e) = self.store.save_job(&install_job).await {
            error!(env_id = %env.id, error = %e, "Failed to persist auto-install job");
            self.log_hub.remove(&install_job.id).await;
            self.active_jobs.release(&env.id, &install_job.id).await;
            self.schedule_close(ctx.channel.clone());
            return;
        }
        ctx.log_stdout(&format!("=== Queued dependency installation (job {}) ===", install_job.id))
            .await;
        self.schedule_close(ctx.channel.clone());

        self.run_install(install_job, install_token).await;
    }

    /// 依赖安装任务
    async fn run_install(&self, mut job: InstallJob, cancel_token: CancellationToken) {
        let ctx = self.context(&job.id).await;
        let Some(mut env) = self.load_environment(&job.env_id).await else {
            let outcome = Outcome::SpawnFailed(format!("environment {} not found", job.env_id));
            self.complete(&ctx, &mut job, None, outcome).await;
            self.release(&ctx, &job).await;
            return;
        };

        if cancel_token.is_cancelled() {
            self.complete(&ctx, &mut job, Some(&mut env), Outcome::Cancelled(None)).await;
            self.release(&ctx, &job).await;
            return;
        }

        // 镜像源在启动时固定，之后的切换不影响本任务
        let mirror = match self.mirrors.active().await {
            Ok(mirror) => mirror,
            Err(e) => {
                let outcome = Outcome::SpawnFailed(format!("cannot resolve package index: {}", e));
                self.complete(&ctx, &mut job, Some(&mut env), outcome).await;
                self.release(&ctx, &job).await;
                return;
            }
        };
        let (mirror_id, index_url) = match mirror {
            Some(m) => (Some(m.id), Some(m.url)),
            None => (None, None),
        };

        if let Err(e) = job.start(mirror_id, index_url) {
            error!(job_id = %job.id, error = %e, "Cannot start job");
            self.release(&ctx, &job).await;
            return;
        }
        self.persist_job(&job).await;
        env.set_status(EnvStatus::Installing);
        self.persist_environment(&env).await;

        info!(
            job_id = %job.id,
            env_id = %env.id,
            packages = job.dependencies.len(),
            index_url = ?job.index_url,
            "Installing dependencies"
        );
        ctx.log_stdout(&format!(
            "=== Installing {} package(s) from {} ===",
            job.dependencies.len(),
            job.index_url.as_deref().unwrap_or("default index")
        ))
        .await;

        let outcome = if job.dependencies.is_empty() {
            ctx.log_stdout("No dependencies declared, nothing to install").await;
            Outcome::Exited(ProcessExit::Code(0))
        } else {
            let spec = install_command(&env, &job, self.config.pip_timeout_secs);
            self.drive(&ctx, &spec, &cancel_token).await
        };

        self.complete(&ctx, &mut job, Some(&mut env), outcome).await;
        self.release(&ctx, &job).await;
    }

    /// 运行子进程并把输出写入日志通道，同时响应取消与超时
    async fn drive(
        &self,
        ctx: &JobContext,
        spec: &CommandSpec,
        cancel_token: &CancellationToken,
    ) -> Outcome {
        ctx.log_stdout(&format!("$ {}", spec.display())).await;

        let mut handle = match CommandRunner::spawn(spec) {
            Ok(handle) => handle,
            Err(e) => return Outcome::SpawnFailed(e.to_string()),
        };

        let deadline = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(deadline);

        let output_end = loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break Some(Interrupt::Cancelled),
                _ = &mut deadline => break Some(Interrupt::TimedOut),
                line = handle.next_line() => match line {
                    Some(line) => ctx.log(line.stream, &line.text).await,
                    None => break None,
                },
            }
        };

        let interrupt = match output_end {
            Some(interrupt) => interrupt,
            None => tokio::select! {
                biased;
                _ = cancel_token.cancelled() => Interrupt::Cancelled,
                _ = &mut deadline => Interrupt::TimedOut,
                status = handle.wait() => {
                    return match status {
                        Ok(exit) => Outcome::Exited(exit),
                        Err(e) => Outcome::SpawnFailed(e.to_string()),
                    };
                }
            },
        };

        let exit_code = match handle.terminate(self.config.cancel_grace).await {
            Ok(exit) => exit.code(),
            Err(e) => {
                warn!(job_id = %ctx.job_id, error = %e, "Failed to reap terminated process");
                EXIT_CODE_KILLED
            }
        };
        // 终止前已产生的输出保留在日志中
        for line in handle.drain_buffered() {
            ctx.log(line.stream, &line.text).await;
        }

        match interrupt {
            Interrupt::Cancelled => {
                warn!(job_id = %ctx.job_id, "Job cancelled");
                Outcome::Cancelled(Some(exit_code))
            }
            Interrupt::TimedOut => {
                error!(job_id = %ctx.job_id, timeout = ?self.config.job_timeout, "Job timed out");
                Outcome::TimedOut(exit_code)
            }
        }
    }

    /// 记录结束标记、完成状态转换并同步环境状态
    ///
    /// 返回任务是否成功
    async fn complete(
        &self,
        ctx: &JobContext,
        job: &mut InstallJob,
        env: Option<&mut VirtualEnvironment>,
        outcome: Outcome,
    ) -> bool {
        let label = match job.kind {
            JobKind::Create => "Environment creation",
            JobKind::Install => "Installation",
        };

        let transition = match outcome {
            Outcome::Exited(exit) if exit.success() => {
                ctx.log_stdout(&format!("=== {} completed successfully (exit code: 0) ===", label))
                    .await;
                job.succeed(0)
            }
            Outcome::Exited(exit) => {
                let code = exit.code();
                ctx.log_stderr(&format!("=== {} failed (exit code: {}) ===", label, code))
                    .await;
                job.fail(JobFailure::Exit { code }, Some(code))
            }
            Outcome::SpawnFailed(message) => {
                ctx.log_stderr(&format!("=== Failed to start process: {} ===", message))
                    .await;
                job.fail(JobFailure::Spawn { message }, Some(EXIT_CODE_SPAWN_FAILED))
            }
            Outcome::Cancelled(code) => {
                ctx.log_stderr(&format!("=== {} cancelled ===", label)).await;
                job.cancel(code)
            }
            Outcome::TimedOut(code) => {
                let after_secs = self.config.job_timeout.as_secs();
                ctx.log_stderr(&format!("=== {} timed out after {}s ===", label, after_secs))
                    .await;
                job.fail(JobFailure::Timeout { after_secs }, Some(code))
            }
        };
        if let Err(e) = transition {
            error!(job_id = %job.id, error = %e, "Invalid job transition");
        }
        self.persist_job(job).await;

        let succeeded = job.state == JobState::Succeeded;
        if let Some(env) = env {
            env.set_status(if succeeded { EnvStatus::Ready } else { EnvStatus::Error });
            self.persist_environment(env).await;
        }

        if succeeded {
            info!(job_id = %job.id, kind = job.kind.as_str(), "Job succeeded");
        } else {
            error!(
                job_id = %job.id,
                kind = job.kind.as_str(),
                state = job.state.as_str(),
                exit_code = ?job.exit_code,
                "Job did not succeed"
            );
        }
        succeeded
    }

    /// 构建环境创建命令
    async fn create_command(&self, env: &VirtualEnvironment) -> Result<CommandSpec, String> {
        let interpreter = self
            .runtimes
            .locate(&env.python_version)
            .await
            .ok_or_else(|| format!("Python {} is not available on this host", env.python_version))?;

        if let Some(parent) = env.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
        }

        Ok(CommandSpec::new(interpreter)
            .args(["-m", "venv"])
            .arg(env.path.as_os_str()))
    }

    async fn context(&self, job_id: &str) -> JobContext {
        JobContext {
            job_id: job_id.to_string(),
            channel: self.log_hub.create(job_id).await,
        }
    }

    async fn load_environment(&self, env_id: &str) -> Option<VirtualEnvironment> {
        match self.store.load_environment(env_id).await {
            Ok(env) => env,
            Err(e) => {
                error!(env_id = %env_id, error = %e, "Failed to load environment");
                None
            }
        }
    }

    async fn persist_job(&self, job: &InstallJob) {
        if let Err(e) = self.store.save_job(job).await {
            error!(job_id = %job.id, state = job.state.as_str(), error = %e, "Failed to persist job");
        }
    }

    async fn persist_environment(&self, env: &VirtualEnvironment) {
        if let Err(e) = self.store.save_environment(env).await {
            error!(env_id = %env.id, status = env.status.as_str(), error = %e, "Failed to persist environment");
        }
    }

    /// 释放槽位并延迟关闭日志通道
    async fn release(&self, ctx: &JobContext, job: &InstallJob) {
        self.active_jobs.release(&job.env_id, &job.id).await;
        self.schedule_close(ctx.channel.clone());
    }

    fn schedule_close(&self, channel: Arc<LogChannel>) {
        let grace = self.config.log_close_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            channel.close().await;
        });
    }
}

/// 构建依赖安装命令
///
/// `<env>/bin/python -m pip install [--index-url URL] --timeout N --no-cache-dir <deps...>`
pub fn install_command(env: &VirtualEnvironment, job: &InstallJob, pip_timeout_secs: u64) -> CommandSpec {
    let mut spec = CommandSpec::new(env.python_path()).args(["-m", "pip", "install"]);
    if let Some(url) = &job.index_url {
        spec = spec.arg("--index-url").arg(url.as_str());
    }
    spec.arg("--timeout")
        .arg(pip_timeout_secs.to_string())
        .arg("--no-cache-dir")
        .args(job.dependencies.iter().map(String::as_str))
        .current_dir(&env.path)
        .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
        .env("PYTHONUNBUFFERED", "1")
}
