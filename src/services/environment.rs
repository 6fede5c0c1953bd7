//! 环境管理
//!
//! 对外的统一入口：创建/更新/删除环境，提交与取消任务，查询任务与日志。
//! 校验与冲突在请求时同步返回；任务本身的失败只体现在任务状态和日志中。

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::env::constants::MAX_ENV_NAME_LEN;
use crate::config::ProvisionConfig;
use crate::domain::requirements::validate_requirements;
use crate::domain::{
    EnvStatus, InstallJob, JobFailure, JobKind, LogLine, LogStream, VirtualEnvironment,
};
use crate::error::{CoreError, CoreResult};
use crate::infra::RuntimeLocator;
use crate::services::install::InstallJobRunner;
use crate::services::mirror::MirrorRegistry;
use crate::state::job_slots::DELETE_HOLDER;
use crate::state::{ActiveJobs, EnvironmentStore, LogHub, LogSubscription};

/// 提交结果：环境及为其排队的任务
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub environment: VirtualEnvironment,
    pub job: InstallJob,
}

/// 环境管理器
pub struct EnvironmentManager {
    store: Arc<dyn EnvironmentStore>,
    log_hub: Arc<LogHub>,
    active_jobs: Arc<ActiveJobs>,
    runtimes: RuntimeLocator,
    runner: Arc<InstallJobRunner>,
    config: ProvisionConfig,
    /// 名称唯一性检查与写入串行化
    create_lock: Mutex<()>,
}

impl EnvironmentManager {
    pub fn new(
        store: Arc<dyn EnvironmentStore>,
        mirrors: Arc<MirrorRegistry>,
        config: ProvisionConfig,
    ) -> Self {
        let log_hub = Arc::new(LogHub::new(store.clone()));
        let active_jobs = Arc::new(ActiveJobs::new());
        let runtimes = RuntimeLocator::new(config.python_versions_root.clone(), config.search_path);
        let runner = Arc::new(InstallJobRunner::new(
            store.clone(),
            log_hub.clone(),
            active_jobs.clone(),
            mirrors,
            runtimes.clone(),
            config.clone(),
        ));

        Self {
            store,
            log_hub,
            active_jobs,
            runtimes,
            runner,
            config,
            create_lock: Mutex::new(()),
        }
    }

    pub fn log_hub(&self) -> &Arc<LogHub> {
        &self.log_hub
    }

    pub fn runtimes(&self) -> &RuntimeLocator {
        &self.runtimes
    }

    /// 登记新环境并在后台执行创建任务
    ///
    /// 创建成功且声明了依赖时自动开始安装
    pub async fn create(
        &self,
        name: &str,
        python_version: &str,
        dependencies: Vec<String>,
    ) -> CoreResult<Submission> {
        let name = validate_env_name(name)?;
        let dependencies = validate_requirements(&dependencies).map_err(CoreError::Validation)?;
        let python_version = python_version.trim();
        if self.runtimes.locate(python_version).await.is_none() {
            return Err(CoreError::validation(format!(
                "Python version '{}' is not available",
                python_version
            )));
        }

        let _guard = self.create_lock.lock().await;
        let existing = self.store.list_environments().await?;
        if existing.iter().any(|e| e.name == name) {
            return Err(CoreError::validation(format!("Environment '{}' already exists", name)));
        }

        let env = VirtualEnvironment::new(&name, python_version, dependencies.clone(), &self.config.env_root);
        let job = InstallJob::new_queued(&env.id, JobKind::Create, dependencies);
        let cancel_token = self
            .active_jobs
            .try_acquire(&env.id, &job.id)
            .await
            .map_err(|active| busy(&env, &active))?;

        self.log_hub.create(&job.id).await;
        if let Err(e) = self.persist_creation(&env, &job).await {
            self.log_hub.remove(&job.id).await;
            self.active_jobs.release(&env.id, &job.id).await;
            return Err(e);
        }

        self.runner.spawn(job.clone(), cancel_token);

        info!(env_id = %env.id, name = %env.name, version = %env.python_version, job_id = %job.id, "Environment registered");
        Ok(Submission { environment: env, job })
    }

    /// 替换依赖列表并提交安装任务
    pub async fn update(&self, id: &str, dependencies: Vec<String>) -> CoreResult<InstallJob> {
        let dependencies = validate_requirements(&dependencies).map_err(CoreError::Validation)?;
        let env = self.get_environment(id).await?;
        self.submit_install(env, Some(dependencies)).await
    }

    /// 按当前依赖列表重新安装（失败后重试）
    pub async fn install(&self, id: &str) -> CoreResult<InstallJob> {
        let env = self.get_environment(id).await?;
        self.submit_install(env, None).await
    }

    /// 删除环境目录和记录
    ///
    /// 目录删除失败时恢复记录并返回错误
    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let env = self.get_environment(id).await?;
        if let Err(active) = self.active_jobs.try_acquire(id, DELETE_HOLDER).await {
            return Err(busy(&env, &active));
        }

        let result = self.remove_environment(&env).await;
        self.active_jobs.release(id, DELETE_HOLDER).await;
        result
    }

    pub async fn get_environment(&self, id: &str) -> CoreResult<VirtualEnvironment> {
        self.store
            .load_environment(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Environment '{}'", id)))
    }

    pub async fn list_environments(&self) -> CoreResult<Vec<VirtualEnvironment>> {
        Ok(self.store.list_environments().await?)
    }

    /// 环境当前占用槽位的任务
    pub async fn active_job(&self, env_id: &str) -> Option<String> {
        self.active_jobs
            .active_job(env_id)
            .await
            .filter(|job_id| job_id != DELETE_HOLDER)
    }

    pub async fn get_job(&self, job_id: &str) -> CoreResult<InstallJob> {
        self.store
            .load_job(job_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Job '{}'", job_id)))
    }

    /// 环境的任务列表，最新的在前
    pub async fn list_jobs(&self, env_id: &str) -> CoreResult<Vec<InstallJob>> {
        self.get_environment(env_id).await?;
        Ok(self.store.list_jobs(Some(env_id)).await?)
    }

    /// 请求取消任务；任务随后转为 `cancelled`
    pub async fn cancel_job(&self, job_id: &str) -> CoreResult<InstallJob> {
        let job = self.get_job(job_id).await?;
        if job.state.is_terminal() {
            return Err(CoreError::conflict(format!(
                "Job '{}' already finished ({})",
                job_id,
                job.state.as_str()
            )));
        }
        if !self.active_jobs.cancel(job_id).await {
            return Err(CoreError::conflict(format!("Job '{}' is not running", job_id)));
        }

        info!(job_id = %job_id, env_id = %job.env_id, "Cancellation requested");
        Ok(job)
    }

    /// 订阅任务日志：先回放历史再持续推送，通道关闭后结束
    pub async fn get_logs(&self, job_id: &str, from_seq: u64) -> CoreResult<LogSubscription> {
        self.get_job(job_id).await?;
        Ok(self.log_hub.subscribe(job_id, from_seq).await)
    }

    /// 截至当前的历史日志（不等待）
    pub async fn history(&self, job_id: &str, from_seq: u64) -> CoreResult<Vec<LogLine>> {
        self.get_job(job_id).await?;
        Ok(self.store.load_log_lines(job_id, from_seq).await?)
    }

    /// 启动时处理上次进程遗留的未完成任务
    ///
    /// 任务标记为失败（Interrupted），所属环境置为 error
    pub async fn recover_interrupted(&self) -> CoreResult<usize> {
        let stale: Vec<_> = self
            .store
            .list_jobs(None)
            .await?
            .into_iter()
            .filter(|job| job.state.is_active())
            .collect();

        for mut job in stale.iter().cloned() {
            let channel = self.log_hub.reopen(&job.id).await?;
            if let Err(e) = channel
                .append(LogStream::Stderr, "=== Job interrupted by agent restart ===")
                .await
            {
                warn!(job_id = %job.id, error = %e, "Failed to append recovery marker");
            }
            if let Err(e) = job.fail(JobFailure::Interrupted, None) {
                error!(job_id = %job.id, error = %e, "Invalid job transition");
            }
            self.store.save_job(&job).await?;

            if let Some(mut env) = self.store.load_environment(&job.env_id).await? {
                env.set_status(EnvStatus::Error);
                self.store.save_environment(&env).await?;
            }
            channel.close().await;

            warn!(job_id = %job.id, env_id = %job.env_id, "Marked interrupted job as failed");
        }
        Ok(stale.len())
    }

    /// 取消所有运行中的任务
    pub async fn shutdown(&self) -> usize {
        self.active_jobs.cancel_all().await
    }

    async fn submit_install(
        &self,
        mut env: VirtualEnvironment,
        dependencies: Option<Vec<String>>,
    ) -> CoreResult<InstallJob> {
        let requested = dependencies.clone().unwrap_or_else(|| env.dependencies.clone());
        let job = InstallJob::new_queued(&env.id, JobKind::Install, requested);
        let cancel_token = self
            .active_jobs
            .try_acquire(&env.id, &job.id)
            .await
            .map_err(|active| busy(&env, &active))?;

        self.log_hub.create(&job.id).await;
        if let Err(e) = self.persist_install(&mut env, &job, dependencies).await {
            self.log_hub.remove(&job.id).await;
            self.active_jobs.release(&env.id, &job.id).await;
            return Err(e);
        }

        self.runner.spawn(job.clone(), cancel_token);

        info!(env_id = %env.id, job_id = %job.id, packages = job.dependencies.len(), "Install job submitted");
        Ok(job)
    }

    async fn persist_creation(&self, env: &VirtualEnvironment, job: &InstallJob) -> CoreResult<()> {
        self.store.save_environment(env).await?;
        if let Err(e) = self.store.save_job(job).await {
            if let Err(cleanup) = self.store.delete_environment(&env.id).await {
                error!(env_id = %env.id, error = %cleanup, "Failed to discard environment record");
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn persist_install(
        &self,
        env: &mut VirtualEnvironment,
        job: &InstallJob,
        dependencies: Option<Vec<String>>,
    ) -> CoreResult<()> {
        let initialized = tokio::fs::try_exists(env.python_path()).await.unwrap_or(false);
        if !initialized {
            return Err(CoreError::validation(format!(
                "Environment '{}' has not been created successfully",
                env.name
            )));
        }

        if let Some(dependencies) = dependencies {
            env.dependencies = dependencies;
            env.updated_at = chrono::Utc::now();
            self.store.save_environment(env).await?;
        }
        self.store.save_job(job).await?;
        Ok(())
    }

    async fn remove_environment(&self, env: &VirtualEnvironment) -> CoreResult<()> {
        self.store.delete_environment(&env.id).await?;

        match tokio::fs::remove_dir_all(&env.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                if let Err(restore) = self.store.save_environment(env).await {
                    error!(env_id = %env.id, error = %restore, "Failed to restore environment record");
                }
                return Err(CoreError::Filesystem(format!(
                    "failed to remove {}: {}",
                    env.path.display(),
                    e
                )));
            }
        }

        // 任务记录保留，日志随环境删除
        for job in self.store.list_jobs(Some(&env.id)).await? {
            self.log_hub.remove(&job.id).await;
            if let Err(e) = self.store.delete_logs(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to delete job logs");
            }
        }

        info!(env_id = %env.id, name = %env.name, path = %env.path.display(), "Environment deleted");
        Ok(())
    }
}

fn busy(env: &VirtualEnvironment, active: &str) -> CoreError {
    if active == DELETE_HOLDER {
        CoreError::conflict(format!("Environment '{}' is being deleted", env.name))
    } else {
        CoreError::conflict(format!(
            "Environment '{}' already has an active job ({})",
            env.name, active
        ))
    }
}

fn validate_env_name(name: &str) -> CoreResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::validation("Environment name must not be empty"));
    }
    if name.len() > MAX_ENV_NAME_LEN {
        return Err(CoreError::validation(format!(
            "Environment name exceeds {} characters",
            MAX_ENV_NAME_LEN
        )));
    }
    let valid = !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(CoreError::validation(format!(
            "Environment name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(name.to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{JobState, MirrorSource};
    use crate::services::testing::{install_fake_runtime, install_runtime_script};
    use crate::state::{MemoryStore, StoreResult};
    use futures::StreamExt;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const VERSION: &str = "3.9.21";
    const MIRROR_URL: &str = "https://mirror.example/simple";

    struct Harness {
        _dir: TempDir,
        store: Arc<dyn EnvironmentStore>,
        mirrors: Arc<MirrorRegistry>,
        manager: EnvironmentManager,
    }

    async fn harness_with(adjust: impl FnOnce(&mut ProvisionConfig)) -> Harness {
        harness_on(Arc::new(MemoryStore::new()), adjust).await
    }

    async fn harness_on(
        store: Arc<dyn EnvironmentStore>,
        adjust: impl FnOnce(&mut ProvisionConfig),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let versions_root = dir.path().join("python_versions");
        install_fake_runtime(&versions_root, VERSION);

        let mut config = ProvisionConfig {
            env_root: dir.path().join("envs"),
            python_versions_root: versions_root,
            search_path: false,
            job_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(2),
            log_close_grace: Duration::from_millis(10),
            pip_timeout_secs: 30,
        };
        adjust(&mut config);

        let mirrors = Arc::new(MirrorRegistry::new(store.clone()));
        mirrors.create("test", MIRROR_URL, None).await.unwrap();
        let manager = EnvironmentManager::new(store.clone(), mirrors.clone(), config);

        Harness {
            _dir: dir,
            store,
            mirrors,
            manager,
        }
    }

    async fn harness() -> Harness {
        harness_with(|_| {}).await
    }

    async fn wait_idle(manager: &EnvironmentManager, env_id: &str) {
        tokio::time::timeout(Duration::from_secs(20), async {
            while manager.active_job(env_id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("environment did not become idle");
    }

    /// 创建一个无依赖的就绪环境
    async fn ready_env(h: &Harness, name: &str) -> VirtualEnvironment {
        let submission = h.manager.create(name, VERSION, vec![]).await.unwrap();
        wait_idle(&h.manager, &submission.environment.id).await;
        let env = h.manager.get_environment(&submission.environment.id).await.unwrap();
        assert_eq!(env.status, EnvStatus::Ready);
        env
    }

    /// 等待日志中出现指定内容
    async fn wait_for_line(manager: &EnvironmentManager, job_id: &str, needle: &str) {
        let mut logs = manager.get_logs(job_id, 0).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(line) = logs.next().await {
                if line.unwrap().content.contains(needle) {
                    return;
                }
            }
            panic!("log ended before '{}'", needle);
        })
        .await
        .expect("log line did not appear");
    }

    fn contents(lines: &[LogLine]) -> Vec<&str> {
        lines.iter().map(|l| l.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_create_then_auto_install() {
        let h = harness().await;
        let submission = h
            .manager
            .create("E1", VERSION, vec!["requests".into()])
            .await
            .unwrap();
        assert_eq!(submission.environment.status, EnvStatus::Uninitialized);
        assert_eq!(submission.job.kind, JobKind::Create);

        let env_id = submission.environment.id.clone();
        wait_idle(&h.manager, &env_id).await;

        let env = h.manager.get_environment(&env_id).await.unwrap();
        assert_eq!(env.status, EnvStatus::Ready);
        assert!(env.python_path().exists());

        let jobs = h.manager.list_jobs(&env_id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        let create = jobs.iter().find(|j| j.kind == JobKind::Create).unwrap();
        let install = jobs.iter().find(|j| j.kind == JobKind::Install).unwrap();
        assert_eq!(create.state, JobState::Succeeded);
        assert_eq!(install.state, JobState::Succeeded);
        assert_eq!(install.exit_code, Some(0));
        assert_eq!(install.dependencies, vec!["requests"]);
        assert_eq!(install.index_url.as_deref(), Some(MIRROR_URL));

        let lines = h.manager.history(&install.id, 0).await.unwrap();
        assert!(!lines.is_empty());
        let seqs: Vec<u64> = lines.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, (0..lines.len() as u64).collect::<Vec<_>>());
        let text = contents(&lines);
        assert!(text.contains(&"arg requests"));
        assert!(text.contains(&format!("arg {}", MIRROR_URL).as_str()));
        assert!(text.iter().any(|l| l.contains("completed successfully")));
    }

    #[tokio::test]
    async fn test_concurrent_install_rejected_with_conflict() {
        let h = harness().await;
        let env = ready_env(&h, "E1").await;

        let first = h.manager.update(&env.id, vec!["slow".into()]).await.unwrap();
        let err = h.manager.install(&env.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        wait_idle(&h.manager, &env.id).await;
        let first = h.manager.get_job(&first.id).await.unwrap();
        assert_eq!(first.state, JobState::Succeeded);
        assert_eq!(h.manager.list_jobs(&env.id).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_submissions_admit_one() {
        let h = Arc::new(harness().await);
        let env = ready_env(&h, "E1").await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let h = h.clone();
            let env_id = env.id.clone();
            handles.push(tokio::spawn(async move {
                h.manager.update(&env_id, vec!["slow".into()]).await.is_ok()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);

        let active = h
            .store
            .list_jobs(Some(&env.id))
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.state.is_active())
            .count();
        assert!(active <= 1);
        wait_idle(&h.manager, &env.id).await;
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let h = harness().await;
        let env = ready_env(&h, "E1").await;

        let job = h.manager.update(&env.id, vec!["hang".into()]).await.unwrap();
        wait_for_line(&h.manager, &job.id, "waiting").await;

        let started = Instant::now();
        h.manager.cancel_job(&job.id).await.unwrap();
        wait_idle(&h.manager, &env.id).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let job = h.manager.get_job(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.exit_code.is_some());
        let env = h.manager.get_environment(&env.id).await.unwrap();
        assert_eq!(env.status, EnvStatus::Error);

        let lines = h.manager.history(&job.id, 0).await.unwrap();
        assert!(contents(&lines).contains(&"waiting"));
        assert!(contents(&lines).iter().any(|l| l.contains("cancelled")));

        let err = h.manager.cancel_job(&job.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_job_timeout_marks_failed() {
        let h = harness_with(|c| c.job_timeout = Duration::from_secs(1)).await;
        let env = ready_env(&h, "E1").await;

        let job = h.manager.update(&env.id, vec!["hang".into()]).await.unwrap();
        wait_idle(&h.manager, &env.id).await;

        let job = h.manager.get_job(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(matches!(job.failure, Some(JobFailure::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_failed_install_keeps_output() {
        let h = harness().await;
        let env = ready_env(&h, "E1").await;

        let job = h.manager.update(&env.id, vec!["broken".into()]).await.unwrap();
        wait_idle(&h.manager, &env.id).await;

        let job = h.manager.get_job(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure, Some(JobFailure::Exit { code: 1 }));
        assert_eq!(job.exit_code, Some(1));

        let lines = h.manager.history(&job.id, 0).await.unwrap();
        assert!(lines
            .iter()
            .any(|l| l.stream == LogStream::Stderr && l.content.contains("No matching distribution")));
        assert_eq!(
            h.manager.get_environment(&env.id).await.unwrap().status,
            EnvStatus::Error
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_recorded_as_job_state() {
        use std::os::unix::fs::PermissionsExt;

        let h = harness().await;
        let env = ready_env(&h, "E1").await;
        // 解释器存在但不可执行
        std::fs::set_permissions(env.python_path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let job = h.manager.install(&env.id).await.unwrap();
        wait_idle(&h.manager, &env.id).await;

        let job = h.manager.get_job(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(matches!(job.failure, Some(JobFailure::Spawn { .. })));
        assert_eq!(job.exit_code, Some(crate::domain::job::EXIT_CODE_SPAWN_FAILED));

        let lines = h.manager.history(&job.id, 0).await.unwrap();
        assert!(contents(&lines).iter().any(|l| l.contains("Failed to start process")));
    }

    #[tokio::test]
    async fn test_uninitialized_environment_rejects_install() {
        let h = harness().await;
        let env = ready_env(&h, "E1").await;
        std::fs::remove_file(env.python_path()).unwrap();

        let err = h.manager.install(&env.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(h.manager.active_job(&env.id).await.is_none());
    }

    #[tokio::test]
    async fn test_create_failure_is_job_failure() {
        let h = harness().await;
        install_runtime_script(
            h.manager.runtimes().versions_root(),
            "3.8.10",
            "#!/bin/sh\necho 'venv: cannot create environment' >&2\nexit 3\n",
        );

        let submission = h.manager.create("E1", "3.8.10", vec!["requests".into()]).await.unwrap();
        wait_idle(&h.manager, &submission.environment.id).await;

        let job = h.manager.get_job(&submission.job.id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure, Some(JobFailure::Exit { code: 3 }));
        let env = h.manager.get_environment(&submission.environment.id).await.unwrap();
        assert_eq!(env.status, EnvStatus::Error);
        // 失败后不进入安装阶段，日志保留
        assert_eq!(h.manager.list_jobs(&env.id).await.unwrap().len(), 1);
        let lines = h.manager.history(&job.id, 0).await.unwrap();
        assert!(contents(&lines).iter().any(|l| l.contains("cannot create environment")));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = harness().await;
        ready_env(&h, "E1").await;

        for (name, version, deps) in [
            ("E1", VERSION, vec![]),
            ("", VERSION, vec![]),
            ("../escape", VERSION, vec![]),
            ("E2", "2.7.18", vec![]),
            ("E2", VERSION, vec!["-r other.txt".to_string()]),
        ] {
            let err = h.manager.create(name, version, deps).await.unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{} {}", name, version);
        }
    }

    #[tokio::test]
    async fn test_logs_for_missing_job() {
        let h = harness().await;
        assert!(matches!(
            h.manager.get_logs("missing", 0).await.err(),
            Some(CoreError::NotFound(_))
        ));
        assert!(matches!(
            h.manager.history("missing", 0).await.unwrap_err(),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            h.manager.cancel_job("missing").await.unwrap_err(),
            CoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_live_log_stream_ends_after_job() {
        let h = harness().await;
        let env = ready_env(&h, "E1").await;

        let job = h.manager.update(&env.id, vec!["slow".into()]).await.unwrap();
        let lines: Vec<LogLine> = h
            .manager
            .get_logs(&job.id, 0)
            .await
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
            .await;

        assert_eq!(lines.first().map(|l| l.seq), Some(0));
        assert!(lines.last().unwrap().content.contains("completed successfully"));
        assert_eq!(lines.len(), h.manager.history(&job.id, 0).await.unwrap().len());
    }

    /// 保存排队中的安装任务后暂停，并通知任务 id
    struct PausingStore {
        inner: MemoryStore,
        queued_installs: tokio::sync::mpsc::UnboundedSender<String>,
    }

    #[async_trait::async_trait]
    impl EnvironmentStore for PausingStore {
        async fn save_environment(&self, env: &VirtualEnvironment) -> StoreResult<()> {
            self.inner.save_environment(env).await
        }
        async fn load_environment(&self, id: &str) -> StoreResult<Option<VirtualEnvironment>> {
            self.inner.load_environment(id).await
        }
        async fn list_environments(&self) -> StoreResult<Vec<VirtualEnvironment>> {
            self.inner.list_environments().await
        }
        async fn delete_environment(&self, id: &str) -> StoreResult<()> {
            self.inner.delete_environment(id).await
        }
        async fn save_job(&self, job: &InstallJob) -> StoreResult<()> {
            self.inner.save_job(job).await?;
            if job.kind == JobKind::Install && job.state == JobState::Queued {
                let _ = self.queued_installs.send(job.id.clone());
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            Ok(())
        }
        async fn load_job(&self, id: &str) -> StoreResult<Option<InstallJob>> {
            self.inner.load_job(id).await
        }
        async fn list_jobs(&self, env_id: Option<&str>) -> StoreResult<Vec<InstallJob>> {
            self.inner.list_jobs(env_id).await
        }
        async fn append_log_line(&self, line: &LogLine) -> StoreResult<()> {
            self.inner.append_log_line(line).await
        }
        async fn load_log_lines(&self, job_id: &str, from_seq: u64) -> StoreResult<Vec<LogLine>> {
            self.inner.load_log_lines(job_id, from_seq).await
        }
        async fn delete_logs(&self, job_id: &str) -> StoreResult<()> {
            self.inner.delete_logs(job_id).await
        }
        async fn save_mirror(&self, mirror: &MirrorSource) -> StoreResult<()> {
            self.inner.save_mirror(mirror).await
        }
        async fn load_mirror(&self, id: &str) -> StoreResult<Option<MirrorSource>> {
            self.inner.load_mirror(id).await
        }
        async fn delete_mirror(&self, id: &str) -> StoreResult<()> {
            self.inner.delete_mirror(id).await
        }
        async fn list_mirrors(&self) -> StoreResult<Vec<MirrorSource>> {
            self.inner.list_mirrors().await
        }
        async fn set_active_mirror(&self, id: &str) -> StoreResult<()> {
            self.inner.set_active_mirror(id).await
        }
    }

    #[tokio::test]
    async fn test_auto_install_streams_live_once_visible() {
        let (tx, mut queued_installs) = tokio::sync::mpsc::unbounded_channel();
        let store = Arc::new(PausingStore {
            inner: MemoryStore::new(),
            queued_installs: tx,
        });
        let h = harness_on(store, |_| {}).await;

        let submission = h.manager.create("E1", VERSION, vec!["slow".into()]).await.unwrap();
        let install_id = tokio::time::timeout(Duration::from_secs(10), queued_installs.recv())
            .await
            .unwrap()
            .unwrap();

        // 任务记录刚可见时订阅，必须得到完整的实时流
        let lines: Vec<LogLine> = tokio::time::timeout(
            Duration::from_secs(20),
            h.manager
                .get_logs(&install_id, 0)
                .await
                .unwrap()
                .map(|l| l.unwrap())
                .collect(),
        )
        .await
        .unwrap();

        let install = h.manager.get_job(&install_id).await.unwrap();
        assert_eq!(install.state, JobState::Succeeded);
        assert!(lines.last().unwrap().content.contains("completed successfully"));
        assert_eq!(lines.len(), h.manager.history(&install_id, 0).await.unwrap().len());
        wait_idle(&h.manager, &submission.environment.id).await;
    }

    #[tokio::test]
    async fn test_delete_refused_while_job_active() {
        let h = harness().await;
        let env = ready_env(&h, "E1").await;

        let job = h.manager.update(&env.id, vec!["hang".into()]).await.unwrap();
        let err = h.manager.delete(&env.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        h.manager.cancel_job(&job.id).await.unwrap();
        wait_idle(&h.manager, &env.id).await;

        h.manager.delete(&env.id).await.unwrap();
        assert!(matches!(
            h.manager.get_environment(&env.id).await.unwrap_err(),
            CoreError::NotFound(_)
        ));
        assert!(!env.path.exists());
        // 任务记录保留
        assert!(h.manager.get_job(&job.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_restores_record_when_removal_fails() {
        let h = harness().await;
        let env = ready_env(&h, "E1").await;

        // 目录换成普通文件，remove_dir_all 失败
        std::fs::remove_dir_all(&env.path).unwrap();
        std::fs::write(&env.path, "not a directory").unwrap();

        let err = h.manager.delete(&env.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Filesystem(_)));
        assert!(h.manager.get_environment(&env.id).await.is_ok());
        assert!(h.manager.active_job(&env.id).await.is_none());
    }

    #[tokio::test]
    async fn test_mirror_change_does_not_affect_recorded_job() {
        let h = harness().await;
        let env = ready_env(&h, "E1").await;

        let job = h.manager.update(&env.id, vec!["slow".into()]).await.unwrap();
        wait_for_line(&h.manager, &job.id, "arg slow").await;

        let other = h
            .mirrors
            .create("other", "https://other.example/simple", None)
            .await
            .unwrap();
        h.mirrors.set_active(&other.id).await.unwrap();
        wait_idle(&h.manager, &env.id).await;

        let job = h.manager.get_job(&job.id).await.unwrap();
        assert_eq!(job.index_url.as_deref(), Some(MIRROR_URL));
        assert_eq!(job.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_recover_interrupted_jobs() {
        let h = harness().await;
        let mut env = VirtualEnvironment::new("E1", VERSION, vec![], &h.manager.config.env_root);
        env.set_status(EnvStatus::Installing);
        h.store.save_environment(&env).await.unwrap();

        let mut job = InstallJob::new_queued(&env.id, JobKind::Install, vec!["requests".into()]);
        job.start(None, None).unwrap();
        h.store.save_job(&job).await.unwrap();
        h.store
            .append_log_line(&LogLine::new(&job.id, 0, LogStream::Stdout, "Collecting requests"))
            .await
            .unwrap();

        assert_eq!(h.manager.recover_interrupted().await.unwrap(), 1);

        let job = h.manager.get_job(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure, Some(JobFailure::Interrupted));
        assert_eq!(
            h.manager.get_environment(&env.id).await.unwrap().status,
            EnvStatus::Error
        );

        let lines = h.manager.history(&job.id, 0).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].seq, 1);
        assert!(lines[1].content.contains("interrupted"));

        assert_eq!(h.manager.recover_interrupted().await.unwrap(), 0);
    }
}
