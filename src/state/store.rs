//! 持久化接口
//!
//! 核心只依赖 [`EnvironmentStore`] 契约；所有方法只会以 [`StorageError`] 失败。
//! [`MemoryStore`] 用于测试和无盘运行，`FileStore` 提供落盘实现。

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::{InstallJob, LogLine, MirrorSource, VirtualEnvironment};
use crate::error::StorageError;

/// 存储操作结果
pub type StoreResult<T> = Result<T, StorageError>;

/// 环境、任务、日志与镜像源的持久化契约
#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    async fn save_environment(&self, env: &VirtualEnvironment) -> StoreResult<()>;
    async fn load_environment(&self, id: &str) -> StoreResult<Option<VirtualEnvironment>>;
    async fn list_environments(&self) -> StoreResult<Vec<VirtualEnvironment>>;
    async fn delete_environment(&self, id: &str) -> StoreResult<()>;

    async fn save_job(&self, job: &InstallJob) -> StoreResult<()>;
    async fn load_job(&self, id: &str) -> StoreResult<Option<InstallJob>>;
    /// 按创建时间倒序
    async fn list_jobs(&self, env_id: Option<&str>) -> StoreResult<Vec<InstallJob>>;

    /// 追加日志行，调用方保证 `seq` 连续
    async fn append_log_line(&self, line: &LogLine) -> StoreResult<()>;
    /// 读取 `seq >= from_seq` 的日志，按 `seq` 升序
    async fn load_log_lines(&self, job_id: &str, from_seq: u64) -> StoreResult<Vec<LogLine>>;
    async fn delete_logs(&self, job_id: &str) -> StoreResult<()>;

    async fn save_mirror(&self, mirror: &MirrorSource) -> StoreResult<()>;
    async fn load_mirror(&self, id: &str) -> StoreResult<Option<MirrorSource>>;
    async fn delete_mirror(&self, id: &str) -> StoreResult<()>;
    async fn list_mirrors(&self) -> StoreResult<Vec<MirrorSource>>;
    /// 原子地激活指定镜像源，其余全部置为非激活
    async fn set_active_mirror(&self, id: &str) -> StoreResult<()>;
}

/// 内存中的数据集
///
/// `FileStore` 复用同一结构作为快照格式
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreData {
    pub environments: HashMap<String, VirtualEnvironment>,
    pub jobs: HashMap<String, InstallJob>,
    pub mirrors: Vec<MirrorSource>,
}

impl StoreData {
    pub(crate) fn sorted_environments(&self) -> Vec<VirtualEnvironment> {
        let mut envs: Vec<_> = self.environments.values().cloned().collect();
        envs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        envs
    }

    pub(crate) fn sorted_jobs(&self, env_id: Option<&str>) -> Vec<InstallJob> {
        let mut jobs: Vec<_> = self
            .jobs
            .values()
            .filter(|j| env_id.map_or(true, |id| j.env_id == id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub(crate) fn upsert_mirror(&mut self, mirror: &MirrorSource) {
        match self.mirrors.iter_mut().find(|m| m.id == mirror.id) {
            Some(existing) => *existing = mirror.clone(),
            None => self.mirrors.push(mirror.clone()),
        }
    }

    pub(crate) fn activate_mirror(&mut self, id: &str) -> StoreResult<()> {
        if !self.mirrors.iter().any(|m| m.id == id) {
            return Err(StorageError::new(format!("mirror '{}' does not exist", id)));
        }
        for mirror in &mut self.mirrors {
            mirror.is_active = mirror.id == id;
        }
        Ok(())
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
    logs: RwLock<HashMap<String, Vec<LogLine>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnvironmentStore for MemoryStore {
    async fn save_environment(&self, env: &VirtualEnvironment) -> StoreResult<()> {
        let mut data = self.data.write().await;
        data.environments.insert(env.id.clone(), env.clone());
        Ok(())
    }

    async fn load_environment(&self, id: &str) -> StoreResult<Option<VirtualEnvironment>> {
        Ok(self.data.read().await.environments.get(id).cloned())
    }

    async fn list_environments(&self) -> StoreResult<Vec<VirtualEnvironment>> {
        Ok(self.data.read().await.sorted_environments())
    }

    async fn delete_environment(&self, id: &str) -> StoreResult<()> {
        self.data.write().await.environments.remove(id);
        Ok(())
    }

    async fn save_job(&self, job: &InstallJob) -> StoreResult<()> {
        let mut data = self.data.write().await;
        data.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load_job(&self, id: &str) -> StoreResult<Option<InstallJob>> {
        Ok(self.data.read().await.jobs.get(id).cloned())
    }

    async fn list_jobs(&self, env_id: Option<&str>) -> StoreResult<Vec<InstallJob>> {
        Ok(self.data.read().await.sorted_jobs(env_id))
    }

    async fn append_log_line(&self, line: &LogLine) -> StoreResult<()> {
        let mut logs = self.logs.write().await;
        logs.entry(line.job_id.clone()).or_default().push(line.clone());
        Ok(())
    }

    async fn load_log_lines(&self, job_id: &str, from_seq: u64) -> StoreResult<Vec<LogLine>> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(job_id)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|l| l.seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_logs(&self, job_id: &str) -> StoreResult<()> {
        self.logs.write().await.remove(job_id);
        Ok(())
    }

    async fn save_mirror(&self, mirror: &MirrorSource) -> StoreResult<()> {
        self.data.write().await.upsert_mirror(mirror);
        Ok(())
    }

    async fn load_mirror(&self, id: &str) -> StoreResult<Option<MirrorSource>> {
        let data = self.data.read().await;
        Ok(data.mirrors.iter().find(|m| m.id == id).cloned())
    }

    async fn delete_mirror(&self, id: &str) -> StoreResult<()> {
        self.data.write().await.mirrors.retain(|m| m.id != id);
        Ok(())
    }

    async fn list_mirrors(&self) -> StoreResult<Vec<MirrorSource>> {
        Ok(self.data.read().await.mirrors.clone())
    }

    async fn set_active_mirror(&self, id: &str) -> StoreResult<()> {
        self.data.write().await.activate_mirror(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobKind, LogStream};
    use std::path::Path;

    #[tokio::test]
    async fn test_environment_roundtrip() {
        let store = MemoryStore::new();
        let env = VirtualEnvironment::new("demo", "3.9.21", vec![], Path::new("/tmp/envs"));

        store.save_environment(&env).await.unwrap();
        let loaded = store.load_environment(&env.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "demo");

        store.delete_environment(&env.id).await.unwrap();
        assert!(store.load_environment(&env.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_jobs_filters_by_environment() {
        let store = MemoryStore::new();
        let a = InstallJob::new_queued("env-a", JobKind::Install, vec![]);
        let b = InstallJob::new_queued("env-b", JobKind::Install, vec![]);
        store.save_job(&a).await.unwrap();
        store.save_job(&b).await.unwrap();

        let jobs = store.list_jobs(Some("env-a")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, a.id);
        assert_eq!(store.list_jobs(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_load_log_lines_from_seq() {
        let store = MemoryStore::new();
        for seq in 0..5 {
            let line = LogLine::new("job-1", seq, LogStream::Stdout, format!("line {}", seq));
            store.append_log_line(&line).await.unwrap();
        }

        let tail = store.load_log_lines("job-1", 3).await.unwrap();
        assert_eq!(tail.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![3, 4]);
        assert!(store.load_log_lines("job-1", 10).await.unwrap().is_empty());
        assert!(store.load_log_lines("missing", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_active_mirror_is_exclusive() {
        let store = MemoryStore::new();
        let mut a = MirrorSource::new("a", "https://a.example/simple", None);
        a.is_active = true;
        let b = MirrorSource::new("b", "https://b.example/simple", None);
        store.save_mirror(&a).await.unwrap();
        store.save_mirror(&b).await.unwrap();

        store.set_active_mirror(&b.id).await.unwrap();
        let active: Vec<_> = store
            .list_mirrors()
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);

        assert!(store.set_active_mirror("missing").await.is_err());
    }
}
