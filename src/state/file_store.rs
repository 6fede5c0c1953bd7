//! 文件持久化
//!
//! - 环境 / 任务 / 镜像源：`state.json` 快照，临时文件 + 重命名实现原子写入
//! - 日志：每个任务一个 `logs/<job_id>.jsonl`，追加写入
//!
//! 写入失败时内存中的数据保持不变，不留下部分状态

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::store::{EnvironmentStore, StoreData, StoreResult};
use crate::domain::{InstallJob, LogLine, MirrorSource, VirtualEnvironment};
use crate::error::StorageError;

/// 快照文件名
const STATE_FILE_NAME: &str = "state.json";

/// 日志目录名
const LOGS_DIR_NAME: &str = "logs";

/// 文件存储
pub struct FileStore {
    root: PathBuf,
    data: Mutex<StoreData>,
    /// 本进程内已校验过末尾的日志文件
    checked_logs: Mutex<HashSet<String>>,
}

impl FileStore {
    /// 打开（或初始化）数据目录
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(LOGS_DIR_NAME)).await?;

        let state_path = root.join(STATE_FILE_NAME);
        let data = if fs::try_exists(&state_path).await? {
            let content = fs::read_to_string(&state_path).await?;
            let data: StoreData = serde_json::from_str(&content).map_err(|e| {
                StorageError::new(format!("corrupt snapshot {}: {}", state_path.display(), e))
            })?;
            info!(
                path = %state_path.display(),
                environments = data.environments.len(),
                jobs = data.jobs.len(),
                mirrors = data.mirrors.len(),
                "Loaded persisted state"
            );
            data
        } else {
            StoreData::default()
        };

        Ok(Self {
            root,
            data: Mutex::new(data),
            checked_logs: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 在副本上修改并落盘，成功后才替换内存数据
    async fn mutate<F>(&self, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut StoreData) -> StoreResult<()>,
    {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        f(&mut next)?;
        self.write_snapshot(&next).await?;
        *data = next;
        Ok(())
    }

    async fn write_snapshot(&self, data: &StoreData) -> StoreResult<()> {
        let path = self.root.join(STATE_FILE_NAME);
        let temp_path = path.with_extension("json.tmp");

        let content = serde_json::to_vec_pretty(data)?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    /// 截掉上次崩溃留下的半行，使后续追加从新行开始
    async fn repair_log_tail(&self, job_id: &str, path: &Path) -> StoreResult<()> {
        let mut checked = self.checked_logs.lock().await;
        if checked.contains(job_id) {
            return Ok(());
        }

        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if content.last().is_some_and(|b| *b != b'\n') {
            let keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
            warn!(
                job_id = %job_id,
                dropped_bytes = content.len() - keep,
                "Truncating partial log record"
            );
            let file = fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(keep as u64).await?;
            file.sync_all().await?;
        }

        checked.insert(job_id.to_string());
        Ok(())
    }

    fn log_path(&self, job_id: &str) -> StoreResult<PathBuf> {
        let valid = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::new(format!("invalid job id '{}'", job_id)));
        }
        Ok(self
            .root
            .join(LOGS_DIR_NAME)
            .join(format!("{}.jsonl", job_id)))
    }
}

#[async_trait]
impl EnvironmentStore for FileStore {
    async fn save_environment(&self, env: &VirtualEnvironment) -> StoreResult<()> {
        self.mutate(|data| {
            data.environments.insert(env.id.clone(), env.clone());
            Ok(())
        })
        .await
    }

    async fn load_environment(&self, id: &str) -> StoreResult<Option<VirtualEnvironment>> {
        Ok(self.data.lock().await.environments.get(id).cloned())
    }

    async fn list_environments(&self) -> StoreResult<Vec<VirtualEnvironment>> {
        Ok(self.data.lock().await.sorted_environments())
    }

    async fn delete_environment(&self, id: &str) -> StoreResult<()> {
        self.mutate(|data| {
            data.environments.remove(id);
            Ok(())
        })
        .await
    }

    async fn save_job(&self, job: &InstallJob) -> StoreResult<()> {
        self.mutate(|data| {
            data.jobs.insert(job.id.clone(), job.clone());
            Ok(())
        })
        .await
    }

    async fn load_job(&self, id: &str) -> StoreResult<Option<InstallJob>> {
        Ok(self.data.lock().await.jobs.get(id).cloned())
    }

    async fn list_jobs(&self, env_id: Option<&str>) -> StoreResult<Vec<InstallJob>> {
        Ok(self.data.lock().await.sorted_jobs(env_id))
    }

    async fn append_log_line(&self, line: &LogLine) -> StoreResult<()> {
        let path = self.log_path(&line.job_id)?;
        self.repair_log_tail(&line.job_id, &path).await?;
        let mut record = serde_json::to_vec(line)?;
        record.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&record).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_log_lines(&self, job_id: &str, from_seq: u64) -> StoreResult<Vec<LogLine>> {
        let path = self.log_path(job_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let records: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut lines = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            match serde_json::from_str::<LogLine>(record) {
                Ok(line) if line.seq >= from_seq => lines.push(line),
                Ok(_) => {}
                // 进程崩溃可能留下半行，只容忍最后一条
                Err(e) if i + 1 == records.len() => {
                    warn!(job_id = %job_id, error = %e, "Ignoring truncated log record");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(lines)
    }

    async fn delete_logs(&self, job_id: &str) -> StoreResult<()> {
        let path = self.log_path(job_id)?;
        self.checked_logs.lock().await.remove(job_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_mirror(&self, mirror: &MirrorSource) -> StoreResult<()> {
        self.mutate(|data| {
            data.upsert_mirror(mirror);
            Ok(())
        })
        .await
    }

    async fn load_mirror(&self, id: &str) -> StoreResult<Option<MirrorSource>> {
        let data = self.data.lock().await;
        Ok(data.mirrors.iter().find(|m| m.id == id).cloned())
    }

    async fn delete_mirror(&self, id: &str) -> StoreResult<()> {
        self.mutate(|data| {
            data.mirrors.retain(|m| m.id != id);
            Ok(())
        })
        .await
    }

    async fn list_mirrors(&self) -> StoreResult<Vec<MirrorSource>> {
        Ok(self.data.lock().await.mirrors.clone())
    }

    async fn set_active_mirror(&self, id: &str) -> StoreResult<()> {
        self.mutate(|data| data.activate_mirror(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobKind, LogStream};

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let env = VirtualEnvironment::new("demo", "3.9.21", vec!["requests".into()], dir.path());
        let job = InstallJob::new_queued(&env.id, JobKind::Install, env.dependencies.clone());
        let mirror = MirrorSource::new("pypi", "https://pypi.org/simple", None);

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.save_environment(&env).await.unwrap();
            store.save_job(&job).await.unwrap();
            store.save_mirror(&mirror).await.unwrap();
            store.set_active_mirror(&mirror.id).await.unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        let loaded = store.load_environment(&env.id).await.unwrap().unwrap();
        assert_eq!(loaded.dependencies, vec!["requests"]);
        assert!(store.load_job(&job.id).await.unwrap().is_some());
        let mirrors = store.list_mirrors().await.unwrap();
        assert_eq!(mirrors.len(), 1);
        assert!(mirrors[0].is_active);
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let mirror = MirrorSource::new("pypi", "https://pypi.org/simple", None);
        store.save_mirror(&mirror).await.unwrap();

        assert!(store.set_active_mirror("missing").await.is_err());
        assert!(!store.list_mirrors().await.unwrap()[0].is_active);
    }

    #[tokio::test]
    async fn test_log_lines_append_and_tolerate_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        for seq in 0..3 {
            let line = LogLine::new("job-1", seq, LogStream::Stdout, format!("line {}", seq));
            store.append_log_line(&line).await.unwrap();
        }

        // 模拟崩溃留下的半行
        let path = dir.path().join("logs").join("job-1.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"job_id\":\"job-1\",\"se");
        std::fs::write(&path, content).unwrap();

        let lines = store.load_log_lines("job-1", 1).await.unwrap();
        assert_eq!(lines.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_append_after_crash_truncated_record() {
        use crate::state::LogHub;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            for seq in 0..2 {
                let line = LogLine::new("job-1", seq, LogStream::Stdout, "old");
                store.append_log_line(&line).await.unwrap();
            }
        }
        let path = dir.path().join("logs").join("job-1.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"job_id\":\"job-1\",\"se");
        std::fs::write(&path, content).unwrap();

        // 重启后续写
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let hub = LogHub::new(store.clone());
        let channel = hub.reopen("job-1").await.unwrap();
        assert_eq!(channel.append(LogStream::Stderr, "interrupted marker").await.unwrap().seq, 2);
        assert_eq!(channel.append(LogStream::Stderr, "after").await.unwrap().seq, 3);

        let lines = store.load_log_lines("job-1", 0).await.unwrap();
        let seen: Vec<(u64, &str)> = lines.iter().map(|l| (l.seq, l.content.as_str())).collect();
        assert_eq!(
            seen,
            vec![(0, "old"), (1, "old"), (2, "interrupted marker"), (3, "after")]
        );
    }

    #[tokio::test]
    async fn test_rejects_path_like_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.load_log_lines("../state", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE_NAME), "not json").unwrap();
        let err = FileStore::open(dir.path()).await.err().unwrap();
        assert!(err.message.contains("corrupt snapshot"));
    }
}
