//! 日志通道管理
//!
//! 每个任务一个 [`LogChannel`]：追加即持久化，并广播给所有在线订阅者。
//! 订阅先回放已持久化的历史，再无缝切换到实时推送。
//!
//! 无缺口/无重复的保证：
//! - `append` 在同一把锁内完成“分配序号 → 持久化 → 广播”
//! - `subscribe` 在同一把锁内注册广播接收者，因此注册前写入的行一定已落盘，
//!   注册后写入的行一定会被广播收到
//! - 订阅者维护游标，重叠部分按序号丢弃；广播落后（Lagged）时从存储补齐

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

use super::store::EnvironmentStore;
use crate::domain::log::{LogLine, LogStream};
use crate::error::{CoreError, CoreResult, StorageError};

/// 日志通道容量
pub const LOG_CHANNEL_CAPACITY: usize = 256;

/// 订阅得到的日志流；存储故障时产出一个 `Err` 后结束
pub type LogSubscription = BoxStream<'static, Result<LogLine, StorageError>>;

/// 广播事件
#[derive(Clone, Debug)]
enum LogEvent {
    Line(LogLine),
    Closed,
}

struct ChannelState {
    next_seq: u64,
    closed_at: Option<DateTime<Utc>>,
}

/// 单个任务的日志通道
pub struct LogChannel {
    job_id: String,
    store: Arc<dyn EnvironmentStore>,
    sender: broadcast::Sender<LogEvent>,
    state: Mutex<ChannelState>,
    /// `state.closed_at` 的同步镜像，供清理时无锁读取
    closed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl LogChannel {
    pub fn new(job_id: &str, store: Arc<dyn EnvironmentStore>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            job_id: job_id.to_string(),
            store,
            sender,
            state: Mutex::new(ChannelState {
                next_seq: 0,
                closed_at: None,
            }),
            closed: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    /// 接续已持久化的日志，序号从最后一行之后开始
    pub async fn resume(
        job_id: &str,
        store: Arc<dyn EnvironmentStore>,
        capacity: usize,
    ) -> Result<Self, StorageError> {
        let existing = store.load_log_lines(job_id, 0).await?;
        let channel = Self::new(job_id, store, capacity);
        if let Some(last) = existing.last() {
            channel.state.lock().await.next_seq = last.seq + 1;
        }
        Ok(channel)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// 追加一行
    ///
    /// 持久化无条件执行；持久化失败时序号不前进
    pub async fn append(&self, stream: LogStream, content: impl Into<String>) -> CoreResult<LogLine> {
        let mut state = self.state.lock().await;
        if state.closed_at.is_some() {
            return Err(CoreError::conflict(format!(
                "log channel for job '{}' is closed",
                self.job_id
            )));
        }

        let line = LogLine::new(&self.job_id, state.next_seq, stream, content);
        self.store.append_log_line(&line).await?;
        state.next_seq += 1;

        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.sender.send(LogEvent::Line(line.clone()));
        Ok(line)
    }

    /// 关闭通道：所有订阅者收到结束信号，此后拒绝追加
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed_at.is_some() {
            return;
        }
        state.closed_at = Some(Utc::now());
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.sender.send(LogEvent::Closed);
        debug!(job_id = %self.job_id, lines = state.next_seq, "Log channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 下一个将分配的序号（即已写入行数）
    pub async fn next_seq(&self) -> u64 {
        self.state.lock().await.next_seq
    }

    /// 已持久化的历史（非阻塞）
    pub async fn history(&self, from_seq: u64) -> Result<Vec<LogLine>, StorageError> {
        self.store.load_log_lines(&self.job_id, from_seq).await
    }

    /// 在线订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// 从 `from_seq`（含）开始订阅
    ///
    /// 先回放历史再转入实时；`from_seq` 超过当前末尾时挂起等待新数据或关闭。
    /// 丢弃返回的流即可退订，不影响生产者和其他订阅者。
    pub async fn subscribe(self: &Arc<Self>, from_seq: u64) -> LogSubscription {
        let (mut rx, closed) = {
            let state = self.state.lock().await;
            (self.sender.subscribe(), state.closed_at.is_some())
        };
        let channel = Arc::clone(self);

        Box::pin(async_stream::stream! {
            let mut cursor = from_seq;

            let history = match channel.store.load_log_lines(&channel.job_id, cursor).await {
                Ok(lines) => lines,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for line in history {
                if line.seq >= cursor {
                    cursor = line.seq + 1;
                    yield Ok(line);
                }
            }
            if closed {
                return;
            }

            loop {
                match rx.recv().await {
                    Ok(LogEvent::Line(line)) => {
                        if line.seq >= cursor {
                            cursor = line.seq + 1;
                            yield Ok(line);
                        }
                    }
                    Ok(LogEvent::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(job_id = %channel.job_id, lagged = n, cursor, "Log subscriber lagged, catching up from store");
                        let missed = match channel.store.load_log_lines(&channel.job_id, cursor).await {
                            Ok(lines) => lines,
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        };
                        for line in missed {
                            if line.seq >= cursor {
                                cursor = line.seq + 1;
                                yield Ok(line);
                            }
                        }
                        if channel.is_closed() && cursor >= channel.next_seq().await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// 只回放存储中的历史，用于已没有在线通道的任务
pub fn history_stream(
    store: Arc<dyn EnvironmentStore>,
    job_id: String,
    from_seq: u64,
) -> LogSubscription {
    Box::pin(async_stream::stream! {
        match store.load_log_lines(&job_id, from_seq).await {
            Ok(lines) => {
                for line in lines {
                    yield Ok(line);
                }
            }
            Err(e) => yield Err(e),
        }
    })
}

/// 日志中心
///
/// 管理任务日志通道（job_id -> LogChannel），已关闭且无订阅者的通道定期清理，
/// 历史仍可从存储读取
pub struct LogHub {
    store: Arc<dyn EnvironmentStore>,
    channels: RwLock<HashMap<String, Arc<LogChannel>>>,
    capacity: usize,
}

impl LogHub {
    /// 创建新的日志中心
    pub fn new(store: Arc<dyn EnvironmentStore>) -> Self {
        Self::with_capacity(store, LOG_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn EnvironmentStore>, capacity: usize) -> Self {
        Self {
            store,
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// 创建新的日志通道
    ///
    /// 如果通道已存在，返回现有通道
    pub async fn create(&self, job_id: &str) -> Arc<LogChannel> {
        let mut channels = self.channels.write().await;
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(LogChannel::new(job_id, self.store.clone(), self.capacity)))
            .clone()
    }

    /// 为已有历史的任务重新打开通道（如重启恢复）
    pub async fn reopen(&self, job_id: &str) -> Result<Arc<LogChannel>, StorageError> {
        if let Some(channel) = self.get(job_id).await {
            return Ok(channel);
        }
        let channel = Arc::new(LogChannel::resume(job_id, self.store.clone(), self.capacity).await?);
        let mut channels = self.channels.write().await;
        Ok(channels
            .entry(job_id.to_string())
            .or_insert(channel)
            .clone())
    }

    /// 获取通道
    pub async fn get(&self, job_id: &str) -> Option<Arc<LogChannel>> {
        let channels = self.channels.read().await;
        channels.get(job_id).cloned()
    }

    /// 订阅任务日志
    ///
    /// 通道已被清理时退化为只回放历史
    pub async fn subscribe(&self, job_id: &str, from_seq: u64) -> LogSubscription {
        match self.get(job_id).await {
            Some(channel) => channel.subscribe(from_seq).await,
            None => history_stream(self.store.clone(), job_id.to_string(), from_seq),
        }
    }

    /// 检查通道是否存在
    pub async fn exists(&self, job_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.contains_key(job_id)
    }

    /// 移除通道（环境删除时）
    pub async fn remove(&self, job_id: &str) {
        self.channels.write().await.remove(job_id);
    }

    /// 清理已关闭且没有活跃订阅者的通道
    pub async fn cleanup(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, channel| !channel.is_closed() || channel.subscriber_count() > 0);
        before - channels.len()
    }

    /// 清理过期通道
    ///
    /// 超过指定时长的通道只保留未关闭或仍有订阅者的
    pub async fn cleanup_expired(&self, max_age_hours: i64) -> usize {
        let now = Utc::now();
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, channel| {
            let age = now - channel.created_at;
            if age.num_hours() < max_age_hours {
                return true;
            }
            !channel.is_closed() || channel.subscriber_count() > 0
        });
        before - channels.len()
    }

    /// 获取通道数量
    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// 获取活跃通道数量（未关闭）
    pub async fn active_count(&self) -> usize {
        let channels = self.channels.read().await;
        channels.values().filter(|c| !c.is_closed()).count()
    }
}
