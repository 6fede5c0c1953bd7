//! 环境活跃任务槽位
//!
//! 每个环境同一时刻最多一个 `queued`/`running` 任务。
//! 占用与释放都在写锁内完成 check-and-set。

use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 删除环境期间占用槽位使用的持有者标识
pub const DELETE_HOLDER: &str = "delete";

/// 占用槽位的任务
pub struct ActiveJob {
    pub job_id: String,
    pub cancel_token: CancellationToken,
}

/// 活跃任务表 (env_id -> ActiveJob)
#[derive(Default)]
pub struct ActiveJobs {
    slots: RwLock<HashMap<String, ActiveJob>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试占用环境槽位
    ///
    /// 已被占用时返回当前持有者
    pub async fn try_acquire(&self, env_id: &str, job_id: &str) -> Result<CancellationToken, String> {
        let mut slots = self.slots.write().await;
        if let Some(existing) = slots.get(env_id) {
            return Err(existing.job_id.clone());
        }
        let cancel_token = CancellationToken::new();
        slots.insert(
            env_id.to_string(),
            ActiveJob {
                job_id: job_id.to_string(),
                cancel_token: cancel_token.clone(),
            },
        );
        Ok(cancel_token)
    }

    /// 把槽位从 `from_job` 直接交给 `to_job`，中间不释放
    ///
    /// 当前持有者不是 `from_job` 时返回 `None`
    pub async fn hand_over(&self, env_id: &str, from_job: &str, to_job: &str) -> Option<CancellationToken> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(env_id)?;
        if slot.job_id != from_job {
            return None;
        }
        let cancel_token = CancellationToken::new();
        *slot = ActiveJob {
            job_id: to_job.to_string(),
            cancel_token: cancel_token.clone(),
        };
        Some(cancel_token)
    }

    /// 释放槽位，只有持有者本身能释放
    pub async fn release(&self, env_id: &str, job_id: &str) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get(env_id) {
            Some(slot) if slot.job_id == job_id => {
                slots.remove(env_id);
                true
            }
            _ => false,
        }
    }

    /// 请求取消任务
    pub async fn cancel(&self, job_id: &str) -> bool {
        let slots = self.slots.read().await;
        match slots.values().find(|slot| slot.job_id == job_id) {
            Some(slot) => {
                slot.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// 环境当前的活跃任务
    pub async fn active_job(&self, env_id: &str) -> Option<String> {
        let slots = self.slots.read().await;
        slots.get(env_id).map(|slot| slot.job_id.clone())
    }

    /// 取消所有任务（关闭时）
    pub async fn cancel_all(&self) -> usize {
        let slots = self.slots.read().await;
        for slot in slots.values() {
            slot.cancel_token.cancel();
        }
        slots.len()
    }

    pub async fn count(&self) -> usize {
        self.slots.read().await.len()
    }
}
