//! 镜像源管理
//!
//! 维护包索引镜像源列表，保证存在镜像源时恰好一个处于激活状态。
//! 所有写操作串行执行，激活切换由存储层原子完成。

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::mirror::{MirrorSource, MirrorUpdate, DEFAULT_MIRRORS};
use crate::error::{CoreError, CoreResult};
use crate::state::store::EnvironmentStore;

/// 镜像源名称最大长度
const MAX_MIRROR_NAME_LEN: usize = 64;

/// 镜像源注册表
pub struct MirrorRegistry {
    store: Arc<dyn EnvironmentStore>,
    write_lock: Mutex<()>,
}

impl MirrorRegistry {
    pub fn new(store: Arc<dyn EnvironmentStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn list(&self) -> CoreResult<Vec<MirrorSource>> {
        Ok(self.store.list_mirrors().await?)
    }

    pub async fn get(&self, id: &str) -> CoreResult<MirrorSource> {
        self.store
            .load_mirror(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Mirror '{}'", id)))
    }

    /// 当前激活的镜像源
    pub async fn active(&self) -> CoreResult<Option<MirrorSource>> {
        let mirrors = self.store.list_mirrors().await?;
        Ok(mirrors.into_iter().find(|m| m.is_active))
    }

    /// 新增镜像源
    ///
    /// 第一个镜像源自动激活
    pub async fn create(
        &self,
        name: &str,
        url: &str,
        description: Option<String>,
    ) -> CoreResult<MirrorSource> {
        let _guard = self.write_lock.lock().await;

        let name = validate_name(name)?;
        let url = validate_url(url)?;
        let existing = self.store.list_mirrors().await?;
        ensure_unique(&existing, None, &name, &url)?;

        let mut mirror = MirrorSource::new(&name, &url, normalize_description(description));
        mirror.is_active = existing.is_empty();
        self.store.save_mirror(&mirror).await?;

        info!(mirror_id = %mirror.id, name = %mirror.name, url = %mirror.url, active = mirror.is_active, "Mirror created");
        Ok(mirror)
    }

    /// 部分更新，激活状态不受影响
    pub async fn update(&self, id: &str, update: MirrorUpdate) -> CoreResult<MirrorSource> {
        let _guard = self.write_lock.lock().await;

        let mut mirror = self.get(id).await?;
        if let Some(name) = update.name {
            mirror.name = validate_name(&name)?;
        }
        if let Some(url) = update.url {
            mirror.url = validate_url(&url)?;
        }
        if update.description.is_some() {
            mirror.description = normalize_description(update.description);
        }

        let existing = self.store.list_mirrors().await?;
        ensure_unique(&existing, Some(id), &mirror.name, &mirror.url)?;
        self.store.save_mirror(&mirror).await?;

        info!(mirror_id = %mirror.id, name = %mirror.name, "Mirror updated");
        Ok(mirror)
    }

    /// 删除镜像源，激活中的镜像源不可删除
    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let mirror = self.get(id).await?;
        if mirror.is_active {
            return Err(CoreError::conflict(format!(
                "Mirror '{}' is active; activate another mirror first",
                mirror.name
            )));
        }
        self.store.delete_mirror(id).await?;

        info!(mirror_id = %id, name = %mirror.name, "Mirror deleted");
        Ok(())
    }

    /// 激活指定镜像源，其余全部取消激活
    pub async fn set_active(&self, id: &str) -> CoreResult<MirrorSource> {
        let _guard = self.write_lock.lock().await;

        let mut mirror = self.get(id).await?;
        self.store.set_active_mirror(id).await?;
        mirror.is_active = true;

        info!(mirror_id = %id, name = %mirror.name, "Mirror activated");
        Ok(mirror)
    }

    /// 存储中没有任何镜像源时写入默认列表
    pub async fn seed_defaults(&self) -> CoreResult<usize> {
        let _guard = self.write_lock.lock().await;

        if !self.store.list_mirrors().await?.is_empty() {
            return Ok(0);
        }

        let mut active_id = None;
        for (name, url, active) in DEFAULT_MIRRORS {
            let mirror = MirrorSource::new(name, url, None);
            self.store.save_mirror(&mirror).await?;
            if *active {
                active_id = Some(mirror.id);
            }
        }
        if let Some(id) = active_id {
            self.store.set_active_mirror(&id).await?;
        }

        info!(count = DEFAULT_MIRRORS.len(), "Seeded default mirrors");
        Ok(DEFAULT_MIRRORS.len())
    }
}

fn validate_name(name: &str) -> CoreResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::validation("Mirror name must not be empty"));
    }
    if name.chars().count() > MAX_MIRROR_NAME_LEN {
        return Err(CoreError::validation(format!(
            "Mirror name exceeds {} characters",
            MAX_MIRROR_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn validate_url(url: &str) -> CoreResult<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| CoreError::validation(format!("Mirror URL must start with http:// or https://: '{}'", url)))?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() || url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CoreError::validation(format!("Invalid mirror URL '{}'", url)));
    }
    Ok(url.to_string())
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

fn ensure_unique(
    existing: &[MirrorSource],
    skip_id: Option<&str>,
    name: &str,
    url: &str,
) -> CoreResult<()> {
    for other in existing.iter().filter(|m| Some(m.id.as_str()) != skip_id) {
        if other.name == name {
            return Err(CoreError::validation(format!("Mirror name '{}' already exists", name)));
        }
        if other.url == url {
            return Err(CoreError::validation(format!("Mirror URL '{}' already exists", url)));
        }
    }
    Ok(())
}
