//! 虚拟环境领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 环境状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    /// 已登记，创建子进程尚未成功
    Uninitialized,
    Ready,
    Installing,
    Error,
}

impl EnvStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvStatus::Uninitialized => "uninitialized",
            EnvStatus::Ready => "ready",
            EnvStatus::Installing => "installing",
            EnvStatus::Error => "error",
        }
    }
}

/// 虚拟环境
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualEnvironment {
    pub id: String,
    pub name: String,
    pub python_version: String,
    pub path: PathBuf,
    /// 声明的依赖，保持顺序
    pub dependencies: Vec<String>,
    pub status: EnvStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VirtualEnvironment {
    /// 创建未初始化的环境记录，路径为 `<root>/<name>_<8 位随机串>`
    pub fn new(name: &str, python_version: &str, dependencies: Vec<String>, env_root: &Path) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = env_root.join(format!("{}_{}", name, &id[..8]));
        let now = Utc::now();
        Self {
            id,
            name: name.to_string(),
            python_version: python_version.to_string(),
            path,
            dependencies,
            status: EnvStatus::Uninitialized,
            created_at: now,
            updated_at: now,
        }
    }

    /// 环境内的解释器路径
    pub fn python_path(&self) -> PathBuf {
        #[cfg(windows)]
        {
            self.path.join("Scripts").join("python.exe")
        }
        #[cfg(not(windows))]
        {
            self.path.join("bin").join("python")
        }
    }

    /// 更新状态
    pub fn set_status(&mut self, status: EnvStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
