//! 镜像源领域模型

use serde::{Deserialize, Serialize};

/// 包索引镜像源
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorSource {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

impl MirrorSource {
    pub fn new(name: &str, url: &str, description: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            url: url.to_string(),
            description,
            is_active: false,
        }
    }
}

/// 镜像源部分更新
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MirrorUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
}

/// 首次启动时写入的默认镜像源 (name, url, active)
pub const DEFAULT_MIRRORS: &[(&str, &str, bool)] = &[
    ("pypi", "https://pypi.org/simple", false),
    ("aliyun", "https://mirrors.aliyun.com/pypi/simple/", true),
    ("tsinghua", "https://pypi.tuna.tsinghua.edu.cn/simple/", false),
];
