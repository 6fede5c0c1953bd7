//! Python 运行时发现
//!
//! 按版本号查找解释器：
//! 1. 托管目录 `<versions_root>/python-<version>/bin/python3`（或 `bin/python`）
//! 2. 可选：`PATH` 中的 `python<major>.<minor>`，通过 `--version` 校验完整版本号

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::command::CommandRunner;

/// 版本探测命令超时
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// 运行时定位器
#[derive(Debug, Clone)]
pub struct RuntimeLocator {
    versions_root: PathBuf,
    search_path: bool,
}

impl RuntimeLocator {
    pub fn new(versions_root: impl Into<PathBuf>, search_path: bool) -> Self {
        Self {
            versions_root: versions_root.into(),
            search_path,
        }
    }

    /// 托管运行时目录
    pub fn versions_root(&self) -> &Path {
        &self.versions_root
    }

    /// 查找指定版本的解释器
    pub async fn locate(&self, version: &str) -> Option<PathBuf> {
        if !is_version_string(version) {
            return None;
        }

        let install_dir = self.versions_root.join(format!("python-{}", version));
        for name in ["python3", "python"] {
            let candidate = install_dir.join("bin").join(name);
            if is_executable(&candidate) {
                return Some(candidate);
            }
        }

        if self.search_path {
            return self.locate_on_path(version).await;
        }
        None
    }

    /// 列出托管目录中已安装的版本（按版本号降序）
    pub async fn available_versions(&self) -> Vec<String> {
        let mut versions = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.versions_root).await else {
            return versions;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(version) = name.strip_prefix("python-") else {
                continue;
            };
            if is_version_string(version) && self.locate(version).await.is_some() {
                versions.push(version.to_string());
            }
        }
        versions.sort_by(|a, b| version_key(b).cmp(&version_key(a)));
        versions
    }

    async fn locate_on_path(&self, version: &str) -> Option<PathBuf> {
        let mut parts = version.split('.');
        let major = parts.next()?;
        let minor = parts.next()?;
        let exe = format!("python{}.{}", major, minor);

        let path_var = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(&exe);
            if !is_executable(&candidate) {
                continue;
            }
            match CommandRunner::run_simple(&candidate, &["--version"], VERSION_PROBE_TIMEOUT).await {
                Ok(output) if output.status.success() => {
                    // 旧版本解释器把版本号输出到 stderr
                    let text = format!(
                        "{}{}",
                        String::from_utf8_lossy(&output.stdout),
                        String::from_utf8_lossy(&output.stderr)
                    );
                    if version_matches(&text, version) {
                        return Some(candidate);
                    }
                    debug!(candidate = %candidate.display(), reported = %text.trim(), "Version mismatch");
                }
                Ok(_) => {}
                Err(e) => debug!(candidate = %candidate.display(), error = %e, "Version probe failed"),
            }
        }
        None
    }
}

/// 形如 `3`、`3.9`、`3.9.21` 的版本号
fn is_version_string(version: &str) -> bool {
    !version.is_empty()
        && version.split('.').count() <= 3
        && version
            .split('.')
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn version_key(version: &str) -> Vec<u64> {
    version.split('.').filter_map(|p| p.parse().ok()).collect()
}

/// `Python 3.9.21` 是否满足请求的版本（请求 `3.9` 时匹配任意补丁版本）
fn version_matches(reported: &str, requested: &str) -> bool {
    let Some(actual) = reported.split_whitespace().nth(1) else {
        return false;
    };
    actual == requested || actual.starts_with(&format!("{}.", requested))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
