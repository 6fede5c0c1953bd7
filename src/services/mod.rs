//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod environment;
pub mod install;
pub mod mirror;

#[cfg(all(test, unix))]
pub(crate) mod testing;

pub use environment::{EnvironmentManager, Submission};
pub use install::InstallJobRunner;
pub use mirror::MirrorRegistry;
