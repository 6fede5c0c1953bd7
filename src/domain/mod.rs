//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod environment;
pub mod job;
pub mod log;
pub mod mirror;
pub mod requirements;

// Re-exports for convenience
pub use environment::{EnvStatus, VirtualEnvironment};
pub use job::{InstallJob, JobFailure, JobKind, JobState};
pub use log::{LogLine, LogStream};
pub use mirror::{MirrorSource, MirrorUpdate};
