//! 运行时状态模块
//!
//! 管理应用状态、持久化、任务槽位和日志通道

pub mod app_state;
pub mod file_store;
pub mod job_slots;
pub mod log_hub;
pub mod store;

pub use app_state::AppState;
pub use file_store::FileStore;
pub use job_slots::ActiveJobs;
pub use log_hub::{LogChannel, LogHub, LogSubscription};
pub use store::{EnvironmentStore, MemoryStore, StoreResult};
