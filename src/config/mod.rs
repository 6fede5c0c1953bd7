//! 配置模块
//!
//! 环境变量解析与配置管理

pub mod env;

pub use env::{EnvConfig, ProvisionConfig};
