//! 基础设施模块
//!
//! 封装外部依赖（子进程执行、运行时发现）

pub mod command;
pub mod runtime;

pub use command::{CommandError, CommandRunner, CommandSpec, OutputLine, ProcessExit, ProcessHandle};
pub use runtime::RuntimeLocator;
