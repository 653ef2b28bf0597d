//! 采集编排器实现：把城市采集委托给外部采集器子进程

pub mod subprocess;

pub use subprocess::{SubprocessOrchestrator, SubprocessOrchestratorFactory};
