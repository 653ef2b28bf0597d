//! 任务调度核心：队列、执行器、CRON评估与调度循环
//!
//! 入口类型是[`TaskScheduler`]，它组合[`TaskQueue`]（优先级队列）、
//! [`TaskExecutor`]（带超时和资源准入的单实例执行）与CRON评估循环，
//! 通过[`OrchestratorFactory`]把就绪的执行实例交给具体的采集编排器。

pub mod cron_utils;
pub mod executor;
pub mod scheduler;
pub mod task_queue;

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
mod scheduler_test;

pub use cron_utils::{next_execution_times, validate_cron_expression, CronScheduler};
pub use executor::{TaskExecutor, INSUFFICIENT_RESOURCES_MESSAGE};
pub use scheduler::{OrchestratorFactory, TaskScheduler};
pub use task_queue::TaskQueue;
