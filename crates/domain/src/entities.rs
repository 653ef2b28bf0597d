use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务优先级，数值越大优先级越高
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// 超时后的处理动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeoutAction {
    /// 立即强制终止进程
    #[serde(rename = "kill")]
    Kill,
    /// 先请求终止，宽限期后再强制终止
    #[serde(rename = "graceful")]
    Graceful,
}

impl Default for TimeoutAction {
    fn default() -> Self {
        TimeoutAction::Graceful
    }
}

/// 周期性采集任务的静态定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    pub name: String,
    pub cron_expression: String, // 标准5字段CRON表达式
    pub task_type: String,       // "daily_scrape", "cleanup", etc.
    pub city: Option<String>,
    pub enabled: bool,
    pub priority: TaskPriority,
    pub max_execution_time_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub timeout_action: TimeoutAction,
    pub resource_limits: HashMap<String, f64>,
    pub metadata: HashMap<String, String>,
}

impl TaskDefinition {
    pub fn new<S: Into<String>>(task_id: S, name: S, cron_expression: S, task_type: S) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            task_type: task_type.into(),
            city: None,
            enabled: true,
            priority: TaskPriority::Normal,
            max_execution_time_seconds: 3600, // 默认1小时超时
            max_retries: 3,
            retry_delay_seconds: 300, // 默认5分钟重试基数
            timeout_action: TimeoutAction::Graceful,
            resource_limits: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
    pub fn with_city<S: Into<String>>(mut self, city: S) -> Self {
        self.city = Some(city.into());
        self
    }
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
    pub fn entity_description(&self) -> String {
        format!(
            "任务 '{}' (ID: {}, 类型: {})",
            self.name, self.task_id, self.task_type
        )
    }
}

/// 执行实例状态机
///
/// PENDING/QUEUED -> RUNNING -> {COMPLETED | FAILED | TIMEOUT | CANCELLED}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }
}

/// 一次具体采集运行的结构化结果，由采集编排器产出
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeRunResult {
    pub execution_id: String,
    pub city: String,
    pub status: String,
    pub discovered: u64,
    pub processed: u64,
    pub new_listings: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub duration_seconds: f64,
    pub error_summary: Option<String>,
}

/// 一次已调度/运行中/已结束的任务执行实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub execution_id: Uuid,
    pub task_id: String,
    pub status: ExecutionStatus,
    pub scheduled_time: DateTime<Utc>, // 创建后不可变
    pub started_time: Option<DateTime<Utc>>,
    pub completed_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub result: Option<ScrapeRunResult>,
    pub error_message: Option<String>,
    pub resource_usage: HashMap<String, f64>,
    pub process_id: Option<u32>,
    pub node_id: Option<String>,
}

impl TaskExecution {
    pub fn new<S: Into<String>>(task_id: S, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            task_id: task_id.into(),
            status: ExecutionStatus::Queued,
            scheduled_time,
            started_time: None,
            completed_time: None,
            next_retry_time: None,
            retry_count: 0,
            result: None,
            error_message: None,
            resource_usage: HashMap::new(),
            process_id: None,
            node_id: None,
        }
    }

    /// 基于失败实例创建重试实例：新的execution_id，重试计数加一
    pub fn retry_of(original: &TaskExecution, scheduled_time: DateTime<Utc>) -> Self {
        let mut retry = Self::new(original.task_id.clone(), scheduled_time);
        retry.retry_count = original.retry_count + 1;
        retry.next_retry_time = Some(scheduled_time);
        retry.node_id = original.node_id.clone();
        retry
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time <= now
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        if matches!(self.status, ExecutionStatus::Pending | ExecutionStatus::Queued) {
            self.status = ExecutionStatus::Running;
            self.started_time = Some(now);
        }
    }

    pub fn mark_completed(&mut self, result: ScrapeRunResult, now: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = ExecutionStatus::Completed;
            self.result = Some(result);
            self.finish(now);
        }
    }

    pub fn mark_failed<S: Into<String>>(&mut self, message: S, now: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = ExecutionStatus::Failed;
            self.error_message = Some(message.into());
            self.finish(now);
        }
    }

    pub fn mark_timeout<S: Into<String>>(&mut self, message: S, now: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = ExecutionStatus::Timeout;
            self.error_message = Some(message.into());
            self.finish(now);
        }
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = ExecutionStatus::Cancelled;
            self.finish(now);
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        if self.completed_time.is_none() {
            self.completed_time = Some(now);
        }
    }

    /// 本次执行耗时（秒），未结束的实例返回None
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_time, self.completed_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// 调度器聚合统计快照，按需重算，不单独持有状态
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub completed_tasks_24h: usize,
    pub failed_tasks_24h: usize,
    pub avg_execution_time_seconds: f64,
    pub success_rate: f64,
    pub last_execution: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_execution_state_machine() {
        let now = Utc::now();
        let mut execution = TaskExecution::new("daily_scrape_beijing", now);
        assert_eq!(execution.status, ExecutionStatus::Queued);

        execution.mark_running(now);
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert!(execution.started_time.is_some());

        execution.mark_failed("网络错误", now);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.completed_time.is_some());

        // 终态不可再迁移
        let completed_at = execution.completed_time;
        execution.mark_cancelled(Utc::now());
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.completed_time, completed_at);
    }

    #[test]
    fn test_retry_instance() {
        let now = Utc::now();
        let mut original = TaskExecution::new("daily_scrape_beijing", now);
        original.mark_running(now);
        original.mark_failed("超时", now);

        let retry_at = now + chrono::Duration::seconds(600);
        let retry = TaskExecution::retry_of(&original, retry_at);
        assert_ne!(retry.execution_id, original.execution_id);
        assert_eq!(retry.task_id, original.task_id);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.scheduled_time, retry_at);
        assert_eq!(retry.status, ExecutionStatus::Queued);
    }

    #[test]
    fn test_is_ready() {
        let now = Utc::now();
        let future = TaskExecution::new("t1", now + chrono::Duration::minutes(5));
        assert!(!future.is_ready(now));
        let past = TaskExecution::new("t1", now - chrono::Duration::minutes(5));
        assert!(past.is_ready(now));
    }
}
