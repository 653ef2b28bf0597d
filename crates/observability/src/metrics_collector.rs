use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

/// 调度器指标的统一句柄注册表
///
/// 全部序列在构造时注册一次，记录操作无锁。
pub struct MetricsCollector {
    // 任务指标
    task_executions_total: Counter,
    task_failures_total: Counter,
    task_timeouts_total: Counter,
    task_retries_total: Counter,
    task_execution_duration: Histogram,

    // 队列/分发指标
    queue_depth: Gauge,
    active_executions: Gauge,
    scheduling_duration: Histogram,
    tasks_scheduled_total: Counter,

    // 系统资源指标
    system_cpu_usage: Gauge,
    system_memory_usage: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            task_executions_total: counter!("fangyuan_task_executions_total"),
            task_failures_total: counter!("fangyuan_task_failures_total"),
            task_timeouts_total: counter!("fangyuan_task_timeouts_total"),
            task_retries_total: counter!("fangyuan_task_retries_total"),
            task_execution_duration: histogram!("fangyuan_task_execution_duration_seconds"),
            queue_depth: gauge!("fangyuan_queue_depth"),
            active_executions: gauge!("fangyuan_active_executions"),
            scheduling_duration: histogram!("fangyuan_scheduling_duration_seconds"),
            tasks_scheduled_total: counter!("fangyuan_tasks_scheduled_total"),
            system_cpu_usage: gauge!("fangyuan_system_cpu_usage_percent"),
            system_memory_usage: gauge!("fangyuan_system_memory_usage_percent"),
        }
    }

    pub fn record_execution_completed(&self, duration_seconds: Option<f64>) {
        self.task_executions_total.increment(1);
        if let Some(duration) = duration_seconds {
            self.task_execution_duration.record(duration);
        }
    }

    pub fn record_execution_failed(&self) {
        self.task_executions_total.increment(1);
        self.task_failures_total.increment(1);
    }

    pub fn record_execution_timeout(&self) {
        self.task_executions_total.increment(1);
        self.task_timeouts_total.increment(1);
    }

    pub fn record_retry_scheduled(&self) {
        self.task_retries_total.increment(1);
    }

    pub fn record_task_scheduled(&self) {
        self.tasks_scheduled_total.increment(1);
    }

    pub fn record_scheduling_duration(&self, seconds: f64) {
        self.scheduling_duration.record(seconds);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn set_active_executions(&self, count: usize) {
        self.active_executions.set(count as f64);
    }

    pub fn record_system_usage(&self, cpu_percent: f64, memory_percent: f64) {
        self.system_cpu_usage.set(cpu_percent);
        self.system_memory_usage.set(memory_percent);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
