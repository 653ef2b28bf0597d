use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use rand::Rng;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fangyuan_config::{AppConfig, CityScrapeConfig, SchedulerConfig};
use fangyuan_domain::{
    ExecutionStatus, SchedulerStats, ScrapeOrchestrator, TaskDefinition, TaskExecution,
    TaskPriority,
};
use fangyuan_errors::{SchedulerError, SchedulerResult};
use fangyuan_infrastructure::ResourceMonitor;
use fangyuan_observability::{AlertManager, AlertSeverity, MetricsCollector};

use crate::cron_utils::CronScheduler;
use crate::executor::TaskExecutor;
use crate::task_queue::TaskQueue;

/// 执行历史保留上限，防止长期运行时无界增长
const HISTORY_LIMIT: usize = 10_000;
/// 统计计算最多回看的历史条数
const STATS_WINDOW_ENTRIES: usize = 100;

/// 按城市构建采集编排器的工厂
pub trait OrchestratorFactory: Send + Sync {
    fn build(
        &self,
        city_config: &CityScrapeConfig,
        execution: &TaskExecution,
    ) -> SchedulerResult<Arc<dyn ScrapeOrchestrator>>;
}

struct SchedulerInner {
    config: AppConfig,
    definitions: RwLock<HashMap<String, TaskDefinition>>,
    queue: TaskQueue,
    executor: TaskExecutor,
    resource_monitor: Arc<ResourceMonitor>,
    orchestrator_factory: Arc<dyn OrchestratorFactory>,
    metrics: Arc<MetricsCollector>,
    alerts: Arc<AlertManager>,
    /// 并发上限的原子准入：许可在分发前获取，随执行任务结束释放
    concurrency: Arc<Semaphore>,
    history: RwLock<Vec<TaskExecution>>,
    /// 每个任务最近一次入队的到期时间点，用于防止同一CRON时刻重复入队
    last_scheduled: RwLock<HashMap<String, chrono::DateTime<Utc>>>,
    stats: RwLock<SchedulerStats>,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// 任务调度器：核心协调者
///
/// 持有任务定义，驱动调度循环（CRON评估 -> 入队）和执行循环
/// （出队 -> 分发给TaskExecutor），管理指数退避重试，计算聚合统计，
/// 并提供start/stop/emergency-stop生命周期控制。
///
/// 所有可变状态归该实例所有；`start()`时安装的信号处理闭包只捕获
/// 本实例，同一进程内的多个调度器（例如测试中）互不干扰。
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(config: AppConfig, orchestrator_factory: Arc<dyn OrchestratorFactory>) -> Self {
        let resource_monitor = Arc::new(ResourceMonitor::new().with_default_limits(
            config.resources.cpu_percent,
            config.resources.memory_percent,
            config.resources.disk_percent,
        ));
        Self::with_components(
            config,
            orchestrator_factory,
            resource_monitor,
            Arc::new(MetricsCollector::new()),
            Arc::new(AlertManager::new()),
        )
    }

    /// 注入各组件的构造方式，测试时可替换资源采样等
    pub fn with_components(
        config: AppConfig,
        orchestrator_factory: Arc<dyn OrchestratorFactory>,
        resource_monitor: Arc<ResourceMonitor>,
        metrics: Arc<MetricsCollector>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let grace =
            std::time::Duration::from_secs(config.scheduler.graceful_kill_grace_seconds);
        let executor =
            TaskExecutor::new(Arc::clone(&resource_monitor)).with_graceful_grace(grace);
        let concurrency = Arc::new(Semaphore::new(config.scheduler.max_concurrent_tasks));
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                definitions: RwLock::new(HashMap::new()),
                queue: TaskQueue::new(),
                executor,
                resource_monitor,
                orchestrator_factory,
                metrics,
                alerts,
                concurrency,
                history: RwLock::new(Vec::new()),
                last_scheduled: RwLock::new(HashMap::new()),
                stats: RwLock::new(SchedulerStats::default()),
                running: AtomicBool::new(false),
                shutdown_tx: Mutex::new(None),
                loop_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    // ---- 任务定义管理 ----

    /// 添加任务定义，CRON表达式无效时拒绝
    pub async fn add_task(&self, definition: TaskDefinition) -> SchedulerResult<()> {
        CronScheduler::new(&definition.cron_expression)?;
        let mut definitions = self.inner.definitions.write().await;
        if definitions
            .insert(definition.task_id.clone(), definition.clone())
            .is_some()
        {
            warn!("任务定义被替换: {}", definition.task_id);
        } else {
            info!("已添加{}", definition.entity_description());
        }
        Ok(())
    }

    pub async fn remove_task(&self, task_id: &str) -> bool {
        let removed = self.inner.definitions.write().await.remove(task_id);
        if removed.is_some() {
            info!("已移除任务定义: {task_id}");
        }
        removed.is_some()
    }

    pub async fn enable_task(&self, task_id: &str) -> SchedulerResult<()> {
        self.set_enabled(task_id, true).await
    }

    /// 停用任务：调度循环跳过它，但定义保留
    pub async fn disable_task(&self, task_id: &str) -> SchedulerResult<()> {
        self.set_enabled(task_id, false).await
    }

    async fn set_enabled(&self, task_id: &str, enabled: bool) -> SchedulerResult<()> {
        let mut definitions = self.inner.definitions.write().await;
        let definition = definitions
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::task_not_found(task_id))?;
        definition.enabled = enabled;
        info!(
            "任务 {} 已{}",
            task_id,
            if enabled { "启用" } else { "停用" }
        );
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskDefinition> {
        self.inner.definitions.read().await.get(task_id).cloned()
    }

    pub async fn list_tasks(&self) -> Vec<TaskDefinition> {
        self.inner.definitions.read().await.values().cloned().collect()
    }

    // ---- 立即分发 ----

    /// 跳过CRON评估，立即创建一个就绪的执行实例入队
    pub async fn schedule_task_now(
        &self,
        task_id: &str,
        priority_override: Option<TaskPriority>,
    ) -> SchedulerResult<Uuid> {
        let definition = self
            .get_task(task_id)
            .await
            .ok_or_else(|| SchedulerError::task_not_found(task_id))?;

        let mut execution = TaskExecution::new(task_id, Utc::now());
        execution.node_id = Some(self.inner.config.scheduler.node_id.clone());
        let execution_id = execution.execution_id;
        let priority = priority_override.unwrap_or(definition.priority);

        self.inner.queue.put(execution, priority).await;
        self.inner.metrics.record_task_scheduled();
        info!("任务 {task_id} 已手动入队 (execution_id={execution_id})");
        Ok(execution_id)
    }

    // ---- 生命周期 ----

    /// 启动调度循环与执行循环，幂等：已在运行时告警并跳过
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("调度器已在运行，忽略重复的start调用");
            return;
        }
        info!(
            "启动任务调度器 (node_id={}, 并发上限={})",
            self.inner.config.scheduler.node_id, self.inner.config.scheduler.max_concurrent_tasks
        );

        let (shutdown_tx, _) = broadcast::channel(8);
        let mut handles = Vec::new();

        {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                run_scheduling_loop(inner, shutdown_rx).await;
            }));
        }
        {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                run_execution_loop(inner, shutdown_rx).await;
            }));
        }
        {
            // 信号处理只捕获本实例，进程内多个调度器互不影响
            let inner = Arc::clone(&self.inner);
            let mut shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = wait_for_termination_signal() => {
                        info!("收到终止信号，触发优雅关闭");
                        request_shutdown(&inner).await;
                    }
                    _ = shutdown_rx.recv() => {}
                }
            }));
        }

        *self.inner.shutdown_tx.lock().await = Some(shutdown_tx);
        *self.inner.loop_handles.lock().await = handles;
    }

    /// 停止两个循环并取消仍在执行的实例，幂等
    pub async fn stop(&self, timeout: std::time::Duration) {
        if !self.inner.running.load(Ordering::SeqCst) {
            debug!("调度器未在运行，stop为空操作");
            return;
        }
        info!("停止任务调度器");
        request_shutdown(&self.inner).await;

        // 全部循环共享同一个截止时刻，总等待不超过一个timeout
        let deadline = tokio::time::Instant::now() + timeout;
        let handles = std::mem::take(&mut *self.inner.loop_handles.lock().await);
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("等待循环退出超时");
            }
        }

        for execution in self.inner.executor.active_executions().await {
            self.inner
                .executor
                .cancel_execution(execution.execution_id)
                .await;
        }
        info!("任务调度器已停止");
    }

    /// 紧急停止：取消全部活动实例，无条件丢弃队列中的全部待执行实例
    ///
    /// 这是唯一会无条件丢弃排队工作的操作。
    pub async fn emergency_stop_all(&self) {
        error!("触发紧急停止");
        request_shutdown(&self.inner).await;

        let active = self.inner.executor.active_executions().await;
        let active_count = active.len();
        for execution in active {
            self.inner
                .executor
                .cancel_execution(execution.execution_id)
                .await;
        }

        let drained = self.inner.queue.drain().await;
        let drained_count = drained.len();
        {
            let now = Utc::now();
            let mut history = self.inner.history.write().await;
            for mut execution in drained {
                execution.mark_cancelled(now);
                history.push(execution);
            }
        }

        self.inner
            .alerts
            .fire(
                "emergency_stop",
                format!(
                    "紧急停止: 取消了{active_count}个活动实例，丢弃了{drained_count}个排队实例"
                ),
                AlertSeverity::Critical,
            )
            .await;
        update_stats(&self.inner).await;
    }

    /// 取消一个执行实例：先尝试从队列移除，不在队列则委托给执行器
    pub async fn cancel_execution(&self, execution_id: Uuid) -> bool {
        if self.inner.queue.remove_task(execution_id).await {
            info!("已从队列移除执行实例 {execution_id}");
            return true;
        }
        self.inner.executor.cancel_execution(execution_id).await
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ---- 观测 ----

    /// 基于当前状态重算并返回统计快照
    pub async fn get_stats(&self) -> SchedulerStats {
        update_stats(&self.inner).await;
        self.inner.stats.read().await.clone()
    }

    pub async fn execution_history(&self) -> Vec<TaskExecution> {
        self.inner.history.read().await.clone()
    }

    pub async fn queue_size(&self) -> usize {
        self.inner.queue.size().await
    }

    pub async fn pending_executions(&self) -> Vec<TaskExecution> {
        self.inner.queue.pending_tasks().await
    }

    pub async fn active_executions(&self) -> Vec<TaskExecution> {
        self.inner.executor.active_executions().await
    }

    #[cfg(test)]
    pub(crate) async fn complete_for_test(
        &self,
        execution: TaskExecution,
        definition: &TaskDefinition,
    ) {
        handle_execution_completed(&self.inner, execution, definition).await;
    }

    #[cfg(test)]
    pub(crate) async fn inject_loop_handle_for_test(&self, handle: JoinHandle<()>) {
        self.inner.loop_handles.lock().await.push(handle);
    }
}

async fn request_shutdown(inner: &Arc<SchedulerInner>) {
    inner.running.store(false, Ordering::SeqCst);
    if let Some(tx) = inner.shutdown_tx.lock().await.take() {
        let _ = tx.send(());
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("安装SIGTERM处理器失败: {e}");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// 调度循环：周期性评估每个启用任务的CRON表达式，到期则入队
async fn run_scheduling_loop(inner: Arc<SchedulerInner>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("调度循环已启动");
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(
        inner.config.scheduler.schedule_poll_interval_seconds,
    ));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let started = Instant::now();
                evaluate_schedules(&inner).await;
                inner
                    .metrics
                    .record_scheduling_duration(started.elapsed().as_secs_f64());
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    info!("调度循环已退出");
}

/// 评估全部任务定义；单个任务的评估错误只记录日志，不中断其余任务
async fn evaluate_schedules(inner: &Arc<SchedulerInner>) {
    let definitions: Vec<TaskDefinition> = inner
        .definitions
        .read()
        .await
        .values()
        .filter(|d| d.enabled)
        .cloned()
        .collect();

    for definition in definitions {
        if let Err(e) = evaluate_one_schedule(inner, &definition).await {
            error!("评估任务 {} 的调度失败: {e}", definition.task_id);
        }
    }

    inner.metrics.set_queue_depth(inner.queue.size().await);
    let usage = inner.resource_monitor.current_usage();
    if let (Some(cpu), Some(memory)) = (usage.get("cpu_percent"), usage.get("memory_percent")) {
        inner.metrics.record_system_usage(*cpu, *memory);
    }
}

async fn evaluate_one_schedule(
    inner: &Arc<SchedulerInner>,
    definition: &TaskDefinition,
) -> SchedulerResult<()> {
    let cron = CronScheduler::new(&definition.cron_expression)?;
    let now = Utc::now();
    let tolerance = Duration::seconds(inner.config.scheduler.cron_tolerance_seconds as i64);

    let Some(due_time) = cron.due_within(now, tolerance) else {
        return Ok(());
    };

    // 同一到期时刻只入队一次
    {
        let mut last_scheduled = inner.last_scheduled.write().await;
        match last_scheduled.get(&definition.task_id) {
            Some(last) if *last >= due_time => return Ok(()),
            _ => {
                last_scheduled.insert(definition.task_id.clone(), due_time);
            }
        }
    }

    let mut execution = TaskExecution::new(definition.task_id.clone(), due_time);
    execution.node_id = Some(inner.config.scheduler.node_id.clone());
    info!(
        "任务 {} 到期入队 (execution_id={}, 计划时间={}, 频率={})",
        definition.task_id,
        execution.execution_id,
        due_time.format("%Y-%m-%d %H:%M:%S UTC"),
        cron.frequency_description()
    );
    inner.queue.put(execution, definition.priority).await;
    inner.metrics.record_task_scheduled();
    Ok(())
}

/// 执行循环：取出就绪实例并异步分发，单个实例的问题不影响循环
async fn run_execution_loop(inner: Arc<SchedulerInner>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("执行循环已启动");
    let poll_interval =
        std::time::Duration::from_millis(inner.config.scheduler.execution_poll_interval_ms);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {
                while let Some(execution) = inner.queue.get().await {
                    dispatch_execution(&inner, execution).await;
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    info!("执行循环已退出");
}

/// 分发一个就绪实例：并发限流 -> 城市配置匹配 -> 构建编排器 -> 异步执行
async fn dispatch_execution(inner: &Arc<SchedulerInner>, execution: TaskExecution) {
    let Some(definition) = inner
        .definitions
        .read()
        .await
        .get(&execution.task_id)
        .cloned()
    else {
        warn!(
            "丢弃执行实例 {}: 任务定义 {} 不存在",
            execution.execution_id, execution.task_id
        );
        return;
    };

    if !definition.enabled {
        warn!(
            "丢弃执行实例 {}: 任务 {} 已停用",
            execution.execution_id, execution.task_id
        );
        return;
    }

    // 并发许可在spawn之前获取，同一轮排出的多个就绪实例无法挤过上限；
    // 饱和时延后一分钟重新入队，不阻塞后续就绪实例
    let permit = match Arc::clone(&inner.concurrency).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            debug!(
                "并发已达上限 ({}), 执行实例 {} 延后一分钟",
                inner.config.scheduler.max_concurrent_tasks, execution.execution_id
            );
            let mut deferred = execution;
            deferred.scheduled_time = Utc::now() + Duration::minutes(1);
            inner.queue.put(deferred, definition.priority).await;
            return;
        }
    };

    let city = match definition.city.as_deref() {
        Some(city) => city,
        None => {
            fail_dispatch(inner, execution, &definition, "任务未指定目标城市".to_string()).await;
            return;
        }
    };
    let Some(city_config) = inner.config.city_config(city) else {
        fail_dispatch(
            inner,
            execution,
            &definition,
            format!("城市未配置采集参数: {city}"),
        )
        .await;
        return;
    };

    let orchestrator = match inner.orchestrator_factory.build(city_config, &execution) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            fail_dispatch(inner, execution, &definition, format!("构建编排器失败: {e}")).await;
            return;
        }
    };

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        // 许可跟随执行任务存活，终态处理完成后释放并发额度
        let _permit = permit;
        let terminal = inner
            .executor
            .execute_task(execution, &definition, orchestrator)
            .await;
        handle_execution_completed(&inner, terminal, &definition).await;
    });
}

/// 分发失败：不经过执行器，直接标记失败并走统一的完成处理
async fn fail_dispatch(
    inner: &Arc<SchedulerInner>,
    mut execution: TaskExecution,
    definition: &TaskDefinition,
    message: String,
) {
    error!(
        "分发执行实例 {} 失败: {message}",
        execution.execution_id
    );
    execution.mark_failed(message, Utc::now());
    handle_execution_completed(inner, execution, definition).await;
}

/// 每个终态实例恰好经过一次：历史归档、指标、告警、重试调度、统计刷新
async fn handle_execution_completed(
    inner: &Arc<SchedulerInner>,
    execution: TaskExecution,
    definition: &TaskDefinition,
) {
    match execution.status {
        ExecutionStatus::Completed => {
            inner
                .metrics
                .record_execution_completed(execution.duration_seconds());
        }
        ExecutionStatus::Failed => {
            inner.metrics.record_execution_failed();
            inner
                .alerts
                .fire(
                    "task_failed",
                    format!(
                        "任务 {} 执行失败 (execution_id={}): {}",
                        execution.task_id,
                        execution.execution_id,
                        execution.error_message.as_deref().unwrap_or("未知错误")
                    ),
                    AlertSeverity::Medium,
                )
                .await;
        }
        ExecutionStatus::Timeout => {
            inner.metrics.record_execution_timeout();
            inner
                .alerts
                .fire(
                    "task_timeout",
                    format!(
                        "任务 {} 执行超时 (execution_id={}): {}",
                        execution.task_id,
                        execution.execution_id,
                        execution.error_message.as_deref().unwrap_or("")
                    ),
                    AlertSeverity::High,
                )
                .await;
        }
        _ => {}
    }

    let should_retry = matches!(
        execution.status,
        ExecutionStatus::Failed | ExecutionStatus::Timeout
    ) && execution.retry_count < definition.max_retries;

    if should_retry {
        schedule_retry(inner, &execution, definition).await;
    }

    {
        let mut history = inner.history.write().await;
        history.push(execution);
        let overflow = history.len().saturating_sub(HISTORY_LIMIT);
        if overflow > 0 {
            history.drain(..overflow);
        }
    }

    inner.metrics.set_queue_depth(inner.queue.size().await);
    inner
        .metrics
        .set_active_executions(inner.executor.active_count().await);
    update_stats(inner).await;
}

/// 指数退避重试：delay = retry_delay * multiplier^retry_count，带上限和可选抖动
async fn schedule_retry(
    inner: &Arc<SchedulerInner>,
    failed: &TaskExecution,
    definition: &TaskDefinition,
) {
    let delay = compute_retry_delay(&inner.config.scheduler, definition, failed.retry_count);
    let retry_time = Utc::now() + delay;
    let retry = TaskExecution::retry_of(failed, retry_time);

    info!(
        "为任务 {} 调度第{}次重试 (execution_id={}, 延迟{}秒, 计划时间={})",
        definition.task_id,
        retry.retry_count,
        retry.execution_id,
        delay.num_seconds(),
        retry_time.format("%Y-%m-%d %H:%M:%S UTC")
    );

    inner.queue.put(retry, definition.priority).await;
    inner.metrics.record_retry_scheduled();
}

fn compute_retry_delay(
    config: &SchedulerConfig,
    definition: &TaskDefinition,
    retry_count: u32,
) -> Duration {
    let base = definition.retry_delay_seconds as f64;
    let mut delay = base * config.retry_backoff_multiplier.powi(retry_count as i32);
    delay = delay.min(config.retry_max_delay_seconds as f64);

    if config.retry_jitter_factor > 0.0 {
        let jitter = rand::rng()
            .random_range(-config.retry_jitter_factor..=config.retry_jitter_factor);
        delay *= 1.0 + jitter;
    }

    Duration::milliseconds((delay * 1000.0) as i64)
}

/// 重算聚合统计：活跃/排队数来自实时结构，完成/失败率来自
/// 最近24小时（至多最近100条）的执行历史；空历史得到零值统计
async fn update_stats(inner: &Arc<SchedulerInner>) {
    let total_tasks = inner.definitions.read().await.len();
    let active_tasks = inner.executor.active_count().await;
    let queued_tasks = inner.queue.size().await;

    let window_start = Utc::now() - Duration::hours(24);
    let history = inner.history.read().await;
    let recent: Vec<&TaskExecution> = history
        .iter()
        .rev()
        .take(STATS_WINDOW_ENTRIES)
        .filter(|e| e.completed_time.is_some_and(|t| t >= window_start))
        .collect();

    let completed_tasks_24h = recent
        .iter()
        .filter(|e| e.status == ExecutionStatus::Completed)
        .count();
    let failed_tasks_24h = recent
        .iter()
        .filter(|e| matches!(e.status, ExecutionStatus::Failed | ExecutionStatus::Timeout))
        .count();

    let durations: Vec<f64> = recent
        .iter()
        .filter(|e| e.status == ExecutionStatus::Completed)
        .filter_map(|e| e.duration_seconds())
        .collect();
    let avg_execution_time_seconds = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    let finished = completed_tasks_24h + failed_tasks_24h;
    let success_rate = if finished == 0 {
        0.0
    } else {
        completed_tasks_24h as f64 / finished as f64
    };

    let last_execution = recent.iter().filter_map(|e| e.completed_time).max();
    drop(history);

    let mut stats = inner.stats.write().await;
    *stats = SchedulerStats {
        total_tasks,
        active_tasks,
        queued_tasks,
        completed_tasks_24h,
        failed_tasks_24h,
        avg_execution_time_seconds,
        success_rate,
        last_execution,
    };
}
