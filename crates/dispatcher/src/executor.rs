use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fangyuan_domain::{
    ScrapeOrchestrator, ScrapeRunResult, TaskDefinition, TaskExecution, TimeoutAction,
};
use fangyuan_infrastructure::ResourceMonitor;

/// 资源准入失败时的固定错误信息
pub const INSUFFICIENT_RESOURCES_MESSAGE: &str = "insufficient system resources";

/// 正在执行实例的登记项
struct ActiveEntry {
    execution: TaskExecution,
    cancel_tx: Option<oneshot::Sender<()>>,
}

enum RunOutcome {
    Completed(ScrapeRunResult),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// 任务执行器
///
/// 每次调用运行一个执行实例：资源准入 -> 带超时的编排器调用 ->
/// 终态落账。编排器调用在独立的异步任务中执行，超时由外部强制，
/// 不依赖任务体配合。
pub struct TaskExecutor {
    resource_monitor: Arc<ResourceMonitor>,
    active: RwLock<HashMap<Uuid, ActiveEntry>>,
    /// graceful超时动作的宽限期
    graceful_grace: Duration,
}

impl TaskExecutor {
    pub fn new(resource_monitor: Arc<ResourceMonitor>) -> Self {
        Self {
            resource_monitor,
            active: RwLock::new(HashMap::new()),
            graceful_grace: Duration::from_secs(30),
        }
    }

    pub fn with_graceful_grace(mut self, grace: Duration) -> Self {
        self.graceful_grace = grace;
        self
    }

    /// 执行一个任务实例直至终态
    ///
    /// 所有失败模式（准入拒绝、超时、异常）都体现为返回实例的
    /// 状态加错误信息，从不向调用方抛出。
    pub async fn execute_task(
        &self,
        mut execution: TaskExecution,
        definition: &TaskDefinition,
        orchestrator: Arc<dyn ScrapeOrchestrator>,
    ) -> TaskExecution {
        let execution_id = execution.execution_id;
        execution.mark_running(Utc::now());

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        {
            let mut active = self.active.write().await;
            active.insert(
                execution_id,
                ActiveEntry {
                    execution: execution.clone(),
                    cancel_tx: Some(cancel_tx),
                },
            );
        }

        info!(
            "开始执行 {} (execution_id={}, 第{}次重试)",
            definition.entity_description(),
            execution_id,
            execution.retry_count
        );

        // 资源准入：不足则直接失败，不触发编排器调用
        if !self
            .resource_monitor
            .check_resource_availability(&definition.resource_limits)
        {
            warn!(
                "任务 {} 因系统资源不足被拒绝执行 (execution_id={})",
                definition.task_id, execution_id
            );
            execution.mark_failed(INSUFFICIENT_RESOURCES_MESSAGE, Utc::now());
            return self.finalize(execution, definition, None).await;
        }

        let deadline = Duration::from_secs(definition.max_execution_time_seconds);
        let outcome = tokio::select! {
            run = tokio::time::timeout(deadline, orchestrator.run()) => match run {
                Ok(Ok(result)) => RunOutcome::Completed(result),
                Ok(Err(e)) => RunOutcome::Failed(e.to_string()),
                Err(_) => RunOutcome::TimedOut,
            },
            _ = &mut cancel_rx => RunOutcome::Cancelled,
        };

        let pid = orchestrator.process_id();
        let now = Utc::now();
        match outcome {
            RunOutcome::Completed(result) => {
                info!(
                    "任务 {} 执行成功 (execution_id={})",
                    definition.task_id, execution_id
                );
                execution.mark_completed(result, now);
            }
            RunOutcome::Failed(message) => {
                warn!(
                    "任务 {} 执行失败 (execution_id={}): {}",
                    definition.task_id, execution_id, message
                );
                execution.mark_failed(message, now);
            }
            RunOutcome::TimedOut => {
                warn!(
                    "任务 {} 执行超时 (execution_id={}, 限制{}秒)",
                    definition.task_id, execution_id, definition.max_execution_time_seconds
                );
                execution.mark_timeout(
                    format!(
                        "任务执行超时: 超过最大执行时间 {} 秒",
                        definition.max_execution_time_seconds
                    ),
                    now,
                );
                if let Some(pid) = pid {
                    self.terminate_process(pid, definition.timeout_action).await;
                }
            }
            RunOutcome::Cancelled => {
                info!(
                    "任务 {} 被取消 (execution_id={})",
                    definition.task_id, execution_id
                );
                execution.mark_cancelled(now);
                if let Some(pid) = pid {
                    self.terminate_process(pid, TimeoutAction::Kill).await;
                }
            }
        }

        self.finalize(execution, definition, pid).await
    }

    /// 终态落账：记录进程资源占用并从活动集中移除
    async fn finalize(
        &self,
        mut execution: TaskExecution,
        definition: &TaskDefinition,
        pid: Option<u32>,
    ) -> TaskExecution {
        if let Some(pid) = pid {
            execution.process_id = Some(pid);
            execution.resource_usage = self
                .resource_monitor
                .monitor_process(pid, &definition.resource_limits);
        }
        self.active.write().await.remove(&execution.execution_id);
        execution
    }

    /// 取消一个正在执行的实例，返回是否发起了取消
    pub async fn cancel_execution(&self, execution_id: Uuid) -> bool {
        let mut active = self.active.write().await;
        match active.get_mut(&execution_id) {
            Some(entry) => match entry.cancel_tx.take() {
                Some(tx) => {
                    debug!("向执行实例 {} 发送取消信号", execution_id);
                    tx.send(()).is_ok()
                }
                None => false, // 已有取消在途
            },
            None => false,
        }
    }

    /// 正在执行实例的快照列表
    pub async fn active_executions(&self) -> Vec<TaskExecution> {
        self.active
            .read()
            .await
            .values()
            .map(|entry| entry.execution.clone())
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// 按timeout_action终止底层工作进程
    ///
    /// kill立即强杀；graceful先请求终止，宽限期后在后台强杀。
    async fn terminate_process(&self, pid: u32, action: TimeoutAction) {
        match action {
            TimeoutAction::Kill => {
                kill_process(pid, true).await;
            }
            TimeoutAction::Graceful => {
                kill_process(pid, false).await;
                let grace = self.graceful_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    kill_process(pid, true).await;
                });
            }
        }
    }
}

#[cfg(unix)]
async fn kill_process(pid: u32, force: bool) {
    let signal = if force { "-KILL" } else { "-TERM" };
    match tokio::process::Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            info!("已向进程 {pid} 发送 {signal} 信号");
        }
        Ok(_) => {
            // 进程可能已经退出
            debug!("kill {signal} {pid} 未生效，进程可能已退出");
        }
        Err(e) => {
            warn!("执行kill命令失败: pid={pid}, error={e}");
        }
    }
}

#[cfg(windows)]
async fn kill_process(pid: u32, _force: bool) {
    match tokio::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output()
        .await
    {
        Ok(_) => info!("已终止进程 {pid}"),
        Err(e) => warn!("执行taskkill命令失败: pid={pid}, error={e}"),
    }
}
