use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};

use fangyuan_config::CityScrapeConfig;
use fangyuan_domain::{ScrapeOrchestrator, ScrapeRunResult, TaskExecution};
use fangyuan_errors::{SchedulerError, SchedulerResult};
use fangyuan_dispatcher::scheduler::OrchestratorFactory;

/// 子进程采集编排器
///
/// 把一次城市采集委托给外部采集器进程，约定：采集器把结构化的
/// 运行结果作为最后一行JSON写到stdout，退出码0表示采集完成。
/// 进程ID在spawn后立即登记，供执行器做超时/取消时的进程控制。
///
/// 子进程的生命周期绑定在一个独立的tokio任务上：`run()`在超时或
/// 取消时被丢弃不会连带杀死子进程，终止始终由执行器按PID发起，
/// graceful动作的TERM->宽限->KILL语义因此得以保留。
pub struct SubprocessOrchestrator {
    command: String,
    args: Vec<String>,
    city: String,
    pid: Arc<Mutex<Option<u32>>>,
}

impl SubprocessOrchestrator {
    pub fn new<S: Into<String>>(command: S, args: Vec<String>, city: S) -> Self {
        Self {
            command: command.into(),
            args,
            city: city.into(),
            pid: Arc::new(Mutex::new(None)),
        }
    }

    fn set_pid(&self, pid: Option<u32>) {
        if let Ok(mut slot) = self.pid.lock() {
            *slot = pid;
        }
    }
}

#[async_trait]
impl ScrapeOrchestrator for SubprocessOrchestrator {
    async fn run(&self) -> SchedulerResult<ScrapeRunResult> {
        info!(
            "启动采集子进程: city={}, command={}, args={:?}",
            self.city, self.command, self.args
        );

        // 不设置kill_on_drop：丢弃run()不得杀死子进程，
        // 终止由执行器按PID发起（TERM->宽限->KILL 或立即KILL）
        let child = Command::new(&self.command)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                SchedulerError::ScrapeExecution(format!(
                    "启动采集命令失败: {} - {e}",
                    self.command
                ))
            })?;

        self.set_pid(child.id());

        // 子进程的收尾工作放在独立任务里，run()被超时/取消丢弃后
        // 该任务继续存活，直到进程真正退出才清除PID登记
        let pid_slot = Arc::clone(&self.pid);
        let city = self.city.clone();
        let wait_handle = tokio::spawn(async move {
            let outcome = collect_child_result(child, &city).await;
            if let Ok(mut slot) = pid_slot.lock() {
                *slot = None;
            }
            outcome
        });

        wait_handle
            .await
            .map_err(|e| SchedulerError::Internal(format!("等待采集任务失败: {e}")))?
    }

    fn process_id(&self) -> Option<u32> {
        self.pid.lock().ok().and_then(|slot| *slot)
    }
}

/// 读取子进程输出、等待其退出并映射为采集结果
async fn collect_child_result(
    mut child: tokio::process::Child,
    city: &str,
) -> SchedulerResult<ScrapeRunResult> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SchedulerError::ScrapeExecution("无法获取stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SchedulerError::ScrapeExecution("无法获取stderr".to_string()))?;

    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);
    let mut stdout_lines = Vec::new();
    let mut stderr_lines = Vec::new();

    let stdout_task = async {
        let mut line = String::new();
        while stdout_reader.read_line(&mut line).await.unwrap_or(0) > 0 {
            stdout_lines.push(line.trim_end().to_string());
            line.clear();
        }
    };
    let stderr_task = async {
        let mut line = String::new();
        while stderr_reader.read_line(&mut line).await.unwrap_or(0) > 0 {
            stderr_lines.push(line.trim_end().to_string());
            line.clear();
        }
    };
    tokio::join!(stdout_task, stderr_task);

    let exit_status = child
        .wait()
        .await
        .map_err(|e| SchedulerError::ProcessControl(format!("等待采集进程结束失败: {e}")))?;

    for line in &stderr_lines {
        warn!("采集器stderr [{city}]: {line}");
    }

    if !exit_status.success() {
        let detail = stderr_lines
            .last()
            .cloned()
            .unwrap_or_else(|| "无stderr输出".to_string());
        error!("采集子进程异常退出: city={city}, status={exit_status}, 最后错误: {detail}");
        return Err(SchedulerError::ScrapeExecution(format!(
            "采集进程异常退出 ({exit_status}): {detail}"
        )));
    }

    parse_run_result(&stdout_lines, city)
}

/// 结果约定：stdout最后一行非空内容是ScrapeRunResult的JSON序列化
fn parse_run_result(stdout_lines: &[String], city: &str) -> SchedulerResult<ScrapeRunResult> {
    let last_line = stdout_lines
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| {
            SchedulerError::ScrapeExecution(format!("采集器没有输出结果: city={city}"))
        })?;

    let result: ScrapeRunResult = serde_json::from_str(last_line).map_err(|e| {
        SchedulerError::Serialization(format!("解析采集结果JSON失败: {e} (原文: {last_line})"))
    })?;

    info!(
        "采集完成: city={}, 发现{}条, 处理{}条, 新增{}条, 更新{}条, 失败{}条",
        result.city, result.discovered, result.processed, result.new_listings,
        result.updated, result.failed
    );
    Ok(result)
}

/// 按城市配置构建子进程编排器的工厂
pub struct SubprocessOrchestratorFactory;

impl SubprocessOrchestratorFactory {
    pub fn new() -> Self {
        Self
    }

    /// 采集器命令行约定：城市/入口URL/并发数/过期阈值/执行实例ID
    fn build_args(city_config: &CityScrapeConfig, execution: &TaskExecution) -> Vec<String> {
        let mut args = vec![
            "--city".to_string(),
            city_config.city.clone(),
            "--base-url".to_string(),
            city_config.base_url.clone(),
            "--max-workers".to_string(),
            city_config.max_workers.to_string(),
            "--staleness-hours".to_string(),
            city_config.staleness_threshold_hours.to_string(),
            "--execution-id".to_string(),
            execution.execution_id.to_string(),
        ];
        args.extend(city_config.scraper_args.iter().cloned());
        args
    }
}

impl Default for SubprocessOrchestratorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorFactory for SubprocessOrchestratorFactory {
    fn build(
        &self,
        city_config: &CityScrapeConfig,
        execution: &TaskExecution,
    ) -> SchedulerResult<Arc<dyn ScrapeOrchestrator>> {
        if !city_config.enabled {
            return Err(SchedulerError::config_error(format!(
                "城市 {} 的采集已停用",
                city_config.city
            )));
        }
        if city_config.scraper_command.trim().is_empty() {
            return Err(SchedulerError::config_error(format!(
                "城市 {} 未配置采集命令",
                city_config.city
            )));
        }

        Ok(Arc::new(SubprocessOrchestrator::new(
            city_config.scraper_command.clone(),
            Self::build_args(city_config, execution),
            city_config.city.clone(),
        )))
    }
}
