//! 共享测试桩：模拟编排器、工厂与固定资源采样
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fangyuan_config::{AppConfig, CityScrapeConfig};
use fangyuan_domain::{ScrapeOrchestrator, ScrapeRunResult, TaskDefinition, TaskExecution};
use fangyuan_errors::{SchedulerError, SchedulerResult};
use fangyuan_infrastructure::{
    ProcessSnapshot, ResourceMonitor, SystemSampler, SystemSnapshot,
};

use crate::scheduler::OrchestratorFactory;

/// 固定返回给定CPU占用的采样桩，避免测试受宿主机负载影响
pub struct FixedSampler {
    pub cpu_percent: f64,
}

impl SystemSampler for FixedSampler {
    fn sample_system(&self) -> SchedulerResult<SystemSnapshot> {
        Ok(SystemSnapshot {
            cpu_percent: self.cpu_percent,
            memory_percent: 30.0,
            memory_used_mb: 1024.0,
            disk_percent: 40.0,
            disk_free_gb: 128.0,
        })
    }
    fn sample_process(&self, _pid: u32) -> Option<ProcessSnapshot> {
        None
    }
}

pub fn idle_resource_monitor() -> Arc<ResourceMonitor> {
    Arc::new(ResourceMonitor::with_sampler(Box::new(FixedSampler {
        cpu_percent: 5.0,
    })))
}

#[derive(Clone)]
pub enum MockBehavior {
    /// 延迟后成功
    Succeed { delay: Duration },
    /// 延迟后失败
    Fail { message: String },
}

pub struct MockOrchestrator {
    city: String,
    behavior: MockBehavior,
}

#[async_trait]
impl ScrapeOrchestrator for MockOrchestrator {
    async fn run(&self) -> SchedulerResult<ScrapeRunResult> {
        match &self.behavior {
            MockBehavior::Succeed { delay } => {
                tokio::time::sleep(*delay).await;
                Ok(ScrapeRunResult {
                    execution_id: "mock".to_string(),
                    city: self.city.clone(),
                    status: "completed".to_string(),
                    discovered: 100,
                    processed: 98,
                    new_listings: 10,
                    updated: 80,
                    skipped: 8,
                    failed: 2,
                    duration_seconds: 0.01,
                    error_summary: None,
                })
            }
            MockBehavior::Fail { message } => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(SchedulerError::ScrapeExecution(message.clone()))
            }
        }
    }
    fn process_id(&self) -> Option<u32> {
        None
    }
}

pub struct MockOrchestratorFactory {
    pub behavior: MockBehavior,
}

impl MockOrchestratorFactory {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            behavior: MockBehavior::Succeed {
                delay: Duration::from_millis(20),
            },
        })
    }
    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            behavior: MockBehavior::Fail {
                message: message.to_string(),
            },
        })
    }
}

impl OrchestratorFactory for MockOrchestratorFactory {
    fn build(
        &self,
        city_config: &CityScrapeConfig,
        _execution: &TaskExecution,
    ) -> SchedulerResult<Arc<dyn ScrapeOrchestrator>> {
        Ok(Arc::new(MockOrchestrator {
            city: city_config.city.clone(),
            behavior: self.behavior.clone(),
        }))
    }
}

/// 测试用配置：短轮询间隔 + 上海一个城市
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.scheduler.schedule_poll_interval_seconds = 1;
    config.scheduler.execution_poll_interval_ms = 50;
    config.scheduler.max_concurrent_tasks = 2;
    config.cities = vec![CityScrapeConfig {
        city: "上海".to_string(),
        ..CityScrapeConfig::default()
    }];
    config
}

/// 指向上海城市配置的测试任务定义
pub fn test_definition(task_id: &str, cron: &str) -> TaskDefinition {
    let mut definition = TaskDefinition::new(
        task_id.to_string(),
        format!("{task_id} 测试任务"),
        cron.to_string(),
        "daily_scrape".to_string(),
    );
    definition.city = Some("上海".to_string());
    definition.max_execution_time_seconds = 30;
    definition.max_retries = 0;
    definition.retry_delay_seconds = 60;
    definition
}
