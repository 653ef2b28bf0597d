use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use fangyuan_config::{AppConfig, CityScrapeConfig};
use fangyuan_dispatcher::TaskScheduler;
use fangyuan_domain::{TaskDefinition, TaskPriority};
use fangyuan_scraper::SubprocessOrchestratorFactory;

/// 主应用程序：组装调度器并注册各城市的采集任务
pub struct Application {
    config: AppConfig,
    scheduler: TaskScheduler,
}

impl Application {
    pub fn new(config: AppConfig) -> Self {
        let scheduler = TaskScheduler::new(
            config.clone(),
            Arc::new(SubprocessOrchestratorFactory::new()),
        );
        Self { config, scheduler }
    }

    /// 注册任务定义并启动调度循环
    pub async fn run(&self) -> Result<()> {
        let mut registered = 0usize;
        for city_config in &self.config.cities {
            if !city_config.enabled {
                warn!("城市 {} 的采集已停用，跳过注册", city_config.city);
                continue;
            }
            let definition = city_task_definition(city_config);
            self.scheduler
                .add_task(definition)
                .await
                .with_context(|| format!("注册城市 {} 的采集任务失败", city_config.city))?;
            registered += 1;
        }
        info!("已注册{registered}个城市采集任务");

        self.scheduler.start().await;
        Ok(())
    }

    /// 优雅关闭：停止循环并等待活动实例收尾
    pub async fn shutdown(&self, timeout: Duration) {
        self.scheduler.stop(timeout).await;
    }
}

/// 城市配置到任务定义的映射，任务ID约定为 daily_scrape_{城市}
fn city_task_definition(city_config: &CityScrapeConfig) -> TaskDefinition {
    let mut definition = TaskDefinition::new(
        format!("daily_scrape_{}", city_config.city),
        format!("{}每日房源采集", city_config.city),
        city_config.cron_expression.clone(),
        "daily_scrape".to_string(),
    );
    definition.city = Some(city_config.city.clone());
    definition.priority = TaskPriority::Normal;
    definition.max_retries = city_config.retry_count;
    definition
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_city_task_definition_mapping() {
        let city_config = CityScrapeConfig {
            city: "深圳".to_string(),
            cron_expression: "30 1 * * *".to_string(),
            retry_count: 5,
            ..CityScrapeConfig::default()
        };

        let definition = city_task_definition(&city_config);
        assert_eq!(definition.task_id, "daily_scrape_深圳");
        assert_eq!(definition.cron_expression, "30 1 * * *");
        assert_eq!(definition.city.as_deref(), Some("深圳"));
        assert_eq!(definition.max_retries, 5);
        assert!(definition.enabled);
    }
}
