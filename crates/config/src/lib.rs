use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

mod models;

pub use models::{CityScrapeConfig, ObservabilityConfig, ResourceLimitsConfig, SchedulerConfig};

/// 应用顶层配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub resources: ResourceLimitsConfig,
    #[serde(default)]
    pub cities: Vec<CityScrapeConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置：内置默认值 <- TOML文件 <- FANGYUAN_*环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/fangyuan.toml",
                "fangyuan.toml",
                "/etc/fangyuan/config.toml",
            ];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FANGYUAN")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("解析配置失败")?;

        config.validate().context("配置验证失败")?;
        Ok(config)
    }

    /// 校验配置的基本约束
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_tasks == 0 {
            anyhow::bail!("scheduler.max_concurrent_tasks 必须大于0");
        }
        if self.scheduler.schedule_poll_interval_seconds == 0 {
            anyhow::bail!("scheduler.schedule_poll_interval_seconds 必须大于0");
        }
        if self.scheduler.retry_backoff_multiplier < 1.0 {
            anyhow::bail!("scheduler.retry_backoff_multiplier 不能小于1.0");
        }
        if !(0.0..=1.0).contains(&self.scheduler.retry_jitter_factor) {
            anyhow::bail!("scheduler.retry_jitter_factor 必须在0.0-1.0之间");
        }
        for pct in [
            self.resources.cpu_percent,
            self.resources.memory_percent,
            self.resources.disk_percent,
        ] {
            if !(0.0..=100.0).contains(&pct) {
                anyhow::bail!("资源限制百分比必须在0-100之间: {}", pct);
            }
        }
        let mut seen = std::collections::HashSet::new();
        for city in &self.cities {
            if city.city.trim().is_empty() {
                anyhow::bail!("城市名不能为空");
            }
            if city.max_workers == 0 {
                anyhow::bail!("城市 {} 的 max_workers 必须大于0", city.city);
            }
            if !seen.insert(city.city.as_str()) {
                anyhow::bail!("城市配置重复: {}", city.city);
            }
        }
        Ok(())
    }

    /// 按城市名精确匹配采集配置
    pub fn city_config(&self, city: &str) -> Option<&CityScrapeConfig> {
        self.cities.iter().find(|c| c.city == city)
    }
}
