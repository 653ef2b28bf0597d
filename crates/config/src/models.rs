use serde::{Deserialize, Serialize};

/// 调度核心配置
///
/// 容器级serde默认值允许TOML中只覆盖部分字段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 并发执行上限
    pub max_concurrent_tasks: usize,
    /// 调度循环轮询间隔（秒），即CRON评估频率
    pub schedule_poll_interval_seconds: u64,
    /// 执行循环轮询间隔（毫秒）
    pub execution_poll_interval_ms: u64,
    /// CRON到期判定的容差窗口（秒）
    pub cron_tolerance_seconds: u64,
    /// 指数退避倍数
    pub retry_backoff_multiplier: f64,
    /// 重试间隔上限（秒）
    pub retry_max_delay_seconds: u64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub retry_jitter_factor: f64,
    /// graceful超时动作的宽限期（秒）
    pub graceful_kill_grace_seconds: u64,
    /// 本节点标识，多节点部署时区分来源
    pub node_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            schedule_poll_interval_seconds: 60, // 每分钟评估一次CRON
            execution_poll_interval_ms: 1000,
            cron_tolerance_seconds: 60,
            retry_backoff_multiplier: 2.0,
            retry_max_delay_seconds: 3600, // 1小时上限
            retry_jitter_factor: 0.0,
            graceful_kill_grace_seconds: 30,
            node_id: default_node_id(),
        }
    }
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "fangyuan-01".to_string())
}

/// 全局资源限制，缺失的键回退到内置默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 80.0,
            disk_percent: 90.0,
        }
    }
}

/// 单个城市的采集参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityScrapeConfig {
    /// 城市名，与TaskDefinition.city精确匹配
    pub city: String,
    /// 列表页入口URL
    pub base_url: String,
    /// 该城市每日采集任务的CRON表达式（标准5字段）
    #[serde(default = "default_city_cron")]
    pub cron_expression: String,
    /// 采集器可执行命令
    pub scraper_command: String,
    /// 附加命令行参数
    #[serde(default)]
    pub scraper_args: Vec<String>,
    pub max_workers: usize,
    /// 超过该时长未更新的房源视为过期，需要重爬
    pub staleness_threshold_hours: u64,
    pub retry_count: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_city_cron() -> String {
    // 凌晨2点网站负载最低
    "0 2 * * *".to_string()
}

impl Default for CityScrapeConfig {
    fn default() -> Self {
        Self {
            city: "上海".to_string(),
            base_url: "https://example.com/ershoufang/".to_string(),
            cron_expression: default_city_cron(),
            scraper_command: "fangyuan-scrape".to_string(),
            scraper_args: Vec::new(),
            max_workers: 4,
            staleness_threshold_hours: 24,
            retry_count: 3,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
        }
    }
}
