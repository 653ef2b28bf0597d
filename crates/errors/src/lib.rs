use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("执行实例未找到: {id}")]
    ExecutionNotFound { id: String },
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("城市未配置采集参数: {city}")]
    CityNotConfigured { city: String },
    #[error("任务执行超时: {0}")]
    ExecutionTimeout(String),
    #[error("采集执行错误: {0}")]
    ScrapeExecution(String),
    #[error("进程控制错误: {0}")]
    ProcessControl(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("资源不足: {0}")]
    ResourceExhausted(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn execution_not_found<S: Into<String>>(id: S) -> Self {
        Self::ExecutionNotFound { id: id.into() }
    }
    pub fn city_not_configured<S: Into<String>>(city: S) -> Self {
        Self::CityNotConfigured { city: city.into() }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn scrape_error<S: Into<String>>(msg: S) -> Self {
        Self::ScrapeExecution(msg.into())
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_) | SchedulerError::Configuration(_)
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::ScrapeExecution(_)
                | SchedulerError::ExecutionTimeout(_)
                | SchedulerError::ResourceExhausted(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
