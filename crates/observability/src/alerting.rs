use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, warn};

use fangyuan_errors::SchedulerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertSeverity {
    Info,
    Medium,
    High,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    /// 类别标签，如 "task_failed"、"task_timeout"、"emergency_stop"
    pub category: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
}

/// 告警投递通道。实现不得长时间阻塞。
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, alert: &Alert) -> SchedulerResult<()>;
}

/// 默认通道：把告警输出到tracing日志管线
pub struct LogNotificationChannel;

#[async_trait]
impl NotificationChannel for LogNotificationChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, alert: &Alert) -> SchedulerResult<()> {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => {
                error!(
                    category = %alert.category,
                    severity = %alert.severity,
                    "告警: {}",
                    alert.message
                );
            }
            _ => {
                warn!(
                    category = %alert.category,
                    severity = %alert.severity,
                    "告警: {}",
                    alert.message
                );
            }
        }
        Ok(())
    }
}

/// 告警管理器：把告警扇出到全部注册通道，并保留
/// 限量的近期历史供查询。
pub struct AlertManager {
    channels: Vec<Arc<dyn NotificationChannel>>,
    recent: RwLock<Vec<Alert>>,
    history_limit: usize,
}

impl AlertManager {
    pub fn new() -> Self {
        Self {
            channels: vec![Arc::new(LogNotificationChannel)],
            recent: RwLock::new(Vec::new()),
            history_limit: 100,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub async fn fire(
        &self,
        category: impl Into<String>,
        message: impl Into<String>,
        severity: AlertSeverity,
    ) {
        let alert = Alert {
            category: category.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        };

        for channel in &self.channels {
            if let Err(e) = channel.notify(&alert).await {
                warn!("通知通道 '{}' 投递失败: {e}", channel.name());
            }
        }

        let mut recent = self.recent.write().await;
        recent.push(alert);
        let overflow = recent.len().saturating_sub(self.history_limit);
        if overflow > 0 {
            recent.drain(..overflow);
        }
    }

    pub async fn recent_alerts(&self) -> Vec<Alert> {
        self.recent.read().await.clone()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}
