pub mod alerting;
pub mod metrics_collector;

pub use alerting::{Alert, AlertManager, AlertSeverity, LogNotificationChannel, NotificationChannel};
pub use metrics_collector::MetricsCollector;
