use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use fangyuan_errors::{SchedulerError, SchedulerResult};

/// CRON表达式解析和调度工具
///
/// 对外契约是标准5字段CRON（分 时 日 月 周），按UTC时间求值。
/// `cron` crate要求带秒字段，内部补一个固定的"0"秒进行归一化。
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    /// 从5字段CRON表达式创建调度器
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let normalized = normalize_expression(cron_expr)?;
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { schedule })
    }

    /// 获取下一次执行时间
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 在容差窗口内是否有到期的执行时间点
    ///
    /// 从 `now - tolerance` 开始找下一个执行时间，若不晚于 `now` 则视为到期，
    /// 返回该具体时间点供创建执行实例使用。
    pub fn due_within(&self, now: DateTime<Utc>, tolerance: Duration) -> Option<DateTime<Utc>> {
        let check_from = now - tolerance;
        self.schedule
            .after(&check_from)
            .next()
            .filter(|next| *next <= now)
    }

    /// 计算下次执行时间距离现在的时长
    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_after(now).map(|next| next - now)
    }

    /// 获取任务的执行频率描述，用于日志和诊断
    pub fn frequency_description(&self) -> String {
        let upcoming = self.upcoming_times(Utc::now(), 2);
        if upcoming.len() >= 2 {
            let seconds = (upcoming[1] - upcoming[0]).num_seconds();
            match seconds {
                s if s < 60 => format!("每{s}秒"),
                s if s < 3600 => format!("每{}分钟", s / 60),
                s if s < 86400 => format!("每{}小时", s / 3600),
                s if s < 604800 => format!("每{}天", s / 86400),
                s => format!("每{}周", s / 604800),
            }
        } else {
            "无法确定频率".to_string()
        }
    }
}

/// 把5字段表达式归一化为cron crate接受的6字段形式
fn normalize_expression(cron_expr: &str) -> SchedulerResult<String> {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: format!("需要5个字段（分 时 日 月 周），实际{}个", fields.len()),
        });
    }
    Ok(format!("0 {}", fields.join(" ")))
}

/// 校验CRON表达式是否有效，无副作用
pub fn validate_cron_expression(cron_expr: &str) -> bool {
    CronScheduler::new(cron_expr).is_ok()
}

/// 返回接下来count个UTC执行时间点，用于展示和诊断
///
/// 表达式无效时返回空列表，从不panic。
pub fn next_execution_times(cron_expr: &str, count: usize) -> Vec<DateTime<Utc>> {
    match CronScheduler::new(cron_expr) {
        Ok(scheduler) => scheduler.upcoming_times(Utc::now(), count),
        Err(_) => Vec::new(),
    }
}
