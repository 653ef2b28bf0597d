//! TaskScheduler的端内单元测试：定义管理、重试退避、并发上限、统计与紧急停止
mod scheduler_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use fangyuan_config::CityScrapeConfig;
    use fangyuan_domain::{
        ExecutionStatus, ScrapeOrchestrator, ScrapeRunResult, TaskExecution, TaskPriority,
    };
    use fangyuan_errors::SchedulerResult;
    use fangyuan_observability::{AlertManager, AlertSeverity, MetricsCollector};

    use crate::scheduler::{OrchestratorFactory, TaskScheduler};
    use crate::test_utils::{
        idle_resource_monitor, test_config, test_definition, MockOrchestratorFactory,
    };

    /// 记录并发峰值的编排器桩，用于验证并发上限
    struct ConcurrencyTrackingOrchestrator {
        city: String,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ScrapeOrchestrator for ConcurrencyTrackingOrchestrator {
        async fn run(&self) -> SchedulerResult<ScrapeRunResult> {
            let now_running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(200)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(ScrapeRunResult {
                execution_id: "tracking".to_string(),
                city: self.city.clone(),
                status: "completed".to_string(),
                discovered: 1,
                processed: 1,
                new_listings: 0,
                updated: 1,
                skipped: 0,
                failed: 0,
                duration_seconds: 0.2,
                error_summary: None,
            })
        }
        fn process_id(&self) -> Option<u32> {
            None
        }
    }

    struct ConcurrencyTrackingFactory {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl OrchestratorFactory for ConcurrencyTrackingFactory {
        fn build(
            &self,
            city_config: &CityScrapeConfig,
            _execution: &TaskExecution,
        ) -> SchedulerResult<Arc<dyn ScrapeOrchestrator>> {
            Ok(Arc::new(ConcurrencyTrackingOrchestrator {
                city: city_config.city.clone(),
                current: Arc::clone(&self.current),
                peak: Arc::clone(&self.peak),
            }))
        }
    }

    fn build_scheduler() -> TaskScheduler {
        TaskScheduler::with_components(
            test_config(),
            MockOrchestratorFactory::succeeding(),
            idle_resource_monitor(),
            Arc::new(MetricsCollector::new()),
            Arc::new(AlertManager::new()),
        )
    }

    fn build_scheduler_with_alerts() -> (TaskScheduler, Arc<AlertManager>) {
        let alerts = Arc::new(AlertManager::new());
        let scheduler = TaskScheduler::with_components(
            test_config(),
            MockOrchestratorFactory::succeeding(),
            idle_resource_monitor(),
            Arc::new(MetricsCollector::new()),
            Arc::clone(&alerts),
        );
        (scheduler, alerts)
    }

    #[tokio::test]
    async fn test_task_definition_management() {
        let scheduler = build_scheduler();

        // 无效CRON被拒绝
        let bad = test_definition("bad_cron", "not a cron");
        assert!(scheduler.add_task(bad).await.is_err());

        scheduler
            .add_task(test_definition("daily_scrape_shanghai", "0 2 * * *"))
            .await
            .unwrap();
        assert!(scheduler.get_task("daily_scrape_shanghai").await.is_some());
        assert_eq!(scheduler.list_tasks().await.len(), 1);

        scheduler.disable_task("daily_scrape_shanghai").await.unwrap();
        assert!(!scheduler
            .get_task("daily_scrape_shanghai")
            .await
            .unwrap()
            .enabled);
        scheduler.enable_task("daily_scrape_shanghai").await.unwrap();
        assert!(scheduler
            .get_task("daily_scrape_shanghai")
            .await
            .unwrap()
            .enabled);

        // 不存在的任务
        assert!(scheduler.enable_task("missing").await.is_err());
        assert!(scheduler.remove_task("daily_scrape_shanghai").await);
        assert!(!scheduler.remove_task("daily_scrape_shanghai").await);
    }

    #[tokio::test]
    async fn test_schedule_task_now() {
        let scheduler = build_scheduler();

        // 未注册的任务无法立即调度
        assert!(scheduler.schedule_task_now("missing", None).await.is_err());

        scheduler
            .add_task(test_definition("daily_scrape_shanghai", "0 2 * * *"))
            .await
            .unwrap();
        let execution_id = scheduler
            .schedule_task_now("daily_scrape_shanghai", None)
            .await
            .unwrap();

        assert_eq!(scheduler.queue_size().await, 1);
        let pending = scheduler.pending_executions().await;
        assert_eq!(pending[0].execution_id, execution_id);
        assert_eq!(pending[0].status, ExecutionStatus::Queued);
        assert_eq!(pending[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_schedule_now_priority_override() {
        let scheduler = build_scheduler();
        scheduler
            .add_task(test_definition("normal_task", "0 2 * * *"))
            .await
            .unwrap();
        scheduler
            .add_task(test_definition("boosted_task", "0 3 * * *"))
            .await
            .unwrap();

        scheduler.schedule_task_now("normal_task", None).await.unwrap();
        scheduler
            .schedule_task_now("boosted_task", Some(TaskPriority::Critical))
            .await
            .unwrap();

        // 优先级覆盖使后入队者排在前面
        let pending = scheduler.pending_executions().await;
        assert_eq!(pending[0].task_id, "boosted_task");
    }

    #[tokio::test]
    async fn test_retry_backoff_progression() {
        let scheduler = build_scheduler();
        let mut definition = test_definition("retry_task", "0 2 * * *");
        definition.max_retries = 3;
        definition.retry_delay_seconds = 60;
        scheduler.add_task(definition.clone()).await.unwrap();

        // 第一次失败：重试延迟 60 * 2^0 = 60秒
        let mut failed = TaskExecution::new("retry_task", Utc::now());
        failed.mark_running(Utc::now());
        failed.mark_failed("网络错误", Utc::now());
        scheduler.complete_for_test(failed, &definition).await;

        let pending = scheduler.pending_executions().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
        let delay = (pending[0].scheduled_time - Utc::now()).num_seconds();
        assert!((55..=65).contains(&delay), "实际延迟{delay}秒");

        // 第二次失败：重试延迟 60 * 2^1 = 120秒
        let retry1 = pending[0].clone();
        assert!(scheduler.cancel_execution(retry1.execution_id).await);
        let mut failed2 = retry1;
        failed2.mark_running(Utc::now());
        failed2.mark_failed("仍然失败", Utc::now());
        scheduler.complete_for_test(failed2, &definition).await;

        let pending = scheduler.pending_executions().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 2);
        let delay = (pending[0].scheduled_time - Utc::now()).num_seconds();
        assert!((115..=125).contains(&delay), "实际延迟{delay}秒");
    }

    #[tokio::test]
    async fn test_no_retry_after_max_retries() {
        let scheduler = build_scheduler();
        let mut definition = test_definition("retry_task", "0 2 * * *");
        definition.max_retries = 2;
        scheduler.add_task(definition.clone()).await.unwrap();

        // retry_count已达max_retries，不再产生新实例
        let mut exhausted = TaskExecution::new("retry_task", Utc::now());
        exhausted.retry_count = 2;
        exhausted.mark_running(Utc::now());
        exhausted.mark_timeout("超时", Utc::now());
        scheduler.complete_for_test(exhausted, &definition).await;

        assert_eq!(scheduler.queue_size().await, 0);
        assert_eq!(scheduler.execution_history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_alerts_on_failure_and_timeout() {
        let (scheduler, alerts) = build_scheduler_with_alerts();
        let definition = test_definition("alert_task", "0 2 * * *");
        scheduler.add_task(definition.clone()).await.unwrap();

        let now = Utc::now();
        let mut failed = TaskExecution::new("alert_task", now);
        failed.mark_running(now);
        failed.mark_failed("解析错误", now);
        scheduler.complete_for_test(failed, &definition).await;

        let mut timed_out = TaskExecution::new("alert_task", now);
        timed_out.mark_running(now);
        timed_out.mark_timeout("超过最大执行时间", now);
        scheduler.complete_for_test(timed_out, &definition).await;

        let fired = alerts.recent_alerts().await;
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].category, "task_failed");
        assert_eq!(fired[0].severity, AlertSeverity::Medium);
        assert_eq!(fired[1].category, "task_timeout");
        assert_eq!(fired[1].severity, AlertSeverity::High);
    }

    #[tokio::test]
    async fn test_stats_from_history() {
        let scheduler = build_scheduler();
        let definition = test_definition("stats_task", "0 2 * * *");
        scheduler.add_task(definition.clone()).await.unwrap();

        // 空历史得到零值统计
        let stats = scheduler.get_stats().await;
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.completed_tasks_24h, 0);
        assert_eq!(stats.failed_tasks_24h, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.last_execution.is_none());

        // 一次成功 + 一次失败
        let start = Utc::now() - Duration::seconds(10);
        let mut completed = TaskExecution::new("stats_task", start);
        completed.mark_running(start);
        completed.mark_completed(
            ScrapeRunResult {
                execution_id: completed.execution_id.to_string(),
                city: "上海".to_string(),
                status: "completed".to_string(),
                discovered: 10,
                processed: 10,
                new_listings: 1,
                updated: 9,
                skipped: 0,
                failed: 0,
                duration_seconds: 4.0,
                error_summary: None,
            },
            start + Duration::seconds(4),
        );
        scheduler.complete_for_test(completed, &definition).await;

        let mut failed = TaskExecution::new("stats_task", start);
        failed.mark_running(start);
        failed.mark_failed("错误", Utc::now());
        scheduler.complete_for_test(failed, &definition).await;

        let stats = scheduler.get_stats().await;
        assert_eq!(stats.completed_tasks_24h, 1);
        assert_eq!(stats.failed_tasks_24h, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert!((stats.avg_execution_time_seconds - 4.0).abs() < 0.1);
        assert!(stats.last_execution.is_some());
        assert_eq!(scheduler.execution_history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_emergency_stop_drains_queue() {
        let (scheduler, alerts) = build_scheduler_with_alerts();
        scheduler
            .add_task(test_definition("task_a", "0 2 * * *"))
            .await
            .unwrap();
        scheduler
            .add_task(test_definition("task_b", "0 3 * * *"))
            .await
            .unwrap();
        scheduler.schedule_task_now("task_a", None).await.unwrap();
        scheduler.schedule_task_now("task_b", None).await.unwrap();
        assert_eq!(scheduler.queue_size().await, 2);

        scheduler.emergency_stop_all().await;

        assert_eq!(scheduler.queue_size().await, 0);
        let history = scheduler.execution_history().await;
        assert_eq!(history.len(), 2);
        assert!(history
            .iter()
            .all(|e| e.status == ExecutionStatus::Cancelled));

        let fired = alerts.recent_alerts().await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].category, "emergency_stop");
        assert_eq!(fired[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let scheduler = build_scheduler();

        scheduler.start().await;
        assert!(scheduler.is_running());
        // 重复start是带告警的空操作
        scheduler.start().await;
        assert!(scheduler.is_running());

        scheduler.stop(StdDuration::from_secs(2)).await;
        assert!(!scheduler.is_running());
        // 已停止的调度器stop是空操作
        scheduler.stop(StdDuration::from_secs(2)).await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_under_burst() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut config = test_config();
        config.scheduler.max_concurrent_tasks = 1;
        let scheduler = TaskScheduler::with_components(
            config,
            Arc::new(ConcurrencyTrackingFactory {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            }),
            idle_resource_monitor(),
            Arc::new(MetricsCollector::new()),
            Arc::new(AlertManager::new()),
        );
        scheduler
            .add_task(test_definition("burst_task", "0 2 * * *"))
            .await
            .unwrap();
        // 同一轮就绪5个实例，全部在一次队列排空中被分发
        for _ in 0..5 {
            scheduler
                .schedule_task_now("burst_task", None)
                .await
                .unwrap();
        }

        scheduler.start().await;
        tokio::time::sleep(StdDuration::from_millis(600)).await;
        scheduler.stop(StdDuration::from_secs(2)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1, "并发峰值超出上限");
        assert!(!scheduler.execution_history().await.is_empty());
        // 抢不到并发许可的实例延后重新入队而非丢弃
        assert!(scheduler.queue_size().await >= 1);
    }

    #[tokio::test]
    async fn test_stop_timeout_is_shared_across_loops() {
        let scheduler = build_scheduler();
        scheduler.start().await;

        // 两个永不退出的句柄：stop的总等待仍应只有一个timeout
        scheduler
            .inject_loop_handle_for_test(tokio::spawn(std::future::pending::<()>()))
            .await;
        scheduler
            .inject_loop_handle_for_test(tokio::spawn(std::future::pending::<()>()))
            .await;

        let started = std::time::Instant::now();
        scheduler.stop(StdDuration::from_millis(300)).await;
        let elapsed = started.elapsed();

        assert!(!scheduler.is_running());
        assert!(
            elapsed < StdDuration::from_millis(500),
            "stop耗时{elapsed:?}，超过单个timeout上限"
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_execution() {
        let scheduler = build_scheduler();
        scheduler
            .add_task(test_definition("task_a", "0 2 * * *"))
            .await
            .unwrap();
        let execution_id = scheduler.schedule_task_now("task_a", None).await.unwrap();

        assert!(scheduler.cancel_execution(execution_id).await);
        assert_eq!(scheduler.queue_size().await, 0);
        // 再次取消同一ID返回false
        assert!(!scheduler.cancel_execution(execution_id).await);
    }
}
