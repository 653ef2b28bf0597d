use async_trait::async_trait;

use fangyuan_errors::SchedulerResult;

use crate::entities::ScrapeRunResult;

/// 采集编排器契约
///
/// 对调度核心而言，一次编排调用就是一个不透明的工作单元：
/// 针对一个城市完成"发现候选URL -> 去重过滤 -> 批量执行"的完整采集周期。
/// 调用可能很慢、可能抛错；若暴露了进程ID，则必须支持在进程级别中止。
#[async_trait]
pub trait ScrapeOrchestrator: Send + Sync {
    /// 执行一次完整的采集周期并返回结构化结果
    async fn run(&self) -> SchedulerResult<ScrapeRunResult>;

    /// 底层工作进程的PID（若以子进程方式运行）
    fn process_id(&self) -> Option<u32>;
}
