pub mod entities;
pub mod ports;

pub use entities::{
    ExecutionStatus, SchedulerStats, ScrapeRunResult, TaskDefinition, TaskExecution,
    TaskPriority, TimeoutAction,
};
pub use ports::ScrapeOrchestrator;
