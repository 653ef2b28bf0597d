use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use fangyuan_domain::{TaskExecution, TaskPriority};

/// 队列条目：执行实例与其所属任务定义在入队时刻的优先级
///
/// 优先级在入队时捕获，出队顺序不受后续定义变更影响。
#[derive(Debug, Clone)]
struct QueueEntry {
    priority: TaskPriority,
    execution: TaskExecution,
}

/// 待执行实例的线程安全持有区
///
/// 排序规则：优先级高者在前；同优先级按scheduled_time升序。
/// 所有操作在内部互斥锁内完成；`get`不阻塞等待新数据，
/// 取不到就绪实例是正常结果，由调用方轮询重试。
pub struct TaskQueue {
    entries: Mutex<Vec<QueueEntry>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// 按排序规则插入一个执行实例，总是成功
    pub async fn put(&self, execution: TaskExecution, priority: TaskPriority) {
        let mut entries = self.entries.lock().await;
        let position = entries
            .iter()
            .position(|entry| {
                entry.priority < priority
                    || (entry.priority == priority
                        && entry.execution.scheduled_time > execution.scheduled_time)
            })
            .unwrap_or(entries.len());
        entries.insert(position, QueueEntry { priority, execution });
    }

    /// 取出第一个scheduled_time已到期的执行实例，没有就绪的返回None
    pub async fn get(&self) -> Option<TaskExecution> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let position = entries.iter().position(|e| e.execution.is_ready(now))?;
        Some(entries.remove(position).execution)
    }

    /// 当前待执行实例数量
    pub async fn size(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// 所有待执行实例的快照副本，不改变队列
    pub async fn pending_tasks(&self) -> Vec<TaskExecution> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.execution.clone())
            .collect()
    }

    /// 按execution_id移除一个未开始的执行实例，返回是否发生了移除
    pub async fn remove_task(&self, execution_id: Uuid) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.execution.execution_id != execution_id);
        entries.len() < before
    }

    /// 清空队列并返回全部待执行实例，仅供紧急停止使用
    pub async fn drain(&self) -> Vec<TaskExecution> {
        let mut entries = self.entries.lock().await;
        entries.drain(..).map(|e| e.execution).collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
