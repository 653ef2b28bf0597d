use std::collections::HashMap;
use std::sync::Mutex;

use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use fangyuan_errors::{SchedulerError, SchedulerResult};

/// 内置准入阈值，限制键缺失时使用
pub const DEFAULT_CPU_PERCENT: f64 = 80.0;
pub const DEFAULT_MEMORY_PERCENT: f64 = 80.0;
pub const DEFAULT_DISK_PERCENT: f64 = 90.0;

/// 一次主机级资源占用快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
    pub disk_percent: f64,
    pub disk_free_gb: f64,
}

/// 一次进程级资源占用快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub thread_count: u64,
}

/// 宿主机探测的抽象层，准入逻辑由此保持可测试
pub trait SystemSampler: Send + Sync {
    fn sample_system(&self) -> SchedulerResult<SystemSnapshot>;

    /// 进程已不存在或无权访问时返回None
    fn sample_process(&self, pid: u32) -> Option<ProcessSnapshot>;
}

/// 基于sysinfo的真实采样器
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler for SysinfoSampler {
    fn sample_system(&self) -> SchedulerResult<SystemSnapshot> {
        let mut sys = self
            .system
            .lock()
            .map_err(|e| SchedulerError::Internal(format!("采样器锁中毒: {e}")))?;

        sys.refresh_cpu_all();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_usage() as f64;
        let total_memory = sys.total_memory();
        let used_memory = sys.used_memory();
        let memory_percent = if total_memory > 0 {
            (used_memory as f64 / total_memory as f64) * 100.0
        } else {
            0.0
        };
        let memory_used_mb = used_memory as f64 / 1024.0 / 1024.0;

        let disks = Disks::new_with_refreshed_list();
        let (mut total_space, mut available_space) = (0u64, 0u64);
        for disk in disks.list() {
            total_space += disk.total_space();
            available_space += disk.available_space();
        }
        let disk_percent = if total_space > 0 {
            ((total_space - available_space) as f64 / total_space as f64) * 100.0
        } else {
            0.0
        };
        let disk_free_gb = available_space as f64 / 1024.0 / 1024.0 / 1024.0;

        Ok(SystemSnapshot {
            cpu_percent,
            memory_percent,
            memory_used_mb,
            disk_percent,
            disk_free_gb,
        })
    }

    fn sample_process(&self, pid: u32) -> Option<ProcessSnapshot> {
        let mut sys = self.system.lock().ok()?;
        let target = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        let process = sys.process(target)?;

        #[cfg(target_os = "linux")]
        let thread_count = process.tasks().map(|t| t.len() as u64).unwrap_or(0);
        #[cfg(not(target_os = "linux"))]
        let thread_count = 0u64;

        Some(ProcessSnapshot {
            cpu_percent: process.cpu_usage() as f64,
            memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            thread_count,
        })
    }
}

/// 资源监控器：回答准入判断并产出资源占用快照，
/// 把调度器与裸的宿主机API隔离开。
pub struct ResourceMonitor {
    sampler: Box<dyn SystemSampler>,
    default_cpu_percent: f64,
    default_memory_percent: f64,
    default_disk_percent: f64,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::with_sampler(Box::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(sampler: Box<dyn SystemSampler>) -> Self {
        Self {
            sampler,
            default_cpu_percent: DEFAULT_CPU_PERCENT,
            default_memory_percent: DEFAULT_MEMORY_PERCENT,
            default_disk_percent: DEFAULT_DISK_PERCENT,
        }
    }

    /// 覆盖内置兜底阈值（取自全局配置）
    pub fn with_default_limits(mut self, cpu: f64, memory: f64, disk: f64) -> Self {
        self.default_cpu_percent = cpu;
        self.default_memory_percent = memory;
        self.default_disk_percent = disk;
        self
    }

    /// 在给定限制下任务现在能否启动
    ///
    /// 采样本身出错时放行（返回true）：无法观测资源不能
    /// 永久阻塞全部执行。
    pub fn check_resource_availability(&self, limits: &HashMap<String, f64>) -> bool {
        let snapshot = match self.sampler.sample_system() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("资源采样失败，放行任务: {e}");
                return true;
            }
        };

        let cpu_limit = limits
            .get("cpu_percent")
            .copied()
            .unwrap_or(self.default_cpu_percent);
        let memory_limit = limits
            .get("memory_percent")
            .copied()
            .unwrap_or(self.default_memory_percent);
        let disk_limit = limits
            .get("disk_percent")
            .copied()
            .unwrap_or(self.default_disk_percent);

        if snapshot.cpu_percent > cpu_limit {
            warn!(
                "CPU占用过高: {:.1}% > {:.1}%",
                snapshot.cpu_percent, cpu_limit
            );
            return false;
        }
        if snapshot.memory_percent > memory_limit {
            warn!(
                "内存占用过高: {:.1}% > {:.1}%",
                snapshot.memory_percent, memory_limit
            );
            return false;
        }
        if snapshot.disk_percent > disk_limit {
            warn!(
                "磁盘占用过高: {:.1}% > {:.1}%",
                snapshot.disk_percent, disk_limit
            );
            return false;
        }

        debug!(
            "资源充足: cpu={:.1}% mem={:.1}% disk={:.1}%",
            snapshot.cpu_percent, snapshot.memory_percent, snapshot.disk_percent
        );
        true
    }

    /// 当前主机资源占用的键值快照
    /// 采样失败时返回空表而不报错
    pub fn current_usage(&self) -> HashMap<String, f64> {
        match self.sampler.sample_system() {
            Ok(snapshot) => HashMap::from([
                ("cpu_percent".to_string(), snapshot.cpu_percent),
                ("memory_percent".to_string(), snapshot.memory_percent),
                ("memory_used_mb".to_string(), snapshot.memory_used_mb),
                ("disk_percent".to_string(), snapshot.disk_percent),
                ("disk_free_gb".to_string(), snapshot.disk_free_gb),
            ]),
            Err(e) => {
                warn!("采集资源占用失败: {e}");
                HashMap::new()
            }
        }
    }

    /// 进程级资源占用。超过配置的进程级限制时记录告警日志，
    /// 终止进程仍由执行器负责。进程已退出或不可访问时返回空表。
    pub fn monitor_process(&self, pid: u32, limits: &HashMap<String, f64>) -> HashMap<String, f64> {
        let Some(snapshot) = self.sampler.sample_process(pid) else {
            debug!("进程 {pid} 已不存在或无权访问");
            return HashMap::new();
        };

        if let Some(max_cpu) = limits.get("max_cpu_percent") {
            if snapshot.cpu_percent > *max_cpu {
                warn!(
                    "进程 {pid} 超出CPU限制: {:.1}% > {:.1}%",
                    snapshot.cpu_percent, max_cpu
                );
            }
        }
        if let Some(max_memory) = limits.get("max_memory_mb") {
            if snapshot.memory_mb > *max_memory {
                warn!(
                    "进程 {pid} 超出内存限制: {:.1}MB > {:.1}MB",
                    snapshot.memory_mb, max_memory
                );
            }
        }

        HashMap::from([
            ("cpu_percent".to_string(), snapshot.cpu_percent),
            ("memory_mb".to_string(), snapshot.memory_mb),
            ("thread_count".to_string(), snapshot.thread_count as f64),
        ])
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
