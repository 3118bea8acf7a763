//! 这个文件实现的是调度过程中涉及到的时钟
//!
//! 调度器本身不读取硬件计时器，时钟由平台通过[`SchedClock`]提供。
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;

use crate::smp::cpu::{ProcessorId, MAX_CPU_NUM};

/// 调度时钟源
pub trait SchedClock: Send + Sync {
    /// 单调递增的纳秒时间
    fn sched_clock(&self) -> u64;

    /// 该CPU上真正可以分给任务的时间：扣除了中断处理以及被虚拟化层偷走的时间。
    /// 不区分的平台直接返回sched_clock()。
    fn task_clock(&self, _cpu: ProcessorId) -> u64 {
        self.sched_clock()
    }
}

/// 由调用者手动推进的时钟，用于测试和模拟
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
    /// 每个CPU上累计的非任务时间（中断、steal）
    stolen: Vec<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
            stolen: (0..MAX_CPU_NUM).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    /// 时间向前推进delta纳秒
    pub fn advance(&self, delta: u64) -> u64 {
        self.now.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// 设置时间，时钟不会后退
    pub fn set(&self, ns: u64) {
        self.now.fetch_max(ns, Ordering::AcqRel);
    }

    /// 记录cpu上有delta纳秒被中断处理占用，这段时间不计入任务时钟
    pub fn steal(&self, cpu: ProcessorId, delta: u64) {
        if let Some(s) = self.stolen.get(cpu.index()) {
            s.fetch_add(delta, Ordering::AcqRel);
        }
    }
}

impl SchedClock for ManualClock {
    fn sched_clock(&self) -> u64 {
        self.now()
    }

    fn task_clock(&self, cpu: ProcessorId) -> u64 {
        let stolen = self
            .stolen
            .get(cpu.index())
            .map(|s| s.load(Ordering::Acquire))
            .unwrap_or(0);
        self.now().saturating_sub(stolen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_clock_excludes_stolen_time() {
        let clock = ManualClock::new(1000);
        clock.advance(500);
        clock.steal(ProcessorId::new(1), 200);
        assert_eq!(clock.sched_clock(), 1500);
        assert_eq!(clock.task_clock(ProcessorId::new(0)), 1500);
        assert_eq!(clock.task_clock(ProcessorId::new(1)), 1300);
        clock.set(10);
        assert_eq!(clock.now(), 1500);
    }
}
