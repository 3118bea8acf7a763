use alloc::{collections::VecDeque, vec::Vec};
use bitmap::{traits::BitMapOps, AllocBitmap};

use super::{
    task::Pid, CpuRunQueue, DequeueFlag, EnqueueFlag, SchedClass, SchedPolicy, WakeupFlags,
    MAX_RT_PRIO, NSEC_PER_MSEC,
};

/// SCHED_RR的时间片
pub const RR_TIMESLICE_NS: u64 = 100 * NSEC_PER_MSEC;

/// 实时运行队列（per-cpu的）
///
/// 每个优先级一个FIFO队列，位图记录哪些优先级上有任务。正在运行的任务也留在队列中。
#[derive(Debug)]
pub struct RtRunQueue {
    queues: Vec<VecDeque<Pid>>,
    active: AllocBitmap,
    pub rt_nr_running: u32,
}

impl Default for RtRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RtRunQueue {
    pub fn new() -> Self {
        Self {
            queues: (0..MAX_RT_PRIO).map(|_| VecDeque::new()).collect(),
            active: AllocBitmap::new(MAX_RT_PRIO),
            rt_nr_running: 0,
        }
    }

    #[inline]
    fn prio_index(rt_priority: u32) -> usize {
        (rt_priority as usize).min(MAX_RT_PRIO - 1)
    }

    fn push(&mut self, pid: Pid, rt_priority: u32, head: bool) {
        let idx = Self::prio_index(rt_priority);
        if head {
            self.queues[idx].push_front(pid);
        } else {
            self.queues[idx].push_back(pid);
        }
        self.active.set(idx, true);
        self.rt_nr_running += 1;
    }

    fn remove(&mut self, pid: Pid, rt_priority: u32) -> bool {
        let idx = Self::prio_index(rt_priority);
        let queue = &mut self.queues[idx];
        let before = queue.len();
        queue.retain(|p| *p != pid);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.active.set(idx, false);
        }
        if removed {
            self.rt_nr_running = self.rt_nr_running.saturating_sub(1);
        }
        removed
    }

    /// 把任务移到同优先级队列的尾部
    fn requeue(&mut self, pid: Pid, rt_priority: u32) {
        let queue = &mut self.queues[Self::prio_index(rt_priority)];
        if let Some(pos) = queue.iter().position(|p| *p == pid) {
            if let Some(p) = queue.remove(pos) {
                queue.push_back(p);
            }
        }
    }

    /// 最高优先级队列的队首
    pub fn peek(&self) -> Option<Pid> {
        let idx = self.active.last_index()?;
        self.queues[idx].front().copied()
    }

    /// 某个优先级上排队的任务数
    pub fn nr_at(&self, rt_priority: u32) -> usize {
        self.queues[Self::prio_index(rt_priority)].len()
    }

    pub fn highest_prio(&self) -> Option<u32> {
        self.active.last_index().map(|i| i as u32)
    }
}

impl CpuRunQueue {
    /// ## 更新正在运行的实时任务的运行时间，返回本次增加的运行时间
    pub fn update_curr_rt(&mut self) -> u64 {
        let now = self.clock_task;
        let pid = match self.curr {
            Some(p) => p,
            None => return 0,
        };
        let task = match self.task_mut(pid) {
            Some(t) if t.policy.is_rt() => t,
            _ => return 0,
        };
        let delta = now.saturating_sub(task.se.exec_start);
        if delta == 0 {
            return 0;
        }
        task.se.exec_start = now;
        task.se.sum_exec_runtime += delta;

        let pelt_now = self.rq_clock_pelt();
        self.update_rt_rq_load_avg(pelt_now, true);
        delta
    }

    fn rt_prio_of(&self, pid: Pid) -> Option<u32> {
        self.task(pid).map(|t| t.rt_priority)
    }
}

/// 实时调度类：FIFO和RR
pub struct RtSchedClass;

impl SchedClass for RtSchedClass {
    fn enqueue_task(&self, rq: &mut CpuRunQueue, pid: Pid, flags: EnqueueFlag) {
        let prio = match rq.task_mut(pid) {
            Some(t) => {
                if t.policy == SchedPolicy::RR && t.rt.time_slice == 0 {
                    t.rt.time_slice = RR_TIMESLICE_NS;
                }
                t.rt_priority
            }
            None => return,
        };
        rq.rt.push(pid, prio, flags.contains(EnqueueFlag::ENQUEUE_HEAD));
        rq.add_nr_running(1);
    }

    fn dequeue_task(&self, rq: &mut CpuRunQueue, pid: Pid, _flags: DequeueFlag) {
        if rq.curr == Some(pid) {
            rq.update_curr_rt();
        }
        let prio = match rq.rt_prio_of(pid) {
            Some(p) => p,
            None => return,
        };
        if rq.rt.remove(pid, prio) {
            rq.sub_nr_running(1);
        }
    }

    fn yield_task(&self, rq: &mut CpuRunQueue) {
        if let Some(pid) = rq.curr {
            if let Some(prio) = rq.rt_prio_of(pid) {
                rq.rt.requeue(pid, prio);
            }
        }
    }

    fn check_preempt_curr(&self, rq: &mut CpuRunQueue, pid: Pid, _flags: WakeupFlags) {
        let curr = match rq.curr {
            Some(c) => c,
            None => {
                rq.resched_curr();
                return;
            }
        };
        match (rq.rt_prio_of(pid), rq.rt_prio_of(curr)) {
            (Some(p), Some(c)) if p > c => rq.resched_curr(),
            _ => {}
        }
    }

    fn pick_next_task(&self, rq: &mut CpuRunQueue) -> Option<Pid> {
        let pid = rq.rt.peek()?;
        let now = rq.clock_task;
        if let Some(t) = rq.task_mut(pid) {
            t.se.exec_start = now;
        }
        Some(pid)
    }

    fn put_prev_task(&self, rq: &mut CpuRunQueue, _prev: Pid) {
        rq.update_curr_rt();
    }

    fn set_next_task(&self, rq: &mut CpuRunQueue, pid: Pid) {
        let now = rq.clock_task;
        if let Some(t) = rq.task_mut(pid) {
            t.se.exec_start = now;
        }
    }

    /// FIFO任务一直运行到主动让出；RR任务用完时间片后排到同优先级的队尾
    fn task_tick(&self, rq: &mut CpuRunQueue, pid: Pid, _queued: bool) {
        let delta = rq.update_curr_rt();

        let (prio, expired) = match rq.task_mut(pid) {
            Some(t) if t.policy == SchedPolicy::RR => {
                t.rt.time_slice = t.rt.time_slice.saturating_sub(delta);
                if t.rt.time_slice > 0 {
                    return;
                }
                t.rt.time_slice = RR_TIMESLICE_NS;
                (t.rt_priority, true)
            }
            _ => return,
        };

        if expired && rq.rt.nr_at(prio) > 1 {
            rq.rt.requeue(pid, prio);
            rq.resched_curr();
        }
    }

    fn task_fork(&self, rq: &mut CpuRunQueue, pid: Pid) {
        if let Some(t) = rq.task_mut(pid) {
            t.rt.time_slice = RR_TIMESLICE_NS;
        }
    }

    fn update_curr(&self, rq: &mut CpuRunQueue) {
        rq.update_curr_rt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_queue_wins() {
        let mut rq = RtRunQueue::new();
        assert_eq!(rq.peek(), None);
        rq.push(Pid::new(1), 10, false);
        rq.push(Pid::new(2), 50, false);
        rq.push(Pid::new(3), 50, false);
        assert_eq!(rq.peek(), Some(Pid::new(2)));
        assert_eq!(rq.highest_prio(), Some(50));

        rq.requeue(Pid::new(2), 50);
        assert_eq!(rq.peek(), Some(Pid::new(3)));

        assert!(rq.remove(Pid::new(3), 50));
        assert!(rq.remove(Pid::new(2), 50));
        assert!(!rq.remove(Pid::new(2), 50));
        assert_eq!(rq.peek(), Some(Pid::new(1)));
        assert_eq!(rq.rt_nr_running, 1);
    }

    #[test]
    fn head_enqueue_goes_first() {
        let mut rq = RtRunQueue::new();
        rq.push(Pid::new(1), 5, false);
        rq.push(Pid::new(2), 5, true);
        assert_eq!(rq.peek(), Some(Pid::new(2)));
        assert_eq!(rq.nr_at(5), 2);
    }
}
