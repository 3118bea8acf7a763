use super::{
    fair::CompletelyFairScheduler, rt::RtSchedClass, task::Pid, CpuRunQueue, DequeueFlag,
    EnqueueFlag, SchedClass, WakeupFlags,
};

/// 按优先级从高到低排列的调度类
pub static SCHED_CLASSES: [&dyn SchedClass; 3] =
    [&RtSchedClass, &CompletelyFairScheduler, &IdleSchedClass];

/// 空闲调度类
///
/// 每个CPU的idle不是一个真正的任务，`rq.curr`为None即表示正在运行idle。
/// 其他调度类都没有任务可选时由它兜底。
pub struct IdleSchedClass;

impl SchedClass for IdleSchedClass {
    fn enqueue_task(&self, rq: &mut CpuRunQueue, pid: Pid, _flags: EnqueueFlag) {
        log::warn!("cpu {}: enqueue task {} into idle class", rq.cpu, pid);
    }

    fn dequeue_task(&self, rq: &mut CpuRunQueue, pid: Pid, _flags: DequeueFlag) {
        log::warn!("cpu {}: dequeue task {} from idle class", rq.cpu, pid);
    }

    fn yield_task(&self, _rq: &mut CpuRunQueue) {}

    /// 任何任务都可以抢占idle
    fn check_preempt_curr(&self, rq: &mut CpuRunQueue, _pid: Pid, _flags: WakeupFlags) {
        rq.resched_curr();
    }

    fn pick_next_task(&self, rq: &mut CpuRunQueue) -> Option<Pid> {
        // 开始空闲，实时任务的利用率开始衰减
        let now = rq.rq_clock_pelt();
        rq.update_rt_rq_load_avg(now, false);
        None
    }

    fn put_prev_task(&self, _rq: &mut CpuRunQueue, _prev: Pid) {}

    fn set_next_task(&self, _rq: &mut CpuRunQueue, _pid: Pid) {}

    fn task_tick(&self, _rq: &mut CpuRunQueue, _pid: Pid, _queued: bool) {}

    fn task_fork(&self, _rq: &mut CpuRunQueue, _pid: Pid) {}

    fn update_curr(&self, _rq: &mut CpuRunQueue) {}
}
