//! 调度器核心
//!
//! [`Scheduler`]持有每个CPU的调度上下文，对外提供进程生命周期钩子、`schedule()`、
//! 时钟滴答入口、任务组接口以及CPU热插拔通知。
//!
//! 加锁顺序：任务组树 → 运行队列（两个运行队列按CPU编号从小到大）→ 带宽池 → NUMA组。
//! 任务位置表是叶子锁，持有它的时候不会再去拿运行队列锁。

use core::sync::atomic::Ordering;

use alloc::{sync::Arc, vec::Vec};
use hashbrown::HashMap;
use system_error::SystemError;

use crate::{
    libs::{
        cpumask::CpuMask,
        rwlock::RwLock,
        spinlock::{double_lock, SpinLock, SpinLockGuard},
    },
    smp::{
        cpu::{AtomicProcessorId, NodeId, ProcessorId, MAX_CPU_NUM},
        topology::CpuTopology,
    },
};

use super::{
    clock::SchedClock,
    config::SchedConfig,
    entity::EntityRef,
    fair::CfsRunQueue,
    group::{GroupSlot, TaskGroup, TaskGroupId, TaskGroupTree},
    idle::SCHED_CLASSES,
    numa::NumaControl,
    pelt::UpdateAvgFlags,
    task::{OnRq, Pid, SchedAttr, SchedTask, TaskState},
    topology::{SchedDomainTopology, SdFlags},
    wakeup::{TaskSnapshot, WakerInfo},
    CpuRunQueue, DequeueFlag, EnqueueFlag, SchedPolicy, WakeupFlags, MAX_NICE, MAX_RT_PRIO,
    MAX_SHARES, MIN_NICE, MIN_SHARES, NICE_0_LOAD, WEIGHT_IDLEPRIO,
};

/// 需要在某个CPU上抢在所有任务之前执行的一次性工作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopWork {
    /// 主动均衡：把本CPU上的一个任务推给target
    ActiveBalance { target: ProcessorId },
    /// 把本CPU上正在运行的任务迁移到target
    MigrateTask { pid: Pid, target: ProcessorId },
}

/// 一个CPU的调度上下文
pub struct PerCpuSched {
    pub cpu: ProcessorId,
    pub rq: SpinLock<CpuRunQueue>,
    stop_work: SpinLock<Option<StopWork>>,
}

/// 任务的调度信息快照
#[derive(Debug, Clone)]
pub struct TaskSchedInfo {
    pub pid: Pid,
    pub cpu: ProcessorId,
    pub policy: SchedPolicy,
    pub nice: i32,
    pub state: TaskState,
    pub on_rq: OnRq,
    pub group: TaskGroupId,
    pub vruntime: u64,
    pub sum_exec_runtime: u64,
    pub nr_migrations: u64,
    pub load_avg: u64,
    pub util_avg: u64,
    pub run_delay: u64,
    pub pcount: u64,
    pub numa_preferred_nid: NodeId,
}

/// CPU运行队列的快照
#[derive(Debug, Clone)]
pub struct CpuSchedInfo {
    pub cpu: ProcessorId,
    pub online: bool,
    pub curr: Option<Pid>,
    pub nr_running: u32,
    pub nr_switches: u64,
    pub min_vruntime: u64,
    pub load: u64,
    pub runnable_load_avg: u64,
    pub util_avg: u64,
    pub cpu_capacity: u64,
}

pub struct Scheduler {
    /// 用户设置的参数，以及按在线CPU数量放大之后实际生效的快照
    base_cfg: RwLock<SchedConfig>,
    config: RwLock<Arc<SchedConfig>>,
    pub(crate) clock: Arc<dyn SchedClock>,
    pub(crate) cpus: Vec<PerCpuSched>,
    pub(crate) groups: RwLock<TaskGroupTree>,
    /// 任务当前驻留在哪个CPU上
    tasks: RwLock<HashMap<Pid, AtomicProcessorId>>,
    pub(crate) topology: RwLock<Arc<SchedDomainTopology>>,
    /// 带SD_SERIALIZE的调度域同一时刻只允许一个CPU做均衡
    pub(crate) balancing: SpinLock<()>,
    pub(crate) numa: NumaControl,
}

/// 调度类的优先级，数值越小越优先
#[inline]
fn class_rank(policy: SchedPolicy) -> usize {
    if policy.is_rt() {
        0
    } else {
        1
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "sched_debug")] {
        /// 检查运行队列上几个计数之间是否一致
        fn check_rq_consistency(rq: &CpuRunQueue) {
            let expect = rq.root_cfs().h_nr_running + rq.rt.rt_nr_running;
            if rq.nr_running != expect {
                log::warn!(
                    "cpu {}: nr_running {} but cfs {} + rt {}",
                    rq.cpu,
                    rq.nr_running,
                    rq.root_cfs().h_nr_running,
                    rq.rt.rt_nr_running
                );
            }
            for t in rq.resident_tasks() {
                if t.cpu != rq.cpu {
                    log::warn!("cpu {}: task {} thinks it is on cpu {}", rq.cpu, t.pid, t.cpu);
                }
            }
            if let Some(curr) = rq.curr {
                if !rq.has_task(curr) {
                    log::warn!("cpu {}: running task {} is not resident", rq.cpu, curr);
                }
            }
        }
    } else {
        #[inline(always)]
        fn check_rq_consistency(_rq: &CpuRunQueue) {}
    }
}

impl CpuRunQueue {
    #[inline]
    fn class_of(&self, pid: Pid) -> Option<&'static dyn super::SchedClass> {
        self.task(pid).map(|t| t.policy.class())
    }

    /// ## 任务进入可运行状态
    pub(crate) fn activate_task(&mut self, pid: Pid, flags: EnqueueFlag) {
        let class = match self.class_of(pid) {
            Some(c) => c,
            None => return,
        };
        class.enqueue_task(self, pid, flags);
        let now = self.clock;
        if let Some(t) = self.task_mut(pid) {
            t.on_rq = OnRq::Queued;
            if t.sched_stat.last_queued == 0 {
                t.sched_stat.last_queued = now;
            }
        }
    }

    /// ## 任务离开可运行状态
    pub(crate) fn deactivate_task(&mut self, pid: Pid, flags: DequeueFlag) {
        let class = match self.class_of(pid) {
            Some(c) => c,
            None => return,
        };
        class.dequeue_task(self, pid, flags);
        if let Some(t) = self.task_mut(pid) {
            t.on_rq = OnRq::None;
            t.sched_stat.last_queued = 0;
        }
    }

    /// ## 检查刚进入队列的任务是否应该抢占当前任务
    ///
    /// 优先级更高的调度类直接抢占，同一个调度类由调度类自己决定。
    pub(crate) fn check_preempt_curr(&mut self, pid: Pid, flags: WakeupFlags) {
        let policy = match self.task(pid) {
            Some(t) => t.policy,
            None => return,
        };
        match self.curr_policy() {
            None => self.resched_curr(),
            Some(curr) if class_rank(policy) == class_rank(curr) => {
                policy.class().check_preempt_curr(self, pid, flags);
            }
            Some(curr) if class_rank(policy) < class_rank(curr) => self.resched_curr(),
            Some(_) => {}
        }
    }

    /// ## 把正在运行的任务换下，之后CPU上没有正在运行的任务
    pub(crate) fn put_prev_curr(&mut self) -> Option<Pid> {
        let prev = self.curr?;
        if let Some(class) = self.class_of(prev) {
            class.put_prev_task(self, prev);
        }
        let now = self.clock;
        if let Some(t) = self.task_mut(prev) {
            if t.is_queued() {
                t.sched_stat.last_queued = now;
            }
        }
        self.curr = None;
        Some(prev)
    }

    /// 按调度类的优先级依次询问下一个要运行的任务
    fn pick_next_task(&mut self) -> Option<Pid> {
        for class in SCHED_CLASSES.iter() {
            if let Some(pid) = class.pick_next_task(self) {
                return Some(pid);
            }
        }
        None
    }

    /// 让next成为正在运行的任务，统计它在队列中等待的时间
    fn set_curr(&mut self, next: Pid, prev: Option<Pid>) {
        let now = self.clock;
        if let Some(t) = self.task_mut(next) {
            let info = &mut t.sched_stat;
            if info.last_queued != 0 {
                info.run_delay += now.saturating_sub(info.last_queued);
                info.last_queued = 0;
            }
            info.pcount += 1;
            info.last_arrival = now;
        }
        if prev != Some(next) {
            self.nr_switches += 1;
        }
        self.curr = Some(next);
    }

    /// ## 在任务暂时离开队列的情况下修改它
    ///
    /// 在队列中的任务先出队，正在运行的任务先换下，修改之后再按修改后的调度类放回去。
    fn change_task<F>(&mut self, pid: Pid, dq: DequeueFlag, eq: EnqueueFlag, f: F)
    where
        F: FnOnce(&mut CpuRunQueue),
    {
        let queued = self.task(pid).map(|t| t.is_queued()).unwrap_or(false);
        let running = self.curr == Some(pid);

        if let Some(class) = self.class_of(pid) {
            if queued {
                class.dequeue_task(self, pid, DequeueFlag::DEQUEUE_SAVE | DequeueFlag::DEQUEUE_NOCLOCK | dq);
            }
            if running {
                class.put_prev_task(self, pid);
            }
        }

        f(self);

        if let Some(class) = self.class_of(pid) {
            if queued {
                class.enqueue_task(self, pid, EnqueueFlag::ENQUEUE_RESTORE | EnqueueFlag::ENQUEUE_NOCLOCK | eq);
            }
            if running {
                class.set_next_task(self, pid);
            }
        }
    }

    /// 按任务当前的策略和nice值设置权重
    fn set_load_weight(&mut self, pid: Pid) {
        let (policy, nice) = match self.task(pid) {
            Some(t) => (t.policy, t.nice),
            None => return,
        };
        if policy.is_fair() {
            self.reweight_task(pid);
        } else if let Some(t) = self.task_mut(pid) {
            t.se.load.update_set(SchedTask::policy_weight(policy, nice));
        }
    }

    /// 新进入空闲的CPU上出现了任务，更新平均空闲时长
    fn update_avg_idle(&mut self) {
        if self.idle_stamp == 0 {
            return;
        }
        let delta = self.clock.saturating_sub(self.idle_stamp) as i64;
        let avg = self.avg_idle as i64;
        let max = 2 * self.max_idle_balance_cost;
        self.avg_idle = ((avg + (delta - avg) / 8).max(0) as u64).min(max);
        self.idle_stamp = 0;
    }
}

impl Scheduler {
    /// ## 创建调度器
    ///
    /// 所有CPU初始都在线，调度域按拓扑构建。
    pub fn new(
        cpu_topo: CpuTopology,
        cfg: SchedConfig,
        clock: Arc<dyn SchedClock>,
    ) -> Result<Self, SystemError> {
        cfg.validate()?;
        let nr_cpus = cpu_topo.nr_cpus();
        if nr_cpus == 0 || nr_cpus > MAX_CPU_NUM {
            return Err(SystemError::EINVAL);
        }

        let scaled = Arc::new(cfg.scaled_for(nr_cpus));
        let groups = TaskGroupTree::new();
        let root = groups.root();

        let cpus = cpu_topo
            .entries()
            .iter()
            .map(|e| PerCpuSched {
                cpu: e.cpu,
                rq: SpinLock::new(CpuRunQueue::new(
                    e.cpu,
                    e.node,
                    e.capacity,
                    scaled.clone(),
                    clock.clone(),
                    CfsRunQueue::new(root.clone(), GroupSlot::ROOT, None, 0),
                )),
                stop_work: SpinLock::new(None),
            })
            .collect();

        let online = CpuMask::first_n(nr_cpus);
        let topology = SchedDomainTopology::build(&cpu_topo, &online);
        log::info!(
            "sched: {} cpus on {} nodes, {} domain levels on cpu 0",
            nr_cpus,
            cpu_topo.nr_nodes(),
            topology.domains(ProcessorId::new(0)).len()
        );

        Ok(Self {
            base_cfg: RwLock::new(cfg),
            config: RwLock::new(scaled),
            clock,
            cpus,
            groups: RwLock::new(groups),
            tasks: RwLock::new(HashMap::new()),
            topology: RwLock::new(Arc::new(topology)),
            balancing: SpinLock::new(()),
            numa: NumaControl::new(),
        })
    }

    /// 当前生效的参数快照
    #[inline]
    pub fn config(&self) -> Arc<SchedConfig> {
        self.config.read().clone()
    }

    /// ## 替换可调参数
    ///
    /// 新参数按在线CPU数量放大后整体发布，各CPU在下一次加锁时换上新快照。
    pub fn set_config(&self, cfg: SchedConfig) -> Result<(), SystemError> {
        cfg.validate()?;
        *self.base_cfg.write() = cfg;
        let nr_online = self.online_mask().weight();
        self.publish_config(nr_online);
        log::info!("sched: tunables updated");
        Ok(())
    }

    fn publish_config(&self, nr_online: usize) {
        let scaled = Arc::new(self.base_cfg.read().scaled_for(nr_online));
        *self.config.write() = scaled.clone();
        for percpu in self.cpus.iter() {
            percpu.rq.lock().refresh_config(&scaled);
        }
    }

    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    #[inline]
    pub fn cpu_rq(&self, cpu: ProcessorId) -> Option<&SpinLock<CpuRunQueue>> {
        self.cpus.get(cpu.index()).map(|p| &p.rq)
    }

    /// 调度域拓扑的快照
    #[inline]
    pub fn topology(&self) -> Arc<SchedDomainTopology> {
        self.topology.read().clone()
    }

    pub fn online_mask(&self) -> CpuMask {
        self.topology.read().online.clone()
    }

    /// 任务当前所在的CPU
    pub fn task_cpu(&self, pid: Pid) -> Option<ProcessorId> {
        self.tasks.read().get(&pid).map(|c| c.load(Ordering::Acquire))
    }

    fn set_task_cpu(&self, pid: Pid, cpu: ProcessorId) {
        if let Some(c) = self.tasks.read().get(&pid) {
            c.store(cpu, Ordering::Release);
        }
    }

    /// ## 锁住任务所在的运行队列
    ///
    /// 任务可能在查找位置和加锁之间被迁走，加锁后确认记录确实在这个CPU上，否则重试。
    pub(crate) fn task_rq_lock(
        &self,
        pid: Pid,
    ) -> Result<(ProcessorId, SpinLockGuard<'_, CpuRunQueue>), SystemError> {
        loop {
            let cpu = self.task_cpu(pid).ok_or(SystemError::ESRCH)?;
            let rq_lock = self.cpu_rq(cpu).ok_or(SystemError::ESRCH)?;
            let rq = rq_lock.lock();
            if rq.has_task(pid) {
                return Ok((cpu, rq));
            }
            drop(rq);
            core::hint::spin_loop();
        }
    }

    /// 按CPU编号的顺序锁住两个运行队列，返回的守卫与参数顺序一致
    pub(crate) fn lock_pair(
        &self,
        a: ProcessorId,
        b: ProcessorId,
    ) -> Option<(SpinLockGuard<'_, CpuRunQueue>, SpinLockGuard<'_, CpuRunQueue>)> {
        if a == b {
            return None;
        }
        let ra = self.cpu_rq(a)?;
        let rb = self.cpu_rq(b)?;
        Some(double_lock(ra, a.index(), rb, b.index()))
    }

    /// ## 把一个不在队列中的任务记录从src交给dst
    ///
    /// 两个运行队列都已经被锁住，任务位置表在持锁期间更新。
    pub(crate) fn transfer_task(&self, src: &mut CpuRunQueue, dst: &mut CpuRunQueue, pid: Pid) -> bool {
        let mut task = match src.ents.remove_task(pid) {
            Some(t) => t,
            None => return false,
        };
        task.cpu = dst.cpu;
        if let Some(cfs_rq) = dst.cfs_rqs.get(task.group_slot()) {
            task.se.depth = cfs_rq.depth;
        }
        if let Some(old) = dst.ents.insert_task(task) {
            log::error!("cpu {}: task {} was already resident", dst.cpu, old.pid);
        }
        self.set_task_cpu(pid, dst.cpu);
        true
    }

    /// ## 迁移一个在队列中的任务（可能正在运行）
    ///
    /// 在两把锁下重新检查任务是否还在src上、是否允许在dst上运行，条件不满足就放弃。
    pub(crate) fn move_queued_task(&self, pid: Pid, src_cpu: ProcessorId, dst_cpu: ProcessorId) -> bool {
        let (mut src, mut dst) = match self.lock_pair(src_cpu, dst_cpu) {
            Some(pair) => pair,
            None => return false,
        };
        let ok = match src.task(pid) {
            Some(t) => t.is_queued() && t.can_run_on(dst_cpu),
            None => false,
        };
        if !ok || !dst.online {
            return false;
        }
        src.update_rq_clock();
        dst.update_rq_clock();

        if src.curr == Some(pid) {
            src.put_prev_curr();
            src.resched_curr();
        }
        src.detach_task(pid);
        if !self.transfer_task(&mut src, &mut dst, pid) {
            return false;
        }
        dst.attach_task(pid);
        check_rq_consistency(&src);
        check_rq_consistency(&dst);
        true
    }

    /// ## 迁移一个睡眠中的任务，返回锁住的目标运行队列
    fn move_sleeping_task(
        &self,
        pid: Pid,
        src_cpu: ProcessorId,
        dst_cpu: ProcessorId,
    ) -> Option<SpinLockGuard<'_, CpuRunQueue>> {
        let (mut src, mut dst) = self.lock_pair(src_cpu, dst_cpu)?;
        let ok = match src.task(pid) {
            Some(t) => t.on_rq == OnRq::None && t.can_run_on(dst_cpu),
            None => false,
        };
        if !ok || !dst.online || src.curr == Some(pid) {
            return None;
        }
        if src.task(pid).map(|t| t.policy.is_fair()).unwrap_or(false) {
            src.migrate_task_rq_fair(pid);
        }
        if !self.transfer_task(&mut src, &mut dst, pid) {
            return None;
        }
        drop(src);
        Some(dst)
    }

    /// 向某个CPU投递一次性工作，该CPU上已经有未执行的工作时返回false
    pub(crate) fn queue_stop_work(&self, cpu: ProcessorId, work: StopWork) -> bool {
        let percpu = match self.cpus.get(cpu.index()) {
            Some(p) => p,
            None => return false,
        };
        {
            let mut slot = percpu.stop_work.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(work);
        }
        percpu.rq.lock().resched_curr();
        true
    }

    fn run_stop_work(&self, cpu: ProcessorId) {
        let work = match self.cpus.get(cpu.index()) {
            Some(p) => p.stop_work.lock().take(),
            None => return,
        };
        match work {
            Some(StopWork::ActiveBalance { target }) => self.active_load_balance_cpu_stop(cpu, target),
            Some(StopWork::MigrateTask { pid, target }) => {
                if !self.move_queued_task(pid, cpu, target) {
                    log::debug!("cpu {}: dropped migration of task {} to cpu {}", cpu, pid, target);
                }
            }
            None => {}
        }
    }

    /// ## 新任务创建
    ///
    /// 任务在父任务所在的CPU上初始化（继承父任务的vruntime），然后选择一个CPU放进队列。
    /// 返回任务最终所在的CPU。
    pub fn sched_fork(&self, parent: Option<Pid>, pid: Pid, attr: SchedAttr) -> Result<ProcessorId, SystemError> {
        if attr.nice < MIN_NICE || attr.nice > MAX_NICE {
            return Err(SystemError::EINVAL);
        }
        Self::check_rt_priority(attr.policy, attr.rt_priority)?;
        if self.task_cpu(pid).is_some() {
            return Err(SystemError::EEXIST);
        }

        let online = self.online_mask();
        let (parent_cpu, parent_group, parent_mask) = match parent {
            Some(pp) => {
                let (cpu, rq) = self.task_rq_lock(pp)?;
                let t = rq.task(pp).ok_or(SystemError::ESRCH)?;
                (Some(cpu), t.group, t.cpus_allowed.clone())
            }
            None => (None, TaskGroupId::ROOT, CpuMask::first_n(self.nr_cpus())),
        };
        let group = attr.group.unwrap_or(parent_group);
        let mask = attr.cpus_allowed.clone().unwrap_or(parent_mask);
        let allowed_online = &mask & &online;
        if allowed_online.is_empty() {
            return Err(SystemError::EINVAL);
        }
        let fork_cpu = match parent_cpu {
            Some(c) if online.contains(c) => c,
            _ => allowed_online.first().ok_or(SystemError::EINVAL)?,
        };

        let tg = self.groups.read().get(group).ok_or(SystemError::ESRCH)?;
        let rq_lock = self.cpu_rq(fork_cpu).ok_or(SystemError::EINVAL)?;

        self.tasks.write().insert(pid, AtomicProcessorId::new(fork_cpu));
        let snapshot = {
            let mut rq = rq_lock.lock();
            rq.update_rq_clock();
            let mut task = SchedTask::new(pid, &attr, tg.id, mask, fork_cpu);
            task.se.depth = rq.cfs_rqs.get(tg.id.slot()).map(|c| c.depth).unwrap_or(0);
            rq.ents.insert_task(task);
            tg.get_task();
            if tg.is_dead() {
                rq.ents.remove_task(pid);
                drop(rq);
                tg.put_task();
                self.tasks.write().remove(&pid);
                return Err(SystemError::ESRCH);
            }
            attr.policy.class().task_fork(&mut rq, pid);
            TaskSnapshot::of(&rq, pid)
        };

        let mut cpu = fork_cpu;
        if let Some(p) = snapshot {
            cpu = self.select_task_rq(&p, fork_cpu, SdFlags::SD_BALANCE_FORK, WakeupFlags::empty(), None);
        }

        let mut rq = match self.lock_pair(fork_cpu, cpu) {
            Some((mut src, mut dst)) => {
                if dst.online && src.has_task(pid) {
                    // vruntime已经是相对值，只需要搬动记录
                    self.transfer_task(&mut src, &mut dst, pid);
                    drop(src);
                    dst
                } else {
                    drop(dst);
                    cpu = fork_cpu;
                    src
                }
            }
            None => rq_lock.lock(),
        };

        rq.update_rq_clock();
        if attr.policy.is_fair() {
            rq.post_init_entity_util_avg(EntityRef::Task(pid));
        }
        rq.activate_task(pid, EnqueueFlag::ENQUEUE_NOCLOCK);
        rq.check_preempt_curr(pid, WakeupFlags::WF_FORK);
        check_rq_consistency(&rq);
        drop(rq);

        log::debug!("sched: task {} forked onto cpu {}", pid, cpu);
        Ok(cpu)
    }

    fn check_rt_priority(policy: SchedPolicy, rt_priority: u32) -> Result<(), SystemError> {
        let valid = if policy.is_rt() {
            rt_priority >= 1 && (rt_priority as usize) < MAX_RT_PRIO
        } else {
            rt_priority == 0
        };
        if valid {
            Ok(())
        } else {
            Err(SystemError::EINVAL)
        }
    }

    /// ## 唤醒一个睡眠的任务
    ///
    /// waker为发起唤醒的任务，它所在的CPU参与选核。任务已经可运行时返回false。
    pub fn wake_up(&self, pid: Pid, waker: Option<Pid>, wake_flags: WakeupFlags) -> Result<bool, SystemError> {
        let mut waker_info = None;
        if let Some(w) = waker.filter(|w| *w != pid) {
            let (cpu, mut rq) = self.task_rq_lock(w)?;
            let flips = rq.record_wakee(w, pid);
            let load = rq.task_h_load(w);
            waker_info = Some(WakerInfo { cpu, flips, load });
        }

        let (prev_cpu, snapshot) = {
            let (prev_cpu, mut rq) = self.task_rq_lock(pid)?;
            let state = rq.task(pid).map(|t| t.state).ok_or(SystemError::ESRCH)?;
            match state {
                TaskState::Dead => return Err(SystemError::ESRCH),
                // 已经可运行，或者另一个唤醒正在进行
                TaskState::Runnable => return Ok(false),
                TaskState::Sleeping => {}
            }
            rq.update_rq_clock();

            // 调用了sleep()但还没有被换下，原地放回队列
            if rq.curr == Some(pid) {
                if let Some(t) = rq.task_mut(pid) {
                    t.state = TaskState::Runnable;
                }
                rq.activate_task(pid, EnqueueFlag::ENQUEUE_WAKEUP | EnqueueFlag::ENQUEUE_NOCLOCK);
                return Ok(true);
            }

            if let Some(t) = rq.task_mut(pid) {
                t.state = TaskState::Runnable;
            }
            (prev_cpu, TaskSnapshot::of(&rq, pid))
        };

        let target = match snapshot {
            Some(p) => self.select_task_rq(&p, prev_cpu, SdFlags::SD_BALANCE_WAKE, wake_flags, waker_info.as_ref()),
            None => prev_cpu,
        };

        let mut wake_flags = wake_flags;
        let mut en_flags = EnqueueFlag::ENQUEUE_WAKEUP | EnqueueFlag::ENQUEUE_NOCLOCK;
        let mut rq = match (target != prev_cpu)
            .then(|| self.move_sleeping_task(pid, prev_cpu, target))
            .flatten()
        {
            Some(rq) => {
                wake_flags |= WakeupFlags::WF_MIGRATED;
                en_flags |= EnqueueFlag::ENQUEUE_MIGRATED;
                rq
            }
            None => self.task_rq_lock(pid)?.1,
        };

        rq.update_rq_clock();
        match rq.task(pid) {
            Some(t) if t.on_rq == OnRq::None && t.state == TaskState::Runnable => {}
            _ => return Ok(false),
        }
        rq.activate_task(pid, en_flags);
        rq.check_preempt_curr(pid, wake_flags);
        rq.update_avg_idle();
        check_rq_consistency(&rq);
        Ok(true)
    }

    /// ## 任务进入睡眠
    ///
    /// 任务离开运行队列；如果它正在运行，CPU被标记为需要重新调度。
    pub fn sleep(&self, pid: Pid) -> Result<(), SystemError> {
        let (_, mut rq) = self.task_rq_lock(pid)?;
        let (state, queued) = rq
            .task(pid)
            .map(|t| (t.state, t.is_queued()))
            .ok_or(SystemError::ESRCH)?;
        if state == TaskState::Dead {
            return Err(SystemError::ESRCH);
        }
        if !queued {
            return Ok(());
        }
        rq.update_rq_clock();
        rq.deactivate_task(pid, DequeueFlag::DEQUEUE_SLEEP | DequeueFlag::DEQUEUE_NOCLOCK);
        if let Some(t) = rq.task_mut(pid) {
            t.state = TaskState::Sleeping;
        }
        if rq.curr == Some(pid) {
            rq.resched_curr();
        }
        check_rq_consistency(&rq);
        Ok(())
    }

    /// ## 任务退出
    ///
    /// 任务离开队列，残留的负载被移除，记录被释放。
    pub fn exit(&self, pid: Pid) -> Result<(), SystemError> {
        let (task, tg) = {
            let (_, mut rq) = self.task_rq_lock(pid)?;
            rq.update_rq_clock();
            let (queued, fair) = rq
                .task(pid)
                .map(|t| (t.is_queued(), t.policy.is_fair()))
                .ok_or(SystemError::ESRCH)?;
            if queued {
                rq.deactivate_task(pid, DequeueFlag::DEQUEUE_SLEEP | DequeueFlag::DEQUEUE_NOCLOCK);
            }
            if rq.curr == Some(pid) {
                rq.put_prev_curr();
                rq.resched_curr();
            }
            if fair {
                rq.task_dead_fair(pid);
            }
            let mut task = rq.ents.remove_task(pid).ok_or(SystemError::ESRCH)?;
            task.state = TaskState::Dead;
            let tg = rq.cfs_rqs.get(task.group_slot()).map(|c| c.tg.clone());
            check_rq_consistency(&rq);
            (task, tg)
        };

        if let Some(tg) = tg {
            tg.put_task();
        }
        self.task_numa_free(&task);
        self.tasks.write().remove(&pid);
        log::debug!("sched: task {} exited after {} ns", pid, task.se.sum_exec_runtime);
        Ok(())
    }

    /// ## 在cpu上做一次调度
    ///
    /// 换下当前任务，按调度类的顺序挑选下一个任务；没有任务可运行时先尝试从别的CPU拉任务。
    /// 返回接下来在该CPU上运行的任务，None表示运行idle。
    pub fn schedule(&self, cpu: ProcessorId) -> Result<Option<Pid>, SystemError> {
        let rq_lock = self.cpu_rq(cpu).ok_or(SystemError::EINVAL)?;
        self.run_stop_work(cpu);

        let mut rq = rq_lock.lock();
        rq.update_rq_clock();
        let prev = rq.curr;
        rq.put_prev_curr();
        rq.need_resched = false;

        let mut next = rq.pick_next_task();
        if next.is_none() && rq.online {
            drop(rq);
            self.idle_balance(cpu);
            rq = rq_lock.lock();
            rq.update_rq_clock();
            // 放开锁的这段时间里可能有任务被唤醒到这个CPU上
            next = rq.pick_next_task();
        }

        if let Some(n) = next {
            rq.set_curr(n, prev);
        }
        rq.need_resched = false;
        check_rq_consistency(&rq);
        Ok(next)
    }

    /// ## 当前任务主动让出CPU
    pub fn yield_task(&self, cpu: ProcessorId) -> Result<Option<Pid>, SystemError> {
        {
            let rq_lock = self.cpu_rq(cpu).ok_or(SystemError::EINVAL)?;
            let mut rq = rq_lock.lock();
            if let Some(class) = rq.curr.and_then(|p| rq.class_of(p)) {
                class.yield_task(&mut rq);
            }
        }
        self.schedule(cpu)
    }

    /// ## 时钟滴答
    ///
    /// 检查带宽定时器，驱动当前任务的运行时间统计和抢占检查，周期性地衰减阻塞负载、
    /// 触发负载均衡。需要重新调度时直接调度，返回之后在该CPU上运行的任务。
    pub fn scheduler_tick(&self, cpu: ProcessorId) -> Result<Option<Pid>, SystemError> {
        let rq_lock = self.cpu_rq(cpu).ok_or(SystemError::EINVAL)?;
        let now = self.clock.sched_clock();
        self.run_bandwidth_timers(now);
        self.run_stop_work(cpu);

        let numa_enabled = self.numa_enabled();
        let (online, idle, next_balance) = {
            let mut rq = rq_lock.lock();
            rq.update_rq_clock();
            if let Some(curr) = rq.curr {
                if let Some(class) = rq.class_of(curr) {
                    class.task_tick(&mut rq, curr, false);
                }
                if numa_enabled {
                    rq.task_tick_numa(curr);
                }
            }
            let period = rq.cfg.blocked_load_update_period_ns;
            if rq.clock.saturating_sub(rq.last_blocked_load_update) >= period {
                rq.update_blocked_averages();
            }
            check_rq_consistency(&rq);
            (rq.online, rq.is_idle(), rq.next_balance)
        };

        if online && now >= next_balance {
            self.rebalance_domains(cpu, idle);
        }

        let (need_resched, curr) = {
            let rq = rq_lock.lock();
            (rq.need_resched, rq.curr)
        };
        if need_resched {
            return self.schedule(cpu);
        }
        Ok(curr)
    }

    /// ## 修改任务的nice值
    ///
    /// 超出范围的值被截断。权重变大或者正在运行的任务权重变小时触发重新调度。
    pub fn set_user_nice(&self, pid: Pid, nice: i32) -> Result<(), SystemError> {
        let nice = nice.clamp(MIN_NICE, MAX_NICE);
        let (_, mut rq) = self.task_rq_lock(pid)?;
        let (old, queued, fair) = rq
            .task(pid)
            .map(|t| (t.nice, t.is_queued(), t.policy.is_fair()))
            .ok_or(SystemError::ESRCH)?;
        if old == nice {
            return Ok(());
        }
        rq.update_rq_clock();
        let running = rq.curr == Some(pid);

        if !fair {
            if let Some(t) = rq.task_mut(pid) {
                t.nice = nice;
            }
            return Ok(());
        }

        rq.change_task(pid, DequeueFlag::empty(), EnqueueFlag::empty(), |rq| {
            if let Some(t) = rq.task_mut(pid) {
                t.nice = nice;
            }
            rq.set_load_weight(pid);
        });
        if queued && (nice < old || running) {
            rq.resched_curr();
        }
        Ok(())
    }

    /// ## 修改任务的调度策略
    pub fn set_policy(&self, pid: Pid, policy: SchedPolicy, rt_priority: u32) -> Result<(), SystemError> {
        Self::check_rt_priority(policy, rt_priority)?;
        let (_, mut rq) = self.task_rq_lock(pid)?;
        let (old_policy, old_prio, queued) = rq
            .task(pid)
            .map(|t| (t.policy, t.rt_priority, t.is_queued()))
            .ok_or(SystemError::ESRCH)?;
        if old_policy == policy && old_prio == rt_priority {
            return Ok(());
        }
        rq.update_rq_clock();
        let running = rq.curr == Some(pid);

        rq.change_task(pid, DequeueFlag::empty(), EnqueueFlag::empty(), |rq| {
            if old_policy.is_fair() && !policy.is_fair() {
                rq.switched_from_fair(pid);
            }
            if let Some(t) = rq.task_mut(pid) {
                t.policy = policy;
                t.rt_priority = rt_priority;
            }
            if !old_policy.is_fair() && policy.is_fair() {
                rq.switched_to_fair(pid);
            }
            rq.set_load_weight(pid);
        });

        if running {
            rq.resched_curr();
        } else if queued {
            rq.check_preempt_curr(pid, WakeupFlags::empty());
        }
        log::debug!("sched: task {} policy {:?} -> {:?}", pid, old_policy, policy);
        Ok(())
    }

    /// ## 修改任务允许运行的CPU
    ///
    /// 任务当前所在的CPU不再被允许时，在队列中的任务马上被迁走，睡眠的任务在下次唤醒时换CPU。
    pub fn set_cpus_allowed(&self, pid: Pid, mask: CpuMask) -> Result<(), SystemError> {
        let online = self.online_mask();
        let dest = (&mask & &online).first().ok_or(SystemError::EINVAL)?;
        let (cpu, queued) = {
            let (cpu, mut rq) = self.task_rq_lock(pid)?;
            let t = rq.task_mut(pid).ok_or(SystemError::ESRCH)?;
            t.cpus_allowed = mask.clone();
            (cpu, t.is_queued())
        };
        if mask.contains(cpu) || !queued {
            return Ok(());
        }
        if !self.move_queued_task(pid, cpu, dest) {
            log::debug!("sched: task {} changed while moving it off cpu {}", pid, cpu);
        }
        Ok(())
    }

    fn group_sched_enabled() -> Result<(), SystemError> {
        if cfg!(feature = "fair_group_sched") {
            Ok(())
        } else {
            Err(SystemError::ENOSYS)
        }
    }

    /// ## 创建任务组，在每个CPU上安装它的运行队列和组实体
    pub fn create_group(&self, parent: TaskGroupId) -> Result<TaskGroupId, SystemError> {
        Self::group_sched_enabled()?;
        let mut tree = self.groups.write();
        let tg = tree.create(parent)?;
        for percpu in self.cpus.iter() {
            percpu.rq.lock().init_tg_cfs_entry(&tg);
        }
        log::info!("sched: group {} created under {}", tg.id.slot(), parent.slot());
        Ok(tg.id)
    }

    /// ## 销毁任务组
    ///
    /// 组中不能还有任务或者子任务组。
    pub fn destroy_group(&self, id: TaskGroupId) -> Result<(), SystemError> {
        Self::group_sched_enabled()?;
        let mut tree = self.groups.write();
        let tg = tree.remove(id)?;
        for percpu in self.cpus.iter() {
            let mut rq = percpu.rq.lock();
            rq.update_rq_clock();
            rq.unregister_fair_sched_group(id.slot());
        }
        {
            let mut inner = tg.bandwidth.inner.lock();
            inner.throttled.clear();
            inner.period_deadline = None;
            inner.slack_deadline = None;
        }
        log::info!("sched: group {} destroyed", id.slot());
        Ok(())
    }

    /// 沿着组实体链刷新组实体的负载和权重
    fn refresh_group_entity(rq: &mut CpuRunQueue, slot: GroupSlot) {
        let mut se = Some(EntityRef::Group(slot));
        while let Some(cur) = se {
            if rq.ents.get(cur).is_none() {
                break;
            }
            let q = rq.ents[cur].cfs_rq;
            rq.update_load_avg(q, cur, UpdateAvgFlags::UPDATE_TG);
            rq.update_cfs_group(cur);
            se = rq.parent_entity(cur);
        }
    }

    /// ## 设置任务组的份额
    ///
    /// 超出[MIN_SHARES, MAX_SHARES]的值被截断，新的份额马上同步到各CPU上的组实体。
    pub fn set_shares(&self, id: TaskGroupId, shares: u64) -> Result<(), SystemError> {
        Self::group_sched_enabled()?;
        if id.is_root() {
            return Err(SystemError::EINVAL);
        }
        let shares = shares.clamp(MIN_SHARES, MAX_SHARES);
        let tree = self.groups.read();
        let tg = tree.get(id).ok_or(SystemError::ESRCH)?;
        if tg.shares() == shares {
            return Ok(());
        }
        tg.store_shares(shares);
        for percpu in self.cpus.iter() {
            let mut rq = percpu.rq.lock();
            rq.update_rq_clock();
            Self::refresh_group_entity(&mut rq, id.slot());
        }
        Ok(())
    }

    /// ## 把任务组设为idle
    ///
    /// idle任务组的组实体以SCHED_IDLE的权重竞争，组内的任务对祖先来说都算idle任务。
    pub fn set_group_idle(&self, id: TaskGroupId, idle: bool) -> Result<(), SystemError> {
        Self::group_sched_enabled()?;
        if id.is_root() {
            return Err(SystemError::EINVAL);
        }
        let tree = self.groups.read();
        let tg = tree.get(id).ok_or(SystemError::ESRCH)?;
        if tg.is_idle() == idle {
            return Ok(());
        }
        tg.set_idle(idle);

        let slot = id.slot();
        for percpu in self.cpus.iter() {
            let mut rq = percpu.rq.lock();
            rq.update_rq_clock();
            let ge = EntityRef::Group(slot);
            if rq.ents.get(ge).map(|se| se.on_rq).unwrap_or(false) {
                let grp = &rq.cfs_rqs[slot];
                let delta = grp.h_nr_running.saturating_sub(grp.idle_h_nr_running);
                let mut se = Some(ge);
                while let Some(cur) = se {
                    if !rq.ents[cur].on_rq {
                        break;
                    }
                    let q = rq.ents[cur].cfs_rq;
                    let cfs_rq = &mut rq.cfs_rqs[q];
                    if idle {
                        cfs_rq.idle_h_nr_running += delta;
                    } else {
                        cfs_rq.idle_h_nr_running = cfs_rq.idle_h_nr_running.saturating_sub(delta);
                    }
                    if q != GroupSlot::ROOT && cfs_rq.tg.is_idle() {
                        break;
                    }
                    se = rq.parent_entity(cur);
                }
            }
            Self::refresh_group_entity(&mut rq, slot);
        }
        let weight = if idle { WEIGHT_IDLEPRIO } else { NICE_0_LOAD };
        log::debug!("sched: group {} idle={} (weight {})", slot, idle, weight);
        Ok(())
    }

    /// ## 把任务移到另一个任务组
    pub fn move_task_to_group(&self, pid: Pid, id: TaskGroupId) -> Result<(), SystemError> {
        Self::group_sched_enabled()?;
        let tree = self.groups.read();
        let tg = tree.get(id).ok_or(SystemError::ESRCH)?;
        let (_, mut rq) = self.task_rq_lock(pid)?;
        let (old, fair) = rq
            .task(pid)
            .map(|t| (t.group, t.policy.is_fair()))
            .ok_or(SystemError::ESRCH)?;
        if old == id {
            return Ok(());
        }
        let old_tg = rq.cfs_rqs.get(old.slot()).map(|c| c.tg.clone());
        let new_depth = rq.cfs_rqs.get(id.slot()).map(|c| c.depth).ok_or(SystemError::ESRCH)?;
        rq.update_rq_clock();
        let running = rq.curr == Some(pid);

        rq.change_task(pid, DequeueFlag::DEQUEUE_MOVE, EnqueueFlag::ENQUEUE_MOVE, |rq| {
            if fair {
                rq.task_change_group_fair(pid, id.slot());
            }
            if let Some(t) = rq.task_mut(pid) {
                t.group = id;
                t.se.cfs_rq = id.slot();
                t.se.depth = new_depth;
            }
        });
        if running {
            rq.resched_curr();
        }
        drop(rq);

        tg.get_task();
        if let Some(old_tg) = old_tg {
            old_tg.put_task();
        }
        Ok(())
    }

    /// 按id查找任务组
    pub fn group(&self, id: TaskGroupId) -> Result<Arc<TaskGroup>, SystemError> {
        self.groups.read().get(id).ok_or(SystemError::ESRCH)
    }

    /// 任务当前所在的任务组
    pub fn task_group(&self, pid: Pid) -> Result<TaskGroupId, SystemError> {
        let (_, rq) = self.task_rq_lock(pid)?;
        rq.task(pid).map(|t| t.group).ok_or(SystemError::ESRCH)
    }

    /// ## CPU下线
    ///
    /// 解除该CPU上所有被限流的队列并把它从带宽的限流列表中摘掉，重建调度域，
    /// 然后把驻留在它上面的所有任务迁走。
    pub fn cpu_offline(&self, cpu: ProcessorId) -> Result<(), SystemError> {
        let rq_lock = self.cpu_rq(cpu).ok_or(SystemError::EINVAL)?;
        let online = self.online_mask();
        if !online.contains(cpu) {
            return Ok(());
        }
        if online.weight() == 1 {
            return Err(SystemError::EBUSY);
        }

        {
            let mut rq = rq_lock.lock();
            rq.update_rq_clock();
            rq.put_prev_curr();
            rq.unthrottle_offline_cfs_rqs();
            rq.online = false;
        }
        let groups = self.groups.read().iter_top_down();
        for tg in groups.iter() {
            tg.bandwidth.remove_throttled(cpu);
        }

        self.rebuild_sched_domains();
        let moved = self.migrate_tasks_off(cpu);
        if let Some(p) = self.cpus.get(cpu.index()) {
            p.stop_work.lock().take();
        }
        log::info!("sched: cpu {} offline, {} tasks migrated", cpu, moved);
        Ok(())
    }

    /// 把下线CPU上驻留的任务（包括睡眠的）全部迁走
    fn migrate_tasks_off(&self, dead: ProcessorId) -> usize {
        let all = CpuMask::first_n(self.nr_cpus());
        let mut moved = 0;
        loop {
            let online = self.online_mask();
            let (pid, queued, dest) = {
                let rq_lock = match self.cpu_rq(dead) {
                    Some(r) => r,
                    None => return moved,
                };
                let mut rq = rq_lock.lock();
                let (pid, queued, mask) = match rq.resident_tasks().next() {
                    Some(t) => (t.pid, t.is_queued(), t.cpus_allowed.clone()),
                    None => return moved,
                };
                let dest = match (&mask & &online).first() {
                    Some(d) => d,
                    None => {
                        // 允许的CPU都不在线了，放宽到所有CPU
                        log::warn!("sched: task {} is no longer affine to cpu {}", pid, dead);
                        if let Some(t) = rq.task_mut(pid) {
                            t.cpus_allowed = all.clone();
                        }
                        match online.first() {
                            Some(d) => d,
                            None => return moved,
                        }
                    }
                };
                (pid, queued, dest)
            };

            let ok = if queued {
                self.move_queued_task(pid, dead, dest)
            } else {
                self.move_sleeping_task(pid, dead, dest).is_some()
            };
            if !ok {
                log::warn!("sched: failed to move task {} off cpu {}", pid, dead);
                return moved;
            }
            moved += 1;
        }
    }

    /// ## CPU上线
    pub fn cpu_online(&self, cpu: ProcessorId) -> Result<(), SystemError> {
        let rq_lock = self.cpu_rq(cpu).ok_or(SystemError::EINVAL)?;
        {
            let mut rq = rq_lock.lock();
            if rq.online {
                return Ok(());
            }
            rq.update_rq_clock();
            rq.online = true;
            rq.online_cfs_bandwidth();
            rq.next_balance = rq.clock;
        }
        self.rebuild_sched_domains();
        log::info!("sched: cpu {} online", cpu);
        Ok(())
    }

    /// ## 按当前在线的CPU重建调度域
    ///
    /// 新的拓扑快照整体替换旧的，延迟类参数按在线CPU数量重新放大。
    pub fn rebuild_sched_domains(&self) {
        let mut online = CpuMask::new();
        for percpu in self.cpus.iter() {
            if percpu.rq.lock().online {
                online.set(percpu.cpu, true);
            }
        }
        let cpu_topo = self.topology.read().cpu_topo.clone();
        let topo = Arc::new(SchedDomainTopology::build(&cpu_topo, &online));
        *self.topology.write() = topo.clone();

        self.publish_config(online.weight());
        for percpu in self.cpus.iter() {
            let mut rq = percpu.rq.lock();
            rq.cpu_capacity_orig = topo.cpu_capacity_orig(percpu.cpu);
            rq.update_cpu_capacity();
        }
        log::info!("sched: domains rebuilt for {} online cpus", online.weight());
    }

    /// ## 修改CPU的原始算力
    pub fn set_cpu_capacity(&self, cpu: ProcessorId, capacity: u64) -> Result<(), SystemError> {
        let mut cpu_topo = self.topology.read().cpu_topo.clone();
        cpu_topo.set_capacity(cpu, capacity)?;
        {
            let mut topo = self.topology.write();
            let online = topo.online.clone();
            *topo = Arc::new(SchedDomainTopology::build(&cpu_topo, &online));
        }
        self.rebuild_sched_domains();
        Ok(())
    }

    /// 某个CPU上正在运行的任务
    pub fn curr(&self, cpu: ProcessorId) -> Option<Pid> {
        self.cpu_rq(cpu).and_then(|rq| rq.lock().curr)
    }

    pub fn task_info(&self, pid: Pid) -> Result<TaskSchedInfo, SystemError> {
        let (cpu, rq) = self.task_rq_lock(pid)?;
        let t = rq.task(pid).ok_or(SystemError::ESRCH)?;
        Ok(TaskSchedInfo {
            pid,
            cpu,
            policy: t.policy,
            nice: t.nice,
            state: t.state,
            on_rq: t.on_rq,
            group: t.group,
            vruntime: t.se.vruntime,
            sum_exec_runtime: t.se.sum_exec_runtime,
            nr_migrations: t.se.nr_migrations,
            load_avg: t.se.avg.load_avg,
            util_avg: t.se.avg.util_avg,
            run_delay: t.sched_stat.run_delay,
            pcount: t.sched_stat.pcount,
            numa_preferred_nid: t.numa.preferred_nid,
        })
    }

    pub fn cpu_info(&self, cpu: ProcessorId) -> Result<CpuSchedInfo, SystemError> {
        let rq = self.cpu_rq(cpu).ok_or(SystemError::EINVAL)?.lock();
        let root = rq.root_cfs();
        Ok(CpuSchedInfo {
            cpu,
            online: rq.online,
            curr: rq.curr,
            nr_running: rq.nr_running,
            nr_switches: rq.nr_switches,
            min_vruntime: root.min_vruntime,
            load: root.load.weight,
            runnable_load_avg: root.runnable_load_avg,
            util_avg: root.avg.util_avg,
            cpu_capacity: rq.cpu_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{
        clock::ManualClock, config::TunableScaling, fair::MIN_VRUNTIME_BASE, task::SchedAttrBuilder,
        NSEC_PER_MSEC, NSEC_PER_SEC,
    };

    const START: u64 = NSEC_PER_SEC;

    fn cpu(i: u32) -> ProcessorId {
        ProcessorId::new(i)
    }

    fn pid(i: usize) -> Pid {
        Pid::new(i)
    }

    fn setup(topo: CpuTopology, cfg: SchedConfig) -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new(START));
        let sched = Scheduler::new(topo, cfg, clock.clone()).unwrap();
        (clock, sched)
    }

    fn unscaled() -> SchedConfig {
        SchedConfig {
            tunable_scaling: TunableScaling::None,
            ..Default::default()
        }
    }

    fn fork(sched: &Scheduler, p: usize, nice: i32, cpus: Option<CpuMask>) -> Pid {
        let mut b = SchedAttrBuilder::default();
        b.nice(nice);
        if let Some(m) = cpus {
            b.cpus_allowed(m);
        }
        sched.sched_fork(None, pid(p), b.build().unwrap()).unwrap();
        pid(p)
    }

    /// 每个CPU每隔tick纳秒一个时钟滴答，持续dur纳秒
    fn run(sched: &Scheduler, clock: &ManualClock, cpus: &[ProcessorId], dur: u64, tick: u64) {
        let mut t = 0;
        while t < dur {
            clock.advance(tick);
            for c in cpus {
                sched.scheduler_tick(*c).unwrap();
            }
            t += tick;
        }
    }

    #[test]
    fn runtime_follows_weights() {
        let (clock, sched) = setup(CpuTopology::flat(1), unscaled());
        let a = fork(&sched, 1, 0, None);
        // nice 3 的权重是526，大约是nice 0的一半
        let b = fork(&sched, 2, 3, None);
        sched.schedule(cpu(0)).unwrap();

        run(&sched, &clock, &[cpu(0)], 3 * NSEC_PER_SEC, NSEC_PER_MSEC);

        let ra = sched.task_info(a).unwrap().sum_exec_runtime;
        let rb = sched.task_info(b).unwrap().sum_exec_runtime;
        assert_eq!(ra + rb, 3 * NSEC_PER_SEC);
        let expect_a = 3 * NSEC_PER_SEC * 1024 / (1024 + 526);
        assert!(ra.abs_diff(expect_a) < 20 * NSEC_PER_MSEC, "a ran {} expected {}", ra, expect_a);
    }

    #[cfg(feature = "fair_group_sched")]
    #[test]
    fn runtime_follows_group_shares() {
        let (clock, sched) = setup(CpuTopology::flat(1), unscaled());
        let g = sched.create_group(TaskGroupId::ROOT).unwrap();
        sched.set_shares(g, 512).unwrap();
        let a = fork(&sched, 1, 0, None);
        let attr = SchedAttrBuilder::default().group(g).build().unwrap();
        let b = pid(2);
        sched.sched_fork(None, b, attr).unwrap();
        sched.schedule(cpu(0)).unwrap();

        run(&sched, &clock, &[cpu(0)], 3 * NSEC_PER_SEC, NSEC_PER_MSEC);

        // 组实体的权重就是组的shares，两边是1024:512
        let ra = sched.task_info(a).unwrap().sum_exec_runtime;
        let rb = sched.task_info(b).unwrap().sum_exec_runtime;
        let expect_a = 3 * NSEC_PER_SEC * 2 / 3;
        assert!(ra.abs_diff(expect_a) < 30 * NSEC_PER_MSEC, "a ran {} expected {}", ra, expect_a);
        assert!(rb.abs_diff(NSEC_PER_SEC) < 30 * NSEC_PER_MSEC, "b ran {}", rb);
    }

    #[test]
    fn equal_weights_converge() {
        let (clock, sched) = setup(CpuTopology::flat(1), unscaled());
        let pids: Vec<Pid> = (1..=3).map(|i| fork(&sched, i, 0, None)).collect();
        sched.schedule(cpu(0)).unwrap();

        let mut last_v = 0;
        for _ in 0..600 {
            run(&sched, &clock, &[cpu(0)], NSEC_PER_MSEC, NSEC_PER_MSEC);
            let min_v = sched.cpu_info(cpu(0)).unwrap().min_vruntime;
            assert!(min_v >= last_v);
            last_v = min_v;
        }

        let gran = sched.config().min_granularity_ns;
        let share = 600 * NSEC_PER_MSEC / 3;
        for p in pids {
            let r = sched.task_info(p).unwrap().sum_exec_runtime;
            assert!(r.abs_diff(share) <= 4 * gran + sched.config().latency_ns, "{} ran {}", p, r);
        }
    }

    #[test]
    fn forked_child_does_not_preempt_parent() {
        let (clock, sched) = setup(CpuTopology::flat(1), unscaled());
        let parent = fork(&sched, 1, 0, None);
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(parent));
        run(&sched, &clock, &[cpu(0)], 2 * NSEC_PER_MSEC, NSEC_PER_MSEC);

        let child = pid(2);
        sched.sched_fork(Some(parent), child, SchedAttr::default()).unwrap();
        {
            let rq = sched.cpus[0].rq.lock();
            assert!(!rq.need_resched);
            assert_eq!(rq.curr, Some(parent));
            let pv = rq.task(parent).unwrap().se.vruntime;
            let cv = rq.task(child).unwrap().se.vruntime;
            assert!(cv > pv);
        }
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(parent));
    }

    #[test]
    fn child_runs_first_swaps_with_parent() {
        let cfg = SchedConfig {
            child_runs_first: true,
            ..unscaled()
        };
        let (clock, sched) = setup(CpuTopology::flat(1), cfg);
        let parent = fork(&sched, 1, 0, None);
        sched.schedule(cpu(0)).unwrap();
        run(&sched, &clock, &[cpu(0)], NSEC_PER_MSEC, NSEC_PER_MSEC);

        let child = pid(2);
        sched.sched_fork(Some(parent), child, SchedAttr::default()).unwrap();
        assert!(sched.cpus[0].rq.lock().need_resched);
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(child));
    }

    #[test]
    fn migration_rebases_vruntime() {
        let (_clock, sched) = setup(CpuTopology::flat(2), unscaled());
        let t = fork(&sched, 1, 0, Some(CpuMask::from_cpus([cpu(0)])));
        sched.cpus[1].rq.lock().cfs_rqs[GroupSlot::ROOT].min_vruntime = MIN_VRUNTIME_BASE + 5000;

        let lag_before = {
            let rq = sched.cpus[0].rq.lock();
            rq.task(t).unwrap().se.vruntime - rq.root_cfs().min_vruntime
        };
        let total_before: u32 = (0..2).map(|i| sched.cpu_info(cpu(i)).unwrap().nr_running).sum();

        sched.set_cpus_allowed(t, CpuMask::from_cpus([cpu(1)])).unwrap();

        let info = sched.task_info(t).unwrap();
        assert_eq!(info.cpu, cpu(1));
        assert_eq!(info.nr_migrations, 1);
        let min1 = sched.cpu_info(cpu(1)).unwrap().min_vruntime;
        assert_eq!(info.vruntime - min1, lag_before);
        assert!(info.vruntime >= MIN_VRUNTIME_BASE + 5000);

        let total_after: u32 = (0..2).map(|i| sched.cpu_info(cpu(i)).unwrap().nr_running).sum();
        assert_eq!(total_before, total_after);
        assert!(!sched.cpus[0].rq.lock().has_task(t));
        assert!(sched.cpus[1].rq.lock().has_task(t));
    }

    #[test]
    fn newly_idle_cpu_pulls_one_task() {
        let (clock, sched) = setup(CpuTopology::flat(5), unscaled());
        clock.advance(10 * NSEC_PER_MSEC);
        let only0 = CpuMask::from_cpus([cpu(0)]);
        let a = fork(&sched, 1, 0, Some(only0.clone()));
        let b = fork(&sched, 2, 0, Some(only0));
        for p in [a, b] {
            sched.set_cpus_allowed(p, CpuMask::first_n(5)).unwrap();
        }
        assert_eq!(sched.cpu_info(cpu(0)).unwrap().nr_running, 2);
        let first = sched.schedule(cpu(0)).unwrap().unwrap();

        let pulled = sched.schedule(cpu(1)).unwrap();
        assert!(pulled.is_some());
        assert_ne!(pulled, Some(first));
        assert_eq!(sched.curr(cpu(0)), Some(first));

        let running: Vec<u32> = (0..5).map(|i| sched.cpu_info(cpu(i)).unwrap().nr_running).collect();
        assert_eq!(running, alloc::vec![1, 1, 0, 0, 0]);
    }

    #[test]
    fn sleep_and_wake_keep_counts() {
        let (clock, sched) = setup(CpuTopology::flat(1), unscaled());
        let a = fork(&sched, 1, 0, None);
        let b = fork(&sched, 2, 0, None);
        // 第二个任务入队时队列里已有两个任务，START_DEBIT的虚拟时间片更短，先运行
        assert!(sched.task_info(b).unwrap().vruntime < sched.task_info(a).unwrap().vruntime);
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(b));
        run(&sched, &clock, &[cpu(0)], NSEC_PER_MSEC, NSEC_PER_MSEC);

        sched.sleep(b).unwrap();
        assert_eq!(sched.cpu_info(cpu(0)).unwrap().nr_running, 1);
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(a));
        run(&sched, &clock, &[cpu(0)], 10 * NSEC_PER_MSEC, NSEC_PER_MSEC);

        assert!(sched.wake_up(b, Some(a), WakeupFlags::empty()).unwrap());
        assert!(!sched.wake_up(b, None, WakeupFlags::empty()).unwrap());
        assert_eq!(sched.cpu_info(cpu(0)).unwrap().nr_running, 2);
        let info = sched.task_info(b).unwrap();
        assert_eq!(info.on_rq, OnRq::Queued);
        // 睡了很久的任务不会拿到超过半个调度周期的补偿
        let min_v = sched.cpu_info(cpu(0)).unwrap().min_vruntime;
        assert!(min_v.saturating_sub(info.vruntime) <= sched.config().latency_ns / 2);

        sched.exit(a).unwrap();
        assert_eq!(sched.cpu_info(cpu(0)).unwrap().nr_running, 1);
        assert_eq!(sched.task_info(a).unwrap_err(), SystemError::ESRCH);
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(b));
    }

    #[test]
    fn rt_task_preempts_fair_task() {
        let (_clock, sched) = setup(CpuTopology::flat(1), unscaled());
        let f = fork(&sched, 1, 0, None);
        sched.schedule(cpu(0)).unwrap();
        let attr = SchedAttrBuilder::default()
            .policy(SchedPolicy::FIFO)
            .rt_priority(10u32)
            .build()
            .unwrap();
        sched.sched_fork(None, pid(2), attr).unwrap();
        assert!(sched.cpus[0].rq.lock().need_resched);
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(pid(2)));

        sched.set_policy(pid(2), SchedPolicy::CFS, 0).unwrap();
        sched.set_policy(f, SchedPolicy::RR, 5).unwrap();
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(f));
        assert_eq!(sched.set_policy(f, SchedPolicy::RR, 0), Err(SystemError::EINVAL));
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let (_clock, sched) = setup(CpuTopology::flat(2), unscaled());
        let a = fork(&sched, 1, 0, None);
        assert_eq!(sched.sched_fork(None, a, SchedAttr::default()), Err(SystemError::EEXIST));
        let bad_nice = SchedAttr {
            nice: 40,
            ..Default::default()
        };
        assert_eq!(sched.sched_fork(None, pid(9), bad_nice), Err(SystemError::EINVAL));
        assert_eq!(sched.set_cpus_allowed(a, CpuMask::new()), Err(SystemError::EINVAL));
        assert_eq!(sched.schedule(cpu(7)), Err(SystemError::EINVAL));
        assert_eq!(sched.sleep(pid(42)), Err(SystemError::ESRCH));
        assert_eq!(sched.cpu_offline(cpu(9)), Err(SystemError::EINVAL));
    }

    #[test]
    fn nice_change_reweights() {
        let (_clock, sched) = setup(CpuTopology::flat(1), unscaled());
        let a = fork(&sched, 1, 0, None);
        sched.set_user_nice(a, -5).unwrap();
        let rq = sched.cpus[0].rq.lock();
        assert_eq!(rq.task(a).unwrap().se.load.weight, 3121);
        assert_eq!(rq.root_cfs().load.weight, 3121);
    }

    #[test]
    fn offline_cpu_is_drained() {
        let (_clock, sched) = setup(CpuTopology::flat(3), unscaled());
        let only2 = CpuMask::from_cpus([cpu(2)]);
        let a = fork(&sched, 1, 0, Some(only2.clone()));
        let b = fork(&sched, 2, 0, Some(only2));
        sched.schedule(cpu(2)).unwrap();
        sched.sleep(b).unwrap();

        sched.cpu_offline(cpu(2)).unwrap();
        assert!(!sched.online_mask().contains(cpu(2)));
        assert_eq!(sched.cpu_info(cpu(2)).unwrap().nr_running, 0);
        assert_ne!(sched.task_cpu(a), Some(cpu(2)));
        assert_ne!(sched.task_cpu(b), Some(cpu(2)));
        assert_eq!(sched.task_info(a).unwrap().on_rq, OnRq::Queued);
        assert_eq!(sched.cpu_offline(cpu(0)), Ok(()));
        assert_eq!(sched.cpu_offline(cpu(1)), Err(SystemError::EBUSY));

        sched.cpu_online(cpu(2)).unwrap();
        assert!(sched.online_mask().contains(cpu(2)));
    }

    #[cfg(feature = "fair_group_sched")]
    #[test]
    fn group_lifecycle() {
        let (_clock, sched) = setup(CpuTopology::flat(2), unscaled());
        let g = sched.create_group(TaskGroupId::ROOT).unwrap();
        let a = fork(&sched, 1, 0, None);
        sched.move_task_to_group(a, g).unwrap();
        assert_eq!(sched.task_group(a).unwrap(), g);
        assert_eq!(sched.destroy_group(g), Err(SystemError::EBUSY));

        sched.set_shares(g, 2048).unwrap();
        assert_eq!(sched.set_shares(TaskGroupId::ROOT, 2048), Err(SystemError::EINVAL));

        sched.move_task_to_group(a, TaskGroupId::ROOT).unwrap();
        sched.destroy_group(g).unwrap();
        assert_eq!(sched.set_shares(g, 1024), Err(SystemError::ESRCH));
    }

    #[cfg(feature = "cfs_bandwidth")]
    #[test]
    fn quota_throttles_until_next_period() {
        let (clock, sched) = setup(CpuTopology::flat(1), unscaled());
        let g = sched.create_group(TaskGroupId::ROOT).unwrap();
        sched
            .tg_set_cfs_bandwidth(g, 100 * NSEC_PER_MSEC, 50 * NSEC_PER_MSEC, 0)
            .unwrap();
        let attr = SchedAttrBuilder::default().group(g).build().unwrap();
        let t = pid(1);
        sched.sched_fork(None, t, attr).unwrap();
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(t));

        run(&sched, &clock, &[cpu(0)], 99 * NSEC_PER_MSEC, NSEC_PER_MSEC);
        assert_eq!(sched.task_info(t).unwrap().sum_exec_runtime, 50 * NSEC_PER_MSEC);
        assert_eq!(sched.curr(cpu(0)), None);

        // 下一个周期开始时恢复运行
        run(&sched, &clock, &[cpu(0)], NSEC_PER_MSEC, NSEC_PER_MSEC);
        assert_eq!(sched.curr(cpu(0)), Some(t));

        run(&sched, &clock, &[cpu(0)], 99 * NSEC_PER_MSEC, NSEC_PER_MSEC);
        let ran = sched.task_info(t).unwrap().sum_exec_runtime - 50 * NSEC_PER_MSEC;
        let slice = sched.config().cfs_bandwidth_slice_ns;
        assert!(ran <= 50 * NSEC_PER_MSEC + slice, "ran {} in one period", ran);
        assert!(ran >= 45 * NSEC_PER_MSEC);

        let groups = sched.groups.read();
        let stats = groups.get(g).unwrap().bandwidth.stats();
        assert!(stats.nr_throttled >= 1);
        assert!(stats.throttled_time > 0);
    }
}
