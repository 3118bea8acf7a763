pub mod balance;
pub mod bandwidth;
pub mod clock;
pub mod config;
pub mod core;
pub mod entity;
pub mod fair;
pub mod group;
pub mod idle;
pub mod numa;
pub mod pelt;
pub mod rt;
pub mod task;
pub mod timeline;
pub mod topology;
pub mod wakeup;

use ::core::ops::{Index, IndexMut};

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

use crate::smp::cpu::{NodeId, ProcessorId};

use self::{
    clock::SchedClock,
    config::SchedConfig,
    entity::{EntityRef, EntityStore, FairSchedEntity},
    fair::CfsRunQueue,
    group::GroupSlot,
    pelt::SchedulerAvg,
    rt::RtRunQueue,
    task::{Pid, SchedTask},
};

pub const SCHED_FIXEDPOINT_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SHIFT: u32 = SCHED_FIXEDPOINT_SHIFT;
/// 一个满载CPU的计算能力
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;

/// nice值为0的任务的权重
pub const NICE_0_LOAD: u64 = 1024;
/// SCHED_IDLE策略的任务的权重
pub const WEIGHT_IDLEPRIO: u64 = 3;

/// 任务组份额的下界与上界
pub const MIN_SHARES: u64 = 2;
pub const MAX_SHARES: u64 = 1 << 18;

pub const MIN_NICE: i32 = -20;
pub const MAX_NICE: i32 = 19;
pub const MAX_RT_PRIO: usize = 100;

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// nice值到权重的映射，相邻两级之间大约相差1.25倍，
/// 这样nice值每变化1，任务获得的CPU时间大约变化10%
pub const SCHED_PRIO_TO_WEIGHT: [u64; 40] = [
    /* -20 */ 88761, 71755, 56483, 46273, 36291,
    /* -15 */ 29154, 23254, 18705, 14949, 11916,
    /* -10 */ 9548, 7620, 6100, 4904, 3906,
    /*  -5 */ 3121, 2501, 1991, 1586, 1277,
    /*   0 */ 1024, 820, 655, 526, 423,
    /*   5 */ 335, 272, 215, 172, 137,
    /*  10 */ 110, 87, 70, 56, 45,
    /*  15 */ 36, 29, 23, 18, 15,
];

/// nice值对应的权重，超出范围的nice值会被截断
pub fn nice_to_weight(nice: i32) -> u64 {
    let idx = (nice.clamp(MIN_NICE, MAX_NICE) - MIN_NICE) as usize;
    SCHED_PRIO_TO_WEIGHT[idx]
}

lazy_static! {
    /// 默认开启的调度特性
    pub static ref DEFAULT_SCHED_FEATURES: SchedFeature = SchedFeature::GENTLE_FAIR_SLEEPERS
        | SchedFeature::START_DEBIT
        | SchedFeature::LAST_BUDDY
        | SchedFeature::CACHE_HOT_BUDDY
        | SchedFeature::WAKEUP_PREEMPTION
        | SchedFeature::NONTASK_CAPACITY
        | SchedFeature::BASE_SLICE
        | SchedFeature::LB_MIN
        | SchedFeature::WA_IDLE
        | SchedFeature::WA_WEIGHT
        | SchedFeature::NUMA;
}

bitflags! {
    pub struct SchedFeature:u32 {
        /// 给予睡眠任务仅有 50% 的服务赤字。这意味着睡眠任务在被唤醒后会获得一定的服务，但不能过多地占用资源。
        const GENTLE_FAIR_SLEEPERS = 1 << 0;
        /// 将新任务排在后面，以避免已经运行的任务被饿死
        const START_DEBIT = 1 << 1;
        /// 在调度时优先选择上次唤醒的任务，因为它可能会访问之前唤醒的任务所使用的数据，从而提高缓存局部性。
        const NEXT_BUDDY = 1 << 2;
        /// 在调度时优先选择上次运行的任务，因为它可能会访问与之前运行的任务相同的数据，从而提高缓存局部性。
        const LAST_BUDDY = 1 << 3;
        /// 认为任务的伙伴（buddy）在缓存中是热点，减少缓存伙伴被迁移的可能性，从而提高缓存局部性。
        const CACHE_HOT_BUDDY = 1 << 4;
        /// 允许唤醒时抢占当前任务。
        const WAKEUP_PREEMPTION = 1 << 5;
        /// 基于非公平调度任务（实时任务）占用的时间来减少 CPU 的容量。
        const NONTASK_CAPACITY = 1 << 6;
        /// 时间片不低于最小调度粒度
        const BASE_SLICE = 1 << 7;
        /// 负载均衡时跳过负载很小的任务
        const LB_MIN = 1 << 8;
        /// wake_affine时优先考虑空闲CPU
        const WA_IDLE = 1 << 9;
        /// wake_affine时比较两个CPU的负载
        const WA_WEIGHT = 1 << 10;
        /// 负载均衡时考虑NUMA局部性
        const NUMA = 1 << 11;
    }
}

bitflags! {
    pub struct EnqueueFlag: u8 {
        const ENQUEUE_WAKEUP = 0x01;
        const ENQUEUE_RESTORE = 0x02;
        const ENQUEUE_MOVE = 0x04;
        const ENQUEUE_NOCLOCK = 0x08;
        const ENQUEUE_HEAD = 0x10;
        const ENQUEUE_INITIAL = 0x20;
        const ENQUEUE_MIGRATED = 0x40;
    }

    pub struct DequeueFlag: u8 {
        const DEQUEUE_SLEEP = 0x01;
        const DEQUEUE_SAVE = 0x02;
        const DEQUEUE_MOVE = 0x04;
        const DEQUEUE_NOCLOCK = 0x08;
    }

    pub struct WakeupFlags: u8 {
        /// 唤醒者马上就要睡眠
        const WF_SYNC = 0x01;
        /// 新创建的任务第一次被唤醒
        const WF_FORK = 0x02;
        /// 唤醒过程中任务被迁移到了别的CPU
        const WF_MIGRATED = 0x04;
    }
}

/// 调度策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[allow(clippy::upper_case_acronyms)]
pub enum SchedPolicy {
    /// 普通任务，完全公平调度
    CFS = 0,
    FIFO = 1,
    RR = 2,
    /// 批处理任务，不参与唤醒抢占
    BATCH = 3,
    /// 只在CPU空闲时运行的任务
    IDLE = 5,
}

impl SchedPolicy {
    #[inline]
    pub fn is_rt(&self) -> bool {
        matches!(self, SchedPolicy::FIFO | SchedPolicy::RR)
    }

    #[inline]
    pub fn is_fair(&self) -> bool {
        !self.is_rt()
    }

    /// 该策略对应的调度类
    pub fn class(&self) -> &'static dyn SchedClass {
        if self.is_rt() {
            &rt::RtSchedClass
        } else {
            &fair::CompletelyFairScheduler
        }
    }
}

/// 调度类
///
/// 调度类是一个封闭的集合：实时、公平和空闲。核心调度器按照实时、公平、空闲的顺序
/// 向各调度类询问下一个要运行的任务。所有方法都在持有该CPU运行队列锁的情况下调用。
pub trait SchedClass: Send + Sync {
    /// ## 任务进入可运行状态时调用，把任务放进对应的队列
    fn enqueue_task(&self, rq: &mut CpuRunQueue, pid: Pid, flags: EnqueueFlag);

    /// ## 任务不再可运行时调用，把任务移出队列
    fn dequeue_task(&self, rq: &mut CpuRunQueue, pid: Pid, flags: DequeueFlag);

    /// ## 主动让出cpu
    fn yield_task(&self, rq: &mut CpuRunQueue);

    /// ## 检查进入可运行状态的任务能否抢占当前正在运行的任务
    fn check_preempt_curr(&self, rq: &mut CpuRunQueue, pid: Pid, flags: WakeupFlags);

    /// ## 选择接下来最适合运行的任务
    fn pick_next_task(&self, rq: &mut CpuRunQueue) -> Option<Pid>;

    /// ## 正在运行的任务即将被换下
    fn put_prev_task(&self, rq: &mut CpuRunQueue, prev: Pid);

    /// ## 把一个已经在队列中的任务设为正在运行（改变调度类或任务组时使用）
    fn set_next_task(&self, rq: &mut CpuRunQueue, pid: Pid);

    /// ## 被时间滴答函数调用，它可能导致进程切换。驱动了运行时抢占。
    fn task_tick(&self, rq: &mut CpuRunQueue, pid: Pid, queued: bool);

    /// ## 新任务创建时调用，任务还没有进入队列
    fn task_fork(&self, rq: &mut CpuRunQueue, pid: Pid);

    /// ## 更新正在运行的任务的运行时间统计
    fn update_curr(&self, rq: &mut CpuRunQueue);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadWeight {
    /// 负载权重
    pub weight: u64,
    /// weight的倒数，方便计算
    pub inv_weight: u32,
}

impl Default for LoadWeight {
    fn default() -> Self {
        Self::new(0)
    }
}

impl LoadWeight {
    pub const WMULT_SHIFT: u32 = 32;
    pub const WMULT_CONST: u32 = !0;

    pub const fn new(weight: u64) -> Self {
        Self {
            weight,
            inv_weight: Self::inv_of(weight),
        }
    }

    pub fn update_add(&mut self, inc: u64) {
        self.update_set(self.weight + inc);
    }

    /// 减少权重，结果不会小于0
    pub fn update_sub(&mut self, dec: u64) {
        self.update_set(self.weight.saturating_sub(dec));
    }

    pub fn update_set(&mut self, weight: u64) {
        self.weight = weight;
        self.inv_weight = Self::inv_of(weight);
    }

    const fn inv_of(weight: u64) -> u32 {
        if weight >= Self::WMULT_CONST as u64 {
            // 高位有数据
            1
        } else if weight == 0 {
            // 倒数取最大
            Self::WMULT_CONST
        } else {
            Self::WMULT_CONST / weight as u32
        }
    }

    /// ## 计算 delta_exec * weight / self.weight
    ///
    /// 使用预先计算好的倒数做定点乘法：(delta_exec * (weight * self.inv_weight)) >> WMULT_SHIFT，
    /// 过程中保证乘数不超过32位。
    pub fn calculate_delta(&self, delta_exec: u64, weight: u64) -> u64 {
        let mut fact = weight;
        // 用于恢复
        let mut shift = Self::WMULT_SHIFT;

        let fact_hi = (fact >> 32) as u32;
        if fact_hi != 0 {
            let fs = 32 - fact_hi.leading_zeros();
            shift -= fs;
            fact >>= fs;
        }

        // 这里确定了fact已经在32位内
        fact *= self.inv_weight as u64;

        let fact_hi = (fact >> 32) as u32;
        if fact_hi != 0 {
            let fs = 32 - fact_hi.leading_zeros();
            shift -= fs;
            fact >>= fs;
        }

        return ((delta_exec as u128 * fact as u128) >> shift) as u64;
    }
}

/// 按运行队列维护的任务组运行队列，下标为任务组的槽位
#[derive(Debug, Default)]
pub struct CfsRqSlots {
    slots: Vec<Option<CfsRunQueue>>,
}

impl CfsRqSlots {
    pub fn get(&self, slot: GroupSlot) -> Option<&CfsRunQueue> {
        self.slots.get(slot.index()).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, slot: GroupSlot) -> Option<&mut CfsRunQueue> {
        self.slots.get_mut(slot.index()).and_then(|s| s.as_mut())
    }

    pub fn install(&mut self, slot: GroupSlot, cfs_rq: CfsRunQueue) {
        if self.slots.len() <= slot.index() {
            self.slots.resize_with(slot.index() + 1, || None);
        }
        self.slots[slot.index()] = Some(cfs_rq);
    }

    pub fn remove(&mut self, slot: GroupSlot) -> Option<CfsRunQueue> {
        self.slots.get_mut(slot.index()).and_then(|s| s.take())
    }

    /// 所有存在的任务组运行队列
    pub fn iter(&self) -> impl Iterator<Item = &CfsRunQueue> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// 按深度从深到浅排列的槽位，用于自底向上的更新
    pub fn slots_bottom_up(&self) -> Vec<GroupSlot> {
        let mut v: Vec<(u32, GroupSlot)> = self.iter().map(|c| (c.depth, c.slot)).collect();
        v.sort_by(|a, b| b.0.cmp(&a.0));
        v.into_iter().map(|(_, s)| s).collect()
    }
}

impl Index<GroupSlot> for CfsRqSlots {
    type Output = CfsRunQueue;

    fn index(&self, slot: GroupSlot) -> &CfsRunQueue {
        match self.get(slot) {
            Some(c) => c,
            None => panic!("BUG: cfs_rq of group slot {} is missing", slot),
        }
    }
}

impl IndexMut<GroupSlot> for CfsRqSlots {
    fn index_mut(&mut self, slot: GroupSlot) -> &mut CfsRunQueue {
        match self.get_mut(slot) {
            Some(c) => c,
            None => panic!("BUG: cfs_rq of group slot {} is missing", slot),
        }
    }
}

/// ## PerCpu的运行队列，其中维护了各个调度类对应的rq
///
/// 整个结构由该CPU的运行队列锁保护。驻留在该CPU上的任务的调度信息也归它所有，
/// 迁移时任务的记录先从源队列中取出，再放进目标队列。
pub struct CpuRunQueue {
    pub cpu: ProcessorId,
    pub node: NodeId,
    pub online: bool,
    pub(crate) cfg: Arc<SchedConfig>,
    pub(crate) clock_src: Arc<dyn SchedClock>,

    /// 运行队列时钟
    pub clock: u64,
    /// 扣除了中断等时间之后的任务时钟
    pub clock_task: u64,
    /// 按CPU算力缩放之后的PELT时钟
    pub clock_pelt: u64,
    pub lost_idle_time: u64,

    /// 该CPU上所有调度类可运行任务的数量（不含被限流的任务）
    pub nr_running: u32,
    pub nr_switches: u64,
    /// 正在运行的任务，None表示正在运行idle
    pub curr: Option<Pid>,
    pub need_resched: bool,

    pub(crate) ents: EntityStore,
    pub(crate) cfs_rqs: CfsRqSlots,
    pub(crate) rt: RtRunQueue,
    /// 该CPU上处于队列中的公平调度任务，负载均衡时从尾部开始挑选
    pub(crate) cfs_tasks: VecDeque<Pid>,

    /// 扣除实时任务占用之后，留给公平调度任务的算力
    pub cpu_capacity: u64,
    pub cpu_capacity_orig: u64,
    pub avg_rt: SchedulerAvg,

    pub idle_stamp: u64,
    /// 平均空闲时长，用于限制newidle均衡的开销
    pub avg_idle: u64,
    pub max_idle_balance_cost: u64,
    pub next_balance: u64,
    /// 是否有一个主动均衡请求在路上
    pub active_balance: bool,
    pub push_cpu: ProcessorId,
    pub last_blocked_load_update: u64,

    pub nr_numa_running: u32,
    pub nr_preferred_running: u32,
}

impl CpuRunQueue {
    pub fn new(
        cpu: ProcessorId,
        node: NodeId,
        capacity: u64,
        cfg: Arc<SchedConfig>,
        clock_src: Arc<dyn SchedClock>,
        root: CfsRunQueue,
    ) -> Self {
        let mut cfs_rqs = CfsRqSlots::default();
        cfs_rqs.install(GroupSlot::ROOT, root);
        let max_idle_balance_cost = cfg.migration_cost_ns.max(0) as u64;
        let now = clock_src.sched_clock();
        Self {
            cpu,
            node,
            online: true,
            cfg,
            clock_src,
            clock: now,
            clock_task: now,
            clock_pelt: now,
            lost_idle_time: 0,
            nr_running: 0,
            nr_switches: 0,
            curr: None,
            need_resched: false,
            ents: EntityStore::default(),
            cfs_rqs,
            rt: RtRunQueue::new(),
            cfs_tasks: VecDeque::new(),
            cpu_capacity: capacity,
            cpu_capacity_orig: capacity,
            avg_rt: SchedulerAvg::default(),
            idle_stamp: 0,
            avg_idle: 2 * max_idle_balance_cost,
            max_idle_balance_cost,
            next_balance: now,
            active_balance: false,
            push_cpu: ProcessorId::INVALID,
            last_blocked_load_update: now,
            nr_numa_running: 0,
            nr_preferred_running: 0,
        }
    }

    /// 换上新的调参快照
    pub fn refresh_config(&mut self, cfg: &Arc<SchedConfig>) {
        if !Arc::ptr_eq(&self.cfg, cfg) {
            self.cfg = cfg.clone();
        }
    }

    #[inline]
    pub fn sched_feat(&self, feat: SchedFeature) -> bool {
        self.cfg.features.contains(feat)
    }

    /// ## 更新运行队列的时钟
    pub fn update_rq_clock(&mut self) {
        let now = self.clock_src.sched_clock();
        if now > self.clock {
            self.clock = now;
        }
        let task_now = self.clock_src.task_clock(self.cpu);
        if task_now > self.clock_task {
            let delta = task_now - self.clock_task;
            self.clock_task = task_now;
            self.update_rq_clock_pelt(delta);
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.curr.is_none()
    }

    /// 标记当前任务需要被重新调度
    #[inline]
    pub fn resched_curr(&mut self) {
        self.need_resched = true;
    }

    pub fn add_nr_running(&mut self, count: u32) {
        self.nr_running += count;
    }

    pub fn sub_nr_running(&mut self, count: u32) {
        if self.nr_running < count {
            log::warn!(
                "cpu {}: nr_running underflow ({} - {})",
                self.cpu,
                self.nr_running,
                count
            );
            self.nr_running = 0;
        } else {
            self.nr_running -= count;
        }
    }

    pub fn task(&self, pid: Pid) -> Option<&SchedTask> {
        self.ents.task(pid)
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut SchedTask> {
        self.ents.task_mut(pid)
    }

    /// 该CPU上驻留的所有任务（包括睡眠的）
    pub fn resident_tasks(&self) -> impl Iterator<Item = &SchedTask> {
        self.ents.tasks()
    }

    pub fn root_cfs(&self) -> &CfsRunQueue {
        &self.cfs_rqs[GroupSlot::ROOT]
    }

    pub fn cfs_rq(&self, slot: GroupSlot) -> Option<&CfsRunQueue> {
        self.cfs_rqs.get(slot)
    }

    pub fn entity(&self, e: EntityRef) -> Option<&FairSchedEntity> {
        self.ents.get(e)
    }

    /// 任务记录是否驻留在该CPU上
    pub fn has_task(&self, pid: Pid) -> bool {
        self.ents.task(pid).is_some()
    }

    /// 正在运行的任务的调度策略
    pub fn curr_policy(&self) -> Option<SchedPolicy> {
        self.curr.and_then(|p| self.task(p)).map(|t| t.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_table_steps_by_about_ten_percent() {
        assert_eq!(nice_to_weight(0), NICE_0_LOAD);
        assert_eq!(nice_to_weight(-100), 88761);
        assert_eq!(nice_to_weight(100), 15);
        for w in SCHED_PRIO_TO_WEIGHT.windows(2) {
            let ratio = w[0] * 1000 / w[1];
            assert!((1180..=1300).contains(&ratio), "ratio {}", ratio);
        }
    }

    #[test]
    fn calculate_delta_scales_by_weight_ratio() {
        let lw = LoadWeight::new(2048);
        assert_eq!(lw.calculate_delta(1_000_000, 1024), 499_999);
        let lw = LoadWeight::new(1024);
        assert_eq!(lw.calculate_delta(3_000, 1024), 2_999);
        let lw = LoadWeight::new(512);
        let d = lw.calculate_delta(1_000_000, 1024);
        assert!((1_999_990..=2_000_010).contains(&d), "{}", d);
        // 超过32位的权重
        let lw = LoadWeight::new(1 << 20);
        let d = lw.calculate_delta(1 << 20, 1 << 40);
        assert!(d > (1 << 39) && d <= (1 << 40));
    }

    #[test]
    fn load_weight_sub_saturates() {
        let mut lw = LoadWeight::new(10);
        lw.update_sub(20);
        assert_eq!(lw.weight, 0);
        assert_eq!(lw.inv_weight, LoadWeight::WMULT_CONST);
    }
}
