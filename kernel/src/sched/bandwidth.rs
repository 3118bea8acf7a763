//! CFS带宽控制
//!
//! 每个任务组有一个运行时间池，每个周期补充quota（可以额外积攒burst）。
//! 各CPU上的组运行队列按slice从池中取运行时间，取不到时被限流：组实体被移出父队列，
//! 子树的PELT时间冻结。周期定时器补充运行时间后，按限流的先后顺序把运行时间分给
//! 被限流的队列并解除限流；队列空闲时多余的运行时间会被归还，由slack定时器重新分配。
//!
//! 定时器不依赖外部设施，以截止时间的形式保存，在时钟滴答中检查是否到期。

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use system_error::SystemError;

use crate::{
    libs::spinlock::SpinLock,
    smp::cpu::ProcessorId,
};

use super::{
    core::Scheduler,
    entity::EntityRef,
    group::{GroupSlot, TaskGroup, TaskGroupId},
    CpuRunQueue, DequeueFlag, EnqueueFlag, NSEC_PER_MSEC, NSEC_PER_SEC,
};

/// 不限制运行时间
pub const RUNTIME_INF: u64 = u64::MAX;

pub const DEFAULT_CFS_PERIOD_NS: u64 = 100 * NSEC_PER_MSEC;
/// 周期和配额的下限
pub const MIN_CFS_QUOTA_PERIOD_NS: u64 = NSEC_PER_MSEC;
/// 周期的上限
pub const MAX_CFS_QUOTA_PERIOD_NS: u64 = NSEC_PER_SEC;
/// 周期定时器剩余不到这么久时，slack定时器不再工作
const MIN_BANDWIDTH_EXPIRATION_NS: u64 = 2 * NSEC_PER_MSEC;

/// 比例的定点表示
const BW_SHIFT: u32 = 20;

/// 带宽控制是否被编译进来
#[inline]
pub const fn cfs_bandwidth_used() -> bool {
    cfg!(feature = "cfs_bandwidth")
}

/// 带宽控制的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthStats {
    /// 经过的周期数
    pub nr_periods: u64,
    /// 其中有队列被限流的周期数
    pub nr_throttled: u64,
    /// 所有CPU上被限流的总时长
    pub throttled_time: u64,
}

#[derive(Debug, Default)]
pub struct BandwidthInner {
    /// 被限流的组运行队列所在的CPU，按限流的先后顺序排列
    pub throttled: VecDeque<ProcessorId>,
    /// 周期定时器的下一次到期时间，None表示没有启动
    pub period_deadline: Option<u64>,
    pub slack_deadline: Option<u64>,
    pub stats: BandwidthStats,
}

#[derive(Debug)]
pub struct CfsBandwidth {
    quota: AtomicU64,
    period: AtomicU64,
    burst: AtomicU64,
    /// 池中剩余的运行时间
    runtime: AtomicU64,
    /// 按祖先中最严格的限制折算后的配额比例
    hierarchical_quota: AtomicU64,
    /// 上个周期没有任何队列来取运行时间
    idle: AtomicBool,
    cas_retries: AtomicU64,
    pub(crate) inner: SpinLock<BandwidthInner>,
}

impl Default for CfsBandwidth {
    fn default() -> Self {
        Self::new()
    }
}

impl CfsBandwidth {
    pub fn new() -> Self {
        Self {
            quota: AtomicU64::new(RUNTIME_INF),
            period: AtomicU64::new(DEFAULT_CFS_PERIOD_NS),
            burst: AtomicU64::new(0),
            runtime: AtomicU64::new(0),
            hierarchical_quota: AtomicU64::new(RUNTIME_INF),
            idle: AtomicBool::new(false),
            cas_retries: AtomicU64::new(0),
            inner: SpinLock::new(BandwidthInner::default()),
        }
    }

    #[inline]
    pub fn quota(&self) -> u64 {
        self.quota.load(Ordering::Acquire)
    }

    #[inline]
    pub fn period(&self) -> u64 {
        self.period.load(Ordering::Acquire)
    }

    #[inline]
    pub fn burst(&self) -> u64 {
        self.burst.load(Ordering::Acquire)
    }

    /// 池中剩余的运行时间
    #[inline]
    pub fn runtime(&self) -> u64 {
        self.runtime.load(Ordering::Acquire)
    }

    #[inline]
    pub fn runtime_enabled(&self) -> bool {
        self.quota() != RUNTIME_INF
    }

    pub fn cas_retries(&self) -> u64 {
        self.cas_retries.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BandwidthStats {
        self.inner.lock().stats
    }

    fn max_runtime(&self) -> u64 {
        self.quota().saturating_add(self.burst())
    }

    /// ## 从池中最多取出want纳秒的运行时间，返回实际取到的
    pub(crate) fn draw_runtime(&self, want: u64) -> u64 {
        let mut cur = self.runtime.load(Ordering::Acquire);
        loop {
            if cur == 0 || want == 0 {
                return 0;
            }
            let amount = cur.min(want);
            match self.runtime.compare_exchange_weak(
                cur,
                cur - amount,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return amount,
                Err(v) => {
                    self.cas_retries.fetch_add(1, Ordering::Relaxed);
                    cur = v;
                }
            }
        }
    }

    /// 把运行时间还给池，池的容量不超过quota + burst
    fn give_back_runtime(&self, amount: u64) -> u64 {
        let cap = self.max_runtime();
        let mut cur = self.runtime.load(Ordering::Acquire);
        loop {
            let new = cur.saturating_add(amount).min(cap);
            match self
                .runtime
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return new,
                Err(v) => {
                    self.cas_retries.fetch_add(1, Ordering::Relaxed);
                    cur = v;
                }
            }
        }
    }

    /// 新的周期开始，补充一个quota的运行时间
    fn refill_runtime(&self) {
        if !self.runtime_enabled() {
            return;
        }
        let quota = self.quota();
        let cap = self.max_runtime();
        let _ = self
            .runtime
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_add(quota).min(cap))
            });
    }

    /// 启动周期定时器（如果还没有启动）
    pub(crate) fn start_period_timer(&self, inner: &mut BandwidthInner, now: u64) {
        if inner.period_deadline.is_none() {
            inner.period_deadline = Some(now + self.period());
        }
    }

    /// 距离下一次补充运行时间是否不到min_expire
    fn runtime_refresh_within(inner: &BandwidthInner, now: u64, min_expire: u64) -> bool {
        match inner.period_deadline {
            Some(deadline) => deadline.saturating_sub(now) < min_expire,
            None => false,
        }
    }

    /// ## 如果周期定时器到期，返回经过的周期数，并把定时器推到下一个周期
    fn claim_period_timer(&self, now: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        let deadline = inner.period_deadline?;
        if now < deadline {
            return None;
        }
        let period = self.period().max(1);
        let overrun = (now - deadline) / period + 1;
        inner.period_deadline = Some(deadline + overrun * period);
        Some(overrun)
    }

    fn claim_slack_timer(&self, now: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.slack_deadline {
            Some(deadline) if now >= deadline => {
                inner.slack_deadline = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove_throttled(&self, cpu: ProcessorId) {
        self.inner.lock().throttled.retain(|c| *c != cpu);
    }

    /// 定时器是否处于启动状态
    pub fn timers_armed(&self) -> bool {
        let inner = self.inner.lock();
        inner.period_deadline.is_some() || inner.slack_deadline.is_some()
    }
}

/// 配额与周期的比例
fn to_ratio(period: u64, runtime: u64) -> u64 {
    if runtime == RUNTIME_INF {
        return RUNTIME_INF;
    }
    if period == 0 {
        return 0;
    }
    ((runtime as u128) << BW_SHIFT).checked_div(period as u128).unwrap_or(0) as u64
}

impl CpuRunQueue {
    #[inline]
    pub fn cfs_rq_throttled(&self, slot: GroupSlot) -> bool {
        cfs_bandwidth_used() && self.cfs_rqs[slot].throttled
    }

    /// 运行队列本身或者它的某个祖先被限流
    #[inline]
    pub fn throttled_hierarchy(&self, slot: GroupSlot) -> bool {
        cfs_bandwidth_used() && self.cfs_rqs[slot].throttle_count > 0
    }

    /// ## 从任务组的池中为运行队列取一个slice
    ///
    /// 返回取完之后本地是否有剩余的运行时间。
    fn assign_cfs_rq_runtime(&mut self, slot: GroupSlot) -> bool {
        let slice = self.cfg.cfs_bandwidth_slice_ns as i64;
        let now = self.clock;
        let cfs_rq = &mut self.cfs_rqs[slot];
        let cfs_b = &cfs_rq.tg.bandwidth;

        let min_amount = (slice - cfs_rq.runtime_remaining).max(0) as u64;
        let amount = if !cfs_b.runtime_enabled() {
            min_amount
        } else {
            {
                let mut inner = cfs_b.inner.lock();
                cfs_b.start_period_timer(&mut inner, now);
            }
            let amount = cfs_b.draw_runtime(min_amount);
            if amount > 0 {
                cfs_b.idle.store(false, Ordering::Release);
            }
            amount
        };

        cfs_rq.runtime_remaining += amount as i64;
        cfs_rq.runtime_remaining > 0
    }

    /// ## 扣除运行时间，本地运行时间用完时向池中申请
    pub(crate) fn account_cfs_rq_runtime(&mut self, slot: GroupSlot, delta_exec: u64) {
        if !cfs_bandwidth_used() || !self.cfs_rqs[slot].runtime_enabled {
            return;
        }

        let cfs_rq = &mut self.cfs_rqs[slot];
        cfs_rq.runtime_remaining -= delta_exec as i64;
        if cfs_rq.runtime_remaining > 0 || cfs_rq.throttled {
            return;
        }

        // 申请不到运行时间，让正在运行的层级尽快被换下，换下时会被限流
        if !self.assign_cfs_rq_runtime(slot) && self.cfs_rqs[slot].curr.is_some() {
            self.resched_curr();
        }
    }

    /// ## 运行时间已经耗尽时限流运行队列
    pub(crate) fn check_cfs_rq_runtime(&mut self, slot: GroupSlot) -> bool {
        if !cfs_bandwidth_used() {
            return false;
        }
        let cfs_rq = &self.cfs_rqs[slot];
        if !cfs_rq.runtime_enabled || cfs_rq.runtime_remaining > 0 {
            return false;
        }
        if self.cfs_rq_throttled(slot) {
            return true;
        }
        self.throttle_cfs_rq(slot);
        true
    }

    /// ## 空队列第一次有实体入队时检查运行时间
    pub(crate) fn check_enqueue_throttle(&mut self, slot: GroupSlot) {
        if !cfs_bandwidth_used() {
            return;
        }
        let cfs_rq = &self.cfs_rqs[slot];
        // 正在运行的层级在换下时处理
        if !cfs_rq.runtime_enabled || cfs_rq.curr.is_some() {
            return;
        }
        if self.cfs_rq_throttled(slot) {
            return;
        }

        self.account_cfs_rq_runtime(slot, 0);
        if self.cfs_rqs[slot].runtime_remaining <= 0 {
            self.throttle_cfs_rq(slot);
        }
    }

    /// ## 运行队列空闲时，把多余的运行时间还给池
    pub(crate) fn return_cfs_rq_runtime(&mut self, slot: GroupSlot) {
        if !cfs_bandwidth_used() {
            return;
        }
        let min_runtime = self.cfg.min_cfs_rq_runtime_ns as i64;
        let slice = self.cfg.cfs_bandwidth_slice_ns;
        let slack_period = self.cfg.cfs_slack_period_ns;
        let now = self.clock;

        let cfs_rq = &mut self.cfs_rqs[slot];
        if !cfs_rq.runtime_enabled || cfs_rq.nr_running > 0 {
            return;
        }
        let slack_runtime = cfs_rq.runtime_remaining - min_runtime;
        if slack_runtime <= 0 {
            return;
        }

        let cfs_b = &cfs_rq.tg.bandwidth;
        if cfs_b.runtime_enabled() {
            let pool = cfs_b.give_back_runtime(slack_runtime as u64);
            let mut inner = cfs_b.inner.lock();
            // 持有运行队列锁时不能解除限流，交给slack定时器
            if pool > slice
                && !inner.throttled.is_empty()
                && !CfsBandwidth::runtime_refresh_within(
                    &inner,
                    now,
                    slack_period + MIN_BANDWIDTH_EXPIRATION_NS,
                )
                && inner.slack_deadline.is_none()
            {
                inner.slack_deadline = Some(now + slack_period);
            }
        }

        cfs_rq.runtime_remaining -= slack_runtime;
    }

    /// 以slot为根的子树中的所有组运行队列
    pub(crate) fn cfs_rq_subtree(&self, slot: GroupSlot) -> Vec<GroupSlot> {
        self.cfs_rqs
            .iter()
            .filter(|c| {
                let mut cur = Some(c.slot);
                while let Some(s) = cur {
                    if s == slot {
                        return true;
                    }
                    cur = self.cfs_rqs.get(s).and_then(|q| q.parent);
                }
                false
            })
            .map(|c| c.slot)
            .collect()
    }

    fn tg_throttle_down(&mut self, slot: GroupSlot) {
        let now = self.rq_clock_pelt();
        let cfs_rq = &mut self.cfs_rqs[slot];
        // 进入限流状态，冻结PELT时间
        if cfs_rq.throttle_count == 0 {
            cfs_rq.throttled_clock_pelt = now;
        }
        cfs_rq.throttle_count += 1;
    }

    fn tg_unthrottle_up(&mut self, slot: GroupSlot) {
        let now = self.rq_clock_pelt();
        let cfs_rq = &mut self.cfs_rqs[slot];
        cfs_rq.throttle_count = cfs_rq.throttle_count.saturating_sub(1);
        if cfs_rq.throttle_count == 0 {
            cfs_rq.throttled_clock_pelt_time += now.saturating_sub(cfs_rq.throttled_clock_pelt);
        }
    }

    /// ## 限流一个组运行队列
    ///
    /// 组实体以及只剩它一个实体的祖先被移出队列，祖先的层级任务计数减去被限流的任务数。
    pub(crate) fn throttle_cfs_rq(&mut self, slot: GroupSlot) {
        if slot == GroupSlot::ROOT {
            return;
        }

        for s in self.cfs_rq_subtree(slot) {
            self.tg_throttle_down(s);
        }

        let task_delta = self.cfs_rqs[slot].h_nr_running;
        let idle_task_delta = self.cfs_rqs[slot].idle_h_nr_running;
        let mut dequeue = true;

        let mut se = Some(EntityRef::Group(slot));
        while let Some(cur) = se {
            if !self.ents[cur].on_rq {
                break;
            }
            let qslot = self.ents[cur].cfs_rq;
            if dequeue {
                self.dequeue_entity(qslot, cur, DequeueFlag::DEQUEUE_SLEEP);
            }
            let qcfs_rq = &mut self.cfs_rqs[qslot];
            qcfs_rq.h_nr_running = qcfs_rq.h_nr_running.saturating_sub(task_delta);
            qcfs_rq.idle_h_nr_running = qcfs_rq.idle_h_nr_running.saturating_sub(idle_task_delta);
            if qcfs_rq.load.weight > 0 {
                dequeue = false;
            }
            se = self.parent_entity(cur);
        }

        if se.is_none() {
            self.sub_nr_running(task_delta);
        }

        let now = self.clock;
        let cpu = self.cpu;
        let cfs_rq = &mut self.cfs_rqs[slot];
        cfs_rq.throttled = true;
        cfs_rq.throttled_clock = now;

        let cfs_b = &cfs_rq.tg.bandwidth;
        let mut inner = cfs_b.inner.lock();
        let empty = inner.throttled.is_empty();
        if !inner.throttled.contains(&cpu) {
            inner.throttled.push_back(cpu);
        }
        if empty {
            cfs_b.start_period_timer(&mut inner, now);
        }
        drop(inner);

        log::debug!(
            "cpu {}: throttled group {} ({} tasks)",
            self.cpu,
            slot,
            task_delta
        );
    }

    /// ## 解除限流，把组实体链重新放回队列
    pub(crate) fn unthrottle_cfs_rq(&mut self, slot: GroupSlot) {
        self.update_rq_clock();
        let now = self.clock;
        let cpu = self.cpu;

        {
            let cfs_rq = &mut self.cfs_rqs[slot];
            cfs_rq.throttled = false;
            let throttled_for = now.saturating_sub(cfs_rq.throttled_clock);
            let mut inner = cfs_rq.tg.bandwidth.inner.lock();
            inner.stats.throttled_time += throttled_for;
            inner.throttled.retain(|c| *c != cpu);
        }

        for s in self.cfs_rq_subtree(slot) {
            self.tg_unthrottle_up(s);
        }

        if self.cfs_rqs[slot].load.weight == 0 {
            return;
        }

        let task_delta = self.cfs_rqs[slot].h_nr_running;
        let idle_task_delta = self.cfs_rqs[slot].idle_h_nr_running;
        let mut enqueue = true;

        let mut se = Some(EntityRef::Group(slot));
        while let Some(cur) = se {
            if self.ents[cur].on_rq {
                enqueue = false;
            }
            let qslot = self.ents[cur].cfs_rq;
            if enqueue {
                self.enqueue_entity(qslot, cur, EnqueueFlag::ENQUEUE_WAKEUP);
            }
            let qcfs_rq = &mut self.cfs_rqs[qslot];
            qcfs_rq.h_nr_running += task_delta;
            qcfs_rq.idle_h_nr_running += idle_task_delta;

            if self.cfs_rq_throttled(qslot) {
                break;
            }
            se = self.parent_entity(cur);
        }

        if se.is_none() {
            self.add_nr_running(task_delta);
        }

        // 可能需要唤醒空闲的CPU
        if self.is_idle() && self.root_cfs().nr_running > 0 {
            self.resched_curr();
        }

        log::debug!("cpu {}: unthrottled group {}", self.cpu, slot);
    }

    /// ## 给被限流的运行队列分配运行时间，足够时解除限流
    ///
    /// 返回池中剩余的运行时间。
    fn distribute_runtime_to(&mut self, slot: GroupSlot) -> u64 {
        let cfs_b_runtime;
        {
            let cfs_rq = match self.cfs_rqs.get_mut(slot) {
                Some(c) if c.throttled => c,
                Some(c) => return c.tg.bandwidth.runtime(),
                None => return 0,
            };
            if cfs_rq.runtime_remaining > 0 {
                log::warn!("throttled group {} still has runtime {}", slot, cfs_rq.runtime_remaining);
            }
            let need = (1 - cfs_rq.runtime_remaining).max(1) as u64;
            let got = cfs_rq.tg.bandwidth.draw_runtime(need);
            cfs_rq.runtime_remaining += got as i64;
            cfs_b_runtime = cfs_rq.tg.bandwidth.runtime();
        }

        if self.cfs_rqs[slot].runtime_remaining > 0 {
            self.unthrottle_cfs_rq(slot);
        }
        cfs_b_runtime
    }

    /// 任务组的带宽设置变化后，重置本CPU上的组运行队列
    pub(crate) fn apply_cfs_bandwidth(&mut self, slot: GroupSlot, enabled: bool) {
        let cfs_rq = match self.cfs_rqs.get_mut(slot) {
            Some(c) => c,
            None => return,
        };
        cfs_rq.runtime_enabled = enabled;
        cfs_rq.runtime_remaining = 0;
        if cfs_rq.throttled {
            self.unthrottle_cfs_rq(slot);
        }
    }

    /// ## CPU下线前解除所有限流，并且不再限流
    pub(crate) fn unthrottle_offline_cfs_rqs(&mut self) {
        let slots: Vec<GroupSlot> = self.cfs_rqs.iter().map(|c| c.slot).collect();
        for slot in slots {
            let cfs_rq = &mut self.cfs_rqs[slot];
            if !cfs_rq.runtime_enabled {
                continue;
            }
            cfs_rq.runtime_remaining = 1;
            cfs_rq.runtime_enabled = false;
            if self.cfs_rq_throttled(slot) {
                self.unthrottle_cfs_rq(slot);
            }
        }
    }

    /// CPU上线后按任务组的设置重新打开带宽控制
    pub(crate) fn online_cfs_bandwidth(&mut self) {
        let slots: Vec<GroupSlot> = self.cfs_rqs.iter().map(|c| c.slot).collect();
        for slot in slots {
            let cfs_rq = &mut self.cfs_rqs[slot];
            cfs_rq.runtime_enabled = cfs_rq.tg.bandwidth.runtime_enabled();
            cfs_rq.runtime_remaining = 0;
        }
    }
}

impl Scheduler {
    /// ## 设置任务组的带宽
    ///
    /// quota为[`RUNTIME_INF`]表示不限制。子任务组的配额比例不能超过父任务组。
    pub fn tg_set_cfs_bandwidth(
        &self,
        id: TaskGroupId,
        period: u64,
        quota: u64,
        burst: u64,
    ) -> Result<(), SystemError> {
        if !cfs_bandwidth_used() {
            return Err(SystemError::ENOSYS);
        }
        if id.is_root() {
            return Err(SystemError::EINVAL);
        }
        if quota < MIN_CFS_QUOTA_PERIOD_NS || period < MIN_CFS_QUOTA_PERIOD_NS {
            return Err(SystemError::EINVAL);
        }
        if period > MAX_CFS_QUOTA_PERIOD_NS {
            return Err(SystemError::EINVAL);
        }
        if quota != RUNTIME_INF && burst > quota {
            return Err(SystemError::EINVAL);
        }

        let tg = {
            let tree = self.groups.read();
            let tg = tree.get(id).ok_or(SystemError::ESRCH)?;
            Self::cfs_schedulable(&tree.iter_top_down(), &tg, period, quota)?;
            tg
        };

        let enabled = quota != RUNTIME_INF;
        let now = self.clock.sched_clock();
        {
            let cfs_b = &tg.bandwidth;
            let mut inner = cfs_b.inner.lock();
            cfs_b.period.store(period, Ordering::Release);
            cfs_b.quota.store(quota, Ordering::Release);
            cfs_b.burst.store(if enabled { burst } else { 0 }, Ordering::Release);
            cfs_b.runtime.store(if enabled { quota } else { 0 }, Ordering::Release);
            if enabled {
                inner.period_deadline = Some(now + period);
            } else {
                inner.period_deadline = None;
                inner.slack_deadline = None;
            }
        }

        for percpu in self.cpus.iter() {
            let mut rq = percpu.rq.lock();
            if !rq.online {
                continue;
            }
            rq.apply_cfs_bandwidth(tg.id.slot(), enabled);
        }

        log::info!(
            "group {}: bandwidth quota {} period {} burst {}",
            id.slot(),
            quota,
            period,
            burst
        );
        Ok(())
    }

    /// ## 检查新的配额在任务组树中是否可调度
    ///
    /// 自上而下计算每个任务组的有效配额比例：没有设置配额的任务组继承父任务组的比例，
    /// 设置了配额的任务组不能超过父任务组。
    fn cfs_schedulable(
        order: &[Arc<TaskGroup>],
        target: &Arc<TaskGroup>,
        period: u64,
        quota: u64,
    ) -> Result<(), SystemError> {
        let mut ratios: Vec<(TaskGroupId, u64)> = Vec::with_capacity(order.len());
        for tg in order.iter() {
            let (p, q) = if Arc::ptr_eq(tg, target) {
                (period, quota)
            } else {
                (tg.bandwidth.period(), tg.bandwidth.quota())
            };
            let ratio = match tg.parent {
                None => RUNTIME_INF,
                Some(parent) => {
                    let parent_ratio = ratios
                        .iter()
                        .find(|(id, _)| *id == parent)
                        .map(|(_, r)| *r)
                        .unwrap_or(RUNTIME_INF);
                    let mine = to_ratio(p, q);
                    if mine == RUNTIME_INF {
                        parent_ratio
                    } else if parent_ratio != RUNTIME_INF && mine > parent_ratio {
                        return Err(SystemError::EINVAL);
                    } else {
                        mine
                    }
                }
            };
            ratios.push((tg.id, ratio));
        }

        for (id, ratio) in ratios {
            if let Some(tg) = order.iter().find(|tg| tg.id == id) {
                tg.bandwidth.hierarchical_quota.store(ratio, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// ## 检查并触发所有任务组的带宽定时器
    pub(crate) fn run_bandwidth_timers(&self, now: u64) {
        if !cfs_bandwidth_used() {
            return;
        }
        let groups: Vec<Arc<TaskGroup>> = self
            .groups
            .read()
            .iter_top_down()
            .into_iter()
            .filter(|tg| tg.bandwidth.timers_armed())
            .collect();

        for tg in groups {
            if let Some(overrun) = tg.bandwidth.claim_period_timer(now) {
                self.do_sched_cfs_period_timer(&tg, overrun);
            }
            if tg.bandwidth.claim_slack_timer(now) {
                self.do_sched_cfs_slack_timer(&tg, now);
            }
        }
    }

    fn do_sched_cfs_period_timer(&self, tg: &Arc<TaskGroup>, overrun: u64) {
        let cfs_b = &tg.bandwidth;
        {
            let mut inner = cfs_b.inner.lock();
            if !cfs_b.runtime_enabled() {
                inner.period_deadline = None;
                return;
            }

            let throttled = !inner.throttled.is_empty();
            inner.stats.nr_periods += overrun;
            cfs_b.refill_runtime();

            // 上个周期空闲，又没有被限流的队列，定时器可以停下了
            if cfs_b.idle.load(Ordering::Acquire) && !throttled {
                inner.period_deadline = None;
                return;
            }
            if !throttled {
                // 先假设下个周期是空闲的，有队列来取运行时间时会清掉这个标记
                cfs_b.idle.store(true, Ordering::Release);
                return;
            }
            inner.stats.nr_throttled += overrun;
        }

        let mut rounds = 0;
        loop {
            let snapshot: Vec<ProcessorId> = cfs_b.inner.lock().throttled.iter().copied().collect();
            if snapshot.is_empty() || cfs_b.runtime() == 0 || rounds > snapshot.len() {
                break;
            }
            self.distribute_cfs_runtime(tg, &snapshot);
            rounds += 1;
        }

        cfs_b.idle.store(false, Ordering::Release);
    }

    fn do_sched_cfs_slack_timer(&self, tg: &Arc<TaskGroup>, now: u64) {
        let cfs_b = &tg.bandwidth;
        let slice = self.config().cfs_bandwidth_slice_ns;
        let snapshot: Vec<ProcessorId> = {
            let inner = cfs_b.inner.lock();
            // 马上就要补充运行时间了，不必再分配
            if CfsBandwidth::runtime_refresh_within(&inner, now, MIN_BANDWIDTH_EXPIRATION_NS) {
                return;
            }
            if !cfs_b.runtime_enabled() || cfs_b.runtime() <= slice {
                return;
            }
            inner.throttled.iter().copied().collect()
        };
        self.distribute_cfs_runtime(tg, &snapshot);
    }

    /// ## 按限流的先后顺序给各CPU上被限流的队列分配运行时间
    ///
    /// 不持有任务组的锁，逐个加锁各CPU的运行队列。
    fn distribute_cfs_runtime(&self, tg: &Arc<TaskGroup>, cpus: &[ProcessorId]) {
        let slot = tg.id.slot();
        for cpu in cpus.iter().copied() {
            let rq_lock = match self.cpu_rq(cpu) {
                Some(rq) => rq,
                None => {
                    tg.bandwidth.remove_throttled(cpu);
                    continue;
                }
            };
            let mut rq = rq_lock.lock();
            if !rq.cfs_rqs.get(slot).map(|c| c.throttled).unwrap_or(false) {
                drop(rq);
                tg.bandwidth.remove_throttled(cpu);
                continue;
            }
            let remaining = rq.distribute_runtime_to(slot);
            drop(rq);
            if remaining == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_draws_are_capped_by_what_is_left() {
        let b = CfsBandwidth::new();
        b.quota.store(10 * NSEC_PER_MSEC, Ordering::Relaxed);
        b.runtime.store(7 * NSEC_PER_MSEC, Ordering::Relaxed);
        assert_eq!(b.draw_runtime(5 * NSEC_PER_MSEC), 5 * NSEC_PER_MSEC);
        assert_eq!(b.draw_runtime(5 * NSEC_PER_MSEC), 2 * NSEC_PER_MSEC);
        assert_eq!(b.draw_runtime(5 * NSEC_PER_MSEC), 0);
    }

    #[test]
    fn refill_never_exceeds_quota_plus_burst() {
        let b = CfsBandwidth::new();
        b.quota.store(10, Ordering::Relaxed);
        b.burst.store(5, Ordering::Relaxed);
        b.refill_runtime();
        assert_eq!(b.runtime(), 10);
        b.refill_runtime();
        assert_eq!(b.runtime(), 15);
        b.refill_runtime();
        assert_eq!(b.runtime(), 15);
        assert_eq!(b.give_back_runtime(100), 15);
    }

    #[test]
    fn infinite_quota_does_not_refill() {
        let b = CfsBandwidth::new();
        assert!(!b.runtime_enabled());
        b.refill_runtime();
        assert_eq!(b.runtime(), 0);
    }

    #[test]
    fn period_timer_counts_overruns() {
        let b = CfsBandwidth::new();
        {
            let mut inner = b.inner.lock();
            b.start_period_timer(&mut inner, 0);
        }
        assert_eq!(b.claim_period_timer(50 * NSEC_PER_MSEC), None);
        assert_eq!(b.claim_period_timer(350 * NSEC_PER_MSEC), Some(3));
        assert_eq!(
            b.inner.lock().period_deadline,
            Some(400 * NSEC_PER_MSEC)
        );
    }

    #[test]
    fn ratio_is_fixed_point() {
        assert_eq!(to_ratio(100, 50), 1 << (BW_SHIFT - 1));
        assert_eq!(to_ratio(100, RUNTIME_INF), RUNTIME_INF);
    }
}
