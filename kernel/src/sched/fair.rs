//! 完全公平调度
//!
//! 每个运行队列按vruntime维护一条时间线，总是挑选vruntime最小的实体运行。
//! 任务组在每个CPU上的运行队列通过组实体挂在父运行队列中，挑选时从根逐层往下走。

use alloc::sync::Arc;

use super::{
    entity::EntityRef,
    group::{GroupSlot, TaskGroup},
    pelt::{SchedulerAvg, UpdateAvgFlags},
    task::{OnRq, Pid},
    timeline::Timeline,
    CpuRunQueue, DequeueFlag, EnqueueFlag, LoadWeight, SchedClass, SchedFeature, SchedPolicy,
    WakeupFlags,
};

/// 运行队列min_vruntime的初始值
///
/// 唤醒的实体会被放在min_vruntime之前，初始值留出足够的余量，使其不会回绕到u64的另一端。
pub const MIN_VRUNTIME_BASE: u64 = 1 << 40;

/// 按回绕安全的方式比较两个虚拟时间，返回较大的一个
#[inline]
pub fn max_vruntime(max: u64, vruntime: u64) -> u64 {
    if (vruntime.wrapping_sub(max) as i64) > 0 {
        vruntime
    } else {
        max
    }
}

#[inline]
pub fn min_vruntime(min: u64, vruntime: u64) -> u64 {
    if (vruntime.wrapping_sub(min) as i64) < 0 {
        vruntime
    } else {
        min
    }
}

/// 公平调度的运行队列，每个CPU上的每个任务组各有一个
#[derive(Debug)]
pub struct CfsRunQueue {
    pub tg: Arc<TaskGroup>,
    pub slot: GroupSlot,
    /// 父任务组在同一CPU上的运行队列，根运行队列为None
    pub parent: Option<GroupSlot>,
    /// 根运行队列为0
    pub depth: u32,
    /// 队列中所有实体的权重之和
    pub load: LoadWeight,
    /// 直接挂在本队列上的实体数量（包括正在运行的）
    pub nr_running: u32,
    /// 本队列以及所有子队列中的任务数量
    pub h_nr_running: u32,
    /// 其中SCHED_IDLE任务的数量
    pub idle_h_nr_running: u32,
    pub exec_clock: u64,
    /// 单调递增的最小虚拟时间
    pub min_vruntime: u64,

    pub(crate) timeline: Timeline<EntityRef>,
    /// 正在运行的实体，它不在时间线中
    pub curr: Option<EntityRef>,
    /// 唤醒者希望尽快运行的实体
    pub next: Option<EntityRef>,
    /// 被唤醒抢占的实体，尽量把CPU还给它
    pub last: Option<EntityRef>,
    /// 主动让出CPU的实体
    pub skip: Option<EntityRef>,

    pub avg: SchedulerAvg,
    /// 队列中处于可运行状态的实体的load_avg之和
    pub runnable_load_avg: u64,
    /// 上一次发布到任务组的负载贡献
    pub tg_load_avg_contrib: i64,
    pub(crate) propagate: bool,
    pub(crate) prop_runnable_sum: i64,

    /// 带宽控制是否生效
    pub runtime_enabled: bool,
    /// 本地还剩的运行时间，可以为负（超支）
    pub runtime_remaining: i64,
    /// 本队列因为运行时间耗尽而被限流
    pub throttled: bool,
    /// 自身以及祖先中被限流的队列数量
    pub throttle_count: u32,
    pub throttled_clock: u64,
    pub throttled_clock_pelt: u64,
    /// 被限流期间累计冻结的PELT时间
    pub throttled_clock_pelt_time: u64,
}

impl CfsRunQueue {
    pub fn new(tg: Arc<TaskGroup>, slot: GroupSlot, parent: Option<GroupSlot>, depth: u32) -> Self {
        Self {
            tg,
            slot,
            parent,
            depth,
            load: LoadWeight::default(),
            nr_running: 0,
            h_nr_running: 0,
            idle_h_nr_running: 0,
            exec_clock: 0,
            min_vruntime: MIN_VRUNTIME_BASE,
            timeline: Timeline::new(),
            curr: None,
            next: None,
            last: None,
            skip: None,
            avg: SchedulerAvg::default(),
            runnable_load_avg: 0,
            tg_load_avg_contrib: 0,
            propagate: false,
            prop_runnable_sum: 0,
            runtime_enabled: false,
            runtime_remaining: 0,
            throttled: false,
            throttle_count: 0,
            throttled_clock: 0,
            throttled_clock_pelt: 0,
            throttled_clock_pelt_time: 0,
        }
    }

    #[inline]
    pub(crate) fn add_tg_cfs_propagate(&mut self, runnable_sum: i64) {
        self.propagate = true;
        self.prop_runnable_sum += runnable_sum;
    }

    /// 时间线中vruntime最小的实体
    #[inline]
    pub fn pick_first_entity(&self) -> Option<EntityRef> {
        self.timeline.leftmost().map(|(_, e)| e)
    }
}

#[derive(Debug, Clone, Copy)]
enum Buddy {
    Next,
    Last,
    Skip,
}

impl Buddy {
    fn of(self, cfs_rq: &mut CfsRunQueue) -> &mut Option<EntityRef> {
        match self {
            Buddy::Next => &mut cfs_rq.next,
            Buddy::Last => &mut cfs_rq.last,
            Buddy::Skip => &mut cfs_rq.skip,
        }
    }
}

impl CpuRunQueue {
    /// ## 计算调度周期，基本思想是在一个周期内让每个任务都至少运行一次。
    pub fn sched_period(&self, nr_running: u64) -> u64 {
        if nr_running > self.cfg.nr_latency() {
            // 任务太多时，周期按最小粒度线性增长，避免每个任务分到的时间片过短
            return nr_running * self.cfg.min_granularity_ns;
        }
        self.cfg.latency_ns
    }

    /// ## 计算调度实体的实际运行时间片
    ///
    /// 从实体开始逐层向上，每一层按实体权重在所在队列权重中的比例缩放。
    pub fn sched_slice(&self, slot: GroupSlot, e: EntityRef) -> u64 {
        let on_rq = self.ents[e].on_rq;
        let mut slice = self.sched_period(self.cfs_rqs[slot].nr_running as u64 + (!on_rq) as u64);

        let mut se = Some(e);
        while let Some(cur) = se {
            let entity = &self.ents[cur];
            let mut load = self.cfs_rqs[entity.cfs_rq].load;
            if !entity.on_rq {
                load.update_add(entity.load.weight);
            }
            slice = load.calculate_delta(slice, entity.load.weight);
            se = self.parent_entity(cur);
        }

        if self.sched_feat(SchedFeature::BASE_SLICE) {
            slice = slice.max(self.cfg.min_granularity_ns);
        }

        slice
    }

    /// ## 计算调度实体的虚拟运行时间片
    pub fn sched_vslice(&self, slot: GroupSlot, e: EntityRef) -> u64 {
        let slice = self.sched_slice(slot, e);
        self.ents[e].calc_delta_fair(slice)
    }

    #[inline]
    pub(crate) fn entity_before(&self, a: EntityRef, b: EntityRef) -> bool {
        (self.ents[a].vruntime.wrapping_sub(self.ents[b].vruntime) as i64) < 0
    }

    /// ## 更新运行队列的最小虚拟时间
    ///
    /// 取正在运行的实体与最左实体中较小的vruntime，但min_vruntime本身只增不减。
    pub fn update_min_vruntime(&mut self, slot: GroupSlot) {
        let cfs_rq = &self.cfs_rqs[slot];
        let mut curr = cfs_rq.curr;
        let mut vruntime = cfs_rq.min_vruntime;

        if let Some(c) = curr {
            if self.ents[c].on_rq {
                vruntime = self.ents[c].vruntime;
            } else {
                curr = None;
            }
        }

        if let Some(left) = cfs_rq.pick_first_entity() {
            let left_vruntime = self.ents[left].vruntime;
            if curr.is_none() {
                vruntime = left_vruntime;
            } else {
                vruntime = min_vruntime(vruntime, left_vruntime);
            }
        }

        let cfs_rq = &mut self.cfs_rqs[slot];
        cfs_rq.min_vruntime = max_vruntime(cfs_rq.min_vruntime, vruntime);
    }

    /// ## 更新运行队列上正在运行的实体的运行时间统计
    pub fn update_curr(&mut self, slot: GroupSlot) {
        let now = self.clock_task;
        let curr = match self.cfs_rqs[slot].curr {
            Some(c) => c,
            None => return,
        };

        let se = &mut self.ents[curr];
        if now <= se.exec_start {
            return;
        }
        let delta_exec = now - se.exec_start;
        se.exec_start = now;
        se.sum_exec_runtime += delta_exec;

        // 根据实际运行时长加权增加虚拟运行时长
        let vdelta = se.calc_delta_fair(delta_exec);
        se.vruntime = se.vruntime.wrapping_add(vdelta);

        self.cfs_rqs[slot].exec_clock += delta_exec;
        self.update_min_vruntime(slot);

        self.account_cfs_rq_runtime(slot, delta_exec);
    }

    /// 更新当前任务所在运行队列的统计
    pub fn update_curr_fair(&mut self) {
        let slot = match self.curr.and_then(|p| self.task(p)) {
            Some(t) if t.policy.is_fair() => t.se.cfs_rq,
            _ => return,
        };
        self.update_curr(slot);
    }

    fn enqueue_timeline(&mut self, slot: GroupSlot, e: EntityRef) {
        let vruntime = self.ents[e].vruntime;
        let key = self.cfs_rqs[slot].timeline.insert(vruntime, e);
        self.ents[e].run_node = Some(key);
    }

    fn dequeue_timeline(&mut self, slot: GroupSlot, e: EntityRef) {
        if let Some(key) = self.ents[e].run_node.take() {
            if self.cfs_rqs[slot].timeline.remove(&key).is_none() {
                log::warn!("cpu {}: {:?} was not in the timeline of group {}", self.cpu, e, slot);
            }
        }
    }

    fn account_entity_enqueue(&mut self, slot: GroupSlot, e: EntityRef) {
        let weight = self.ents[e].load.weight;
        let cfs_rq = &mut self.cfs_rqs[slot];
        cfs_rq.load.update_add(weight);
        cfs_rq.nr_running += 1;

        if let EntityRef::Task(pid) = e {
            self.account_numa_enqueue(pid);
            self.cfs_tasks.push_front(pid);
        }
    }

    fn account_entity_dequeue(&mut self, slot: GroupSlot, e: EntityRef) {
        let weight = self.ents[e].load.weight;
        let cfs_rq = &mut self.cfs_rqs[slot];
        cfs_rq.load.update_sub(weight);
        cfs_rq.nr_running = cfs_rq.nr_running.saturating_sub(1);

        if let EntityRef::Task(pid) = e {
            self.account_numa_dequeue(pid);
            self.cfs_tasks.retain(|p| *p != pid);
        }
    }

    fn enqueue_runnable_load_avg(&mut self, slot: GroupSlot, e: EntityRef) {
        let load_avg = self.ents[e].avg.load_avg;
        self.cfs_rqs[slot].runnable_load_avg += load_avg;
    }

    fn dequeue_runnable_load_avg(&mut self, slot: GroupSlot, e: EntityRef) {
        let load_avg = self.ents[e].avg.load_avg;
        let cfs_rq = &mut self.cfs_rqs[slot];
        cfs_rq.runnable_load_avg = cfs_rq.runnable_load_avg.saturating_sub(load_avg);
    }

    /// ## 计算实体入队时的vruntime
    ///
    /// 新实体放在一个时间片之后，唤醒的实体最多补偿半个（或一个）调度延迟，
    /// 并且不会把实体的vruntime往回拨。
    pub fn place_entity(&mut self, slot: GroupSlot, e: EntityRef, initial: bool) {
        let mut vruntime = self.cfs_rqs[slot].min_vruntime;

        if initial && self.sched_feat(SchedFeature::START_DEBIT) {
            vruntime = vruntime.wrapping_add(self.sched_vslice(slot, e));
        }

        if !initial {
            let mut thresh = self.cfg.latency_ns;
            if self.sched_feat(SchedFeature::GENTLE_FAIR_SLEEPERS) {
                thresh >>= 1;
            }
            vruntime = vruntime.wrapping_sub(thresh);
        }

        let se = &mut self.ents[e];
        se.vruntime = max_vruntime(se.vruntime, vruntime);
    }

    /// ## 把实体放进运行队列
    pub fn enqueue_entity(&mut self, slot: GroupSlot, e: EntityRef, flags: EnqueueFlag) {
        let renorm = !flags.contains(EnqueueFlag::ENQUEUE_WAKEUP)
            || flags.contains(EnqueueFlag::ENQUEUE_MIGRATED);
        let is_curr = self.cfs_rqs[slot].curr == Some(e);

        // 正在运行的实体需要先加上min_vruntime，再更新运行时间
        if renorm && is_curr {
            let min = self.cfs_rqs[slot].min_vruntime;
            let se = &mut self.ents[e];
            se.vruntime = se.vruntime.wrapping_add(min);
        }

        self.update_curr(slot);

        if renorm && !is_curr {
            let min = self.cfs_rqs[slot].min_vruntime;
            let se = &mut self.ents[e];
            se.vruntime = se.vruntime.wrapping_add(min);
        }

        self.update_load_avg(slot, e, UpdateAvgFlags::UPDATE_TG | UpdateAvgFlags::DO_ATTACH);
        self.update_cfs_group(e);
        self.enqueue_runnable_load_avg(slot, e);
        self.account_entity_enqueue(slot, e);

        if flags.contains(EnqueueFlag::ENQUEUE_WAKEUP) {
            self.place_entity(slot, e, false);
        }

        if !is_curr {
            self.enqueue_timeline(slot, e);
        }
        self.ents[e].on_rq = true;

        if self.cfs_rqs[slot].nr_running == 1 {
            self.check_enqueue_throttle(slot);
        }
    }

    /// ## 把实体移出运行队列
    pub fn dequeue_entity(&mut self, slot: GroupSlot, e: EntityRef, flags: DequeueFlag) {
        self.update_curr(slot);

        self.update_load_avg(slot, e, UpdateAvgFlags::UPDATE_TG);
        self.dequeue_runnable_load_avg(slot, e);

        self.clear_buddies(slot, e);

        if self.cfs_rqs[slot].curr != Some(e) {
            self.dequeue_timeline(slot, e);
        }
        self.ents[e].on_rq = false;
        self.account_entity_dequeue(slot, e);

        // 不是睡眠的出队（迁移、改变属性）把vruntime转成相对值，重新入队时再加上新队列的min_vruntime
        if !flags.contains(DequeueFlag::DEQUEUE_SLEEP) {
            let min = self.cfs_rqs[slot].min_vruntime;
            let se = &mut self.ents[e];
            se.vruntime = se.vruntime.wrapping_sub(min);
        }

        self.return_cfs_rq_runtime(slot);
        self.update_cfs_group(e);

        // 只保存状态而不移动时，马上就会原样放回去，不必更新min_vruntime
        if (flags & (DequeueFlag::DEQUEUE_SAVE | DequeueFlag::DEQUEUE_MOVE)) != DequeueFlag::DEQUEUE_SAVE {
            self.update_min_vruntime(slot);
        }
    }

    /// ## 让实体成为运行队列上正在运行的实体
    pub fn set_next_entity(&mut self, slot: GroupSlot, e: EntityRef) {
        if self.ents[e].on_rq {
            self.dequeue_timeline(slot, e);
            self.update_load_avg(slot, e, UpdateAvgFlags::UPDATE_TG);
        }

        let now = self.clock_task;
        let se = &mut self.ents[e];
        se.exec_start = now;
        se.prev_sum_exec_runtime = se.sum_exec_runtime;
        self.cfs_rqs[slot].curr = Some(e);
    }

    /// ## 正在运行的实体被换下，仍然可运行时放回时间线
    pub fn put_prev_entity(&mut self, slot: GroupSlot, e: EntityRef) {
        let on_rq = self.ents[e].on_rq;
        if on_rq {
            self.update_curr(slot);
        }

        self.check_cfs_rq_runtime(slot);

        // 限流可能已经把这个组实体移出了队列
        if self.ents[e].on_rq {
            self.enqueue_timeline(slot, e);
            self.update_load_avg(slot, e, UpdateAvgFlags::empty());
        }
        self.cfs_rqs[slot].curr = None;
    }

    /// ## 比较curr与se：se能否抢占curr
    ///
    /// 返回-1表示curr不比se落后；1表示curr领先超过了唤醒粒度；0介于两者之间。
    pub fn wakeup_preempt_entity(&self, curr: EntityRef, se: EntityRef) -> i32 {
        let vdiff = self.ents[curr].vruntime.wrapping_sub(self.ents[se].vruntime) as i64;
        if vdiff <= 0 {
            return -1;
        }

        let gran = self.ents[se].calc_delta_fair(self.cfg.wakeup_granularity_ns) as i64;
        if vdiff > gran {
            return 1;
        }
        0
    }

    /// ## 从运行队列中挑选下一个实体
    ///
    /// 理想情况下运行最左的实体，但在不至于太不公平的前提下，会避开skip，优先last和next。
    pub fn pick_next_entity(&mut self, slot: GroupSlot) -> Option<EntityRef> {
        let cfs_rq = &self.cfs_rqs[slot];
        let curr = cfs_rq.curr.filter(|c| self.ents[*c].on_rq);
        let mut left = cfs_rq.pick_first_entity();

        if let Some(c) = curr {
            match left {
                Some(l) if !self.entity_before(c, l) => {}
                _ => left = Some(c),
            }
        }
        let left = left?;
        let mut se = left;

        if cfs_rq.skip == Some(se) {
            let second = if Some(se) == curr {
                cfs_rq.pick_first_entity()
            } else {
                let next = self.ents[se]
                    .run_node
                    .and_then(|key| cfs_rq.timeline.next_after(&key))
                    .map(|(_, e)| e);
                match (next, curr) {
                    (Some(n), Some(c)) if self.entity_before(c, n) => Some(c),
                    (None, c) => c,
                    (n, _) => n,
                }
            };
            if let Some(second) = second {
                if self.wakeup_preempt_entity(second, left) < 1 {
                    se = second;
                }
            }
        }

        if let Some(last) = cfs_rq.last {
            if self.wakeup_preempt_entity(last, left) < 1 {
                se = last;
            }
        }

        if let Some(next) = cfs_rq.next {
            if self.wakeup_preempt_entity(next, left) < 1 {
                se = next;
            }
        }

        self.clear_buddies(slot, se);
        Some(se)
    }

    /// ## 在时间片到期时检查当前任务是否需要被抢占
    pub fn check_preempt_tick(&mut self, slot: GroupSlot, curr: EntityRef) {
        let ideal_runtime = self.sched_slice(slot, curr);
        let delta_exec = self.ents[curr].slice_runtime();

        if delta_exec > ideal_runtime {
            self.resched_curr();
            // 时间片用完的任务不能因为是buddy而再次被选中
            self.clear_buddies(slot, curr);
            return;
        }

        if delta_exec < self.cfg.min_granularity_ns {
            return;
        }

        let first = match self.cfs_rqs[slot].pick_first_entity() {
            Some(f) => f,
            None => return,
        };
        let delta = self.ents[curr].vruntime.wrapping_sub(self.ents[first].vruntime) as i64;
        if delta < 0 {
            return;
        }
        if delta as u64 > ideal_runtime {
            self.resched_curr();
        }
    }

    /// 处理调度实体的时钟滴答
    pub fn entity_tick(&mut self, slot: GroupSlot, curr: EntityRef) {
        self.update_curr(slot);
        self.update_load_avg(slot, curr, UpdateAvgFlags::UPDATE_TG);
        self.update_cfs_group(curr);

        if self.cfs_rqs[slot].nr_running > 1 {
            self.check_preempt_tick(slot, curr);
        }
    }

    fn clear_buddy_chain(&mut self, e: EntityRef, which: Buddy) {
        let mut se = Some(e);
        while let Some(cur) = se {
            let slot = self.ents[cur].cfs_rq;
            let buddy = which.of(&mut self.cfs_rqs[slot]);
            if *buddy != Some(cur) {
                break;
            }
            *buddy = None;
            se = self.parent_entity(cur);
        }
    }

    /// 如果e是某个buddy，沿着父实体链清除它
    pub(crate) fn clear_buddies(&mut self, slot: GroupSlot, e: EntityRef) {
        let cfs_rq = &self.cfs_rqs[slot];
        let (last, next, skip) = (cfs_rq.last, cfs_rq.next, cfs_rq.skip);
        if last == Some(e) {
            self.clear_buddy_chain(e, Buddy::Last);
        }
        if next == Some(e) {
            self.clear_buddy_chain(e, Buddy::Next);
        }
        if skip == Some(e) {
            self.clear_buddy_chain(e, Buddy::Skip);
        }
    }

    fn entity_is_idle_task(&self, e: EntityRef) -> bool {
        match e {
            EntityRef::Task(pid) => self.task(pid).map(|t| t.is_idle_policy()).unwrap_or(false),
            EntityRef::Group(_) => false,
        }
    }

    /// 实体是SCHED_IDLE任务，或者是一个被设为idle的任务组
    pub(crate) fn se_is_idle(&self, e: EntityRef) -> bool {
        match e {
            EntityRef::Task(_) => self.entity_is_idle_task(e),
            EntityRef::Group(g) => self.cfs_rqs.get(g).map(|c| c.tg.is_idle()).unwrap_or(false),
        }
    }

    fn set_buddy_chain(&mut self, e: EntityRef, which: Buddy) {
        if self.entity_is_idle_task(e) {
            return;
        }
        let mut se = Some(e);
        while let Some(cur) = se {
            if !self.ents[cur].on_rq {
                log::warn!("cpu {}: buddy {:?} is not on the runqueue", self.cpu, cur);
                return;
            }
            let slot = self.ents[cur].cfs_rq;
            *which.of(&mut self.cfs_rqs[slot]) = Some(cur);
            se = self.parent_entity(cur);
        }
    }

    pub(crate) fn set_next_buddy(&mut self, e: EntityRef) {
        self.set_buddy_chain(e, Buddy::Next);
    }

    pub(crate) fn set_last_buddy(&mut self, e: EntityRef) {
        self.set_buddy_chain(e, Buddy::Last);
    }

    pub(crate) fn set_skip_buddy(&mut self, e: EntityRef) {
        let mut se = Some(e);
        while let Some(cur) = se {
            let slot = self.ents[cur].cfs_rq;
            self.cfs_rqs[slot].skip = Some(cur);
            se = self.parent_entity(cur);
        }
    }

    /// ## 把两个实体分别向上走到同一个运行队列中
    pub(crate) fn find_matching_se(&self, mut se: EntityRef, mut pse: EntityRef) -> Option<(EntityRef, EntityRef)> {
        let mut se_depth = self.ents[se].depth;
        let mut pse_depth = self.ents[pse].depth;

        while se_depth > pse_depth {
            se_depth -= 1;
            se = self.parent_entity(se)?;
        }
        while pse_depth > se_depth {
            pse_depth -= 1;
            pse = self.parent_entity(pse)?;
        }
        while self.ents[se].cfs_rq != self.ents[pse].cfs_rq {
            se = self.parent_entity(se)?;
            pse = self.parent_entity(pse)?;
        }
        Some((se, pse))
    }

    /// ## 公平调度任务入队
    ///
    /// 沿着父实体链依次入队，直到遇到已经在队列中的祖先或者被限流的运行队列；
    /// 剩下的祖先只需要增加层级任务计数并更新负载。
    pub fn enqueue_task_fair(&mut self, pid: Pid, mut flags: EnqueueFlag) {
        let mut idle = self.task(pid).map(|t| t.is_idle_policy() as u32).unwrap_or(0);
        let mut se = Some(EntityRef::Task(pid));

        while let Some(cur) = se {
            if self.ents[cur].on_rq {
                break;
            }
            let slot = self.ents[cur].cfs_rq;
            self.enqueue_entity(slot, cur, flags);

            // 遇到被限流的队列，层级计数在下面的循环中补上
            if self.cfs_rq_throttled(slot) {
                break;
            }
            let cfs_rq = &mut self.cfs_rqs[slot];
            cfs_rq.h_nr_running += 1;
            cfs_rq.idle_h_nr_running += idle;
            // 对祖先来说，idle任务组里的任务都是idle任务
            if slot != GroupSlot::ROOT && cfs_rq.tg.is_idle() {
                idle = 1;
            }

            flags = EnqueueFlag::ENQUEUE_WAKEUP;
            se = self.parent_entity(cur);
        }

        while let Some(cur) = se {
            let slot = self.ents[cur].cfs_rq;
            let cfs_rq = &mut self.cfs_rqs[slot];
            cfs_rq.h_nr_running += 1;
            cfs_rq.idle_h_nr_running += idle;
            if slot != GroupSlot::ROOT && cfs_rq.tg.is_idle() {
                idle = 1;
            }

            if self.cfs_rq_throttled(slot) {
                break;
            }
            self.update_load_avg(slot, cur, UpdateAvgFlags::UPDATE_TG);
            self.update_cfs_group(cur);
            se = self.parent_entity(cur);
        }

        // 一直走到了根，说明任务真的变成了可运行的
        if se.is_none() {
            self.add_nr_running(1);
        }
    }

    /// ## 公平调度任务出队
    pub fn dequeue_task_fair(&mut self, pid: Pid, mut flags: DequeueFlag) {
        let mut idle = self.task(pid).map(|t| t.is_idle_policy() as u32).unwrap_or(0);
        let task_sleep = flags.contains(DequeueFlag::DEQUEUE_SLEEP);
        let mut se = Some(EntityRef::Task(pid));

        while let Some(cur) = se {
            let slot = self.ents[cur].cfs_rq;
            self.dequeue_entity(slot, cur, flags);

            if self.cfs_rq_throttled(slot) {
                break;
            }
            let cfs_rq = &mut self.cfs_rqs[slot];
            cfs_rq.h_nr_running = cfs_rq.h_nr_running.saturating_sub(1);
            cfs_rq.idle_h_nr_running = cfs_rq.idle_h_nr_running.saturating_sub(idle);
            if slot != GroupSlot::ROOT && cfs_rq.tg.is_idle() {
                idle = 1;
            }

            // 队列中还有别的实体，父实体留在队列里
            if cfs_rq.load.weight > 0 {
                se = self.parent_entity(cur);
                // 睡眠的任务还在它的时间片内时，倾向于继续运行同一个组里的任务
                if task_sleep && !self.throttled_hierarchy(slot) {
                    if let Some(parent) = se {
                        self.set_next_buddy(parent);
                    }
                }
                break;
            }
            flags |= DequeueFlag::DEQUEUE_SLEEP;
            se = self.parent_entity(cur);
        }

        while let Some(cur) = se {
            let slot = self.ents[cur].cfs_rq;
            let cfs_rq = &mut self.cfs_rqs[slot];
            cfs_rq.h_nr_running = cfs_rq.h_nr_running.saturating_sub(1);
            cfs_rq.idle_h_nr_running = cfs_rq.idle_h_nr_running.saturating_sub(idle);
            if slot != GroupSlot::ROOT && cfs_rq.tg.is_idle() {
                idle = 1;
            }

            if self.cfs_rq_throttled(slot) {
                break;
            }
            self.update_load_avg(slot, cur, UpdateAvgFlags::UPDATE_TG);
            self.update_cfs_group(cur);
            se = self.parent_entity(cur);
        }

        if se.is_none() {
            self.sub_nr_running(1);
        }
    }

    /// ## 从根运行队列开始逐层挑选，直到选中一个任务
    ///
    /// 调用者已经把之前运行的任务换下。
    pub fn pick_next_task_fair(&mut self) -> Option<Pid> {
        if self.root_cfs().nr_running == 0 {
            return None;
        }

        let mut slot = GroupSlot::ROOT;
        loop {
            let se = match self.pick_next_entity(slot) {
                Some(se) => se,
                None => {
                    log::warn!(
                        "cpu {}: group {} has no runnable entity while its parent picked it",
                        self.cpu,
                        slot
                    );
                    return None;
                }
            };
            self.set_next_entity(slot, se);
            match se {
                EntityRef::Task(pid) => {
                    // 最近运行的任务放在链表头部，负载均衡从尾部开始挑
                    self.cfs_tasks.retain(|p| *p != pid);
                    self.cfs_tasks.push_front(pid);
                    return Some(pid);
                }
                EntityRef::Group(g) => slot = g,
            }
        }
    }

    pub fn put_prev_task_fair(&mut self, prev: Pid) {
        let mut se = Some(EntityRef::Task(prev));
        while let Some(cur) = se {
            let slot = self.ents[cur].cfs_rq;
            self.put_prev_entity(slot, cur);
            se = self.parent_entity(cur);
        }
    }

    /// 已经在队列中的任务直接成为正在运行的任务
    pub fn set_next_task_fair(&mut self, pid: Pid) {
        let mut se = Some(EntityRef::Task(pid));
        while let Some(cur) = se {
            let slot = self.ents[cur].cfs_rq;
            self.set_next_entity(slot, cur);
            self.account_cfs_rq_runtime(slot, 0);
            se = self.parent_entity(cur);
        }
    }

    /// ## 检查被唤醒的任务能否抢占当前任务
    pub fn check_preempt_wakeup(&mut self, pid: Pid, wake_flags: WakeupFlags) {
        let curr_pid = match self.curr {
            Some(c) => c,
            None => return,
        };
        if curr_pid == pid {
            return;
        }
        let (curr_slot, curr_idle_policy) = match self.task(curr_pid) {
            Some(t) => (t.se.cfs_rq, t.is_idle_policy()),
            None => return,
        };
        let (p_slot, p_policy) = match self.task(pid) {
            Some(t) => (t.se.cfs_rq, t.policy),
            None => return,
        };

        let scale = self.cfs_rqs[curr_slot].nr_running as u64 >= self.cfg.nr_latency();
        let mut next_buddy_marked = false;

        // 在被限流的层级里入队的任务不会马上运行
        if self.throttled_hierarchy(p_slot) {
            return;
        }

        let pse = EntityRef::Task(pid);
        let se = EntityRef::Task(curr_pid);

        if self.sched_feat(SchedFeature::NEXT_BUDDY) && scale && !wake_flags.contains(WakeupFlags::WF_FORK) {
            self.set_next_buddy(pse);
            next_buddy_marked = true;
        }

        if self.need_resched {
            return;
        }

        // 空闲任务总是被非空闲任务抢占
        if curr_idle_policy && p_policy != SchedPolicy::IDLE {
            return self.preempt_wakeup(se, scale);
        }

        // 批处理和空闲任务不通过唤醒抢占别人，它们的抢占由时钟滴答驱动
        if p_policy != SchedPolicy::CFS || !self.sched_feat(SchedFeature::WAKEUP_PREEMPTION) {
            return;
        }

        let (se, pse) = match self.find_matching_se(se, pse) {
            Some(pair) => pair,
            None => return,
        };

        let cse_is_idle = self.se_is_idle(se);
        let pse_is_idle = self.se_is_idle(pse);
        // 非空闲的任务组抢占空闲的任务组，反过来则不行
        if cse_is_idle && !pse_is_idle {
            return self.preempt_wakeup(se, scale);
        }
        if cse_is_idle != pse_is_idle {
            return;
        }

        let slot = self.ents[se].cfs_rq;
        self.update_curr(slot);
        if self.wakeup_preempt_entity(se, pse) == 1 {
            if !next_buddy_marked {
                self.set_next_buddy(pse);
            }
            self.preempt_wakeup(se, scale);
        }
    }

    fn preempt_wakeup(&mut self, se: EntityRef, scale: bool) {
        self.resched_curr();

        if !self.ents[se].on_rq {
            return;
        }
        if self.sched_feat(SchedFeature::LAST_BUDDY) && scale && se.is_task() {
            self.set_last_buddy(se);
        }
    }

    /// ## 当前任务主动让出CPU
    pub fn yield_task_fair(&mut self) {
        let curr = match self.curr {
            Some(c) => c,
            None => return,
        };
        if self.nr_running == 1 {
            return;
        }
        let (slot, policy) = match self.task(curr) {
            Some(t) => (t.se.cfs_rq, t.policy),
            None => return,
        };
        let se = EntityRef::Task(curr);

        self.clear_buddies(slot, se);

        if policy != SchedPolicy::BATCH {
            self.update_rq_clock();
            self.update_curr(slot);
        }

        self.set_skip_buddy(se);
    }

    /// ## 新任务的初始vruntime
    ///
    /// 从同一运行队列上正在运行的实体继承vruntime，再放到一个时间片之后。
    /// 结果以相对值保存，任务第一次入队时再加上min_vruntime。
    pub fn task_fork_fair(&mut self, pid: Pid) {
        self.update_rq_clock();

        let e = EntityRef::Task(pid);
        let slot = self.ents[e].cfs_rq;
        let curr = self.cfs_rqs[slot].curr;

        if let Some(c) = curr {
            self.update_curr(slot);
            let v = self.ents[c].vruntime;
            self.ents[e].vruntime = v;
        }
        self.place_entity(slot, e, true);

        if self.cfg.child_runs_first {
            if let Some(c) = curr {
                if self.entity_before(c, e) {
                    // 交换vruntime，让子任务先运行
                    let cv = self.ents[c].vruntime;
                    let ev = self.ents[e].vruntime;
                    self.ents[c].vruntime = ev;
                    self.ents[e].vruntime = cv;
                    self.resched_curr();
                }
            }
        }

        let min = self.cfs_rqs[slot].min_vruntime;
        let se = &mut self.ents[e];
        se.vruntime = se.vruntime.wrapping_sub(min);
    }

    /// ## 修改实体的权重
    ///
    /// 在队列中的实体先把旧权重从队列中减掉，改完再加回去，负载贡献同样处理。
    pub fn reweight_entity(&mut self, slot: GroupSlot, e: EntityRef, weight: u64) {
        let on_rq = self.ents[e].on_rq;
        if on_rq {
            if self.cfs_rqs[slot].curr == Some(e) {
                self.update_curr(slot);
            }
            let old = self.ents[e].load.weight;
            self.cfs_rqs[slot].load.update_sub(old);
            self.dequeue_runnable_load_avg(slot, e);
        }
        // 还没有计入运行队列的负载（新任务、新组实体）不能从队列中减
        let attached = self.ents[e].avg_attached;
        if attached {
            self.dequeue_load_avg(slot, e);
        }

        let se = &mut self.ents[e];
        se.load.update_set(weight);
        let divider = se.avg.get_pelt_divider();
        se.avg.load_avg = weight * se.avg.load_sum / divider;

        if attached {
            self.enqueue_load_avg(slot, e);
        }
        if on_rq {
            self.cfs_rqs[slot].load.update_add(weight);
            self.enqueue_runnable_load_avg(slot, e);
        }
    }

    /// 任务的nice值或调度策略变化之后重新计算权重
    pub fn reweight_task(&mut self, pid: Pid) {
        let (slot, weight) = match self.task(pid) {
            Some(t) => (t.se.cfs_rq, super::task::SchedTask::policy_weight(t.policy, t.nice)),
            None => return,
        };
        self.reweight_entity(slot, EntityRef::Task(pid), weight);
    }

    /// ## 时钟滴答
    pub fn task_tick_fair(&mut self, pid: Pid) {
        let mut se = Some(EntityRef::Task(pid));
        while let Some(cur) = se {
            let slot = self.ents[cur].cfs_rq;
            self.entity_tick(slot, cur);
            se = self.parent_entity(cur);
        }
    }

    /// 实体的负载变化沿着父实体链向上传递
    fn propagate_entity_cfs_rq(&mut self, e: EntityRef) {
        let mut se = self.parent_entity(e);
        while let Some(cur) = se {
            let slot = self.ents[cur].cfs_rq;
            if self.cfs_rq_throttled(slot) {
                break;
            }
            self.update_load_avg(slot, cur, UpdateAvgFlags::UPDATE_TG);
            se = self.parent_entity(cur);
        }
    }

    /// ## 把实体的负载从所在的运行队列中拿走
    pub(crate) fn detach_entity_cfs_rq(&mut self, e: EntityRef) {
        let slot = self.ents[e].cfs_rq;
        self.update_load_avg(slot, e, UpdateAvgFlags::empty());
        self.detach_entity_load_avg(slot, e);
        self.update_tg_load_avg(slot);
        self.propagate_entity_cfs_rq(e);
    }

    /// ## 把实体的负载计入所在的运行队列
    pub(crate) fn attach_entity_cfs_rq(&mut self, e: EntityRef) {
        let slot = self.ents[e].cfs_rq;
        self.ents[e].depth = self.cfs_rqs[slot].depth;
        self.update_load_avg(slot, e, UpdateAvgFlags::SKIP_AGE_LOAD);
        self.attach_entity_load_avg(slot, e);
        self.update_tg_load_avg(slot);
        self.propagate_entity_cfs_rq(e);
    }

    /// 任务的vruntime当前是否是相对值：在队列中（被非睡眠地出队了）或者从未运行过
    fn vruntime_normalized(&self, pid: Pid) -> bool {
        match self.task(pid) {
            Some(t) => t.on_rq != OnRq::None || t.se.sum_exec_runtime == 0,
            None => true,
        }
    }

    /// ## 任务换到另一个任务组
    ///
    /// 调用者已经把任务移出队列并换下。
    pub fn task_change_group_fair(&mut self, pid: Pid, new_slot: GroupSlot) {
        let e = EntityRef::Task(pid);
        let normalized = self.vruntime_normalized(pid);
        let old_slot = self.ents[e].cfs_rq;

        if !normalized {
            // 睡眠中的任务的vruntime是绝对值，先转换成相对于旧队列的值
            self.place_entity(old_slot, e, false);
            let min = self.cfs_rqs[old_slot].min_vruntime;
            let se = &mut self.ents[e];
            se.vruntime = se.vruntime.wrapping_sub(min);
        }
        if self.ents[e].avg_attached {
            self.detach_entity_cfs_rq(e);
        }

        self.ents[e].cfs_rq = new_slot;
        self.attach_entity_cfs_rq(e);

        if !normalized {
            let min = self.cfs_rqs[new_slot].min_vruntime;
            let se = &mut self.ents[e];
            se.vruntime = se.vruntime.wrapping_add(min);
        }
    }

    /// ## 任务即将离开这个CPU
    ///
    /// 睡眠的任务把vruntime转成相对值；负载从运行队列中拿走，到了新CPU上入队时再计入。
    pub fn migrate_task_rq_fair(&mut self, pid: Pid) {
        let e = EntityRef::Task(pid);
        let queued = match self.task(pid) {
            Some(t) => t.on_rq != OnRq::None,
            None => return,
        };

        if !queued {
            let slot = self.ents[e].cfs_rq;
            let min = self.cfs_rqs[slot].min_vruntime;
            let se = &mut self.ents[e];
            se.vruntime = se.vruntime.wrapping_sub(min);
        }

        if self.ents[e].avg_attached {
            self.detach_entity_cfs_rq(e);
        }

        let se = &mut self.ents[e];
        se.exec_start = 0;
        se.nr_migrations += 1;
    }

    /// ## 任务离开公平调度类
    ///
    /// 睡眠中的任务先把vruntime转成相对值，然后把负载从运行队列中拿走。
    pub fn switched_from_fair(&mut self, pid: Pid) {
        let e = EntityRef::Task(pid);
        if self.ents.get(e).is_none() {
            return;
        }
        if !self.vruntime_normalized(pid) {
            let slot = self.ents[e].cfs_rq;
            self.place_entity(slot, e, false);
            let min = self.cfs_rqs[slot].min_vruntime;
            let se = &mut self.ents[e];
            se.vruntime = se.vruntime.wrapping_sub(min);
        }
        if self.ents[e].avg_attached {
            self.detach_entity_cfs_rq(e);
        }
    }

    /// ## 任务进入公平调度类
    pub fn switched_to_fair(&mut self, pid: Pid) {
        let e = EntityRef::Task(pid);
        if self.ents.get(e).is_none() {
            return;
        }
        if !self.ents[e].avg_attached {
            self.attach_entity_cfs_rq(e);
        }
        if !self.vruntime_normalized(pid) {
            let slot = self.ents[e].cfs_rq;
            let min = self.cfs_rqs[slot].min_vruntime;
            let se = &mut self.ents[e];
            se.vruntime = se.vruntime.wrapping_add(min);
        }
    }

    /// 任务退出，移除它残留的负载
    pub fn task_dead_fair(&mut self, pid: Pid) {
        let e = EntityRef::Task(pid);
        if self.ents.get(e).map(|se| se.avg_attached).unwrap_or(false) {
            self.detach_entity_cfs_rq(e);
        }
    }
}

/// 完全公平调度类
pub struct CompletelyFairScheduler;

impl SchedClass for CompletelyFairScheduler {
    fn enqueue_task(&self, rq: &mut CpuRunQueue, pid: Pid, flags: EnqueueFlag) {
        rq.enqueue_task_fair(pid, flags);
    }

    fn dequeue_task(&self, rq: &mut CpuRunQueue, pid: Pid, flags: DequeueFlag) {
        rq.dequeue_task_fair(pid, flags);
    }

    fn yield_task(&self, rq: &mut CpuRunQueue) {
        rq.yield_task_fair();
    }

    fn check_preempt_curr(&self, rq: &mut CpuRunQueue, pid: Pid, flags: WakeupFlags) {
        rq.check_preempt_wakeup(pid, flags);
    }

    fn pick_next_task(&self, rq: &mut CpuRunQueue) -> Option<Pid> {
        rq.pick_next_task_fair()
    }

    fn put_prev_task(&self, rq: &mut CpuRunQueue, prev: Pid) {
        rq.put_prev_task_fair(prev);
    }

    fn set_next_task(&self, rq: &mut CpuRunQueue, pid: Pid) {
        rq.set_next_task_fair(pid);
    }

    fn task_tick(&self, rq: &mut CpuRunQueue, pid: Pid, _queued: bool) {
        rq.task_tick_fair(pid);
    }

    fn task_fork(&self, rq: &mut CpuRunQueue, pid: Pid) {
        rq.task_fork_fair(pid);
    }

    fn update_curr(&self, rq: &mut CpuRunQueue) {
        rq.update_curr_fair();
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::{
        libs::cpumask::CpuMask,
        sched::{
            clock::ManualClock,
            config::SchedConfig,
            group::{TaskGroupId, TaskGroupTree},
            task::{SchedAttr, SchedTask},
            NSEC_PER_MSEC, SCHED_CAPACITY_SCALE,
        },
        smp::cpu::{NodeId, ProcessorId},
    };

    fn test_rq(clock: &Arc<ManualClock>) -> CpuRunQueue {
        let tree = TaskGroupTree::new();
        let root = CfsRunQueue::new(tree.root(), GroupSlot::ROOT, None, 0);
        CpuRunQueue::new(
            ProcessorId::new(0),
            NodeId::new(0),
            SCHED_CAPACITY_SCALE,
            Arc::new(SchedConfig::default()),
            clock.clone(),
            root,
        )
    }

    fn add_task(rq: &mut CpuRunQueue, pid: usize, nice: i32) -> Pid {
        let pid = Pid::new(pid);
        let attr = SchedAttr {
            nice,
            ..Default::default()
        };
        let task = SchedTask::new(pid, &attr, TaskGroupId::ROOT, CpuMask::first_n(1), rq.cpu);
        rq.ents.insert_task(task);
        rq.task_fork_fair(pid);
        rq.enqueue_task_fair(pid, EnqueueFlag::empty());
        rq.task_mut(pid).unwrap().on_rq = OnRq::Queued;
        pid
    }

    #[test]
    fn vruntime_helpers_are_wrap_safe() {
        assert_eq!(max_vruntime(u64::MAX - 5, 3), 3);
        assert_eq!(min_vruntime(u64::MAX - 5, 3), u64::MAX - 5);
        assert_eq!(max_vruntime(10, 20), 20);
        assert_eq!(min_vruntime(10, 20), 10);
    }

    #[test]
    fn period_grows_linearly_past_nr_latency() {
        let clock = Arc::new(ManualClock::new(0));
        let rq = test_rq(&clock);
        assert_eq!(rq.sched_period(1), 6 * NSEC_PER_MSEC);
        assert_eq!(rq.sched_period(8), 6 * NSEC_PER_MSEC);
        assert_eq!(rq.sched_period(10), 7_500_000);
    }

    #[test]
    fn picks_leftmost_and_ratchets_min_vruntime() {
        let clock = Arc::new(ManualClock::new(10 * NSEC_PER_MSEC));
        let mut rq = test_rq(&clock);
        let a = add_task(&mut rq, 1, 0);
        let b = add_task(&mut rq, 2, 0);
        assert_eq!(rq.nr_running, 2);
        assert_eq!(rq.root_cfs().h_nr_running, 2);

        // b的时间片是在a已经入队之后算的，比a的短，所以排在前面
        let first = rq.pick_next_task_fair().unwrap();
        assert_eq!(first, b);
        rq.curr = Some(first);

        let before = rq.root_cfs().min_vruntime;
        clock.advance(3 * NSEC_PER_MSEC);
        rq.update_rq_clock();
        rq.update_curr_fair();
        assert!(rq.root_cfs().min_vruntime >= before);
        assert_eq!(rq.task(b).unwrap().se.sum_exec_runtime, 3 * NSEC_PER_MSEC);
        assert_eq!(rq.task(a).unwrap().se.vruntime, rq.task(b).unwrap().se.vruntime);

        rq.put_prev_task_fair(b);
        rq.curr = None;
        // 两者vruntime相同，先插入时间线的a在左边
        let next = rq.pick_next_task_fair().unwrap();
        assert_eq!(next, a);
    }

    #[test]
    fn heavier_task_gets_slower_vruntime() {
        let clock = Arc::new(ManualClock::new(10 * NSEC_PER_MSEC));
        let mut rq = test_rq(&clock);
        let heavy = add_task(&mut rq, 1, -5);
        let light = add_task(&mut rq, 2, 5);
        let h = &rq.task(heavy).unwrap().se;
        let l = &rq.task(light).unwrap().se;
        assert!(h.calc_delta_fair(NSEC_PER_MSEC) < NSEC_PER_MSEC);
        assert!(l.calc_delta_fair(NSEC_PER_MSEC) > NSEC_PER_MSEC);
        // 时间片与权重成正比
        assert!(rq.sched_slice(GroupSlot::ROOT, EntityRef::Task(heavy)) > rq.sched_slice(GroupSlot::ROOT, EntityRef::Task(light)));
    }

    #[test]
    fn wakeup_placement_never_moves_backwards() {
        let clock = Arc::new(ManualClock::new(10 * NSEC_PER_MSEC));
        let mut rq = test_rq(&clock);
        let a = add_task(&mut rq, 1, 0);
        let e = EntityRef::Task(a);
        let min = rq.root_cfs().min_vruntime;

        rq.ents[e].vruntime = min - NSEC_PER_MSEC * 100;
        rq.place_entity(GroupSlot::ROOT, e, false);
        assert_eq!(rq.ents[e].vruntime, min - 3 * NSEC_PER_MSEC);

        rq.ents[e].vruntime = min + 7;
        rq.place_entity(GroupSlot::ROOT, e, false);
        assert_eq!(rq.ents[e].vruntime, min + 7);
    }

    #[test]
    fn wakeup_preempt_entity_uses_granularity() {
        let clock = Arc::new(ManualClock::new(10 * NSEC_PER_MSEC));
        let mut rq = test_rq(&clock);
        let a = EntityRef::Task(add_task(&mut rq, 1, 0));
        let b = EntityRef::Task(add_task(&mut rq, 2, 0));
        let base = rq.ents[b].vruntime;

        rq.ents[a].vruntime = base;
        assert_eq!(rq.wakeup_preempt_entity(a, b), -1);
        rq.ents[a].vruntime = base + NSEC_PER_MSEC / 2;
        assert_eq!(rq.wakeup_preempt_entity(a, b), 0);
        rq.ents[a].vruntime = base + 2 * NSEC_PER_MSEC;
        assert_eq!(rq.wakeup_preempt_entity(a, b), 1);
    }

    #[test]
    fn dequeue_without_sleep_makes_vruntime_relative() {
        let clock = Arc::new(ManualClock::new(10 * NSEC_PER_MSEC));
        let mut rq = test_rq(&clock);
        let a = add_task(&mut rq, 1, 0);
        let abs = rq.task(a).unwrap().se.vruntime;
        let min = rq.root_cfs().min_vruntime;

        rq.dequeue_task_fair(a, DequeueFlag::DEQUEUE_SAVE | DequeueFlag::DEQUEUE_MOVE);
        assert_eq!(rq.task(a).unwrap().se.vruntime, abs.wrapping_sub(min));
        assert_eq!(rq.nr_running, 0);
        assert!(rq.cfs_tasks.is_empty());

        rq.enqueue_task_fair(a, EnqueueFlag::ENQUEUE_RESTORE | EnqueueFlag::ENQUEUE_MOVE);
        assert_eq!(rq.task(a).unwrap().se.vruntime, abs);
        assert_eq!(rq.cfs_tasks.front(), Some(&a));
    }
}
