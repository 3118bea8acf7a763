//! 按实体的负载跟踪（PELT）
//!
//! 时间被切成1024us的周期，每个周期的贡献按 y^n 衰减，y^32 = 1/2。
//! 实体和运行队列各自维护 load/runnable/util 三组累加和与平均值。

use super::{
    entity::EntityRef, group::GroupSlot, CpuRunQueue, SchedFeature, SCHED_CAPACITY_SCALE,
    SCHED_CAPACITY_SHIFT,
};

/// y^n 的定点表示（乘以2^32），n = 0..31
const RUNNABLE_AVG_Y_N_INV: [u32; 32] = [
    0xffffffff, 0xfa83b2da, 0xf5257d14, 0xefe4b99a, 0xeac0c6e6, 0xe5b906e6, 0xe0ccdeeb, 0xdbfbb796,
    0xd744fcc9, 0xd2a81d91, 0xce248c14, 0xc9b9bd85, 0xc5672a10, 0xc12c4cc9, 0xbd08a39e, 0xb8fbaf46,
    0xb504f333, 0xb123f581, 0xad583ee9, 0xa9a15ab4, 0xa5fed6a9, 0xa2704302, 0x9ef5325f, 0x9b8d39b9,
    0x9837f050, 0x94f4efa8, 0x91c3d373, 0x8ea4398a, 0x8b95c1e3, 0x88980e80, 0x85aac367, 0x82cd8698,
];

pub const LOAD_AVG_PERIOD: u64 = 32;
/// 一直处于可运行状态时load_sum能达到的最大值
pub const LOAD_AVG_MAX: u64 = 47742;
pub const PELT_MIN_DIVIDER: u64 = LOAD_AVG_MAX - 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerAvg {
    /// 存储上次更新这些平均值的时间
    pub last_update_time: u64,
    /// 存储所有可运行任务的负载之和
    pub load_sum: u64,
    /// 存储所有可运行任务的时间之和
    pub runnable_sum: u64,
    /// 存储所有运行任务的时间之和
    pub util_sum: u64,
    /// 记录当前未满的周期已经累计的时间（us）
    pub period_contrib: u32,

    pub load_avg: u64,
    pub runnable_avg: u64,
    pub util_avg: u64,
}

impl SchedulerAvg {
    #[inline]
    pub fn get_pelt_divider(&self) -> u64 {
        return PELT_MIN_DIVIDER + self.period_contrib as u64;
    }

    /// ## 把从上次更新到now之间的时间累加进sum
    ///
    /// 返回是否跨过了至少一个周期（也就是平均值需要重新计算）。
    pub fn update_load_sum(
        &mut self,
        now: u64,
        load: u64,
        mut runnable: u64,
        mut running: u64,
    ) -> bool {
        if now < self.last_update_time {
            self.last_update_time = now;
            return false;
        }

        // 以1024ns近似1us
        let mut delta = now - self.last_update_time;
        delta >>= 10;

        if delta == 0 {
            return false;
        }

        self.last_update_time += delta << 10;

        // 不在队列上的实体既不可运行也不在运行
        if load == 0 {
            runnable = 0;
            running = 0;
        }

        self.accumulate_sum(delta, load, runnable, running) != 0
    }

    fn accumulate_sum(&mut self, mut delta: u64, load: u64, runnable: u64, running: u64) -> u64 {
        let mut contrib = delta;

        delta += self.period_contrib as u64;

        let periods = delta / 1024;

        if periods > 0 {
            self.load_sum = decay_load(self.load_sum, periods);
            self.runnable_sum = decay_load(self.runnable_sum, periods);
            self.util_sum = decay_load(self.util_sum, periods);

            delta %= 1024;
            if load > 0 {
                contrib = accumulate_pelt_segments(
                    periods,
                    1024 - self.period_contrib,
                    delta as u32,
                ) as u64;
            }
        }

        self.period_contrib = delta as u32;

        if load > 0 {
            self.load_sum += contrib * load;
        }
        if runnable > 0 {
            self.runnable_sum += (runnable * contrib) << SCHED_CAPACITY_SHIFT;
        }
        if running > 0 {
            self.util_sum += contrib << SCHED_CAPACITY_SHIFT;
        }

        return periods;
    }

    pub fn update_load_avg(&mut self, load: u64) {
        let divider = self.get_pelt_divider();

        self.load_avg = load * self.load_sum / divider;
        self.runnable_avg = self.runnable_sum / divider;
        self.util_avg = self.util_sum / divider;
    }
}

/// ## 计算 val * y^n
///
/// n为0时原样返回，超过32*63个周期之后任何u64都已经衰减到0。
pub fn decay_load(mut val: u64, n: u64) -> u64 {
    if n == 0 {
        return val;
    }
    if n > LOAD_AVG_PERIOD * 63 {
        return 0;
    }

    let mut local_n = n;
    if local_n >= LOAD_AVG_PERIOD {
        val >>= local_n / LOAD_AVG_PERIOD;
        local_n %= LOAD_AVG_PERIOD;
    }

    ((val as u128 * RUNNABLE_AVG_Y_N_INV[local_n as usize] as u128) >> 32) as u64
}

/// 跨越periods个周期时的贡献，分成三段：
///
/// ```text
///            d1          d2           d3
///            ^           ^            ^
///            |           |            |
///          |<->|<----------------->|<--->|
///  ... |---x---|------| ... |------|-----x (now)
/// ```
fn accumulate_pelt_segments(periods: u64, d1: u32, d3: u32) -> u32 {
    /* y^0 == 1 */
    let c3 = d3;

    // c1 = d1 y^p
    let c1 = decay_load(d1 as u64, periods) as u32;

    //            p-1
    // c2 = 1024 \Sum y^n
    //            n=1
    let c2 = (LOAD_AVG_MAX - decay_load(LOAD_AVG_MAX, periods)).saturating_sub(1024) as u32;

    return c1 + c2 + c3;
}

bitflags! {
    pub struct UpdateAvgFlags: u8 {
        /// 更新任务组（task group）信息
        const UPDATE_TG	= 0x1;
        /// 跳过年龄和负载的更新
        const SKIP_AGE_LOAD	= 0x2;
        /// 执行附加操作
        const DO_ATTACH	= 0x4;
        /// 执行分离操作
        const DO_DETACH	= 0x8;
    }
}

pub fn add_positive(x: &mut u64, y: i64) {
    if y < 0 {
        *x = x.saturating_sub(y.unsigned_abs());
    } else {
        *x = x.saturating_add(y as u64);
    }
}

pub fn sub_positive(x: &mut u64, y: u64) {
    *x = x.saturating_sub(y);
}

#[inline]
fn cap_scale(v: u64, s: u64) -> u64 {
    (v * s) >> SCHED_CAPACITY_SHIFT
}

impl CpuRunQueue {
    pub fn rq_clock_pelt(&self) -> u64 {
        self.clock_pelt.saturating_sub(self.lost_idle_time)
    }

    /// ## 推进PELT时钟
    ///
    /// 运行时按CPU算力缩放，这样小核上跑满和大核上跑满得到的利用率不同；
    /// 空闲时直接与任务时钟同步。
    pub(crate) fn update_rq_clock_pelt(&mut self, delta: u64) {
        if self.is_idle() {
            self.update_idle_rq_clock_pelt();
            return;
        }

        let delta = cap_scale(delta, self.cpu_capacity_orig);
        self.clock_pelt += delta;
    }

    fn update_idle_rq_clock_pelt(&mut self) {
        let divider = ((LOAD_AVG_MAX - 1024) << SCHED_CAPACITY_SHIFT) - LOAD_AVG_MAX;
        let util_sum = self.root_cfs().avg.util_sum + self.avg_rt.util_sum;

        // 利用率已经到顶，说明CPU满载，这段空闲时间是真的空闲，需要从PELT时钟里扣掉
        if util_sum >= divider {
            self.lost_idle_time += self.clock_task.saturating_sub(self.clock_pelt);
        }
        self.clock_pelt = self.clock_task;
    }

    /// 运行队列的PELT时钟，被限流期间停止走动
    pub fn cfs_rq_clock_pelt(&self, slot: GroupSlot) -> u64 {
        let cfs_rq = &self.cfs_rqs[slot];
        if cfs_rq.throttle_count > 0 {
            return cfs_rq
                .throttled_clock_pelt
                .saturating_sub(cfs_rq.throttled_clock_pelt_time);
        }
        self.rq_clock_pelt()
            .saturating_sub(cfs_rq.throttled_clock_pelt_time)
    }

    fn update_load_avg_se(&mut self, now: u64, slot: GroupSlot, e: EntityRef) -> bool {
        let running = self.cfs_rqs[slot].curr == Some(e);
        let se_on_rq = self.ents[e].on_rq;
        let runnable = match e {
            EntityRef::Task(_) => se_on_rq as u64,
            EntityRef::Group(g) => self.cfs_rqs[g].h_nr_running as u64,
        };

        let se = &mut self.ents[e];
        let old = se.avg.load_avg;
        if !se
            .avg
            .update_load_sum(now, se_on_rq as u64, runnable, running as u64)
        {
            return false;
        }
        let weight = se.load.weight;
        se.avg.update_load_avg(weight);
        let new = se.avg.load_avg;

        if se_on_rq {
            let cfs_rq = &mut self.cfs_rqs[slot];
            add_positive(&mut cfs_rq.runnable_load_avg, new as i64 - old as i64);
        }
        true
    }

    pub(crate) fn update_cfs_rq_load_avg(&mut self, now: u64, slot: GroupSlot) -> bool {
        let cfs_rq = &mut self.cfs_rqs[slot];
        let load = cfs_rq.load.weight;
        let runnable = cfs_rq.h_nr_running as u64;
        let running = cfs_rq.curr.is_some() as u64;
        if cfs_rq.avg.update_load_sum(now, load, runnable, running) {
            cfs_rq.avg.update_load_avg(1);
            return true;
        }
        false
    }

    /// ## 更新实体以及它所在运行队列的负载
    pub(crate) fn update_load_avg(&mut self, slot: GroupSlot, e: EntityRef, flags: UpdateAvgFlags) {
        let now = self.cfs_rq_clock_pelt(slot);

        if self.ents[e].avg_attached && !flags.contains(UpdateAvgFlags::SKIP_AGE_LOAD) {
            self.update_load_avg_se(now, slot, e);
        }

        let mut decayed = self.update_cfs_rq_load_avg(now, slot);
        decayed |= self.propagate_entity_load_avg(e);

        if !self.ents[e].avg_attached && flags.contains(UpdateAvgFlags::DO_ATTACH) {
            self.attach_entity_load_avg(slot, e);
            self.update_tg_load_avg(slot);
        } else if flags.contains(UpdateAvgFlags::DO_DETACH) {
            self.detach_entity_load_avg(slot, e);
            self.update_tg_load_avg(slot);
        } else if decayed && flags.contains(UpdateAvgFlags::UPDATE_TG) {
            self.update_tg_load_avg(slot);
        }
    }

    /// ## 把实体的负载计入运行队列
    pub(crate) fn attach_entity_load_avg(&mut self, slot: GroupSlot, e: EntityRef) {
        let (cfs_avg_last, cfs_contrib, divider) = {
            let a = &self.cfs_rqs[slot].avg;
            (a.last_update_time, a.period_contrib, a.get_pelt_divider())
        };

        let se = &mut self.ents[e];
        // 与运行队列对齐到同一个时间点，这样之后两者的衰减是同步的
        se.avg.last_update_time = cfs_avg_last;
        se.avg.period_contrib = cfs_contrib;

        se.avg.util_sum = se.avg.util_avg * divider;
        se.avg.runnable_sum = se.avg.runnable_avg * divider;
        se.avg.load_sum = divider;
        if se.load.weight > 0 {
            se.avg.load_sum = se.avg.load_avg * se.avg.load_sum / se.load.weight;
        }
        se.avg_attached = true;
        let sa = se.avg;
        let weight = se.load.weight;

        let cfs_rq = &mut self.cfs_rqs[slot];
        cfs_rq.avg.load_avg += sa.load_avg;
        cfs_rq.avg.load_sum += weight * sa.load_sum;
        cfs_rq.avg.util_avg += sa.util_avg;
        cfs_rq.avg.util_sum += sa.util_sum;
        cfs_rq.avg.runnable_avg += sa.runnable_avg;
        cfs_rq.avg.runnable_sum += sa.runnable_sum;

        cfs_rq.add_tg_cfs_propagate(sa.load_sum as i64);
    }

    /// ## 把实体的负载从运行队列中移除
    pub(crate) fn detach_entity_load_avg(&mut self, slot: GroupSlot, e: EntityRef) {
        let se = &mut self.ents[e];
        se.avg_attached = false;
        let sa = se.avg;
        let weight = se.load.weight;

        let cfs_rq = &mut self.cfs_rqs[slot];
        sub_positive(&mut cfs_rq.avg.load_avg, sa.load_avg);
        sub_positive(&mut cfs_rq.avg.load_sum, weight * sa.load_sum);
        sub_positive(&mut cfs_rq.avg.util_avg, sa.util_avg);
        sub_positive(&mut cfs_rq.avg.util_sum, sa.util_sum);
        sub_positive(&mut cfs_rq.avg.runnable_avg, sa.runnable_avg);
        sub_positive(&mut cfs_rq.avg.runnable_sum, sa.runnable_sum);

        cfs_rq.add_tg_cfs_propagate(-(sa.load_sum as i64));
    }

    /// 从运行队列的负载中减去/加上实体的贡献，用于改变实体权重的前后
    pub(crate) fn dequeue_load_avg(&mut self, slot: GroupSlot, e: EntityRef) {
        let se = &self.ents[e];
        let (load_avg, load_sum) = (se.avg.load_avg, se.load.weight * se.avg.load_sum);
        let cfs_rq = &mut self.cfs_rqs[slot];
        sub_positive(&mut cfs_rq.avg.load_avg, load_avg);
        sub_positive(&mut cfs_rq.avg.load_sum, load_sum);
    }

    pub(crate) fn enqueue_load_avg(&mut self, slot: GroupSlot, e: EntityRef) {
        let se = &self.ents[e];
        let (load_avg, load_sum) = (se.avg.load_avg, se.load.weight * se.avg.load_sum);
        let cfs_rq = &mut self.cfs_rqs[slot];
        cfs_rq.avg.load_avg += load_avg;
        cfs_rq.avg.load_sum += load_sum;
    }

    /// ## 把组运行队列上挂起的负载变化传递给它的组实体
    fn propagate_entity_load_avg(&mut self, e: EntityRef) -> bool {
        let gslot = match e.my_q() {
            Some(g) => g,
            None => return false,
        };
        let prop = {
            let gcfs = &mut self.cfs_rqs[gslot];
            if !gcfs.propagate {
                return false;
            }
            gcfs.propagate = false;
            core::mem::take(&mut gcfs.prop_runnable_sum)
        };

        let slot = self.ents[e].cfs_rq;
        self.cfs_rqs[slot].add_tg_cfs_propagate(prop);

        self.update_tg_cfs_util(slot, e, gslot);
        self.update_tg_cfs_load(slot, e, gslot, prop);
        true
    }

    fn update_tg_cfs_util(&mut self, slot: GroupSlot, e: EntityRef, gslot: GroupSlot) {
        let (g_util, g_runnable) = {
            let g = &self.cfs_rqs[gslot].avg;
            (g.util_avg, g.runnable_avg)
        };
        let se = &mut self.ents[e];
        let divider = se.avg.get_pelt_divider();
        let d_util = g_util as i64 - se.avg.util_avg as i64;
        let d_runnable = g_runnable as i64 - se.avg.runnable_avg as i64;
        if d_util == 0 && d_runnable == 0 {
            return;
        }

        se.avg.util_avg = g_util;
        se.avg.util_sum = g_util * divider;
        se.avg.runnable_avg = g_runnable;
        se.avg.runnable_sum = g_runnable * divider;

        let cfs_rq = &mut self.cfs_rqs[slot];
        let divider = cfs_rq.avg.get_pelt_divider();
        add_positive(&mut cfs_rq.avg.util_avg, d_util);
        cfs_rq.avg.util_sum = cfs_rq.avg.util_avg * divider;
        add_positive(&mut cfs_rq.avg.runnable_avg, d_runnable);
        cfs_rq.avg.runnable_sum = cfs_rq.avg.runnable_avg * divider;
    }

    fn update_tg_cfs_load(&mut self, slot: GroupSlot, e: EntityRef, gslot: GroupSlot, prop: i64) {
        if prop == 0 {
            return;
        }

        let (g_weight, g_load_sum) = {
            let g = &self.cfs_rqs[gslot];
            (g.load.weight, g.avg.load_sum)
        };
        let se = &mut self.ents[e];

        let mut runnable_sum: u64 = if prop >= 0 {
            // 加上新的可运行时间，最多到LOAD_AVG_MAX
            (prop as u64 + se.avg.load_sum).min(LOAD_AVG_MAX)
        } else {
            // 假设组里所有任务的可运行程度相同，估算组运行队列新的不带权重的可运行时间
            let load_sum = if g_weight > 0 { g_load_sum / g_weight } else { 0 };
            se.avg.load_sum.min(load_sum)
        };

        // 可运行时间不会少于运行时间
        let running_sum = se.avg.util_sum >> SCHED_CAPACITY_SHIFT;
        runnable_sum = runnable_sum.max(running_sum);

        let weight = se.load.weight;
        let load_sum = weight * runnable_sum;
        let load_avg = load_sum / LOAD_AVG_MAX;
        let delta_sum = load_sum as i64 - (weight * se.avg.load_sum) as i64;
        let delta_avg = load_avg as i64 - se.avg.load_avg as i64;

        se.avg.load_sum = runnable_sum;
        se.avg.load_avg = load_avg;
        let on_rq = se.on_rq;

        let cfs_rq = &mut self.cfs_rqs[slot];
        add_positive(&mut cfs_rq.avg.load_avg, delta_avg);
        add_positive(&mut cfs_rq.avg.load_sum, delta_sum);
        if on_rq {
            add_positive(&mut cfs_rq.runnable_load_avg, delta_avg);
        }
    }

    /// ## 发布本CPU对任务组负载的贡献
    ///
    /// 只有变化超过已发布贡献的 1/2^shift 才写任务组的共享计数。
    pub(crate) fn update_tg_load_avg(&mut self, slot: GroupSlot) {
        if slot == GroupSlot::ROOT {
            return;
        }
        let shift = self.cfg.tg_load_avg_hysteresis_shift;
        let cfs_rq = &mut self.cfs_rqs[slot];
        let delta = cfs_rq.avg.load_avg as i64 - cfs_rq.tg_load_avg_contrib;

        if delta.abs() > cfs_rq.tg_load_avg_contrib >> shift {
            cfs_rq.tg.add_load_avg(delta);
            cfs_rq.tg_load_avg_contrib = cfs_rq.avg.load_avg as i64;
        }
    }

    /// ## 新任务第一次入队之前，按所在运行队列的利用率估算它的初始利用率
    pub(crate) fn post_init_entity_util_avg(&mut self, e: EntityRef) {
        let slot = self.ents[e].cfs_rq;
        let (cfs_util, cfs_load) = {
            let a = &self.cfs_rqs[slot].avg;
            (a.util_avg, a.load_avg)
        };
        let cap = (self.cpu_capacity_orig as i64 - cfs_util as i64) / 2;

        let se = &mut self.ents[e];
        if cap > 0 {
            if cfs_util != 0 {
                let util = cfs_util * se.load.weight / (cfs_load + 1);
                se.avg.util_avg = util.min(cap as u64);
            } else {
                se.avg.util_avg = cap as u64;
            }
        }
        se.avg.runnable_avg = se.avg.util_avg;
    }

    /// ## 衰减睡眠任务留下的负载
    ///
    /// 自底向上更新每个组运行队列，并把变化传递给对应的组实体。
    pub fn update_blocked_averages(&mut self) {
        self.update_rq_clock();

        for slot in self.cfs_rqs.slots_bottom_up() {
            let now = self.cfs_rq_clock_pelt(slot);
            if self.update_cfs_rq_load_avg(now, slot) {
                self.update_tg_load_avg(slot);
            }

            if slot != GroupSlot::ROOT {
                let e = EntityRef::Group(slot);
                if self.ents.get(e).is_some() {
                    let parent = self.ents[e].cfs_rq;
                    self.update_load_avg(parent, e, UpdateAvgFlags::empty());
                }
            }
        }

        let now = self.rq_clock_pelt();
        let rt_running = self.curr_policy().map(|p| p.is_rt()).unwrap_or(false);
        self.update_rt_rq_load_avg(now, rt_running);

        self.last_blocked_load_update = self.clock;
        self.update_cpu_capacity();
    }

    /// 组运行队列的层级负载：它的负载在根运行队列负载中所占的份额
    pub(crate) fn cfs_rq_h_load(&self, slot: GroupSlot) -> u64 {
        let cfs_rq = &self.cfs_rqs[slot];
        let parent = match cfs_rq.parent {
            Some(p) if slot != GroupSlot::ROOT => p,
            _ => return cfs_rq.avg.load_avg,
        };
        let ge = match self.ents.get(EntityRef::Group(slot)) {
            Some(ge) => ge,
            None => return 0,
        };
        let h_parent = self.cfs_rq_h_load(parent);
        h_parent * ge.avg.load_avg / (self.cfs_rqs[parent].avg.load_avg + 1)
    }

    /// ## 任务在根运行队列层面的负载，负载均衡按这个值搬运任务
    pub fn task_h_load(&self, pid: super::task::Pid) -> u64 {
        let task = match self.task(pid) {
            Some(t) => t,
            None => return 0,
        };
        let slot = task.se.cfs_rq;
        let h = self.cfs_rq_h_load(slot);
        task.se.avg.load_avg * h / (self.cfs_rqs[slot].avg.load_avg + 1)
    }

    pub(crate) fn update_rt_rq_load_avg(&mut self, now: u64, running: bool) {
        let r = running as u64;
        if self.avg_rt.update_load_sum(now, r, r, r) {
            self.avg_rt.update_load_avg(1);
        }
    }

    /// ## 扣除实时任务占用之后留给公平调度任务的算力
    pub(crate) fn update_cpu_capacity(&mut self) {
        let max = self.cpu_capacity_orig;
        if !self.sched_feat(SchedFeature::NONTASK_CAPACITY) {
            self.cpu_capacity = max;
            return;
        }
        let used = self.avg_rt.util_avg;
        self.cpu_capacity = if used >= max { 1 } else { (max - used).max(1) };
    }

    /// 根运行队列中处于可运行状态的实体的负载，负载均衡按这个值比较CPU的忙碌程度
    #[inline]
    pub fn cpu_runnable_load(&self) -> u64 {
        self.root_cfs().runnable_load_avg
    }

    /// CPU的利用率，不超过原始算力
    #[inline]
    pub fn cpu_util(&self) -> u64 {
        self.root_cfs().avg.util_avg.min(self.cpu_capacity_orig)
    }
}

#[allow(dead_code)]
const _: () = assert!(SCHED_CAPACITY_SCALE == 1 << SCHED_CAPACITY_SHIFT);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_halves_every_32_periods() {
        assert_eq!(decay_load(1 << 20, 0), 1 << 20);
        // y^0的倒数表是0xffffffff，整周期的衰减会向下少一
        let half = decay_load(1 << 20, 32);
        assert!(half.abs_diff(1 << 19) <= 1, "half = {}", half);
        assert_eq!(decay_load(1 << 20, 64), (1 << 18) - 1);
        assert_eq!(decay_load(u64::MAX, LOAD_AVG_PERIOD * 63 + 1), 0);
    }

    #[test]
    fn decay_is_composable_within_rounding() {
        let v = 1_000_000u64;
        for (a, b) in [(1u64, 1u64), (5, 7), (31, 2), (40, 100)] {
            let twice = decay_load(decay_load(v, a), b);
            let once = decay_load(v, a + b);
            let diff = twice.abs_diff(once);
            assert!(diff <= 2, "a={} b={} twice={} once={}", a, b, twice, once);
        }
    }

    #[test]
    fn zero_elapsed_update_is_noop() {
        let mut sa = SchedulerAvg::default();
        sa.update_load_sum(10 << 20, 1, 1, 1);
        sa.update_load_avg(1024);
        let before = sa;
        assert!(!sa.update_load_sum(sa.last_update_time, 1, 1, 1));
        assert_eq!(sa, before);
    }

    #[test]
    fn split_update_matches_single_update() {
        let mut a = SchedulerAvg::default();
        let mut b = SchedulerAvg::default();
        a.update_load_sum(0, 1, 1, 1);
        b.update_load_sum(0, 1, 1, 1);

        a.update_load_sum(7 << 20, 1, 1, 1);
        a.update_load_sum(20 << 20, 1, 1, 1);
        a.update_load_avg(1024);
        b.update_load_sum(20 << 20, 1, 1, 1);
        b.update_load_avg(1024);

        assert_eq!(a.last_update_time, b.last_update_time);
        assert!(a.load_avg.abs_diff(b.load_avg) <= 2);
        assert!(a.util_avg.abs_diff(b.util_avg) <= 2);
    }

    #[test]
    fn always_running_converges_to_full_load() {
        let mut sa = SchedulerAvg::default();
        let mut now = 0;
        // 大约 2s，远超过几个半衰期
        for _ in 0..2000 {
            now += 1 << 20;
            sa.update_load_sum(now, 1, 1, 1);
        }
        sa.update_load_avg(1024);
        assert!(sa.load_avg >= 1000 && sa.load_avg <= 1024, "{}", sa.load_avg);
        assert!(sa.util_avg >= 1000 && sa.util_avg <= 1024, "{}", sa.util_avg);

        // 之后一直睡眠，负载衰减到接近0
        for _ in 0..2000 {
            now += 1 << 20;
            sa.update_load_sum(now, 0, 0, 0);
        }
        sa.update_load_avg(1024);
        assert!(sa.load_avg < 5, "{}", sa.load_avg);
    }

    #[test]
    fn positive_helpers_clamp_at_zero() {
        let mut x = 10u64;
        add_positive(&mut x, -20);
        assert_eq!(x, 0);
        add_positive(&mut x, 5);
        assert_eq!(x, 5);
        sub_positive(&mut x, 6);
        assert_eq!(x, 0);
    }
}
