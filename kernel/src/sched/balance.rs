//! SMP负载均衡
//!
//! 周期性均衡在时钟滴答中按调度域自底向上进行，CPU将要进入空闲时做一次newidle均衡。
//! 统计阶段每次只锁一个CPU读取快照，真正迁移任务时才同时锁住两个运行队列并重新检查。

use core::sync::atomic::Ordering;

use alloc::{sync::Arc, vec::Vec};

use crate::{libs::cpumask::CpuMask, smp::cpu::ProcessorId};

use super::{
    core::{Scheduler, StopWork},
    task::Pid,
    topology::{SchedDomain, SchedDomainTopology, SchedGroup, SdFlags},
    CpuRunQueue, DequeueFlag, EnqueueFlag, SchedFeature, WakeupFlags, NICE_0_LOAD, NSEC_PER_MSEC,
    NSEC_PER_SEC, SCHED_CAPACITY_SCALE,
};

/// 发起均衡的CPU的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuIdleType {
    Idle,
    NotIdle,
    /// 即将进入空闲
    NewlyIdle,
}

/// 一个CPU的负载快照
#[derive(Debug, Clone, Copy)]
pub(crate) struct CpuStat {
    pub cpu: ProcessorId,
    pub online: bool,
    pub nr_running: u32,
    pub cfs_h_nr_running: u32,
    /// 根运行队列上可运行实体的负载
    pub load: u64,
    pub load_avg: u64,
    pub util: u64,
    pub capacity: u64,
    pub capacity_orig: u64,
    pub idle: bool,
    pub idle_stamp: u64,
}

bitflags! {
    struct LbFlags: u8 {
        /// 所有任务都因为亲和性不能迁到目标CPU
        const ALL_PINNED = 0x01;
        /// 有任务不能迁到目标CPU，但是可以迁到本地组的其他CPU
        const DST_PINNED = 0x02;
        /// 至少有一个任务因为亲和性没能迁移
        const SOME_PINNED = 0x04;
    }
}

/// 调度组的类型，越往后越需要被均衡
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
enum GroupType {
    #[default]
    Other,
    /// 组内有CPU因为亲和性没能被平衡
    Imbalanced,
    /// 组内的任务超过了组的算力
    Overloaded,
}

#[derive(Debug, Clone, Default)]
struct SgLbStats {
    avg_load: u64,
    group_load: u64,
    sum_weighted_load: u64,
    load_per_task: u64,
    group_capacity: u64,
    group_util: u64,
    sum_nr_running: u32,
    idle_cpus: u32,
    group_weight: u32,
    group_type: GroupType,
    group_no_capacity: bool,
}

#[derive(Debug, Default)]
struct SdLbStats {
    busiest: Option<Arc<SchedGroup>>,
    local: Option<Arc<SchedGroup>>,
    total_running: u32,
    total_load: u64,
    total_capacity: u64,
    avg_load: u64,
    busiest_stat: SgLbStats,
    local_stat: SgLbStats,
}

/// 一次均衡的上下文
struct LbEnv<'a> {
    sd: &'a SchedDomain,
    child: Option<&'a SchedDomain>,
    src_cpu: ProcessorId,
    dst_cpu: ProcessorId,
    /// 目标CPU所在的调度组
    dst_grpmask: CpuMask,
    /// 本轮还可以参与的CPU
    cpus: CpuMask,
    idle: CpuIdleType,
    imbalance: i64,
    loop_max: u32,
    flags: LbFlags,
    new_dst_cpu: ProcessorId,
    numa_enabled: bool,
}

impl<'a> LbEnv<'a> {
    fn group_has_capacity(&self, sgs: &SgLbStats) -> bool {
        if sgs.sum_nr_running < sgs.group_weight {
            return true;
        }
        sgs.group_capacity * 100 > sgs.group_util * self.sd.imbalance_pct as u64
    }

    fn group_is_overloaded(&self, sgs: &SgLbStats) -> bool {
        if sgs.sum_nr_running <= sgs.group_weight {
            return false;
        }
        sgs.group_capacity * 100 < sgs.group_util * self.sd.imbalance_pct as u64
    }

    fn group_classify(group: &SchedGroup, sgs: &SgLbStats) -> GroupType {
        if sgs.group_no_capacity {
            GroupType::Overloaded
        } else if group.imbalance() {
            GroupType::Imbalanced
        } else {
            GroupType::Other
        }
    }

    /// CPU的算力是否被其他调度类明显挤占
    fn check_cpu_capacity(&self, s: &CpuStat) -> bool {
        s.capacity * (self.sd.imbalance_pct as u64) < s.capacity_orig * 100
    }
}

impl CpuRunQueue {
    /// ## 把任务从本队列取下，准备迁往别的CPU
    pub(crate) fn detach_task(&mut self, pid: Pid) {
        let fair = self.task(pid).map(|t| t.policy.is_fair()).unwrap_or(false);
        self.deactivate_task(pid, DequeueFlag::DEQUEUE_NOCLOCK);
        if let Some(t) = self.task_mut(pid) {
            t.on_rq = super::task::OnRq::Migrating;
        }
        if fair {
            self.migrate_task_rq_fair(pid);
        }
    }

    /// ## 迁入的任务进入本队列
    pub(crate) fn attach_task(&mut self, pid: Pid) {
        self.activate_task(pid, EnqueueFlag::ENQUEUE_NOCLOCK);
        self.check_preempt_curr(pid, WakeupFlags::empty());
    }

    /// 任务的缓存是否可能还是热的
    fn task_hot(&self, pid: Pid, dst_nr_running: u32) -> bool {
        let t = match self.task(pid) {
            Some(t) => t,
            None => return false,
        };
        if !t.policy.is_fair() || t.is_idle_policy() {
            return false;
        }
        if self.sched_feat(SchedFeature::CACHE_HOT_BUDDY) && dst_nr_running > 0 {
            let e = super::entity::EntityRef::Task(pid);
            let cfs_rq = &self.cfs_rqs[t.se.cfs_rq];
            if cfs_rq.next == Some(e) || cfs_rq.last == Some(e) {
                return true;
            }
        }
        match self.cfg.migration_cost_ns {
            -1 => true,
            0 => false,
            cost => (self.clock_task.saturating_sub(t.se.exec_start) as i64) < cost,
        }
    }
}

impl Scheduler {
    /// 读取一个CPU的负载快照
    pub(crate) fn cpu_stat(&self, cpu: ProcessorId) -> Option<CpuStat> {
        let rq = self.cpu_rq(cpu)?.lock();
        let root = rq.root_cfs();
        Some(CpuStat {
            cpu,
            online: rq.online,
            nr_running: rq.nr_running,
            cfs_h_nr_running: root.h_nr_running,
            load: rq.cpu_runnable_load(),
            load_avg: root.avg.load_avg,
            util: rq.cpu_util(),
            capacity: rq.cpu_capacity,
            capacity_orig: rq.cpu_capacity_orig,
            idle: rq.online && rq.curr.is_none() && rq.nr_running == 0,
            idle_stamp: rq.idle_stamp,
        })
    }

    /// 刷新本地调度组的算力
    fn update_group_capacity(&self, group: &SchedGroup) {
        let mut capacity = 0;
        let mut min_capacity = u64::MAX;
        for cpu in group.span.iter_cpu() {
            if let Some(s) = self.cpu_stat(cpu) {
                capacity += s.capacity;
                min_capacity = min_capacity.min(s.capacity);
            }
        }
        if capacity > 0 {
            group.set_capacity(capacity, min_capacity);
        }
    }

    fn update_sg_lb_stats(&self, env: &LbEnv<'_>, group: &SchedGroup, sgs: &mut SgLbStats, overload: &mut bool) {
        for i in (&group.span & &env.cpus).iter_cpu() {
            let s = match self.cpu_stat(i) {
                Some(s) => s,
                None => continue,
            };
            sgs.group_load += s.load;
            sgs.group_util += s.util;
            sgs.sum_nr_running += s.cfs_h_nr_running;
            if s.nr_running > 1 {
                *overload = true;
            }
            sgs.sum_weighted_load += s.load;
            if s.nr_running == 0 && s.idle {
                sgs.idle_cpus += 1;
            }
        }
        sgs.group_capacity = group.capacity().max(1);
        sgs.avg_load = sgs.group_load * SCHED_CAPACITY_SCALE / sgs.group_capacity;
        if sgs.sum_nr_running > 0 {
            sgs.load_per_task = sgs.sum_weighted_load / sgs.sum_nr_running as u64;
        }
        sgs.group_weight = group.weight() as u32;
        sgs.group_no_capacity = env.group_is_overloaded(sgs);
        sgs.group_type = LbEnv::group_classify(group, sgs);
    }

    /// 先按组类型，再按平均负载挑选最忙的组
    fn update_sd_pick_busiest(sds: &SdLbStats, sgs: &SgLbStats) -> bool {
        if sds.busiest.is_none() {
            return sgs.sum_nr_running > 0 || sgs.group_type > GroupType::Other;
        }
        let busiest = &sds.busiest_stat;
        if sgs.group_type != busiest.group_type {
            return sgs.group_type > busiest.group_type;
        }
        sgs.avg_load > busiest.avg_load
    }

    fn update_sd_lb_stats(&self, env: &LbEnv<'_>, sds: &mut SdLbStats) {
        let prefer_sibling = env.child.map(|c| c.has(SdFlags::SD_PREFER_SIBLING)).unwrap_or(false);
        let mut overload = false;

        // 本地组先统计，兄弟组的比较要用到它
        let mut groups: Vec<&Arc<SchedGroup>> = env.sd.groups.iter().collect();
        groups.sort_by_key(|g| !g.span.contains(env.dst_cpu));

        for group in groups {
            let local = group.span.contains(env.dst_cpu);
            let mut sgs = SgLbStats::default();
            if local {
                if env.idle != CpuIdleType::NewlyIdle {
                    self.update_group_capacity(group);
                }
                self.update_sg_lb_stats(env, group, &mut sgs, &mut overload);
                sds.local = Some(group.clone());
            } else {
                self.update_sg_lb_stats(env, group, &mut sgs, &mut overload);
                // 让兄弟组尽量分担任务
                if prefer_sibling
                    && sds.local.is_some()
                    && env.group_has_capacity(&sds.local_stat)
                    && sgs.sum_nr_running > sds.local_stat.sum_nr_running + 1
                {
                    sgs.group_no_capacity = true;
                    sgs.group_type = LbEnv::group_classify(group, &sgs);
                }
                if Self::update_sd_pick_busiest(sds, &sgs) {
                    sds.busiest = Some(group.clone());
                    sds.busiest_stat = sgs.clone();
                }
            }

            sds.total_running += sgs.sum_nr_running;
            sds.total_load += sgs.group_load;
            sds.total_capacity += sgs.group_capacity;
            if local {
                sds.local_stat = sgs;
            }
        }
    }

    /// ## 计算需要搬运的负载量
    ///
    /// 把最忙的组拉低到域平均负载，同时不把本地组推高到平均值之上。
    fn calculate_imbalance(&self, env: &mut LbEnv<'_>, sds: &mut SdLbStats) {
        if sds.busiest_stat.group_type == GroupType::Imbalanced {
            // 亲和性导致的不平衡，每个任务的平均负载不应该比域平均值大
            sds.busiest_stat.load_per_task = sds.busiest_stat.load_per_task.min(sds.avg_load);
        }

        let local = &sds.local_stat;
        let busiest = &sds.busiest_stat;
        if busiest.avg_load <= sds.avg_load || local.avg_load >= sds.avg_load {
            env.imbalance = 0;
            return Self::fix_small_imbalance(env, sds);
        }

        let mut load_above_capacity = u64::MAX;
        if busiest.group_type == GroupType::Overloaded && local.group_type == GroupType::Overloaded {
            load_above_capacity = busiest.sum_nr_running as u64 * SCHED_CAPACITY_SCALE;
            if load_above_capacity > busiest.group_capacity {
                load_above_capacity -= busiest.group_capacity;
                load_above_capacity *= NICE_0_LOAD;
                load_above_capacity /= busiest.group_capacity;
            } else {
                load_above_capacity = u64::MAX;
            }
        }

        let max_pull = (busiest.avg_load - sds.avg_load).min(load_above_capacity);
        let imbalance = max_pull
            .saturating_mul(busiest.group_capacity)
            .min((sds.avg_load - local.avg_load) * local.group_capacity)
            / SCHED_CAPACITY_SCALE;
        env.imbalance = imbalance as i64;

        if imbalance < busiest.load_per_task {
            Self::fix_small_imbalance(env, sds);
        }
    }

    /// 负载差不足一个任务时，判断搬一个任务能否提高总吞吐
    fn fix_small_imbalance(env: &mut LbEnv<'_>, sds: &mut SdLbStats) {
        let mut imbn = 2;
        if sds.local_stat.sum_nr_running == 0 {
            sds.local_stat.load_per_task = 0;
        } else if sds.busiest_stat.load_per_task > sds.local_stat.load_per_task {
            imbn = 1;
        }
        let local = &sds.local_stat;
        let busiest = &sds.busiest_stat;
        let local_cap = local.group_capacity.max(1);

        let scaled_busy_load_per_task = busiest.load_per_task * SCHED_CAPACITY_SCALE / busiest.group_capacity;
        if busiest.avg_load + scaled_busy_load_per_task >= local.avg_load + scaled_busy_load_per_task * imbn {
            env.imbalance = busiest.load_per_task as i64;
            return;
        }

        let mut capa_now = busiest.group_capacity * busiest.load_per_task.min(busiest.avg_load);
        capa_now += local.group_capacity * local.load_per_task.min(local.avg_load);
        capa_now /= SCHED_CAPACITY_SCALE;

        let mut capa_move = 0;
        if busiest.avg_load > scaled_busy_load_per_task {
            capa_move += busiest.group_capacity
                * busiest.load_per_task.min(busiest.avg_load - scaled_busy_load_per_task);
        }
        let tmp = if busiest.avg_load * busiest.group_capacity < busiest.load_per_task * SCHED_CAPACITY_SCALE {
            busiest.avg_load * busiest.group_capacity / local_cap
        } else {
            busiest.load_per_task * SCHED_CAPACITY_SCALE / local_cap
        };
        capa_move += local.group_capacity * local.load_per_task.min(local.avg_load + tmp);
        capa_move /= SCHED_CAPACITY_SCALE;

        if capa_move > capa_now {
            env.imbalance = busiest.load_per_task as i64;
        }
    }

    /// ## 找出域中最忙的调度组，并计算不平衡量
    fn find_busiest_group(&self, env: &mut LbEnv<'_>) -> Option<Arc<SchedGroup>> {
        let mut sds = SdLbStats::default();
        self.update_sd_lb_stats(env, &mut sds);

        let busiest_group = match &sds.busiest {
            Some(g) if sds.busiest_stat.sum_nr_running > 0 => g.clone(),
            _ => {
                env.imbalance = 0;
                return None;
            }
        };
        sds.avg_load = SCHED_CAPACITY_SCALE * sds.total_load / sds.total_capacity.max(1);

        let local = &sds.local_stat;
        let busiest = &sds.busiest_stat;
        let force = busiest.group_type == GroupType::Imbalanced
            || (env.idle != CpuIdleType::NotIdle && env.group_has_capacity(local) && busiest.group_no_capacity);

        if !force {
            let balanced = if local.avg_load >= busiest.avg_load || local.avg_load >= sds.avg_load {
                true
            } else if env.idle == CpuIdleType::Idle {
                // 本地组空闲的CPU不比最忙的组多，说明它们都不怎么忙
                busiest.group_type != GroupType::Overloaded && local.idle_cpus <= busiest.idle_cpus + 1
            } else {
                100 * busiest.avg_load <= env.sd.imbalance_pct as u64 * local.avg_load
            };
            if balanced {
                env.imbalance = 0;
                return None;
            }
        }

        self.calculate_imbalance(env, &mut sds);
        if env.imbalance > 0 {
            Some(busiest_group)
        } else {
            None
        }
    }

    /// 组内按算力折算后负载最高的CPU
    fn find_busiest_queue(&self, env: &LbEnv<'_>, group: &SchedGroup) -> Option<CpuStat> {
        let mut busiest: Option<CpuStat> = None;
        let mut busiest_load = 0;
        let mut busiest_capacity = 1;
        for i in (&group.span & &env.cpus).iter_cpu() {
            let s = match self.cpu_stat(i) {
                Some(s) if s.online => s,
                _ => continue,
            };
            let wl = s.load;
            // 只有一个任务并且比要搬的量还大，除非算力被挤占，否则不搬
            if s.nr_running == 1 && wl as i64 > env.imbalance && !env.check_cpu_capacity(&s) {
                continue;
            }
            if wl * busiest_capacity > busiest_load * s.capacity {
                busiest_load = wl;
                busiest_capacity = s.capacity;
                busiest = Some(s);
            }
        }
        busiest
    }

    /// 只有本地组中第一个空闲的CPU（没有空闲的则是组的第一个CPU）负责这一层的均衡
    fn should_we_balance(&self, env: &LbEnv<'_>) -> bool {
        if env.idle == CpuIdleType::NewlyIdle {
            return true;
        }
        let local = env.sd.local();
        let balance_cpu = (&local.span & &env.cpus)
            .iter_cpu()
            .find(|c| self.cpu_stat(*c).map(|s| s.idle).unwrap_or(false))
            .unwrap_or_else(|| local.first_cpu());
        balance_cpu == env.dst_cpu
    }

    /// ## 判断任务能否从src迁到dst
    fn can_migrate_task(
        &self,
        env: &mut LbEnv<'_>,
        topo: &SchedDomainTopology,
        src: &CpuRunQueue,
        dst: &CpuRunQueue,
        pid: Pid,
    ) -> bool {
        let t = match src.task(pid) {
            Some(t) => t,
            None => return false,
        };
        let slot = t.group_slot();
        if src.throttled_hierarchy(slot) || dst.throttled_hierarchy(slot) {
            return false;
        }

        if !t.can_run_on(env.dst_cpu) {
            env.flags |= LbFlags::SOME_PINNED;
            if env.idle == CpuIdleType::NewlyIdle || env.flags.contains(LbFlags::DST_PINNED) {
                return false;
            }
            // 记下本地组中另一个可以接收它的CPU
            if let Some(c) = (&env.dst_grpmask & &env.cpus).iter_cpu().find(|c| t.can_run_on(*c)) {
                env.flags |= LbFlags::DST_PINNED;
                env.new_dst_cpu = c;
            }
            return false;
        }
        env.flags.remove(LbFlags::ALL_PINNED);

        if src.curr == Some(pid) {
            return false;
        }

        let mut hot = self.migrate_degrades_locality(topo, src, t, env.dst_cpu, env.sd, env.idle, env.numa_enabled);
        if hot == -1 {
            hot = src.task_hot(pid, dst.nr_running) as i32;
        }
        hot <= 0 || env.sd.nr_balance_failed.load(Ordering::Relaxed) > env.sd.cache_nice_tries
    }

    /// ## 从src的公平调度任务中挑出要迁走的任务，从最久没有运行的开始
    fn detach_tasks(
        &self,
        env: &mut LbEnv<'_>,
        topo: &SchedDomainTopology,
        src: &mut CpuRunQueue,
        dst: &CpuRunQueue,
    ) -> Vec<Pid> {
        let mut detached = Vec::new();
        if env.imbalance <= 0 {
            return detached;
        }
        let candidates: Vec<Pid> = src.cfs_tasks.iter().rev().copied().collect();
        let mut nr_loop = 0;
        for pid in candidates {
            if env.idle != CpuIdleType::NotIdle && src.nr_running <= 1 {
                break;
            }
            nr_loop += 1;
            if nr_loop > env.loop_max {
                break;
            }
            if !self.can_migrate_task(env, topo, src, dst, pid) {
                continue;
            }
            let load = src.task_h_load(pid);
            if src.sched_feat(SchedFeature::LB_MIN)
                && load < 16
                && env.sd.nr_balance_failed.load(Ordering::Relaxed) == 0
            {
                continue;
            }
            if (load / 2) as i64 > env.imbalance {
                continue;
            }

            src.detach_task(pid);
            detached.push(pid);
            env.imbalance -= load as i64;

            // newidle均衡只拉一个任务，尽快让CPU运行起来
            if env.idle == CpuIdleType::NewlyIdle || env.imbalance <= 0 {
                break;
            }
        }
        detached
    }

    /// 锁住两个运行队列，挑选并迁移任务，返回迁移的数量
    fn move_tasks(&self, env: &mut LbEnv<'_>, topo: &SchedDomainTopology) -> u32 {
        let (mut dst, mut src) = match self.lock_pair(env.dst_cpu, env.src_cpu) {
            Some(pair) => pair,
            None => return 0,
        };
        if !dst.online || !src.online || src.nr_running <= 1 {
            return 0;
        }
        src.update_rq_clock();
        dst.update_rq_clock();
        env.loop_max = self.config().nr_migrate.min(src.nr_running);

        let pids = self.detach_tasks(env, topo, &mut src, &dst);
        let mut moved = 0;
        for pid in pids {
            if self.transfer_task(&mut src, &mut dst, pid) {
                dst.attach_task(pid);
                moved += 1;
            }
        }
        moved
    }

    /// ## 在一个调度域中做一次均衡，返回迁移的任务数量
    fn load_balance(
        &self,
        this_cpu: ProcessorId,
        topo: &SchedDomainTopology,
        sd_idx: usize,
        idle: CpuIdleType,
        continue_balancing: &mut bool,
    ) -> u32 {
        let domains = topo.domains(this_cpu);
        let sd = match domains.get(sd_idx) {
            Some(sd) => sd,
            None => return 0,
        };
        let parent = domains.get(sd_idx + 1);
        let cfg = self.config();

        let mut env = LbEnv {
            sd,
            child: sd_idx.checked_sub(1).and_then(|i| domains.get(i)),
            src_cpu: ProcessorId::INVALID,
            dst_cpu: this_cpu,
            dst_grpmask: sd.local().span.clone(),
            cpus: &sd.span & &topo.online,
            idle,
            imbalance: 0,
            loop_max: 0,
            flags: LbFlags::empty(),
            new_dst_cpu: ProcessorId::INVALID,
            numa_enabled: self.numa_enabled(),
        };
        sd.stats.lb_count.fetch_add(1, Ordering::Relaxed);

        let mut ld_moved = 0;
        let mut active_balance = false;
        let mut busiest_cpu = None;

        let outcome = loop {
            if !self.should_we_balance(&env) {
                *continue_balancing = false;
                break BalanceOutcome::Balanced;
            }
            let group = match self.find_busiest_group(&mut env) {
                Some(g) => g,
                None => {
                    sd.stats.lb_nobusyg.fetch_add(1, Ordering::Relaxed);
                    break BalanceOutcome::Balanced;
                }
            };
            let busiest = match self.find_busiest_queue(&env, &group) {
                Some(b) => b,
                None => {
                    sd.stats.lb_nobusyq.fetch_add(1, Ordering::Relaxed);
                    break BalanceOutcome::Balanced;
                }
            };
            env.src_cpu = busiest.cpu;
            busiest_cpu = Some(busiest);

            if busiest.nr_running <= 1 {
                break BalanceOutcome::Done;
            }

            env.flags |= LbFlags::ALL_PINNED;
            loop {
                ld_moved += self.move_tasks(&mut env, topo);

                // 目标CPU不能接收，换本地组中另一个CPU再试
                if env.flags.contains(LbFlags::DST_PINNED) && env.imbalance > 0 {
                    env.cpus.set(env.dst_cpu, false);
                    env.dst_cpu = env.new_dst_cpu;
                    env.flags.remove(LbFlags::DST_PINNED);
                    continue;
                }
                break;
            }

            if let Some(p) = parent {
                if env.flags.contains(LbFlags::SOME_PINNED) && env.imbalance > 0 {
                    p.local().set_imbalance(true);
                }
            }

            if env.flags.contains(LbFlags::ALL_PINNED) {
                env.cpus.set(busiest.cpu, false);
                if !env.cpus.is_subset_of(&env.dst_grpmask) {
                    env.dst_cpu = this_cpu;
                    continue;
                }
                break BalanceOutcome::AllPinned;
            }
            break BalanceOutcome::Done;
        };

        let failed = sd.nr_balance_failed.load(Ordering::Relaxed);
        match outcome {
            BalanceOutcome::Done => {
                if ld_moved == 0 {
                    sd.stats.lb_failed.fetch_add(1, Ordering::Relaxed);
                    if idle != CpuIdleType::NewlyIdle {
                        sd.nr_balance_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Some(b) = busiest_cpu {
                        if self.need_active_balance(&env, &b) {
                            match self.start_active_balance(b.cpu, this_cpu) {
                                Some(true) => active_balance = true,
                                Some(false) => {}
                                None => {
                                    // 正在运行的任务不能迁到这里
                                    env.flags |= LbFlags::ALL_PINNED;
                                    self.adjust_pinned_interval(sd, &env, idle, &cfg);
                                    return 0;
                                }
                            }
                            sd.nr_balance_failed.store(sd.cache_nice_tries + 1, Ordering::Relaxed);
                        }
                    }
                } else {
                    sd.stats.lb_gained.fetch_add(ld_moved as u64, Ordering::Relaxed);
                    sd.nr_balance_failed.store(0, Ordering::Relaxed);
                }

                if !active_balance {
                    sd.balance_interval.store(sd.min_interval, Ordering::Relaxed);
                } else {
                    let cur = sd.balance_interval.load(Ordering::Relaxed);
                    if cur < sd.max_interval {
                        sd.balance_interval.store(cur * 2, Ordering::Relaxed);
                    }
                }
                if ld_moved > 0 {
                    log::debug!(
                        "sched: cpu {} pulled {} tasks from cpu {} at {} (failed {})",
                        this_cpu,
                        ld_moved,
                        env.src_cpu,
                        sd.level.name(),
                        failed
                    );
                }
                ld_moved
            }
            BalanceOutcome::Balanced | BalanceOutcome::AllPinned => {
                if outcome == BalanceOutcome::Balanced {
                    if let Some(p) = parent {
                        if p.local().imbalance() {
                            p.local().set_imbalance(false);
                        }
                    }
                }
                sd.stats.lb_balanced.fetch_add(1, Ordering::Relaxed);
                sd.nr_balance_failed.store(0, Ordering::Relaxed);
                self.adjust_pinned_interval(sd, &env, idle, &cfg);
                0
            }
        }
    }

    fn adjust_pinned_interval(&self, sd: &SchedDomain, env: &LbEnv<'_>, idle: CpuIdleType, cfg: &super::config::SchedConfig) {
        if idle == CpuIdleType::NewlyIdle {
            return;
        }
        let cur = sd.balance_interval.load(Ordering::Relaxed);
        if (env.flags.contains(LbFlags::ALL_PINNED) && cur < cfg.max_pinned_interval_ms) || cur < sd.max_interval {
            sd.balance_interval.store(cur * 2, Ordering::Relaxed);
        }
    }

    fn need_active_balance(&self, env: &LbEnv<'_>, busiest: &CpuStat) -> bool {
        // 最忙的CPU上只有一个公平任务，但它的算力被挤占得厉害
        if env.idle != CpuIdleType::NotIdle && busiest.cfs_h_nr_running == 1 {
            if let Some(dst) = self.cpu_stat(env.dst_cpu) {
                if env.check_cpu_capacity(busiest)
                    && busiest.capacity * (env.sd.imbalance_pct as u64) < dst.capacity * 100
                {
                    return true;
                }
            }
        }
        env.sd.nr_balance_failed.load(Ordering::Relaxed) > env.sd.cache_nice_tries + 2
    }

    /// ## 请求busiest把正在运行的任务推给target
    ///
    /// 正在运行的任务不允许在target上运行时返回None；已经有请求在路上时返回Some(false)。
    fn start_active_balance(&self, busiest: ProcessorId, target: ProcessorId) -> Option<bool> {
        {
            let mut rq = self.cpu_rq(busiest)?.lock();
            if let Some(curr) = rq.curr {
                if !rq.task(curr).map(|t| t.can_run_on(target)).unwrap_or(false) {
                    return None;
                }
            }
            if rq.active_balance {
                return Some(false);
            }
            rq.active_balance = true;
            rq.push_cpu = target;
        }
        if self.queue_stop_work(busiest, StopWork::ActiveBalance { target }) {
            return Some(true);
        }
        if let Some(rq) = self.cpu_rq(busiest) {
            rq.lock().active_balance = false;
        }
        Some(false)
    }

    /// ## 在busiest上执行主动均衡：换下正在运行的任务，把一个任务推给target
    pub(crate) fn active_load_balance_cpu_stop(&self, busiest_cpu: ProcessorId, target_cpu: ProcessorId) {
        let topo = self.topology();
        let sd = topo
            .domains(target_cpu)
            .iter()
            .find(|sd| sd.has(SdFlags::SD_LOAD_BALANCE) && sd.span.contains(busiest_cpu));

        let (mut src, mut dst) = match self.lock_pair(busiest_cpu, target_cpu) {
            Some(pair) => pair,
            None => return,
        };
        let runnable = src.online && src.active_balance && src.nr_running > 1 && dst.online;
        src.active_balance = false;
        let sd = match sd {
            Some(sd) if runnable => sd,
            _ => return,
        };

        src.update_rq_clock();
        dst.update_rq_clock();
        if src.curr.is_some() {
            src.put_prev_curr();
            src.resched_curr();
        }

        let mut env = LbEnv {
            sd,
            child: None,
            src_cpu: busiest_cpu,
            dst_cpu: target_cpu,
            dst_grpmask: CpuMask::from_cpus([target_cpu]),
            cpus: topo.online.clone(),
            idle: CpuIdleType::Idle,
            imbalance: 0,
            loop_max: 0,
            flags: LbFlags::empty(),
            new_dst_cpu: ProcessorId::INVALID,
            numa_enabled: self.numa_enabled(),
        };
        let candidates: Vec<Pid> = src.cfs_tasks.iter().rev().copied().collect();
        for pid in candidates {
            if self.can_migrate_task(&mut env, &topo, &src, &dst, pid) {
                src.detach_task(pid);
                if self.transfer_task(&mut src, &mut dst, pid) {
                    dst.attach_task(pid);
                    sd.stats.alb_pushed.fetch_add(1, Ordering::Relaxed);
                    log::debug!("sched: cpu {} pushed task {} to cpu {}", busiest_cpu, pid, target_cpu);
                }
                break;
            }
        }
    }

    /// ## 周期性均衡
    ///
    /// 自底向上检查每一层调度域的均衡间隔，到期的做一次均衡，并衰减newidle均衡的开销估计。
    pub(crate) fn rebalance_domains(&self, cpu: ProcessorId, cpu_idle: bool) {
        let topo = self.topology();
        let cfg = self.config();
        let now = self.clock.sched_clock();
        let mut idle = if cpu_idle { CpuIdleType::Idle } else { CpuIdleType::NotIdle };
        let mut continue_balancing = true;
        let mut next_balance = now + 60 * NSEC_PER_SEC;
        let mut update_next_balance = false;
        let mut need_decay = false;
        let mut max_cost = 0;

        for (i, sd) in topo.domains(cpu).iter().enumerate() {
            if now > sd.next_decay_max_lb_cost.load(Ordering::Relaxed) {
                let cost = sd.max_newidle_lb_cost.load(Ordering::Relaxed);
                sd.max_newidle_lb_cost
                    .store(cost * cfg.newidle_cost_decay_num / 256, Ordering::Relaxed);
                sd.next_decay_max_lb_cost
                    .store(now + cfg.newidle_cost_decay_period_ns, Ordering::Relaxed);
                need_decay = true;
            }
            max_cost += sd.max_newidle_lb_cost.load(Ordering::Relaxed);

            if !sd.has(SdFlags::SD_LOAD_BALANCE) {
                continue;
            }
            if !continue_balancing {
                if need_decay {
                    continue;
                }
                break;
            }

            let mut interval = sd
                .get_interval(idle != CpuIdleType::Idle)
                .min(cfg.max_load_balance_interval_ns);
            let guard = if sd.has(SdFlags::SD_SERIALIZE) {
                match self.balancing.try_lock() {
                    Ok(g) => Some(g),
                    Err(_) => None,
                }
            } else {
                None
            };
            let may_balance = guard.is_some() || !sd.has(SdFlags::SD_SERIALIZE);

            let last = sd.last_balance.load(Ordering::Relaxed);
            if may_balance && now >= last + interval {
                if self.load_balance(cpu, &topo, i, idle, &mut continue_balancing) > 0 {
                    // 拉到了任务，CPU不再空闲
                    idle = if self.available_idle_cpu(cpu) {
                        CpuIdleType::Idle
                    } else {
                        CpuIdleType::NotIdle
                    };
                }
                sd.last_balance.store(now, Ordering::Relaxed);
                interval = sd
                    .get_interval(idle != CpuIdleType::Idle)
                    .min(cfg.max_load_balance_interval_ns);
            }
            drop(guard);

            let last = sd.last_balance.load(Ordering::Relaxed);
            if next_balance > last + interval {
                next_balance = last + interval;
                update_next_balance = true;
            }
        }

        if let Some(rq) = self.cpu_rq(cpu) {
            let mut rq = rq.lock();
            if need_decay {
                rq.max_idle_balance_cost = (cfg.migration_cost_ns.max(0) as u64).max(max_cost);
            }
            if update_next_balance {
                rq.next_balance = next_balance;
            }
        }
    }

    /// ## CPU即将空闲时尝试从别的CPU拉任务
    ///
    /// 平均空闲时间不够抵消均衡开销时直接放弃；在每一层累计花费的时间，超出预算就停下。
    /// 返回是否拉到了任务。
    pub(crate) fn idle_balance(&self, this_cpu: ProcessorId) -> bool {
        let topo = self.topology();
        let cfg = self.config();
        let rq_lock = match self.cpu_rq(this_cpu) {
            Some(rq) => rq,
            None => return false,
        };

        let (avg_idle, online) = {
            let mut rq = rq_lock.lock();
            rq.update_rq_clock();
            rq.idle_stamp = rq.clock;
            (rq.avg_idle, rq.online)
        };
        if !online {
            return false;
        }

        let mut next_balance = self.clock.sched_clock() + NSEC_PER_SEC;
        let overload = topo
            .online
            .iter_cpu()
            .any(|c| self.cpu_stat(c).map(|s| s.nr_running > 1).unwrap_or(false));

        let mut pulled = false;
        let mut curr_cost = 0;
        if (avg_idle as i64) < cfg.migration_cost_ns || !overload {
            if let Some(sd) = topo.domains(this_cpu).first() {
                next_balance = next_balance.min(Self::sd_next_balance(sd, &cfg));
            }
        } else {
            rq_lock.lock().update_blocked_averages();

            for (i, sd) in topo.domains(this_cpu).iter().enumerate() {
                if !sd.has(SdFlags::SD_LOAD_BALANCE) {
                    continue;
                }
                if avg_idle < curr_cost + sd.max_newidle_lb_cost.load(Ordering::Relaxed) {
                    next_balance = next_balance.min(Self::sd_next_balance(sd, &cfg));
                    break;
                }
                if sd.has(SdFlags::SD_BALANCE_NEWIDLE) {
                    let t0 = self.clock.task_clock(this_cpu);
                    let mut continue_balancing = true;
                    pulled = self.load_balance(this_cpu, &topo, i, CpuIdleType::NewlyIdle, &mut continue_balancing) > 0;
                    let cost = self.clock.task_clock(this_cpu).saturating_sub(t0);
                    sd.max_newidle_lb_cost.fetch_max(cost, Ordering::Relaxed);
                    curr_cost += cost;
                }
                next_balance = next_balance.min(Self::sd_next_balance(sd, &cfg));

                // 拉到了任务，或者期间有任务被唤醒到这里
                let has_work = self.cpu_stat(this_cpu).map(|s| s.nr_running > 0).unwrap_or(false);
                if pulled || has_work {
                    break;
                }
            }
        }

        let mut rq = rq_lock.lock();
        if curr_cost > rq.max_idle_balance_cost {
            rq.max_idle_balance_cost = curr_cost;
        }
        if rq.root_cfs().h_nr_running > 0 {
            pulled = true;
        }
        if rq.next_balance > next_balance {
            rq.next_balance = next_balance;
        }
        // 更高优先级的调度类有任务可运行
        if rq.nr_running != rq.root_cfs().h_nr_running {
            pulled = true;
        }
        if pulled {
            rq.idle_stamp = 0;
        }
        pulled
    }

    fn sd_next_balance(sd: &SchedDomain, cfg: &super::config::SchedConfig) -> u64 {
        let interval = sd.get_interval(false).min(cfg.max_load_balance_interval_ns);
        sd.last_balance.load(Ordering::Relaxed) + interval.max(NSEC_PER_MSEC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BalanceOutcome {
    /// 找到了最忙的队列并尝试过迁移
    Done,
    Balanced,
    AllPinned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sched::{clock::ManualClock, config::SchedConfig, task::SchedAttrBuilder},
        smp::topology::CpuTopology,
    };

    fn cpu(i: u32) -> ProcessorId {
        ProcessorId::new(i)
    }

    fn setup(nr: usize) -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new(NSEC_PER_SEC));
        let sched = Scheduler::new(CpuTopology::flat(nr), SchedConfig::default(), clock.clone()).unwrap();
        (clock, sched)
    }

    fn fork_pinned(sched: &Scheduler, pid: usize, c: u32) -> Pid {
        let mut b = SchedAttrBuilder::default();
        b.nice(0);
        b.cpus_allowed(CpuMask::from_cpus([cpu(c)]));
        sched.sched_fork(None, Pid::new(pid), b.build().unwrap()).unwrap();
        Pid::new(pid)
    }

    fn total_running(sched: &Scheduler) -> u32 {
        (0..sched.nr_cpus() as u32)
            .map(|c| sched.cpu_info(cpu(c)).unwrap().nr_running)
            .sum()
    }

    #[test]
    fn periodic_balance_pulls_to_underloaded_cpu() {
        let (clock, sched) = setup(2);
        clock.advance(10 * NSEC_PER_MSEC);
        let pids: Vec<Pid> = (1..=4).map(|i| fork_pinned(&sched, i, 0)).collect();
        for p in pids.iter() {
            sched.set_cpus_allowed(*p, CpuMask::first_n(2)).unwrap();
        }
        sched.schedule(cpu(0)).unwrap();
        assert_eq!(total_running(&sched), 4);
        let load = |c: u32| sched.cpu_info(cpu(c)).unwrap().runnable_load_avg;
        let (before0, before1) = (load(0), load(1));
        assert_eq!(before1, 0);

        sched.rebalance_domains(cpu(1), false);
        let nr: Vec<u32> = (0..2).map(|c| sched.cpu_info(cpu(c)).unwrap().nr_running).collect();
        assert_eq!(nr, [2, 2]);
        // 不平衡严格变小，也没有CPU比原来最忙的CPU更忙
        let (after0, after1) = (load(0), load(1));
        assert!(
            after0.abs_diff(after1) < before0.abs_diff(before1),
            "before {}/{} after {}/{}",
            before0,
            before1,
            after0,
            after1
        );
        assert!(after0.max(after1) <= before0);
        for p in pids {
            assert!(sched.task_info(p).is_ok());
        }
    }

    #[test]
    fn capacity_pressure_uses_imbalance_pct() {
        let (_clock, sched) = setup(2);
        let topo = sched.topology();
        let sd = &topo.cpu_domains(cpu(0)).unwrap().domains[0];
        let env = LbEnv {
            sd,
            child: None,
            src_cpu: cpu(1),
            dst_cpu: cpu(0),
            dst_grpmask: CpuMask::from_cpus([cpu(0)]),
            cpus: CpuMask::first_n(2),
            idle: CpuIdleType::NotIdle,
            imbalance: 0,
            loop_max: 0,
            flags: LbFlags::empty(),
            new_dst_cpu: cpu(0),
            numa_enabled: false,
        };
        let mut s = sched.cpu_stat(cpu(1)).unwrap();
        assert!(!env.check_cpu_capacity(&s));

        // 其他调度类占掉的算力刚好超过imbalance_pct的余量
        let pct = sd.imbalance_pct as u64;
        s.capacity = s.capacity_orig * 100 / pct - 1;
        assert!(env.check_cpu_capacity(&s));
        s.capacity = s.capacity_orig * 100 / pct + 1;
        assert!(!env.check_cpu_capacity(&s));
    }

    #[test]
    fn pinned_tasks_stay_put() {
        let (clock, sched) = setup(2);
        clock.advance(10 * NSEC_PER_MSEC);
        for i in 1..=3 {
            fork_pinned(&sched, i, 0);
        }
        sched.schedule(cpu(0)).unwrap();
        assert!(!sched.idle_balance(cpu(1)));
        assert_eq!(sched.cpu_info(cpu(0)).unwrap().nr_running, 3);
        assert_eq!(sched.cpu_info(cpu(1)).unwrap().nr_running, 0);
    }

    #[test]
    fn newidle_skipped_when_idle_is_short() {
        let (clock, sched) = setup(2);
        clock.advance(10 * NSEC_PER_MSEC);
        let a = fork_pinned(&sched, 1, 0);
        let b = fork_pinned(&sched, 2, 0);
        for p in [a, b] {
            sched.set_cpus_allowed(p, CpuMask::first_n(2)).unwrap();
        }
        sched.schedule(cpu(0)).unwrap();
        sched.cpu_rq(cpu(1)).unwrap().lock().avg_idle = 1000;
        assert!(!sched.idle_balance(cpu(1)));
        assert_eq!(sched.cpu_info(cpu(0)).unwrap().nr_running, 2);
        assert_ne!(sched.cpu_rq(cpu(1)).unwrap().lock().idle_stamp, 0);
    }

    #[test]
    fn running_task_is_not_detached() {
        let (clock, sched) = setup(2);
        clock.advance(10 * NSEC_PER_MSEC);
        let a = fork_pinned(&sched, 1, 0);
        sched.set_cpus_allowed(a, CpuMask::first_n(2)).unwrap();
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(a));
        assert!(!sched.idle_balance(cpu(1)));
        assert_eq!(sched.task_cpu(a), Some(cpu(0)));
    }

    #[test]
    fn active_balance_moves_running_task() {
        let (clock, sched) = setup(2);
        clock.advance(10 * NSEC_PER_MSEC);
        let a = fork_pinned(&sched, 1, 0);
        sched.set_cpus_allowed(a, CpuMask::first_n(2)).unwrap();
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(a));
        let b = fork_pinned(&sched, 2, 0);

        // 前面的均衡已经失败多次，缓存热度不再阻止迁移
        for sd in sched.topology().domains(cpu(1)) {
            sd.nr_balance_failed.store(sd.cache_nice_tries + 1, Ordering::Relaxed);
        }
        sched.cpu_rq(cpu(0)).unwrap().lock().active_balance = true;
        sched.active_load_balance_cpu_stop(cpu(0), cpu(1));
        assert_eq!(sched.task_cpu(a), Some(cpu(1)));
        assert_eq!(sched.task_cpu(b), Some(cpu(0)));
        assert!(!sched.cpu_rq(cpu(0)).unwrap().lock().active_balance);
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(b));
        assert_eq!(sched.schedule(cpu(1)).unwrap(), Some(a));
    }

    #[test]
    fn task_hot_follows_migration_cost() {
        let (clock, sched) = setup(1);
        let a = fork_pinned(&sched, 1, 0);
        sched.schedule(cpu(0)).unwrap();
        clock.advance(100_000);
        let mut rq = sched.cpu_rq(cpu(0)).unwrap().lock();
        rq.update_rq_clock();
        assert!(rq.task_hot(a, 0));
        drop(rq);
        clock.advance(NSEC_PER_MSEC);
        let mut rq = sched.cpu_rq(cpu(0)).unwrap().lock();
        rq.update_rq_clock();
        assert!(!rq.task_hot(a, 0));
    }
}
