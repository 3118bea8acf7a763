//! 唤醒和fork时选择CPU
//!
//! 选核不持有任何运行队列锁：调用者先在任务所在的CPU上取一份[`TaskSnapshot`]，
//! 选核过程中每次只短暂地锁住一个CPU读取它的状态，选出的结果由调用者在加锁后重新检查。

use crate::{
    libs::cpumask::CpuMask,
    smp::cpu::ProcessorId,
};

use super::{
    core::Scheduler,
    task::Pid,
    topology::{SchedDomain, SchedDomainTopology, SchedGroup, SdFlags, SdLevel},
    CpuRunQueue, SchedPolicy, WakeupFlags, NICE_0_LOAD, SCHED_CAPACITY_SCALE,
};

/// 选核时需要的任务信息
#[derive(Debug, Clone)]
pub(crate) struct TaskSnapshot {
    pub pid: Pid,
    pub cpu: ProcessorId,
    pub policy: SchedPolicy,
    pub cpus_allowed: CpuMask,
    pub wakee_flips: u32,
    /// 任务在根运行队列层面的负载
    pub load: u64,
    pub util: u64,
}

impl TaskSnapshot {
    pub fn of(rq: &CpuRunQueue, pid: Pid) -> Option<Self> {
        let t = rq.task(pid)?;
        Some(Self {
            pid,
            cpu: t.cpu,
            policy: t.policy,
            cpus_allowed: t.cpus_allowed.clone(),
            wakee_flips: t.wakee_flips,
            load: rq.task_h_load(pid),
            util: t.se.avg.util_avg,
        })
    }

    #[inline]
    fn nr_cpus_allowed(&self) -> usize {
        self.cpus_allowed.weight()
    }
}

/// 发起唤醒的任务
#[derive(Debug, Clone, Copy)]
pub(crate) struct WakerInfo {
    pub cpu: ProcessorId,
    pub flips: u32,
    pub load: u64,
}

/// ## 判断唤醒关系是否是一对多的
///
/// 唤醒者频繁地唤醒不同的任务，并且被唤醒者也是如此时，把它们都拉到唤醒者所在的
/// 缓存域会让这个缓存域过载，应该把任务分散出去。
pub fn wake_wide(waker_flips: u32, wakee_flips: u32, llc_size: usize) -> bool {
    let factor = llc_size as u32;
    let (master, slave) = if waker_flips < wakee_flips {
        (wakee_flips, waker_flips)
    } else {
        (waker_flips, wakee_flips)
    };
    if slave < factor || master < slave.saturating_mul(factor) {
        return false;
    }
    true
}

impl CpuRunQueue {
    /// ## 记录waker唤醒了wakee，返回waker的唤醒关系翻转次数
    ///
    /// 每换一个被唤醒者翻转计数加一，每隔wakee_flip_decay_ns减半。
    pub(crate) fn record_wakee(&mut self, waker: Pid, wakee: Pid) -> u32 {
        self.update_rq_clock();
        let now = self.clock;
        let decay = self.cfg.wakee_flip_decay_ns;
        let t = match self.task_mut(waker) {
            Some(t) => t,
            None => return 0,
        };
        if now > t.wakee_flip_decay_ts + decay {
            t.wakee_flips >>= 1;
            t.wakee_flip_decay_ts = now;
        }
        if t.last_wakee != Some(wakee) {
            t.last_wakee = Some(wakee);
            t.wakee_flips += 1;
        }
        t.wakee_flips
    }
}

impl Scheduler {
    /// CPU当前是否空闲（在线、没有正在运行的任务、队列为空）
    pub(crate) fn available_idle_cpu(&self, cpu: ProcessorId) -> bool {
        self.cpu_stat(cpu).map(|s| s.idle).unwrap_or(false)
    }

    /// ## 为任务选择一个CPU
    ///
    /// 只能在一个CPU上运行的任务直接用那个CPU；选出的CPU不可用时退回到同一节点上
    /// 任意一个允许的在线CPU。
    pub(crate) fn select_task_rq(
        &self,
        p: &TaskSnapshot,
        prev_cpu: ProcessorId,
        sd_flag: SdFlags,
        wake_flags: WakeupFlags,
        waker: Option<&WakerInfo>,
    ) -> ProcessorId {
        let online = self.online_mask();
        let cpu = if p.nr_cpus_allowed() > 1 {
            if p.policy.is_fair() {
                self.select_task_rq_fair(p, prev_cpu, sd_flag, wake_flags, waker)
            } else {
                prev_cpu
            }
        } else {
            p.cpus_allowed.first().unwrap_or(prev_cpu)
        };

        if p.cpus_allowed.contains(cpu) && online.contains(cpu) {
            return cpu;
        }
        self.select_fallback_rq(prev_cpu, p, &online)
    }

    fn select_fallback_rq(&self, prev_cpu: ProcessorId, p: &TaskSnapshot, online: &CpuMask) -> ProcessorId {
        let allowed = &p.cpus_allowed & online;
        let topo = self.topology();
        let node_cpus = topo.node_cpus(topo.cpu_to_node(prev_cpu));
        if let Some(c) = (&allowed & &node_cpus).first() {
            return c;
        }
        if let Some(c) = allowed.first() {
            return c;
        }
        log::warn!("sched: no allowed online cpu for task {}", p.pid);
        online.first().unwrap_or(prev_cpu)
    }

    /// ## 为公平调度任务选择CPU
    ///
    /// 唤醒时优先考虑唤醒者所在的CPU（wake_affine），然后在缓存域内找空闲的CPU；
    /// fork以及设置了SD_BALANCE_WAKE的唤醒在调度域中自上而下找最空闲的CPU。
    fn select_task_rq_fair(
        &self,
        p: &TaskSnapshot,
        prev_cpu: ProcessorId,
        sd_flag: SdFlags,
        wake_flags: WakeupFlags,
        waker: Option<&WakerInfo>,
    ) -> ProcessorId {
        let this_cpu = waker.map(|w| w.cpu).unwrap_or(prev_cpu);
        let sync = wake_flags.contains(WakeupFlags::WF_SYNC);
        let topo = self.topology();

        let mut want_affine = false;
        if sd_flag.contains(SdFlags::SD_BALANCE_WAKE) {
            let flips = waker.map(|w| w.flips).unwrap_or(0);
            want_affine = !wake_wide(flips, p.wakee_flips, topo.llc_size(this_cpu))
                && p.cpus_allowed.contains(this_cpu);
        }

        let domains = topo.domains(this_cpu);
        let mut affine_sd: Option<&SchedDomain> = None;
        let mut sd: Option<usize> = None;
        for (i, tmp) in domains.iter().enumerate() {
            if !tmp.has(SdFlags::SD_LOAD_BALANCE) {
                break;
            }
            if want_affine && tmp.has(SdFlags::SD_WAKE_AFFINE) && tmp.span.contains(prev_cpu) {
                affine_sd = Some(tmp);
                break;
            }
            if tmp.flags.intersects(sd_flag) {
                sd = Some(i);
            } else if !want_affine {
                break;
            }
        }

        let mut new_cpu = prev_cpu;
        if let Some(asd) = affine_sd {
            sd = None;
            if this_cpu != prev_cpu {
                new_cpu = self.wake_affine(asd, p, this_cpu, prev_cpu, sync, waker);
            }
        }

        match sd {
            Some(i) => self.find_idlest_cpu(&topo, i, p, this_cpu, prev_cpu, sd_flag),
            None => {
                if sd_flag.contains(SdFlags::SD_BALANCE_WAKE) {
                    self.select_idle_sibling(p, prev_cpu, new_cpu)
                } else {
                    new_cpu
                }
            }
        }
    }

    /// ## 判断把任务拉到唤醒者所在的CPU是否合适
    fn wake_affine(
        &self,
        sd: &SchedDomain,
        p: &TaskSnapshot,
        this_cpu: ProcessorId,
        prev_cpu: ProcessorId,
        sync: bool,
        waker: Option<&WakerInfo>,
    ) -> ProcessorId {
        let cfg = self.config();
        let mut target = None;
        if cfg.features.contains(super::SchedFeature::WA_IDLE) {
            target = self.wake_affine_idle(this_cpu, prev_cpu, sync);
        }
        if target.is_none() && cfg.features.contains(super::SchedFeature::WA_WEIGHT) {
            target = self.wake_affine_weight(sd, p, this_cpu, prev_cpu, sync, waker);
        }
        target.unwrap_or(prev_cpu)
    }

    fn wake_affine_idle(&self, this_cpu: ProcessorId, prev_cpu: ProcessorId, sync: bool) -> Option<ProcessorId> {
        let topo = self.topology();
        if self.available_idle_cpu(this_cpu) && topo.cpus_share_cache(this_cpu, prev_cpu) {
            return Some(if self.available_idle_cpu(prev_cpu) {
                prev_cpu
            } else {
                this_cpu
            });
        }
        // 同步唤醒：唤醒者马上就要睡眠
        if sync && self.cpu_stat(this_cpu).map(|s| s.nr_running == 1).unwrap_or(false) {
            return Some(this_cpu);
        }
        None
    }

    /// 比较任务放到两边之后两个CPU按算力折算的负载，唤醒者这边略占劣势
    fn wake_affine_weight(
        &self,
        sd: &SchedDomain,
        p: &TaskSnapshot,
        this_cpu: ProcessorId,
        prev_cpu: ProcessorId,
        sync: bool,
        waker: Option<&WakerInfo>,
    ) -> Option<ProcessorId> {
        let this = self.cpu_stat(this_cpu)?;
        let prev = self.cpu_stat(prev_cpu)?;

        let mut this_eff_load = this.load;
        if sync {
            let current_load = waker.map(|w| w.load).unwrap_or(0);
            if current_load > this_eff_load {
                return Some(this_cpu);
            }
            this_eff_load -= current_load;
        }

        this_eff_load += p.load;
        this_eff_load *= 100;
        this_eff_load *= prev.capacity;

        let mut prev_eff_load = prev.load.saturating_sub(p.load);
        prev_eff_load *= 100 + (sd.imbalance_pct as u64 - 100) / 2;
        prev_eff_load *= this.capacity;

        if this_eff_load < prev_eff_load {
            Some(this_cpu)
        } else {
            None
        }
    }

    /// ## 在target的最后一级缓存域内找一个空闲的CPU
    ///
    /// 依次尝试target本身、共享缓存的prev、整个物理核都空闲的核、任意空闲的CPU、
    /// target的SMT兄弟。都不行时返回target。
    fn select_idle_sibling(&self, p: &TaskSnapshot, prev: ProcessorId, target: ProcessorId) -> ProcessorId {
        if self.available_idle_cpu(target) {
            return target;
        }
        let topo = self.topology();
        if prev != target && topo.cpus_share_cache(prev, target) && self.available_idle_cpu(prev) {
            return prev;
        }
        let cd = match topo.cpu_domains(target) {
            Some(cd) => cd,
            None => return target,
        };
        let llc = match cd.llc_domain() {
            Some(sd) => sd,
            None => return target,
        };
        let smt = cd.domains.first().filter(|sd| sd.level == SdLevel::Smt);
        let candidates = &llc.span & &p.cpus_allowed;

        if smt.is_some() {
            if let Some(c) = self.select_idle_core(&candidates, cd.domains.iter().position(|sd| sd.level == SdLevel::Smt), target) {
                return c;
            }
        }
        if let Some(c) = self.select_idle_cpu(&candidates, target) {
            return c;
        }
        if let Some(sd) = smt {
            let siblings = &sd.span & &p.cpus_allowed;
            if let Some(c) = siblings.iter_cpu().find(|c| self.available_idle_cpu(*c)) {
                return c;
            }
        }
        target
    }

    /// 找一个所有SMT兄弟都空闲的物理核
    fn select_idle_core(&self, candidates: &CpuMask, smt_level: Option<usize>, target: ProcessorId) -> Option<ProcessorId> {
        let smt_level = smt_level?;
        let topo = self.topology();
        let mut seen = CpuMask::new();
        for core in Self::wrapped(candidates, target) {
            if seen.contains(core) {
                continue;
            }
            let siblings = match topo.domains(core).get(smt_level) {
                Some(sd) if sd.level == SdLevel::Smt => sd.span.clone(),
                _ => CpuMask::from_cpus([core]),
            };
            let all_idle = siblings.iter_cpu().all(|c| self.available_idle_cpu(c));
            for c in siblings.iter_cpu() {
                seen.set(c, true);
            }
            if all_idle {
                return Some(core);
            }
        }
        None
    }

    fn select_idle_cpu(&self, candidates: &CpuMask, target: ProcessorId) -> Option<ProcessorId> {
        Self::wrapped(candidates, target).find(|c| *c != target && self.available_idle_cpu(*c))
    }

    /// 从target之后的CPU开始，绕一圈遍历mask
    fn wrapped(mask: &CpuMask, target: ProcessorId) -> impl Iterator<Item = ProcessorId> + '_ {
        let after = mask.iter_cpu().filter(move |c| *c > target);
        let before = mask.iter_cpu().filter(move |c| *c <= target);
        after.chain(before)
    }

    /// ## 从第sd_idx层调度域开始，逐层向下找最空闲的CPU
    fn find_idlest_cpu(
        &self,
        topo: &SchedDomainTopology,
        sd_idx: usize,
        p: &TaskSnapshot,
        this_cpu: ProcessorId,
        prev_cpu: ProcessorId,
        sd_flag: SdFlags,
    ) -> ProcessorId {
        let mut domains = topo.domains(this_cpu);
        match domains.get(sd_idx) {
            Some(sd) if sd.span.intersects(&p.cpus_allowed) => {}
            _ => return prev_cpu,
        }
        let mut cpu = this_cpu;
        let mut new_cpu = this_cpu;
        let mut level = Some(sd_idx);

        while let Some(i) = level {
            let sd = &domains[i];
            let child = if i == 0 { None } else { Some(i - 1) };
            if !sd.flags.intersects(sd_flag) {
                level = child;
                continue;
            }
            let group = match self.find_idlest_group(sd, p, cpu, sd_flag) {
                Some(g) => g,
                None => {
                    level = child;
                    continue;
                }
            };
            new_cpu = self.find_idlest_group_cpu(&group, p, cpu);
            if new_cpu == cpu {
                level = child;
                continue;
            }

            // 换到新CPU的调度域链上，继续在比刚才那一层更低的层里找
            cpu = new_cpu;
            let weight = sd.weight();
            domains = topo.domains(cpu);
            level = None;
            for (j, tmp) in domains.iter().enumerate() {
                if weight <= tmp.weight() {
                    break;
                }
                if tmp.flags.intersects(sd_flag) {
                    level = Some(j);
                }
            }
        }
        new_cpu
    }

    /// ## 找负载最低的调度组
    ///
    /// 本地组足够空闲时返回None。非fork的情况下先按剩余算力挑选。
    fn find_idlest_group(
        &self,
        sd: &SchedDomain,
        p: &TaskSnapshot,
        this_cpu: ProcessorId,
        sd_flag: SdFlags,
    ) -> Option<alloc::sync::Arc<SchedGroup>> {
        let imbalance_scale = 100 + (sd.imbalance_pct as u64 - 100) / 2;
        let imbalance = NICE_0_LOAD * (sd.imbalance_pct as u64 - 100) / 100;

        let mut idlest = None;
        let mut min_runnable_load = u64::MAX;
        let mut min_avg_load = u64::MAX;
        let mut this_runnable_load = u64::MAX;
        let mut this_avg_load = u64::MAX;
        let mut most_spare = 0;
        let mut most_spare_sg = None;
        let mut this_spare = 0;

        for group in sd.groups.iter() {
            if !group.span.intersects(&p.cpus_allowed) {
                continue;
            }
            let local = group.span.contains(this_cpu);
            let mut runnable_load = 0;
            let mut avg_load = 0;
            let mut max_spare_cap = 0;
            for i in group.span.iter_cpu() {
                let s = match self.cpu_stat(i) {
                    Some(s) => s,
                    None => continue,
                };
                runnable_load += s.load;
                avg_load += s.load_avg;
                let util = if i == p.cpu {
                    s.util.saturating_sub(p.util)
                } else {
                    s.util
                };
                max_spare_cap = max_spare_cap.max(s.capacity.saturating_sub(util));
            }
            let cap = group.capacity().max(1);
            let avg_load = avg_load * SCHED_CAPACITY_SCALE / cap;
            let runnable_load = runnable_load * SCHED_CAPACITY_SCALE / cap;

            if local {
                this_runnable_load = runnable_load;
                this_avg_load = avg_load;
                this_spare = max_spare_cap;
            } else {
                if min_runnable_load > runnable_load.saturating_add(imbalance) {
                    min_runnable_load = runnable_load;
                    min_avg_load = avg_load;
                    idlest = Some(group.clone());
                } else if runnable_load < min_runnable_load.saturating_add(imbalance)
                    && 100u64.saturating_mul(min_avg_load) > imbalance_scale * avg_load
                {
                    // 瞬时负载差不多时看平均负载
                    min_avg_load = avg_load;
                    idlest = Some(group.clone());
                }
                if most_spare < max_spare_cap {
                    most_spare = max_spare_cap;
                    most_spare_sg = Some(group.clone());
                }
            }
        }

        if !sd_flag.contains(SdFlags::SD_BALANCE_FORK) {
            if this_spare > p.util / 2 && imbalance_scale * this_spare > 100 * most_spare {
                return None;
            }
            if most_spare > p.util / 2 {
                return most_spare_sg;
            }
        }

        let idlest = idlest?;
        if min_runnable_load > this_runnable_load.saturating_add(imbalance) {
            return None;
        }
        if this_runnable_load < min_runnable_load.saturating_add(imbalance)
            && 100u64.saturating_mul(this_avg_load) < imbalance_scale.saturating_mul(min_avg_load)
        {
            return None;
        }
        Some(idlest)
    }

    /// 组内最近才进入空闲的CPU，没有空闲CPU时取负载最低的
    fn find_idlest_group_cpu(&self, group: &SchedGroup, p: &TaskSnapshot, this_cpu: ProcessorId) -> ProcessorId {
        if group.weight() == 1 {
            return group.first_cpu();
        }
        let mut idle_cpu: Option<(ProcessorId, u64)> = None;
        let mut least_loaded: Option<(ProcessorId, u64)> = None;
        for i in (&group.span & &p.cpus_allowed).iter_cpu() {
            let s = match self.cpu_stat(i) {
                Some(s) => s,
                None => continue,
            };
            if s.idle {
                if idle_cpu.map(|(_, stamp)| stamp < s.idle_stamp).unwrap_or(true) {
                    idle_cpu = Some((i, s.idle_stamp));
                }
            } else if idle_cpu.is_none() && least_loaded.map(|(_, l)| s.load < l).unwrap_or(true) {
                least_loaded = Some((i, s.load));
            }
        }
        idle_cpu
            .or(least_loaded)
            .map(|(c, _)| c)
            .unwrap_or(this_cpu)
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::{
        sched::{clock::ManualClock, config::SchedConfig, task::SchedAttrBuilder, NSEC_PER_SEC},
        smp::topology::CpuTopology,
    };

    fn cpu(i: u32) -> ProcessorId {
        ProcessorId::new(i)
    }

    fn setup(topo: CpuTopology) -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new(NSEC_PER_SEC));
        let sched = Scheduler::new(topo, SchedConfig::default(), clock.clone()).unwrap();
        (clock, sched)
    }

    fn fork_on(sched: &Scheduler, pid: usize, cpus: &[u32]) -> Pid {
        let attr = SchedAttrBuilder::default()
            .cpus_allowed(CpuMask::from_cpus(cpus.iter().map(|c| cpu(*c))))
            .build()
            .unwrap();
        sched.sched_fork(None, Pid::new(pid), attr).unwrap();
        Pid::new(pid)
    }

    #[test]
    fn wake_wide_needs_both_sides_flipping() {
        assert!(!wake_wide(0, 0, 4));
        assert!(!wake_wide(10, 5, 4));
        assert!(wake_wide(40, 5, 4));
        assert!(wake_wide(5, 40, 4));
        assert!(!wake_wide(40, 3, 4));
    }

    #[test]
    fn wakee_flips_decay() {
        let (clock, sched) = setup(CpuTopology::flat(1));
        let w = fork_on(&sched, 1, &[0]);
        let (a, b) = (Pid::new(2), Pid::new(3));
        let mut rq = sched.cpu_rq(cpu(0)).unwrap().lock();
        assert_eq!(rq.record_wakee(w, a), 1);
        assert_eq!(rq.record_wakee(w, a), 1);
        assert_eq!(rq.record_wakee(w, b), 2);
        clock.advance(2 * NSEC_PER_SEC);
        assert_eq!(rq.record_wakee(w, b), 1);
        assert_eq!(rq.record_wakee(w, a), 2);
    }

    #[test]
    fn wakeup_lands_on_idle_sibling() {
        let (_clock, sched) = setup(CpuTopology::flat(4));
        let x = fork_on(&sched, 1, &[0]);
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(x));
        let y = fork_on(&sched, 2, &[0]);
        sched.set_cpus_allowed(y, CpuMask::first_n(4)).unwrap();
        sched.sleep(y).unwrap();

        assert!(sched.wake_up(y, Some(x), WakeupFlags::empty()).unwrap());
        assert_eq!(sched.task_cpu(y), Some(cpu(1)));
        let info = sched.task_info(y).unwrap();
        assert_eq!(info.nr_migrations, 1);
        assert!(sched.cpu_rq(cpu(1)).unwrap().lock().need_resched);
    }

    #[test]
    fn fork_goes_to_idlest_cpu() {
        let (_clock, sched) = setup(CpuTopology::flat(4));
        for i in 0..3u32 {
            fork_on(&sched, i as usize + 1, &[i]);
        }
        let attr = SchedAttrBuilder::default().build().unwrap();
        assert_eq!(sched.sched_fork(None, Pid::new(10), attr).unwrap(), cpu(3));
    }

    #[test]
    fn idle_core_preferred_on_smt() {
        // 两个物理核，每核两个线程；cpu0忙，cpu1是它的兄弟
        let (_clock, sched) = setup(CpuTopology::smt(2, 2));
        let x = fork_on(&sched, 1, &[0]);
        sched.schedule(cpu(0)).unwrap();
        let y = fork_on(&sched, 2, &[0]);
        sched.set_cpus_allowed(y, CpuMask::first_n(4)).unwrap();
        sched.sleep(y).unwrap();

        sched.wake_up(y, Some(x), WakeupFlags::empty()).unwrap();
        let landed = sched.task_cpu(y).unwrap();
        assert!(landed == cpu(2) || landed == cpu(3), "landed on {}", landed);
    }
}
