//! NUMA自动均衡
//!
//! 调度器周期性地把任务地址空间中的一段交给内存子系统采样，内存子系统在采样页上发生缺页时
//! 通过[`Scheduler::task_numa_fault`]报告访问的节点。调度器据此维护每个节点上的故障统计，
//! 每扫描完一轮地址空间做一次放置决策：选出首选节点，并尝试把任务迁过去（或者与目标节点上
//! 的任务交换）。访问同一批共享页的任务会合并进同一个NUMA组，组的首选节点反映整个组的访问。

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::{sync::Arc, vec::Vec};
use atomic_enum::atomic_enum;
use system_error::SystemError;

use crate::{
    libs::{
        cpumask::CpuMask,
        spinlock::{double_lock, SpinLock},
    },
    smp::{
        cpu::{NodeId, ProcessorId},
        topology::LOCAL_DISTANCE,
    },
};

use super::{
    balance::CpuIdleType,
    config::SchedConfig,
    core::{Scheduler, StopWork},
    entity::FairSchedEntity,
    pelt::LOAD_AVG_MAX,
    task::{Pid, SchedTask},
    topology::{NumaTopologyType, SchedDomain, SchedDomainTopology, SdFlags},
    CpuRunQueue, NSEC_PER_MSEC, NSEC_PER_SEC, SCHED_CAPACITY_SCALE,
};

/// 每个节点的故障按私有/共享分开统计
const NR_NUMA_HINT_FAULT_TYPES: usize = 2;
/// 统计维度的个数，见[`NumaStat`]
const NR_NUMA_HINT_FAULT_STATS: usize = 4;
/// 每秒最多扫描的地址空间（MB）
const MAX_SCAN_WINDOW: u64 = 2560;

/// 故障统计的维度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumaStat {
    /// 按页所在的节点统计，长期值
    Mem = 0,
    /// 按发生缺页时任务所在的节点统计，长期值
    Cpu = 1,
    /// 当前扫描轮次的缓冲
    MemBuf = 2,
    CpuBuf = 3,
}

#[inline]
fn faults_idx(stat: NumaStat, nid: usize, private: bool, nr_nodes: usize) -> usize {
    NR_NUMA_HINT_FAULT_TYPES * (stat as usize * nr_nodes + nid) + private as usize
}

#[inline]
fn node_faults(faults: &[i64], stat: NumaStat, nid: usize, nr_nodes: usize) -> u64 {
    let sum = faults[faults_idx(stat, nid, false, nr_nodes)] + faults[faults_idx(stat, nid, true, nr_nodes)];
    sum.max(0) as u64
}

/// 每个节点占用 维度数 x 私有/共享 个槽位
#[inline]
fn faults_len(nr_nodes: usize) -> usize {
    NR_NUMA_HINT_FAULT_TYPES * NR_NUMA_HINT_FAULT_STATS * nr_nodes
}

fn alloc_faults(nr_nodes: usize) -> Option<Vec<i64>> {
    let len = faults_len(nr_nodes);
    let mut v = Vec::new();
    v.try_reserve_exact(len).ok()?;
    v.resize(len, 0);
    Some(v)
}

bitflags! {
    /// 缺页报告的附加信息
    pub struct FaultFlags: u8 {
        /// 页在这次缺页中被迁移到了任务所在的节点
        const TNF_MIGRATED = 0x01;
        /// 不要根据这次缺页合并NUMA组
        const TNF_NO_GROUP = 0x02;
        /// 页属于同一个进程的共享映射
        const TNF_SHARED = 0x04;
        /// 页就在任务所在的节点上
        const TNF_FAULT_LOCAL = 0x08;
        /// 页应该迁移，但是迁移失败了
        const TNF_MIGRATE_FAIL = 0x10;
    }
}

/// NUMA自动均衡的运行时开关
#[atomic_enum]
#[derive(PartialEq)]
pub enum NumaBalancingMode {
    Disabled,
    Normal,
}

pub(crate) struct NumaControl {
    mode: AtomicNumaBalancingMode,
    next_group_id: AtomicUsize,
}

impl NumaControl {
    pub fn new() -> Self {
        Self {
            mode: AtomicNumaBalancingMode::new(NumaBalancingMode::Normal),
            next_group_id: AtomicUsize::new(1),
        }
    }

    #[inline]
    fn is_enabled(&self) -> bool {
        cfg!(feature = "numa_balancing") && self.mode.load(Ordering::Relaxed) == NumaBalancingMode::Normal
    }

    fn alloc_group_id(&self) -> usize {
        self.next_group_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// 内存子系统本轮需要采样的地址范围（字节偏移，左闭右开）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaScanWindow {
    pub start: u64,
    pub end: u64,
    /// 地址空间已经被完整扫描过的轮数
    pub seq: u32,
}

/// NUMA组：访问同一批共享页的任务
#[derive(Debug)]
pub struct NumaGroup {
    /// 创建这个组的任务
    pub gid: Pid,
    /// 加锁顺序
    id: usize,
    inner: SpinLock<NumaGroupInner>,
}

#[derive(Debug)]
struct NumaGroupInner {
    nr_tasks: u32,
    /// 与任务的统计数组布局相同，是组内所有任务统计的和
    faults: Vec<i64>,
    total_faults: i64,
    max_faults_cpu: u64,
    active_nodes: u32,
}

impl NumaGroupInner {
    fn faults_cpu(&self, nid: usize, nr_nodes: usize) -> u64 {
        node_faults(&self.faults, NumaStat::Cpu, nid, nr_nodes)
    }

    /// 只有CPU侧故障足够多的节点才算组正在使用的节点
    fn count_active_nodes(&mut self, nr_nodes: usize, fraction: u64) {
        let max = (0..nr_nodes).map(|n| self.faults_cpu(n, nr_nodes)).max().unwrap_or(0);
        self.active_nodes = (0..nr_nodes)
            .filter(|n| self.faults_cpu(*n, nr_nodes) * fraction > max)
            .count() as u32;
        self.max_faults_cpu = max;
    }

    fn is_active_node(&self, nid: usize, nr_nodes: usize, fraction: u64) -> bool {
        self.faults_cpu(nid, nr_nodes) * fraction > self.max_faults_cpu
    }
}

impl NumaGroup {
    fn new(id: usize, gid: Pid, faults: &[i64], total_faults: i64) -> Self {
        Self {
            gid,
            id,
            inner: SpinLock::new(NumaGroupInner {
                nr_tasks: 1,
                faults: faults.to_vec(),
                total_faults,
                max_faults_cpu: 0,
                active_nodes: 1,
            }),
        }
    }

    pub fn nr_tasks(&self) -> u32 {
        self.inner.lock().nr_tasks
    }
}

/// 任务的NUMA状态
#[derive(Debug)]
pub struct NumaTaskState {
    pub preferred_nid: NodeId,
    /// 地址空间大小（字节），0表示没有用户地址空间
    pub mm_size: u64,
    /// 扫描周期（ms），0表示还没有开始计时
    pub scan_period: u64,
    /// 按任务运行时间计的下一个检查点
    node_stamp: u64,
    /// 下一次允许扫描的时刻
    next_scan: u64,
    scan_offset: u64,
    /// 地址空间被完整扫描过的轮数
    pub scan_seq: u32,
    placement_seq: u32,
    work_pending: bool,
    /// 第一次报告缺页时才分配
    faults: Option<Vec<i64>>,
    /// 本轮的远端、本地、迁移失败的故障页数
    faults_locality: [u64; 3],
    total_faults: i64,
    last_placement: u64,
    last_sum_exec_runtime: u64,
    migrate_retry: u64,
    pub pages_migrated: u64,
    group: Option<Arc<NumaGroup>>,
}

impl NumaTaskState {
    pub fn new(mm_size: u64) -> Self {
        Self {
            preferred_nid: NodeId::NUMA_NO_NODE,
            mm_size,
            scan_period: 0,
            node_stamp: 0,
            next_scan: 0,
            scan_offset: 0,
            scan_seq: 0,
            placement_seq: 0,
            work_pending: false,
            faults: None,
            faults_locality: [0; 3],
            total_faults: 0,
            last_placement: 0,
            last_sum_exec_runtime: 0,
            migrate_retry: 0,
            pages_migrated: 0,
            group: None,
        }
    }

    fn nr_scan_windows(&self, cfg: &SchedConfig) -> u64 {
        let size = cfg.numa_scan_size_mb.max(1) << 20;
        ((self.mm_size + size - 1) / size).max(1)
    }

    fn scan_min(&self, cfg: &SchedConfig) -> u64 {
        let floor = 1000 / (MAX_SCAN_WINDOW / cfg.numa_scan_size_mb.max(1)).max(1);
        (cfg.numa_scan_period_min_ms / self.nr_scan_windows(cfg)).max(floor)
    }

    fn scan_max(&self, cfg: &SchedConfig) -> u64 {
        (cfg.numa_scan_period_max_ms / self.nr_scan_windows(cfg)).max(self.scan_min(cfg))
    }

    /// ## 根据本轮故障的分布调整扫描周期
    ///
    /// 私有故障多或者本地故障多，说明任务已经放对了位置，扫描放慢；否则加快。
    /// 有页迁移失败时直接放慢，避免反复扫描迁移不了的页。
    fn update_scan_period(&mut self, shared: u64, private: u64, now: u64, cfg: &SchedConfig) {
        let [remote, local, failed] = self.faults_locality;
        let smin = self.scan_min(cfg);
        let smax = self.scan_max(cfg);

        if local + shared == 0 || failed > 0 {
            self.scan_period = (self.scan_period << 1).min(smax);
            self.next_scan = now + self.scan_period * NSEC_PER_MSEC;
            return;
        }

        let slots = cfg.numa_period_slots;
        let threshold = cfg.numa_period_threshold;
        let period_slot = ((self.scan_period + slots - 1) / slots) as i64;
        let lr_ratio = local * slots / (local + remote).max(1);
        let ps_ratio = private * slots / (private + shared).max(1);

        let diff = if ps_ratio >= threshold {
            (ps_ratio - threshold).max(1) as i64 * period_slot
        } else if lr_ratio >= threshold {
            (lr_ratio - threshold).max(1) as i64 * period_slot
        } else {
            let ratio = lr_ratio.max(ps_ratio);
            -((threshold - ratio) as i64) * period_slot
        };
        let period = (self.scan_period as i64 + diff).max(0) as u64;
        self.scan_period = period.clamp(smin, smax);
        self.faults_locality = [0; 3];
    }

    /// 上一次放置之后任务运行的时间，以及经过的时间
    fn avg_runtime(&mut self, se: &FairSchedEntity) -> (u64, u64) {
        let now = se.exec_start;
        let runtime = se.sum_exec_runtime;
        let res = if self.last_placement != 0 {
            (
                runtime.saturating_sub(self.last_sum_exec_runtime),
                now.saturating_sub(self.last_placement),
            )
        } else {
            (se.avg.load_sum / se.load.weight.max(1), LOAD_AVG_MAX)
        };
        self.last_sum_exec_runtime = runtime;
        self.last_placement = now;
        res
    }
}

/// 与直连节点之外的节点相关的得分
///
/// 非直连的拓扑中，附近节点上的故障也算一部分：网状拓扑按距离衰减，背板拓扑只算比maxdist近的节点。
fn score_nearby_nodes(topo: &SchedDomainTopology, faults: &[i64], nid: usize, maxdist: u32) -> u64 {
    if topo.numa_type == NumaTopologyType::Direct {
        return 0;
    }
    let nr_nodes = topo.nr_nodes();
    let max_dist = topo.max_numa_distance();
    let mut score = 0;
    for node in 0..nr_nodes {
        if node == nid {
            continue;
        }
        let dist = topo.node_distance(NodeId::new(nid as u16), NodeId::new(node as u16));
        if dist == max_dist {
            continue;
        }
        if topo.numa_type == NumaTopologyType::Backplane && dist >= maxdist {
            continue;
        }
        let mut f = node_faults(faults, NumaStat::Mem, node, nr_nodes);
        if topo.numa_type == NumaTopologyType::GluelessMesh {
            f = f * (max_dist - dist) as u64 / (max_dist - LOCAL_DISTANCE).max(1) as u64;
        }
        score += f;
    }
    score
}

/// 节点上的故障占总故障的千分比
fn fault_weight(topo: &SchedDomainTopology, faults: &[i64], total: i64, nid: usize, dist: u32) -> i64 {
    if total <= 0 {
        return 0;
    }
    let f = node_faults(faults, NumaStat::Mem, nid, topo.nr_nodes()) + score_nearby_nodes(topo, faults, nid, dist);
    (1000 * f / total as u64) as i64
}

/// ## 按拓扑类型选出组的首选节点
fn preferred_group_nid(topo: &SchedDomainTopology, faults: &[i64], total: i64, nid: usize) -> usize {
    let nr_nodes = topo.nr_nodes();
    match topo.numa_type {
        NumaTopologyType::Direct => nid,
        NumaTopologyType::GluelessMesh => {
            let dist = topo.max_numa_distance();
            let mut max_score = 0;
            let mut max_node = nid;
            for node in 0..nr_nodes {
                let score = fault_weight(topo, faults, total, node, dist);
                if score > max_score {
                    max_score = score;
                    max_node = node;
                }
            }
            max_node
        }
        NumaTopologyType::Backplane => {
            // 从最远的距离开始，每一轮只保留故障最多的一簇节点
            let mut nid = nid;
            let mut nodes: Vec<usize> = (0..nr_nodes).collect();
            let max_dist = topo.max_numa_distance();
            for dist in (LOCAL_DISTANCE + 1..=max_dist).rev() {
                if !topo.numa_distances.contains(&dist) {
                    continue;
                }
                let mut max_faults = 0;
                let mut max_group = Vec::new();
                let mut rest = nodes.clone();
                while let Some(&a) = rest.first() {
                    let (this_group, others): (Vec<usize>, Vec<usize>) = rest.iter().copied().partition(|b| {
                        topo.node_distance(NodeId::new(a as u16), NodeId::new(*b as u16)) < dist
                    });
                    let faults_sum: u64 = this_group
                        .iter()
                        .map(|b| node_faults(faults, NumaStat::Mem, *b, nr_nodes))
                        .sum();
                    if faults_sum > max_faults {
                        max_faults = faults_sum;
                        max_group = this_group;
                        nid = a;
                    }
                    if others.len() == rest.len() {
                        break;
                    }
                    rest = others;
                }
                if max_faults == 0 {
                    break;
                }
                nodes = max_group;
            }
            nid
        }
    }
}

impl CpuRunQueue {
    pub(crate) fn account_numa_enqueue(&mut self, pid: Pid) {
        let nid = match self.task(pid) {
            Some(t) => t.numa.preferred_nid,
            None => return,
        };
        self.nr_numa_running += (nid != NodeId::NUMA_NO_NODE) as u32;
        self.nr_preferred_running += (nid == self.node) as u32;
    }

    pub(crate) fn account_numa_dequeue(&mut self, pid: Pid) {
        let nid = match self.task(pid) {
            Some(t) => t.numa.preferred_nid,
            None => return,
        };
        if nid != NodeId::NUMA_NO_NODE {
            self.nr_numa_running = self.nr_numa_running.saturating_sub(1);
        }
        if nid == self.node {
            self.nr_preferred_running = self.nr_preferred_running.saturating_sub(1);
        }
    }

    /// 修改首选节点，在队列中的任务同时修正计数
    fn sched_setnuma(&mut self, pid: Pid, nid: NodeId) {
        let counted = match self.task(pid) {
            Some(t) => t.is_queued() && t.policy.is_fair(),
            None => return,
        };
        if counted {
            self.account_numa_dequeue(pid);
        }
        if let Some(t) = self.task_mut(pid) {
            t.numa.preferred_nid = nid;
        }
        if counted {
            self.account_numa_enqueue(pid);
        }
    }

    /// ## 时钟滴答中检查是否该扫描了
    ///
    /// 按任务自己的运行时间计时，到期并且地址空间允许扫描时挂起一次扫描工作，
    /// 由内存子系统调用[`Scheduler::task_numa_work`]领取。
    pub(crate) fn task_tick_numa(&mut self, pid: Pid) {
        let now = self.clock;
        let cfg = self.cfg.clone();
        let t = match self.task_mut(pid) {
            Some(t) => t,
            None => return,
        };
        let runtime = t.se.sum_exec_runtime;
        let numa = &mut t.numa;
        if numa.mm_size == 0 || numa.work_pending {
            return;
        }
        if numa.scan_period == 0 {
            numa.scan_period = cfg.numa_scan_delay_ms.max(1);
        }
        if numa.next_scan == 0 {
            numa.next_scan = now + cfg.numa_scan_delay_ms * NSEC_PER_MSEC;
        }

        let period = numa.scan_period * NSEC_PER_MSEC;
        if runtime > numa.node_stamp + period {
            if numa.node_stamp == 0 {
                numa.scan_period = numa.scan_min(&cfg);
            }
            numa.node_stamp += period;
            if now >= numa.next_scan {
                numa.work_pending = true;
            }
        }
    }

    /// ## 一轮扫描结束后重新计算首选节点
    ///
    /// 把本轮缓冲的故障折算进长期统计，返回新的首选节点（没有变化时为None）。
    fn task_numa_placement(&mut self, pid: Pid, topo: &SchedDomainTopology) -> Option<NodeId> {
        let nr_nodes = topo.nr_nodes();
        let now = self.clock;
        let cfg = self.cfg.clone();
        let t = self.task_mut(pid)?;
        let SchedTask { se, numa, .. } = t;

        if numa.scan_seq == numa.placement_seq {
            return None;
        }
        numa.placement_seq = numa.scan_seq;

        let total_locality = (numa.faults_locality[0] + numa.faults_locality[1]) as i64;
        let (runtime, period) = numa.avg_runtime(se);
        let group = numa.group.clone();
        let faults = numa.faults.as_mut()?;
        if faults.len() != faults_len(nr_nodes) {
            return None;
        }
        let mut g = group.as_ref().map(|g| g.inner.lock());

        let mut fault_types = [0u64; 2];
        let mut max_faults = 0;
        let mut max_nid = None;
        let f_scale = ((runtime << 16) / (period + 1)) as i64;
        for nid in 0..nr_nodes {
            let mut task_node_faults = 0;
            let mut group_node_faults = 0;
            for private in [false, true] {
                let mem = faults_idx(NumaStat::Mem, nid, private, nr_nodes);
                let membuf = faults_idx(NumaStat::MemBuf, nid, private, nr_nodes);
                let cpu = faults_idx(NumaStat::Cpu, nid, private, nr_nodes);
                let cpubuf = faults_idx(NumaStat::CpuBuf, nid, private, nr_nodes);

                // 长期值按一半衰减，再加上本轮的值
                let diff = faults[membuf] - faults[mem] / 2;
                fault_types[private as usize] += faults[membuf].max(0) as u64;
                faults[membuf] = 0;

                // CPU侧的故障按任务的运行比例加权
                let f_weight = f_scale * faults[cpubuf] / (total_locality + 1);
                let f_diff = f_weight - faults[cpu] / 2;
                faults[cpubuf] = 0;

                faults[mem] += diff;
                faults[cpu] += f_diff;
                task_node_faults += faults[mem].max(0) as u64;
                numa.total_faults += diff;
                if let Some(g) = g.as_mut() {
                    g.faults[mem] += diff;
                    g.faults[cpu] += f_diff;
                    g.total_faults += diff;
                    group_node_faults += g.faults[mem].max(0) as u64;
                }
            }

            let score = if g.is_some() { group_node_faults } else { task_node_faults };
            if score > max_faults {
                max_faults = score;
                max_nid = Some(nid);
            }
        }

        if let Some(mut g) = g {
            g.count_active_nodes(nr_nodes, cfg.numa_active_node_fraction);
            if let Some(nid) = max_nid {
                max_nid = Some(preferred_group_nid(topo, &g.faults, g.total_faults, nid));
            }
        }
        numa.update_scan_period(fault_types[0], fault_types[1], now, &cfg);

        let nid = NodeId::new(max_nid? as u16);
        if max_faults == 0 || nid == numa.preferred_nid {
            return None;
        }
        self.sched_setnuma(pid, nid);
        Some(nid)
    }
}

/// 一个节点的负载统计
#[derive(Debug, Default, Clone, Copy)]
struct NumaStats {
    nr_running: u64,
    load: u64,
    compute_capacity: u64,
    task_capacity: u64,
    has_free_capacity: bool,
}

/// 选址时需要的任务信息
#[derive(Debug)]
struct NumaTaskView {
    pid: Pid,
    cpu: ProcessorId,
    cpus_allowed: CpuMask,
    faults: Vec<i64>,
    total_faults: i64,
    group: Option<Arc<NumaGroup>>,
    group_faults: Vec<i64>,
    group_total: i64,
    load: u64,
    rq_nr_running: u32,
}

impl NumaTaskView {
    fn of(rq: &CpuRunQueue, t: &SchedTask) -> Self {
        let (group_faults, group_total) = match &t.numa.group {
            Some(g) => {
                let inner = g.inner.lock();
                (inner.faults.clone(), inner.total_faults)
            }
            None => (Vec::new(), 0),
        };
        Self {
            pid: t.pid,
            cpu: rq.cpu,
            cpus_allowed: t.cpus_allowed.clone(),
            faults: t.numa.faults.clone().unwrap_or_default(),
            total_faults: t.numa.total_faults,
            group: t.numa.group.clone(),
            group_faults,
            group_total,
            load: rq.task_h_load(t.pid),
            rq_nr_running: rq.nr_running,
        }
    }

    fn task_weight(&self, topo: &SchedDomainTopology, nid: NodeId, dist: u32) -> i64 {
        if self.faults.is_empty() {
            return 0;
        }
        fault_weight(topo, &self.faults, self.total_faults, nid.index(), dist)
    }

    fn group_weight(&self, topo: &SchedDomainTopology, nid: NodeId, dist: u32) -> i64 {
        if self.group_faults.is_empty() {
            return 0;
        }
        fault_weight(topo, &self.group_faults, self.group_total, nid.index(), dist)
    }

    fn same_group(&self, other: &NumaTaskView) -> bool {
        match (&self.group, &other.group) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// 一次NUMA迁移的搜索状态
struct NumaEnv<'a> {
    p: &'a NumaTaskView,
    src_nid: NodeId,
    dst_nid: NodeId,
    dist: u32,
    imbalance_pct: u64,
    src_stats: NumaStats,
    dst_stats: NumaStats,
    best_cpu: Option<ProcessorId>,
    best_task: Option<(Pid, ProcessorId)>,
    best_imp: i64,
}

impl<'a> NumaEnv<'a> {
    /// 只有源节点（按算力折算）比目标节点更忙时才考虑单向迁移
    fn has_capacity(&self) -> bool {
        let src = &self.src_stats;
        let dst = &self.dst_stats;
        if src.has_free_capacity && !dst.has_free_capacity {
            return false;
        }
        src.load * dst.compute_capacity * self.imbalance_pct > dst.load * src.compute_capacity * 100
    }

    /// 迁移之后两个节点的负载差超过阈值，并且比原来更差
    fn load_too_imbalanced(&self, src_load: i64, dst_load: i64) -> bool {
        let src_cap = self.src_stats.compute_capacity as i64;
        let dst_cap = self.dst_stats.compute_capacity as i64;
        let pct = self.imbalance_pct as i64;
        let (src_load, dst_load) = if dst_load < src_load { (dst_load, src_load) } else { (src_load, dst_load) };
        let imb = dst_load * src_cap * 100 - src_load * dst_cap * pct;
        if imb <= 0 {
            return false;
        }
        let (o_src, o_dst) = (self.src_stats.load as i64, self.dst_stats.load as i64);
        let (o_src, o_dst) = if o_dst < o_src { (o_dst, o_src) } else { (o_src, o_dst) };
        let old_imb = o_dst * src_cap * 100 - o_src * dst_cap * pct;
        imb > old_imb
    }

    fn assign(&mut self, cpu: ProcessorId, cur: Option<&NumaTaskView>, imp: i64) {
        self.best_cpu = Some(cpu);
        self.best_task = cur.map(|c| (c.pid, c.cpu));
        self.best_imp = imp;
    }
}

impl Scheduler {
    /// NUMA自动均衡是否生效：编译时打开、运行时没有关闭，并且确实有多个节点
    pub fn numa_enabled(&self) -> bool {
        self.numa.is_enabled() && self.topology().nr_nodes() > 1
    }

    /// 运行时打开或关闭NUMA自动均衡
    pub fn set_numa_balancing(&self, enable: bool) -> Result<(), SystemError> {
        if !cfg!(feature = "numa_balancing") {
            return Err(SystemError::ENOSYS);
        }
        let mode = if enable {
            NumaBalancingMode::Normal
        } else {
            NumaBalancingMode::Disabled
        };
        self.numa.mode.store(mode, Ordering::Relaxed);
        log::info!("sched: numa balancing {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    /// ## 领取一次扫描工作
    ///
    /// 时钟滴答挂起了扫描工作并且到了扫描时间时，返回本轮需要采样的地址范围，
    /// 扫描到地址空间末尾之后从头开始，并增加轮数。
    pub fn task_numa_work(&self, pid: Pid) -> Result<Option<NumaScanWindow>, SystemError> {
        let enabled = self.numa_enabled();
        let cfg = self.config();
        let (_, mut rq) = self.task_rq_lock(pid)?;
        rq.update_rq_clock();
        let now = rq.clock;
        let t = rq.task_mut(pid).ok_or(SystemError::ESRCH)?;
        let numa = &mut t.numa;
        if !numa.work_pending {
            return Ok(None);
        }
        numa.work_pending = false;
        if !enabled || numa.mm_size == 0 {
            return Ok(None);
        }

        if numa.next_scan == 0 {
            numa.next_scan = now + cfg.numa_scan_delay_ms * NSEC_PER_MSEC;
        }
        if now < numa.next_scan {
            return Ok(None);
        }
        if numa.scan_period == 0 {
            numa.scan_period = numa.scan_min(&cfg);
        }
        numa.next_scan = now + numa.scan_period * NSEC_PER_MSEC;

        let start = numa.scan_offset.min(numa.mm_size);
        let end = (start + (cfg.numa_scan_size_mb << 20)).min(numa.mm_size);
        let seq = numa.scan_seq;
        if end >= numa.mm_size {
            numa.scan_offset = 0;
            numa.scan_seq = numa.scan_seq.wrapping_add(1);
        } else {
            numa.scan_offset = end;
        }
        Ok(Some(NumaScanWindow { start, end, seq }))
    }

    /// ## 采样页上发生缺页
    ///
    /// * `last` - 上一次访问这个页的任务，None表示第一次访问
    /// * `mem_node` - 页所在的节点
    /// * `pages` - 缺页涉及的页数
    pub fn task_numa_fault(
        &self,
        pid: Pid,
        last: Option<Pid>,
        mem_node: NodeId,
        pages: u64,
        flags: FaultFlags,
    ) -> Result<(), SystemError> {
        if !self.numa_enabled() {
            return Ok(());
        }
        let topo = self.topology();
        let nr_nodes = topo.nr_nodes();
        if mem_node.index() >= nr_nodes {
            return Err(SystemError::EINVAL);
        }
        if pages == 0 {
            return Ok(());
        }

        let mut private = last.map(|l| l == pid).unwrap_or(true);
        let try_group = !private && !flags.contains(FaultFlags::TNF_NO_GROUP);
        {
            let (_, mut rq) = self.task_rq_lock(pid)?;
            let t = rq.task_mut(pid).ok_or(SystemError::ESRCH)?;
            if t.numa.mm_size == 0 {
                return Ok(());
            }
            if t.numa.faults.is_none() {
                match alloc_faults(nr_nodes) {
                    Some(f) => {
                        t.numa.faults = Some(f);
                        t.numa.total_faults = 0;
                        t.numa.faults_locality = [0; 3];
                    }
                    None => {
                        log::warn!("sched: no memory for numa faults of task {}", pid);
                        return Ok(());
                    }
                }
            }
            if try_group && t.numa.group.is_none() {
                let faults = t.numa.faults.as_deref().unwrap_or_default();
                let g = NumaGroup::new(self.numa.alloc_group_id(), pid, faults, t.numa.total_faults);
                t.numa.group = Some(Arc::new(g));
            }
        }
        if let (true, Some(other)) = (try_group, last) {
            private = self.task_numa_group(pid, other, flags);
        }

        let cfg = self.config();
        let migrate = {
            let (_, mut rq) = self.task_rq_lock(pid)?;
            rq.update_rq_clock();
            let now = rq.clock;
            let cpu_node = rq.node;
            let mut local = flags.contains(FaultFlags::TNF_FAULT_LOCAL);

            // 组正在使用的节点之间的共享故障也算本地
            if !private && !local {
                if let Some(g) = rq.task(pid).and_then(|t| t.numa.group.clone()) {
                    let g = g.inner.lock();
                    let fraction = cfg.numa_active_node_fraction;
                    if g.active_nodes > 1
                        && g.is_active_node(cpu_node.index(), nr_nodes, fraction)
                        && g.is_active_node(mem_node.index(), nr_nodes, fraction)
                    {
                        local = true;
                    }
                }
            }

            let changed = rq.task_numa_placement(pid, &topo).is_some();
            let t = rq.task_mut(pid).ok_or(SystemError::ESRCH)?;
            let numa = &mut t.numa;
            let mut migrate = false;
            if (changed || now > numa.migrate_retry) && numa.preferred_nid != NodeId::NUMA_NO_NODE {
                let interval = NSEC_PER_SEC.min(numa.scan_period * NSEC_PER_MSEC / 16);
                numa.migrate_retry = now + interval;
                migrate = cpu_node != numa.preferred_nid;
            }

            if flags.contains(FaultFlags::TNF_MIGRATED) {
                numa.pages_migrated += pages;
            }
            if flags.contains(FaultFlags::TNF_MIGRATE_FAIL) {
                numa.faults_locality[2] += pages;
            }
            if let Some(faults) = numa.faults.as_mut() {
                faults[faults_idx(NumaStat::MemBuf, mem_node.index(), private, nr_nodes)] += pages as i64;
                faults[faults_idx(NumaStat::CpuBuf, cpu_node.index(), private, nr_nodes)] += pages as i64;
            }
            numa.faults_locality[local as usize] += pages;
            migrate
        };

        if migrate {
            if let Err(e) = self.task_numa_migrate(pid) {
                log::debug!("sched: numa migration of task {} skipped: {:?}", pid, e);
            }
        }
        Ok(())
    }

    /// ## 根据共享故障决定是否加入另一个任务的NUMA组
    ///
    /// 总是较小的组加入较大的组，大小相同时按创建顺序。返回这次故障是否应该算作私有。
    fn task_numa_group(&self, pid: Pid, other: Pid, flags: FaultFlags) -> bool {
        let grp = match self.task_rq_lock(other) {
            Ok((_, rq)) => rq.task(other).and_then(|t| t.numa.group.clone()),
            Err(_) => None,
        };
        let my_grp = match self.task_rq_lock(pid) {
            Ok((_, rq)) => rq.task(pid).and_then(|t| t.numa.group.clone()),
            Err(_) => None,
        };
        let (grp, my_grp) = match (grp, my_grp) {
            (Some(g), Some(m)) if !Arc::ptr_eq(&g, &m) => (g, m),
            _ => return false,
        };

        let (my_n, n) = (my_grp.nr_tasks(), grp.nr_tasks());
        if my_n > n || (my_n == n && my_grp.id > grp.id) {
            return false;
        }
        // 只有确认是同一个进程的共享映射才合并，否则当成私有的误共享
        if !flags.contains(FaultFlags::TNF_SHARED) {
            return true;
        }

        let (_, mut rq) = match self.task_rq_lock(pid) {
            Ok(r) => r,
            Err(_) => return false,
        };
        let t = match rq.task_mut(pid) {
            Some(t) => t,
            None => return false,
        };
        if !t.numa.group.as_ref().map(|g| Arc::ptr_eq(g, &my_grp)).unwrap_or(false) {
            return false;
        }
        {
            let (mut from, mut to) = double_lock(&my_grp.inner, my_grp.id, &grp.inner, grp.id);
            if let Some(faults) = t.numa.faults.as_ref() {
                for (i, f) in faults.iter().enumerate() {
                    if let (Some(a), Some(b)) = (from.faults.get_mut(i), to.faults.get_mut(i)) {
                        *a -= *f;
                        *b += *f;
                    }
                }
            }
            from.total_faults -= t.numa.total_faults;
            to.total_faults += t.numa.total_faults;
            from.nr_tasks = from.nr_tasks.saturating_sub(1);
            to.nr_tasks += 1;
        }
        t.numa.group = Some(grp.clone());
        drop(rq);
        log::debug!("sched: task {} joined numa group {}", pid, grp.gid);
        false
    }

    fn numa_stats(&self, topo: &SchedDomainTopology, nid: NodeId) -> NumaStats {
        let mut ns = NumaStats::default();
        let mut cpus = 0;
        for cpu in topo.node_cpus(nid).iter_cpu() {
            if let Some(s) = self.cpu_stat(cpu) {
                ns.nr_running += s.nr_running as u64;
                ns.load += s.load;
                ns.compute_capacity += s.capacity;
                cpus += 1;
            }
        }
        if cpus == 0 || ns.compute_capacity == 0 {
            return ns;
        }
        // 考虑SMT之后节点能同时运行的任务数
        let smt = (SCHED_CAPACITY_SCALE * cpus + ns.compute_capacity - 1) / ns.compute_capacity;
        let capacity = cpus / smt.max(1);
        ns.task_capacity = capacity.min((ns.compute_capacity + SCHED_CAPACITY_SCALE / 2) / SCHED_CAPACITY_SCALE);
        ns.has_free_capacity = ns.nr_running < ns.task_capacity;
        ns
    }

    /// 读取cpu上正在运行的公平调度任务，作为交换的候选
    fn numa_swap_candidate(&self, cpu: ProcessorId) -> (Option<NumaTaskView>, u32) {
        let rq = match self.cpu_rq(cpu) {
            Some(rq) => rq.lock(),
            None => return (None, 0),
        };
        let cur = rq
            .curr
            .and_then(|c| rq.task(c))
            .filter(|t| t.policy.is_fair() && t.numa.mm_size > 0)
            .map(|t| NumaTaskView::of(&rq, t));
        (cur, rq.nr_running)
    }

    /// ## 评估把任务放到dst_cpu（或与那里正在运行的任务交换）的收益
    fn task_numa_compare(&self, env: &mut NumaEnv<'_>, topo: &SchedDomainTopology, dst_cpu: ProcessorId, taskimp: i64, groupimp: i64) {
        let p = env.p;
        let moveimp = if p.group.is_some() { groupimp } else { taskimp };
        let mut imp = moveimp;
        let (mut cur, dst_nr_running) = self.numa_swap_candidate(dst_cpu);
        if cur.as_ref().map(|c| c.pid == p.pid).unwrap_or(false) {
            return;
        }

        if let Some(c) = cur.as_ref() {
            if !c.cpus_allowed.contains(p.cpu) {
                return;
            }
            if c.same_group(p) {
                imp = taskimp + c.task_weight(topo, env.src_nid, env.dist) - c.task_weight(topo, env.dst_nid, env.dist);
                // 同一组内的任务差别很小时不交换
                if c.group.is_some() {
                    imp -= imp / 16;
                }
            } else if c.group.is_some() {
                imp += c.group_weight(topo, env.src_nid, env.dist) - c.group_weight(topo, env.dst_nid, env.dist);
            } else {
                imp += c.task_weight(topo, env.src_nid, env.dist) - c.task_weight(topo, env.dst_nid, env.dist);
            }
        }

        if imp <= env.best_imp && moveimp <= env.best_imp {
            return;
        }

        match cur.as_ref() {
            None => {
                if env.src_stats.nr_running <= env.src_stats.task_capacity && !env.dst_stats.has_free_capacity {
                    return;
                }
            }
            Some(c) => {
                // 每个CPU上只有一个任务时负载均衡无所谓
                if imp > env.best_imp && p.rq_nr_running == 1 && dst_nr_running == 1 {
                    env.assign(dst_cpu, Some(c), imp);
                    return;
                }
            }
        }

        let load = p.load as i64;
        let mut dst_load = env.dst_stats.load as i64 + load;
        let mut src_load = env.src_stats.load as i64 - load;

        if moveimp > imp && moveimp > env.best_imp && !env.load_too_imbalanced(src_load, dst_load) {
            // 比真正空闲的CPU稍低一点
            env.assign(dst_cpu, None, moveimp - 1);
            return;
        }
        if imp <= env.best_imp {
            return;
        }
        if let Some(c) = cur.as_ref() {
            dst_load -= c.load as i64;
            src_load += c.load as i64;
        }
        if env.load_too_imbalanced(src_load, dst_load) {
            return;
        }
        let c = cur.take();
        env.assign(dst_cpu, c.as_ref(), imp);
    }

    fn task_numa_find_cpu(&self, env: &mut NumaEnv<'_>, topo: &SchedDomainTopology, taskimp: i64, groupimp: i64) {
        for cpu in topo.node_cpus(env.dst_nid).iter_cpu() {
            if !env.p.cpus_allowed.contains(cpu) {
                continue;
            }
            self.task_numa_compare(env, topo, cpu, taskimp, groupimp);
        }
    }

    fn set_preferred_nid(&self, pid: Pid, nid: NodeId) {
        if let Ok((_, mut rq)) = self.task_rq_lock(pid) {
            rq.sched_setnuma(pid, nid);
        }
    }

    /// ## 尝试把任务迁到首选节点
    ///
    /// 先在首选节点上找，找不到（或者组分布在多个节点上）时再看其他节点。
    fn task_numa_migrate(&self, pid: Pid) -> Result<(), SystemError> {
        let topo = self.topology();
        let cfg = self.config();
        let (p, preferred) = {
            let (_, rq) = self.task_rq_lock(pid)?;
            let t = rq.task(pid).ok_or(SystemError::ESRCH)?;
            (NumaTaskView::of(&rq, t), t.numa.preferred_nid)
        };
        let src_nid = topo.cpu_to_node(p.cpu);
        if preferred == NodeId::NUMA_NO_NODE || preferred == src_nid {
            return Ok(());
        }

        let has_sd_numa = topo
            .cpu_domains(p.cpu)
            .and_then(|d| d.sd_numa.and_then(|i| d.domains.get(i)))
            .is_some();
        let imbalance_pct = match has_sd_numa {
            true => cfg.numa_imbalance_pct,
            false => {
                // 没有跨节点的调度域，当前节点就是最合适的
                self.set_preferred_nid(pid, src_nid);
                return Err(SystemError::EINVAL);
            }
        };

        let dist = topo.node_distance(src_nid, preferred);
        let mut env = NumaEnv {
            p: &p,
            src_nid,
            dst_nid: preferred,
            dist,
            imbalance_pct,
            src_stats: self.numa_stats(&topo, src_nid),
            dst_stats: self.numa_stats(&topo, preferred),
            best_cpu: None,
            best_task: None,
            best_imp: 0,
        };
        let taskweight = p.task_weight(&topo, src_nid, dist);
        let groupweight = p.group_weight(&topo, src_nid, dist);
        let taskimp = p.task_weight(&topo, preferred, dist) - taskweight;
        let groupimp = p.group_weight(&topo, preferred, dist) - groupweight;
        if env.has_capacity() {
            self.task_numa_find_cpu(&mut env, &topo, taskimp, groupimp);
        }

        let spread = p
            .group
            .as_ref()
            .map(|g| g.inner.lock().active_nodes > 1)
            .unwrap_or(false);
        if env.best_cpu.is_none() || spread {
            for n in 0..topo.nr_nodes() {
                let nid = NodeId::new(n as u16);
                if nid == src_nid || nid == preferred {
                    continue;
                }
                let dist = topo.node_distance(src_nid, nid);
                let (tw, gw) = if topo.numa_type == NumaTopologyType::Backplane && dist != env.dist {
                    (p.task_weight(&topo, src_nid, dist), p.group_weight(&topo, src_nid, dist))
                } else {
                    (taskweight, groupweight)
                };
                let taskimp = p.task_weight(&topo, nid, dist) - tw;
                let groupimp = p.group_weight(&topo, nid, dist) - gw;
                if taskimp < 0 && groupimp < 0 {
                    continue;
                }
                env.dist = dist;
                env.dst_nid = nid;
                env.dst_stats = self.numa_stats(&topo, nid);
                if env.has_capacity() {
                    self.task_numa_find_cpu(&mut env, &topo, taskimp, groupimp);
                }
            }
        }

        // 组分布在多个节点上时，把任务实际能去的活跃节点作为首选
        if let Some(g) = p.group.as_ref() {
            let nid = if env.best_cpu.is_some() { env.dst_nid } else { src_nid };
            let active = g
                .inner
                .lock()
                .is_active_node(nid.index(), topo.nr_nodes(), cfg.numa_active_node_fraction);
            if active {
                self.set_preferred_nid(pid, env.dst_nid);
            }
        }

        let best_cpu = env.best_cpu.ok_or(SystemError::EAGAIN_OR_EWOULDBLOCK)?;
        {
            // 换了节点之后重新检查放置是否正确
            let (_, mut rq) = self.task_rq_lock(pid)?;
            if let Some(t) = rq.task_mut(pid) {
                t.numa.scan_period = t.numa.scan_min(&cfg);
            }
        }

        match env.best_task {
            None => {
                if !self.queue_stop_work(p.cpu, StopWork::MigrateTask { pid, target: best_cpu }) {
                    return Err(SystemError::EBUSY);
                }
                log::debug!("sched: numa moves task {} from cpu {} to cpu {}", pid, p.cpu, best_cpu);
            }
            Some((cur, cur_cpu)) => {
                if !self.migrate_swap(pid, p.cpu, cur, cur_cpu) {
                    return Err(SystemError::EAGAIN_OR_EWOULDBLOCK);
                }
                log::debug!("sched: numa swaps task {} (cpu {}) with task {} (cpu {})", pid, p.cpu, cur, cur_cpu);
            }
        }
        Ok(())
    }

    /// ## 交换两个CPU上的任务
    ///
    /// 在两把锁下重新检查两个任务的位置和亲和性，不满足就放弃。
    fn migrate_swap(&self, a: Pid, a_cpu: ProcessorId, b: Pid, b_cpu: ProcessorId) -> bool {
        let (mut ra, mut rb) = match self.lock_pair(a_cpu, b_cpu) {
            Some(pair) => pair,
            None => return false,
        };
        let ok = |rq: &CpuRunQueue, pid: Pid, to: ProcessorId| {
            rq.task(pid).map(|t| t.is_queued() && t.can_run_on(to)).unwrap_or(false)
        };
        if !ra.online || !rb.online || !ok(&*ra, a, b_cpu) || !ok(&*rb, b, a_cpu) {
            return false;
        }
        ra.update_rq_clock();
        rb.update_rq_clock();
        for (rq, pid) in [(&mut ra, a), (&mut rb, b)] {
            if rq.curr == Some(pid) {
                rq.put_prev_curr();
                rq.resched_curr();
            }
            rq.detach_task(pid);
        }
        let moved_a = self.transfer_task(&mut ra, &mut rb, a);
        let moved_b = self.transfer_task(&mut rb, &mut ra, b);
        if moved_a {
            rb.attach_task(a);
        } else {
            ra.attach_task(a);
        }
        if moved_b {
            ra.attach_task(b);
        } else {
            rb.attach_task(b);
        }
        moved_a && moved_b
    }

    /// ## 负载均衡迁移任务是否会破坏NUMA局部性
    ///
    /// 返回1表示会破坏，0表示会改善，-1表示没有意见。
    pub(crate) fn migrate_degrades_locality(
        &self,
        topo: &SchedDomainTopology,
        src: &CpuRunQueue,
        t: &SchedTask,
        dst_cpu: ProcessorId,
        sd: &SchedDomain,
        idle: CpuIdleType,
        numa_enabled: bool,
    ) -> i32 {
        if !numa_enabled || t.numa.faults.is_none() || !sd.has(SdFlags::SD_NUMA) {
            return -1;
        }
        let src_nid = src.node;
        let dst_nid = topo.cpu_to_node(dst_cpu);
        if src_nid == dst_nid {
            return -1;
        }
        // 离开首选节点总是不好的
        if src_nid == t.numa.preferred_nid {
            return if src.nr_running > src.nr_preferred_running { 1 } else { -1 };
        }
        if dst_nid == t.numa.preferred_nid {
            return 0;
        }
        // 让CPU空着通常比破坏局部性更糟
        if idle != CpuIdleType::NotIdle {
            return -1;
        }

        let nr_nodes = topo.nr_nodes();
        if src_nid.index() >= nr_nodes || dst_nid.index() >= nr_nodes {
            return -1;
        }
        let (src_faults, dst_faults) = match &t.numa.group {
            Some(g) => {
                let g = g.inner.lock();
                (
                    node_faults(&g.faults, NumaStat::Mem, src_nid.index(), nr_nodes),
                    node_faults(&g.faults, NumaStat::Mem, dst_nid.index(), nr_nodes),
                )
            }
            None => match &t.numa.faults {
                Some(f) => (
                    node_faults(f, NumaStat::Mem, src_nid.index(), nr_nodes),
                    node_faults(f, NumaStat::Mem, dst_nid.index(), nr_nodes),
                ),
                None => return -1,
            },
        };
        (dst_faults < src_faults) as i32
    }

    /// ## 采样页上的缺页是否应该把页迁到dst_cpu所在的节点
    ///
    /// * `last` - 上一次访问这个页的任务
    /// * `last_nid` - 上一次访问时所在的节点，两次访问都来自目标节点才迁移
    /// * `src_nid` - 页当前所在的节点
    pub fn should_numa_migrate_memory(
        &self,
        pid: Pid,
        last: Option<Pid>,
        last_nid: Option<NodeId>,
        src_nid: NodeId,
        dst_cpu: ProcessorId,
    ) -> Result<bool, SystemError> {
        let topo = self.topology();
        let nr_nodes = topo.nr_nodes();
        let dst_nid = topo.cpu_to_node(dst_cpu);
        if src_nid.index() >= nr_nodes || dst_nid.index() >= nr_nodes {
            return Err(SystemError::EINVAL);
        }
        if let Some(last_nid) = last_nid {
            if last_nid != dst_nid {
                return Ok(false);
            }
        }
        if last == Some(pid) {
            return Ok(true);
        }

        let group = {
            let (_, rq) = self.task_rq_lock(pid)?;
            rq.task(pid).ok_or(SystemError::ESRCH)?.numa.group.clone()
        };
        let g = match group {
            Some(g) => g,
            None => return Ok(true),
        };
        let cfg = self.config();
        let g = g.inner.lock();
        let (src, dst) = (src_nid.index(), dst_nid.index());
        let cpu_src = g.faults_cpu(src, nr_nodes);
        let cpu_dst = g.faults_cpu(dst, nr_nodes);
        // 目标节点上的CPU侧故障远多于源节点
        if cpu_dst > cpu_src * cfg.numa_active_node_fraction {
            return Ok(true);
        }
        let mem_src = node_faults(&g.faults, NumaStat::Mem, src, nr_nodes);
        let mem_dst = node_faults(&g.faults, NumaStat::Mem, dst, nr_nodes);
        Ok(cpu_dst * mem_src * cfg.numa_migrate_hysteresis_num
            > cpu_src * mem_dst * cfg.numa_migrate_hysteresis_den)
    }

    /// 任务退出时把它的统计从NUMA组中减掉
    pub(crate) fn task_numa_free(&self, task: &SchedTask) {
        let g = match &task.numa.group {
            Some(g) => g,
            None => return,
        };
        let mut inner = g.inner.lock();
        if let Some(faults) = task.numa.faults.as_ref() {
            for (a, f) in inner.faults.iter_mut().zip(faults.iter()) {
                *a -= *f;
            }
        }
        inner.total_faults -= task.numa.total_faults;
        inner.nr_tasks = inner.nr_tasks.saturating_sub(1);
    }

    /// 任务所在的NUMA组（用组长的pid表示）以及组内的任务数
    pub fn task_numa_group_info(&self, pid: Pid) -> Result<Option<(Pid, u32)>, SystemError> {
        let (_, rq) = self.task_rq_lock(pid)?;
        let t = rq.task(pid).ok_or(SystemError::ESRCH)?;
        Ok(t.numa.group.as_ref().map(|g| (g.gid, g.nr_tasks())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sched::{clock::ManualClock, config::TunableScaling, task::SchedAttrBuilder},
        smp::topology::CpuTopology,
    };

    const MB: u64 = 1 << 20;

    fn cpu(i: u32) -> ProcessorId {
        ProcessorId::new(i)
    }

    fn node(i: u16) -> NodeId {
        NodeId::new(i)
    }

    fn two_nodes() -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new(NSEC_PER_SEC));
        let topo = CpuTopology::numa(2, 2, alloc::vec![alloc::vec![10, 21], alloc::vec![21, 10]]).unwrap();
        let cfg = SchedConfig {
            tunable_scaling: TunableScaling::None,
            numa_scan_delay_ms: 1,
            ..Default::default()
        };
        let sched = Scheduler::new(topo, cfg, clock.clone()).unwrap();
        (clock, sched)
    }

    fn fork_mm(sched: &Scheduler, pid: usize, cpus: CpuMask, mm_size: u64) -> Pid {
        let mut b = SchedAttrBuilder::default();
        b.nice(0);
        b.cpus_allowed(cpus);
        b.mm_size(mm_size);
        sched.sched_fork(None, Pid::new(pid), b.build().unwrap()).unwrap();
        Pid::new(pid)
    }

    fn with_task<R>(sched: &Scheduler, pid: Pid, f: impl FnOnce(&mut NumaTaskState) -> R) -> R {
        let (_, mut rq) = sched.task_rq_lock(pid).unwrap();
        f(&mut rq.task_mut(pid).unwrap().numa)
    }

    fn make_due(sched: &Scheduler, pid: Pid) {
        with_task(sched, pid, |n| {
            n.work_pending = true;
            n.next_scan = 1;
        });
    }

    #[test]
    fn scan_windows_walk_the_address_space() {
        let (_clock, sched) = two_nodes();
        let a = fork_mm(&sched, 1, CpuMask::first_n(4), 600 * MB);
        assert_eq!(sched.task_numa_work(a).unwrap(), None);

        let mut windows = Vec::new();
        for _ in 0..4 {
            make_due(&sched, a);
            windows.push(sched.task_numa_work(a).unwrap().unwrap());
        }
        assert_eq!(windows[0], NumaScanWindow { start: 0, end: 256 * MB, seq: 0 });
        assert_eq!(windows[1], NumaScanWindow { start: 256 * MB, end: 512 * MB, seq: 0 });
        assert_eq!(windows[2], NumaScanWindow { start: 512 * MB, end: 600 * MB, seq: 0 });
        assert_eq!(windows[3], NumaScanWindow { start: 0, end: 256 * MB, seq: 1 });

        // 刚扫描过，下一次扫描要等一个周期
        with_task(&sched, a, |n| n.work_pending = true);
        assert_eq!(sched.task_numa_work(a).unwrap(), None);
    }

    #[test]
    fn tick_queues_scan_work_after_runtime() {
        let (clock, sched) = two_nodes();
        let a = fork_mm(&sched, 1, CpuMask::from_cpus([cpu(0)]), 256 * MB);
        assert_eq!(sched.schedule(cpu(0)).unwrap(), Some(a));
        for _ in 0..150 {
            clock.advance(NSEC_PER_MSEC);
            sched.scheduler_tick(cpu(0)).unwrap();
        }
        let w = sched.task_numa_work(a).unwrap().unwrap();
        assert_eq!((w.start, w.end), (0, 256 * MB));
        assert_eq!(with_task(&sched, a, |n| n.scan_seq), 1);
    }

    #[test]
    fn kernel_threads_are_not_scanned() {
        let (clock, sched) = two_nodes();
        let k = fork_mm(&sched, 1, CpuMask::from_cpus([cpu(0)]), 0);
        sched.schedule(cpu(0)).unwrap();
        for _ in 0..150 {
            clock.advance(NSEC_PER_MSEC);
            sched.scheduler_tick(cpu(0)).unwrap();
        }
        assert_eq!(sched.task_numa_work(k).unwrap(), None);
        sched.task_numa_fault(k, None, node(1), 10, FaultFlags::empty()).unwrap();
        assert!(with_task(&sched, k, |n| n.faults.is_none()));
    }

    #[test]
    fn remote_faults_move_task_to_preferred_node() {
        let (_clock, sched) = two_nodes();
        let a = fork_mm(&sched, 1, CpuMask::first_n(4), 256 * MB);
        let src = sched.task_cpu(a).unwrap();
        assert_eq!(sched.schedule(src).unwrap(), Some(a));
        // 每个节点两个CPU
        let remote = node(1 - (src.data() / 2) as u16);

        sched.task_numa_fault(a, None, remote, 100, FaultFlags::empty()).unwrap();
        assert_eq!(sched.task_info(a).unwrap().numa_preferred_nid, NodeId::NUMA_NO_NODE);

        // 一轮扫描结束
        with_task(&sched, a, |n| n.scan_seq += 1);
        sched.task_numa_fault(a, None, remote, 100, FaultFlags::empty()).unwrap();
        assert_eq!(sched.task_info(a).unwrap().numa_preferred_nid, remote);

        // 迁移在源CPU的下一个时钟滴答中完成
        sched.scheduler_tick(src).unwrap();
        let dst = sched.task_cpu(a).unwrap();
        assert_eq!(sched.topology().cpu_to_node(dst), remote, "task on cpu {}", dst);
        let info = sched.cpu_rq(dst).unwrap().lock().nr_preferred_running;
        assert_eq!(info, 1);
    }

    #[test]
    fn shared_faults_merge_groups() {
        let (_clock, sched) = two_nodes();
        let a = fork_mm(&sched, 1, CpuMask::from_cpus([cpu(0)]), 256 * MB);
        let b = fork_mm(&sched, 2, CpuMask::from_cpus([cpu(2)]), 256 * MB);
        let shared = FaultFlags::TNF_SHARED;

        // b先建组，但a还没有组，不能合并
        sched.task_numa_fault(b, Some(a), node(0), 10, shared).unwrap();
        assert_eq!(sched.task_numa_group_info(b).unwrap(), Some((b, 1)));
        assert_eq!(sched.task_numa_group_info(a).unwrap(), None);

        // a建组；两个组一样大，后建的组不去合并先建的组
        sched.task_numa_fault(a, Some(b), node(0), 10, shared).unwrap();
        assert_eq!(sched.task_numa_group_info(a).unwrap(), Some((a, 1)));

        sched.task_numa_fault(b, Some(a), node(0), 10, shared).unwrap();
        assert_eq!(sched.task_numa_group_info(b).unwrap(), Some((a, 2)));
        assert_eq!(sched.task_numa_group_info(a).unwrap(), Some((a, 2)));

        sched.exit(b).unwrap();
        assert_eq!(sched.task_numa_group_info(a).unwrap(), Some((a, 1)));
    }

    #[test]
    fn faults_on_the_last_node_are_recorded() {
        let (_clock, sched) = two_nodes();
        let a = fork_mm(&sched, 1, CpuMask::from_cpus([cpu(2)]), 256 * MB);
        let b = fork_mm(&sched, 2, CpuMask::from_cpus([cpu(3)]), 256 * MB);
        sched.task_numa_fault(a, None, node(1), 3, FaultFlags::empty()).unwrap();
        sched.task_numa_fault(a, Some(b), node(1), 5, FaultFlags::TNF_NO_GROUP).unwrap();

        with_task(&sched, a, |n| {
            let f = n.faults.as_ref().unwrap();
            assert_eq!(f.len(), NR_NUMA_HINT_FAULT_TYPES * NR_NUMA_HINT_FAULT_STATS * 2);
            assert_eq!(f[faults_idx(NumaStat::MemBuf, 1, true, 2)], 3);
            assert_eq!(f[faults_idx(NumaStat::MemBuf, 1, false, 2)], 5);
            assert_eq!(f[faults_idx(NumaStat::CpuBuf, 1, true, 2)], 3);
            assert_eq!(f[faults_idx(NumaStat::CpuBuf, 1, false, 2)], 5);
            assert_eq!(n.faults_locality, [8, 0, 0]);
        });
        assert_eq!(sched.task_numa_group_info(a).unwrap(), None);
    }

    #[test]
    fn false_sharing_stays_private() {
        let (_clock, sched) = two_nodes();
        let a = fork_mm(&sched, 1, CpuMask::from_cpus([cpu(0)]), 256 * MB);
        let b = fork_mm(&sched, 2, CpuMask::from_cpus([cpu(2)]), 256 * MB);
        sched.task_numa_fault(a, Some(b), node(0), 10, FaultFlags::empty()).unwrap();
        sched.task_numa_fault(b, Some(a), node(0), 10, FaultFlags::empty()).unwrap();
        sched.task_numa_fault(a, Some(b), node(0), 10, FaultFlags::empty()).unwrap();
        assert_eq!(sched.task_numa_group_info(a).unwrap(), Some((a, 1)));
        assert_eq!(sched.task_numa_group_info(b).unwrap(), Some((b, 1)));
    }

    #[test]
    fn memory_follows_group_cpu_usage() {
        let (_clock, sched) = two_nodes();
        let a = fork_mm(&sched, 1, CpuMask::from_cpus([cpu(0)]), 256 * MB);
        let b = fork_mm(&sched, 2, CpuMask::from_cpus([cpu(2)]), 256 * MB);

        // 私有访问总是跟着任务走，但要求两次访问都来自目标节点
        assert!(sched.should_numa_migrate_memory(a, Some(a), None, node(1), cpu(0)).unwrap());
        assert!(!sched.should_numa_migrate_memory(a, Some(a), Some(node(1)), node(1), cpu(0)).unwrap());
        // 没有NUMA组时共享访问也迁移
        assert!(sched.should_numa_migrate_memory(a, Some(b), None, node(1), cpu(0)).unwrap());

        sched.task_numa_fault(a, Some(b), node(0), 10, FaultFlags::TNF_SHARED).unwrap();
        let g = with_task(&sched, a, |n| n.group.clone().unwrap());
        {
            let mut inner = g.inner.lock();
            let nr = 2;
            inner.faults[faults_idx(NumaStat::Cpu, 0, false, nr)] = 100;
            inner.faults[faults_idx(NumaStat::Cpu, 1, false, nr)] = 100;
            inner.faults[faults_idx(NumaStat::Mem, 0, false, nr)] = 100;
            inner.faults[faults_idx(NumaStat::Mem, 1, false, nr)] = 100;
        }
        // 两个节点上的使用相当，3/4的滞后阻止来回迁移
        assert!(!sched.should_numa_migrate_memory(a, Some(b), None, node(1), cpu(0)).unwrap());

        g.inner.lock().faults[faults_idx(NumaStat::Cpu, 0, false, 2)] = 500;
        assert!(sched.should_numa_migrate_memory(a, Some(b), None, node(1), cpu(0)).unwrap());
    }

    #[test]
    fn disabled_gate_ignores_faults() {
        let (_clock, sched) = two_nodes();
        let a = fork_mm(&sched, 1, CpuMask::first_n(4), 256 * MB);
        assert!(sched.numa_enabled());
        sched.set_numa_balancing(false).unwrap();
        assert!(!sched.numa_enabled());
        sched.task_numa_fault(a, None, node(1), 100, FaultFlags::empty()).unwrap();
        assert!(with_task(&sched, a, |n| n.faults.is_none()));

        sched.set_numa_balancing(true).unwrap();
        assert_eq!(
            sched.task_numa_fault(a, None, node(7), 1, FaultFlags::empty()),
            Err(SystemError::EINVAL)
        );
    }

    #[test]
    fn single_node_never_enables() {
        let clock = Arc::new(ManualClock::new(NSEC_PER_SEC));
        let sched = Scheduler::new(CpuTopology::flat(2), SchedConfig::default(), clock).unwrap();
        assert!(!sched.numa_enabled());
    }

    #[test]
    fn scan_period_adapts_to_locality() {
        let cfg = SchedConfig::default();
        let mut n = NumaTaskState::new(1 << 30);
        assert_eq!(n.scan_min(&cfg), 250);
        assert_eq!(n.scan_max(&cfg), 15000);

        // 全是私有故障，放慢扫描
        n.scan_period = 1000;
        n.faults_locality = [0, 100, 0];
        n.update_scan_period(0, 100, 0, &cfg);
        assert_eq!(n.scan_period, 1300);

        // 全是远端的共享故障，加快扫描
        n.scan_period = 1000;
        n.faults_locality = [100, 0, 0];
        n.update_scan_period(100, 0, 0, &cfg);
        assert_eq!(n.scan_period, 300);

        // 迁移失败时加倍
        n.scan_period = 1000;
        n.faults_locality = [0, 10, 5];
        n.update_scan_period(0, 10, 0, &cfg);
        assert_eq!(n.scan_period, 2000);
    }
}
