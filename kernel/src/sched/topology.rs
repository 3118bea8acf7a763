//! 调度域
//!
//! 每个在线CPU自下而上有一串调度域：SMT（同一物理核）、MC（同一封装和节点）、
//! 以及按节点距离划分的若干NUMA层。每个调度域把它的范围划分为若干调度组，
//! 负载均衡在调度组之间进行。
//!
//! 整个拓扑是一个只读快照，只在CPU上下线时重建。调度组的算力以及每个调度域的
//! 均衡间隔、失败计数等运行时状态用原子变量保存，因此快照可以被所有CPU无锁共享。

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use crate::{
    libs::cpumask::CpuMask,
    smp::{
        cpu::{NodeId, ProcessorId},
        topology::{CpuTopology, LOCAL_DISTANCE},
    },
};

use super::{NSEC_PER_MSEC, SCHED_CAPACITY_SCALE};

bitflags! {
    pub struct SdFlags: u32 {
        /// 在这一层做负载均衡
        const SD_LOAD_BALANCE = 0x0001;
        /// CPU变为空闲时在这一层拉任务
        const SD_BALANCE_NEWIDLE = 0x0002;
        const SD_BALANCE_EXEC = 0x0004;
        /// fork时在这一层选择最空闲的CPU
        const SD_BALANCE_FORK = 0x0008;
        const SD_BALANCE_WAKE = 0x0010;
        /// 唤醒时可以把任务拉到唤醒者所在的CPU
        const SD_WAKE_AFFINE = 0x0020;
        /// 域内的CPU共享算力（SMT）
        const SD_SHARE_CPUCAPACITY = 0x0080;
        /// 域内的CPU共享缓存
        const SD_SHARE_PKG_RESOURCES = 0x0200;
        /// 同一时刻只有一个CPU在这一层做均衡
        const SD_SERIALIZE = 0x0400;
        /// 优先把任务分散到兄弟调度组
        const SD_PREFER_SIBLING = 0x1000;
        const SD_NUMA = 0x4000;
    }
}

/// 节点之间超过这个距离时，fork/exec以及唤醒时不跨节点放置任务
pub const NODE_RECLAIM_DISTANCE: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SdLevel {
    Smt,
    Mc,
    /// 按距离划分的NUMA层，值为这一层覆盖的最大节点距离
    Numa(u32),
}

impl SdLevel {
    pub fn name(&self) -> &'static str {
        match self {
            SdLevel::Smt => "SMT",
            SdLevel::Mc => "MC",
            SdLevel::Numa(_) => "NUMA",
        }
    }
}

/// NUMA节点之间的连接方式，决定首选节点的打分方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumaTopologyType {
    /// 所有节点两两直连
    Direct,
    /// 部分节点之间需要经过中间节点
    GluelessMesh,
    /// 节点分成若干簇，簇之间通过背板相连
    Backplane,
}

/// 调度组：调度域范围的一个划分
///
/// 同一层上范围相同的调度组在所有CPU之间共享，算力由组内负责均衡的CPU刷新。
#[derive(Debug)]
pub struct SchedGroup {
    pub span: CpuMask,
    capacity: AtomicU64,
    min_capacity: AtomicU64,
    /// 上一轮均衡中组内有CPU因为亲和性无法被平衡
    imbalance: AtomicBool,
}

impl SchedGroup {
    fn new(span: CpuMask, capacity: u64) -> Self {
        Self {
            span,
            capacity: AtomicU64::new(capacity),
            min_capacity: AtomicU64::new(SCHED_CAPACITY_SCALE),
            imbalance: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn min_capacity(&self) -> u64 {
        self.min_capacity.load(Ordering::Relaxed)
    }

    pub(crate) fn set_capacity(&self, capacity: u64, min_capacity: u64) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
        self.min_capacity.store(min_capacity.max(1), Ordering::Relaxed);
    }

    #[inline]
    pub fn imbalance(&self) -> bool {
        self.imbalance.load(Ordering::Relaxed)
    }

    pub(crate) fn set_imbalance(&self, v: bool) {
        self.imbalance.store(v, Ordering::Relaxed);
    }

    pub fn weight(&self) -> usize {
        self.span.weight()
    }

    /// 组内第一个CPU
    pub fn first_cpu(&self) -> ProcessorId {
        self.span.first().unwrap_or(ProcessorId::INVALID)
    }
}

/// 负载均衡统计，按空闲类型分别计数
#[derive(Debug, Default)]
pub struct LbCounters {
    pub lb_count: AtomicU64,
    pub lb_failed: AtomicU64,
    pub lb_balanced: AtomicU64,
    pub lb_gained: AtomicU64,
    pub lb_nobusyg: AtomicU64,
    pub lb_nobusyq: AtomicU64,
    pub alb_pushed: AtomicU64,
}

/// 某个CPU在某一层的调度域
#[derive(Debug)]
pub struct SchedDomain {
    pub level: SdLevel,
    pub span: CpuMask,
    pub flags: SdFlags,
    /// 两个组的负载之比超过这个百分比才认为不平衡
    pub imbalance_pct: u32,
    /// 多少次均衡失败之后允许迁移缓存热的任务
    pub cache_nice_tries: u32,
    /// CPU忙碌时均衡间隔放大的倍数
    pub busy_factor: u32,
    /// 均衡间隔的范围，毫秒
    pub min_interval: u64,
    pub max_interval: u64,
    pub groups: Vec<Arc<SchedGroup>>,
    /// 本CPU所在的调度组在groups中的下标
    pub local_group: usize,

    /// 当前的均衡间隔，毫秒
    pub balance_interval: AtomicU64,
    pub nr_balance_failed: AtomicU32,
    /// 上一次在这一层做均衡的时间
    pub last_balance: AtomicU64,
    /// newidle均衡在这一层花费的最大时间，会随时间衰减
    pub max_newidle_lb_cost: AtomicU64,
    pub next_decay_max_lb_cost: AtomicU64,
    pub stats: LbCounters,
}

impl SchedDomain {
    #[inline]
    pub fn weight(&self) -> usize {
        self.span.weight()
    }

    #[inline]
    pub fn has(&self, flag: SdFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn local(&self) -> &Arc<SchedGroup> {
        &self.groups[self.local_group]
    }

    /// 当前的均衡间隔，纳秒。CPU忙碌时放大busy_factor倍
    pub fn get_interval(&self, cpu_busy: bool) -> u64 {
        let mut interval = self.balance_interval.load(Ordering::Relaxed);
        if cpu_busy {
            interval *= self.busy_factor as u64;
        }
        interval.max(1) * NSEC_PER_MSEC
    }
}

/// 一个CPU的调度域链，以及一些常用的快捷信息
#[derive(Debug)]
pub struct CpuDomains {
    pub cpu: ProcessorId,
    /// 自底向上排列
    pub domains: Vec<SchedDomain>,
    /// 共享缓存的最高一层在domains中的下标
    pub sd_llc: Option<usize>,
    /// 最后一级缓存的代表CPU（范围内的第一个CPU），以及范围的大小
    pub llc_id: ProcessorId,
    pub llc_size: usize,
    /// 最低的NUMA层
    pub sd_numa: Option<usize>,
}

impl CpuDomains {
    pub fn llc_domain(&self) -> Option<&SchedDomain> {
        self.sd_llc.map(|i| &self.domains[i])
    }
}

/// 调度域拓扑的快照
#[derive(Debug)]
pub struct SchedDomainTopology {
    pub cpu_topo: CpuTopology,
    pub online: CpuMask,
    cpus: Vec<Option<CpuDomains>>,
    pub numa_type: NumaTopologyType,
    /// 从小到大排列的不同节点距离（含本地距离）
    pub numa_distances: Vec<u32>,
}

impl SchedDomainTopology {
    /// 没有任何调度域的拓扑，在第一次构建之前使用
    pub fn empty(cpu_topo: CpuTopology) -> Self {
        Self {
            cpu_topo,
            online: CpuMask::new(),
            cpus: Vec::new(),
            numa_type: NumaTopologyType::Direct,
            numa_distances: alloc::vec![LOCAL_DISTANCE],
        }
    }

    /// ## 为在线的CPU构建调度域
    pub fn build(cpu_topo: &CpuTopology, online: &CpuMask) -> Self {
        let numa_distances = Self::distinct_distances(cpu_topo);
        let numa_type = Self::numa_topology_type(cpu_topo, &numa_distances);

        let mut cpus: Vec<Option<CpuDomains>> = (0..cpu_topo.nr_cpus()).map(|_| None).collect();
        // 同一层上范围相同的调度组共享
        let mut shared: BTreeMap<(SdLevel, ProcessorId), Arc<SchedGroup>> = BTreeMap::new();

        for cpu in online.iter_cpu() {
            if cpu.index() >= cpu_topo.nr_cpus() {
                continue;
            }
            let spans = Self::level_spans(cpu_topo, online, cpu, &numa_distances);
            let spans = Self::remove_degenerate(spans);
            let domains = Self::build_domains(cpu_topo, online, cpu, spans, &numa_distances, &mut shared);

            let sd_llc = domains
                .iter()
                .rposition(|sd| sd.has(SdFlags::SD_SHARE_PKG_RESOURCES));
            let (llc_id, llc_size) = match sd_llc {
                Some(i) => (
                    domains[i].span.first().unwrap_or(cpu),
                    domains[i].weight(),
                ),
                None => (cpu, 1),
            };
            let sd_numa = domains.iter().position(|sd| sd.has(SdFlags::SD_NUMA));

            cpus[cpu.index()] = Some(CpuDomains {
                cpu,
                domains,
                sd_llc,
                llc_id,
                llc_size,
                sd_numa,
            });
        }

        let topo = Self {
            cpu_topo: cpu_topo.clone(),
            online: online.clone(),
            cpus,
            numa_type,
            numa_distances,
        };
        log::info!(
            "sched domains rebuilt: {} cpus online, numa type {:?}",
            online.weight(),
            topo.numa_type
        );
        topo
    }

    fn distinct_distances(cpu_topo: &CpuTopology) -> Vec<u32> {
        let n = cpu_topo.nr_nodes();
        let mut d: Vec<u32> = alloc::vec![LOCAL_DISTANCE];
        for a in 0..n {
            for b in 0..n {
                d.push(cpu_topo.node_distance(NodeId::new(a as u16), NodeId::new(b as u16)));
            }
        }
        d.sort_unstable();
        d.dedup();
        d
    }

    /// ## 判断NUMA节点之间的连接方式
    ///
    /// 找到距离最远的两个节点，如果存在一个与两者都更近的中间节点，说明是网状连接，否则是背板连接。
    fn numa_topology_type(cpu_topo: &CpuTopology, distances: &[u32]) -> NumaTopologyType {
        if distances.len() <= 2 {
            return NumaTopologyType::Direct;
        }
        let max = distances.last().copied().unwrap_or(LOCAL_DISTANCE);
        let n = cpu_topo.nr_nodes() as u16;
        for a in 0..n {
            for b in 0..n {
                let (a, b) = (NodeId::new(a), NodeId::new(b));
                if cpu_topo.node_distance(a, b) < max {
                    continue;
                }
                for c in 0..n {
                    let c = NodeId::new(c);
                    if cpu_topo.node_distance(a, c) < max && cpu_topo.node_distance(b, c) < max {
                        return NumaTopologyType::GluelessMesh;
                    }
                }
                return NumaTopologyType::Backplane;
            }
        }
        NumaTopologyType::Direct
    }

    /// 每一层的范围，自底向上
    fn level_spans(
        cpu_topo: &CpuTopology,
        online: &CpuMask,
        cpu: ProcessorId,
        distances: &[u32],
    ) -> Vec<(SdLevel, CpuMask)> {
        let me = match cpu_topo.entry(cpu) {
            Some(e) => *e,
            None => return Vec::new(),
        };
        let online_entries = || {
            cpu_topo
                .entries()
                .iter()
                .filter(move |e| online.contains(e.cpu))
        };

        let mut spans = Vec::new();
        spans.push((
            SdLevel::Smt,
            CpuMask::from_cpus(
                online_entries()
                    .filter(|e| e.core_id == me.core_id && e.package_id == me.package_id)
                    .map(|e| e.cpu),
            ),
        ));
        spans.push((
            SdLevel::Mc,
            CpuMask::from_cpus(
                online_entries()
                    .filter(|e| e.package_id == me.package_id && e.node == me.node)
                    .map(|e| e.cpu),
            ),
        ));
        for d in distances.iter().copied().filter(|d| *d > LOCAL_DISTANCE) {
            spans.push((
                SdLevel::Numa(d),
                CpuMask::from_cpus(
                    online_entries()
                        .filter(|e| cpu_topo.node_distance(me.node, e.node) <= d)
                        .map(|e| e.cpu),
                ),
            ));
        }
        spans
    }

    /// 去掉没有意义的层：只有一个CPU的层，以及与下一层范围相同的层
    fn remove_degenerate(spans: Vec<(SdLevel, CpuMask)>) -> Vec<(SdLevel, CpuMask)> {
        let mut out: Vec<(SdLevel, CpuMask)> = Vec::new();
        for (level, span) in spans {
            if span.weight() <= 1 {
                continue;
            }
            if let Some((_, child)) = out.last() {
                if *child == span {
                    continue;
                }
            }
            out.push((level, span));
        }
        out
    }

    fn build_domains(
        cpu_topo: &CpuTopology,
        online: &CpuMask,
        cpu: ProcessorId,
        spans: Vec<(SdLevel, CpuMask)>,
        distances: &[u32],
        shared: &mut BTreeMap<(SdLevel, ProcessorId), Arc<SchedGroup>>,
    ) -> Vec<SchedDomain> {
        let mut domains: Vec<SchedDomain> = Vec::with_capacity(spans.len());
        for (idx, (level, span)) in spans.iter().enumerate() {
            let child_span = |c: ProcessorId| -> CpuMask {
                if idx == 0 {
                    return CpuMask::from_cpus([c]);
                }
                // 子层的范围对范围内的每个CPU按同样的规则计算
                let child_spans = Self::remove_degenerate(Self::level_spans(cpu_topo, online, c, distances));
                let child_level = spans[idx - 1].0;
                child_spans
                    .into_iter()
                    .filter(|(l, _)| *l <= child_level)
                    .last()
                    .map(|(_, s)| &s & span)
                    .unwrap_or_else(|| CpuMask::from_cpus([c]))
            };

            let mut covered = CpuMask::new();
            let mut groups = Vec::new();
            let mut local_group = 0;
            for c in span.iter_cpu() {
                if covered.contains(c) {
                    continue;
                }
                let gspan = child_span(c);
                let first = gspan.first().unwrap_or(c);
                let cap: u64 = gspan
                    .iter_cpu()
                    .filter_map(|g| cpu_topo.entry(g))
                    .map(|e| e.capacity)
                    .sum();
                let group = shared
                    .entry((*level, first))
                    .or_insert_with(|| Arc::new(SchedGroup::new(gspan.clone(), cap)))
                    .clone();
                if group.span.contains(cpu) {
                    local_group = groups.len();
                }
                covered = &covered | &group.span;
                groups.push(group);
            }

            domains.push(Self::sd_init(*level, span.clone(), groups, local_group));
        }
        domains
    }

    fn sd_init(level: SdLevel, span: CpuMask, groups: Vec<Arc<SchedGroup>>, local_group: usize) -> SchedDomain {
        let weight = span.weight() as u64;
        let mut flags = SdFlags::SD_LOAD_BALANCE
            | SdFlags::SD_BALANCE_NEWIDLE
            | SdFlags::SD_BALANCE_EXEC
            | SdFlags::SD_BALANCE_FORK
            | SdFlags::SD_WAKE_AFFINE
            | SdFlags::SD_PREFER_SIBLING;
        let mut imbalance_pct = 125;
        let cache_nice_tries;

        match level {
            SdLevel::Smt => {
                flags |= SdFlags::SD_SHARE_CPUCAPACITY | SdFlags::SD_SHARE_PKG_RESOURCES;
                flags.remove(SdFlags::SD_PREFER_SIBLING);
                imbalance_pct = 110;
                cache_nice_tries = 0;
            }
            SdLevel::Mc => {
                flags |= SdFlags::SD_SHARE_PKG_RESOURCES;
                imbalance_pct = 117;
                cache_nice_tries = 1;
            }
            SdLevel::Numa(distance) => {
                flags |= SdFlags::SD_NUMA | SdFlags::SD_SERIALIZE;
                flags.remove(SdFlags::SD_PREFER_SIBLING);
                if distance > NODE_RECLAIM_DISTANCE {
                    flags.remove(SdFlags::SD_BALANCE_EXEC | SdFlags::SD_BALANCE_FORK | SdFlags::SD_WAKE_AFFINE);
                }
                cache_nice_tries = 2;
            }
        }

        SchedDomain {
            level,
            span,
            flags,
            imbalance_pct,
            cache_nice_tries,
            busy_factor: 32,
            min_interval: weight,
            max_interval: 2 * weight,
            groups,
            local_group,
            balance_interval: AtomicU64::new(weight),
            nr_balance_failed: AtomicU32::new(0),
            last_balance: AtomicU64::new(0),
            max_newidle_lb_cost: AtomicU64::new(0),
            next_decay_max_lb_cost: AtomicU64::new(0),
            stats: LbCounters::default(),
        }
    }

    pub fn domains(&self, cpu: ProcessorId) -> &[SchedDomain] {
        self.cpus
            .get(cpu.index())
            .and_then(|d| d.as_ref())
            .map(|d| d.domains.as_slice())
            .unwrap_or(&[])
    }

    pub fn cpu_domains(&self, cpu: ProcessorId) -> Option<&CpuDomains> {
        self.cpus.get(cpu.index()).and_then(|d| d.as_ref())
    }

    /// 两个CPU是否共享最后一级缓存
    pub fn cpus_share_cache(&self, a: ProcessorId, b: ProcessorId) -> bool {
        if a == b {
            return true;
        }
        match (self.cpu_domains(a), self.cpu_domains(b)) {
            (Some(x), Some(y)) => x.llc_id == y.llc_id,
            _ => false,
        }
    }

    pub fn llc_size(&self, cpu: ProcessorId) -> usize {
        self.cpu_domains(cpu).map(|d| d.llc_size).unwrap_or(1)
    }

    pub fn cpu_to_node(&self, cpu: ProcessorId) -> NodeId {
        self.cpu_topo.cpu_to_node(cpu)
    }

    pub fn node_distance(&self, a: NodeId, b: NodeId) -> u32 {
        self.cpu_topo.node_distance(a, b)
    }

    pub fn max_numa_distance(&self) -> u32 {
        self.numa_distances.last().copied().unwrap_or(LOCAL_DISTANCE)
    }

    pub fn nr_nodes(&self) -> usize {
        self.cpu_topo.nr_nodes()
    }

    /// 节点上在线的CPU
    pub fn node_cpus(&self, node: NodeId) -> CpuMask {
        &self.cpu_topo.cpus_of_node(node) & &self.online
    }

    /// 原始算力
    pub fn cpu_capacity_orig(&self, cpu: ProcessorId) -> u64 {
        self.cpu_topo
            .entry(cpu)
            .map(|e| e.capacity)
            .unwrap_or(SCHED_CAPACITY_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_topology_has_one_mc_level() {
        let topo = CpuTopology::flat(4);
        let sdt = SchedDomainTopology::build(&topo, &CpuMask::first_n(4));
        let d = sdt.domains(ProcessorId::new(2));
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].level, SdLevel::Mc);
        assert_eq!(d[0].groups.len(), 4);
        assert_eq!(d[0].local().first_cpu(), ProcessorId::new(2));
        assert_eq!(sdt.llc_size(ProcessorId::new(0)), 4);
        assert!(sdt.cpus_share_cache(ProcessorId::new(0), ProcessorId::new(3)));
        assert_eq!(sdt.numa_type, NumaTopologyType::Direct);
    }

    #[test]
    fn smt_groups_are_shared_between_siblings() {
        let topo = CpuTopology::smt(2, 2);
        let sdt = SchedDomainTopology::build(&topo, &CpuMask::first_n(4));
        let d0 = sdt.domains(ProcessorId::new(0));
        let d1 = sdt.domains(ProcessorId::new(1));
        assert_eq!(d0.len(), 2);
        assert_eq!(d0[0].level, SdLevel::Smt);
        assert_eq!(d0[1].groups.len(), 2);
        assert!(Arc::ptr_eq(&d0[1].groups[0], &d1[1].groups[0]));
        assert_eq!(d0[1].groups[1].weight(), 2);
        assert_eq!(d0[1].groups[1].capacity(), 2 * SCHED_CAPACITY_SCALE);
    }

    #[test]
    fn numa_levels_follow_distance() {
        let dist = alloc::vec![
            alloc::vec![10, 20, 30],
            alloc::vec![20, 10, 20],
            alloc::vec![30, 20, 10],
        ];
        let topo = CpuTopology::numa(3, 2, dist).unwrap();
        let sdt = SchedDomainTopology::build(&topo, &CpuMask::first_n(6));
        let d = sdt.domains(ProcessorId::new(0));
        let levels: Vec<SdLevel> = d.iter().map(|sd| sd.level).collect();
        assert_eq!(levels, alloc::vec![SdLevel::Mc, SdLevel::Numa(20), SdLevel::Numa(30)]);
        assert_eq!(d[1].weight(), 4);
        assert_eq!(d[2].weight(), 6);
        assert_eq!(sdt.numa_type, NumaTopologyType::GluelessMesh);
        assert!(d[1].has(SdFlags::SD_NUMA));
    }

    #[test]
    fn offline_cpus_are_left_out() {
        let topo = CpuTopology::flat(4);
        let mut online = CpuMask::first_n(4);
        online.set(ProcessorId::new(3), false);
        let sdt = SchedDomainTopology::build(&topo, &online);
        assert!(sdt.domains(ProcessorId::new(3)).is_empty());
        assert_eq!(sdt.domains(ProcessorId::new(0))[0].weight(), 3);
    }
}
