//! 硬件拓扑描述
//!
//! 由平台代码在启动和热插拔时提供：每个CPU属于哪个物理核、哪个封装、哪个NUMA节点，
//! 以及节点之间的距离矩阵。调度域在此基础上构建，见[`crate::sched::topology`]。

use alloc::vec::Vec;

use system_error::SystemError;

use crate::libs::cpumask::CpuMask;

use super::cpu::{NodeId, ProcessorId, MAX_CPU_NUM, MAX_NUMNODES};

/// 节点到自身的距离
pub const LOCAL_DISTANCE: u32 = 10;
/// 未给出距离矩阵时，节点之间的默认距离
pub const REMOTE_DISTANCE: u32 = 20;

/// 单个逻辑CPU的拓扑信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTopoEntry {
    pub cpu: ProcessorId,
    /// 物理核id，同一个物理核上的逻辑CPU互为SMT兄弟
    pub core_id: u32,
    pub package_id: u32,
    pub node: NodeId,
    /// 该CPU原始的计算能力，满载为SCHED_CAPACITY_SCALE
    pub capacity: u64,
}

#[derive(Debug, Clone)]
pub struct CpuTopology {
    cpus: Vec<CpuTopoEntry>,
    node_distance: Vec<Vec<u32>>,
}

impl CpuTopology {
    /// 从逐个CPU的描述和距离矩阵构造拓扑，并检查其一致性
    pub fn new(mut cpus: Vec<CpuTopoEntry>, node_distance: Vec<Vec<u32>>) -> Result<Self, SystemError> {
        if cpus.is_empty() || cpus.len() > MAX_CPU_NUM {
            return Err(SystemError::EINVAL);
        }
        cpus.sort_by_key(|e| e.cpu);
        for (i, e) in cpus.iter().enumerate() {
            // cpu id 必须从0开始连续编号
            if e.cpu.index() != i || e.capacity == 0 {
                return Err(SystemError::EINVAL);
            }
        }

        let nr_nodes = cpus.iter().map(|e| e.node.index() + 1).max().unwrap_or(1);
        if nr_nodes > MAX_NUMNODES {
            return Err(SystemError::EINVAL);
        }
        let node_distance = if node_distance.is_empty() {
            (0..nr_nodes)
                .map(|a| {
                    (0..nr_nodes)
                        .map(|b| if a == b { LOCAL_DISTANCE } else { REMOTE_DISTANCE })
                        .collect()
                })
                .collect()
        } else {
            node_distance
        };
        if node_distance.len() < nr_nodes || node_distance.iter().any(|row| row.len() != node_distance.len()) {
            return Err(SystemError::EINVAL);
        }
        for (a, row) in node_distance.iter().enumerate() {
            if row[a] != LOCAL_DISTANCE {
                return Err(SystemError::EINVAL);
            }
            if row.iter().enumerate().any(|(b, d)| b != a && *d <= LOCAL_DISTANCE) {
                return Err(SystemError::EINVAL);
            }
        }

        Ok(Self {
            cpus,
            node_distance,
        })
    }

    /// 单节点、单封装、没有SMT的拓扑
    pub fn flat(nr_cpus: usize) -> Self {
        Self::uniform(1, nr_cpus.max(1), 1, Vec::new())
    }

    /// 单节点，每个物理核上有threads个逻辑CPU
    pub fn smt(nr_cores: usize, threads: usize) -> Self {
        Self::uniform(1, nr_cores.max(1), threads.max(1), Vec::new())
    }

    /// nr_nodes个节点，每个节点一个封装，每个封装cpus_per_node个核
    pub fn numa(nr_nodes: usize, cpus_per_node: usize, node_distance: Vec<Vec<u32>>) -> Result<Self, SystemError> {
        let topo = Self::uniform(nr_nodes.max(1), cpus_per_node.max(1), 1, node_distance);
        Self::new(topo.cpus, topo.node_distance)
    }

    fn uniform(nr_nodes: usize, cores_per_node: usize, threads: usize, node_distance: Vec<Vec<u32>>) -> Self {
        let mut cpus = Vec::new();
        let per_node = cores_per_node * threads;
        for node in 0..nr_nodes {
            for c in 0..per_node {
                let id = node * per_node + c;
                cpus.push(CpuTopoEntry {
                    cpu: ProcessorId::new(id as u32),
                    core_id: (node * cores_per_node + c / threads) as u32,
                    package_id: node as u32,
                    node: NodeId::new(node as u16),
                    capacity: crate::sched::SCHED_CAPACITY_SCALE,
                });
            }
        }
        let node_distance = if node_distance.is_empty() {
            (0..nr_nodes)
                .map(|a| {
                    (0..nr_nodes)
                        .map(|b| if a == b { LOCAL_DISTANCE } else { REMOTE_DISTANCE })
                        .collect()
                })
                .collect()
        } else {
            node_distance
        };
        Self {
            cpus,
            node_distance,
        }
    }

    /// 修改某个CPU的原始算力（大小核）
    pub fn set_capacity(&mut self, cpu: ProcessorId, capacity: u64) -> Result<(), SystemError> {
        let e = self.cpus.get_mut(cpu.index()).ok_or(SystemError::EINVAL)?;
        if capacity == 0 {
            return Err(SystemError::EINVAL);
        }
        e.capacity = capacity;
        Ok(())
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn nr_nodes(&self) -> usize {
        self.node_distance.len()
    }

    pub fn entry(&self, cpu: ProcessorId) -> Option<&CpuTopoEntry> {
        self.cpus.get(cpu.index())
    }

    pub fn entries(&self) -> &[CpuTopoEntry] {
        &self.cpus
    }

    pub fn cpu_to_node(&self, cpu: ProcessorId) -> NodeId {
        self.entry(cpu).map(|e| e.node).unwrap_or(NodeId::new(0))
    }

    pub fn node_distance(&self, a: NodeId, b: NodeId) -> u32 {
        self.node_distance
            .get(a.index())
            .and_then(|row| row.get(b.index()))
            .copied()
            .unwrap_or(REMOTE_DISTANCE)
    }

    pub fn cpus_of_node(&self, node: NodeId) -> CpuMask {
        CpuMask::from_cpus(self.cpus.iter().filter(|e| e.node == node).map(|e| e.cpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_distance_tables() {
        let cpus = CpuTopology::flat(2).entries().to_vec();
        assert!(CpuTopology::new(cpus.clone(), vec![vec![10]]).is_ok());
        assert_eq!(
            CpuTopology::new(cpus.clone(), vec![vec![12]]).err(),
            Some(SystemError::EINVAL)
        );
        assert!(CpuTopology::numa(2, 2, vec![vec![10, 10], vec![10, 10]]).is_err());
    }

    #[test]
    fn numa_layout() {
        let topo = CpuTopology::numa(2, 2, vec![vec![10, 21], vec![21, 10]]).unwrap();
        assert_eq!(topo.nr_cpus(), 4);
        assert_eq!(topo.cpu_to_node(ProcessorId::new(3)), NodeId::new(1));
        assert_eq!(topo.node_distance(NodeId::new(0), NodeId::new(1)), 21);
        assert_eq!(topo.cpus_of_node(NodeId::new(1)).weight(), 2);
    }

    #[test]
    fn smt_siblings_share_core() {
        let topo = CpuTopology::smt(2, 2);
        let e = topo.entries();
        assert_eq!(e[0].core_id, e[1].core_id);
        assert_ne!(e[1].core_id, e[2].core_id);
    }
}
