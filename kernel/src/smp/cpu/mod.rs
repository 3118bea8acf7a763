/// 支持的最大CPU数量，CpuMask的位图按这个大小分配
pub const MAX_CPU_NUM: usize = 256;

/// 支持的最大NUMA节点数量
pub const MAX_NUMNODES: usize = 64;

int_like!(ProcessorId, AtomicProcessorId, u32, AtomicU32);
int_like!(NodeId, AtomicNodeId, u16, AtomicU16);

impl ProcessorId {
    pub const INVALID: ProcessorId = ProcessorId::new(u32::MAX);

    #[inline]
    pub const fn index(&self) -> usize {
        self.data() as usize
    }
}

impl NodeId {
    pub const NUMA_NO_NODE: NodeId = NodeId::new(u16::MAX);

    #[inline]
    pub const fn index(&self) -> usize {
        self.data() as usize
    }
}

#[cfg(test)]
mod tests {
    use core::{mem::size_of, sync::atomic::Ordering};

    use super::*;

    #[test]
    fn atomic_ids_match_their_backing_width() {
        assert_eq!(size_of::<AtomicProcessorId>(), 4);
        assert_eq!(size_of::<AtomicNodeId>(), 2);

        let nid = AtomicNodeId::new(NodeId::NUMA_NO_NODE);
        nid.store(NodeId::new(3), Ordering::Relaxed);
        assert_eq!(nid.load(Ordering::Relaxed).index(), 3);
        let cpu = AtomicProcessorId::new(ProcessorId::new(1));
        assert_eq!(cpu.swap(ProcessorId::INVALID, Ordering::Relaxed), ProcessorId::new(1));
        assert_eq!(cpu.load(Ordering::Relaxed), ProcessorId::INVALID);
    }
}
