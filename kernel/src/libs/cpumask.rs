use core::ops::{BitAnd, BitOr};

use bitmap::{traits::BitMapOps, AllocBitmap};

use crate::smp::cpu::{ProcessorId, MAX_CPU_NUM};

/// CPU集合，底层是一个定长的位图
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CpuMask {
    bmp: AllocBitmap,
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl CpuMask {
    pub fn new() -> Self {
        let bmp = AllocBitmap::new(MAX_CPU_NUM);
        Self { bmp }
    }

    /// 包含[0, nr_cpus)的集合
    pub fn first_n(nr_cpus: usize) -> Self {
        let mut mask = Self::new();
        for i in 0..nr_cpus.min(MAX_CPU_NUM) {
            mask.set(ProcessorId::new(i as u32), true);
        }
        mask
    }

    pub fn from_cpus<I: IntoIterator<Item = ProcessorId>>(cpus: I) -> Self {
        let mut mask = Self::new();
        for cpu in cpus {
            mask.set(cpu, true);
        }
        mask
    }

    /// 获取CpuMask中的第一个cpu
    pub fn first(&self) -> Option<ProcessorId> {
        self.bmp
            .first_index()
            .map(|index| ProcessorId::new(index as u32))
    }

    /// 获取CpuMask中的最后一个被置位的cpu
    pub fn last(&self) -> Option<ProcessorId> {
        self.bmp
            .last_index()
            .map(|index| ProcessorId::new(index as u32))
    }

    /// 获取指定cpu之后第一个为1的位的cpu
    pub fn next_index(&self, cpu: ProcessorId) -> Option<ProcessorId> {
        self.bmp
            .next_index(cpu.data() as usize)
            .map(|index| ProcessorId::new(index as u32))
    }

    /// 设置cpu的值，返回设置前的值。cpu超出范围时返回None
    pub fn set(&mut self, cpu: ProcessorId, value: bool) -> Option<bool> {
        self.bmp.set(cpu.data() as usize, value)
    }

    pub fn get(&self, cpu: ProcessorId) -> Option<bool> {
        self.bmp.get(cpu.data() as usize)
    }

    pub fn contains(&self, cpu: ProcessorId) -> bool {
        self.get(cpu).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.bmp.is_empty()
    }

    /// 集合中cpu的数量
    pub fn weight(&self) -> usize {
        self.bmp.count_ones()
    }

    pub fn is_subset_of(&self, other: &CpuMask) -> bool {
        self.bmp.is_subset_of(&other.bmp)
    }

    pub fn intersects(&self, other: &CpuMask) -> bool {
        self.bmp.intersects(&other.bmp)
    }

    /// 从集合中移除other里的所有cpu
    pub fn andnot_assign(&mut self, other: &CpuMask) {
        for cpu in other.iter_cpu() {
            self.set(cpu, false);
        }
    }

    /// 迭代所有被置位的cpu
    pub fn iter_cpu(&self) -> CpuMaskIter<'_> {
        CpuMaskIter {
            mask: self,
            next: self.first(),
        }
    }
}

pub struct CpuMaskIter<'a> {
    mask: &'a CpuMask,
    next: Option<ProcessorId>,
}

impl<'a> Iterator for CpuMaskIter<'a> {
    type Item = ProcessorId;

    fn next(&mut self) -> Option<ProcessorId> {
        let cur = self.next?;
        self.next = self.mask.next_index(cur);
        Some(cur)
    }
}

impl BitAnd for &CpuMask {
    type Output = CpuMask;

    fn bitand(self, rhs: &CpuMask) -> CpuMask {
        let mut bmp = self.bmp.clone();
        bmp.bitand_assign(&rhs.bmp);
        CpuMask { bmp }
    }
}

impl BitOr for &CpuMask {
    type Output = CpuMask;

    fn bitor(self, rhs: &CpuMask) -> CpuMask {
        let mut bmp = self.bmp.clone();
        bmp.bitor_assign(&rhs.bmp);
        CpuMask { bmp }
    }
}

impl core::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.iter_cpu().map(|c| c.data()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_every_cpu_including_zero() {
        let mask = CpuMask::from_cpus([0, 3, 64].map(ProcessorId::new));
        let cpus: Vec<u32> = mask.iter_cpu().map(|c| c.data()).collect();
        assert_eq!(cpus, vec![0, 3, 64]);
        assert_eq!(mask.weight(), 3);
        assert_eq!(mask.last(), Some(ProcessorId::new(64)));
    }

    #[test]
    fn set_algebra() {
        let a = CpuMask::first_n(4);
        let b = CpuMask::from_cpus([2, 3, 4].map(ProcessorId::new));
        let and = &a & &b;
        assert_eq!(and.weight(), 2);
        assert!(and.is_subset_of(&a) && and.is_subset_of(&b));
        let or = &a | &b;
        assert_eq!(or.weight(), 5);

        let mut c = a.clone();
        c.andnot_assign(&b);
        assert_eq!(c, CpuMask::first_n(2));
        assert!(!c.intersects(&b));
        assert!(!c.contains(ProcessorId::new(9999)));
    }
}
