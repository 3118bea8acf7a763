use alloc::collections::BTreeMap;
use core::ops::Bound::{Excluded, Unbounded};

/// 时间线中一个节点的键：(vruntime, 插入序号)
///
/// vruntime相同时，后插入的排在右边。
pub type TimelineKey = (u64, u64);

/// 按vruntime排序的可运行实体集合
///
/// 插入、删除为O(log n)，最左节点被缓存，读取为O(1)。
/// 实体在时间线中时其vruntime不会变化（正在运行的实体不在时间线中），
/// 因此键中的vruntime就是实体当前的vruntime。
#[derive(Debug)]
pub struct Timeline<V: Copy> {
    tree: BTreeMap<TimelineKey, V>,
    leftmost: Option<(TimelineKey, V)>,
    seq: u64,
}

impl<V: Copy + PartialEq> Default for Timeline<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Copy + PartialEq> Timeline<V> {
    pub const fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
            leftmost: None,
            seq: 0,
        }
    }

    /// 插入一个节点，返回的键用于之后的删除
    pub fn insert(&mut self, vruntime: u64, value: V) -> TimelineKey {
        let key = (vruntime, self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.tree.insert(key, value);
        match self.leftmost {
            Some((lk, _)) if lk <= key => {}
            _ => self.leftmost = Some((key, value)),
        }
        key
    }

    /// 删除一个节点
    pub fn remove(&mut self, key: &TimelineKey) -> Option<V> {
        let v = self.tree.remove(key)?;
        if matches!(self.leftmost, Some((lk, _)) if lk == *key) {
            self.leftmost = self.tree.iter().next().map(|(k, v)| (*k, *v));
        }
        Some(v)
    }

    /// vruntime最小的节点
    #[inline]
    pub fn leftmost(&self) -> Option<(TimelineKey, V)> {
        self.leftmost
    }

    /// vruntime最大的节点
    pub fn rightmost(&self) -> Option<(TimelineKey, V)> {
        self.tree.iter().next_back().map(|(k, v)| (*k, *v))
    }

    /// 紧跟在key之后的节点
    pub fn next_after(&self, key: &TimelineKey) -> Option<(TimelineKey, V)> {
        self.tree
            .range((Excluded(*key), Unbounded))
            .next()
            .map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// 从左到右遍历
    pub fn iter(&self) -> impl Iterator<Item = (&TimelineKey, &V)> {
        self.tree.iter()
    }

    pub fn contains(&self, key: &TimelineKey) -> bool {
        self.tree.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::Timeline;

    #[test]
    fn leftmost_is_cached_across_removals() {
        let mut tl = Timeline::new();
        let k30 = tl.insert(30, 'c');
        let k10 = tl.insert(10, 'a');
        let k20 = tl.insert(20, 'b');
        assert_eq!(tl.leftmost().map(|(_, v)| v), Some('a'));

        assert_eq!(tl.remove(&k10), Some('a'));
        assert_eq!(tl.leftmost().map(|(_, v)| v), Some('b'));
        assert_eq!(tl.remove(&k10), None);

        assert_eq!(tl.next_after(&k20).map(|(_, v)| v), Some('c'));
        assert_eq!(tl.rightmost().map(|(_, v)| v), Some('c'));
        tl.remove(&k20);
        tl.remove(&k30);
        assert!(tl.leftmost().is_none());
        assert!(tl.is_empty());
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let mut tl = Timeline::new();
        tl.insert(5, 1);
        tl.insert(5, 2);
        tl.insert(5, 3);
        let order: Vec<i32> = tl.iter().map(|(_, v)| *v).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(tl.leftmost().map(|(_, v)| v), Some(1));
    }
}
