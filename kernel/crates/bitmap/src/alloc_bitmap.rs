use alloc::vec::Vec;

use crate::traits::BitMapOps;

const WORD_BITS: usize = u64::BITS as usize;

/// 在堆上分配存储空间的位图
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocBitmap {
    elements: usize,
    data: Vec<u64>,
}

impl AllocBitmap {
    pub fn new(elements: usize) -> Self {
        let words = elements.div_ceil(WORD_BITS);
        Self {
            elements,
            data: alloc::vec![0; words],
        }
    }

    #[inline]
    fn word_mask(&self, word: usize) -> u64 {
        let tail = self.elements - word * WORD_BITS;
        if tail >= WORD_BITS {
            u64::MAX
        } else {
            (1u64 << tail) - 1
        }
    }

    /// 从start（含）开始查找第一个值为value的位
    fn find_from(&self, start: usize, value: bool) -> Option<usize> {
        if start >= self.elements {
            return None;
        }
        let mut word = start / WORD_BITS;
        let mut bits = if value {
            self.data[word]
        } else {
            !self.data[word]
        };
        bits &= self.word_mask(word) & (u64::MAX << (start % WORD_BITS));
        loop {
            if bits != 0 {
                return Some(word * WORD_BITS + bits.trailing_zeros() as usize);
            }
            word += 1;
            if word >= self.data.len() {
                return None;
            }
            bits = if value {
                self.data[word]
            } else {
                !self.data[word]
            };
            bits &= self.word_mask(word);
        }
    }

    /// 按位与，两个位图的长度必须一致
    pub fn bitand_assign(&mut self, rhs: &Self) {
        for (l, r) in self.data.iter_mut().zip(rhs.data.iter()) {
            *l &= *r;
        }
    }

    /// 按位或，两个位图的长度必须一致
    pub fn bitor_assign(&mut self, rhs: &Self) {
        for (l, r) in self.data.iter_mut().zip(rhs.data.iter()) {
            *l |= *r;
        }
    }

    /// self中的位是否全部包含在rhs中
    pub fn is_subset_of(&self, rhs: &Self) -> bool {
        self.data
            .iter()
            .zip(rhs.data.iter())
            .all(|(l, r)| *l & !*r == 0)
    }

    /// 两个位图是否有交集
    pub fn intersects(&self, rhs: &Self) -> bool {
        self.data
            .iter()
            .zip(rhs.data.iter())
            .any(|(l, r)| *l & *r != 0)
    }
}

impl BitMapOps<usize> for AllocBitmap {
    fn get(&self, index: usize) -> Option<bool> {
        if index >= self.elements {
            return None;
        }
        Some(self.data[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0)
    }

    fn set(&mut self, index: usize, value: bool) -> Option<bool> {
        let prev = self.get(index)?;
        let bit = 1u64 << (index % WORD_BITS);
        if value {
            self.data[index / WORD_BITS] |= bit;
        } else {
            self.data[index / WORD_BITS] &= !bit;
        }
        Some(prev)
    }

    fn set_all(&mut self, value: bool) {
        let fill = if value { u64::MAX } else { 0 };
        for w in 0..self.data.len() {
            self.data[w] = fill & self.word_mask(w);
        }
    }

    fn len(&self) -> usize {
        self.elements
    }

    fn size(&self) -> usize {
        self.data.len() * core::mem::size_of::<u64>()
    }

    fn first_index(&self) -> Option<usize> {
        self.find_from(0, true)
    }

    fn first_false_index(&self) -> Option<usize> {
        self.find_from(0, false)
    }

    fn last_index(&self) -> Option<usize> {
        for w in (0..self.data.len()).rev() {
            let bits = self.data[w] & self.word_mask(w);
            if bits != 0 {
                return Some(w * WORD_BITS + (WORD_BITS - 1 - bits.leading_zeros() as usize));
            }
        }
        None
    }

    fn next_index(&self, index: usize) -> Option<usize> {
        self.find_from(index + 1, true)
    }

    fn next_false_index(&self, index: usize) -> Option<usize> {
        self.find_from(index + 1, false)
    }

    fn count_ones(&self) -> usize {
        self.data
            .iter()
            .enumerate()
            .map(|(w, bits)| (bits & self.word_mask(w)).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::AllocBitmap;
    use crate::traits::BitMapOps;

    #[test]
    fn scan_across_words() {
        let mut bmp = AllocBitmap::new(130);
        assert!(bmp.is_empty());
        assert_eq!(bmp.set(3, true), Some(false));
        assert_eq!(bmp.set(64, true), Some(false));
        assert_eq!(bmp.set(129, true), Some(false));
        assert_eq!(bmp.set(130, true), None);

        assert_eq!(bmp.first_index(), Some(3));
        assert_eq!(bmp.next_index(3), Some(64));
        assert_eq!(bmp.next_index(64), Some(129));
        assert_eq!(bmp.next_index(129), None);
        assert_eq!(bmp.last_index(), Some(129));
        assert_eq!(bmp.count_ones(), 3);
        assert_eq!(bmp.first_false_index(), Some(0));
    }

    #[test]
    fn set_all_respects_length() {
        let mut bmp = AllocBitmap::new(70);
        bmp.set_all(true);
        assert!(bmp.is_full());
        assert_eq!(bmp.count_ones(), 70);
        assert_eq!(bmp.last_index(), Some(69));
        assert_eq!(bmp.next_false_index(0), None);

        bmp.set(10, false);
        assert_eq!(bmp.first_false_index(), Some(10));
    }

    #[test]
    fn set_operations() {
        let mut a = AllocBitmap::new(16);
        let mut b = AllocBitmap::new(16);
        a.set(1, true);
        a.set(2, true);
        b.set(2, true);
        assert!(b.is_subset_of(&a));
        assert!(!a.is_subset_of(&b));
        assert!(a.intersects(&b));
        a.bitand_assign(&b);
        assert_eq!(a.count_ones(), 1);
        b.set(9, true);
        a.bitor_assign(&b);
        assert_eq!(a.first_index(), Some(2));
        assert_eq!(a.next_index(2), Some(9));
    }
}
