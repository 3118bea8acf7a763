/// 位图的通用操作
///
/// 下标从0开始，越界的访问返回`None`。
pub trait BitMapOps<T> {
    /// 获取指定index的位
    fn get(&self, index: usize) -> Option<bool>;

    /// 设置指定index的位，并返回该位之前的值
    fn set(&mut self, index: usize, value: bool) -> Option<bool>;

    /// 把所有位设置为value
    fn set_all(&mut self, value: bool);

    /// 位图中的位数
    fn len(&self) -> usize;

    /// 位图占用的字节数
    fn size(&self) -> usize;

    /// 第一个被置位的位
    fn first_index(&self) -> Option<usize>;

    /// 第一个未被置位的位
    fn first_false_index(&self) -> Option<usize>;

    /// 最后一个被置位的位
    fn last_index(&self) -> Option<usize>;

    /// index之后（不含index）第一个被置位的位
    fn next_index(&self, index: usize) -> Option<usize>;

    /// index之后（不含index）第一个未被置位的位
    fn next_false_index(&self, index: usize) -> Option<usize>;

    /// 被置位的位数
    fn count_ones(&self) -> usize;

    fn is_full(&self) -> bool {
        self.first_false_index().is_none()
    }

    fn is_empty(&self) -> bool {
        self.first_index().is_none()
    }
}
