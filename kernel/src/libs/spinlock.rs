use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use system_error::SystemError;

/// 原始的Spinlock（自旋锁）
///
/// 内部的AtomicBool为false时表示没有被加锁，为true时表示已经被上锁。
/// 调度器的所有路径都不允许睡眠，因此这里只提供忙等的实现。
#[derive(Debug)]
pub struct RawSpinlock(AtomicBool);

impl RawSpinlock {
    pub const INIT: RawSpinlock = RawSpinlock(AtomicBool::new(false));

    /// 加锁
    pub fn lock(&self) {
        while !self.try_lock() {
            // 先只读地等待锁被释放，避免不停地抢占缓存行
            while self.is_locked() {
                spin_loop();
            }
        }
    }

    /// 尝试加锁，成功返回true
    pub fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// 实现了守卫的SpinLock, 能够支持内部可变性
#[derive(Debug)]
pub struct SpinLock<T> {
    lock: RawSpinlock,
    /// 自旋锁保护的数据
    data: UnsafeCell<T>,
}

/// SpinLock的守卫
///
/// 只能通过SpinLock的lock()系列方法获得，因此只要持有守卫，数据就在自旋锁的保护之下。
#[derive(Debug)]
pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
}

/// 向编译器保证，SpinLock在线程之间是安全的.
/// 其中要求类型T实现了Send这个Trait
unsafe impl<T> Sync for SpinLock<T> where T: Send {}
unsafe impl<T> Send for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        return Self {
            lock: RawSpinlock::INIT,
            data: UnsafeCell::new(value),
        };
    }

    #[inline(always)]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock.lock();
        return SpinLockGuard { lock: self };
    }

    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, SystemError> {
        if self.lock.try_lock() {
            return Ok(SpinLockGuard { lock: self });
        }
        return Err(SystemError::EAGAIN_OR_EWOULDBLOCK);
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// 按照固定的顺序（index从小到大）对两把锁加锁，避免两个CPU互相等待对方的锁
///
/// 返回的守卫顺序与参数顺序一致。两个index相同是调用者的错误。
pub fn double_lock<'a, T>(
    a: &'a SpinLock<T>,
    a_index: usize,
    b: &'a SpinLock<T>,
    b_index: usize,
) -> (SpinLockGuard<'a, T>, SpinLockGuard<'a, T>) {
    assert_ne!(a_index, b_index, "double_lock on the same lock");
    if a_index < b_index {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

/// 实现Deref trait，支持通过获取SpinLockGuard来获取临界区数据的不可变引用
impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        return unsafe { &*self.lock.data.get() };
    }
}

/// 实现DerefMut trait，支持通过获取SpinLockGuard来获取临界区数据的可变引用
impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        return unsafe { &mut *self.lock.data.get() };
    }
}

/// 守卫的生命周期结束时自动释放自旋锁
impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(0u32);
        let guard = lock.lock();
        assert_eq!(
            lock.try_lock().err(),
            Some(SystemError::EAGAIN_OR_EWOULDBLOCK)
        );
        drop(guard);
        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn double_lock_keeps_argument_order() {
        let a = SpinLock::new(1);
        let b = SpinLock::new(2);
        let (ga, gb) = double_lock(&a, 5, &b, 2);
        assert_eq!((*ga, *gb), (1, 2));
        assert!(a.is_locked() && b.is_locked());
        drop((ga, gb));
        assert!(!a.is_locked() && !b.is_locked());
    }

    #[test]
    fn counter_across_threads() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
