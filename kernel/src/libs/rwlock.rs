use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use system_error::SystemError;

/// WRITER位占据最右边的比特位，其余的比特位存储READER的数量
const WRITER: u32 = 1;
const READER: u32 = 1 << 1;

/// 读多写少的读写锁
///
/// 用于调度域拓扑、调参快照和任务组树：读者在调度路径上频繁出现，而写者只在热插拔、
/// 重新配置或创建/销毁任务组时出现。写者在等待期间会阻止新的读者进入。
#[derive(Debug)]
pub struct RwLock<T> {
    lock: AtomicU32,
    /// 有写者在等待
    writer_pending: AtomicU32,
    data: UnsafeCell<T>,
}

pub struct RwLockReadGuard<'a, T: 'a> {
    inner: &'a RwLock<T>,
}

pub struct RwLockWriteGuard<'a, T: 'a> {
    inner: &'a RwLock<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        return RwLock {
            lock: AtomicU32::new(0),
            writer_pending: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        };
    }

    /// 尝试获取读锁
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, SystemError> {
        if self.writer_pending.load(Ordering::Relaxed) != 0 {
            return Err(SystemError::EAGAIN_OR_EWOULDBLOCK);
        }
        let value = self.lock.fetch_add(READER, Ordering::Acquire);
        if value & WRITER != 0 {
            self.lock.fetch_sub(READER, Ordering::Release);
            return Err(SystemError::EAGAIN_OR_EWOULDBLOCK);
        }
        if value > u32::MAX >> 2 {
            self.lock.fetch_sub(READER, Ordering::Release);
            panic!("too many readers on RwLock");
        }
        return Ok(RwLockReadGuard { inner: self });
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            match self.try_read() {
                Ok(guard) => return guard,
                Err(_) => spin_loop(),
            }
        }
    }

    /// 尝试获取写锁
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, SystemError> {
        if self
            .lock
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(RwLockWriteGuard { inner: self });
        }
        return Err(SystemError::EAGAIN_OR_EWOULDBLOCK);
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.writer_pending.fetch_add(1, Ordering::Relaxed);
        let guard = loop {
            match self.try_write() {
                Ok(guard) => break guard,
                Err(_) => spin_loop(),
            }
        };
        self.writer_pending.fetch_sub(1, Ordering::Relaxed);
        guard
    }

    /// 当前读者的数量
    pub fn reader_count(&self) -> u32 {
        self.lock.load(Ordering::Relaxed) / READER
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        return unsafe { &*self.inner.data.get() };
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        return unsafe { &*self.inner.data.get() };
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        return unsafe { &mut *self.inner.data.get() };
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.lock.fetch_sub(READER, Ordering::Release);
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.lock.fetch_and(!WRITER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_exclude_writer() {
        let lock = RwLock::new(7);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1 + *r2, 14);
        assert_eq!(lock.reader_count(), 2);
        assert!(lock.try_write().is_err());
        drop((r1, r2));

        let mut w = lock.try_write().unwrap();
        *w = 8;
        assert!(lock.try_read().is_err());
        drop(w);
        assert_eq!(*lock.read(), 8);
    }
}
