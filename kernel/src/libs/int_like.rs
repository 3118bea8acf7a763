//! 以整数为底层表示的不透明id类型
//!
//! ```ignore
//! int_like!(Pid, usize);
//! int_like!(ProcessorId, AtomicProcessorId, u32, AtomicU32);
//! ```
//!
//! 第二种形式会额外生成一个原子版本，用于在不加锁的情况下记录“任务当前在哪个CPU上”这一类信息。

#[macro_export]
macro_rules! int_like {
    ($new_type_name:ident, $backing_type: ident) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash, Default)]
        pub struct $new_type_name($backing_type);

        #[allow(dead_code)]
        impl $new_type_name {
            pub const fn new(x: $backing_type) -> Self {
                $new_type_name(x)
            }

            pub const fn data(&self) -> $backing_type {
                self.0
            }
        }

        impl ::core::fmt::Display for $new_type_name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };

    ($new_type_name:ident, $new_atomic_type_name: ident, $backing_type:ident, $backing_atomic_type:ident) => {
        int_like!($new_type_name, $backing_type);

        /// 可在线程间共享的原子id，运行时等价于底层的原子整数
        #[derive(Debug)]
        pub struct $new_atomic_type_name {
            container: ::core::sync::atomic::$backing_atomic_type,
        }

        #[allow(dead_code)]
        impl $new_atomic_type_name {
            pub const fn new(x: $new_type_name) -> Self {
                $new_atomic_type_name {
                    container: ::core::sync::atomic::$backing_atomic_type::new(x.data()),
                }
            }

            pub fn load(&self, order: ::core::sync::atomic::Ordering) -> $new_type_name {
                $new_type_name::new(self.container.load(order))
            }

            pub fn store(&self, val: $new_type_name, order: ::core::sync::atomic::Ordering) {
                self.container.store(val.data(), order)
            }

            pub fn swap(
                &self,
                val: $new_type_name,
                order: ::core::sync::atomic::Ordering,
            ) -> $new_type_name {
                $new_type_name::new(self.container.swap(val.data(), order))
            }

            pub fn compare_exchange(
                &self,
                current: $new_type_name,
                new: $new_type_name,
                success: ::core::sync::atomic::Ordering,
                failure: ::core::sync::atomic::Ordering,
            ) -> ::core::result::Result<$new_type_name, $new_type_name> {
                self.container
                    .compare_exchange(current.data(), new.data(), success, failure)
                    .map($new_type_name::new)
                    .map_err($new_type_name::new)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use core::mem::size_of;
    use core::sync::atomic::{AtomicU32, Ordering};

    int_like!(NodeLike, u16);
    int_like!(CpuLike, AtomicCpuLike, u32, AtomicU32);

    #[test]
    fn layout_matches_backing_type() {
        assert_eq!(size_of::<NodeLike>(), size_of::<u16>());
        assert_eq!(size_of::<AtomicCpuLike>(), size_of::<AtomicU32>());
    }

    #[test]
    fn atomic_compare_exchange() {
        let a = AtomicCpuLike::new(CpuLike::new(3));
        assert_eq!(
            a.compare_exchange(CpuLike::new(3), CpuLike::new(5), Ordering::AcqRel, Ordering::Acquire),
            Ok(CpuLike::new(3))
        );
        assert_eq!(
            a.compare_exchange(CpuLike::new(3), CpuLike::new(7), Ordering::AcqRel, Ordering::Acquire),
            Err(CpuLike::new(5))
        );
        assert_eq!(a.swap(CpuLike::new(1), Ordering::AcqRel), CpuLike::new(5));
        assert_eq!(a.load(Ordering::Acquire).data(), 1);
    }
}
