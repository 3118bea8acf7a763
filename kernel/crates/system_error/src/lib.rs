#![no_std]
#![allow(clippy::bool_comparison)]

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// 调度子系统对外接口返回的错误码
///
/// 取值与posix errno保持一致，便于上层直接转换为系统调用返回值。
#[repr(i32)]
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, Clone, Copy)]
#[allow(dead_code, non_camel_case_types)]
pub enum SystemError {
    /// 操作不被允许 Operation not permitted.
    EPERM = 1,
    /// 没有指定的文件或目录 No such file or directory.
    ENOENT = 2,
    /// 没有这样的进程 No such process.
    ESRCH = 3,
    /// 资源不可用，请重试。 Resource unavailable, try again.
    EAGAIN_OR_EWOULDBLOCK = 11,
    /// 没有足够的空间 Not enough space.
    ENOMEM = 12,
    /// 设备或资源忙 Device or resource busy.
    EBUSY = 16,
    /// 文件已存在 File exists.
    EEXIST = 17,
    /// 没有指定的设备 No such device.
    ENODEV = 19,
    /// 不可用的参数 Invalid argument.
    EINVAL = 22,
    /// 设备上没有空间 No space left on device.
    ENOSPC = 28,
    /// 结果过大 Result too large.
    ERANGE = 34,
    /// 功能不支持 Function not supported.
    ENOSYS = 38,
    /// 数值过大，产生溢出 Value too large to be stored in data type.
    EOVERFLOW = 75,
}

impl SystemError {
    /// @brief 把posix错误码转换为系统错误枚举类型。
    pub fn from_posix_errno(errno: i32) -> Option<SystemError> {
        // posix 错误码是小于0的
        if errno >= 0 {
            return None;
        }
        return <Self as FromPrimitive>::from_i32(-errno);
    }

    /// @brief 把系统错误枚举类型转换为负数posix错误码。
    pub fn to_posix_errno(&self) -> i32 {
        return -<Self as ToPrimitive>::to_i32(self).unwrap_or(0);
    }
}

#[cfg(test)]
mod tests {
    use super::SystemError;

    #[test]
    fn errno_round_trip() {
        assert_eq!(SystemError::EINVAL.to_posix_errno(), -22);
        assert_eq!(
            SystemError::from_posix_errno(-16),
            Some(SystemError::EBUSY)
        );
        assert_eq!(SystemError::from_posix_errno(5), None);
        assert_eq!(SystemError::from_posix_errno(-9999), None);
    }
}
