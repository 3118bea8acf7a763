//! 控制组前端
//!
//! 控制组把调度器的任务组以接口文件的形式暴露出来。每个子系统提供一张接口文件表，
//! 文件的读写转换为对任务组的类型化调用。
use alloc::string::String;

use system_error::SystemError;

pub mod cpu_cgroup;

/// 控制组的一个接口文件
pub struct CfType<T: ?Sized> {
    pub name: &'static str,
    /// None表示只写
    pub read: Option<fn(&T) -> Result<String, SystemError>>,
    /// None表示只读
    pub write: Option<fn(&T, &str) -> Result<(), SystemError>>,
}

/// 控制组子系统
pub trait CgroupSubsystem: 'static {
    fn name(&self) -> &'static str;

    /// 子系统提供的接口文件
    fn files(&self) -> &'static [CfType<Self>];

    fn read_file(&self, name: &str) -> Result<String, SystemError> {
        let cft = self
            .files()
            .iter()
            .find(|f| f.name == name)
            .ok_or(SystemError::ENOENT)?;
        let read = cft.read.ok_or(SystemError::EPERM)?;
        read(self)
    }

    fn write_file(&self, name: &str, data: &str) -> Result<(), SystemError> {
        let cft = self
            .files()
            .iter()
            .find(|f| f.name == name)
            .ok_or(SystemError::ENOENT)?;
        let write = cft.write.ok_or(SystemError::EPERM)?;
        write(self, data.trim())
    }
}
