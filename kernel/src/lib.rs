//! 公平调度核心
//!
//! 本crate实现了内核中按权重公平分配CPU时间的调度子系统：每个CPU上的虚拟运行时间队列、
//! PELT负载跟踪、任务组的层级份额、CFS带宽控制、唤醒抢占、SMP负载均衡以及NUMA放置。
//!
//! 与外部的交互全部经过[`sched::core::Scheduler`]：进程生命周期钩子、时钟源、任务组接口、
//! 可调参数、周期性tick入口以及CPU拓扑变化通知。
#![cfg_attr(not(test), no_std)]
#![allow(clippy::needless_return)]
#![allow(clippy::bool_comparison)]

extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate num_derive;

#[macro_use]
pub mod libs;
pub mod cgroup;
pub mod sched;
pub mod smp;

pub use sched::core::Scheduler;
pub use system_error::SystemError;
