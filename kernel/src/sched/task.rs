use derive_builder::Builder;

use crate::{libs::cpumask::CpuMask, smp::cpu::ProcessorId};

use super::{
    entity::FairSchedEntity,
    group::{GroupSlot, TaskGroupId},
    nice_to_weight,
    numa::NumaTaskState,
    SchedPolicy, WEIGHT_IDLEPRIO,
};

int_like!(Pid, usize);

/// 任务在运行队列上的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnRq {
    /// 不在队列中（睡眠或已退出）
    None,
    /// 在队列中（可能正在运行）
    Queued,
    /// 正在从一个CPU迁移到另一个CPU，不属于任何一个运行队列
    Migrating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Sleeping,
    Dead,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedInfo {
    /// 记录任务被换上CPU的次数
    pub pcount: u64,
    /// 记录任务等待在运行队列上的总时间
    pub run_delay: u64,
    /// 记录任务上次在 CPU 上运行的时间戳
    pub last_arrival: u64,
    /// 记录任务上次被加入到运行队列中的时间戳
    pub last_queued: u64,
}

/// 实时调度实体
#[derive(Debug, Default, Clone, Copy)]
pub struct RtEntity {
    /// SCHED_RR剩余的时间片
    pub time_slice: u64,
}

/// fork时传给调度器的任务属性
#[derive(Debug, Clone, Builder)]
#[builder(no_std, default, setter(into))]
pub struct SchedAttr {
    pub policy: SchedPolicy,
    pub nice: i32,
    /// 实时优先级，数值越大优先级越高，仅对FIFO/RR有效
    pub rt_priority: u32,
    /// 所属任务组，None表示继承父任务的任务组（没有父任务时为根组）
    #[builder(setter(strip_option))]
    pub group: Option<TaskGroupId>,
    /// 允许运行的CPU，None表示继承父任务（没有父任务时为全部CPU）
    #[builder(setter(strip_option))]
    pub cpus_allowed: Option<CpuMask>,
    /// 地址空间大小（字节），0表示内核线程，不参与NUMA扫描
    pub mm_size: u64,
}

impl Default for SchedAttr {
    fn default() -> Self {
        Self {
            policy: SchedPolicy::CFS,
            nice: 0,
            rt_priority: 0,
            group: None,
            cpus_allowed: None,
            mm_size: 0,
        }
    }
}

/// 一个任务的调度信息，归任务当前所在CPU的运行队列所有
#[derive(Debug)]
pub struct SchedTask {
    pub pid: Pid,
    pub policy: SchedPolicy,
    pub nice: i32,
    pub rt_priority: u32,
    /// cfs调度实体
    pub se: FairSchedEntity,
    pub rt: RtEntity,
    pub group: TaskGroupId,
    pub cpus_allowed: CpuMask,
    pub on_rq: OnRq,
    pub state: TaskState,
    /// 当前所在的cpu
    pub cpu: ProcessorId,

    /// 上一次唤醒的任务以及唤醒关系翻转的次数，用于判断一对多的唤醒模式
    pub last_wakee: Option<Pid>,
    pub wakee_flips: u32,
    pub wakee_flip_decay_ts: u64,

    pub sched_stat: SchedInfo,
    pub numa: NumaTaskState,
}

impl SchedTask {
    pub fn new(pid: Pid, attr: &SchedAttr, group: TaskGroupId, cpus_allowed: CpuMask, cpu: ProcessorId) -> Self {
        let weight = Self::policy_weight(attr.policy, attr.nice);
        let mut se = FairSchedEntity::new(weight, group.slot(), 0);
        se.init_entity_runnable_average(true);
        Self {
            pid,
            policy: attr.policy,
            nice: attr.nice,
            rt_priority: attr.rt_priority,
            se,
            rt: RtEntity::default(),
            group,
            cpus_allowed,
            on_rq: OnRq::None,
            state: TaskState::Runnable,
            cpu,
            last_wakee: None,
            wakee_flips: 0,
            wakee_flip_decay_ts: 0,
            sched_stat: SchedInfo::default(),
            numa: NumaTaskState::new(attr.mm_size),
        }
    }

    /// 调度策略和nice值对应的权重
    pub fn policy_weight(policy: SchedPolicy, nice: i32) -> u64 {
        if policy == SchedPolicy::IDLE {
            WEIGHT_IDLEPRIO
        } else {
            nice_to_weight(nice)
        }
    }

    #[inline]
    pub fn group_slot(&self) -> GroupSlot {
        self.se.cfs_rq
    }

    #[inline]
    pub fn is_idle_policy(&self) -> bool {
        self.policy == SchedPolicy::IDLE
    }

    #[inline]
    pub fn nr_cpus_allowed(&self) -> usize {
        self.cpus_allowed.weight()
    }

    #[inline]
    pub fn can_run_on(&self, cpu: ProcessorId) -> bool {
        self.cpus_allowed.contains(cpu)
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.on_rq == OnRq::Queued
    }
}
