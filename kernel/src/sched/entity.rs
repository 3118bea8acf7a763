use core::ops::{Index, IndexMut};

use alloc::vec::Vec;
use hashbrown::HashMap;

use super::{
    group::GroupSlot,
    pelt::SchedulerAvg,
    task::{Pid, SchedTask},
    timeline::TimelineKey,
    LoadWeight, NICE_0_LOAD,
};

/// 调度实体的引用：任务，或者某个任务组在本CPU上的代表实体
///
/// 组实体`Group(g)`拥有的运行队列就是槽位`g`上的`CfsRunQueue`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Task(Pid),
    Group(GroupSlot),
}

impl EntityRef {
    /// 组实体拥有的运行队列
    #[inline]
    pub fn my_q(&self) -> Option<GroupSlot> {
        match self {
            EntityRef::Group(g) => Some(*g),
            EntityRef::Task(_) => None,
        }
    }

    #[inline]
    pub fn is_task(&self) -> bool {
        matches!(self, EntityRef::Task(_))
    }
}

/// 公平调度实体
#[derive(Debug, Clone)]
pub struct FairSchedEntity {
    /// 负载相关
    pub load: LoadWeight,
    /// 是否在运行队列上（正在运行的实体也算）
    pub on_rq: bool,
    /// 在时间线中的位置，正在运行时为None
    pub(crate) run_node: Option<TimelineKey>,
    /// 当前调度实体的开始执行时间
    pub exec_start: u64,
    /// 总运行时长
    pub sum_exec_runtime: u64,
    /// 虚拟运行时间
    pub vruntime: u64,
    /// 本次被选中运行时的sum_exec_runtime，用于计算本次已经运行了多久
    pub prev_sum_exec_runtime: u64,
    pub nr_migrations: u64,
    /// 在任务组树中的深度，根组中的实体为0
    pub depth: u32,
    /// 实体所在的运行队列
    pub cfs_rq: GroupSlot,
    /// 负载跟踪
    pub avg: SchedulerAvg,
    /// 负载是否已经计入所在运行队列
    pub(crate) avg_attached: bool,
}

impl FairSchedEntity {
    pub fn new(weight: u64, cfs_rq: GroupSlot, depth: u32) -> Self {
        Self {
            load: LoadWeight::new(weight),
            on_rq: false,
            run_node: None,
            exec_start: 0,
            sum_exec_runtime: 0,
            vruntime: 0,
            prev_sum_exec_runtime: 0,
            nr_migrations: 0,
            depth,
            cfs_rq,
            avg: SchedulerAvg::default(),
            avg_attached: false,
        }
    }

    /// ## 把实际运行时间换算为虚拟运行时间
    #[inline]
    pub fn calc_delta_fair(&self, delta: u64) -> u64 {
        if self.load.weight != NICE_0_LOAD {
            return self.load.calculate_delta(delta, NICE_0_LOAD);
        }
        delta
    }

    /// ## 初始化负载跟踪
    ///
    /// 新任务以满负载起步，在有机会收敛到真实负载之前被当作重任务看待；
    /// 组实体以零负载起步，因为此时组里还没有任何东西。
    pub fn init_entity_runnable_average(&mut self, is_task: bool) {
        self.avg = SchedulerAvg::default();
        self.avg_attached = false;
        if is_task {
            self.avg.load_avg = self.load.weight;
        }
    }

    /// 本次被选中之后已经运行的时间
    #[inline]
    pub fn slice_runtime(&self) -> u64 {
        self.sum_exec_runtime.saturating_sub(self.prev_sum_exec_runtime)
    }
}

/// 本CPU上的所有调度实体：驻留在本CPU上的任务，以及每个任务组在本CPU上的组实体
#[derive(Debug, Default)]
pub struct EntityStore {
    tasks: HashMap<Pid, SchedTask>,
    groups: Vec<Option<FairSchedEntity>>,
}

impl EntityStore {
    pub fn task(&self, pid: Pid) -> Option<&SchedTask> {
        self.tasks.get(&pid)
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut SchedTask> {
        self.tasks.get_mut(&pid)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &SchedTask> {
        self.tasks.values()
    }

    pub fn nr_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.tasks.keys().copied().collect()
    }

    /// 放入一个任务记录，返回被替换掉的旧记录
    pub fn insert_task(&mut self, task: SchedTask) -> Option<SchedTask> {
        self.tasks.insert(task.pid, task)
    }

    pub fn remove_task(&mut self, pid: Pid) -> Option<SchedTask> {
        self.tasks.remove(&pid)
    }

    pub fn group(&self, slot: GroupSlot) -> Option<&FairSchedEntity> {
        self.groups.get(slot.index()).and_then(|g| g.as_ref())
    }

    pub fn install_group(&mut self, slot: GroupSlot, se: FairSchedEntity) {
        if self.groups.len() <= slot.index() {
            self.groups.resize_with(slot.index() + 1, || None);
        }
        self.groups[slot.index()] = Some(se);
    }

    pub fn remove_group(&mut self, slot: GroupSlot) -> Option<FairSchedEntity> {
        self.groups.get_mut(slot.index()).and_then(|g| g.take())
    }

    pub fn get(&self, e: EntityRef) -> Option<&FairSchedEntity> {
        match e {
            EntityRef::Task(pid) => self.tasks.get(&pid).map(|t| &t.se),
            EntityRef::Group(slot) => self.group(slot),
        }
    }

    pub fn get_mut(&mut self, e: EntityRef) -> Option<&mut FairSchedEntity> {
        match e {
            EntityRef::Task(pid) => self.tasks.get_mut(&pid).map(|t| &mut t.se),
            EntityRef::Group(slot) => self.groups.get_mut(slot.index()).and_then(|g| g.as_mut()),
        }
    }
}

impl Index<EntityRef> for EntityStore {
    type Output = FairSchedEntity;

    fn index(&self, e: EntityRef) -> &FairSchedEntity {
        match self.get(e) {
            Some(se) => se,
            None => panic!("BUG: sched entity {:?} is not resident on this cpu", e),
        }
    }
}

impl IndexMut<EntityRef> for EntityStore {
    fn index_mut(&mut self, e: EntityRef) -> &mut FairSchedEntity {
        match self.get_mut(e) {
            Some(se) => se,
            None => panic!("BUG: sched entity {:?} is not resident on this cpu", e),
        }
    }
}
