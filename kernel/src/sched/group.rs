//! 任务组
//!
//! 任务组组成一棵树，每个任务组在每个CPU上都有一个运行队列和一个代表它的组调度实体，
//! 组实体排在父任务组在同一个CPU上的运行队列中。任务组本身放在一个带代数的槽位数组里，
//! 每个CPU用槽位号索引自己的那一份运行队列和组实体，槽位被复用时代数加一，
//! 持有旧id的调用者会得到ESRCH而不是错误地操作新的任务组。

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use alloc::{sync::Arc, vec::Vec};
use system_error::SystemError;

use super::{
    bandwidth::CfsBandwidth, entity::EntityRef, CpuRunQueue, MAX_SHARES, MIN_SHARES, NICE_0_LOAD,
    WEIGHT_IDLEPRIO,
};

int_like!(GroupSlot, u32);

impl GroupSlot {
    pub const ROOT: GroupSlot = GroupSlot::new(0);

    #[inline]
    pub const fn index(&self) -> usize {
        self.data() as usize
    }
}

/// 带代数的任务组id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskGroupId {
    slot: GroupSlot,
    generation: u32,
}

impl TaskGroupId {
    pub const ROOT: TaskGroupId = TaskGroupId {
        slot: GroupSlot::ROOT,
        generation: 0,
    };

    #[inline]
    pub fn slot(&self) -> GroupSlot {
        self.slot
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.slot == GroupSlot::ROOT
    }
}

#[derive(Debug)]
pub struct TaskGroup {
    pub id: TaskGroupId,
    pub parent: Option<TaskGroupId>,
    /// 根组为0
    pub depth: u32,
    shares: AtomicU64,
    /// 各CPU上该组运行队列负载贡献之和
    load_avg: AtomicI64,
    /// 更新load_avg时CAS失败重试的次数
    load_avg_retries: AtomicU64,
    /// 组中的任务全部按SCHED_IDLE对待
    idle: AtomicBool,
    nr_tasks: AtomicUsize,
    dead: AtomicBool,
    pub bandwidth: CfsBandwidth,
}

impl TaskGroup {
    fn new(id: TaskGroupId, parent: Option<TaskGroupId>, depth: u32) -> Self {
        Self {
            id,
            parent,
            depth,
            shares: AtomicU64::new(NICE_0_LOAD),
            load_avg: AtomicI64::new(0),
            load_avg_retries: AtomicU64::new(0),
            idle: AtomicBool::new(false),
            nr_tasks: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
            bandwidth: CfsBandwidth::new(),
        }
    }

    #[inline]
    pub fn shares(&self) -> u64 {
        self.shares.load(Ordering::Relaxed)
    }

    pub(crate) fn store_shares(&self, shares: u64) {
        self.shares
            .store(shares.clamp(MIN_SHARES, MAX_SHARES), Ordering::Relaxed);
    }

    #[inline]
    pub fn load_avg(&self) -> i64 {
        self.load_avg.load(Ordering::Acquire)
    }

    pub fn load_avg_retries(&self) -> u64 {
        self.load_avg_retries.load(Ordering::Relaxed)
    }

    /// ## 把delta加到任务组的总负载上，结果不小于0
    ///
    /// 任务组的总负载被所有CPU频繁读取，只在本CPU贡献变化足够大时才写，
    /// 用CAS循环而不是锁，失败重试的次数会被记录下来。
    pub fn add_load_avg(&self, delta: i64) {
        let mut old = self.load_avg.load(Ordering::Relaxed);
        loop {
            let new = (old + delta).max(0);
            match self
                .load_avg
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(cur) => {
                    self.load_avg_retries.fetch_add(1, Ordering::Relaxed);
                    old = cur;
                }
            }
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Relaxed);
    }

    #[inline]
    pub fn nr_tasks(&self) -> usize {
        self.nr_tasks.load(Ordering::Relaxed)
    }

    pub(crate) fn get_task(&self) {
        self.nr_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn put_task(&self) {
        let _ = self
            .nr_tasks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

/// 任务组树
#[derive(Debug)]
pub struct TaskGroupTree {
    groups: Vec<Option<Arc<TaskGroup>>>,
    generations: Vec<u32>,
    children: Vec<Vec<GroupSlot>>,
    free: Vec<GroupSlot>,
}

impl TaskGroupTree {
    pub fn new() -> Self {
        let root = Arc::new(TaskGroup::new(TaskGroupId::ROOT, None, 0));
        Self {
            groups: alloc::vec![Some(root)],
            generations: alloc::vec![0],
            children: alloc::vec![Vec::new()],
            free: Vec::new(),
        }
    }

    pub fn root(&self) -> Arc<TaskGroup> {
        match &self.groups[0] {
            Some(g) => g.clone(),
            None => panic!("BUG: root task group is missing"),
        }
    }

    /// 按id查找，id过期或者不存在时返回None
    pub fn get(&self, id: TaskGroupId) -> Option<Arc<TaskGroup>> {
        let idx = id.slot.index();
        if self.generations.get(idx).copied() != Some(id.generation) {
            return None;
        }
        self.groups.get(idx).and_then(|g| g.clone())
    }

    pub fn by_slot(&self, slot: GroupSlot) -> Option<Arc<TaskGroup>> {
        self.groups.get(slot.index()).and_then(|g| g.clone())
    }

    /// ## 在parent下新建一个任务组
    ///
    /// 只分配槽位和任务组本身，各CPU上的运行队列由调用者安装。
    pub fn create(&mut self, parent: TaskGroupId) -> Result<Arc<TaskGroup>, SystemError> {
        let parent_tg = self.get(parent).ok_or(SystemError::ESRCH)?;
        if parent_tg.is_dead() {
            return Err(SystemError::ESRCH);
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                if self.groups.len() >= u32::MAX as usize {
                    return Err(SystemError::ENOSPC);
                }
                self.groups.push(None);
                self.generations.push(0);
                self.children.push(Vec::new());
                GroupSlot::new((self.groups.len() - 1) as u32)
            }
        };

        let id = TaskGroupId {
            slot,
            generation: self.generations[slot.index()],
        };
        let tg = Arc::new(TaskGroup::new(id, Some(parent), parent_tg.depth + 1));
        self.groups[slot.index()] = Some(tg.clone());
        self.children[parent.slot.index()].push(slot);
        Ok(tg)
    }

    /// ## 从树中摘除一个没有子组和任务的任务组
    pub fn remove(&mut self, id: TaskGroupId) -> Result<Arc<TaskGroup>, SystemError> {
        if id.is_root() {
            return Err(SystemError::EPERM);
        }
        let tg = self.get(id).ok_or(SystemError::ESRCH)?;
        if !self.children[id.slot.index()].is_empty() || tg.nr_tasks() != 0 {
            return Err(SystemError::EBUSY);
        }

        tg.dead.store(true, Ordering::Release);
        if let Some(parent) = tg.parent {
            self.children[parent.slot.index()].retain(|s| *s != id.slot);
        }
        self.groups[id.slot.index()] = None;
        self.generations[id.slot.index()] = self.generations[id.slot.index()].wrapping_add(1);
        self.free.push(id.slot);
        Ok(tg)
    }

    pub fn children(&self, id: TaskGroupId) -> Vec<Arc<TaskGroup>> {
        self.children
            .get(id.slot.index())
            .map(|c| c.iter().filter_map(|s| self.by_slot(*s)).collect())
            .unwrap_or_default()
    }

    /// 以id为根的子树，父节点排在子节点之前
    pub fn subtree(&self, id: TaskGroupId) -> Vec<Arc<TaskGroup>> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        if let Some(tg) = self.get(id) {
            stack.push(tg);
        }
        while let Some(tg) = stack.pop() {
            for child in self.children(tg.id).into_iter().rev() {
                stack.push(child);
            }
            out.push(tg);
        }
        out
    }

    /// 所有存活的任务组，父节点排在子节点之前
    pub fn iter_top_down(&self) -> Vec<Arc<TaskGroup>> {
        self.subtree(TaskGroupId::ROOT)
    }
}

impl Default for TaskGroupTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuRunQueue {
    /// 实体的父实体：所在运行队列对应的组实体，根运行队列中的实体没有父实体
    #[inline]
    pub(crate) fn parent_entity(&self, e: EntityRef) -> Option<EntityRef> {
        let slot = self.ents[e].cfs_rq;
        if slot == GroupSlot::ROOT {
            None
        } else {
            Some(EntityRef::Group(slot))
        }
    }

    /// ## 计算组实体在父运行队列中应有的权重
    ///
    /// shares = tg.shares * load / (tg.load_avg - 本CPU已发布的贡献 + load)，
    /// 其中load取运行队列的瞬时权重和平均负载中较大的一个，结果限制在[MIN_SHARES, tg.shares]。
    pub(crate) fn calc_group_shares(&self, slot: GroupSlot) -> u64 {
        let cfs_rq = &self.cfs_rqs[slot];
        // idle任务组的组实体以SCHED_IDLE任务的权重参与竞争
        let tg_shares = if cfs_rq.tg.is_idle() {
            WEIGHT_IDLEPRIO.max(MIN_SHARES)
        } else {
            cfs_rq.tg.shares()
        };

        let load = cfs_rq.load.weight.max(cfs_rq.avg.load_avg);
        let tg_weight = cfs_rq.tg.load_avg() - cfs_rq.tg_load_avg_contrib + load as i64;

        let mut shares = tg_shares * load;
        if tg_weight > 0 {
            shares /= tg_weight as u64;
        }

        shares.clamp(MIN_SHARES, tg_shares)
    }

    /// ## 根据组运行队列的负载重新计算组实体的权重
    pub(crate) fn update_cfs_group(&mut self, e: EntityRef) {
        let slot = match e.my_q() {
            Some(slot) => slot,
            None => return,
        };
        if self.cfs_rqs[slot].throttle_count > 0 {
            return;
        }

        let shares = self.calc_group_shares(slot);
        if self.ents[e].load.weight == shares {
            return;
        }
        let parent_q = self.ents[e].cfs_rq;
        self.reweight_entity(parent_q, e, shares);
    }

    /// ## 为一个新任务组在本CPU上安装运行队列和组实体
    pub(crate) fn init_tg_cfs_entry(&mut self, tg: &Arc<TaskGroup>) {
        let parent_slot = tg.parent.map(|p| p.slot()).unwrap_or(GroupSlot::ROOT);
        let parent_depth = self
            .cfs_rqs
            .get(parent_slot)
            .map(|c| c.depth)
            .unwrap_or(0);

        let mut cfs_rq = super::fair::CfsRunQueue::new(tg.clone(), tg.id.slot(), Some(parent_slot), parent_depth + 1);
        cfs_rq.runtime_enabled = tg.bandwidth.runtime_enabled();
        self.cfs_rqs.install(tg.id.slot(), cfs_rq);

        let mut se = super::entity::FairSchedEntity::new(tg.shares(), parent_slot, parent_depth);
        se.init_entity_runnable_average(false);
        self.ents.install_group(tg.id.slot(), se);
    }

    /// ## 拆除一个任务组在本CPU上的运行队列和组实体
    ///
    /// 调用者保证组中已经没有任务。
    pub(crate) fn unregister_fair_sched_group(&mut self, slot: GroupSlot) {
        let e = EntityRef::Group(slot);
        if self.ents.get(e).is_none() {
            return;
        }
        if self.cfs_rqs[slot].throttled {
            self.unthrottle_cfs_rq(slot);
        }
        let parent_q = self.ents[e].cfs_rq;
        if self.ents[e].on_rq {
            log::warn!("cpu {}: removing group {} while it is queued", self.cpu, slot);
            self.dequeue_entity(parent_q, e, super::DequeueFlag::DEQUEUE_SLEEP);
        }
        self.update_load_avg(parent_q, e, super::pelt::UpdateAvgFlags::empty());
        self.detach_entity_load_avg(parent_q, e);
        self.update_tg_load_avg(parent_q);

        if let Some(cfs_rq) = self.cfs_rqs.remove(slot) {
            // 撤回本CPU对任务组负载的贡献
            cfs_rq.tg.add_load_avg(-cfs_rq.tg_load_avg_contrib);
        }
        self.ents.remove_group(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_ids_are_rejected_after_slot_reuse() {
        let mut tree = TaskGroupTree::new();
        let a = tree.create(TaskGroupId::ROOT).unwrap();
        let a_id = a.id;
        assert_eq!(a.depth, 1);
        tree.remove(a_id).unwrap();
        assert!(a.is_dead());
        assert!(tree.get(a_id).is_none());

        let b = tree.create(TaskGroupId::ROOT).unwrap();
        assert_eq!(b.id.slot(), a_id.slot());
        assert_ne!(b.id, a_id);
        assert_eq!(tree.remove(a_id).unwrap_err(), SystemError::ESRCH);
    }

    #[test]
    fn remove_refuses_busy_groups() {
        let mut tree = TaskGroupTree::new();
        let a = tree.create(TaskGroupId::ROOT).unwrap();
        let b = tree.create(a.id).unwrap();
        assert_eq!(b.depth, 2);
        assert_eq!(tree.remove(a.id).unwrap_err(), SystemError::EBUSY);
        assert_eq!(tree.remove(TaskGroupId::ROOT).unwrap_err(), SystemError::EPERM);

        let order: Vec<TaskGroupId> = tree.iter_top_down().iter().map(|g| g.id).collect();
        assert_eq!(order, alloc::vec![TaskGroupId::ROOT, a.id, b.id]);

        b.get_task();
        assert_eq!(tree.remove(b.id).unwrap_err(), SystemError::EBUSY);
        b.put_task();
        b.put_task();
        assert_eq!(b.nr_tasks(), 0);
        tree.remove(b.id).unwrap();
        tree.remove(a.id).unwrap();
    }

    #[test]
    fn load_avg_never_goes_negative() {
        let tree = TaskGroupTree::new();
        let root = tree.root();
        root.add_load_avg(100);
        root.add_load_avg(-300);
        assert_eq!(root.load_avg(), 0);
        root.store_shares(1);
        assert_eq!(root.shares(), MIN_SHARES);
    }
}
