//! cpu控制组
//!
//! 在任务组之上提供cgroup v2风格的接口：
//!
//! - `cpu.weight` / `cpu.weight.nice`：映射为任务组的份额
//! - `cpu.max` / `cpu.max.burst`：带宽的配额、周期和突发量，单位是微秒
//! - `cpu.idle`：把任务组设为idle
//! - `cpu.stat`：带宽统计
use core::{fmt, str::FromStr};

use alloc::{
    format,
    string::{String, ToString},
    sync::Arc,
};
use system_error::SystemError;

use crate::sched::{
    bandwidth::{BandwidthStats, RUNTIME_INF},
    core::Scheduler,
    group::{TaskGroup, TaskGroupId},
    task::Pid,
    MAX_NICE, MIN_NICE, NICE_0_LOAD, NSEC_PER_USEC, SCHED_PRIO_TO_WEIGHT,
};

use super::{CfType, CgroupSubsystem};

pub const CGROUP_WEIGHT_MIN: u64 = 1;
pub const CGROUP_WEIGHT_DFL: u64 = 100;
pub const CGROUP_WEIGHT_MAX: u64 = 10000;

#[inline]
fn div_round_closest(a: u64, b: u64) -> u64 {
    (a + b / 2) / b
}

/// cgroup权重转换为份额
pub fn weight_to_shares(weight: u64) -> u64 {
    div_round_closest(weight * NICE_0_LOAD, CGROUP_WEIGHT_DFL)
}

/// 份额转换为cgroup权重
pub fn shares_to_weight(shares: u64) -> u64 {
    div_round_closest(shares * CGROUP_WEIGHT_DFL, NICE_0_LOAD).clamp(CGROUP_WEIGHT_MIN, CGROUP_WEIGHT_MAX)
}

fn parse_u64(s: &str) -> Result<u64, SystemError> {
    s.parse::<u64>().map_err(|_| SystemError::EINVAL)
}

/// `cpu.max`的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMax {
    /// 每个周期的配额（微秒），None表示不限制
    pub quota_us: Option<u64>,
    /// 周期（微秒），写入时None表示保持原来的周期
    pub period_us: Option<u64>,
}

impl FromStr for CpuMax {
    type Err = SystemError;

    /// 格式为`$MAX $PERIOD`，`$MAX`可以是`max`，`$PERIOD`可以省略
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut it = s.split_whitespace();
        let quota = it.next().ok_or(SystemError::EINVAL)?;
        let quota_us = match quota {
            "max" => None,
            q => Some(parse_u64(q)?),
        };
        let period_us = it.next().map(parse_u64).transpose()?;
        if it.next().is_some() {
            return Err(SystemError::EINVAL);
        }
        Ok(Self { quota_us, period_us })
    }
}

impl fmt::Display for CpuMax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quota_us {
            Some(q) => write!(f, "{}", q)?,
            None => write!(f, "max")?,
        }
        if let Some(p) = self.period_us {
            write!(f, " {}", p)?;
        }
        Ok(())
    }
}

/// 一个cpu控制组，对应调度器中的一个任务组
pub struct CpuCgroup {
    sched: Arc<Scheduler>,
    id: TaskGroupId,
}

impl CpuCgroup {
    /// 根控制组
    pub fn root(sched: Arc<Scheduler>) -> Self {
        Self {
            sched,
            id: TaskGroupId::ROOT,
        }
    }

    pub fn id(&self) -> TaskGroupId {
        self.id
    }

    fn tg(&self) -> Result<Arc<TaskGroup>, SystemError> {
        self.sched.group(self.id)
    }

    /// 创建子控制组
    pub fn create_child(&self) -> Result<Self, SystemError> {
        let id = self.sched.create_group(self.id)?;
        Ok(Self {
            sched: self.sched.clone(),
            id,
        })
    }

    /// 删除控制组，组中不能还有任务或者子控制组
    pub fn destroy(&self) -> Result<(), SystemError> {
        if self.id.is_root() {
            return Err(SystemError::EPERM);
        }
        self.sched.destroy_group(self.id)
    }

    /// 把任务移进这个控制组
    pub fn attach(&self, pid: Pid) -> Result<(), SystemError> {
        self.sched.move_task_to_group(pid, self.id)
    }

    pub fn weight(&self) -> Result<u64, SystemError> {
        Ok(shares_to_weight(self.tg()?.shares()))
    }

    pub fn set_weight(&self, weight: u64) -> Result<(), SystemError> {
        if !(CGROUP_WEIGHT_MIN..=CGROUP_WEIGHT_MAX).contains(&weight) {
            return Err(SystemError::EINVAL);
        }
        self.sched.set_shares(self.id, weight_to_shares(weight))
    }

    /// 与份额最接近的nice值
    pub fn weight_nice(&self) -> Result<i32, SystemError> {
        let shares = self.tg()?.shares();
        let (idx, _) = SCHED_PRIO_TO_WEIGHT
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.abs_diff(shares))
            .ok_or(SystemError::EINVAL)?;
        Ok(MIN_NICE + idx as i32)
    }

    pub fn set_weight_nice(&self, nice: i32) -> Result<(), SystemError> {
        if !(MIN_NICE..=MAX_NICE).contains(&nice) {
            return Err(SystemError::EINVAL);
        }
        let shares = SCHED_PRIO_TO_WEIGHT[(nice - MIN_NICE) as usize];
        self.sched.set_shares(self.id, shares)
    }

    pub fn max(&self) -> Result<CpuMax, SystemError> {
        let tg = self.tg()?;
        let quota = tg.bandwidth.quota();
        Ok(CpuMax {
            quota_us: (quota != RUNTIME_INF).then(|| quota / NSEC_PER_USEC),
            period_us: Some(tg.bandwidth.period() / NSEC_PER_USEC),
        })
    }

    /// ## 设置配额和周期
    ///
    /// 突发量保持不变，新的配额比突发量还小时返回EINVAL。
    pub fn set_max(&self, max: CpuMax) -> Result<(), SystemError> {
        let tg = self.tg()?;
        let period = match max.period_us {
            Some(p) => p.checked_mul(NSEC_PER_USEC).ok_or(SystemError::EINVAL)?,
            None => tg.bandwidth.period(),
        };
        let quota = match max.quota_us {
            Some(q) => q.checked_mul(NSEC_PER_USEC).ok_or(SystemError::EINVAL)?,
            None => RUNTIME_INF,
        };
        self.sched
            .tg_set_cfs_bandwidth(self.id, period, quota, tg.bandwidth.burst())
    }

    pub fn burst_us(&self) -> Result<u64, SystemError> {
        Ok(self.tg()?.bandwidth.burst() / NSEC_PER_USEC)
    }

    pub fn set_burst_us(&self, burst_us: u64) -> Result<(), SystemError> {
        let tg = self.tg()?;
        let burst = burst_us.checked_mul(NSEC_PER_USEC).ok_or(SystemError::EINVAL)?;
        self.sched
            .tg_set_cfs_bandwidth(self.id, tg.bandwidth.period(), tg.bandwidth.quota(), burst)
    }

    pub fn idle(&self) -> Result<bool, SystemError> {
        Ok(self.tg()?.is_idle())
    }

    pub fn set_idle(&self, idle: bool) -> Result<(), SystemError> {
        self.sched.set_group_idle(self.id, idle)
    }

    pub fn stat(&self) -> Result<BandwidthStats, SystemError> {
        Ok(self.tg()?.bandwidth.stats())
    }
}

static CPU_CGROUP_FILES: [CfType<CpuCgroup>; 6] = [
    CfType {
        name: "cpu.weight",
        read: Some(|cg: &CpuCgroup| cg.weight().map(|w| w.to_string())),
        write: Some(|cg: &CpuCgroup, data: &str| -> Result<(), SystemError> {
            cg.set_weight(parse_u64(data)?)
        }),
    },
    CfType {
        name: "cpu.weight.nice",
        read: Some(|cg: &CpuCgroup| cg.weight_nice().map(|n| n.to_string())),
        write: Some(|cg: &CpuCgroup, data: &str| -> Result<(), SystemError> {
            let nice = data.parse::<i32>().map_err(|_| SystemError::EINVAL)?;
            cg.set_weight_nice(nice)
        }),
    },
    CfType {
        name: "cpu.max",
        read: Some(|cg: &CpuCgroup| cg.max().map(|m| m.to_string())),
        write: Some(|cg: &CpuCgroup, data: &str| -> Result<(), SystemError> {
            cg.set_max(data.parse()?)
        }),
    },
    CfType {
        name: "cpu.max.burst",
        read: Some(|cg: &CpuCgroup| cg.burst_us().map(|b| b.to_string())),
        write: Some(|cg: &CpuCgroup, data: &str| -> Result<(), SystemError> {
            cg.set_burst_us(parse_u64(data)?)
        }),
    },
    CfType {
        name: "cpu.idle",
        read: Some(|cg: &CpuCgroup| cg.idle().map(|i| (i as u8).to_string())),
        write: Some(|cg: &CpuCgroup, data: &str| match data {
            "0" => cg.set_idle(false),
            "1" => cg.set_idle(true),
            _ => Err(SystemError::EINVAL),
        }),
    },
    CfType {
        name: "cpu.stat",
        read: Some(|cg: &CpuCgroup| -> Result<String, SystemError> {
            let s = cg.stat()?;
            Ok(format!(
                "nr_periods {}\nnr_throttled {}\nthrottled_usec {}\n",
                s.nr_periods,
                s.nr_throttled,
                s.throttled_time / NSEC_PER_USEC
            ))
        }),
        write: None,
    },
];

impl CgroupSubsystem for CpuCgroup {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn files(&self) -> &'static [CfType<Self>] {
        &CPU_CGROUP_FILES
    }
}

impl fmt::Debug for CpuCgroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuCgroup").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sched::{
            clock::ManualClock,
            config::SchedConfig,
            task::SchedAttrBuilder,
            NSEC_PER_MSEC,
        },
        smp::topology::CpuTopology,
    };

    fn root() -> CpuCgroup {
        let clock = Arc::new(ManualClock::new(0));
        let sched = Scheduler::new(CpuTopology::flat(2), SchedConfig::default(), clock).unwrap();
        CpuCgroup::root(Arc::new(sched))
    }

    #[test]
    fn weight_maps_onto_shares() {
        let cg = root().create_child().unwrap();
        assert_eq!(cg.read_file("cpu.weight").unwrap(), "100");

        cg.write_file("cpu.weight", "200\n").unwrap();
        assert_eq!(cg.tg().unwrap().shares(), 2048);
        assert_eq!(cg.weight().unwrap(), 200);

        cg.set_weight(1).unwrap();
        assert_eq!(cg.tg().unwrap().shares(), 10);
        assert_eq!(cg.weight().unwrap(), 1);

        cg.set_weight(CGROUP_WEIGHT_MAX).unwrap();
        assert_eq!(cg.weight().unwrap(), CGROUP_WEIGHT_MAX);

        assert_eq!(cg.set_weight(0), Err(SystemError::EINVAL));
        assert_eq!(cg.set_weight(10001), Err(SystemError::EINVAL));
        assert_eq!(cg.write_file("cpu.weight", "heavy"), Err(SystemError::EINVAL));
    }

    #[test]
    fn weight_nice_uses_the_nice_table() {
        let cg = root().create_child().unwrap();
        assert_eq!(cg.weight_nice().unwrap(), 0);
        cg.write_file("cpu.weight.nice", "-5").unwrap();
        assert_eq!(cg.tg().unwrap().shares(), 3121);
        assert_eq!(cg.read_file("cpu.weight.nice").unwrap(), "-5");
        assert_eq!(cg.set_weight_nice(20), Err(SystemError::EINVAL));
    }

    #[test]
    fn cpu_max_sets_quota_and_period() {
        let cg = root().create_child().unwrap();
        assert_eq!(cg.read_file("cpu.max").unwrap(), "max 100000");

        cg.write_file("cpu.max", "50000 100000").unwrap();
        let tg = cg.tg().unwrap();
        assert_eq!(tg.bandwidth.quota(), 50 * NSEC_PER_MSEC);
        assert_eq!(tg.bandwidth.period(), 100 * NSEC_PER_MSEC);
        assert_eq!(cg.read_file("cpu.max").unwrap(), "50000 100000");

        // 省略周期时保持原来的周期
        cg.write_file("cpu.max", "20000").unwrap();
        assert_eq!(cg.read_file("cpu.max").unwrap(), "20000 100000");

        cg.write_file("cpu.max", "max").unwrap();
        assert_eq!(cg.read_file("cpu.max").unwrap(), "max 100000");
        assert!(!tg.bandwidth.runtime_enabled());
    }

    #[test]
    fn cpu_max_rejects_bad_input() {
        let cg = root().create_child().unwrap();
        for bad in ["", "abc 100000", "0 100000", "50000 100", "50000 100000 1", "-1"] {
            assert_eq!(cg.write_file("cpu.max", bad), Err(SystemError::EINVAL), "{:?}", bad);
        }
        assert_eq!(cg.read_file("cpu.max").unwrap(), "max 100000");
    }

    #[test]
    fn burst_is_bounded_by_quota() {
        let cg = root().create_child().unwrap();
        cg.write_file("cpu.max", "50000 100000").unwrap();
        cg.write_file("cpu.max.burst", "10000").unwrap();
        assert_eq!(cg.read_file("cpu.max.burst").unwrap(), "10000");
        assert_eq!(cg.write_file("cpu.max.burst", "60000"), Err(SystemError::EINVAL));

        // 改配额时突发量保留
        cg.write_file("cpu.max", "40000").unwrap();
        assert_eq!(cg.burst_us().unwrap(), 10000);
        assert_eq!(cg.write_file("cpu.max", "5000"), Err(SystemError::EINVAL));
    }

    #[test]
    fn idle_flag() {
        let cg = root().create_child().unwrap();
        assert_eq!(cg.read_file("cpu.idle").unwrap(), "0");
        cg.write_file("cpu.idle", "1").unwrap();
        assert!(cg.tg().unwrap().is_idle());
        assert_eq!(cg.read_file("cpu.idle").unwrap(), "1");
        assert_eq!(cg.write_file("cpu.idle", "yes"), Err(SystemError::EINVAL));
    }

    #[test]
    fn root_is_not_tunable() {
        let root = root();
        assert_eq!(root.write_file("cpu.weight", "100"), Err(SystemError::EINVAL));
        assert_eq!(root.write_file("cpu.max", "50000 100000"), Err(SystemError::EINVAL));
        assert_eq!(root.write_file("cpu.idle", "1"), Err(SystemError::EINVAL));
    }

    #[test]
    fn unknown_and_read_only_files() {
        let cg = root().create_child().unwrap();
        assert_eq!(cg.read_file("cpu.shares"), Err(SystemError::ENOENT));
        assert_eq!(cg.write_file("cpu.stat", "0"), Err(SystemError::EPERM));
        assert_eq!(
            cg.read_file("cpu.stat").unwrap(),
            "nr_periods 0\nnr_throttled 0\nthrottled_usec 0\n"
        );
    }

    #[test]
    fn destroy_requires_an_empty_group() {
        let root = root();
        let cg = root.create_child().unwrap();
        let pid = Pid::new(1);
        let mut b = SchedAttrBuilder::default();
        b.nice(0);
        root.sched.sched_fork(None, pid, b.build().unwrap()).unwrap();

        cg.attach(pid).unwrap();
        assert_eq!(root.sched.task_group(pid).unwrap(), cg.id());
        assert_eq!(cg.destroy(), Err(SystemError::EBUSY));

        root.attach(pid).unwrap();
        cg.destroy().unwrap();
        assert_eq!(root.sched.group(cg.id()).err(), Some(SystemError::ESRCH));
        assert_eq!(root.destroy(), Err(SystemError::EPERM));
    }
}
