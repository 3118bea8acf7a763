//! 调度器的可调参数
//!
//! 参数以不可变快照的形式发布：修改参数时构造一个新的[`SchedConfig`]，整体替换旧的快照，
//! 调度路径上读到的总是一份自洽的参数。

use derive_builder::Builder;
use system_error::SystemError;

use super::{SchedFeature, DEFAULT_SCHED_FEATURES, NSEC_PER_MSEC, NSEC_PER_SEC, NSEC_PER_USEC};

/// 随CPU数量放大延迟类参数的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum TunableScaling {
    /// 不随CPU数量变化
    None = 0,
    /// 乘以 1 + log2(ncpus)
    Log = 1,
    /// 乘以 ncpus
    Linear = 2,
}

/// 放大系数最多考虑的CPU数量
const SCALING_MAX_CPUS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(no_std, default, setter(into))]
pub struct SchedConfig {
    /// 调度周期的目标长度：在这段时间内每个可运行任务至少运行一次
    pub latency_ns: u64,
    /// 任务一次运行的最小时长
    pub min_granularity_ns: u64,
    /// 唤醒抢占的粒度，防止过于频繁的唤醒抢占
    pub wakeup_granularity_ns: u64,
    /// fork之后让子进程先运行
    pub child_runs_first: bool,
    /// 任务在这段时间内运行过则认为它的缓存是热的。-1表示总是热的，0表示从不
    pub migration_cost_ns: i64,
    /// 一次负载均衡最多迁移的任务数
    pub nr_migrate: u32,
    pub tunable_scaling: TunableScaling,
    pub features: SchedFeature,

    /// 每次从任务组的带宽池中取出的运行时间
    pub cfs_bandwidth_slice_ns: u64,
    /// 队列空闲时保留给自己的运行时间，多出的部分归还给带宽池
    pub min_cfs_rq_runtime_ns: u64,
    /// 归还运行时间之后，延迟这么久再重新分配
    pub cfs_slack_period_ns: u64,

    /// 周期性负载均衡间隔的上限
    pub max_load_balance_interval_ns: u64,
    /// 所有任务都因为亲和性无法迁移时，均衡间隔增长的上限（毫秒）
    pub max_pinned_interval_ms: u64,
    /// newidle均衡开销的衰减周期
    pub newidle_cost_decay_period_ns: u64,
    /// 每个衰减周期newidle开销乘以 num/256
    pub newidle_cost_decay_num: u64,
    /// 阻塞负载衰减的最小间隔
    pub blocked_load_update_period_ns: u64,
    /// 任务组负载贡献只有变化超过 contrib >> shift 时才会被发布
    pub tg_load_avg_hysteresis_shift: u32,

    /// 唤醒关系翻转计数的衰减周期
    pub wakee_flip_decay_ns: u64,

    /// 任务开始NUMA扫描之前的延迟（毫秒）
    pub numa_scan_delay_ms: u64,
    pub numa_scan_period_min_ms: u64,
    pub numa_scan_period_max_ms: u64,
    /// 每次扫描的地址空间大小（MB）
    pub numa_scan_size_mb: u64,
    /// 扫描周期调整的粒度：一个周期被分成这么多份
    pub numa_period_slots: u64,
    /// 本地访问比例达到 threshold/slots 时延长扫描周期
    pub numa_period_threshold: u64,
    /// 一个节点上的CPU侧故障数超过最大值的 1/fraction 时认为该节点活跃
    pub numa_active_node_fraction: u64,
    /// 任务组在目标节点上的CPU侧故障需要超过源节点的 num/den 才迁移内存
    pub numa_migrate_hysteresis_num: u64,
    pub numa_migrate_hysteresis_den: u64,
    /// NUMA迁移时允许的负载不平衡百分比
    pub numa_imbalance_pct: u64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            latency_ns: 6 * NSEC_PER_MSEC,
            min_granularity_ns: 750 * NSEC_PER_USEC,
            wakeup_granularity_ns: NSEC_PER_MSEC,
            child_runs_first: false,
            migration_cost_ns: 500_000,
            nr_migrate: 32,
            tunable_scaling: TunableScaling::Log,
            features: *DEFAULT_SCHED_FEATURES,

            cfs_bandwidth_slice_ns: 5 * NSEC_PER_MSEC,
            min_cfs_rq_runtime_ns: NSEC_PER_MSEC,
            cfs_slack_period_ns: 5 * NSEC_PER_MSEC,

            max_load_balance_interval_ns: 100 * NSEC_PER_MSEC,
            max_pinned_interval_ms: 512,
            newidle_cost_decay_period_ns: NSEC_PER_SEC,
            newidle_cost_decay_num: 253,
            blocked_load_update_period_ns: NSEC_PER_MSEC,
            tg_load_avg_hysteresis_shift: 6,

            wakee_flip_decay_ns: NSEC_PER_SEC,

            numa_scan_delay_ms: 1000,
            numa_scan_period_min_ms: 1000,
            numa_scan_period_max_ms: 60000,
            numa_scan_size_mb: 256,
            numa_period_slots: 10,
            numa_period_threshold: 7,
            numa_active_node_fraction: 3,
            numa_migrate_hysteresis_num: 3,
            numa_migrate_hysteresis_den: 4,
            numa_imbalance_pct: 112,
        }
    }
}

impl SchedConfig {
    /// 检查参数之间的约束
    pub fn validate(&self) -> Result<(), SystemError> {
        if self.min_granularity_ns == 0 || self.latency_ns < self.min_granularity_ns {
            return Err(SystemError::EINVAL);
        }
        if self.migration_cost_ns < -1 || self.nr_migrate == 0 {
            return Err(SystemError::EINVAL);
        }
        if self.cfs_bandwidth_slice_ns == 0 || self.min_cfs_rq_runtime_ns > self.cfs_bandwidth_slice_ns {
            return Err(SystemError::EINVAL);
        }
        if self.numa_scan_period_min_ms == 0
            || self.numa_scan_period_min_ms > self.numa_scan_period_max_ms
            || self.numa_scan_size_mb == 0
        {
            return Err(SystemError::EINVAL);
        }
        if self.numa_period_slots == 0
            || self.numa_period_threshold > self.numa_period_slots
            || self.numa_active_node_fraction == 0
            || self.numa_migrate_hysteresis_den == 0
            || self.numa_imbalance_pct < 100
        {
            return Err(SystemError::EINVAL);
        }
        if self.tg_load_avg_hysteresis_shift >= 32 || self.newidle_cost_decay_num > 256 {
            return Err(SystemError::EINVAL);
        }
        Ok(())
    }

    /// 按CPU数量放大延迟类参数后的配置
    pub fn scaled_for(&self, nr_cpus: usize) -> SchedConfig {
        let cpus = nr_cpus.clamp(1, SCALING_MAX_CPUS) as u64;
        let factor = match self.tunable_scaling {
            TunableScaling::None => 1,
            TunableScaling::Log => 1 + cpus.ilog2() as u64,
            TunableScaling::Linear => cpus,
        };
        let mut cfg = self.clone();
        cfg.latency_ns *= factor;
        cfg.min_granularity_ns *= factor;
        cfg.wakeup_granularity_ns *= factor;
        cfg
    }

    /// 当可运行任务数超过该值时，调度周期按 nr_running * min_granularity 增长
    #[inline]
    pub fn nr_latency(&self) -> u64 {
        (self.latency_ns / self.min_granularity_ns).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_falls_back_to_defaults() {
        let cfg = SchedConfigBuilder::default()
            .latency_ns(12 * NSEC_PER_MSEC)
            .child_runs_first(true)
            .build()
            .unwrap();
        assert_eq!(cfg.latency_ns, 12 * NSEC_PER_MSEC);
        assert!(cfg.child_runs_first);
        assert_eq!(cfg.min_granularity_ns, SchedConfig::default().min_granularity_ns);
        assert_eq!(cfg.nr_latency(), 16);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_inconsistent_values() {
        let mut cfg = SchedConfig::default();
        cfg.latency_ns = cfg.min_granularity_ns - 1;
        assert_eq!(cfg.validate(), Err(SystemError::EINVAL));

        let mut cfg = SchedConfig::default();
        cfg.migration_cost_ns = -2;
        assert_eq!(cfg.validate(), Err(SystemError::EINVAL));

        let mut cfg = SchedConfig::default();
        cfg.numa_scan_period_min_ms = cfg.numa_scan_period_max_ms + 1;
        assert_eq!(cfg.validate(), Err(SystemError::EINVAL));
    }

    #[test]
    fn log_scaling_by_cpu_count() {
        let cfg = SchedConfig::default();
        assert_eq!(cfg.scaled_for(1).latency_ns, 6 * NSEC_PER_MSEC);
        assert_eq!(cfg.scaled_for(4).latency_ns, 18 * NSEC_PER_MSEC);
        // 超过8个CPU不再放大
        assert_eq!(cfg.scaled_for(64).latency_ns, 24 * NSEC_PER_MSEC);

        let mut linear = cfg.clone();
        linear.tunable_scaling = TunableScaling::Linear;
        assert_eq!(linear.scaled_for(2).min_granularity_ns, 1500 * NSEC_PER_USEC);
    }
}
