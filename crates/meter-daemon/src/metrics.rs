//! CPU and RAM usage from procfs, as fractions in 0..=1.

use anyhow::Context;
use meter_proto::config::Metric;
use tracing::warn;

const PROC_STAT: &str = "/proc/stat";
const PROC_MEMINFO: &str = "/proc/meminfo";

/// Cumulative jiffies from the aggregate `cpu` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

/// Parse the first five fields (user nice system idle iowait) of the `cpu`
/// line.  irq/softirq/steal are left out, the same way htop does it.
pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))?;
    let fields = line
        .split_whitespace()
        .skip(1)
        .take(5)
        .map(|field| field.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if fields.len() < 5 {
        return None;
    }
    Some(CpuTimes {
        total: fields.iter().sum(),
        idle: fields[3] + fields[4],
    })
}

/// `(MemTotal - MemAvailable) / MemTotal`.  Page cache counts as free.
pub fn parse_mem_usage(meminfo: &str) -> Option<f64> {
    let field = |name: &str| {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64)
}

/// Average CPU usage between consecutive calls.
#[derive(Debug, Default)]
pub struct CpuSampler {
    last: Option<CpuTimes>,
}

impl CpuSampler {
    /// Usage since the previous reading; 0 for the first one or when no
    /// ticks have elapsed.
    pub fn usage_since_last(&mut self, now: CpuTimes) -> f64 {
        let usage = match self.last {
            Some(prev) if now.total > prev.total => {
                let total = now.total - prev.total;
                let idle = now.idle.saturating_sub(prev.idle).min(total);
                (total - idle) as f64 / total as f64
            }
            _ => 0.0,
        };
        self.last = Some(now);
        usage
    }

    pub fn sample(&mut self) -> anyhow::Result<f64> {
        let stat = std::fs::read_to_string(PROC_STAT).with_context(|| format!("reading {}", PROC_STAT))?;
        let times = parse_cpu_times(&stat).context("no 'cpu' line in /proc/stat")?;
        Ok(self.usage_since_last(times))
    }
}

pub fn ram_usage() -> anyhow::Result<f64> {
    let meminfo =
        std::fs::read_to_string(PROC_MEMINFO).with_context(|| format!("reading {}", PROC_MEMINFO))?;
    parse_mem_usage(&meminfo).context("failed to parse /proc/meminfo")
}

/// Reads any configured metric.  Failures are logged and read as 0 so a
/// broken procfs only drops the needle instead of stopping the poller.
#[derive(Debug, Default)]
pub struct MetricSampler {
    cpu: CpuSampler,
}

impl MetricSampler {
    pub fn read(&mut self, metric: Metric) -> f64 {
        let result = match metric {
            Metric::Cpu => self.cpu.sample(),
            Metric::Ram => ram_usage(),
        };
        result.unwrap_or_else(|e| {
            warn!("metric {:?}: {:#}", metric, e);
            0.0
        })
    }
}
