use crate::quantize::round_to;

/// /proc/meminfo 中的 kB 换算为 GB
const KB_PER_GB: f64 = 1024.0 * 1024.0;

/// CPU 时间统计（单位：jiffies）
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// 内存压力等级
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PressureLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl PressureLevel {
    /// 根据可用内存占比（0.0-1.0）推断压力等级
    pub fn from_available_ratio(ratio: f64) -> Self {
        if ratio < 0.05 {
            PressureLevel::Critical
        } else if ratio < 0.15 {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
        }
    }
}

/// 内存信息，容量字段单位均为 GB
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MemoryInfo {
    pub total: f64,             // 总内存
    pub used: f64,              // 已用内存 = 总内存 - 可用内存
    pub cached: f64,            // 缓存内存
    pub pressure: PressureLevel, // 内存压力等级
    pub compression_ratio: f64, // 压缩比（未启用压缩时为 1.0）
}

impl MemoryInfo {
    /// 已用内存百分比，保留一位小数
    ///
    /// 只应在量化后的数据上调用，保证阈值判断与显示值一致。
    pub fn used_percent(&self) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        round_to(self.used / self.total * 100.0, 1)
    }
}

/// 一次采样得到的原始数据（未量化）
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub cpu_percent: f64, // CPU 使用率 (0.0-100.0)
    pub memory: MemoryInfo,
}

/// 量化后的样本，即对外发布与显示的精度
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Sample {
    pub cpu_percent: u32,
    pub memory: MemoryInfo,
}

/// 系统资源获取错误类型
#[derive(Debug)]
pub enum StatsError {
    IoError(std::io::Error),
    ParseError(String),
    UnsupportedPlatform,
}

impl From<std::io::Error> for StatsError {
    #[inline]
    fn from(error: std::io::Error) -> Self {
        StatsError::IoError(error)
    }
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::IoError(e) => write!(f, "IO 错误: {e}"),
            StatsError::ParseError(s) => write!(f, "解析错误: {s}"),
            StatsError::UnsupportedPlatform => write!(f, "不支持的平台"),
        }
    }
}

impl std::error::Error for StatsError {}

pub type Result<T> = std::result::Result<T, StatsError>;

/// 指标来源
///
/// CPU 使用率由两次 tick 计数之差得出，实现因此是有状态的：
/// 基线重置后的第一次 CPU 采样必须返回 0。
/// 调用方保证同一时刻只有一个采样过程访问来源。
pub trait MetricsSource: Send + 'static {
    /// 采样 CPU 使用率 (0.0-100.0)
    fn sample_cpu_percent(&mut self) -> Result<f64>;

    /// 采样内存信息
    fn sample_memory(&mut self) -> Result<MemoryInfo>;

    /// 丢弃 tick 基线，下一次 CPU 采样重新建立基线
    fn reset_cpu_baseline(&mut self);
}

/// 基于 /proc 的 Linux 指标来源
#[derive(Debug, Default)]
pub struct ProcMetricsSource {
    prev_times: Option<CpuTimes>,
}

impl ProcMetricsSource {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSource for ProcMetricsSource {
    fn sample_cpu_percent(&mut self) -> Result<f64> {
        #[cfg(target_os = "linux")]
        {
            let content = std::fs::read_to_string("/proc/stat")?;
            let current = parse_cpu_times(&content)?;

            // 第一次采样只建立基线
            match self.prev_times.replace(current) {
                Some(prev) => Ok(cpu_usage_between(prev, current)),
                None => Ok(0.0),
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Err(StatsError::UnsupportedPlatform)
        }
    }

    fn sample_memory(&mut self) -> Result<MemoryInfo> {
        #[cfg(target_os = "linux")]
        {
            let content = std::fs::read_to_string("/proc/meminfo")?;
            parse_meminfo(&content)
        }

        #[cfg(not(target_os = "linux"))]
        {
            Err(StatsError::UnsupportedPlatform)
        }
    }

    #[inline]
    fn reset_cpu_baseline(&mut self) {
        self.prev_times = None;
    }
}

/// 解析 /proc/stat 第一行的 CPU 总时间
///
/// 空闲时间包含 iowait，总时间取前八个字段
/// (user nice system idle iowait irq softirq steal)，guest 已计入 user。
pub fn parse_cpu_times(content: &str) -> Result<CpuTimes> {
    let first_line = content
        .lines()
        .next()
        .ok_or_else(|| StatsError::ParseError("无法解析 /proc/stat".to_string()))?;

    let mut parts = first_line.split_whitespace();
    if parts.next() != Some("cpu") {
        return Err(StatsError::ParseError(format!(
            "/proc/stat 首行格式异常: {first_line}"
        )));
    }

    let mut fields = [0u64; 8];
    for (slot, token) in fields.iter_mut().zip(parts) {
        *slot = token.parse().unwrap_or(0);
    }

    let idle = fields[3].saturating_add(fields[4]);
    let total = fields.iter().fold(0u64, |acc, v| acc.saturating_add(*v));

    Ok(CpuTimes { idle, total })
}

/// 根据两次 CPU 时间快照计算使用率 (0.0-100.0)
pub fn cpu_usage_between(prev: CpuTimes, current: CpuTimes) -> f64 {
    let total_diff = current.total.saturating_sub(prev.total);
    if total_diff == 0 {
        return 0.0;
    }
    let idle_diff = current.idle.saturating_sub(prev.idle).min(total_diff);

    let usage = (1.0 - idle_diff as f64 / total_diff as f64) * 100.0;
    usage.clamp(0.0, 100.0)
}

/// 解析 /proc/meminfo
pub fn parse_meminfo(content: &str) -> Result<MemoryInfo> {
    let mut total_kb = None;
    let mut available_kb = None;
    let mut free_kb = 0u64;
    let mut cached_kb = 0u64;
    let mut zswap_kb = 0u64;
    let mut zswapped_kb = 0u64;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            let value = value.parse::<u64>().unwrap_or(0);

            match key {
                "MemTotal:" => total_kb = Some(value),
                "MemAvailable:" => available_kb = Some(value),
                "MemFree:" => free_kb = value,
                "Cached:" => cached_kb = value,
                "Zswap:" => zswap_kb = value,
                "Zswapped:" => zswapped_kb = value,
                _ => {}
            }
        }
    }

    let total_kb = total_kb
        .filter(|v| *v > 0)
        .ok_or_else(|| StatsError::ParseError("/proc/meminfo 缺少 MemTotal".to_string()))?;
    // 旧内核没有 MemAvailable，退回到 MemFree
    let available_kb = available_kb.unwrap_or(free_kb).min(total_kb);
    let used_kb = total_kb - available_kb;

    let compression_ratio = if zswap_kb > 0 {
        zswapped_kb as f64 / zswap_kb as f64
    } else {
        1.0
    };

    Ok(MemoryInfo {
        total: total_kb as f64 / KB_PER_GB,
        used: used_kb as f64 / KB_PER_GB,
        cached: cached_kb as f64 / KB_PER_GB,
        pressure: PressureLevel::from_available_ratio(available_kb as f64 / total_kb as f64),
        compression_ratio,
    })
}
