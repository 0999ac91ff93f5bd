//! 量化与变化检测
//!
//! 原始样本先舍入到显示精度，再与上一次发布的值比较；只有量化后的值会被保存。
//! 这样下游的阈值判断（例如 "> 80"）看到的就是用于去抖判断的同一个数。

use crate::stats::{MemoryInfo, RawSample, Sample};

/// 容量字段的小数位数
const CAPACITY_PLACES: i32 = 1;
/// 压缩比的小数位数
const RATIO_PLACES: i32 = 2;

/// 四舍五入到指定小数位
#[inline]
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// CPU 使用率向下取整到整数，范围限定在 0-100
#[inline]
pub fn quantize_cpu(raw: f64) -> u32 {
    if raw.is_nan() {
        return 0;
    }
    raw.clamp(0.0, 100.0).floor() as u32
}

/// 内存信息量化：容量一位小数，压缩比两位小数
pub fn quantize_memory(raw: &MemoryInfo) -> MemoryInfo {
    MemoryInfo {
        total: round_to(raw.total, CAPACITY_PLACES),
        used: round_to(raw.used, CAPACITY_PLACES),
        cached: round_to(raw.cached, CAPACITY_PLACES),
        pressure: raw.pressure,
        compression_ratio: round_to(raw.compression_ratio, RATIO_PLACES),
    }
}

/// 量化原始样本并判断是否与上一次发布的样本不同
pub fn quantize(previous: &Sample, raw: &RawSample) -> (Sample, bool) {
    let sample = Sample {
        cpu_percent: quantize_cpu(raw.cpu_percent),
        memory: quantize_memory(&raw.memory),
    };
    let changed = sample != *previous;
    (sample, changed)
}

/// 显示用的阈值等级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl Severity {
    /// 按百分比划分等级：超过 80 为严重，超过 60 为警告
    pub fn for_percent(percent: f64) -> Self {
        if percent > 80.0 {
            Severity::Critical
        } else if percent > 60.0 {
            Severity::Warning
        } else {
            Severity::Normal
        }
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}
