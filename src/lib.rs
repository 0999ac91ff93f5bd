//! 按需启停的系统资源采样服务
//!
//! 进程内只构建一个 [`Monitor`]：有观察者时按固定间隔采样 CPU 与内存，
//! 量化到显示精度后只在数值变化时发布新版本；没有观察者时停止采样。

pub mod monitor;
pub mod poller;
pub mod publisher;
pub mod quantize;
pub mod server;
pub mod stats;

#[cfg(test)]
mod testing;

// 重新导出主要的公共类型
pub use monitor::{Lease, Monitor, MonitorRef};
pub use poller::{ConfigError, PollerState, SamplerConfig};
pub use publisher::{PublishedState, SamplePublisher, Subscription};
pub use quantize::{Severity, quantize};
pub use server::{Config, StatusServer};
pub use stats::{
    MemoryInfo, MetricsSource, PressureLevel, ProcMetricsSource, RawSample, Sample, StatsError,
};
