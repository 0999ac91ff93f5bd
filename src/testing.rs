//! 单元测试用的脚本化指标来源

use crate::stats::{MemoryInfo, MetricsSource, PressureLevel, Result, StatsError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// 记录来源被调用的情况
#[derive(Debug, Default)]
pub struct SourceProbe {
    pub cpu_samples: AtomicUsize,
    pub resets: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl SourceProbe {
    pub fn cpu_samples(&self) -> usize {
        self.cpu_samples.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// 按脚本返回 CPU 读数，并模拟 tick 增量语义：基线重置后首次读数为 0
pub struct ScriptedSource {
    cpu: VecDeque<f64>,
    last_cpu: f64,
    has_baseline: bool,
    memory: MemoryInfo,
    delay: Duration,
    failing: bool,
    memory_failures: usize,
    probe: Arc<SourceProbe>,
}

impl ScriptedSource {
    pub fn new(cpu: &[f64]) -> (Self, Arc<SourceProbe>) {
        let probe = Arc::new(SourceProbe::default());
        let source = Self {
            cpu: cpu.iter().copied().collect(),
            last_cpu: 0.0,
            has_baseline: false,
            memory: test_memory(4.0),
            delay: Duration::ZERO,
            failing: false,
            memory_failures: 0,
            probe: probe.clone(),
        };
        (source, probe)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// 前 `count` 次内存读取失败，CPU 读取照常推进基线
    pub fn failing_memory(mut self, count: usize) -> Self {
        self.memory_failures = count;
        self
    }
}

/// 测试用内存信息：总量 16 GB
pub fn test_memory(used: f64) -> MemoryInfo {
    MemoryInfo {
        total: 16.0,
        used,
        cached: 1.5,
        pressure: PressureLevel::Normal,
        compression_ratio: 1.0,
    }
}

impl MetricsSource for ScriptedSource {
    fn sample_cpu_percent(&mut self) -> Result<f64> {
        let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.probe.cpu_samples.fetch_add(1, Ordering::SeqCst);
        self.probe.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing {
            return Err(StatsError::IoError(std::io::Error::other("scripted failure")));
        }
        if !self.has_baseline {
            self.has_baseline = true;
            return Ok(0.0);
        }
        if let Some(next) = self.cpu.pop_front() {
            self.last_cpu = next;
        }
        Ok(self.last_cpu)
    }

    fn sample_memory(&mut self) -> Result<MemoryInfo> {
        if self.memory_failures > 0 {
            self.memory_failures -= 1;
            return Err(StatsError::ParseError("scripted memory failure".to_string()));
        }
        Ok(self.memory)
    }

    fn reset_cpu_baseline(&mut self) {
        self.probe.resets.fetch_add(1, Ordering::SeqCst);
        self.has_baseline = false;
    }
}
