//! 后台轮询器
//!
//! 每次运行是一个独立的 tokio 任务：采样、量化合并、休眠，直到被取消。
//! 采样在阻塞线程池中执行，不会阻塞读取发布状态的上下文。
//! 同一时刻最多只有一次采样在进行，跨运行也是如此。

use crate::publisher::PublisherRef;
use crate::stats::{MetricsSource, RawSample};
use anyhow::Result;
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

/// 共享的指标来源，采样过程串行访问
pub type SharedSource = Arc<Mutex<Box<dyn MetricsSource>>>;

/// 配置错误类型
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    ZeroInterval,
    ToleranceExceedsInterval,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroInterval => write!(f, "采样间隔不能为 0"),
            ConfigError::ToleranceExceedsInterval => write!(f, "唤醒容差不能大于采样间隔"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// 采样节奏配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    /// 两次采样之间的固定间隔
    pub interval: Duration,
    /// 唤醒容差：唤醒时间对齐到以此为步长的网格，便于与其他定时器合并
    pub tolerance: Duration,
}

impl SamplerConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
    pub const DEFAULT_TOLERANCE: Duration = Duration::from_millis(1500);

    /// 间隔不能为 0，容差不能大于间隔
    pub fn new(interval: Duration, tolerance: Duration) -> std::result::Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if tolerance > interval {
            return Err(ConfigError::ToleranceExceedsInterval);
        }
        Ok(Self {
            interval,
            tolerance,
        })
    }
}

impl Default for SamplerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            tolerance: Self::DEFAULT_TOLERANCE,
        }
    }
}

/// 轮询器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Stopped,
    Running,
}

/// 单次运行的取消信号
#[derive(Default)]
struct RunSignal {
    cancelled: AtomicBool,
    wake: Notify,
}

impl RunSignal {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        // 没有等待者时保留许可，下一次休眠会立即返回
        self.wake.notify_one();
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// 采样循环所需的共享资源
#[derive(Clone)]
struct LoopContext {
    source: SharedSource,
    publisher: PublisherRef,
    in_flight: Arc<AtomicBool>,
    config: SamplerConfig,
    epoch: Instant,
}

/// 后台轮询器
pub struct Poller {
    ctx: LoopContext,
    handle: Handle,
    current_run: Mutex<Option<Arc<RunSignal>>>,
}

impl Poller {
    /// 创建轮询器，初始为停止状态
    pub fn new(
        source: SharedSource,
        publisher: PublisherRef,
        config: SamplerConfig,
        handle: Handle,
    ) -> Self {
        Self {
            ctx: LoopContext {
                source,
                publisher,
                in_flight: Arc::new(AtomicBool::new(false)),
                config,
                epoch: Instant::now(),
            },
            handle,
            current_run: Mutex::new(None),
        }
    }

    #[inline]
    pub fn config(&self) -> SamplerConfig {
        self.ctx.config
    }

    pub fn state(&self) -> PollerState {
        if self.lock_run().is_some() {
            PollerState::Running
        } else {
            PollerState::Stopped
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == PollerState::Running
    }

    /// 启动新的运行，已在运行时先取消旧的运行
    ///
    /// 新运行的第一次采样前会重置 CPU 基线。
    pub fn start(&self) {
        let signal = Arc::new(RunSignal::default());
        let previous = self.lock_run().replace(signal.clone());
        if let Some(previous) = previous {
            debug!("轮询器重启，取消上一次运行");
            previous.cancel();
        }

        self.handle.spawn(run_loop(self.ctx.clone(), signal));
        info!("轮询器已启动，间隔 {:?}", self.ctx.config.interval);
    }

    /// 取消当前运行，不等待进行中的采样
    pub fn stop(&self) {
        if let Some(signal) = self.lock_run().take() {
            signal.cancel();
            info!("轮询器已停止");
        }
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<Arc<RunSignal>>> {
        self.current_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 采样循环
async fn run_loop(ctx: LoopContext, signal: Arc<RunSignal>) {
    let mut reset_pending = true;

    loop {
        if signal.is_cancelled() {
            break;
        }

        if ctx.in_flight.swap(true, Ordering::AcqRel) {
            trace!("上一次采样仍在进行，跳过本次");
        } else {
            let reset = std::mem::take(&mut reset_pending);
            let result = sample_once(ctx.source.clone(), reset).await;
            ctx.in_flight.store(false, Ordering::Release);

            if signal.is_cancelled() {
                debug!("运行已取消，丢弃本次采样结果");
                break;
            }

            match result {
                Ok(raw) => {
                    if ctx.publisher.publish(&raw) {
                        debug!("发布新样本，版本 {}", ctx.publisher.version());
                    } else {
                        trace!("量化后无变化，跳过发布");
                    }
                }
                Err(e) => {
                    warn!("采样失败，保留上一次的数据: {e}");
                    // 失败的采样可能已推进 CPU 基线，下一次重新重置
                    reset_pending |= reset;
                }
            }
        }

        let deadline = next_deadline(ctx.epoch, Instant::now(), &ctx.config);
        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = signal.wake.notified() => {}
        }
    }

    trace!("采样循环退出");
}

/// 在阻塞线程池中依次采样 CPU 和内存
async fn sample_once(source: SharedSource, reset_baseline: bool) -> Result<RawSample> {
    let raw = tokio::task::spawn_blocking(move || {
        let mut source = source.lock().unwrap_or_else(PoisonError::into_inner);
        if reset_baseline {
            source.reset_cpu_baseline();
        }
        let cpu_percent = source.sample_cpu_percent()?;
        let memory = source.sample_memory()?;
        Ok::<_, crate::stats::StatsError>(RawSample {
            cpu_percent,
            memory,
        })
    })
    .await??;

    Ok(raw)
}

/// 计算下一次唤醒时间
///
/// 结果落在 `[now + interval, now + interval + tolerance)` 内，
/// 并对齐到从 `epoch` 起以 `tolerance` 为步长的网格。
pub(crate) fn next_deadline(epoch: Instant, now: Instant, config: &SamplerConfig) -> Instant {
    let earliest = now + config.interval;
    let grid = config.tolerance.as_nanos();
    if grid == 0 {
        return earliest;
    }

    let offset = earliest.saturating_duration_since(epoch).as_nanos() % grid;
    if offset == 0 {
        return earliest;
    }
    u64::try_from(grid - offset)
        .ok()
        .and_then(|wait| earliest.checked_add(Duration::from_nanos(wait)))
        .unwrap_or(earliest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::SamplePublisher;
    use crate::testing::{ScriptedSource, SourceProbe};
    use tokio::time::sleep;

    fn fast_config() -> SamplerConfig {
        SamplerConfig::new(Duration::from_millis(20), Duration::ZERO).unwrap()
    }

    fn create_poller(source: ScriptedSource) -> (Poller, PublisherRef) {
        create_poller_with(source, fast_config())
    }

    fn create_poller_with(source: ScriptedSource, config: SamplerConfig) -> (Poller, PublisherRef) {
        let publisher: PublisherRef = Arc::new(SamplePublisher::new());
        let source: SharedSource = Arc::new(Mutex::new(Box::new(source)));
        let poller = Poller::new(source, publisher.clone(), config, Handle::current());
        (poller, publisher)
    }

    async fn wait_for_version(publisher: &PublisherRef, version: u64) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while publisher.version() < version {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    async fn wait_for_samples(probe: &SourceProbe, count: usize) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while probe.cpu_samples() < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    #[test]
    fn test_sampler_config_default() {
        let config = SamplerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(3));
        assert_eq!(config.tolerance, Duration::from_millis(1500));
    }

    #[test]
    fn test_sampler_config_rejects_zero_interval() {
        assert_eq!(
            SamplerConfig::new(Duration::ZERO, Duration::ZERO),
            Err(ConfigError::ZeroInterval)
        );
        assert_eq!(format!("{}", ConfigError::ZeroInterval), "采样间隔不能为 0");
    }

    #[test]
    fn test_sampler_config_rejects_tolerance_above_interval() {
        assert_eq!(
            SamplerConfig::new(Duration::from_secs(3), Duration::from_secs(600)),
            Err(ConfigError::ToleranceExceedsInterval)
        );
        assert!(SamplerConfig::new(Duration::from_secs(3), Duration::from_secs(3)).is_ok());
    }

    #[test]
    fn test_next_deadline_stays_within_tolerance() {
        let epoch = Instant::now();
        let config = SamplerConfig::new(Duration::from_secs(3), Duration::from_secs(3)).unwrap();
        let now = epoch + Duration::from_millis(1);
        let deadline = next_deadline(epoch, now, &config);

        assert!(deadline - now >= config.interval);
        assert!(deadline - now < config.interval + config.tolerance);
    }

    #[test]
    fn test_next_deadline_without_tolerance() {
        let epoch = Instant::now();
        let now = epoch + Duration::from_millis(1234);
        let config = SamplerConfig::new(Duration::from_secs(3), Duration::ZERO).unwrap();
        assert_eq!(next_deadline(epoch, now, &config), now + Duration::from_secs(3));
    }

    #[test]
    fn test_next_deadline_aligns_to_grid() {
        let epoch = Instant::now();
        let config = SamplerConfig::default();

        for offset_ms in [0u64, 1, 700, 1499, 1500, 2999, 4321] {
            let now = epoch + Duration::from_millis(offset_ms);
            let deadline = next_deadline(epoch, now, &config);
            let earliest = now + config.interval;

            assert!(deadline >= earliest);
            assert!(deadline < earliest + config.tolerance);
            assert_eq!((deadline - epoch).as_nanos() % config.tolerance.as_nanos(), 0);
        }
    }

    #[tokio::test]
    async fn test_poller_starts_stopped() {
        let (source, probe) = ScriptedSource::new(&[]);
        let (poller, publisher) = create_poller(source);
        assert_eq!(poller.state(), PollerState::Stopped);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(probe.cpu_samples(), 0);
        assert_eq!(publisher.version(), 0);
    }

    #[tokio::test]
    async fn test_first_sample_after_start_is_zero() {
        let (source, probe) = ScriptedSource::new(&[73.0]);
        let config = SamplerConfig::new(Duration::from_millis(150), Duration::ZERO).unwrap();
        let (poller, publisher) = create_poller_with(source, config);

        poller.start();
        assert!(poller.is_running());
        assert!(wait_for_version(&publisher, 1).await);
        assert_eq!(publisher.snapshot().sample.cpu_percent, 0);
        assert_eq!(probe.resets(), 1);

        assert!(wait_for_version(&publisher, 2).await);
        assert_eq!(publisher.sample().cpu_percent, 73);
        poller.stop();
    }

    #[tokio::test]
    async fn test_failed_pass_repeats_baseline_reset() {
        let (source, probe) = ScriptedSource::new(&[77.0]);
        let config = SamplerConfig::new(Duration::from_millis(150), Duration::ZERO).unwrap();
        let (poller, publisher) = create_poller_with(source.failing_memory(1), config);

        poller.start();
        assert!(wait_for_version(&publisher, 1).await);
        assert_eq!(publisher.snapshot().sample.cpu_percent, 0);
        assert_eq!(probe.resets(), 2);

        assert!(wait_for_version(&publisher, 2).await);
        assert_eq!(publisher.sample().cpu_percent, 77);
        poller.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (source, probe) = ScriptedSource::new(&[10.0]);
        let (poller, _publisher) = create_poller(source);

        poller.start();
        assert!(wait_for_samples(&probe, 1).await);
        poller.stop();
        poller.stop();
        assert_eq!(poller.state(), PollerState::Stopped);

        // 给循环一点时间观察到取消
        sleep(Duration::from_millis(60)).await;
        let settled = probe.cpu_samples();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.cpu_samples(), settled);
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_sample() {
        let (source, probe) = ScriptedSource::new(&[]);
        let (poller, publisher) = create_poller(source.with_delay(Duration::from_millis(150)));

        poller.start();
        sleep(Duration::from_millis(30)).await;
        poller.stop();

        assert!(wait_for_samples(&probe, 1).await);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(publisher.version(), 0);
    }

    #[tokio::test]
    async fn test_restart_never_overlaps_passes() {
        let (source, probe) = ScriptedSource::new(&[30.0, 31.0, 32.0]);
        let (poller, publisher) = create_poller(source.with_delay(Duration::from_millis(60)));

        poller.start();
        sleep(Duration::from_millis(10)).await;
        poller.start();
        assert!(poller.is_running());

        assert!(wait_for_version(&publisher, 1).await);
        assert!(wait_for_samples(&probe, 3).await);
        poller.stop();

        assert_eq!(probe.max_active(), 1);
        assert_eq!(probe.resets(), 2);
    }

    #[tokio::test]
    async fn test_failed_sample_keeps_previous_state() {
        let (source, probe) = ScriptedSource::new(&[50.0]);
        let (poller, publisher) = create_poller(source.failing());

        poller.start();
        assert!(wait_for_samples(&probe, 3).await);
        assert_eq!(publisher.version(), 0);
        assert!(poller.is_running());
        poller.stop();
    }
}
