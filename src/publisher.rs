//! 样本发布者：当前样本与版本号，以及版本变化订阅

use crate::quantize::quantize;
use crate::stats::{RawSample, Sample};
use std::sync::Arc;
use tokio::sync::watch;

/// 当前发布的状态：样本与版本号作为一个整体替换
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PublishedState {
    pub sample: Sample,
    /// 每发布一次加一，是唯一的变化信号
    pub version: u64,
}

/// 样本发布者
///
/// 写入只来自轮询器的串行合并步骤；读取可以来自任意上下文，
/// 总能看到某一次发布的完整状态。
pub struct SamplePublisher {
    tx: watch::Sender<PublishedState>,
}

impl SamplePublisher {
    /// 创建新的发布者，初始为默认样本、版本 0
    #[inline]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PublishedState::default());
        Self { tx }
    }

    /// 读取完整的当前状态
    #[inline]
    pub fn snapshot(&self) -> PublishedState {
        *self.tx.borrow()
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    #[inline]
    pub fn sample(&self) -> Sample {
        self.tx.borrow().sample
    }

    /// 订阅版本变化，订阅时的当前版本视为已读
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// 量化原始样本，有变化时替换状态并递增版本
    ///
    /// 返回是否发布了新版本。
    pub fn publish(&self, raw: &RawSample) -> bool {
        self.tx.send_if_modified(|state| {
            let (sample, changed) = quantize(&state.sample, raw);
            if changed {
                state.sample = sample;
                state.version += 1;
            }
            changed
        })
    }
}

impl Default for SamplePublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// 发布者引用类型别名
pub type PublisherRef = Arc<SamplePublisher>;

/// 版本变化订阅
///
/// 每个不同的版本最多通知一次；处理较慢时中间版本可能被合并。
pub struct Subscription {
    rx: watch::Receiver<PublishedState>,
}

impl Subscription {
    /// 等待下一个版本，发布者被释放后返回 `None`
    pub async fn next(&mut self) -> Option<PublishedState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// 读取当前状态，不影响通知
    #[inline]
    pub fn current(&self) -> PublishedState {
        *self.rx.borrow()
    }

    /// 读取当前状态并标记为已读，之后的 `next()` 只返回更新的版本
    #[inline]
    pub fn latest(&mut self) -> PublishedState {
        *self.rx.borrow_and_update()
    }
}
