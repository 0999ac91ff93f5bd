//! 生命周期控制：按观察者引用计数启停轮询

use crate::poller::{Poller, SamplerConfig, SharedSource};
use crate::publisher::{PublishedState, PublisherRef, SamplePublisher, Subscription};
use crate::stats::{MetricsSource, Sample};
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;

/// 系统资源监控服务
///
/// 整个进程只构建一个实例，通过 [`MonitorRef`] 共享给所有观察者。
/// 按客户端引用计数启停轮询：计数从 0 变为 1 时启动，从 1 变为 0 时停止。
/// 观察者只能读取发布的状态，不能写入。
pub struct Monitor {
    publisher: PublisherRef,
    poller: Poller,
    clients: Mutex<usize>,
}

/// 监控服务引用类型别名
pub type MonitorRef = Arc<Monitor>;

impl Monitor {
    /// 创建监控服务，轮询任务在 `handle` 指向的运行时上执行
    pub fn new<S: MetricsSource>(source: S, config: SamplerConfig, handle: Handle) -> Self {
        let publisher: PublisherRef = Arc::new(SamplePublisher::new());
        let source: SharedSource = Arc::new(Mutex::new(Box::new(source)));
        let poller = Poller::new(source, publisher.clone(), config, handle);

        Self {
            publisher,
            poller,
            clients: Mutex::new(0),
        }
    }

    /// 登记一个客户端，第一个客户端会启动轮询并重置 CPU 基线
    pub fn acquire(&self) {
        let mut clients = self.lock_clients();
        *clients += 1;
        if *clients == 1 {
            info!("第一个客户端接入，开始采样");
            self.poller.start();
        } else {
            debug!("客户端接入，当前 {} 个", *clients);
        }
    }

    /// 注销一个客户端，最后一个客户端离开时停止轮询
    ///
    /// 计数已为 0 时什么也不做。
    pub fn release(&self) {
        let mut clients = self.lock_clients();
        match *clients {
            0 => debug!("没有客户端时收到释放请求，忽略"),
            1 => {
                *clients = 0;
                info!("最后一个客户端离开，停止采样");
                self.poller.stop();
            }
            _ => {
                *clients -= 1;
                debug!("客户端离开，剩余 {} 个", *clients);
            }
        }
    }

    /// 获取一个租约，租约释放时自动注销客户端
    pub fn lease(self: &Arc<Self>) -> Lease {
        self.acquire();
        Lease {
            monitor: self.clone(),
        }
    }

    pub fn client_count(&self) -> usize {
        *self.lock_clients()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }

    #[inline]
    pub fn config(&self) -> SamplerConfig {
        self.poller.config()
    }

    #[inline]
    pub fn snapshot(&self) -> PublishedState {
        self.publisher.snapshot()
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.publisher.version()
    }

    #[inline]
    pub fn sample(&self) -> Sample {
        self.publisher.sample()
    }

    #[inline]
    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    fn lock_clients(&self) -> MutexGuard<'_, usize> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 客户端租约
pub struct Lease {
    monitor: MonitorRef,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.monitor.release();
    }
}
