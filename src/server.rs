use crate::monitor::MonitorRef;
use crate::poller::SamplerConfig;
use crate::publisher::PublishedState;
use crate::quantize::Severity;
use anyhow::{Result, anyhow};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use hyper::http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// 状态服务器
///
/// 只读地展示监控服务发布的数据。`/stream` 连接期间持有一个租约，
/// 因此有人在看时才会采样。
pub struct StatusServer {
    monitor: MonitorRef,
    keepalive: Duration,
}

impl StatusServer {
    /// 流式连接的默认保活间隔，用于及时发现已断开的客户端
    pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

    /// 创建新的状态服务器实例
    #[inline]
    pub fn new(monitor: MonitorRef) -> Self {
        Self {
            monitor,
            keepalive: Self::DEFAULT_KEEPALIVE,
        }
    }

    /// 运行服务器，收到 Ctrl-C 后优雅关闭
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let monitor = self.monitor;
        let keepalive = self.keepalive;

        let make_svc = make_service_fn(move |_conn| {
            let monitor = monitor.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    Self::handle_request(req, monitor.clone(), keepalive)
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .map_err(|e| anyhow!("无法绑定 {addr}: {e}"))?
            .http1_keepalive(true)
            .tcp_nodelay(true)
            .serve(make_svc)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("无法监听关闭信号: {e}");
                    std::future::pending::<()>().await;
                }
                info!("收到关闭信号");
            });

        info!("服务器运行在: http://{addr}");

        server.await.map_err(|e| {
            error!("服务器错误: {e}");
            anyhow!("服务器运行错误: {e}")
        })?;

        Ok(())
    }

    /// 处理 HTTP 请求
    async fn handle_request(
        req: Request<Body>,
        monitor: MonitorRef,
        keepalive: Duration,
    ) -> std::result::Result<Response<Body>, Infallible> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/") => Ok(Self::serve_snapshot(&monitor)),
            (&Method::GET, "/stream") => Ok(Self::serve_stream(monitor, keepalive)),
            (&Method::GET, "/health") => Ok(Self::serve_health()),
            _ => Ok(Self::serve_404()),
        }
    }

    fn text_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
        let mut response = Response::new(body.into());
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    }

    /// 提供健康检查端点
    #[inline]
    fn serve_health() -> Response<Body> {
        Self::text_response(StatusCode::OK, "OK")
    }

    /// 提供 404 页面
    #[inline]
    fn serve_404() -> Response<Body> {
        warn!("请求了不存在的页面");
        Self::text_response(StatusCode::NOT_FOUND, "页面未找到")
    }

    /// 当前状态快照，不持有租约
    fn serve_snapshot(monitor: &MonitorRef) -> Response<Body> {
        let mut text = Self::render_state(&monitor.snapshot());
        text.push_str(&format!(
            "采样: {}\n客户端: {}\n",
            if monitor.is_running() { "进行中" } else { "空闲" },
            monitor.client_count()
        ));
        Self::text_response(StatusCode::OK, text)
    }

    /// 流式输出：每个新版本一行，连接期间持有租约
    fn serve_stream(monitor: MonitorRef, keepalive: Duration) -> Response<Body> {
        let (mut tx, body) = Body::channel();
        let lease = monitor.lease();
        let mut subscription = monitor.subscribe();

        tokio::spawn(async move {
            let _lease = lease;
            let mut ticker = tokio::time::interval(keepalive);
            ticker.tick().await;

            // 首行读取的版本标记为已读，避免 next() 重复推送
            let first = Self::render_line(&subscription.latest());
            if tx.send_data(first.into()).await.is_err() {
                return;
            }

            loop {
                let chunk = tokio::select! {
                    state = subscription.next() => match state {
                        Some(state) => Self::render_line(&state),
                        None => break,
                    },
                    _ = ticker.tick() => "\n".to_string(),
                };
                if tx.send_data(chunk.into()).await.is_err() {
                    debug!("流式客户端已断开");
                    break;
                }
            }
        });

        Self::text_response(StatusCode::OK, body)
    }

    /// 渲染多行状态文本
    pub fn render_state(state: &PublishedState) -> String {
        let sample = &state.sample;
        let memory = &sample.memory;
        let cpu_severity = Severity::for_percent(f64::from(sample.cpu_percent));
        let used_percent = memory.used_percent();

        format!(
            "版本: {}\n处理器: {}% ({})\n内存: {:.1} / {:.1} GB ({:.1}%, {})\n缓存: {:.1} GB\n内存压力: {}\n压缩比: {:.2}\n",
            state.version,
            sample.cpu_percent,
            cpu_severity.as_str(),
            memory.used,
            memory.total,
            used_percent,
            Severity::for_percent(used_percent).as_str(),
            memory.cached,
            memory.pressure.as_str(),
            memory.compression_ratio,
        )
    }

    /// 渲染单行状态，用于流式输出
    pub fn render_line(state: &PublishedState) -> String {
        let sample = &state.sample;
        let memory = &sample.memory;
        format!(
            "v{} cpu={}% mem={:.1}/{:.1}GB ({:.1}%) cached={:.1}GB pressure={} ratio={:.2}\n",
            state.version,
            sample.cpu_percent,
            memory.used,
            memory.total,
            memory.used_percent(),
            memory.cached,
            memory.pressure.as_str(),
            memory.compression_ratio,
        )
    }
}

/// 配置结构
#[derive(Debug, Clone)]
pub struct Config {
    /// 服务端绑定地址
    pub bind_address: String,
    /// 服务端端口
    pub port: u16,
    /// 采样节奏
    pub sampler: SamplerConfig,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            sampler: SamplerConfig::default(),
        }
    }
}

impl Config {
    /// 构建服务器地址，同时支持 IPv4 与 IPv6
    pub fn address(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|e| anyhow!("无效的地址格式 {}: {e}", self.bind_address))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}
