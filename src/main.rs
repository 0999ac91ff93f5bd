use anyhow::Result;
use clap::Parser;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use swb_sys_sampler::{Config, Monitor, ProcMetricsSource, SamplerConfig, StatusServer};
use tokio::runtime::Handle;

/// 按需采样的系统资源监控
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 服务器绑定地址 (默认: ::，支持 IPv4 和 IPv6)
    #[arg(short, long, default_value = "::")]
    address: String,

    /// 服务器端口 (默认: 8080)
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// 采样间隔秒数，范围 1-10 (默认: 3)
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..=10))]
    interval: u64,

    /// 唤醒容差毫秒数，范围 0-10000 且不大于采样间隔 (默认: 1500，超过间隔时取间隔)
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(0..=10_000))]
    tolerance_ms: Option<u64>,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// 构建采样节奏配置；未指定容差时使用默认值，但不超过采样间隔
    fn sampler_config(&self) -> Result<SamplerConfig> {
        let interval = Duration::from_secs(self.interval);
        let tolerance = match self.tolerance_ms {
            Some(ms) => Duration::from_millis(ms),
            None => SamplerConfig::DEFAULT_TOLERANCE.min(interval),
        };
        Ok(SamplerConfig::new(interval, tolerance)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志系统
    init_logger(&args.log_level);

    info!("系统资源采样服务启动中...");

    let config = Config {
        bind_address: args.address.clone(),
        port: args.port,
        sampler: args.sampler_config()?,
    };

    info!(
        "配置信息 - 地址: {}, 端口: {}, 采样间隔: {:?}, 唤醒容差: {:?}",
        config.bind_address, config.port, config.sampler.interval, config.sampler.tolerance
    );

    // 整个进程只有一个监控服务实例
    let monitor = Arc::new(Monitor::new(
        ProcMetricsSource::new(),
        config.sampler,
        Handle::current(),
    ));
    info!("监控服务初始化完成，等待客户端接入");

    let server = StatusServer::new(monitor);
    let addr = config.address()?;
    info!("服务器将在 {addr} 启动");

    server.run(addr).await?;

    info!("服务器正常关闭");

    Ok(())
}

/// 初始化日志系统
fn init_logger(level: &str) {
    match env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .try_init()
    {
        Ok(_) => info!("日志系统初始化成功，级别: {level}"),
        Err(e) => eprintln!("日志系统初始化失败: {e}，继续运行但不输出日志"),
    }
}
