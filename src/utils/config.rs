use crate::utils::normalize::OffsetUnits;
use crate::utils::poller::{ PollConfig, NOT_READY_RETRY_DELAY };

use chrono::{ DateTime, NaiveDate, Utc };
use clap::{ Args, Parser, Subcommand };
use std::{ path::PathBuf, time::Duration };

pub const MIN_POLL_INTERVAL_MS: u64 = 100;

#[derive(Parser, Debug)]
#[command(name = "ntp_dash_client", version, about = "NTP测量服务的命令行客户端")]
pub struct Cli {
    /// 测量服务的地址
    #[arg(long, env = "NTP_API_URL", default_value = "http://localhost:8000/")]
    pub api_url: String,

    /// 单个HTTP请求的超时（秒）
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// 直接测量接口返回的 offset/rtt 单位
    #[arg(long, value_enum, default_value_t = OffsetUnits::Seconds)]
    pub direct_units: OffsetUnits,

    /// 结果写入CSV文件
    #[arg(long, global = true)]
    pub csv: Option<PathBuf>,

    /// 结果写入JSON文件
    #[arg(long, global = true)]
    pub json: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 从测量服务所在节点直接测量一个NTP服务器
    Measure(TargetArgs),
    /// 通过分布式探针测量，并轮询结果
    Probes {
        #[command(flatten)]
        target: TargetArgs,
        /// 轮询间隔（毫秒），不小于 100
        #[arg(
            long,
            default_value_t = 3000,
            value_parser = clap::value_parser!(u64).range(MIN_POLL_INTERVAL_MS..)
        )]
        interval_ms: u64,
        /// 图表最多保留的点数
        #[arg(long, default_value_t = 200)]
        max_points: usize,
    },
    /// 查询历史测量数据
    History {
        server: String,
        /// 开始时间，RFC 3339 或 YYYY-MM-DD
        #[arg(long, value_parser = parse_datetime)]
        start: DateTime<Utc>,
        /// 结束时间，默认是现在
        #[arg(long, value_parser = parse_datetime)]
        end: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 200)]
        max_points: usize,
    },
    /// 从文件读取多个目标，逐个直接测量
    Batch {
        #[arg(long, default_value = "targets.txt")]
        file: PathBuf,
        #[arg(long)]
        ipv6: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// 域名或IP地址
    pub server: String,
    /// 使用IPv6测量
    #[arg(long)]
    pub ipv6: bool,
}

impl Cli {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

pub fn poll_config(interval_ms: u64) -> PollConfig {
    PollConfig {
        interval: Duration::from_millis(interval_ms),
        not_ready_retry: NOT_READY_RETRY_DELAY,
    }
}

pub fn parse_datetime(input: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    match NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        Ok(date) =>
            date
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc())
                .ok_or_else(|| format!("无效的日期: {}", input)),
        Err(_) => Err(format!("无法解析的时间: {}，请使用 RFC 3339 或 YYYY-MM-DD", input)),
    }
}
