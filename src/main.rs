mod utils;

use crate::utils::api::{ describe_direct_failure, ApiClient, ApiError, JobStatusFetcher };
use crate::utils::common::{ format_duration, sort_records };
use crate::utils::config::{ poll_config, Cli, Command, TargetArgs };
use crate::utils::files::{ read_text_file, summary_line, write_json, write_probe_csv, write_records_csv };
use crate::utils::logger::init_logger;
use crate::utils::models::{ MeasurementRecord, ProbeRecord };
use crate::utils::network::classify_target;
use crate::utils::plot::{ offset_series, probe_markers, rtt_series, summarize, thin_points, Series };
use crate::utils::poller::{ PollSession, PollStatus };

use chrono::{ DateTime, Utc };
use clap::Parser;
use log::{ error, info, warn };
use std::{ error::Error, sync::Arc, time::Instant };
use tokio::task::JoinSet;

fn export_records(cli: &Cli, records: &[MeasurementRecord]) -> Result<(), Box<dyn Error>> {
    if let Some(path) = &cli.csv {
        write_records_csv(path, records)?;
        info!("已写入 {}", path.display());
    }
    if let Some(path) = &cli.json {
        write_json(path, records)?;
        info!("已写入 {}", path.display());
    }
    Ok(())
}

fn export_probes(cli: &Cli, probes: &[ProbeRecord]) -> Result<(), Box<dyn Error>> {
    if let Some(path) = &cli.csv {
        write_probe_csv(path, probes)?;
        info!("已写入 {}", path.display());
    }
    if let Some(path) = &cli.json {
        write_json(path, probes)?;
        info!("已写入 {}", path.display());
    }
    Ok(())
}

fn log_series(label: &str, series: &[Series], max_points: usize) {
    for s in series {
        let points = thin_points(&s.points, max_points);
        if let Some(summary) = summarize(&s.points) {
            info!(
                "{} | {} | {} 个点（图表 {} 个） | 最小 {:.3} ms | 最大 {:.3} ms | 平均 {:.3} ms",
                label,
                s.server,
                summary.count,
                points.len(),
                summary.min,
                summary.max,
                summary.mean
            );
        }
    }
}

async fn run_measure(cli: &Cli, client: &ApiClient, args: &TargetArgs) -> Result<(), Box<dyn Error>> {
    let target = classify_target(&args.server)?;
    let ipv6 = target.prefers_ipv6(args.ipv6);
    info!("直接测量 {} (IPv6: {})", target.host, ipv6);

    let mut records = match client.measure_direct(&target.host, ipv6, cli.direct_units).await {
        Ok(records) => records,
        Err(ApiError::Http { status, detail }) => {
            error!("{} | {}", describe_direct_failure(status, &target.host), detail);
            return Err(Box::new(ApiError::Http { status, detail }));
        }
        Err(e) => {
            return Err(Box::new(e));
        }
    };
    if records.is_empty() {
        warn!("{} | 没有返回任何测量结果", target.host);
    }
    sort_records(&mut records);
    for record in &records {
        info!("{}", summary_line(record));
    }
    export_records(cli, &records)
}

async fn run_probes(
    cli: &Cli,
    client: &ApiClient,
    args: &TargetArgs,
    interval_ms: u64,
    max_points: usize
) -> Result<(), Box<dyn Error>> {
    let target = classify_target(&args.server)?;
    let ipv6 = target.prefers_ipv6(args.ipv6);
    let trigger = client.trigger_probe_measurement(&target.host, ipv6).await?;
    info!(
        "已提交探针测量 {} | 任务ID: {} | 发起节点: {}",
        target.host,
        trigger.measurement_id,
        trigger.vantage_point_ip.as_deref().unwrap_or("-")
    );

    let fetcher: Arc<dyn JobStatusFetcher> = Arc::new(client.clone());
    let mut session = PollSession::new(fetcher, poll_config(interval_ms));

    // 每次状态变化都输出一次进度
    let mut rx = session.subscribe();
    let progress = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let (job_id, status, count) = {
                let snap = rx.borrow_and_update();
                (
                    snap.job_id.clone().unwrap_or_else(|| "-".to_string()),
                    snap.status,
                    snap.results.as_ref().map(Vec::len).unwrap_or(0),
                )
            };
            info!("{} | {} | 已收到 {} 个探针的结果", job_id, status, count);
        }
    });

    session.start(Some(&trigger.measurement_id));
    let snapshot = tokio::select! {
        snap = session.wait_terminal() => snap,
        _ = tokio::signal::ctrl_c() => {
            warn!("已中断，停止轮询");
            session.reset();
            progress.abort();
            return Ok(());
        }
    };
    progress.abort();

    let probes = snapshot.results.unwrap_or_default();
    match snapshot.status {
        PollStatus::Complete => {
            let answered = probes
                .iter()
                .filter(|p| p.got_results)
                .count();
            info!("测量完成 | {} 个探针，其中 {} 个有结果", probes.len(), answered);
            if let Some(counts) = probes.iter().find_map(|p| p.probe_counts) {
                info!(
                    "探针选择 | ASN {} | 前缀 {} | 国家 {} | 区域 {} | 随机 {} | 共 {}",
                    counts.asn,
                    counts.prefix,
                    counts.country,
                    counts.area,
                    counts.random,
                    counts.total()
                );
            }
        }
        PollStatus::TimedOut => warn!("测量服务超时，只显示已收到的结果"),
        _ => {
            if let Some(failure) = &snapshot.error {
                error!("{}", failure);
            }
        }
    }

    for probe in &probes {
        let m = &probe.measurement;
        info!(
            "探针 {} | {} | {}",
            probe.probe_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            m.vantage_point_ip.as_deref().unwrap_or("-"),
            summary_line(m)
        );
    }
    let markers = probe_markers(&probes);
    info!("地图上共 {} 个探针点", markers.len());

    let records: Vec<MeasurementRecord> = probes
        .iter()
        .map(|p| p.measurement.clone())
        .collect();
    log_series("RTT", &rtt_series(&records), max_points);
    export_probes(cli, &probes)?;

    match (snapshot.status, snapshot.error) {
        (PollStatus::Errored, Some(failure)) => Err(failure.to_string().into()),
        _ => Ok(()),
    }
}

async fn run_history(
    cli: &Cli,
    client: &ApiClient,
    server: &str,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    max_points: usize
) -> Result<(), Box<dyn Error>> {
    let target = classify_target(server)?;
    let end = end.unwrap_or_else(Utc::now);
    let mut records = client.fetch_history(&target.host, start, end, cli.direct_units).await?;
    info!("{} | 历史数据 {} 条", target.host, records.len());

    sort_records(&mut records);
    log_series("offset", &offset_series(&records), max_points);
    log_series("RTT", &rtt_series(&records), max_points);
    export_records(cli, &records)
}

async fn run_batch(
    cli: &Cli,
    client: &ApiClient,
    file: &std::path::Path,
    ipv6: bool
) -> Result<(), Box<dyn Error>> {
    let lines = match read_text_file(file) {
        Ok(lines) => lines,
        Err(e) => {
            error!("打开{}文件失败，错误原因是:{}", file.display(), e);
            return Err(Box::new(e));
        }
    };
    if lines.is_empty() {
        return Err(format!("{}文件是空的", file.display()).into());
    }

    let mut tasks = JoinSet::new();
    for line in lines {
        let target = match classify_target(&line) {
            Ok(target) => target,
            Err(e) => {
                warn!("{} | 跳过: {}", line, e);
                continue;
            }
        };
        let client = client.clone();
        let units = cli.direct_units;
        tasks.spawn(async move {
            let ipv6 = target.prefers_ipv6(ipv6);
            let result = client.measure_direct(&target.host, ipv6, units).await;
            (target.host, result)
        });
    }

    let mut records = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(batch))) => records.extend(batch),
            Ok((host, Err(ApiError::Http { status, .. }))) => {
                warn!("{} | {}", host, describe_direct_failure(status, &host));
            }
            Ok((host, Err(e))) => warn!("{} | {}", host, e),
            Err(e) => warn!("测量任务异常退出: {}", e),
        }
    }

    sort_records(&mut records);
    for record in &records {
        info!("{}", summary_line(record));
    }
    export_records(cli, &records)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(cli.verbose)?;
    let start_time = Instant::now();
    let client = ApiClient::new(&cli.api_url, cli.request_timeout())?;

    match &cli.command {
        Command::Measure(args) => run_measure(&cli, &client, args).await?,
        Command::Probes { target, interval_ms, max_points } => {
            run_probes(&cli, &client, target, *interval_ms, *max_points).await?
        }
        Command::History { server, start, end, max_points } => {
            run_history(&cli, &client, server, *start, *end, *max_points).await?
        }
        Command::Batch { file, ipv6 } => run_batch(&cli, &client, file, *ipv6).await?,
    }

    // 计算程序运行的总时长
    let (elapsed_time, unit) = format_duration(start_time.elapsed());
    info!("程序运行结束，耗时：{:.2} {}", elapsed_time, unit);
    Ok(())
}
