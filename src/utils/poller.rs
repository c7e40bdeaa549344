//! 探针测量任务的轮询。
//!
//! 每个 `PollSession` 同一时间只拥有一个后台任务：换任务ID、清空任务ID或者丢弃会话时，
//! 旧任务的定时器和正在进行的请求都会被取消。状态通过 `watch` 通道对外发布。

use crate::utils::api::{ ApiError, JobStatusFetcher, STATUS_GATEWAY_TIMEOUT, STATUS_NOT_READY };
use crate::utils::models::{ JobStatusResponse, ProbeRecord };
use crate::utils::normalize::normalize_probe_batch;

use log::{ debug, error, info, warn };
use serde::Serialize;
use std::{
    fmt,
    sync::{ atomic::{ AtomicU64, Ordering }, Arc },
    time::Duration,
};
use tokio::{ sync::watch, task::JoinHandle };
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);
pub const NOT_READY_RETRY_DELAY: Duration = Duration::from_millis(5000);

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Pending,
    InProgress,
    Complete,
    TimedOut,
    Errored,
}

impl PollStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PollStatus::Complete | PollStatus::TimedOut | PollStatus::Errored)
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PollStatus::Pending => "pending",
            PollStatus::InProgress => "in-progress",
            PollStatus::Complete => "complete",
            PollStatus::TimedOut => "timed-out",
            PollStatus::Errored => "errored",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone)]
pub enum PollFailure {
    /// 任务本身报告了 error 状态
    JobReported(String),
    /// 上游网关超时 (504)
    UpstreamTimeout(Arc<ApiError>),
    Request(Arc<ApiError>),
}

impl fmt::Display for PollFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollFailure::JobReported(message) => write!(f, "测量任务出错: {}", message),
            PollFailure::UpstreamTimeout(e) => write!(f, "测量服务超时: {}", e),
            PollFailure::Request(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollSnapshot {
    pub job_id: Option<String>,
    pub status: PollStatus,
    pub results: Option<Vec<ProbeRecord>>,
    pub error: Option<PollFailure>,
}

impl PollSnapshot {
    fn idle() -> Self {
        PollSnapshot {
            job_id: None,
            status: PollStatus::Pending,
            results: None,
            error: None,
        }
    }

    fn started(job_id: &str) -> Self {
        PollSnapshot {
            job_id: Some(job_id.to_string()),
            status: PollStatus::InProgress,
            results: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub not_ready_retry: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: DEFAULT_POLL_INTERVAL,
            not_ready_retry: NOT_READY_RETRY_DELAY,
        }
    }
}

pub struct PollSession {
    fetcher: Arc<dyn JobStatusFetcher>,
    config: PollConfig,
    state: Arc<watch::Sender<PollSnapshot>>,
    generation: Arc<AtomicU64>,
    active: Option<(CancellationToken, JoinHandle<()>)>,
}

impl PollSession {
    pub fn new(fetcher: Arc<dyn JobStatusFetcher>, config: PollConfig) -> Self {
        let (state, _) = watch::channel(PollSnapshot::idle());
        PollSession {
            fetcher,
            config,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            active: None,
        }
    }

    /// 开始跟踪一个任务。`None` 或空字符串等同于 `reset`。
    ///
    /// 必须在 tokio 运行时中调用。
    pub fn start(&mut self, job_id: Option<&str>) {
        let job_id = match job_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                self.reset();
                return;
            }
        };
        let my_generation = self.cancel_active();
        self.state.send_replace(PollSnapshot::started(&job_id));
        info!("{} | 开始轮询，间隔 {} 毫秒", job_id, self.config.interval.as_millis());

        let token = CancellationToken::new();
        let task = PollTask {
            job_id,
            fetcher: Arc::clone(&self.fetcher),
            config: self.config,
            state: Arc::clone(&self.state),
            generation: Arc::clone(&self.generation),
            my_generation,
            token: token.clone(),
        };
        let handle = tokio::spawn(task.run());
        self.active = Some((token, handle));
    }

    pub fn reset(&mut self) {
        self.cancel_active();
        self.state.send_replace(PollSnapshot::idle());
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.state.borrow().clone()
    }

    /// 等到任务进入终止状态。会话处于 `Pending` 时不会返回。
    pub async fn wait_terminal(&self) -> PollSnapshot {
        let mut rx = self.state.subscribe();
        let snap = match rx.wait_for(|snap| snap.status.is_terminal()).await {
            Ok(snap) => snap.clone(),
            Err(_) => self.snapshot(),
        };
        snap
    }

    // 先让旧任务的发布失效，再取消它；返回新一代的编号
    fn cancel_active(&mut self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((token, handle)) = self.active.take() {
            token.cancel();
            handle.abort();
            debug!("已取消上一个轮询任务");
        }
        next
    }
}

impl Drop for PollSession {
    fn drop(&mut self) {
        self.cancel_active();
    }
}

enum Tick {
    Continue(Duration),
    Stop,
}

struct PollTask {
    job_id: String,
    fetcher: Arc<dyn JobStatusFetcher>,
    config: PollConfig,
    state: Arc<watch::Sender<PollSnapshot>>,
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl PollTask {
    async fn run(self) {
        loop {
            // 取消时，正在进行的请求随 future 一起丢弃
            let outcome = tokio::select! {
                _ = self.token.cancelled() => return,
                res = self.fetcher.fetch_job_status(&self.job_id) => res,
            };
            let delay = match self.handle_outcome(outcome) {
                Tick::Continue(delay) => delay,
                Tick::Stop => return,
            };
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn handle_outcome(&self, outcome: Result<JobStatusResponse, ApiError>) -> Tick {
        match outcome {
            Ok(response) => self.handle_response(response),
            Err(err) =>
                match err.status() {
                    Some(STATUS_NOT_READY) => {
                        warn!(
                            "{} | 任务还未登记，{} 毫秒后重试",
                            self.job_id,
                            self.config.not_ready_retry.as_millis()
                        );
                        Tick::Continue(self.config.not_ready_retry)
                    }
                    Some(STATUS_GATEWAY_TIMEOUT) => {
                        error!("{} | 测量服务超时: {}", self.job_id, err);
                        self.finish(PollStatus::TimedOut, Some(PollFailure::UpstreamTimeout(Arc::new(err))));
                        Tick::Stop
                    }
                    _ => {
                        error!("{} | 获取任务状态失败: {}", self.job_id, err);
                        self.finish(PollStatus::Errored, Some(PollFailure::Request(Arc::new(err))));
                        Tick::Stop
                    }
                }
        }
    }

    fn handle_response(&self, response: JobStatusResponse) -> Tick {
        let results = match response.results.as_deref().map(normalize_probe_batch) {
            Some(Ok(records)) => Some(records),
            Some(Err(e)) => {
                error!("{} | 结果数据无法解析: {}", self.job_id, e);
                let err = Arc::new(ApiError::Normalize(e));
                self.finish(PollStatus::Errored, Some(PollFailure::Request(err)));
                return Tick::Stop;
            }
            None => None,
        };
        let count = results.as_ref().map(Vec::len);

        let (status, failure, tick) = match response.status.as_str() {
            "pending" | "partial_results" => {
                (PollStatus::InProgress, None, Tick::Continue(self.config.interval))
            }
            "complete" | "timeout" => (PollStatus::Complete, None, Tick::Stop),
            "error" => {
                let message = response.message.unwrap_or_else(|| "未知错误".to_string());
                (PollStatus::Errored, Some(PollFailure::JobReported(message)), Tick::Stop)
            }
            other => {
                let message = format!("未知的任务状态: {}", other);
                (PollStatus::Errored, Some(PollFailure::JobReported(message)), Tick::Stop)
            }
        };

        let published = self.publish(|snap| {
            // 每次的结果直接替换上一次的，不做合并
            if let Some(records) = results {
                snap.results = Some(records);
            }
            snap.status = status;
            snap.error = failure;
        });
        if !published {
            return Tick::Stop;
        }

        match status {
            PollStatus::InProgress => debug!("{} | {} | 结果 {:?} 条", self.job_id, response.status, count),
            PollStatus::Errored => error!("{} | 任务报告错误", self.job_id),
            _ => info!("{} | 轮询结束: {} | 结果 {:?} 条", self.job_id, response.status, count),
        }
        tick
    }

    fn finish(&self, status: PollStatus, failure: Option<PollFailure>) {
        self.publish(|snap| {
            snap.status = status;
            snap.error = failure;
        });
    }

    // 会话已换成新任务时，旧任务的结果直接丢弃
    fn publish(&self, apply: impl FnOnce(&mut PollSnapshot)) -> bool {
        self.state.send_if_modified(|snap| {
            if self.generation.load(Ordering::SeqCst) != self.my_generation {
                return false;
            }
            apply(snap);
            true
        })
    }
}
