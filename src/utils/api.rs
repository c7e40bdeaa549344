use crate::utils::models::{ JobStatusResponse, MeasurementRecord, TriggerResponse };
use crate::utils::normalize::{ normalize_direct_batch, NormalizeError, OffsetUnits };

use async_trait::async_trait;
use chrono::{ DateTime, SecondsFormat, Utc };
use log::{ debug, warn };
use serde_json::{ json, Value };
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const STATUS_NOT_READY: u16 = 405;
pub const STATUS_GATEWAY_TIMEOUT: u16 = 504;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("请求失败: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("无效的接口地址: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("开始时间 {start} 晚于结束时间 {end}")]
    InvalidRange { start: String, end: String },
    #[error("无效的任务ID: {0:?}")]
    InvalidJobId(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// 查询任务状态，轮询器只依赖这个接口
#[async_trait]
pub trait JobStatusFetcher: Send + Sync {
    async fn fetch_job_status(&self, job_id: &str) -> Result<JobStatusResponse, ApiError>;
}

// 直接测量接口的错误码 -> 给用户看的提示
pub fn describe_direct_failure(status: u16, server: &str) -> String {
    match status {
        404 => format!("找不到服务器 {}，请检查域名或IP地址", server),
        400 => format!("{} 不是有效的域名或IP地址", server),
        422 => format!("{} 的测量请求参数无效", server),
        429 => "请求过于频繁，请稍后再试".to_string(),
        500 => "测量服务内部错误".to_string(),
        other => format!("测量失败，HTTP状态码: {}", other),
    }
}

// 接口要求：UTC、精确到秒、以Z结尾，不带小数
pub fn format_api_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// 出错时，后端在 body 的 detail 字段里给出原因
fn extract_detail(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) =>
            match map.get("detail") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => body.trim().to_string(),
            }
        _ => body.trim().to_string(),
    }
}

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        // 没有以 "/" 结尾的话，join 会丢掉最后一段路径
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{}/", base_url))?
        };
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ApiClient { client, base_url })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    // 任务ID只占一段路径，其中的 "/" 会被转义
    pub fn job_endpoint(&self, job_id: &str) -> Result<Url, ApiError> {
        if matches!(job_id, "" | "." | "..") {
            return Err(ApiError::InvalidJobId(job_id.to_string()));
        }
        let mut url = self.endpoint("measurements/ripe/")?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push(job_id);
        Ok(url)
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = extract_detail(&body);
            warn!("HTTP {} | {}", status.as_u16(), detail);
            return Err(ApiError::Http { status: status.as_u16(), detail });
        }
        Ok(response.json::<Value>().await?)
    }

    /// 触发一次分布式探针测量，返回任务ID和发起测量的节点信息
    pub async fn trigger_probe_measurement(
        &self,
        server: &str,
        ipv6: bool
    ) -> Result<TriggerResponse, ApiError> {
        let url = self.endpoint("measurements/ripe/trigger/")?;
        debug!("POST {} server={} ipv6={}", url, server, ipv6);
        let response = self.client
            .post(url)
            .json(&json!({ "server": server, "ipv6_measurement": ipv6 }))
            .send().await?;
        let value = Self::read_json(response).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Normalize(NormalizeError::Shape(e)))
    }

    pub async fn measure_direct(
        &self,
        server: &str,
        ipv6: bool,
        units: OffsetUnits
    ) -> Result<Vec<MeasurementRecord>, ApiError> {
        let url = self.endpoint("measurements/")?;
        debug!("POST {} server={} ipv6={}", url, server, ipv6);
        let response = self.client
            .post(url)
            .json(&json!({ "server": server, "ipv6_measurement": ipv6 }))
            .send().await?;
        let value = Self::read_json(response).await?;
        // 有的版本把数组包在 measurement 字段里
        let items = match value {
            Value::Object(mut map) if map.contains_key("measurement") => {
                map.remove("measurement").unwrap_or(Value::Null)
            }
            other => other,
        };
        Ok(normalize_direct_batch(&items, units)?)
    }

    pub async fn fetch_history(
        &self,
        server: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        units: OffsetUnits
    ) -> Result<Vec<MeasurementRecord>, ApiError> {
        if start > end {
            return Err(ApiError::InvalidRange {
                start: format_api_datetime(&start),
                end: format_api_datetime(&end),
            });
        }
        let start = format_api_datetime(&start);
        let end_str = format_api_datetime(&end);
        let url = self.endpoint("measurements/history/")?;
        debug!("GET {} server={} start={} end={}", url, server, start, end_str);
        let response = self.client
            .get(url)
            .query(
                &[
                    ("server", server),
                    ("start", start.as_str()),
                    ("end", end_str.as_str()),
                ]
            )
            .send().await?;
        let value = Self::read_json(response).await?;
        let items = match value {
            Value::Object(mut map) if map.contains_key("measurements") => {
                map.remove("measurements").unwrap_or(Value::Null)
            }
            other => other,
        };
        Ok(normalize_direct_batch(&items, units)?)
    }
}

#[async_trait]
impl JobStatusFetcher for ApiClient {
    async fn fetch_job_status(&self, job_id: &str) -> Result<JobStatusResponse, ApiError> {
        let url = self.job_endpoint(job_id)?;
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        let value = Self::read_json(response).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Normalize(NormalizeError::Shape(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::{ AsyncReadExt, AsyncWriteExt };
    use tokio::net::{ TcpListener, TcpStream };
    use tokio::task::JoinHandle;

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    // 本地只应答一次的HTTP服务，返回收到的原始请求
    async fn serve_once(status_line: &str, body: &str) -> (ApiClient, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });
        // 绕过环境里的代理设置
        let client = ApiClient {
            client: reqwest::Client::builder().no_proxy().timeout(Duration::from_secs(5)).build().unwrap(),
            base_url: Url::parse(&format!("http://{}/", addr)).unwrap(),
        };
        (client, handle)
    }

    fn direct_json() -> Value {
        json!({
            "ntp_server_ip": "192.0.2.10",
            "ntp_server_name": "time.example.org",
            "offset": 0.0025,
            "rtt": 0.0131,
            "stratum": 2,
            "client_sent_time": { "seconds": 2_208_988_801i64, "fraction": 0 }
        })
    }

    #[tokio::test]
    async fn job_status_405_keeps_status() {
        let (client, server) = serve_once("405 Method Not Allowed", r#"{"detail": "not registered"}"#).await;
        let err = client.fetch_job_status("31").await.unwrap_err();
        assert_eq!(err.status(), Some(STATUS_NOT_READY));
        assert!(matches!(err, ApiError::Http { status: 405, .. }));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /measurements/ripe/31 "), "{}", request);
    }

    #[tokio::test]
    async fn job_status_504_keeps_detail() {
        let (client, server) = serve_once("504 Gateway Timeout", r#"{"detail": "upstream timed out"}"#).await;
        match client.fetch_job_status("31").await {
            Err(ApiError::Http { status, detail }) => {
                assert_eq!(status, STATUS_GATEWAY_TIMEOUT);
                assert_eq!(detail, "upstream timed out");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn job_status_body_is_parsed() {
        let body = json!({
            "status": "partial_results",
            "message": null,
            "results": [{ "ntp_server_ip": "192.0.2.10", "result": [] }]
        }).to_string();
        let (client, server) = serve_once("200 OK", &body).await;
        let response = client.fetch_job_status("31").await.unwrap();
        assert_eq!(response.status, "partial_results");
        assert!(response.message.is_none());
        assert_eq!(response.results.map(|r| r.len()), Some(1));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn direct_measurement_is_unwrapped_and_normalized() {
        let body = json!({ "measurement": [direct_json(), null] }).to_string();
        let (client, server) = serve_once("200 OK", &body).await;
        let records = client
            .measure_direct("time.example.org", false, OffsetUnits::Seconds).await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].server_ip, "192.0.2.10");
        assert!((records[0].offset.unwrap() - 2.5).abs() < 1e-9);
        assert_eq!(records[0].timestamp, 1000);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /measurements/ "), "{}", request);
        assert!(request.contains(r#""server":"time.example.org""#), "{}", request);
    }

    #[tokio::test]
    async fn history_sends_range_and_unwraps_measurements() {
        let body = json!({ "measurements": [direct_json()] }).to_string();
        let (client, server) = serve_once("200 OK", &body).await;
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let records = client
            .fetch_history("time.example.org", start, end, OffsetUnits::Seconds).await
            .unwrap();
        assert_eq!(records.len(), 1);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /measurements/history/?server=time.example.org&"), "{}", request);
        assert!(request.contains("start=2024-03-01T00%3A00%3A00Z"), "{}", request);
    }

    #[tokio::test]
    async fn direct_error_body_becomes_http_error() {
        let (client, server) = serve_once("404 Not Found", r#"{"detail": "Server not found"}"#).await;
        let err = client
            .measure_direct("nope.example.org", false, OffsetUnits::Seconds).await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.to_string(), "HTTP 404: Server not found");
        server.await.unwrap();
    }

    #[test]
    fn job_id_is_one_path_segment() {
        let client = ApiClient::new("http://localhost:8000/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.job_endpoint("42").unwrap().as_str(),
            "http://localhost:8000/api/measurements/ripe/42"
        );
        assert_eq!(
            client.job_endpoint("a/../b").unwrap().as_str(),
            "http://localhost:8000/api/measurements/ripe/a%2F..%2Fb"
        );
        assert!(matches!(client.job_endpoint(".."), Err(ApiError::InvalidJobId(_))));
        assert!(matches!(client.job_endpoint(""), Err(ApiError::InvalidJobId(_))));
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let client = ApiClient::new("http://localhost:8000/api", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint("measurements/ripe/42").unwrap().as_str(),
            "http://localhost:8000/api/measurements/ripe/42"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(ApiClient::new("not a url", Duration::from_secs(5)), Err(ApiError::Url(_))));
    }

    #[test]
    fn datetime_has_seconds_precision_and_z() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(format_api_datetime(&dt), "2024-03-01T12:30:05Z");
        let with_nanos = dt + chrono::Duration::milliseconds(250);
        assert_eq!(format_api_datetime(&with_nanos), "2024-03-01T12:30:05Z");
    }

    #[test]
    fn detail_is_read_from_error_body() {
        assert_eq!(extract_detail(r#"{"detail": "Server not found"}"#), "Server not found");
        assert_eq!(extract_detail("Bad Gateway\n"), "Bad Gateway");
        assert_eq!(extract_detail(r#"{"other": 1}"#), r#"{"other": 1}"#);
    }

    #[test]
    fn direct_failures_have_distinct_messages() {
        let messages: Vec<String> = [404u16, 400, 422, 429, 500, 418]
            .iter()
            .map(|s| describe_direct_failure(*s, "time.example.org"))
            .collect();
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(messages[5].contains("418"));
    }

    #[test]
    fn http_error_exposes_status() {
        let err = ApiError::Http { status: 504, detail: "timeout".into() };
        assert_eq!(err.status(), Some(STATUS_GATEWAY_TIMEOUT));
        let err = ApiError::InvalidRange { start: "b".into(), end: "a".into() };
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn history_rejects_reversed_range_before_request() {
        // 不会真的发出请求
        let client = ApiClient::new("http://127.0.0.1:9/", Duration::from_secs(1)).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let err = client
            .fetch_history("time.example.org", start, end, OffsetUnits::Seconds).await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRange { .. }));
    }
}
