use serde::{ Deserialize, Serialize };
use std::fmt;

/// NTP时间戳（秒 + 小数部分），秒数从NTP纪元（1900年）开始计算
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct NtpTimestamp {
    pub seconds: i64,
    #[serde(default)]
    pub fraction: i64,
}

impl fmt::Display for NtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.seconds, self.fraction)
    }
}

// 直接测量接口返回的原始数据
#[derive(Debug, Deserialize, Clone)]
pub struct RawDirectMeasurement {
    pub ntp_server_ip: String,
    #[serde(default)]
    pub ntp_server_name: Option<String>,
    #[serde(default)]
    pub vantage_point_ip: Option<String>,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub rtt: Option<f64>,
    #[serde(default)]
    pub stratum: Option<i64>,
    #[serde(default)]
    pub precision: Option<f64>,
    #[serde(default)]
    pub poll: Option<i64>,
    #[serde(default)]
    pub root_delay: Option<f64>,
    #[serde(default)]
    pub root_dispersion: Option<f64>,
    pub client_sent_time: NtpTimestamp,
    #[serde(default)]
    pub jitter: Option<f64>,
    #[serde(default)]
    pub nr_measurements_jitter: Option<i64>,
    #[serde(default)]
    pub ntp_last_sync_time: Option<NtpTimestamp>,
    #[serde(default)]
    pub leap: Option<i64>,
    #[serde(default, alias = "ref_name")]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub ntp_server_ref_parent_ip: Option<String>,
    #[serde(default)]
    pub is_anycast: Option<bool>,
    #[serde(default)]
    pub country_code: Option<String>,
    // 已经是 (纬度, 经度) 的顺序
    #[serde(default)]
    pub coordinates: Option<[f64; 2]>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawProbeAddr {
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawProbeLocation {
    #[serde(default)]
    pub country_code: Option<String>,
    // 探针上报的是 (经度, 纬度)
    #[serde(default)]
    pub coordinates: Option<[f64; 2]>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawProbeResult {
    pub client_sent_time: NtpTimestamp,
    pub offset: f64,
    pub rtt: f64,
}

/// 探针选择的类别统计：ASN、前缀、国家、区域、随机
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeCounts {
    #[serde(default)]
    pub asn: u32,
    #[serde(default)]
    pub prefix: u32,
    #[serde(default)]
    pub country: u32,
    #[serde(default)]
    pub area: u32,
    #[serde(default)]
    pub random: u32,
}

impl ProbeCounts {
    pub fn as_array(&self) -> [u32; 5] {
        [self.asn, self.prefix, self.country, self.area, self.random]
    }

    pub fn total(&self) -> u32 {
        self.as_array().iter().sum()
    }
}

// 探针转发的测量数据（RIPE Atlas 之类的分布式探针）
#[derive(Debug, Deserialize, Clone)]
pub struct RawProbeMeasurement {
    pub ntp_server_ip: String,
    #[serde(default)]
    pub ntp_server_name: Option<String>,
    #[serde(default)]
    pub probe_id: Option<i64>,
    #[serde(default)]
    pub probe_addr: RawProbeAddr,
    pub probe_location: RawProbeLocation,
    #[serde(default)]
    pub measurement_id: Option<i64>,
    #[serde(default)]
    pub stratum: Option<i64>,
    #[serde(default)]
    pub precision: Option<f64>,
    #[serde(default)]
    pub poll: Option<i64>,
    #[serde(default)]
    pub root_delay: Option<f64>,
    #[serde(default)]
    pub root_dispersion: Option<f64>,
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub probe_count_per_type: Option<ProbeCounts>,
    #[serde(default)]
    pub result: Option<Vec<RawProbeResult>>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSource {
    Direct,
    Probe,
}

/// 某个字段在不同来源中的含义不同：
/// `Absent` 表示来源本应提供但给了空值，`NotApplicable` 表示该来源根本不携带这个字段。
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SourceField<T> {
    Measured(T),
    Absent,
    NotApplicable,
}

impl<T> SourceField<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => SourceField::Measured(v),
            None => SourceField::Absent,
        }
    }

    pub fn measured(&self) -> Option<&T> {
        match self {
            SourceField::Measured(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_applicable(&self) -> bool {
        !matches!(self, SourceField::NotApplicable)
    }
}

// 导出时 NotApplicable 还原成旧的 -1 哨兵值
impl<T: fmt::Display> fmt::Display for SourceField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceField::Measured(v) => write!(f, "{}", v),
            SourceField::Absent => Ok(()),
            SourceField::NotApplicable => write!(f, "-1"),
        }
    }
}

/// 统一后的测量记录，无论来自直接测量还是探针
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub source: MeasurementSource,
    pub server_ip: String,
    pub server_name: Option<String>,
    pub vantage_point_ip: Option<String>,
    pub offset: Option<f64>, // 毫秒
    pub rtt: Option<f64>, // 毫秒
    pub stratum: Option<i64>,
    pub precision: Option<f64>,
    pub poll: Option<i64>,
    pub root_delay: Option<f64>,
    pub root_dispersion: Option<f64>,
    pub timestamp: i64, // UNIX纪元毫秒
    pub client_sent_time: NtpTimestamp,
    pub jitter: SourceField<f64>,
    pub nr_measurements_jitter: SourceField<i64>,
    pub last_sync_time: SourceField<NtpTimestamp>,
    pub leap: SourceField<i64>,
    pub ref_id: Option<String>,
    pub ref_parent_ip: Option<String>,
    pub is_anycast: Option<bool>,
    pub country_code: Option<String>,
    pub coordinates: Option<(f64, f64)>, // (纬度, 经度)
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    pub measurement: MeasurementRecord,
    pub probe_id: Option<i64>,
    pub probe_ipv4: Option<String>,
    pub probe_ipv6: Option<String>,
    pub got_results: bool,
    pub measurement_id: Option<i64>,
    pub probe_counts: Option<ProbeCounts>,
}

// 触发探针测量的返回
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TriggerResponse {
    #[serde(alias = "job_id", deserialize_with = "id_from_string_or_number")]
    pub measurement_id: String,
    #[serde(default)]
    pub vantage_point_ip: Option<String>,
    #[serde(default)]
    pub vantage_point_location: Option<serde_json::Value>,
}

// 任务ID可能是字符串，也可能是数字
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
    where D: serde::Deserializer<'de>
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("无效的任务ID: {}", other))),
    }
}

// 任务状态接口的返回
#[derive(Debug, Deserialize, Clone, Default)]
pub struct JobStatusResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub results: Option<Vec<serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_field_accessors() {
        assert_eq!(SourceField::Measured(3i64).measured(), Some(&3));
        assert_eq!(SourceField::<i64>::Absent.measured(), None);
        assert!(SourceField::<i64>::Absent.is_applicable());
        assert!(!SourceField::<i64>::NotApplicable.is_applicable());
        assert_eq!(SourceField::from_option(Some(1.5f64)), SourceField::Measured(1.5));
    }

    #[test]
    fn source_field_display_for_export() {
        assert_eq!(SourceField::Measured(0.5f64).to_string(), "0.5");
        assert_eq!(SourceField::<f64>::Absent.to_string(), "");
        assert_eq!(SourceField::<f64>::NotApplicable.to_string(), "-1");
    }

    #[test]
    fn trigger_response_accepts_numeric_id() {
        let parsed: TriggerResponse = serde_json::from_value(
            serde_json::json!({ "measurement_id": 12345, "vantage_point_ip": "10.0.0.1" })
        ).unwrap();
        assert_eq!(parsed.measurement_id, "12345");

        let parsed: TriggerResponse = serde_json::from_value(
            serde_json::json!({ "job_id": "abc" })
        ).unwrap();
        assert_eq!(parsed.measurement_id, "abc");
        assert!(parsed.vantage_point_ip.is_none());
    }

    #[test]
    fn probe_counts_total() {
        let counts = ProbeCounts { asn: 3, prefix: 2, country: 1, area: 0, random: 4 };
        assert_eq!(counts.as_array(), [3, 2, 1, 0, 4]);
        assert_eq!(counts.total(), 10);
    }
}
