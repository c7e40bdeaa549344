use crate::utils::models::MeasurementRecord;

use std::{ cmp::Ordering, net::IpAddr, str::FromStr, time::Duration };

/// NTP纪元（1900-01-01）与UNIX纪元（1970-01-01）之间相差的秒数
pub const NTP_UNIX_EPOCH_DELTA: i64 = 2_208_988_800;

// NTP纪元的秒数 -> UNIX纪元的毫秒数
pub fn ntp_seconds_to_unix_millis(seconds: i64) -> i64 {
    (seconds - NTP_UNIX_EPOCH_DELTA) * 1000
}

// 秒 -> 毫秒，保留3位小数
pub fn seconds_to_millis_rounded(seconds: f64) -> f64 {
    round_to(seconds * 1000.0, 3)
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = (10f64).powi(decimals);
    (value * factor).round() / factor
}

// 用于排序（IPv4、IPv6地址、域名）
pub fn sort_ips_and_hosts(ip1: &str, ip2: &str) -> Ordering {
    let parse_result1 = IpAddr::from_str(ip1);
    let parse_result2 = IpAddr::from_str(ip2);

    match (parse_result1, parse_result2) {
        (Ok(ip1), Ok(ip2)) => ip1.cmp(&ip2),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => ip1.cmp(ip2),
    }
}

// 先按服务器地址，再按时间排序
pub fn sort_records(records: &mut [MeasurementRecord]) {
    records.sort_by(|a, b| {
        sort_ips_and_hosts(&a.server_ip, &b.server_ip).then(a.timestamp.cmp(&b.timestamp))
    });
}

// 计算程序运行的总时长
pub fn format_duration(duration: Duration) -> (f64, &'static str) {
    if duration.as_secs() > 0 {
        (duration.as_secs_f64(), "秒")
    } else if duration.as_millis() > 0 {
        (duration.as_millis() as f64, "毫秒")
    } else if duration.as_micros() > 0 {
        (duration.as_micros() as f64, "微秒")
    } else {
        (duration.as_nanos() as f64, "纳秒")
    }
}

// 空值显示为 "-"
pub fn display_or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}
