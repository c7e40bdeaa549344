//! 把两种接口返回的JSON统一转换成 `MeasurementRecord`。
//!
//! 空输入返回 `Ok(None)`；缺少必需的嵌套结构（例如时间戳对象）返回错误，不做猜测。

use crate::utils::common::{ ntp_seconds_to_unix_millis, seconds_to_millis_rounded };
use crate::utils::models::{
    MeasurementRecord,
    MeasurementSource,
    ProbeRecord,
    RawDirectMeasurement,
    RawProbeMeasurement,
    SourceField,
};

use serde_json::Value;
use thiserror::Error;

/// 探针在没有测到结果时填入的RTT值
const PROBE_NO_RESULT_RTT: f64 = -1.0;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("测量数据结构不完整: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("期望JSON数组，实际是: {0}")]
    NotAnArray(String),
}

/// 直接测量接口的 offset/rtt 单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OffsetUnits {
    #[default]
    Seconds,
    Milliseconds,
}

impl OffsetUnits {
    fn to_millis(self, value: f64) -> f64 {
        match self {
            OffsetUnits::Seconds => value * 1000.0,
            OffsetUnits::Milliseconds => value,
        }
    }
}

pub fn normalize_direct(
    value: &Value,
    units: OffsetUnits
) -> Result<Option<MeasurementRecord>, NormalizeError> {
    if value.is_null() {
        return Ok(None);
    }
    let raw: RawDirectMeasurement = serde_json::from_value(value.clone())?;

    Ok(
        Some(MeasurementRecord {
            source: MeasurementSource::Direct,
            server_ip: raw.ntp_server_ip,
            server_name: raw.ntp_server_name,
            vantage_point_ip: raw.vantage_point_ip,
            offset: raw.offset.map(|v| units.to_millis(v)),
            rtt: raw.rtt.map(|v| units.to_millis(v)),
            stratum: raw.stratum,
            precision: raw.precision,
            poll: raw.poll,
            root_delay: raw.root_delay,
            root_dispersion: raw.root_dispersion,
            timestamp: ntp_seconds_to_unix_millis(raw.client_sent_time.seconds),
            client_sent_time: raw.client_sent_time,
            jitter: SourceField::from_option(raw.jitter),
            nr_measurements_jitter: SourceField::from_option(raw.nr_measurements_jitter),
            last_sync_time: SourceField::from_option(raw.ntp_last_sync_time),
            leap: SourceField::from_option(raw.leap),
            ref_id: raw.ref_id,
            ref_parent_ip: raw.ntp_server_ref_parent_ip,
            is_anycast: raw.is_anycast,
            country_code: raw.country_code,
            coordinates: raw.coordinates.map(|[lat, lon]| (lat, lon)),
        })
    )
}

pub fn normalize_probe(value: &Value) -> Result<Option<ProbeRecord>, NormalizeError> {
    if value.is_null() {
        return Ok(None);
    }
    // 没有完成测量的探针不产生记录
    match value.get("result") {
        Some(Value::Array(items)) if !items.is_empty() => {}
        _ => {
            return Ok(None);
        }
    }
    let raw: RawProbeMeasurement = serde_json::from_value(value.clone())?;
    let first = match raw.result.as_ref().and_then(|r| r.first()) {
        Some(first) => first.clone(),
        None => {
            return Ok(None);
        }
    };

    let got_results = first.rtt != PROBE_NO_RESULT_RTT;
    let (offset, rtt) = if got_results {
        (Some(seconds_to_millis_rounded(first.offset)), Some(seconds_to_millis_rounded(first.rtt)))
    } else {
        (None, None)
    };
    let vantage_point_ip = raw.probe_addr.ipv4.clone().or_else(|| raw.probe_addr.ipv6.clone());

    let measurement = MeasurementRecord {
        source: MeasurementSource::Probe,
        server_ip: raw.ntp_server_ip,
        server_name: raw.ntp_server_name,
        vantage_point_ip,
        offset,
        rtt,
        stratum: raw.stratum,
        precision: raw.precision,
        poll: raw.poll,
        root_delay: raw.root_delay,
        root_dispersion: raw.root_dispersion,
        timestamp: ntp_seconds_to_unix_millis(first.client_sent_time.seconds),
        client_sent_time: first.client_sent_time,
        jitter: SourceField::NotApplicable,
        nr_measurements_jitter: SourceField::NotApplicable,
        last_sync_time: SourceField::NotApplicable,
        leap: SourceField::NotApplicable,
        ref_id: raw.ref_id,
        ref_parent_ip: None,
        is_anycast: None,
        country_code: raw.probe_location.country_code,
        // (经度, 纬度) -> (纬度, 经度)
        coordinates: raw.probe_location.coordinates.map(|[lon, lat]| (lat, lon)),
    };

    Ok(
        Some(ProbeRecord {
            measurement,
            probe_id: raw.probe_id,
            probe_ipv4: raw.probe_addr.ipv4,
            probe_ipv6: raw.probe_addr.ipv6,
            got_results,
            measurement_id: raw.measurement_id,
            probe_counts: raw.probe_count_per_type,
        })
    )
}

pub fn normalize_direct_batch(
    value: &Value,
    units: OffsetUnits
) -> Result<Vec<MeasurementRecord>, NormalizeError> {
    let items = as_array(value)?;
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        if let Some(record) = normalize_direct(item, units)? {
            records.push(record);
        }
    }
    Ok(records)
}

pub fn normalize_probe_batch(items: &[Value]) -> Result<Vec<ProbeRecord>, NormalizeError> {
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        if let Some(record) = normalize_probe(item)? {
            records.push(record);
        }
    }
    Ok(records)
}

fn as_array(value: &Value) -> Result<&[Value], NormalizeError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(&[]),
        other => {
            let kind = match other {
                Value::Object(_) => "object",
                Value::String(_) => "string",
                Value::Number(_) => "number",
                _ => "bool",
            };
            Err(NormalizeError::NotAnArray(kind.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn direct_sample() -> Value {
        json!({
            "ntp_server_ip": "192.0.2.10",
            "ntp_server_name": "time.example.org",
            "vantage_point_ip": "198.51.100.7",
            "offset": 0.0025,
            "rtt": 0.0131,
            "stratum": 2,
            "precision": -23,
            "poll": 6,
            "root_delay": 0.000488,
            "root_dispersion": 0.000259,
            "client_sent_time": { "seconds": 3_792_998_400i64, "fraction": 42 },
            "jitter": null,
            "nr_measurements_jitter": 8,
            "leap": 0,
            "ref_name": "GPS",
            "is_anycast": false,
            "country_code": "NL",
            "coordinates": [52.0, 4.36]
        })
    }

    fn probe_sample(offset: f64, rtt: f64) -> Value {
        json!({
            "ntp_server_ip": "192.0.2.10",
            "ntp_server_name": "time.example.org",
            "probe_id": 1001,
            "probe_addr": { "ipv4": "203.0.113.5", "ipv6": null },
            "probe_location": { "country_code": "DE", "coordinates": [13.4, 52.5] },
            "measurement_id": 777,
            "stratum": 1,
            "precision": -20,
            "poll": 4,
            "root_delay": 0.0,
            "root_dispersion": 0.0001,
            "ref_id": "PPS",
            "probe_count_per_type": { "asn": 10, "prefix": 5, "country": 20, "area": 10, "random": 5 },
            "result": [
                { "client_sent_time": { "seconds": 2_208_988_800i64, "fraction": 0 }, "offset": offset, "rtt": rtt }
            ]
        })
    }

    #[test]
    fn null_inputs_return_none() {
        assert!(normalize_direct(&Value::Null, OffsetUnits::Seconds).unwrap().is_none());
        assert!(normalize_probe(&Value::Null).unwrap().is_none());
    }

    #[test]
    fn direct_fields_are_renamed_and_scaled() {
        let record = normalize_direct(&direct_sample(), OffsetUnits::Seconds).unwrap().unwrap();
        assert_eq!(record.source, MeasurementSource::Direct);
        assert_eq!(record.server_ip, "192.0.2.10");
        assert_eq!(record.server_name.as_deref(), Some("time.example.org"));
        assert!((record.offset.unwrap() - 2.5).abs() < 1e-9);
        assert!((record.rtt.unwrap() - 13.1).abs() < 1e-9);
        assert_eq!(record.timestamp, 1_584_009_600_000);
        assert_eq!(record.jitter, SourceField::Absent);
        assert_eq!(record.nr_measurements_jitter, SourceField::Measured(8));
        assert_eq!(record.last_sync_time, SourceField::Absent);
        assert_eq!(record.ref_id.as_deref(), Some("GPS"));
        assert_eq!(record.coordinates, Some((52.0, 4.36)));
    }

    #[test]
    fn direct_millisecond_units_are_not_scaled() {
        let record = normalize_direct(&direct_sample(), OffsetUnits::Milliseconds).unwrap().unwrap();
        assert_eq!(record.offset, Some(0.0025));
        assert_eq!(record.rtt, Some(0.0131));
    }

    #[test]
    fn direct_without_timestamp_fails_closed() {
        let mut value = direct_sample();
        value.as_object_mut().unwrap().remove("client_sent_time");
        assert!(matches!(normalize_direct(&value, OffsetUnits::Seconds), Err(NormalizeError::Shape(_))));
    }

    #[test]
    fn probe_offsets_in_milliseconds() {
        let probe = normalize_probe(&probe_sample(0.00123, 0.00456)).unwrap().unwrap();
        let m = &probe.measurement;
        assert!((m.offset.unwrap() - 1.23).abs() < 1e-9);
        assert!((m.rtt.unwrap() - 4.56).abs() < 1e-9);
        assert_eq!(m.timestamp, 0);
        assert!(probe.got_results);
        assert_eq!(m.vantage_point_ip.as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn probe_fills_not_applicable_fields() {
        let probe = normalize_probe(&probe_sample(0.001, 0.002)).unwrap().unwrap();
        let m = &probe.measurement;
        assert_eq!(m.jitter, SourceField::NotApplicable);
        assert_eq!(m.nr_measurements_jitter, SourceField::NotApplicable);
        assert_eq!(m.last_sync_time, SourceField::NotApplicable);
        assert_eq!(m.leap, SourceField::NotApplicable);
        assert_eq!(m.jitter.to_string(), "-1");
    }

    #[test]
    fn probe_coordinates_swapped_to_lat_lon() {
        let probe = normalize_probe(&probe_sample(0.001, 0.002)).unwrap().unwrap();
        assert_eq!(probe.measurement.coordinates, Some((52.5, 13.4)));
        assert_eq!(probe.measurement.country_code.as_deref(), Some("DE"));
        assert_eq!(probe.probe_counts.unwrap().as_array(), [10, 5, 20, 10, 5]);
    }

    #[test]
    fn probe_rtt_sentinel_means_no_results() {
        let probe = normalize_probe(&probe_sample(-1.0, -1.0)).unwrap().unwrap();
        assert!(!probe.got_results);
        assert!(probe.measurement.rtt.is_none());
        assert!(probe.measurement.offset.is_none());
    }

    #[test]
    fn probe_without_result_is_none() {
        let mut value = probe_sample(0.001, 0.002);
        value["result"] = json!([]);
        assert!(normalize_probe(&value).unwrap().is_none());

        value.as_object_mut().unwrap().remove("result");
        assert!(normalize_probe(&value).unwrap().is_none());
    }

    #[test]
    fn batch_skips_nulls() {
        let value = json!([direct_sample(), null, direct_sample()]);
        let records = normalize_direct_batch(&value, OffsetUnits::Seconds).unwrap();
        assert_eq!(records.len(), 2);

        let items = vec![probe_sample(0.001, 0.002), Value::Null];
        assert_eq!(normalize_probe_batch(&items).unwrap().len(), 1);
    }

    #[test]
    fn batch_rejects_non_array() {
        let err = normalize_direct_batch(&json!({ "detail": "x" }), OffsetUnits::Seconds).unwrap_err();
        assert!(matches!(err, NormalizeError::NotAnArray(kind) if kind == "object"));
    }
}
