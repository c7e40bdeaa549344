use crate::utils::models::{ MeasurementRecord, ProbeRecord };

use serde::Serialize;
use std::collections::BTreeMap;

/// 图表中的一个点：(UNIX毫秒, 数值)
pub type Point = (i64, f64);

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Series {
    pub server: String,
    pub points: Vec<Point>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProbeMarker {
    pub probe_id: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    pub country_code: Option<String>,
    pub rtt: Option<f64>,
    pub got_results: bool,
}

// 点太多时按固定步长抽取，首尾两个点一定保留
pub fn thin_points<T: Clone>(points: &[T], max: usize) -> Vec<T> {
    if points.len() <= max {
        return points.to_vec();
    }
    match max {
        0 => Vec::new(),
        1 => vec![points[0].clone()],
        _ => {
            let last = points.len() - 1;
            let step = last.div_ceil(max - 1);
            let mut thinned: Vec<T> = points.iter().step_by(step).cloned().collect();
            if last % step != 0 {
                thinned.push(points[last].clone());
            }
            thinned
        }
    }
}

fn series_by<F>(records: &[MeasurementRecord], value: F) -> Vec<Series>
    where F: Fn(&MeasurementRecord) -> Option<f64>
{
    let mut grouped: BTreeMap<&str, Vec<Point>> = BTreeMap::new();
    for record in records {
        if let Some(v) = value(record) {
            grouped.entry(record.server_ip.as_str()).or_default().push((record.timestamp, v));
        }
    }
    grouped
        .into_iter()
        .map(|(server, mut points)| {
            points.sort_by_key(|(ts, _)| *ts);
            Series { server: server.to_string(), points }
        })
        .collect()
}

pub fn offset_series(records: &[MeasurementRecord]) -> Vec<Series> {
    series_by(records, |r| r.offset)
}

pub fn rtt_series(records: &[MeasurementRecord]) -> Vec<Series> {
    series_by(records, |r| r.rtt)
}

// 地图上的探针点，没有坐标的跳过
pub fn probe_markers(probes: &[ProbeRecord]) -> Vec<ProbeMarker> {
    probes
        .iter()
        .filter_map(|probe| {
            let (latitude, longitude) = probe.measurement.coordinates?;
            Some(ProbeMarker {
                probe_id: probe.probe_id,
                latitude,
                longitude,
                country_code: probe.measurement.country_code.clone(),
                rtt: probe.measurement.rtt,
                got_results: probe.got_results,
            })
        })
        .collect()
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct SeriesSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

pub fn summarize(points: &[Point]) -> Option<SeriesSummary> {
    if points.is_empty() {
        return None;
    }
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for (_, v) in points {
        min = min.min(*v);
        max = max.max(*v);
        sum += v;
    }
    Some(SeriesSummary { count: points.len(), min, max, mean: sum / (points.len() as f64) })
}
