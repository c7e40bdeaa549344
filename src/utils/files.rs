use crate::utils::common::display_or_dash;
use crate::utils::models::{ MeasurementRecord, MeasurementSource, ProbeRecord };

use csv::Writer;
use serde::Serialize;
use std::{ collections::BTreeSet, error::Error, fs::File, io::{ self, BufRead }, path::Path };

const RECORD_HEADER: [&str; 18] = [
    "source",
    "server_ip",
    "server_name",
    "vantage_point_ip",
    "timestamp_ms",
    "offset_ms",
    "rtt_ms",
    "stratum",
    "precision",
    "poll",
    "root_delay",
    "root_dispersion",
    "jitter",
    "nr_measurements_jitter",
    "leap",
    "last_sync_time",
    "country_code",
    "coordinates",
];

// 按行读取目标列表，去掉空行和重复行
pub fn read_text_file<P>(filename: P) -> io::Result<Vec<String>> where P: AsRef<Path> {
    let file = File::open(&filename)?;
    let buf = io::BufReader::new(file);
    let mut unique_lines = BTreeSet::new();

    for line in buf.lines() {
        let line = line?;
        let trimmed_line = line.trim();
        // "#" 开头的是注释
        if !trimmed_line.is_empty() && !trimmed_line.starts_with('#') {
            unique_lines.insert(trimmed_line.to_string());
        }
    }

    Ok(unique_lines.into_iter().collect())
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

fn record_row(record: &MeasurementRecord) -> Vec<String> {
    let source = match record.source {
        MeasurementSource::Direct => "direct",
        MeasurementSource::Probe => "probe",
    };
    vec![
        source.to_string(),
        record.server_ip.clone(),
        opt(&record.server_name),
        opt(&record.vantage_point_ip),
        record.timestamp.to_string(),
        opt(&record.offset),
        opt(&record.rtt),
        opt(&record.stratum),
        opt(&record.precision),
        opt(&record.poll),
        opt(&record.root_delay),
        opt(&record.root_dispersion),
        record.jitter.to_string(),
        record.nr_measurements_jitter.to_string(),
        record.leap.to_string(),
        record.last_sync_time.to_string(),
        opt(&record.country_code),
        record.coordinates.map(|(lat, lon)| format!("{},{}", lat, lon)).unwrap_or_default()
    ]
}

pub fn write_records_csv(csv_file: &Path, records: &[MeasurementRecord]) -> Result<(), Box<dyn Error>> {
    let file = File::create(csv_file)?;
    let mut wtr = Writer::from_writer(file);
    wtr.write_record(RECORD_HEADER)?;
    for record in records {
        wtr.write_record(record_row(record))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_probe_csv(csv_file: &Path, probes: &[ProbeRecord]) -> Result<(), Box<dyn Error>> {
    let file = File::create(csv_file)?;
    let mut wtr = Writer::from_writer(file);
    let mut header: Vec<&str> = vec!["probe_id", "probe_ipv4", "probe_ipv6", "got_results", "probe_counts"];
    header.extend(RECORD_HEADER);
    wtr.write_record(&header)?;
    for probe in probes {
        let counts = probe.probe_counts
            .map(|c|
                c
                    .as_array()
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join("/")
            )
            .unwrap_or_default();
        let mut row = vec![
            opt(&probe.probe_id),
            opt(&probe.probe_ipv4),
            opt(&probe.probe_ipv6),
            probe.got_results.to_string(),
            counts
        ];
        row.extend(record_row(&probe.measurement));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(json_file: &Path, value: &T) -> Result<(), Box<dyn Error>> {
    let file = File::create(json_file)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

// 终端里显示的一行摘要；来源不提供的 jitter 显示为 n/a
pub fn summary_line(record: &MeasurementRecord) -> String {
    let jitter = match record.jitter.measured() {
        Some(j) => j.to_string(),
        None if record.jitter.is_applicable() => "-".to_string(),
        None => "n/a".to_string(),
    };
    format!(
        "{} | {} | offset {} ms | rtt {} ms | jitter {} | stratum {} | {}",
        record.server_ip,
        record.server_name.as_deref().unwrap_or("-"),
        display_or_dash(record.offset),
        display_or_dash(record.rtt),
        jitter,
        display_or_dash(record.stratum),
        record.country_code.as_deref().unwrap_or("-")
    )
}
