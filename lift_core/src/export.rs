//! CSV export of weekly series.
//!
//! Rows are appended, so several targets can be exported into one file;
//! headers are written only when the file is empty.

use crate::series::{WeekPoint, WeeklySeries};
use crate::week::parse_week_key;
use crate::Result;
use std::fs::OpenOptions;
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow<'a> {
    target_kind: &'static str,
    target_id: &'a str,
    week_start: String,
    sets: f64,
    hard_sets: f64,
    volume: f64,
    effective_volume: f64,
    set_count: f64,
    avg_rir: Option<f64>,
    failure_rate: Option<f64>,
    e1rm_max: Option<f64>,
    load_min: Option<f64>,
    load_max: Option<f64>,
    rir_min: Option<f64>,
    rir_max: Option<f64>,
}

/// Append one row per week of `series` to `csv_path`, oldest week first
///
/// Returns the number of rows written. Weeks fully retracted back to zero
/// are skipped.
pub fn export_series_csv(series: &WeeklySeries, csv_path: &Path) -> Result<usize> {
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;
    let needs_headers = file.metadata()?.len() == 0;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    let mut rows = 0;
    // BTreeMap order on YYYY-MM-DD keys is chronological
    for (key, bucket) in &series.weeks {
        let week = match parse_week_key(key) {
            Ok(week) => week,
            Err(e) => {
                tracing::warn!("Skipping bucket '{}' in export: {}", key, e);
                continue;
            }
        };
        let point = WeekPoint::from_bucket(week, bucket);
        if !point.has_data() {
            continue;
        }
        writer.serialize(CsvRow {
            target_kind: series.target_kind.as_str(),
            target_id: &series.target_id,
            week_start: key.clone(),
            sets: point.sets,
            hard_sets: point.hard_sets,
            volume: point.volume,
            effective_volume: point.effective_volume,
            set_count: point.set_count,
            avg_rir: point.avg_rir,
            failure_rate: point.failure_rate,
            e1rm_max: bucket.e1rm_max,
            load_min: bucket.load_min,
            load_max: bucket.load_max,
            rir_min: bucket.rir_min,
            rir_max: bucket.rir_max,
        })?;
        rows += 1;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!(
        "Exported {} weeks of {} to {:?}",
        rows,
        series.key(),
        csv_path
    );
    Ok(rows)
}
