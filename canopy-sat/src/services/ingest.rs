//! Result-file ingestion
//!
//! The extraction provider delivers tabular results in one of two CSV
//! shapes, resolved once per file from the header record:
//!
//! - **Statistics**: `File Name, Date, Mean` rows, one index value per row;
//!   the index kind is inferred from the file-name column.
//! - **Results**: one column per index, headers carrying the product layer
//!   name (`_250m_16_days_NDVI` / `_250m_16_days_EVI`).
//!
//! Both normalize into the same canonical date-sorted series. Index values
//! are accepted in [-1, 1]; raw MODIS integers (scaled x10000) are detected
//! and rescaled before the range check. Invalid cells are dropped
//! individually; ingestion only fails when nothing usable remains.

use crate::models::SeriesPoint;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use thiserror::Error;

/// MOD13Q1 product layer identifiers, as they appear in result headers and
/// statistics file names.
pub const NDVI_LAYER: &str = "_250m_16_days_NDVI";
pub const EVI_LAYER: &str = "_250m_16_days_EVI";

/// Scale factor applied by the provider to raw integer index values
const MODIS_SCALE: f64 = 10000.0;

/// Ingestion failure causes
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("input file is empty")]
    EmptyInput,

    #[error("unrecognized file format: {0}")]
    UnrecognizedSchema(String),

    #[error("no valid observations found in input")]
    NoValidRows,

    #[error("malformed CSV: {0}")]
    Csv(String),
}

/// Input shape, resolved once per file from the header record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputSchema {
    /// `File Name, Date, Mean` rows
    Statistics {
        file_name: usize,
        date: usize,
        mean: usize,
    },
    /// One column per index layer
    Results {
        date: usize,
        ndvi: usize,
        evi: usize,
    },
}

fn detect_schema(headers: &csv::StringRecord) -> Result<InputSchema, FormatError> {
    let position = |name: &str| headers.iter().position(|h| h.trim() == name);

    if let (Some(file_name), Some(mean), Some(date)) =
        (position("File Name"), position("Mean"), position("Date"))
    {
        return Ok(InputSchema::Statistics {
            file_name,
            date,
            mean,
        });
    }

    let ndvi = headers.iter().position(|h| h.contains(NDVI_LAYER));
    let evi = headers.iter().position(|h| h.contains(EVI_LAYER));
    if let (Some(ndvi), Some(evi), Some(date)) = (ndvi, evi, position("Date")) {
        return Ok(InputSchema::Results { date, ndvi, evi });
    }

    Err(FormatError::UnrecognizedSchema(format!(
        "headers [{}] match neither the statistics nor the results layout",
        headers.iter().collect::<Vec<_>>().join(", ")
    )))
}

/// Parse one index cell. Returns `None` for missing markers, non-numeric
/// content, and values that stay outside [-1, 1] even after rescaling.
fn parse_index_value(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "NA" || raw == "F" {
        return None;
    }

    let value: f64 = raw.parse().ok()?;
    if (-1.0..=1.0).contains(&value) {
        return Some(value);
    }

    // Raw MODIS integers arrive scaled x10000
    let rescaled = value / MODIS_SCALE;
    if (-1.0..=1.0).contains(&rescaled) {
        Some(rescaled)
    } else {
        None
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Normalize raw result-file bytes into the canonical series.
///
/// The output is sorted by date with one point per date; input row order is
/// irrelevant.
pub fn ingest_series(bytes: &[u8]) -> Result<Vec<SeriesPoint>, FormatError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(FormatError::EmptyInput);
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| FormatError::Csv(e.to_string()))?
        .clone();
    let schema = detect_schema(&headers)?;

    // date -> (ndvi, evi); BTreeMap gives the date ordering for free
    let mut by_date: BTreeMap<NaiveDate, (Option<f64>, Option<f64>)> = BTreeMap::new();

    for record in reader.records() {
        let record = record.map_err(|e| FormatError::Csv(e.to_string()))?;

        match schema {
            InputSchema::Statistics {
                file_name,
                date,
                mean,
            } => {
                let (Some(name), Some(date_raw), Some(mean_raw)) =
                    (record.get(file_name), record.get(date), record.get(mean))
                else {
                    continue;
                };
                let Some(date) = parse_date(date_raw) else {
                    continue;
                };
                let Some(value) = parse_index_value(mean_raw) else {
                    continue;
                };

                let entry = by_date.entry(date).or_default();
                if name.contains("NDVI") {
                    entry.0 = Some(value);
                } else if name.contains("EVI") {
                    entry.1 = Some(value);
                }
            }
            InputSchema::Results { date, ndvi, evi } => {
                let Some(date) = record.get(date).and_then(parse_date) else {
                    continue;
                };
                let ndvi_value = record.get(ndvi).and_then(parse_index_value);
                let evi_value = record.get(evi).and_then(parse_index_value);
                if ndvi_value.is_none() && evi_value.is_none() {
                    continue;
                }

                let entry = by_date.entry(date).or_default();
                if ndvi_value.is_some() {
                    entry.0 = ndvi_value;
                }
                if evi_value.is_some() {
                    entry.1 = evi_value;
                }
            }
        }
    }

    // Dates where every cell was dropped contribute nothing
    let points: Vec<SeriesPoint> = by_date
        .into_iter()
        .filter(|(_, (ndvi, evi))| ndvi.is_some() || evi.is_some())
        .map(|(date, (ndvi, evi))| SeriesPoint::new(date, ndvi, evi))
        .collect();

    if points.is_empty() {
        return Err(FormatError::NoValidRows);
    }

    Ok(points)
}
