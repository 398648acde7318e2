//! CSV ingest.
//!
//! Two layouts are understood:
//!
//! - **samples**: one column per channel, one row per event. Empty cells are
//!   allowed (channels may have different event counts).
//! - **histograms**: long format with one row per bin,
//!   `channel,lower,width,content[,uncertainty]`. A missing uncertainty
//!   defaults to `√content`.
//!
//! Bad rows are skipped and reported with their line number; a file that
//! yields no usable channel is an input error (exit code 2).

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use csv::StringRecord;
use tracing::{debug, warn};

use crate::data::{Bin, BinnedHistogram};
use crate::domain::{BinningSpec, FitConfig, InputSource};
use crate::error::{AppError, EXIT_INPUT};

/// A row-level problem encountered during ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub channel: Option<String>,
    pub message: String,
}

/// Ingest output: one histogram per channel plus what was skipped.
#[derive(Debug, Clone)]
pub struct IngestedData {
    pub histograms: Vec<BinnedHistogram>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
}

/// Load the channels selected by `config`.
pub fn load_channels(config: &FitConfig) -> Result<IngestedData, AppError> {
    let data = match &config.input {
        InputSource::Samples(path) => load_samples(path, &config.binning, &config.channels)?,
        InputSource::Histograms(path) => load_histograms(path, &config.channels)?,
    };
    for e in &data.row_errors {
        warn!(line = e.line, channel = e.channel.as_deref().unwrap_or(""), "{}", e.message);
    }
    Ok(data)
}

/// Read raw samples and fill one histogram per (selected) channel.
pub fn load_samples(path: &Path, binning: &BinningSpec, channels: &[String]) -> Result<IngestedData, AppError> {
    let mut reader = open_reader(path)?;
    let headers = reader
        .headers()
        .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to read CSV headers: {e}")))?
        .clone();

    let names: Vec<String> = headers.iter().map(normalize_header_name).collect();
    let selected: Vec<usize> = (0..names.len())
        .filter(|&i| channels.is_empty() || channels.iter().any(|c| c == &names[i]))
        .collect();
    ensure_selected_channels_exist(channels, &names)?;
    if selected.is_empty() {
        return Err(AppError::new(EXIT_INPUT, format!("No channel columns in '{}'.", path.display())));
    }

    let mut samples: Vec<Vec<f64>> = vec![Vec::new(); selected.len()];
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;

    for (idx, result) in reader.records().enumerate() {
        // +2: 1-based line numbers and the header line.
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    channel: None,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };

        for (slot, &col) in selected.iter().enumerate() {
            let Some(cell) = record.get(col).filter(|c| !c.is_empty()) else {
                continue;
            };
            match parse_f64(cell) {
                Ok(v) => samples[slot].push(v),
                Err(message) => row_errors.push(RowError {
                    line,
                    channel: Some(names[col].clone()),
                    message,
                }),
            }
        }
    }

    let mut histograms = Vec::with_capacity(selected.len());
    for (slot, &col) in selected.iter().enumerate() {
        let h = BinnedHistogram::from_samples(names[col].clone(), &samples[slot], binning)
            .map_err(|e| AppError::new(EXIT_INPUT, e.to_string()))?;
        debug!(channel = %h.name, samples = samples[slot].len(), entries = h.total_content(), "filled histogram");
        histograms.push(h);
    }

    Ok(IngestedData {
        histograms,
        row_errors,
        rows_read,
    })
}

/// Read pre-binned histograms in long format.
pub fn load_histograms(path: &Path, channels: &[String]) -> Result<IngestedData, AppError> {
    let mut reader = open_reader(path)?;
    let headers = reader
        .headers()
        .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to read CSV headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);
    for col in ["channel", "lower", "width", "content"] {
        if !header_map.contains_key(col) {
            return Err(AppError::new(EXIT_INPUT, format!("Missing required column: `{col}`")));
        }
    }

    // Channel order follows first appearance in the file.
    let mut order: Vec<String> = Vec::new();
    let mut bins: HashMap<String, Vec<Bin>> = HashMap::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;

    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    channel: None,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };

        match parse_bin_row(&record, &header_map) {
            Ok((channel, bin)) => {
                if !channels.is_empty() && !channels.contains(&channel) {
                    continue;
                }
                if !bins.contains_key(&channel) {
                    order.push(channel.clone());
                }
                bins.entry(channel).or_default().push(bin);
            }
            Err((channel, message)) => row_errors.push(RowError { line, channel, message }),
        }
    }

    ensure_selected_channels_exist(channels, &order)?;

    let mut histograms = Vec::with_capacity(order.len());
    for name in order {
        let mut channel_bins = bins.remove(&name).unwrap_or_default();
        channel_bins.sort_by(|a, b| a.lower.total_cmp(&b.lower));
        let h = BinnedHistogram::new(name, channel_bins).map_err(|e| AppError::new(EXIT_INPUT, e.to_string()))?;
        histograms.push(h);
    }
    if histograms.is_empty() {
        return Err(AppError::new(
            EXIT_INPUT,
            format!("No valid histogram rows in '{}'.", path.display()),
        ));
    }

    Ok(IngestedData {
        histograms,
        row_errors,
        rows_read,
    })
}

fn open_reader(path: &Path) -> Result<csv::Reader<File>, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to open CSV '{}': {e}", path.display())))?;
    Ok(csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file))
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name).to_ascii_lowercase(), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports sometimes prefix the first header with a UTF-8 BOM.
    name.trim().trim_start_matches('\u{feff}').to_string()
}

fn ensure_selected_channels_exist(selected: &[String], available: &[String]) -> Result<(), AppError> {
    let missing: Vec<&str> = selected
        .iter()
        .filter(|c| !available.contains(c))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::new(EXIT_INPUT, format!("Unknown channel(s): {}", missing.join(", "))))
    }
}

fn parse_bin_row(
    record: &StringRecord,
    header_map: &HashMap<String, usize>,
) -> Result<(String, Bin), (Option<String>, String)> {
    let channel = get_required(record, header_map, "channel").map_err(|e| (None, e))?.to_string();
    let field = |name: &str| -> Result<f64, (Option<String>, String)> {
        get_required(record, header_map, name)
            .and_then(parse_f64)
            .map_err(|e| (Some(channel.clone()), format!("{name}: {e}")))
    };
    let lower = field("lower")?;
    let width = field("width")?;
    let content = field("content")?;
    let uncertainty = match get_optional(record, header_map, "uncertainty") {
        Some(s) => parse_f64(s).map_err(|e| (Some(channel.clone()), format!("uncertainty: {e}")))?,
        None => content.max(0.0).sqrt(),
    };
    if width <= 0.0 || uncertainty < 0.0 {
        return Err((
            Some(channel),
            format!("invalid bin (width={width}, uncertainty={uncertainty})"),
        ));
    }
    Ok((channel, Bin::new(lower, width, content, uncertainty)))
}

fn get_required<'a>(record: &'a StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Result<&'a str, String> {
    get_optional(record, header_map, name).ok_or_else(|| format!("missing value for `{name}`"))
}

fn get_optional<'a>(record: &'a StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Option<&'a str> {
    header_map
        .get(name)
        .and_then(|&idx| record.get(idx))
        .filter(|s| !s.is_empty())
}

fn parse_f64(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|_| format!("not a number: '{s}'"))?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("not finite: '{s}'"))
    }
}
