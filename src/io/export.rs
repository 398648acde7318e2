//! CSV exports.
//!
//! - per-channel calibration table (one row per channel, failures included)
//! - simulated raw samples in the layout `ingest::load_samples` reads back

use std::path::Path;

use serde::Serialize;

use crate::data::SampleData;
use crate::domain::ChannelReport;
use crate::error::{AppError, EXIT_INPUT};

#[derive(Debug, Serialize)]
struct CalibrationRow<'a> {
    channel: &'a str,
    pedestal: Option<f64>,
    mean_pe: Option<f64>,
    gain: Option<f64>,
    crosstalk: Option<f64>,
    mip_mpv: Option<f64>,
    mip_area: Option<f64>,
    chi2: Option<f64>,
    ndf: Option<usize>,
    status: &'a str,
    error: &'a str,
}

impl<'a> CalibrationRow<'a> {
    fn from_report(r: &'a ChannelReport) -> Self {
        let c = r.calibration.as_ref();
        let last = r.final_stage().filter(|_| r.is_ok());
        Self {
            channel: &r.channel,
            pedestal: c.map(|c| c.pedestal),
            mean_pe: c.map(|c| c.mean_pe),
            gain: c.map(|c| c.gain),
            crosstalk: c.map(|c| c.crosstalk),
            mip_mpv: c.and_then(|c| c.mip_mpv),
            mip_area: c.and_then(|c| c.mip_area),
            chi2: last.map(|s| s.chi2),
            ndf: last.map(|s| s.ndf),
            status: r.status.label(),
            error: r.error.as_deref().unwrap_or(""),
        }
    }
}

/// Write one calibration row per channel.
pub fn write_calibration_csv(path: &Path, reports: &[ChannelReport]) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to create export CSV '{}': {e}", path.display())))?;
    for r in reports {
        writer
            .serialize(CalibrationRow::from_report(r))
            .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to write export CSV row: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to write export CSV: {e}")))?;
    Ok(())
}

/// Write samples column-wise (one column per channel, one event per row).
pub fn write_samples_csv(path: &Path, data: &SampleData) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to create samples CSV '{}': {e}", path.display())))?;
    let write_err = |e: csv::Error| AppError::new(EXIT_INPUT, format!("Failed to write samples CSV: {e}"));

    writer.write_record(&data.channels).map_err(write_err)?;
    let rows = data.columns.iter().map(Vec::len).max().unwrap_or(0);
    for row in 0..rows {
        let record = data
            .columns
            .iter()
            .map(|col| col.get(row).map(|v| format!("{v:.3}")).unwrap_or_default());
        writer.write_record(record).map_err(write_err)?;
    }
    writer.flush().map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to write samples CSV: {e}")))?;
    Ok(())
}
