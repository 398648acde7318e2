//! Formatted terminal output.
//!
//! Formatting lives in one place so the fitting code stays free of
//! presentation concerns and output changes stay local.

use crate::domain::{ChannelReport, FitConfig, InputSource, ParamIndex};
use crate::io::ingest::IngestedData;
use crate::report::run_stats;

/// Run header: input, model configuration and channel counts.
pub fn format_run_summary(ingest: &IngestedData, reports: &[ChannelReport], config: &FitConfig) -> String {
    let mut out = String::new();
    let stats = run_stats(reports);

    out.push_str("=== sipmcal - SiPM spectrum calibration ===\n");
    let (kind, path) = match &config.input {
        InputSource::Samples(p) => ("samples", p),
        InputSource::Histograms(p) => ("histograms", p),
    };
    out.push_str(&format!("Input: {} ({kind})\n", path.display()));
    out.push_str(&format!(
        "Rows: read={} skipped={}\n",
        ingest.rows_read,
        ingest.row_errors.len()
    ));
    if let InputSource::Samples(_) = config.input {
        let b = &config.binning;
        out.push_str(&format!(
            "Binning: {} bins over [{}, {}) | accept ({}, {}) | normalize={}\n",
            b.bins, b.x_min, b.x_max, b.accept_min, b.accept_max, b.normalize
        ));
    }
    out.push_str(&format!(
        "Model: peaks={} mip={} neighbors={} bins={:?}\n",
        config.num_peaks, config.enable_mip, config.neighbors, config.bin_evaluation
    ));
    out.push_str(&format!(
        "Fit: solver={:?} statistic={:?} max_iterations={}\n",
        config.solver, config.statistic, config.max_iterations
    ));
    out.push_str(&format!(
        "Channels: {} | ok={} failed={}",
        stats.channels, stats.succeeded, stats.failed
    ));
    if stats.with_pinned > 0 {
        out.push_str(&format!(" | with bound-limited parameters={}", stats.with_pinned));
    }
    out.push_str("\n\n");

    out
}

/// One row per channel: calibration or failure reason.
pub fn format_calibration_table(reports: &[ChannelReport]) -> String {
    let mut out = String::new();
    let with_mip = reports
        .iter()
        .any(|r| r.calibration.as_ref().is_some_and(|c| c.mip_mpv.is_some()));

    let mut header = format!(
        "{:<16} {:>9} {:>8} {:>9} {:>9} {:>12}",
        "channel", "pedestal", "mean_pe", "gain", "xtalk", "chi2/ndf"
    );
    if with_mip {
        header.push_str(&format!(" {:>9} {:>10}", "mpv", "mip_area"));
    }
    out.push_str(header.trim_end());
    out.push('\n');
    out.push_str(&"-".repeat(header.len()));
    out.push('\n');

    for r in reports {
        let name = truncate(&r.channel, 16);
        let Some(c) = &r.calibration else {
            out.push_str(&format!(
                "{name:<16} FAILED ({}): {}\n",
                r.error_kind.as_deref().unwrap_or("unknown"),
                r.error.as_deref().unwrap_or("")
            ));
            continue;
        };
        let quality = r
            .final_stage()
            .map(|s| format!("{:.3}", reduced_chi2(s.chi2, s.ndf)))
            .unwrap_or_else(|| "-".to_string());
        let mut row = format!(
            "{name:<16} {:>9.2} {:>8.4} {:>9.3} {:>9.4} {:>12}",
            c.pedestal, c.mean_pe, c.gain, c.crosstalk, quality
        );
        if with_mip {
            row.push_str(&format!(
                " {:>9} {:>10}",
                fmt_opt(c.mip_mpv, 2),
                fmt_opt(c.mip_area, 0)
            ));
        }
        out.push_str(row.trim_end());
        out.push('\n');
    }

    out
}

/// Per-stage diagnostics for one channel.
pub fn format_stage_table(report: &ChannelReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Stages for {}:\n", report.channel));
    out.push_str(&format!(
        "{:<14} {:>17} {:>6} {:>5} {:>12} {:>6} {:>5}  {}\n",
        "stage", "range", "bins", "free", "chi2", "ndf", "iter", "pinned"
    ));
    for s in &report.stages {
        let range = format!("[{:.0}, {:.0}]", s.x_min, s.x_max);
        let line = format!(
            "{:<14} {:>17} {:>6} {:>5} {:>12.3} {:>6} {:>5}  {}",
            truncate(&s.name, 14),
            range,
            s.bins_used,
            s.free_parameters,
            s.chi2,
            s.ndf,
            s.iterations,
            s.pinned.join(",")
        );
        out.push_str(line.trim_end());
        out.push('\n');
    }
    if let (Some(p), Some(u)) = (&report.parameters, &report.uncertainties) {
        out.push_str("Parameters:\n");
        for (i, (v, e)) in p.iter().zip(u).enumerate() {
            let name = ParamIndex::from_index(i).map_or("?", |idx| idx.name());
            out.push_str(&format!("  {name:<13} {v:>14.6} ± {e:.6}\n"));
        }
    }
    out
}

fn reduced_chi2(chi2: f64, ndf: usize) -> f64 {
    if ndf == 0 { f64::NAN } else { chi2 / ndf as f64 }
}

fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    v.map(|x| format!("{x:.decimals$}")).unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
