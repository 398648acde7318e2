//! ASCII plotting for terminal output.
//!
//! This is intentionally "dumb" (fixed-size grid), optimized for:
//! - quick visual sanity checks of a fit in a terminal
//! - deterministic output (helpful for golden tests)
//!
//! Plot elements:
//! - histogram bin contents: `o`
//! - fitted model: `-` line
//! - pedestal and MIP peak positions: `|` markers on the bottom row

use crate::data::BinnedHistogram;
use crate::domain::Calibration;
use crate::error::FitError;
use crate::models::ModelFunction;

/// Grid size and y-axis scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotOptions {
    pub width: usize,
    pub height: usize,
    pub log_y: bool,
}

impl Default for PlotOptions {
    fn default() -> Self {
        Self {
            width: 100,
            height: 25,
            log_y: false,
        }
    }
}

/// Render histogram points with the model overlaid.
pub fn render_spectrum_plot(
    histogram: &BinnedHistogram,
    model: &dyn ModelFunction,
    params: &[f64],
    calibration: Option<&Calibration>,
    opts: &PlotOptions,
) -> Result<String, FitError> {
    let width = opts.width.max(10);
    let height = opts.height.max(5);
    let (x_min, x_max) = histogram
        .x_range()
        .ok_or_else(|| FitError::DegenerateHistogram(format!("'{}' has no bins", histogram.name)))?;

    let curve: Vec<(f64, f64)> = (0..width)
        .map(|i| {
            let x = x_min + (x_max - x_min) * i as f64 / (width as f64 - 1.0);
            model.evaluate_at(x, params).map(|y| (x, y))
        })
        .collect::<Result<_, _>>()?;
    let points: Vec<(f64, f64)> = histogram.bins().iter().map(|b| (b.center(), b.content)).collect();

    let scale = YScale::new(opts.log_y, &points, &curve);
    let (y_min, y_max) = scale
        .range(points.iter().chain(&curve).map(|&(_, y)| y))
        .unwrap_or((0.0, 1.0));
    let (y_min, y_max) = pad_range(y_min, y_max, 0.05);

    let mut grid = vec![vec![' '; width]; height];

    // Curve first so points overlay it.
    let mut prev = None;
    for &(x, y) in &curve {
        let Some(v) = scale.apply(y) else {
            prev = None;
            continue;
        };
        let col = map_x(x, x_min, x_max, width);
        let row = map_y(v, y_min, y_max, height);
        match prev {
            Some((c0, r0)) => draw_line(&mut grid, c0, r0, col, row, '-'),
            None => grid[row][col] = '-',
        }
        prev = Some((col, row));
    }

    for &(x, y) in &points {
        if let Some(v) = scale.apply(y) {
            grid[map_y(v, y_min, y_max, height)][map_x(x, x_min, x_max, width)] = 'o';
        }
    }

    let mut out = String::new();
    out.push_str(&format!(
        "Plot: {} | x=[{x_min:.1}, {x_max:.1}] | {}=[{}, {}]\n",
        histogram.name,
        if opts.log_y { "log10(y)" } else { "y" },
        fmt_axis(y_min),
        fmt_axis(y_max),
    ));
    if let Some(c) = calibration {
        let mut note = format!("pedestal={:.2} gain={:.3}", c.pedestal, c.gain);
        if let Some(mpv) = c.mip_mpv {
            note.push_str(&format!(" mpv={mpv:.2}"));
            mark(&mut grid, c.pedestal + mpv, x_min, x_max);
        }
        mark(&mut grid, c.pedestal, x_min, x_max);
        out.push_str(&note);
        out.push('\n');
    }

    for row in grid {
        let line: String = row.into_iter().collect();
        out.push_str(line.trim_end());
        out.push('\n');
    }

    Ok(out)
}

/// Linear or log10 y axis.
#[derive(Debug, Clone, Copy)]
struct YScale {
    log: bool,
    /// Values at or below this are not drawn in log mode.
    floor: f64,
}

impl YScale {
    fn new(log: bool, points: &[(f64, f64)], curve: &[(f64, f64)]) -> Self {
        let min_positive = points
            .iter()
            .chain(curve)
            .map(|&(_, y)| y)
            .filter(|&y| y > 0.0)
            .fold(f64::INFINITY, f64::min);
        let floor = if min_positive.is_finite() { min_positive * 0.5 } else { 1.0 };
        Self { log, floor }
    }

    fn apply(&self, y: f64) -> Option<f64> {
        if !y.is_finite() {
            return None;
        }
        if !self.log {
            return Some(y);
        }
        (y >= self.floor).then(|| y.log10())
    }

    fn range(&self, ys: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
        let (lo, hi) = ys
            .filter_map(|y| self.apply(y))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        (lo.is_finite() && hi.is_finite() && hi > lo).then_some((lo, hi))
    }
}

fn fmt_axis(v: f64) -> String {
    if v.abs() >= 1e5 { format!("{v:.3e}") } else { format!("{v:.2}") }
}

fn mark(grid: &mut [Vec<char>], x: f64, x_min: f64, x_max: f64) {
    if !(x >= x_min && x <= x_max) {
        return;
    }
    let Some(bottom) = grid.last_mut() else {
        return;
    };
    let col = map_x(x, x_min, x_max, bottom.len());
    if bottom[col] == ' ' {
        bottom[col] = '|';
    }
}

fn pad_range(min: f64, max: f64, frac: f64) -> (f64, f64) {
    let span = (max - min).abs();
    let pad = (span * frac).max(1e-12);
    (min - pad, max + pad)
}

fn map_x(x: f64, x_min: f64, x_max: f64, width: usize) -> usize {
    let width = width.max(2);
    let u = ((x - x_min) / (x_max - x_min)).clamp(0.0, 1.0);
    (u * (width as f64 - 1.0)).round() as usize
}

fn map_y(y: f64, y_min: f64, y_max: f64, height: usize) -> usize {
    let height = height.max(2);
    let u = ((y - y_min) / (y_max - y_min)).clamp(0.0, 1.0);
    // y=top is max -> row 0
    (height as f64 - 1.0 - (u * (height as f64 - 1.0))).round() as usize
}

/// Integer line drawing (Bresenham-ish).
fn draw_line(grid: &mut [Vec<char>], x0: usize, y0: usize, x1: usize, y1: usize, ch: char) {
    let mut x0 = x0 as isize;
    let mut y0 = y0 as isize;
    let x1 = x1 as isize;
    let y1 = y1 as isize;

    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if y0 >= 0
            && (y0 as usize) < grid.len()
            && x0 >= 0
            && (x0 as usize) < grid[0].len()
            && grid[y0 as usize][x0 as usize] == ' '
        {
            grid[y0 as usize][x0 as usize] = ch;
        }

        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Bin;

    /// `p0 + p1·x`
    struct Line;

    impl ModelFunction for Line {
        fn param_count(&self) -> usize {
            2
        }

        fn evaluate_at(&self, x: f64, p: &[f64]) -> Result<f64, FitError> {
            Ok(p[0] + p[1] * x)
        }
    }

    fn histogram(contents: &[f64]) -> BinnedHistogram {
        let bins = contents
            .iter()
            .enumerate()
            .map(|(i, &c)| Bin::new(i as f64, 1.0, c, 1.0))
            .collect();
        BinnedHistogram::new("h", bins).unwrap()
    }

    #[test]
    fn plot_golden_snapshot_small() {
        // Rising line from 0 to 10 over [0, 10]; one point on each end.
        let h = histogram(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 10.0]);
        let opts = PlotOptions {
            width: 10,
            height: 5,
            log_y: false,
        };
        let txt = render_spectrum_plot(&h, &Line, &[0.0, 1.0], None, &opts).unwrap();
        let lines: Vec<&str> = txt.lines().collect();
        assert_eq!(lines[0], "Plot: h | x=[0.0, 10.0] | y=[-0.50, 10.50]");
        assert_eq!(lines.len(), 6);
        // Top-right holds the last bin (centre 9.5, content 10).
        assert!(lines[1].ends_with('o') || lines[1].ends_with('-'));
        // Zero-content bins sit on the bottom row.
        assert!(lines[5].starts_with("oooooooo"));
    }

    #[test]
    fn log_scale_skips_non_positive_values() {
        let h = histogram(&[1.0, 10.0, 100.0, 1000.0, 0.0]);
        let opts = PlotOptions {
            width: 20,
            height: 8,
            log_y: true,
        };
        let txt = render_spectrum_plot(&h, &Line, &[1.0, 0.0], None, &opts).unwrap();
        assert!(txt.lines().next().unwrap().contains("log10(y)"));
        let points: usize = txt.lines().skip(1).map(|l| l.matches('o').count()).sum();
        assert_eq!(points, 4);
    }

    #[test]
    fn calibration_adds_annotation_and_markers() {
        let h = histogram(&[5.0; 20]);
        let calib = Calibration {
            pedestal: 5.0,
            mean_pe: 0.1,
            gain: 4.0,
            crosstalk: 0.05,
            mip_mpv: Some(10.0),
            mip_area: Some(1.0),
        };
        let txt = render_spectrum_plot(&h, &Line, &[1.0, 0.0], Some(&calib), &PlotOptions::default()).unwrap();
        let lines: Vec<&str> = txt.lines().collect();
        assert_eq!(lines[1], "pedestal=5.00 gain=4.000 mpv=10.00");
        assert_eq!(lines.last().unwrap().matches('|').count(), 2);
    }

    #[test]
    fn draw_line_connects_endpoints() {
        let mut grid = vec![vec![' '; 5]; 3];
        draw_line(&mut grid, 0, 2, 4, 0, '-');
        assert_eq!(grid[2][0], '-');
        assert_eq!(grid[0][4], '-');
    }
}
