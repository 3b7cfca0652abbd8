use log::debug;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{AcquisitionResult, AmplitudeSweepRun, PeakResult, QFactorResult};

/// Tuning knobs for [`fit_q_factor_with`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Fits explaining less of the variance than this are rejected
    pub min_r_squared: f64,
    /// Half-width of the fit window around the peak, as a fraction of the
    /// acquisition's half-span. 1.0 covers a full span centered on the peak.
    pub window_fraction: f64,
    pub curve_points: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            min_r_squared: 0.9,
            window_fraction: 1.0,
            curve_points: 400,
        }
    }
}

/// Index of the magnitude maximum. Ties resolve to the lowest index.
pub fn find_peak(result: &AcquisitionResult) -> Result<PeakResult, EngineError> {
    let magnitude = result.magnitude();
    let mut best: Option<(usize, f64)> = None;
    for (i, &m) in magnitude.iter().enumerate() {
        if m.is_nan() {
            continue;
        }
        if best.is_none_or(|(_, b)| m > b) {
            best = Some((i, m));
        }
    }

    let (index, magnitude) =
        best.ok_or_else(|| EngineError::NoData("acquisition has no magnitude data".to_string()))?;
    Ok(PeakResult {
        index,
        frequency: result.frequency()[index],
        magnitude,
    })
}

/// Peak of every completed step of an amplitude sweep, in step order
pub fn peaks_for_run(run: &AmplitudeSweepRun) -> Vec<Result<PeakResult, EngineError>> {
    run.step_results().par_iter().map(find_peak).collect()
}

pub fn fit_q_factor(result: &AcquisitionResult, peak: &PeakResult) -> QFactorResult {
    fit_q_factor_with(result, peak, &FitOptions::default())
}

/// Lorentzian fit of linear power around `peak`.
///
/// The model is `amp * (w/2)^2 / ((f - f0)^2 + (w/2)^2)` with `w` the full
/// width at half maximum; Q is `|f0 / w|`. Any failure comes back as
/// `fit_succeeded == false` with a NaN Q.
pub fn fit_q_factor_with(
    result: &AcquisitionResult,
    peak: &PeakResult,
    options: &FitOptions,
) -> QFactorResult {
    let Some(window) = FitWindow::around(result, peak, options.window_fraction) else {
        debug!("Too few points around {} Hz to fit", peak.frequency);
        return QFactorResult::failed(peak.frequency, 0, f64::NAN);
    };

    let initial = [1.0, 0.0, window.initial_width()];
    let fit = levenberg_marquardt(&window.x, &window.y, initial, options.max_iterations);

    let [amp, center, width] = fit.params;
    let center_hz = window.origin + center * window.scale;
    let fwhm_hz = (width * window.scale).abs();
    let r_squared = window.r_squared(&fit.params);

    let reason = if !fit.converged {
        Some("did not converge")
    } else if !amp.is_finite() || amp <= 0.0 {
        Some("non-positive amplitude")
    } else if !fwhm_hz.is_finite() || fwhm_hz <= 0.0 {
        Some("invalid width")
    } else if center_hz < window.low || center_hz > window.high {
        Some("center outside the fit window")
    } else if !(r_squared >= options.min_r_squared) {
        Some("poor fit quality")
    } else {
        None
    };
    if let Some(reason) = reason {
        debug!(
            "Q fit rejected after {} iterations: {reason} (R² = {r_squared:.3})",
            fit.iterations
        );
        return QFactorResult::failed(peak.frequency, fit.iterations, r_squared);
    }

    let points = options.curve_points.max(2);
    let step = (window.high - window.low) / (points - 1) as f64;
    let fitted_curve = (0..points)
        .map(|i| {
            let f = window.low + i as f64 * step;
            let u = (f - window.origin) / window.scale;
            let linear = lorentzian(&fit.params, u) * window.peak_linear;
            (f, 10.0 * linear.log10())
        })
        .collect();

    QFactorResult {
        q_value: (center_hz / fwhm_hz).abs(),
        center_frequency: center_hz,
        fwhm: fwhm_hz,
        fitted_curve,
        fit_succeeded: true,
        r_squared,
        iterations: fit.iterations,
    }
}

/// Samples around the peak in normalized units: frequency offset divided
/// by the window half-width, power divided by the peak power.
struct FitWindow {
    x: Array1<f64>,
    y: Array1<f64>,
    origin: f64,
    scale: f64,
    low: f64,
    high: f64,
    peak_linear: f64,
}

impl FitWindow {
    fn around(result: &AcquisitionResult, peak: &PeakResult, fraction: f64) -> Option<Self> {
        let freq = result.frequency();
        let (fmin, fmax) = freq
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &f| (lo.min(f), hi.max(f)));
        let half_width = (fmax - fmin) / 2.0 * fraction;
        if !(half_width > 0.0) {
            return None;
        }

        let peak_linear = 10f64.powf(peak.magnitude / 10.0);
        let (x, y): (Vec<f64>, Vec<f64>) = result
            .rows()
            .filter(|(f, m, _)| (f - peak.frequency).abs() <= half_width && m.is_finite())
            .map(|(f, m, _)| (f, 10f64.powf(m / 10.0) / peak_linear))
            .unzip();
        if x.len() < 5 {
            return None;
        }

        let low = x.iter().copied().fold(f64::INFINITY, f64::min);
        let high = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let origin = peak.frequency;
        let scale = half_width;
        let x = Array1::from_iter(x.into_iter().map(|f| (f - origin) / scale));
        Some(Self {
            x,
            y: Array1::from_vec(y),
            origin,
            scale,
            low,
            high,
            peak_linear,
        })
    }

    /// Half-power width walked outward from the peak, or a tenth of the
    /// window when the trace never drops below half power.
    fn initial_width(&self) -> f64 {
        let Some(peak) = self
            .x
            .iter()
            .position(|&u| u.abs() <= f64::EPSILON)
            .or_else(|| {
                self.x
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
                    .map(|(i, _)| i)
            })
        else {
            return 0.2;
        };

        let below = |i: &usize| self.y[*i] < 0.5;
        let left = (0..peak).rev().find(below);
        let right = (peak + 1..self.y.len()).find(below);
        match (left, right) {
            (Some(l), Some(r)) => self.x[r] - self.x[l],
            (Some(l), None) => 2.0 * (self.x[peak] - self.x[l]),
            (None, Some(r)) => 2.0 * (self.x[r] - self.x[peak]),
            (None, None) => 0.2,
        }
    }

    fn r_squared(&self, params: &[f64; 3]) -> f64 {
        let mean = self.y.mean().unwrap_or(0.0);
        let ss_tot: f64 = self.y.iter().map(|y| (y - mean).powi(2)).sum();
        let ss_res: f64 = self
            .x
            .iter()
            .zip(&self.y)
            .map(|(&u, &y)| (y - lorentzian(params, u)).powi(2))
            .sum();
        if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else {
            f64::NAN
        }
    }
}

fn lorentzian(params: &[f64; 3], u: f64) -> f64 {
    let [amp, center, width] = *params;
    let h2 = (width / 2.0).powi(2);
    amp * h2 / ((u - center).powi(2) + h2)
}

struct FitOutcome {
    params: [f64; 3],
    iterations: usize,
    converged: bool,
}

fn sum_sq(x: &Array1<f64>, y: &Array1<f64>, params: &[f64; 3]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&u, &v)| (v - lorentzian(params, u)).powi(2))
        .sum()
}

fn levenberg_marquardt(
    x: &Array1<f64>,
    y: &Array1<f64>,
    mut params: [f64; 3],
    max_iterations: usize,
) -> FitOutcome {
    let n = x.len();
    let mut lambda = 1e-3;
    let mut cost = sum_sq(x, y, &params);

    for iteration in 1..=max_iterations {
        let [amp, center, width] = params;
        let h = width / 2.0;
        let mut jacobian = Array2::<f64>::zeros((n, 3));
        let mut residual = Array1::<f64>::zeros(n);
        for (i, &u) in x.iter().enumerate() {
            let d = u - center;
            let denom = d * d + h * h;
            jacobian[[i, 0]] = h * h / denom;
            jacobian[[i, 1]] = 2.0 * amp * h * h * d / (denom * denom);
            jacobian[[i, 2]] = amp * h * d * d / (denom * denom);
            residual[i] = y[i] - amp * h * h / denom;
        }

        let jt = jacobian.t();
        let jtj = jt.dot(&jacobian);
        let gradient = jt.dot(&residual);
        if gradient.iter().all(|g| g.abs() < 1e-15) {
            return FitOutcome {
                params,
                iterations: iteration,
                converged: true,
            };
        }

        loop {
            let mut system = jtj.clone();
            for k in 0..3 {
                system[[k, k]] += lambda * jtj[[k, k]].max(1e-12);
            }
            let Some(step) = solve3(&system, &gradient) else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    break;
                }
                continue;
            };

            let candidate = [params[0] + step[0], params[1] + step[1], params[2] + step[2]];
            let candidate_cost = sum_sq(x, y, &candidate);
            if candidate_cost.is_finite() && candidate_cost < cost {
                let improvement = cost - candidate_cost;
                params = candidate;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);
                if improvement <= 1e-12 * cost.max(f64::MIN_POSITIVE) || cost < 1e-24 {
                    return FitOutcome {
                        params,
                        iterations: iteration,
                        converged: true,
                    };
                }
                break;
            }

            lambda *= 10.0;
            if lambda > 1e12 {
                // No step improves the cost: a local minimum
                return FitOutcome {
                    params,
                    iterations: iteration,
                    converged: true,
                };
            }
        }
    }

    FitOutcome {
        params,
        iterations: max_iterations,
        converged: false,
    }
}

/// Solve a 3x3 system by Gaussian elimination with partial pivoting
fn solve3(a: &Array2<f64>, b: &Array1<f64>) -> Option<[f64; 3]> {
    let mut m = [[0.0f64; 4]; 3];
    for (r, row) in a.axis_iter(Axis(0)).enumerate() {
        m[r][..3].copy_from_slice(&[row[0], row[1], row[2]]);
        m[r][3] = b[r];
    }

    for col in 0..3 {
        let pivot = (col..3).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() < 1e-300 {
            return None;
        }
        m.swap(col, pivot);
        let pivot_row = m[col];
        for row in m.iter_mut().skip(col + 1) {
            let factor = row[col] / pivot_row[col];
            for k in col..4 {
                row[k] -= factor * pivot_row[k];
            }
        }
    }

    let mut out = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = (row + 1..3).map(|k| m[row][k] * out[k]).sum();
        out[row] = (m[row][3] - tail) / m[row][row];
    }
    out.iter().all(|v| v.is_finite()).then_some(out)
}
