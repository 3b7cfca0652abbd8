use serde::{Deserialize, Serialize};

use crate::engine::Ticket;
use crate::error::EngineError;

/// Sweep trigger mode of the analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    /// One sweep per trigger (`SWM2`)
    Single,
    /// Free-running sweeps (`SWM1`), the instrument's power-up state
    #[default]
    Continuous,
}

impl std::fmt::Display for SweepMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepMode::Single => write!(f, "single"),
            SweepMode::Continuous => write!(f, "continuous"),
        }
    }
}

/// Frequency window and stimulus settings of a sweep.
///
/// Either (center, span) or (start, stop) is authoritative at any time:
/// setting one pair recomputes the other, so the two views never disagree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepParameters {
    center_frequency: f64,
    span: f64,
    start_frequency: f64,
    stop_frequency: f64,
    resolution_bandwidth: f64,
    oscillator_amplitude: f64,
    sweep_mode: SweepMode,
}

pub const DEFAULT_CENTER_HZ: f64 = 1.0e6;
pub const DEFAULT_SPAN_HZ: f64 = 10_000.0;
pub const DEFAULT_RBW_HZ: f64 = 100.0;
pub const LOW_RES_RBW_HZ: f64 = 10.0;

impl Default for SweepParameters {
    fn default() -> Self {
        Self {
            center_frequency: DEFAULT_CENTER_HZ,
            span: DEFAULT_SPAN_HZ,
            start_frequency: DEFAULT_CENTER_HZ - DEFAULT_SPAN_HZ / 2.0,
            stop_frequency: DEFAULT_CENTER_HZ + DEFAULT_SPAN_HZ / 2.0,
            resolution_bandwidth: DEFAULT_RBW_HZ,
            oscillator_amplitude: 0.0,
            sweep_mode: SweepMode::Continuous,
        }
    }
}

impl SweepParameters {
    /// Parameters for a center/span window with default RBW and stimulus
    pub fn with_center_span(center: f64, span: f64) -> Result<Self, EngineError> {
        let mut params = Self::default();
        params.set_center_span(center, span)?;
        Ok(params)
    }

    /// Parameters for a start/stop window with default RBW and stimulus
    pub fn with_start_stop(start: f64, stop: f64) -> Result<Self, EngineError> {
        let mut params = Self::default();
        params.set_start_stop(start, stop)?;
        Ok(params)
    }

    pub fn set_center_span(&mut self, center: f64, span: f64) -> Result<(), EngineError> {
        if !center.is_finite() || !span.is_finite() {
            return Err(EngineError::InvalidParameter(format!(
                "center/span must be finite (got {center}, {span})"
            )));
        }
        if span <= 0.0 {
            return Err(EngineError::InvalidParameter(format!(
                "span must be positive, got {span} Hz"
            )));
        }
        self.center_frequency = center;
        self.span = span;
        self.start_frequency = center - span / 2.0;
        self.stop_frequency = center + span / 2.0;
        Ok(())
    }

    pub fn set_start_stop(&mut self, start: f64, stop: f64) -> Result<(), EngineError> {
        if !start.is_finite() || !stop.is_finite() {
            return Err(EngineError::InvalidParameter(format!(
                "start/stop must be finite (got {start}, {stop})"
            )));
        }
        if stop <= start {
            return Err(EngineError::InvalidParameter(format!(
                "stop frequency ({stop} Hz) must be greater than start frequency ({start} Hz)"
            )));
        }
        self.start_frequency = start;
        self.stop_frequency = stop;
        self.center_frequency = (start + stop) / 2.0;
        self.span = stop - start;
        Ok(())
    }

    pub fn set_resolution_bandwidth(&mut self, rbw: f64) -> Result<(), EngineError> {
        if !rbw.is_finite() || rbw <= 0.0 {
            return Err(EngineError::InvalidParameter(format!(
                "resolution bandwidth must be positive, got {rbw} Hz"
            )));
        }
        self.resolution_bandwidth = rbw;
        Ok(())
    }

    pub fn set_oscillator_amplitude(&mut self, dbm: f64) -> Result<(), EngineError> {
        if !dbm.is_finite() {
            return Err(EngineError::InvalidParameter(format!(
                "oscillator amplitude must be finite, got {dbm} dBm"
            )));
        }
        self.oscillator_amplitude = dbm;
        Ok(())
    }

    pub fn set_sweep_mode(&mut self, mode: SweepMode) {
        self.sweep_mode = mode;
    }

    pub fn center_frequency(&self) -> f64 {
        self.center_frequency
    }

    pub fn span(&self) -> f64 {
        self.span
    }

    pub fn start_frequency(&self) -> f64 {
        self.start_frequency
    }

    pub fn stop_frequency(&self) -> f64 {
        self.stop_frequency
    }

    pub fn resolution_bandwidth(&self) -> f64 {
        self.resolution_bandwidth
    }

    pub fn oscillator_amplitude(&self) -> f64 {
        self.oscillator_amplitude
    }

    pub fn sweep_mode(&self) -> SweepMode {
        self.sweep_mode
    }
}

/// Index-aligned magnitude/phase/frequency arrays of one completed sweep.
///
/// All three arrays are either empty or share the same length, so
/// `frequency[i]` always belongs to `magnitude[i]` and `phase[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct AcquisitionResult {
    magnitude: Vec<f64>,
    phase: Vec<f64>,
    frequency: Vec<f64>,
}

impl AcquisitionResult {
    pub fn new(
        magnitude: Vec<f64>,
        phase: Vec<f64>,
        frequency: Vec<f64>,
    ) -> Result<Self, EngineError> {
        if magnitude.len() != frequency.len() || phase.len() != frequency.len() {
            return Err(EngineError::Acquisition(format!(
                "array length mismatch: magnitude={}, phase={}, frequency={}",
                magnitude.len(),
                phase.len(),
                frequency.len()
            )));
        }
        Ok(Self {
            magnitude,
            phase,
            frequency,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frequency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequency.is_empty()
    }

    pub fn magnitude(&self) -> &[f64] {
        &self.magnitude
    }

    pub fn phase(&self) -> &[f64] {
        &self.phase
    }

    pub fn frequency(&self) -> &[f64] {
        &self.frequency
    }

    /// (frequency, magnitude, phase) rows in sweep order
    pub fn rows(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.frequency
            .iter()
            .zip(&self.magnitude)
            .zip(&self.phase)
            .map(|((&f, &m), &p)| (f, m, p))
    }
}

/// Location of the magnitude maximum in an acquisition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakResult {
    pub index: usize,
    pub frequency: f64,
    pub magnitude: f64,
}

/// Outcome of a resonance fit around a peak.
///
/// `q_value` is `NaN` whenever `fit_succeeded` is false.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QFactorResult {
    pub q_value: f64,
    pub center_frequency: f64,
    pub fwhm: f64,
    /// (frequency, magnitude in dBm) samples of the fitted model
    pub fitted_curve: Vec<(f64, f64)>,
    pub fit_succeeded: bool,
    pub r_squared: f64,
    pub iterations: usize,
}

impl QFactorResult {
    pub(crate) fn failed(center_frequency: f64, iterations: usize, r_squared: f64) -> Self {
        Self {
            q_value: f64::NAN,
            center_frequency,
            fwhm: f64::NAN,
            fitted_curve: Vec::new(),
            fit_succeeded: false,
            r_squared,
            iterations,
        }
    }
}

/// Most steps a single amplitude sweep may take
pub const MAX_AMPLITUDE_STEPS: usize = 10_000;

/// Oscillator amplitudes to step through in an amplitude sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmplitudeSweepParams {
    amplitudes: Vec<f64>,
    resolution_bandwidth: Option<f64>,
}

impl AmplitudeSweepParams {
    /// Use the amplitudes exactly as given; order is preserved
    pub fn from_list(
        amplitudes: Vec<f64>,
        resolution_bandwidth: Option<f64>,
    ) -> Result<Self, EngineError> {
        if amplitudes.is_empty() {
            return Err(EngineError::InvalidParameter(
                "amplitude list must not be empty".to_string(),
            ));
        }
        if let Some(bad) = amplitudes.iter().find(|a| !a.is_finite()) {
            return Err(EngineError::InvalidParameter(format!(
                "amplitude {bad} dBm is not finite"
            )));
        }
        if let Some(rbw) = resolution_bandwidth {
            if !rbw.is_finite() || rbw <= 0.0 {
                return Err(EngineError::InvalidParameter(format!(
                    "resolution bandwidth must be positive, got {rbw} Hz"
                )));
            }
        }
        Ok(Self {
            amplitudes,
            resolution_bandwidth,
        })
    }

    /// Inclusive `start..=stop` in increments of `step` (dBm)
    pub fn from_range(
        start: f64,
        stop: f64,
        step: f64,
        resolution_bandwidth: Option<f64>,
    ) -> Result<Self, EngineError> {
        if !step.is_finite() || step <= 0.0 {
            return Err(EngineError::InvalidParameter(format!(
                "amplitude step must be a positive number, got {step}"
            )));
        }
        if !start.is_finite() || !stop.is_finite() || start > stop {
            return Err(EngineError::InvalidParameter(format!(
                "start amplitude ({start} dBm) cannot be greater than stop amplitude ({stop} dBm)"
            )));
        }
        // The small epsilon keeps `stop` itself when it lies exactly on the grid
        let intervals = ((stop - start + 1e-9) / step).floor();
        if !intervals.is_finite() || intervals >= MAX_AMPLITUDE_STEPS as f64 {
            return Err(EngineError::InvalidParameter(format!(
                "step {step} dBm over {start}..={stop} dBm exceeds {MAX_AMPLITUDE_STEPS} steps"
            )));
        }
        let count = intervals as usize + 1;
        let amplitudes = (0..count).map(|i| start + i as f64 * step).collect();
        Self::from_list(amplitudes, resolution_bandwidth)
    }

    pub fn amplitudes(&self) -> &[f64] {
        &self.amplitudes
    }

    pub fn resolution_bandwidth(&self) -> Option<f64> {
        self.resolution_bandwidth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

/// Results of an amplitude sweep, in the order the amplitudes were given.
///
/// `step_results()[i]` belongs to `amplitudes()[i]`. A cancelled or failed
/// run keeps the steps that completed before it stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmplitudeSweepRun {
    amplitudes: Vec<f64>,
    step_results: Vec<AcquisitionResult>,
    status: RunStatus,
}

impl AmplitudeSweepRun {
    pub(crate) fn new(amplitudes: Vec<f64>) -> Self {
        Self {
            amplitudes,
            step_results: Vec::new(),
            status: RunStatus::InProgress,
        }
    }

    pub(crate) fn push(&mut self, result: AcquisitionResult) {
        if self.status == RunStatus::InProgress && self.step_results.len() < self.amplitudes.len()
        {
            self.step_results.push(result);
        }
    }

    pub(crate) fn finish(&mut self, status: RunStatus) {
        if self.status == RunStatus::InProgress {
            self.status = status;
        }
    }

    pub fn amplitudes(&self) -> &[f64] {
        &self.amplitudes
    }

    pub fn step_results(&self) -> &[AcquisitionResult] {
        &self.step_results
    }

    pub fn completed_steps(&self) -> usize {
        self.step_results.len()
    }

    pub fn total_steps(&self) -> usize {
        self.amplitudes.len()
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// (amplitude, result) pairs for every completed step
    pub fn steps(&self) -> impl Iterator<Item = (f64, &AcquisitionResult)> {
        self.amplitudes.iter().copied().zip(self.step_results.iter())
    }
}

/// Incremental notification emitted after each amplitude sweep step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepProgress {
    /// Request the step belongs to
    pub ticket: Ticket,
    /// Zero-based position of the step that just completed
    pub step_index: usize,
    pub total_steps: usize,
    pub amplitude: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_derives_center_span_exactly() {
        let params = SweepParameters::with_start_stop(990_000.0, 1_010_000.0).unwrap();
        assert_eq!(params.center_frequency(), (990_000.0 + 1_010_000.0) / 2.0);
        assert_eq!(params.span(), 1_010_000.0 - 990_000.0);
    }

    #[test]
    fn test_center_span_inverse() {
        let pairs = [(1.0e6, 1.0e4), (12_345.678, 91.5), (5.0e8, 3.3e7)];
        for (center, span) in pairs {
            let params = SweepParameters::with_center_span(center, span).unwrap();
            let start = params.start_frequency();
            let stop = params.stop_frequency();
            assert!(((start + stop) / 2.0 - center).abs() <= 1e-9 * center.abs());
            assert!(((stop - start) - span).abs() <= 1e-9 * center.abs());
        }
    }

    #[test]
    fn test_stop_not_above_start_rejected() {
        let err = SweepParameters::with_start_stop(2000.0, 2000.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
        let err = SweepParameters::with_start_stop(3000.0, 1000.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
    }

    #[test]
    fn test_failed_setter_keeps_previous_window() {
        let mut params = SweepParameters::with_center_span(1.0e6, 1.0e3).unwrap();
        assert!(params.set_start_stop(5.0, 1.0).is_err());
        assert_eq!(params.center_frequency(), 1.0e6);
        assert_eq!(params.span(), 1.0e3);
    }

    #[test]
    fn test_acquisition_rejects_mismatched_lengths() {
        let err = AcquisitionResult::new(vec![1.0, 2.0], vec![0.0, 0.0], vec![10.0]).unwrap_err();
        assert!(matches!(err, EngineError::Acquisition(_)));
    }

    #[test]
    fn test_acquisition_rows_are_aligned() {
        let result =
            AcquisitionResult::new(vec![-3.0, -1.0], vec![10.0, 20.0], vec![100.0, 200.0])
                .unwrap();
        let rows: Vec<_> = result.rows().collect();
        assert_eq!(rows, vec![(100.0, -3.0, 10.0), (200.0, -1.0, 20.0)]);
    }

    #[test]
    fn test_amplitude_range_is_inclusive() {
        let params = AmplitudeSweepParams::from_range(-10.0, 0.0, 2.5, None).unwrap();
        assert_eq!(params.amplitudes(), &[-10.0, -7.5, -5.0, -2.5, 0.0]);
    }

    #[test]
    fn test_amplitude_range_validation() {
        assert!(AmplitudeSweepParams::from_range(0.0, 10.0, 0.0, None).is_err());
        assert!(AmplitudeSweepParams::from_range(0.0, 10.0, -1.0, None).is_err());
        assert!(AmplitudeSweepParams::from_range(10.0, -10.0, 1.0, None).is_err());
        assert!(AmplitudeSweepParams::from_list(vec![], None).is_err());
        assert!(AmplitudeSweepParams::from_list(vec![0.0], Some(0.0)).is_err());
    }

    #[test]
    fn test_amplitude_range_rejects_tiny_steps() {
        // 1 mdB over 10 dB would already be 10 001 amplitudes
        for step in [1e-300, 1e-9, 1e-3] {
            assert!(matches!(
                AmplitudeSweepParams::from_range(-10.0, 0.0, step, None),
                Err(EngineError::InvalidParameter(_))
            ));
        }
        let params = AmplitudeSweepParams::from_range(-10.0, 0.0, 0.01, None).unwrap();
        assert_eq!(params.amplitudes().len(), 1001);
    }

    #[test]
    fn test_amplitude_list_keeps_order() {
        let params = AmplitudeSweepParams::from_list(vec![0.0, -20.0, -10.0], None).unwrap();
        assert_eq!(params.amplitudes(), &[0.0, -20.0, -10.0]);
    }

    #[test]
    fn test_run_grows_then_freezes() {
        let mut run = AmplitudeSweepRun::new(vec![-10.0, 0.0]);
        run.push(AcquisitionResult::empty());
        run.finish(RunStatus::Cancelled);
        run.push(AcquisitionResult::empty());
        run.finish(RunStatus::Completed);
        assert_eq!(run.completed_steps(), 1);
        assert_eq!(run.status(), RunStatus::Cancelled);
    }
}
