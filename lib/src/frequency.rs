//! Frequency axis of a spectral cube
//!
//! The axis is an explicit arithmetic progression (start, stop, step) whose
//! channel count must agree with the cube it is used with.

use crate::{CleanError, Result};

/// Allowed slack when deciding whether `stop` lands on a grid point, in steps
const GRID_TOLERANCE: f64 = 1e-6;

/// Ascending, evenly spaced frequency axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyAxis {
    start: f64,
    step: f64,
    count: usize,
}

impl FrequencyAxis {
    /// Create an axis covering `start..=stop` with spacing `step`.
    ///
    /// `stop` must lie on the grid spanned by `start` and `step`.
    pub fn new(start: f64, stop: f64, step: f64) -> Result<Self> {
        if !start.is_finite() || !stop.is_finite() || !step.is_finite() {
            return Err(CleanError::config(
                "frequency axis",
                format!("start={start}, stop={stop}, step={step} must be finite"),
            ));
        }
        if step <= 0.0 {
            return Err(CleanError::config(
                "frequency step",
                format!("must be positive, got {step}"),
            ));
        }
        if stop < start {
            return Err(CleanError::config(
                "frequency axis",
                format!("stop {stop} is below start {start}"),
            ));
        }

        let intervals = (stop - start) / step;
        let rounded = intervals.round();
        if (intervals - rounded).abs() > GRID_TOLERANCE * rounded.max(1.0) {
            return Err(CleanError::config(
                "frequency axis",
                format!("stop {stop} is not a whole number of {step} steps from {start}"),
            ));
        }

        Ok(Self {
            start,
            step,
            count: rounded as usize + 1,
        })
    }

    /// Create an axis from an explicit channel count
    pub fn with_count(start: f64, step: f64, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(CleanError::config("channel count", "must be at least 1"));
        }
        Self::new(start, start + step * (count - 1) as f64, step)
    }

    /// Axis from constants known to be valid
    pub(crate) const fn from_constants(start: f64, step: f64, count: usize) -> Self {
        Self { start, step, count }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn stop(&self) -> f64 {
        self.value(self.count - 1)
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Frequency of channel `index`
    pub fn value(&self, index: usize) -> f64 {
        self.start + self.step * index as f64
    }

    pub fn values(&self) -> Vec<f64> {
        (0..self.count).map(|i| self.value(i)).collect()
    }

    /// Natural logarithm of every frequency; requires a strictly positive axis
    pub fn log_values(&self) -> Result<Vec<f64>> {
        if self.start <= 0.0 {
            return Err(CleanError::domain(format!(
                "log-log fit needs positive frequencies, axis starts at {}",
                self.start
            )));
        }
        Ok(self.values().into_iter().map(f64::ln).collect())
    }

    /// Fail fast when the cube does not have one channel per axis value
    pub fn validate_channels(&self, channels: usize) -> Result<()> {
        if channels != self.count {
            return Err(CleanError::dimension(format!(
                "cube has {} channels but the frequency axis {} has {}",
                channels, self, self.count
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for FrequencyAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}..{} step {} ({} channels)",
            self.start,
            self.stop(),
            self.step,
            self.count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdc3a_axis() {
        let axis = FrequencyAxis::new(106.0, 196.0, 0.1).unwrap();
        assert_eq!(axis.len(), 901);
        assert!((axis.stop() - 196.0).abs() < 1e-9);
        assert!((axis.value(10) - 107.0).abs() < 1e-9);
    }

    #[test]
    fn test_axis_validation() {
        assert!(FrequencyAxis::new(100.0, 104.0, 0.0).is_err());
        assert!(FrequencyAxis::new(100.0, 104.0, -1.0).is_err());
        assert!(FrequencyAxis::new(104.0, 100.0, 1.0).is_err());
        assert!(FrequencyAxis::new(100.0, 104.5, 1.0).is_err());
        assert!(FrequencyAxis::new(f64::NAN, 104.0, 1.0).is_err());
        assert!(FrequencyAxis::with_count(100.0, 1.0, 0).is_err());
    }

    #[test]
    fn test_validate_channels() {
        let axis = FrequencyAxis::with_count(100.0, 1.0, 5).unwrap();
        assert!(axis.validate_channels(5).is_ok());
        let err = axis.validate_channels(6).unwrap_err();
        assert!(matches!(err, CleanError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_log_values_require_positive_axis() {
        let axis = FrequencyAxis::with_count(-1.0, 1.0, 3).unwrap();
        assert!(matches!(
            axis.log_values(),
            Err(CleanError::Domain { .. })
        ));

        let axis = FrequencyAxis::with_count(1.0, 1.0, 3).unwrap();
        let logs = axis.log_values().unwrap();
        assert_eq!(logs[0], 0.0);
        assert!((logs[2] - 3f64.ln()).abs() < 1e-12);
    }
}
