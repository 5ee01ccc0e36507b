//! Per-pixel polynomial foreground fitting across frequency
//!
//! Every Fourier pixel of one component (real or imaginary) carries a series
//! of values across the frequency axis. A low-order polynomial is fitted to
//! each series independently, either directly against frequency or in log-log
//! space, and the fitted trend is removed in place.
//!
//! The frequency axis is shared by all pixels, so the least-squares operator
//! is built once per run ([`PolynomialBasis`]) and each pixel fit reduces to
//! two small matrix-vector products.

use crate::cube::{Cube, PixelMajorCube};
use crate::frequency::FrequencyAxis;
use crate::scratch::Component;
use crate::{CleanError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on polynomial terms per fitted sample
const MAX_TERMS_PER_SAMPLE: usize = 2;

/// Fit domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// Fit value against frequency
    Linear,
    /// Fit ln(value + offset) against ln(frequency)
    LogLog,
}

impl FitMode {
    pub fn name(&self) -> &'static str {
        match self {
            FitMode::Linear => "linear",
            FitMode::LogLog => "log-log",
        }
    }
}

/// What to do with a pixel whose series cannot be fitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainErrorPolicy {
    /// Zero the pixel's series, record it, and keep going
    Isolate,
    /// Fail the whole component
    Abort,
}

/// Per-pixel fit configuration
#[derive(Debug, Clone, Copy)]
pub struct FitConfig {
    /// Polynomial degree
    pub degree: usize,
    pub mode: FitMode,
    /// Constant added to `|min|` to form the positivity offset in log-log mode
    pub positivity_pad: f64,
    pub on_domain_error: DomainErrorPolicy,
    /// Pixels between progress log lines
    pub progress_interval: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            degree: 3,
            mode: FitMode::Linear,
            positivity_pad: 1.0,
            on_domain_error: DomainErrorPolicy::Isolate,
            progress_interval: 100_000,
        }
    }
}

impl FitConfig {
    pub fn new(degree: usize, mode: FitMode) -> Self {
        Self {
            degree,
            mode,
            ..Self::default()
        }
    }

    pub fn with_positivity_pad(mut self, pad: f64) -> Result<Self> {
        self.positivity_pad = pad;
        self.validate()?;
        Ok(self)
    }

    pub fn with_policy(mut self, policy: DomainErrorPolicy) -> Self {
        self.on_domain_error = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.positivity_pad.is_finite() || self.positivity_pad <= 0.0 {
            return Err(CleanError::config(
                "positivity pad",
                format!("must be positive and finite, got {}", self.positivity_pad),
            ));
        }
        if self.progress_interval == 0 {
            return Err(CleanError::config("progress interval", "must be at least 1"));
        }
        Ok(())
    }
}

/// Why a single pixel could not be fitted
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum PixelFitError {
    #[error("non-finite input value {value} at channel {channel}")]
    NonFinite { channel: usize, value: f64 },
    #[error("value {shifted} at channel {channel} is not positive after adding the offset")]
    NonPositiveLog { channel: usize, shifted: f64 },
    #[error("non-finite residual at channel {channel}")]
    NonFiniteResidual { channel: usize },
}

/// A pixel that was left out of the fit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelFailure {
    pub row: usize,
    pub col: usize,
    pub reason: PixelFitError,
}

/// Least-squares operator for one (possibly log-transformed) frequency axis
#[derive(Debug, Clone)]
pub struct PolynomialBasis {
    degree: usize,
    axis: Vec<f64>,
    /// Vandermonde matrix, row-major `samples x (degree + 1)`, lowest power first
    vandermonde: Vec<f64>,
    /// Pseudo-inverse of the Vandermonde matrix, row-major `(degree + 1) x samples`
    projector: Vec<f64>,
    under_determined: bool,
}

impl PolynomialBasis {
    /// Build the operator for fitting degree-`degree` polynomials over `axis`
    pub fn new(axis: &[f64], degree: usize) -> Result<Self> {
        if axis.is_empty() {
            return Err(CleanError::dimension("cannot fit a polynomial to zero samples"));
        }
        if let Some(x) = axis.iter().find(|x| !x.is_finite()) {
            return Err(CleanError::domain(format!("non-finite fit abscissa {}", x)));
        }

        let samples = axis.len();
        let terms = degree
            .checked_add(1)
            .filter(|&t| t <= MAX_TERMS_PER_SAMPLE.saturating_mul(samples))
            .ok_or_else(|| {
                CleanError::config(
                    "degree",
                    format!(
                        "{} is far above the {} samples; any degree of {} or more already interpolates exactly",
                        degree,
                        samples,
                        samples - 1
                    ),
                )
            })?;
        let under_determined = degree >= samples;
        if under_determined {
            log::warn!(
                "Polynomial degree {} with only {} samples: the fit interpolates exactly instead of smoothing",
                degree,
                samples
            );
        }

        let mut vandermonde = Vec::with_capacity(samples * terms);
        for &x in axis {
            let mut power = 1.0;
            for _ in 0..terms {
                vandermonde.push(power);
                power *= x;
            }
        }

        // Column scaling keeps high powers of large abscissae well conditioned
        let v = DMatrix::from_row_slice(samples, terms, &vandermonde);
        let scales: Vec<f64> = (0..terms)
            .map(|j| {
                let norm = v.column(j).norm();
                if norm > 0.0 {
                    norm
                } else {
                    1.0
                }
            })
            .collect();
        let mut scaled = v;
        for (j, &s) in scales.iter().enumerate() {
            scaled.column_mut(j).scale_mut(1.0 / s);
        }

        let svd = scaled.svd(true, true);
        let largest = svd.singular_values.max();
        let eps = largest * samples.max(terms) as f64 * f64::EPSILON;
        let pinv = svd
            .pseudo_inverse(eps)
            .map_err(|e| CleanError::domain(format!("least-squares solve failed: {}", e)))?;

        let mut projector = Vec::with_capacity(terms * samples);
        for (j, &s) in scales.iter().enumerate() {
            projector.extend(pinv.row(j).iter().map(|p| p / s));
        }

        Ok(Self {
            degree,
            axis: axis.to_vec(),
            vandermonde,
            projector,
            under_determined,
        })
    }

    /// Basis over the frequency axis, log-transformed when the mode asks for it
    pub fn for_axis(frequencies: &FrequencyAxis, config: &FitConfig) -> Result<Self> {
        let axis = match config.mode {
            FitMode::Linear => frequencies.values(),
            FitMode::LogLog => frequencies.log_values()?,
        };
        Self::new(&axis, config.degree)
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn terms(&self) -> usize {
        self.degree + 1
    }

    pub fn samples(&self) -> usize {
        self.axis.len()
    }

    /// Abscissae the basis was built for
    pub fn axis(&self) -> &[f64] {
        &self.axis
    }

    /// Whether the degree is at or above the number of samples
    pub fn is_under_determined(&self) -> bool {
        self.under_determined
    }

    /// Least-squares coefficients for `y`, lowest power first
    pub fn solve_into(&self, y: &[f64], coeffs: &mut [f64]) {
        let n = self.samples();
        for (j, c) in coeffs.iter_mut().enumerate() {
            let row = &self.projector[j * n..(j + 1) * n];
            *c = row.iter().zip(y).map(|(p, v)| p * v).sum();
        }
    }

    pub fn solve(&self, y: &[f64]) -> Vec<f64> {
        let mut coeffs = vec![0.0; self.terms()];
        self.solve_into(y, &mut coeffs);
        coeffs
    }

    /// Fitted model at sample `i`
    pub fn model_at(&self, i: usize, coeffs: &[f64]) -> f64 {
        let m = self.terms();
        self.vandermonde[i * m..(i + 1) * m]
            .iter()
            .zip(coeffs)
            .map(|(v, c)| v * c)
            .sum()
    }
}

/// Evaluate a lowest-power-first polynomial at `x`
pub fn evaluate_polynomial(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

/// Positivity offset for a log-log fit: `|min| + pad`
pub fn positivity_offset(series: &[f64], pad: f64) -> f64 {
    let min = series.iter().copied().fold(f64::INFINITY, f64::min);
    min.abs() + pad
}

/// Fit and remove the trend of one series in place.
///
/// On success `series` holds the residual and `coeffs` the fitted polynomial.
/// On failure `series` is left as it was.
pub fn fit_series(
    series: &mut [f64],
    basis: &PolynomialBasis,
    config: &FitConfig,
    coeffs: &mut [f64],
) -> std::result::Result<(), PixelFitError> {
    debug_assert_eq!(series.len(), basis.samples());
    debug_assert_eq!(coeffs.len(), basis.terms());

    if let Some((channel, &value)) = series.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(PixelFitError::NonFinite { channel, value });
    }

    match config.mode {
        FitMode::Linear => {
            basis.solve_into(series, coeffs);
            let residual: Vec<f64> = series
                .iter()
                .enumerate()
                .map(|(i, &v)| v - basis.model_at(i, coeffs))
                .collect();
            commit(series, &residual)
        }
        FitMode::LogLog => {
            let offset = positivity_offset(series, config.positivity_pad);
            let mut log_series = Vec::with_capacity(series.len());
            for (channel, &v) in series.iter().enumerate() {
                let shifted = v + offset;
                if !(shifted > 0.0) {
                    return Err(PixelFitError::NonPositiveLog { channel, shifted });
                }
                log_series.push(shifted.ln());
            }

            basis.solve_into(&log_series, coeffs);
            let residual: Vec<f64> = log_series
                .iter()
                .enumerate()
                .map(|(i, &y)| (y - basis.model_at(i, coeffs)).exp() - offset)
                .collect();
            commit(series, &residual)
        }
    }
}

fn commit(series: &mut [f64], residual: &[f64]) -> std::result::Result<(), PixelFitError> {
    if let Some(channel) = residual.iter().position(|v| !v.is_finite()) {
        return Err(PixelFitError::NonFiniteResidual { channel });
    }
    series.copy_from_slice(residual);
    Ok(())
}

/// Outcome of fitting every pixel of one component
#[derive(Debug, Clone)]
pub struct ComponentFitReport {
    pub component: Component,
    pub side: usize,
    pub terms: usize,
    /// Pixel-major coefficients, `terms` per pixel; NaN for failed pixels
    pub coefficients: Vec<f64>,
    /// Failed pixels, ordered by pixel index
    pub failures: Vec<PixelFailure>,
}

impl ComponentFitReport {
    pub fn pixels(&self) -> usize {
        self.side * self.side
    }

    pub fn coefficients_at(&self, row: usize, col: usize) -> &[f64] {
        let start = (row * self.side + col) * self.terms;
        &self.coefficients[start..start + self.terms]
    }

    /// Coefficients as a `(terms, side, side)` cube, one plane per power
    pub fn coefficient_cube(&self) -> Cube {
        let mut cube = Cube::zeros(self.terms, self.side);
        for power in 0..self.terms {
            let plane = cube.channel_mut(power);
            for (pixel, value) in plane.iter_mut().enumerate() {
                *value = self.coefficients[pixel * self.terms + power];
            }
        }
        cube
    }
}

/// Fit every pixel of a pixel-major component cube in parallel
pub fn fit_component(
    cube: &mut PixelMajorCube,
    basis: &PolynomialBasis,
    config: &FitConfig,
    component: Component,
) -> Result<ComponentFitReport> {
    config.validate()?;
    let channels = cube.channels();
    if channels != basis.samples() {
        return Err(CleanError::dimension(format!(
            "component cube has {} channels but the fit axis has {} samples",
            channels,
            basis.samples()
        )));
    }

    let side = cube.side();
    let total = cube.pixels();
    let terms = basis.terms();
    let interval = config.progress_interval;
    let done = AtomicUsize::new(0);

    log::info!(
        "Fitting {} component: {} pixels, degree {}, {} fit",
        component,
        total,
        basis.degree(),
        config.mode.name()
    );

    let mut coefficients = vec![0.0; total * terms];
    let mut failures: Vec<PixelFailure> = cube
        .data_mut()
        .par_chunks_mut(channels)
        .zip(coefficients.par_chunks_mut(terms))
        .enumerate()
        .filter_map(|(pixel, (series, coeffs))| {
            let outcome = fit_series(series, basis, config, coeffs);

            let count = done.fetch_add(1, Ordering::Relaxed) + 1;
            if count % interval == 0 {
                log::info!("Fitting {} pixel {} of {}", component, count, total);
            }

            outcome.err().map(|reason| {
                series.fill(0.0);
                coeffs.fill(f64::NAN);
                PixelFailure {
                    row: pixel / side,
                    col: pixel % side,
                    reason,
                }
            })
        })
        .collect();
    failures.sort_by_key(|f| (f.row, f.col));

    if let Some(first) = failures.first() {
        match config.on_domain_error {
            DomainErrorPolicy::Abort => {
                return Err(CleanError::domain(format!(
                    "{} component, pixel ({}, {}): {}",
                    component, first.row, first.col, first.reason
                )));
            }
            DomainErrorPolicy::Isolate => {
                log::warn!(
                    "{} component: {} of {} pixels could not be fitted and were zeroed (first at ({}, {}): {})",
                    component,
                    failures.len(),
                    total,
                    first.row,
                    first.col,
                    first.reason
                );
            }
        }
    }

    Ok(ComponentFitReport {
        component,
        side,
        terms,
        coefficients,
        failures,
    })
}
