//! Cleaning pipelines
//!
//! Coordinates the transform, fit, and write stages of the polynomial path
//! and the decompose/project/subtract steps of the PCA path, reading from a
//! `ChannelSource` and writing to a `ChannelSink`.

use crate::cube::Cube;
use crate::error::{Stage, StageContext};
use crate::fits_io::{write_cube, ChannelSink, ChannelSource};
use crate::frequency::FrequencyAxis;
use crate::pca::{decompose, project, ForegroundModel, PcaDecomposition};
use crate::polyfit::{fit_component, FitConfig, PixelFailure, PolynomialBasis};
use crate::scratch::{Component, PlaneKind, ScratchStore};
use crate::spectral::{FourierPlane, SpectralTransform, DEFAULT_RESIDUE_TOLERANCE};
use crate::{CleanError, Result};
use std::path::{Path, PathBuf};

/// Configuration of a polynomial cleaning run
#[derive(Debug, Clone)]
pub struct PolyFitConfig {
    pub fit: FitConfig,
    pub frequencies: FrequencyAxis,
    /// Directory for the Fourier-plane scratch files
    pub scratch_dir: PathBuf,
    /// Leave the scratch directory in place after a successful run
    pub keep_scratch: bool,
    /// Relative tolerance for the imaginary residue of the inverse transform
    pub residue_tolerance: f64,
    /// Directory to write `coefficients_{real,imag}.fits` into
    pub save_coefficients: Option<PathBuf>,
}

impl PolyFitConfig {
    /// Create a new configuration with default scratch handling
    pub fn new<P: AsRef<Path>>(
        fit: FitConfig,
        frequencies: FrequencyAxis,
        scratch_dir: P,
    ) -> Result<Self> {
        let config = Self {
            fit,
            frequencies,
            scratch_dir: scratch_dir.as_ref().to_path_buf(),
            keep_scratch: false,
            residue_tolerance: DEFAULT_RESIDUE_TOLERANCE,
            save_coefficients: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.fit.validate()?;
        if !self.residue_tolerance.is_finite() || self.residue_tolerance <= 0.0 {
            return Err(CleanError::config(
                "residue tolerance",
                format!("must be positive, got {}", self.residue_tolerance),
            ));
        }
        if self.frequencies.is_empty() {
            return Err(CleanError::config("frequency axis", "has no channels"));
        }
        Ok(())
    }
}

/// Failed pixels of one Fourier component
#[derive(Debug, Clone)]
pub struct ComponentFailures {
    pub component: Component,
    pub pixels: Vec<PixelFailure>,
}

/// What a polynomial run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub channels: usize,
    pub side: usize,
    pub failures: Vec<ComponentFailures>,
    /// Channels whose inverse transform left an imaginary residue above tolerance
    pub residue_channels: Vec<usize>,
    /// The polynomial had at least as many terms as there are channels
    pub under_determined: bool,
}

impl RunReport {
    pub fn failed_pixels(&self, component: Component) -> &[PixelFailure] {
        self.failures
            .iter()
            .find(|f| f.component == component)
            .map(|f| f.pixels.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_clean(&self) -> bool {
        self.failures.iter().all(|f| f.pixels.is_empty()) && self.residue_channels.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut parts = vec![format!(
            "{} channels cleaned ({}x{})",
            self.channels, self.side, self.side
        )];
        for f in &self.failures {
            parts.push(format!("{}: {} failed pixels", f.component, f.pixels.len()));
        }
        parts.push(format!(
            "{} channels with imaginary residue",
            self.residue_channels.len()
        ));
        if self.under_determined {
            parts.push("under-determined fit".to_string());
        }
        parts.join("; ")
    }
}

/// Per-pixel polynomial foreground removal in the Fourier plane
pub struct PolyFitPipeline {
    config: PolyFitConfig,
}

impl PolyFitPipeline {
    pub fn new(config: PolyFitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PolyFitConfig {
        &self.config
    }

    /// Clean every channel of `source` into `sink`.
    ///
    /// On failure the scratch directory is left in place for inspection.
    pub fn run(
        &self,
        source: &mut dyn ChannelSource,
        sink: &mut dyn ChannelSink,
    ) -> Result<RunReport> {
        let shape = source.shape();
        self.config
            .frequencies
            .validate_channels(shape.channels)
            .stage(Stage::Transform)?;

        let basis =
            PolynomialBasis::for_axis(&self.config.frequencies, &self.config.fit).stage(Stage::FitReal)?;

        log::info!(
            "Polynomial cleaning: {} cube, {} across {}, degree {}",
            shape,
            self.config.fit.mode.name(),
            self.config.frequencies,
            basis.degree()
        );

        let scratch = ScratchStore::create(&self.config.scratch_dir).stage(Stage::Transform)?;
        let result = self.run_stages(source, sink, &scratch, &basis);

        match result {
            Ok(report) => {
                if self.config.keep_scratch {
                    log::info!("Keeping scratch directory {}", scratch.dir().display());
                } else {
                    scratch.remove().stage(Stage::Cleanup)?;
                }
                log::info!("{}", report.summary());
                Ok(report)
            }
            Err(e) => {
                log::error!(
                    "Run failed, scratch directory kept at {}",
                    scratch.dir().display()
                );
                Err(e)
            }
        }
    }

    fn run_stages(
        &self,
        source: &mut dyn ChannelSource,
        sink: &mut dyn ChannelSink,
        scratch: &ScratchStore,
        basis: &PolynomialBasis,
    ) -> Result<RunReport> {
        let shape = source.shape();
        let channels = shape.channels;
        let side = shape.side;
        let transform = SpectralTransform::new(side).stage(Stage::Transform)?;

        // per-channel input amplitude, the rounding scale of the cleaned planes
        let mut input_scale = Vec::with_capacity(channels);
        for channel in 0..channels {
            log::info!("Transforming channel {}/{}", channel + 1, channels);
            let image = source.read_channel(channel).stage(Stage::Transform)?;
            input_scale.push(image.iter().fold(0.0f64, |m, v| m.max(v.abs())));
            let plane = transform.forward(&image).stage(Stage::Transform)?;
            scratch
                .write_plane(Component::Real, PlaneKind::Raw, channel, &plane.real())
                .stage(Stage::Transform)?;
            scratch
                .write_plane(Component::Imag, PlaneKind::Raw, channel, &plane.imag())
                .stage(Stage::Transform)?;
        }

        let mut report = RunReport {
            channels,
            side,
            under_determined: basis.is_under_determined(),
            ..RunReport::default()
        };

        // one component cube in memory at a time
        for component in Component::ALL {
            let stage = match component {
                Component::Real => Stage::FitReal,
                Component::Imag => Stage::FitImag,
            };
            let mut cube = scratch
                .load_component(component, PlaneKind::Raw, channels, side)
                .stage(stage)?;
            let fitted = fit_component(&mut cube, basis, &self.config.fit, component).stage(stage)?;
            scratch
                .store_component(component, PlaneKind::Clean, &cube)
                .stage(stage)?;

            if let Some(dir) = &self.config.save_coefficients {
                std::fs::create_dir_all(dir)
                    .map_err(|e| CleanError::io(dir, e))
                    .stage(stage)?;
                let path = dir.join(format!("coefficients_{}.fits", component.tag()));
                write_cube(&path, &fitted.coefficient_cube()).stage(stage)?;
                log::info!("Saved {} coefficients to {}", component, path.display());
            }

            report.failures.push(ComponentFailures {
                component,
                pixels: fitted.failures,
            });
        }

        for channel in 0..channels {
            log::info!("Inverse transforming channel {}/{}", channel + 1, channels);
            let real = scratch
                .read_plane(Component::Real, PlaneKind::Clean, channel, side * side)
                .stage(Stage::InverseTransform)?;
            let imag = scratch
                .read_plane(Component::Imag, PlaneKind::Clean, channel, side * side)
                .stage(Stage::InverseTransform)?;
            let plane = FourierPlane::from_parts(side, &real, &imag).stage(Stage::InverseTransform)?;
            let outcome = transform.inverse(&plane).stage(Stage::InverseTransform)?;

            if outcome
                .residue_exceeds_scale(self.config.residue_tolerance, input_scale[channel])
            {
                log::warn!(
                    "Channel {}: imaginary residue {:.3e} against real scale {:.3e}",
                    channel,
                    outcome.max_imag_residue,
                    outcome.max_real
                );
                report.residue_channels.push(channel);
            }

            sink.write_channel(channel, side, &outcome.image)
                .stage(Stage::Write)?;
        }

        Ok(report)
    }
}

/// Result of a PCA cleaning run
#[derive(Debug, Clone)]
pub struct PcaOutcome {
    pub decomposition: PcaDecomposition,
    pub model: ForegroundModel,
    /// Input minus the foreground field
    pub cleaned: Cube,
}

/// Principal component foreground removal
#[derive(Debug, Clone, Copy)]
pub struct PcaPipeline {
    modes: usize,
}

impl PcaPipeline {
    pub fn new(modes: usize) -> Result<Self> {
        if modes == 0 {
            return Err(CleanError::config("mode count", "must be at least 1"));
        }
        Ok(Self { modes })
    }

    pub fn modes(&self) -> usize {
        self.modes
    }

    pub fn run(&self, cube: &Cube) -> Result<PcaOutcome> {
        if self.modes > cube.channels() {
            return Err(CleanError::dimension(format!(
                "cannot remove {} modes from a cube with {} channels",
                self.modes,
                cube.channels()
            )));
        }

        log::info!(
            "PCA cleaning: {} channels of {}x{}, removing {} modes",
            cube.channels(),
            cube.side(),
            cube.side(),
            self.modes
        );

        let decomposition = decompose(&cube.as_matrix())?;
        let model = project(
            self.modes,
            &decomposition.eigenvectors,
            &decomposition.zero_mean,
            &decomposition.mean,
        )?;
        let cleaned = model.subtract_from(cube)?;

        let removed: f64 = decomposition
            .explained_variance_ratio()
            .iter()
            .take(self.modes)
            .sum();
        log::info!(
            "Removed {} modes carrying {:.4}% of the variance",
            self.modes,
            removed * 100.0
        );

        Ok(PcaOutcome {
            decomposition,
            model,
            cleaned,
        })
    }

    /// Read the whole source, clean it, and write each cleaned channel to `sink`
    pub fn run_to_sink(
        &self,
        source: &mut dyn ChannelSource,
        sink: &mut dyn ChannelSink,
    ) -> Result<PcaOutcome> {
        let shape = source.shape();
        let mut cube = Cube::zeros(shape.channels, shape.side);
        for channel in 0..shape.channels {
            log::debug!("Reading channel {}/{}", channel + 1, shape.channels);
            let plane = source.read_channel(channel)?;
            cube.channel_mut(channel).copy_from_slice(&plane);
        }

        let outcome = self.run(&cube)?;
        for channel in 0..shape.channels {
            sink.write_channel(channel, shape.side, outcome.cleaned.channel(channel))
                .stage(Stage::Write)?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits_io::{CubeShape, FitsCube, FitsDirectorySink};
    use crate::polyfit::{DomainErrorPolicy, FitMode, PixelFitError};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Quadratic-in-frequency foreground with a different spectrum per pixel
    fn quadratic_foreground(axis: &FrequencyAxis, side: usize) -> Cube {
        let mut cube = Cube::zeros(axis.len(), side);
        for c in 0..axis.len() {
            let nu = axis.value(c);
            for r in 0..side {
                for col in 0..side {
                    let a = 50.0 + (r * side + col) as f64;
                    let b = -0.3 + 0.01 * r as f64;
                    let q = 0.002 * (1.0 + col as f64);
                    cube.set(c, r, col, a + b * nu + q * nu * nu);
                }
            }
        }
        cube
    }

    fn max_abs(values: &[f64]) -> f64 {
        values.iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    #[test]
    fn test_polyfit_pipeline_removes_smooth_foreground() {
        let dir = tempfile::tempdir().unwrap();
        let axis = FrequencyAxis::new(100.0, 111.0, 1.0).unwrap();
        let mut input = quadratic_foreground(&axis, 8);
        let mut output = Cube::zeros(axis.len(), 8);

        let config =
            PolyFitConfig::new(FitConfig::new(2, FitMode::Linear), axis, dir.path().join("TEMP"))
                .unwrap();
        let report = PolyFitPipeline::new(config)
            .unwrap()
            .run(&mut input, &mut output)
            .unwrap();

        assert_eq!(report.channels, 12);
        assert!(report.is_clean(), "{}", report.summary());
        assert!(!report.under_determined);
        assert!(max_abs(output.data()) < 1e-6 * max_abs(input.data()));
        assert!(!dir.path().join("TEMP").exists());
    }

    #[test]
    fn test_polyfit_pipeline_keeps_signal_variation() {
        let dir = tempfile::tempdir().unwrap();
        let axis = FrequencyAxis::new(100.0, 123.0, 1.0).unwrap();
        let foreground = quadratic_foreground(&axis, 6);

        let mut rng = StdRng::seed_from_u64(7);
        let mut signal = Cube::zeros(axis.len(), 6);
        for c in 0..axis.len() {
            for v in signal.channel_mut(c).iter_mut() {
                *v = rng.random_range(-0.5..0.5);
            }
        }
        let mut input = Cube::from_vec(
            axis.len(),
            6,
            foreground
                .data()
                .iter()
                .zip(signal.data())
                .map(|(f, s)| f + s)
                .collect(),
        )
        .unwrap();
        let mut output = Cube::zeros(axis.len(), 6);

        let config =
            PolyFitConfig::new(FitConfig::new(2, FitMode::Linear), axis, dir.path().join("s"))
                .unwrap();
        PolyFitPipeline::new(config)
            .unwrap()
            .run(&mut input, &mut output)
            .unwrap();

        // a 3-term fit over 24 channels removes only a small share of white noise
        let error = output.difference(&signal).unwrap();
        assert!(error.power() < 0.5 * signal.power());
        assert!(output.power() > 0.5 * signal.power());
    }

    #[test]
    fn test_polyfit_pipeline_keeps_scratch_and_coefficients() {
        let dir = tempfile::tempdir().unwrap();
        let axis = FrequencyAxis::new(100.0, 105.0, 1.0).unwrap();
        let mut input = quadratic_foreground(&axis, 4);
        let mut output = Cube::zeros(axis.len(), 4);

        let mut config =
            PolyFitConfig::new(FitConfig::new(2, FitMode::Linear), axis, dir.path().join("TEMP"))
                .unwrap();
        config.keep_scratch = true;
        config.save_coefficients = Some(dir.path().join("coeffs"));
        PolyFitPipeline::new(config)
            .unwrap()
            .run(&mut input, &mut output)
            .unwrap();

        assert!(dir.path().join("TEMP").join("real_clean_0.bin").exists());
        assert!(dir.path().join("TEMP").join("imag_raw_5.bin").exists());
        let coefficients = FitsCube::open(dir.path().join("coeffs").join("coefficients_imag.fits")).unwrap();
        assert_eq!(coefficients.shape(), CubeShape { channels: 3, side: 4 });
    }

    #[test]
    fn test_polyfit_pipeline_loglog_runs() {
        let dir = tempfile::tempdir().unwrap();
        let axis = FrequencyAxis::new(106.0, 116.0, 0.5).unwrap();
        let side = 6;
        let mut input = Cube::zeros(axis.len(), side);
        for c in 0..axis.len() {
            let scale = (axis.value(c) / 106.0).powf(-2.5);
            for (p, v) in input.channel_mut(c).iter_mut().enumerate() {
                *v = (10.0 + p as f64) * scale;
            }
        }
        let mut output = Cube::zeros(axis.len(), side);

        let config =
            PolyFitConfig::new(FitConfig::new(3, FitMode::LogLog), axis, dir.path().join("TEMP"))
                .unwrap();
        let report = PolyFitPipeline::new(config)
            .unwrap()
            .run(&mut input, &mut output)
            .unwrap();

        assert!(report.failed_pixels(Component::Real).is_empty());
        assert!(report.failed_pixels(Component::Imag).is_empty());
        assert!(output.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_polyfit_pipeline_rejects_channel_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let axis = FrequencyAxis::new(100.0, 109.0, 1.0).unwrap();
        let mut input = Cube::zeros(12, 4);
        let mut output = Cube::zeros(12, 4);

        let config =
            PolyFitConfig::new(FitConfig::default(), axis, dir.path().join("TEMP")).unwrap();
        let err = PolyFitPipeline::new(config)
            .unwrap()
            .run(&mut input, &mut output)
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Transform));
        assert!(matches!(err.root(), CleanError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_polyfit_pipeline_abort_tags_stage_and_keeps_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let axis = FrequencyAxis::new(100.0, 107.0, 1.0).unwrap();
        let mut input = quadratic_foreground(&axis, 4);
        input.set(3, 1, 2, f64::NAN);
        let mut output = Cube::zeros(axis.len(), 4);

        let fit = FitConfig::new(2, FitMode::Linear).with_policy(DomainErrorPolicy::Abort);
        let config = PolyFitConfig::new(fit, axis, dir.path().join("TEMP")).unwrap();
        let err = PolyFitPipeline::new(config)
            .unwrap()
            .run(&mut input, &mut output)
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::FitReal));
        assert!(matches!(err.root(), CleanError::Domain { .. }));
        assert!(dir.path().join("TEMP").join("real_raw_0.bin").exists());
    }

    #[test]
    fn test_polyfit_pipeline_isolates_nan_channel() {
        let dir = tempfile::tempdir().unwrap();
        let axis = FrequencyAxis::new(100.0, 107.0, 1.0).unwrap();
        let mut input = quadratic_foreground(&axis, 4);
        input.set(3, 1, 2, f64::NAN);
        let mut output = Cube::zeros(axis.len(), 4);

        let config =
            PolyFitConfig::new(FitConfig::new(2, FitMode::Linear), axis, dir.path().join("TEMP"))
                .unwrap();
        let report = PolyFitPipeline::new(config)
            .unwrap()
            .run(&mut input, &mut output)
            .unwrap();

        // the NaN lands in the real part of some Fourier pixels and the imaginary part of others
        let failed: Vec<&PixelFailure> = Component::ALL
            .iter()
            .flat_map(|&c| report.failed_pixels(c))
            .collect();
        assert!(!failed.is_empty());
        assert!(failed
            .iter()
            .all(|f| matches!(f.reason, PixelFitError::NonFinite { channel: 3, .. })));
        assert!(!report.is_clean());
        assert!(output.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_polyfit_pipeline_scratch_in_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let axis = FrequencyAxis::new(100.0, 105.0, 1.0).unwrap();
        let mut input = quadratic_foreground(&axis, 4);
        let mut sink = FitsDirectorySink::create(&out, "data_clean").unwrap();
        std::fs::write(out.join("precious.txt"), "keep").unwrap();

        let config = PolyFitConfig::new(FitConfig::new(2, FitMode::Linear), axis, &out).unwrap();
        PolyFitPipeline::new(config)
            .unwrap()
            .run(&mut input, &mut sink)
            .unwrap();

        assert!(out.join("precious.txt").exists());
        assert!(out.join("data_clean_0.fits").exists());
        assert!(out.join("data_clean_5.fits").exists());
        assert!(!out.join("real_raw_0.bin").exists());
    }

    #[test]
    fn test_report_summary() {
        let report = RunReport {
            channels: 901,
            side: 2048,
            failures: vec![
                ComponentFailures {
                    component: Component::Real,
                    pixels: Vec::new(),
                },
                ComponentFailures {
                    component: Component::Imag,
                    pixels: Vec::new(),
                },
            ],
            residue_channels: vec![4],
            under_determined: false,
        };
        assert_eq!(
            report.summary(),
            "901 channels cleaned (2048x2048); real: 0 failed pixels; imag: 0 failed pixels; 1 channels with imaginary residue"
        );
        assert!(!report.is_clean());
    }

    #[test]
    fn test_polyfit_config_validation() {
        let axis = FrequencyAxis::new(100.0, 104.0, 1.0).unwrap();
        let mut config = PolyFitConfig::new(FitConfig::default(), axis, "TEMP").unwrap();
        config.residue_tolerance = 0.0;
        assert!(PolyFitPipeline::new(config).is_err());
    }

    fn rank_one_cube(channels: usize, side: usize) -> Cube {
        let mut cube = Cube::zeros(channels, side);
        for c in 0..channels {
            let spectrum = (1.0 + 0.1 * c as f64).powf(-2.0);
            for (p, v) in cube.channel_mut(c).iter_mut().enumerate() {
                *v = 3.0 + c as f64 + spectrum * (p as f64 * 0.37).sin();
            }
        }
        cube
    }

    #[test]
    fn test_pca_pipeline_removes_single_mode() {
        let cube = rank_one_cube(6, 5);
        let outcome = PcaPipeline::new(1).unwrap().run(&cube).unwrap();
        assert_eq!(outcome.model.modes(), 1);
        assert_eq!(outcome.model.field.channels(), 6);
        assert!(max_abs(outcome.cleaned.data()) < 1e-9);
    }

    #[test]
    fn test_pca_pipeline_to_sink() {
        let mut source = rank_one_cube(4, 3);
        let mut sink = Cube::zeros(4, 3);
        let outcome = PcaPipeline::new(1)
            .unwrap()
            .run_to_sink(&mut source, &mut sink)
            .unwrap();
        assert_eq!(sink, outcome.cleaned);
    }

    #[test]
    fn test_pca_pipeline_mode_limits() {
        assert!(matches!(
            PcaPipeline::new(0),
            Err(CleanError::InvalidConfig { .. })
        ));
        let cube = rank_one_cube(3, 3);
        assert!(matches!(
            PcaPipeline::new(4).unwrap().run(&cube),
            Err(CleanError::DimensionMismatch { .. })
        ));
    }
}
