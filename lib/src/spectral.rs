//! Per-channel 2D Fourier transform
//!
//! Converts a real image-plane channel into a complex Fourier-plane channel
//! and back. The forward transform is unnormalised and the inverse carries the
//! `1 / side²` factor, with the DC term at index (0, 0).

use crate::{CleanError, Result};
use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Default relative tolerance for the imaginary residue of an inverse transform
pub const DEFAULT_RESIDUE_TOLERANCE: f64 = 1e-8;

/// Fourier-plane channel, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct FourierPlane {
    pub side: usize,
    pub data: Vec<Complex64>,
}

impl FourierPlane {
    /// Assemble a plane from separate real and imaginary parts
    pub fn from_parts(side: usize, real: &[f64], imag: &[f64]) -> Result<Self> {
        let n = side * side;
        if real.len() != n || imag.len() != n {
            return Err(CleanError::dimension(format!(
                "expected {} values per component for a {}x{} plane, got {} real and {} imaginary",
                n,
                side,
                side,
                real.len(),
                imag.len()
            )));
        }
        let data = real
            .iter()
            .zip(imag)
            .map(|(&re, &im)| Complex64::new(re, im))
            .collect();
        Ok(Self { side, data })
    }

    pub fn real(&self) -> Vec<f64> {
        self.data.iter().map(|c| c.re).collect()
    }

    pub fn imag(&self) -> Vec<f64> {
        self.data.iter().map(|c| c.im).collect()
    }

    /// Power per Fourier pixel, used for quick-look maps
    pub fn power(&self) -> Vec<f64> {
        self.data.iter().map(|c| c.norm_sqr()).collect()
    }
}

/// Image plane recovered by an inverse transform
#[derive(Debug, Clone)]
pub struct InverseOutcome {
    /// Real part of the inverse transform
    pub image: Vec<f64>,
    /// Largest magnitude of the discarded imaginary part
    pub max_imag_residue: f64,
    /// Largest magnitude of the retained real part
    pub max_real: f64,
}

impl InverseOutcome {
    /// Whether the discarded imaginary residue exceeds rounding level.
    ///
    /// A real sky always inverts to a real image, so a residue above
    /// `tolerance * max|real|` points at a defect upstream of the inverse
    /// transform. The bound is relative at every amplitude scale.
    pub fn residue_exceeds(&self, tolerance: f64) -> bool {
        self.residue_exceeds_scale(tolerance, self.max_real)
    }

    /// Same check against an outside amplitude scale, such as the image a
    /// plane was derived from, when the retained part may have cancelled
    /// far below the rounding level of its inputs.
    pub fn residue_exceeds_scale(&self, tolerance: f64, scale: f64) -> bool {
        self.max_imag_residue > tolerance * scale.max(self.max_real).max(f64::MIN_POSITIVE)
    }
}

/// Forward and inverse 2D FFT for square planes of one fixed size
pub struct SpectralTransform {
    side: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl SpectralTransform {
    /// Plan transforms for `side x side` planes
    pub fn new(side: usize) -> Result<Self> {
        if side == 0 {
            return Err(CleanError::dimension("plane side must be at least 1"));
        }

        let mut planner = FftPlanner::<f64>::new();
        let forward = planner.plan_fft_forward(side);
        let inverse = planner.plan_fft_inverse(side);

        Ok(Self {
            side,
            forward,
            inverse,
        })
    }

    pub fn side(&self) -> usize {
        self.side
    }

    /// 2D DFT of a real image plane
    pub fn forward(&self, image: &[f64]) -> Result<FourierPlane> {
        self.check_len(image.len())?;

        let mut data: Vec<Complex64> = image.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        self.transform_2d(&mut data, &self.forward);

        Ok(FourierPlane {
            side: self.side,
            data,
        })
    }

    /// Inverse 2D DFT, keeping the real part
    pub fn inverse(&self, plane: &FourierPlane) -> Result<InverseOutcome> {
        if plane.side != self.side {
            return Err(CleanError::dimension(format!(
                "plane side {} does not match transform side {}",
                plane.side, self.side
            )));
        }
        self.check_len(plane.data.len())?;

        let mut data = plane.data.clone();
        self.transform_2d(&mut data, &self.inverse);

        let scale = 1.0 / (self.side * self.side) as f64;
        let mut max_imag_residue = 0.0f64;
        let mut max_real = 0.0f64;
        let image = data
            .iter()
            .map(|c| {
                let re = c.re * scale;
                max_imag_residue = max_imag_residue.max((c.im * scale).abs());
                max_real = max_real.max(re.abs());
                re
            })
            .collect();

        Ok(InverseOutcome {
            image,
            max_imag_residue,
            max_real,
        })
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.side * self.side {
            return Err(CleanError::dimension(format!(
                "plane has {} values, expected {}x{}",
                len, self.side, self.side
            )));
        }
        Ok(())
    }

    /// Rows, then columns through a transpose, in place
    fn transform_2d(&self, data: &mut [Complex64], fft: &Arc<dyn Fft<f64>>) {
        let side = self.side;
        process_rows(data, side, fft);
        let mut transposed = transpose(data, side);
        process_rows(&mut transposed, side, fft);
        data.copy_from_slice(&transpose(&transposed, side));
    }
}

fn process_rows(data: &mut [Complex64], side: usize, fft: &Arc<dyn Fft<f64>>) {
    data.par_chunks_mut(side).for_each(|row| fft.process(row));
}

fn transpose(data: &[Complex64], side: usize) -> Vec<Complex64> {
    let mut out = vec![Complex64::new(0.0, 0.0); data.len()];
    for r in 0..side {
        for c in 0..side {
            out[c * side + r] = data[r * side + c];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn test_image(side: usize) -> Vec<f64> {
        let mut image = Vec::with_capacity(side * side);
        for r in 0..side {
            for c in 0..side {
                let x = c as f64 / side as f64;
                let y = r as f64 / side as f64;
                image.push((2.0 * PI * 3.0 * x).sin() + 0.5 * (2.0 * PI * y).cos() + 0.1 * r as f64);
            }
        }
        image
    }

    #[test]
    fn test_forward_dc_term_is_sum() {
        let transform = SpectralTransform::new(8).unwrap();
        let image = test_image(8);
        let plane = transform.forward(&image).unwrap();
        let sum: f64 = image.iter().sum();
        assert!((plane.data[0].re - sum).abs() < 1e-9);
        assert!(plane.data[0].im.abs() < 1e-9);
    }

    #[test]
    fn test_forward_single_frequency() {
        // cos along columns with one cycle lands in bins (0, 1) and (0, side-1)
        let side = 4;
        let transform = SpectralTransform::new(side).unwrap();
        let mut image = vec![0.0; side * side];
        for r in 0..side {
            for c in 0..side {
                image[r * side + c] = (2.0 * PI * c as f64 / side as f64).cos();
            }
        }
        let plane = transform.forward(&image).unwrap();
        let expected = (side * side) as f64 / 2.0;
        assert!((plane.data[1].re - expected).abs() < 1e-9);
        assert!((plane.data[side - 1].re - expected).abs() < 1e-9);
        assert!(plane.data[side].norm() < 1e-9);
    }

    #[test]
    fn test_forward_inverse_reproduces_image() {
        for side in [1, 5, 16, 30] {
            let transform = SpectralTransform::new(side).unwrap();
            let image = test_image(side);
            let plane = transform.forward(&image).unwrap();
            let outcome = transform.inverse(&plane).unwrap();

            for (a, b) in image.iter().zip(&outcome.image) {
                assert!((a - b).abs() < 1e-10, "side {}: {} vs {}", side, a, b);
            }
            assert!(!outcome.residue_exceeds(DEFAULT_RESIDUE_TOLERANCE));
        }
    }

    #[test]
    fn test_split_components_round_trip() {
        let transform = SpectralTransform::new(6).unwrap();
        let plane = transform.forward(&test_image(6)).unwrap();
        let rebuilt = FourierPlane::from_parts(6, &plane.real(), &plane.imag()).unwrap();
        assert_eq!(rebuilt, plane);
        assert!(FourierPlane::from_parts(6, &plane.real(), &[0.0; 3]).is_err());
    }

    #[test]
    fn test_inverse_flags_non_hermitian_plane() {
        let transform = SpectralTransform::new(4).unwrap();
        let mut plane = transform.forward(&test_image(4)).unwrap();
        // break conjugate symmetry of a single mode
        plane.data[1] += Complex64::new(0.0, 50.0);
        let outcome = transform.inverse(&plane).unwrap();
        assert!(outcome.residue_exceeds(DEFAULT_RESIDUE_TOLERANCE));
    }

    #[test]
    fn test_residue_check_is_relative_for_faint_images() {
        let transform = SpectralTransform::new(4).unwrap();
        let faint: Vec<f64> = test_image(4).iter().map(|v| v * 1e-6).collect();
        let plane = transform.forward(&faint).unwrap();
        let clean = transform.inverse(&plane).unwrap();
        assert!(!clean.residue_exceeds(DEFAULT_RESIDUE_TOLERANCE));

        let mut broken = plane.clone();
        broken.data[1] += Complex64::new(0.0, 1e-9);
        let outcome = transform.inverse(&broken).unwrap();
        assert!(outcome.max_imag_residue < 1e-8);
        assert!(outcome.residue_exceeds(DEFAULT_RESIDUE_TOLERANCE));

        // rounding of a bright source survives a near-total cancellation
        assert!(!outcome.residue_exceeds_scale(DEFAULT_RESIDUE_TOLERANCE, 1.0));

        let blank = transform.forward(&[0.0; 16]).unwrap();
        let blank = transform.inverse(&blank).unwrap();
        assert!(!blank.residue_exceeds(DEFAULT_RESIDUE_TOLERANCE));
    }

    #[test]
    fn test_rejects_wrong_plane_size() {
        let transform = SpectralTransform::new(4).unwrap();
        assert!(matches!(
            transform.forward(&[0.0; 15]),
            Err(CleanError::DimensionMismatch { .. })
        ));
        assert!(SpectralTransform::new(0).is_err());
    }
}
