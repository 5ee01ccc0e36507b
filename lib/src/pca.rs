//! Principal component foreground removal
//!
//! Frequency-frequency covariance of the mean-subtracted cube is diagonalised
//! and the leading eigenmodes are treated as foreground. Projecting the data
//! onto those modes and back gives the foreground field; what remains after
//! subtracting it is the cleaned cube.

use crate::cube::{exact_sqrt, Cube};
use crate::{CleanError, Result};
use nalgebra::storage::Storage;
use nalgebra::{DMatrix, DVector, Dyn, Matrix, SymmetricEigen};

/// Largest tolerated |C - Cᵀ| relative to max|C|
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Eigen-decomposition of the frequency covariance of a cube
#[derive(Debug, Clone)]
pub struct PcaDecomposition {
    /// Input with the per-frequency mean removed (flattened pixel x frequency)
    pub zero_mean: DMatrix<f64>,
    /// Per-frequency mean over pixels
    pub mean: DVector<f64>,
    /// Eigenvalues in non-increasing order
    pub eigenvalues: DVector<f64>,
    /// Eigenvectors as columns, in the order of `eigenvalues`
    pub eigenvectors: DMatrix<f64>,
}

impl PcaDecomposition {
    /// Fraction of the total variance carried by each mode
    pub fn explained_variance_ratio(&self) -> Vec<f64> {
        let total: f64 = self.eigenvalues.iter().map(|v| v.max(0.0)).sum();
        if total <= 0.0 {
            return vec![0.0; self.eigenvalues.len()];
        }
        self.eigenvalues.iter().map(|v| v.max(0.0) / total).collect()
    }
}

/// Foreground estimate confined to the leading eigenmodes
#[derive(Debug, Clone)]
pub struct ForegroundModel {
    /// Mode amplitudes, shaped (modes, side, side)
    pub amplitudes: Cube,
    /// Reconstructed foreground plus mean, shaped (frequencies, side, side)
    pub field: Cube,
}

impl ForegroundModel {
    pub fn modes(&self) -> usize {
        self.amplitudes.channels()
    }

    /// Cleaned cube: `input - field`
    pub fn subtract_from(&self, input: &Cube) -> Result<Cube> {
        input.difference(&self.field)
    }
}

/// Mean-subtract, build the sample covariance, and diagonalise it.
///
/// `cube` is (flattened pixel x frequency), the column-major reading of a
/// channel-major cube (see `Cube::as_matrix`), and is left untouched. The
/// covariance is formed as `Xᵀ X` directly, so only the zero-mean copy is
/// allocated at cube size.
pub fn decompose<S>(cube: &Matrix<f64, Dyn, Dyn, S>) -> Result<PcaDecomposition>
where
    S: Storage<f64, Dyn, Dyn>,
{
    let (pixels, frequencies) = cube.shape();
    if frequencies == 0 {
        return Err(CleanError::dimension("PCA needs at least one frequency"));
    }
    if pixels < 2 {
        return Err(CleanError::dimension(format!(
            "sample covariance needs at least 2 pixels, got {}",
            pixels
        )));
    }
    if cube.iter().any(|v| !v.is_finite()) {
        return Err(CleanError::domain("PCA input contains non-finite values"));
    }

    let mean = cube.row_mean().transpose();
    let mut zero_mean = cube.clone_owned();
    for (mut column, m) in zero_mean.column_iter_mut().zip(mean.iter()) {
        column.add_scalar_mut(-m);
    }

    let covariance = zero_mean.tr_mul(&zero_mean) / (pixels - 1) as f64;
    let covariance = symmetrized(covariance)?;

    let eigen = SymmetricEigen::new(covariance);
    if eigen.eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err(CleanError::domain("eigen-decomposition produced non-finite eigenvalues"));
    }

    // descending; order among equal eigenvalues is not meaningful
    let mut order: Vec<usize> = (0..frequencies).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let eigenvalues = DVector::from_iterator(frequencies, order.iter().map(|&i| eigen.eigenvalues[i]));
    let eigenvectors = DMatrix::from_columns(
        &order
            .iter()
            .map(|&i| eigen.eigenvectors.column(i).into_owned())
            .collect::<Vec<_>>(),
    );

    log::debug!(
        "PCA: {} frequencies, {} pixels, leading eigenvalue {:.6e}",
        frequencies,
        pixels,
        eigenvalues[0]
    );

    Ok(PcaDecomposition {
        zero_mean,
        mean,
        eigenvalues,
        eigenvectors,
    })
}

/// Check that the covariance is symmetric to rounding level, then make it exactly so
fn symmetrized(covariance: DMatrix<f64>) -> Result<DMatrix<f64>> {
    let scale = covariance.amax();
    let asymmetry = (&covariance - covariance.transpose()).amax();
    if asymmetry > SYMMETRY_TOLERANCE * scale.max(f64::MIN_POSITIVE) {
        return Err(CleanError::domain(format!(
            "covariance matrix is not symmetric (max asymmetry {:.3e}, scale {:.3e})",
            asymmetry, scale
        )));
    }
    Ok((&covariance + covariance.transpose()) * 0.5)
}

/// Project onto the leading `modes` eigenvectors and rebuild the foreground field
pub fn project(
    modes: usize,
    eigenvectors: &DMatrix<f64>,
    zero_mean: &DMatrix<f64>,
    mean: &DVector<f64>,
) -> Result<ForegroundModel> {
    let (pixels, frequencies) = zero_mean.shape();
    if modes == 0 || modes > frequencies {
        return Err(CleanError::dimension(format!(
            "cannot keep {} modes of a cube with {} frequencies",
            modes, frequencies
        )));
    }
    if eigenvectors.nrows() != frequencies || eigenvectors.ncols() < modes {
        return Err(CleanError::dimension(format!(
            "eigenvector matrix is {}x{}, expected {} rows and at least {} columns",
            eigenvectors.nrows(),
            eigenvectors.ncols(),
            frequencies,
            modes
        )));
    }
    if mean.len() != frequencies {
        return Err(CleanError::dimension(format!(
            "mean has {} entries for {} frequencies",
            mean.len(),
            frequencies
        )));
    }
    if exact_sqrt(pixels).is_none() {
        return Err(CleanError::dimension(format!(
            "{} flattened pixels do not form a square grid",
            pixels
        )));
    }

    // pixel x mode amplitudes; each column is one amplitude map
    let basis = eigenvectors.columns(0, modes);
    let amplitudes = zero_mean * &basis;
    let mut field = &amplitudes * basis.transpose();
    for (mut column, m) in field.column_iter_mut().zip(mean.iter()) {
        column.add_scalar_mut(*m);
    }

    Ok(ForegroundModel {
        amplitudes: Cube::from_matrix(amplitudes)?,
        field: Cube::from_matrix(field)?,
    })
}
