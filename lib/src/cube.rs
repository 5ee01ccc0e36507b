//! In-memory cube layouts
//!
//! `Cube` keeps whole image planes contiguous (channel-major), which is what
//! the per-channel transforms and the FITS writer consume. `PixelMajorCube`
//! keeps each pixel's spectrum contiguous, which is what the per-pixel fitter
//! consumes. Only the scratch streamer converts between the two.

use crate::{CleanError, Result};
use nalgebra::{DMatrix, DMatrixView};

/// Exact integer square root, or `None` when `n` is not a perfect square
pub fn exact_sqrt(n: usize) -> Option<usize> {
    let mut root = (n as f64).sqrt() as usize;
    // correct float rounding in either direction
    while root * root > n {
        root -= 1;
    }
    while (root + 1) * (root + 1) <= n {
        root += 1;
    }
    (root * root == n).then_some(root)
}

/// Channel-major cube: `data[channel * side * side + row * side + col]`
#[derive(Debug, Clone, PartialEq)]
pub struct Cube {
    channels: usize,
    side: usize,
    data: Vec<f64>,
}

impl Cube {
    pub fn zeros(channels: usize, side: usize) -> Self {
        Self {
            channels,
            side,
            data: vec![0.0; channels * side * side],
        }
    }

    pub fn from_vec(channels: usize, side: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != channels * side * side {
            return Err(CleanError::dimension(format!(
                "{} values cannot form a {}x{}x{} cube",
                data.len(),
                channels,
                side,
                side
            )));
        }
        Ok(Self {
            channels,
            side,
            data,
        })
    }

    /// Build a cube from a (flattened pixel x channel) matrix.
    ///
    /// nalgebra stores matrices column-major, so each column is one
    /// contiguous channel plane and the storage is taken over as is. The
    /// pixel count must be a perfect square.
    pub fn from_matrix(matrix: DMatrix<f64>) -> Result<Self> {
        let (pixels, channels) = matrix.shape();
        let side = exact_sqrt(pixels).ok_or_else(|| {
            CleanError::dimension(format!(
                "{} flattened pixels do not form a square grid",
                pixels
            ))
        })?;
        Ok(Self {
            channels,
            side,
            data: Vec::from(matrix.data),
        })
    }

    /// Borrow as a (flattened pixel x channel) matrix without copying
    pub fn as_matrix(&self) -> DMatrixView<'_, f64> {
        DMatrixView::from_slice(&self.data, self.pixels(), self.channels)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn side(&self) -> usize {
        self.side
    }

    /// Number of spatial pixels per channel
    pub fn pixels(&self) -> usize {
        self.side * self.side
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    pub fn channel(&self, channel: usize) -> &[f64] {
        let n = self.pixels();
        &self.data[channel * n..(channel + 1) * n]
    }

    pub fn channel_mut(&mut self, channel: usize) -> &mut [f64] {
        let n = self.pixels();
        &mut self.data[channel * n..(channel + 1) * n]
    }

    pub fn get(&self, channel: usize, row: usize, col: usize) -> f64 {
        self.data[(channel * self.side + row) * self.side + col]
    }

    pub fn set(&mut self, channel: usize, row: usize, col: usize, value: f64) {
        let idx = (channel * self.side + row) * self.side + col;
        self.data[idx] = value;
    }

    /// Spectrum of one pixel across all channels
    pub fn pixel_series(&self, row: usize, col: usize) -> Vec<f64> {
        (0..self.channels).map(|c| self.get(c, row, col)).collect()
    }

    /// Sum of squared values
    pub fn power(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Element-wise `self - other`
    pub fn difference(&self, other: &Cube) -> Result<Cube> {
        if self.channels != other.channels || self.side != other.side {
            return Err(CleanError::dimension(format!(
                "cannot subtract a {}x{}x{} cube from a {}x{}x{} cube",
                other.channels, other.side, other.side, self.channels, self.side, self.side
            )));
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a - b)
            .collect();
        Ok(Cube {
            channels: self.channels,
            side: self.side,
            data,
        })
    }
}

/// Pixel-major cube for one Fourier component: `data[pixel * channels + channel]`
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMajorCube {
    channels: usize,
    side: usize,
    data: Vec<f64>,
}

impl PixelMajorCube {
    pub fn zeros(channels: usize, side: usize) -> Self {
        Self {
            channels,
            side,
            data: vec![0.0; channels * side * side],
        }
    }

    /// Transpose a channel-major cube
    pub fn from_cube(cube: &Cube) -> Self {
        let mut out = Self::zeros(cube.channels(), cube.side());
        for c in 0..cube.channels() {
            out.set_channel(c, cube.channel(c));
        }
        out
    }

    /// Transpose back to channel-major
    pub fn to_cube(&self) -> Cube {
        let mut cube = Cube::zeros(self.channels, self.side);
        for c in 0..self.channels {
            self.copy_channel_into(c, cube.channel_mut(c));
        }
        cube
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn pixels(&self) -> usize {
        self.side * self.side
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn series(&self, row: usize, col: usize) -> &[f64] {
        let start = (row * self.side + col) * self.channels;
        &self.data[start..start + self.channels]
    }

    pub fn series_mut(&mut self, row: usize, col: usize) -> &mut [f64] {
        let start = (row * self.side + col) * self.channels;
        &mut self.data[start..start + self.channels]
    }

    /// Scatter one channel plane (row-major pixels) into the pixel-major layout
    pub fn set_channel(&mut self, channel: usize, plane: &[f64]) {
        debug_assert_eq!(plane.len(), self.pixels());
        for (pixel, &value) in plane.iter().enumerate() {
            self.data[pixel * self.channels + channel] = value;
        }
    }

    /// Gather one channel plane out of the pixel-major layout
    pub fn copy_channel_into(&self, channel: usize, plane: &mut [f64]) {
        debug_assert_eq!(plane.len(), self.pixels());
        for (pixel, value) in plane.iter_mut().enumerate() {
            *value = self.data[pixel * self.channels + channel];
        }
    }

    pub fn channel(&self, channel: usize) -> Vec<f64> {
        let mut plane = vec![0.0; self.pixels()];
        self.copy_channel_into(channel, &mut plane);
        plane
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_sqrt() {
        assert_eq!(exact_sqrt(0), Some(0));
        assert_eq!(exact_sqrt(1), Some(1));
        assert_eq!(exact_sqrt(4), Some(2));
        assert_eq!(exact_sqrt(2048 * 2048), Some(2048));
        assert_eq!(exact_sqrt(2), None);
        assert_eq!(exact_sqrt(2048 * 2048 + 1), None);
    }

    #[test]
    fn test_matrix_round_trip_preserves_layout() {
        let cube = Cube::from_vec(2, 2, (0..8).map(|v| v as f64).collect()).unwrap();
        let view = cube.as_matrix();
        assert_eq!(view.shape(), (4, 2));
        // pixel 2 of channel 1
        assert_eq!(view[(2, 1)], 6.0);
        assert_eq!(view.column(1).as_ptr(), cube.channel(1).as_ptr());
        assert_eq!(Cube::from_matrix(view.clone_owned()).unwrap(), cube);
    }

    #[test]
    fn test_from_matrix_rejects_non_square() {
        let matrix = DMatrix::<f64>::zeros(6, 3);
        assert!(matches!(
            Cube::from_matrix(matrix),
            Err(CleanError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_pixel_major_transpose() {
        let mut cube = Cube::zeros(3, 2);
        for c in 0..3 {
            for r in 0..2 {
                for col in 0..2 {
                    cube.set(c, r, col, (c * 100 + r * 10 + col) as f64);
                }
            }
        }

        let pixel_major = PixelMajorCube::from_cube(&cube);
        assert_eq!(pixel_major.series(1, 0), &[10.0, 110.0, 210.0]);
        assert_eq!(pixel_major.series(1, 0), cube.pixel_series(1, 0).as_slice());
        assert_eq!(pixel_major.to_cube(), cube);
    }

    #[test]
    fn test_difference_checks_shape() {
        let a = Cube::zeros(2, 2);
        let b = Cube::zeros(3, 2);
        assert!(a.difference(&b).is_err());
    }
}
