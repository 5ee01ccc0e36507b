//! Quick-look PNG rendering of single planes

use crate::spectral::FourierPlane;
use crate::{CleanError, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use std::path::Path;

/// Color map for plane previews
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMap {
    Viridis,
    Inferno,
    Grayscale,
}

impl ColorMap {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "viridis" => Some(ColorMap::Viridis),
            "inferno" => Some(ColorMap::Inferno),
            "grayscale" | "greyscale" | "gray" | "grey" => Some(ColorMap::Grayscale),
            _ => None,
        }
    }

    /// Evenly spaced anchor colors, sampled from the matplotlib maps
    fn stops(&self) -> &'static [[u8; 3]] {
        match self {
            ColorMap::Viridis => &[
                [68, 1, 84],
                [59, 82, 139],
                [33, 145, 140],
                [94, 201, 98],
                [253, 231, 37],
            ],
            ColorMap::Inferno => &[
                [0, 0, 4],
                [87, 16, 110],
                [188, 55, 84],
                [249, 142, 9],
                [252, 255, 164],
            ],
            ColorMap::Grayscale => &[[0, 0, 0], [255, 255, 255]],
        }
    }

    /// Color at `value` in 0..=1, linear between neighbouring stops.
    /// Non-finite values get the low end.
    fn color(&self, value: f64) -> Rgb<u8> {
        let v = if value.is_finite() {
            value.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let stops = self.stops();
        let position = v * (stops.len() - 1) as f64;
        let lower = (position as usize).min(stops.len() - 2);
        let t = position - lower as f64;
        let (a, b) = (stops[lower], stops[lower + 1]);
        Rgb(std::array::from_fn(|i| {
            (a[i] as f64 + (b[i] as f64 - a[i] as f64) * t) as u8
        }))
    }
}

/// How plane values are mapped onto the color range
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    MinMax,
    /// Clip to the given percentiles (0 to 100) before scaling
    Percentile { low: f64, high: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct PreviewOptions {
    pub colormap: ColorMap,
    pub normalization: Normalization,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            colormap: ColorMap::Viridis,
            normalization: Normalization::Percentile {
                low: 1.0,
                high: 99.0,
            },
        }
    }
}

/// Display range of the finite values of a plane, or None if there are none
fn value_range(plane: &[f64], normalization: Normalization) -> Result<Option<(f64, f64)>> {
    let mut finite: Vec<f64> = plane.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return Ok(None);
    }
    finite.sort_by(|a, b| a.total_cmp(b));

    match normalization {
        Normalization::MinMax => Ok(Some((finite[0], finite[finite.len() - 1]))),
        Normalization::Percentile { low, high } => {
            if !(0.0..=100.0).contains(&low) || !(0.0..=100.0).contains(&high) || low >= high {
                return Err(CleanError::config(
                    "percentile range",
                    format!("expected 0 <= low < high <= 100, got {} and {}", low, high),
                ));
            }
            let at = |p: f64| {
                let index = (p / 100.0 * (finite.len() - 1) as f64).round() as usize;
                finite[index.min(finite.len() - 1)]
            };
            Ok(Some((at(low), at(high))))
        }
    }
}

/// Render a `side x side` plane. Row 0 is drawn at the bottom.
pub fn render_plane(plane: &[f64], side: usize, options: &PreviewOptions) -> Result<RgbImage> {
    if plane.len() != side * side || side == 0 {
        return Err(CleanError::dimension(format!(
            "{} values do not form a {}x{} plane",
            plane.len(),
            side,
            side
        )));
    }

    let mut img: RgbImage = ImageBuffer::new(side as u32, side as u32);
    let Some((lo, hi)) = value_range(plane, options.normalization)? else {
        return Ok(img);
    };
    let span = if hi > lo { hi - lo } else { 1.0 };

    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let row = side - 1 - y as usize;
        let value = plane[row * side + x as usize];
        *pixel = options.colormap.color((value - lo) / span);
    }
    Ok(img)
}

/// Log10 power of a Fourier plane with the zero frequency moved to the centre
pub fn fourier_log_power(plane: &FourierPlane) -> Vec<f64> {
    let side = plane.side;
    let power = plane.power();
    let floor = power
        .iter()
        .copied()
        .filter(|p| *p > 0.0)
        .fold(f64::INFINITY, f64::min);
    let floor = if floor.is_finite() { floor } else { 1.0 };

    let half = side / 2;
    let mut shifted = vec![0.0; side * side];
    for r in 0..side {
        for c in 0..side {
            let target = ((r + half) % side) * side + (c + half) % side;
            shifted[target] = power[r * side + c].max(floor).log10();
        }
    }
    shifted
}

/// Render a plane and save it as an image (format from the extension)
pub fn save_plane<P: AsRef<Path>>(
    path: P,
    plane: &[f64],
    side: usize,
    options: &PreviewOptions,
) -> Result<()> {
    let path = path.as_ref();
    let img = render_plane(plane, side, options)?;
    img.save(path)
        .map_err(|e| CleanError::io(path, std::io::Error::other(e.to_string())))?;
    log::info!("Saved {}x{} preview to {}", side, side, path.display());
    Ok(())
}
