//! Cube I/O using fitsio
//!
//! Reads spectral cubes from FITS one channel at a time and writes cleaned
//! channels back out. Pipelines talk to storage through the `ChannelSource`
//! and `ChannelSink` traits so they can run against in-memory cubes as well.

use crate::cube::Cube;
use crate::frequency::FrequencyAxis;
use crate::{CleanError, Result};
use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use std::fs;
use std::path::{Path, PathBuf};

/// Channel count and square side length of a cube
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubeShape {
    pub channels: usize,
    pub side: usize,
}

impl CubeShape {
    pub fn pixels(&self) -> usize {
        self.side * self.side
    }
}

impl std::fmt::Display for CubeShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} x {} x {}", self.channels, self.side, self.side)
    }
}

/// Anything that can hand out image planes channel by channel
pub trait ChannelSource {
    fn shape(&self) -> CubeShape;

    /// Row-major plane of `side * side` values
    fn read_channel(&mut self, channel: usize) -> Result<Vec<f64>>;
}

/// Anything that accepts cleaned image planes
pub trait ChannelSink {
    fn write_channel(&mut self, channel: usize, side: usize, plane: &[f64]) -> Result<()>;
}

impl ChannelSource for Cube {
    fn shape(&self) -> CubeShape {
        CubeShape {
            channels: self.channels(),
            side: self.side(),
        }
    }

    fn read_channel(&mut self, channel: usize) -> Result<Vec<f64>> {
        if channel >= self.channels() {
            return Err(CleanError::dimension(format!(
                "channel {} out of range (cube has {})",
                channel,
                self.channels()
            )));
        }
        Ok(self.channel(channel).to_vec())
    }
}

impl ChannelSink for Cube {
    fn write_channel(&mut self, channel: usize, side: usize, plane: &[f64]) -> Result<()> {
        if side != self.side() || channel >= self.channels() || plane.len() != side * side {
            return Err(CleanError::dimension(format!(
                "cannot store a {}x{} plane as channel {} of a {} channel {}x{} cube",
                side,
                side,
                channel,
                self.channels(),
                self.side(),
                self.side()
            )));
        }
        self.channel_mut(channel).copy_from_slice(plane);
        Ok(())
    }
}

/// Frequency axis keywords of the third FITS axis, when present
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderFrequency {
    /// CRVAL3
    pub reference_value: f64,
    /// CDELT3
    pub step: f64,
    /// CRPIX3, 1-based
    pub reference_pixel: f64,
    /// CUNIT3, defaults to Hz
    pub unit: String,
}

impl HeaderFrequency {
    /// Multiplier that converts the header unit to MHz
    fn to_mhz(&self) -> Option<f64> {
        match self.unit.trim().to_ascii_lowercase().as_str() {
            "hz" | "" => Some(1e-6),
            "khz" => Some(1e-3),
            "mhz" => Some(1.0),
            "ghz" => Some(1e3),
            _ => None,
        }
    }

    /// Axis described by the header, in MHz
    pub fn axis_mhz(&self, channels: usize) -> Result<FrequencyAxis> {
        let scale = self.to_mhz().ok_or_else(|| {
            CleanError::config("CUNIT3", format!("unsupported frequency unit '{}'", self.unit))
        })?;
        let start = (self.reference_value - (self.reference_pixel - 1.0) * self.step) * scale;
        FrequencyAxis::with_count(start, self.step * scale, channels)
    }

    /// Whether the header agrees with an explicit axis to within a tenth of a channel
    pub fn agrees_with(&self, axis: &FrequencyAxis) -> bool {
        match self.axis_mhz(axis.len()) {
            Ok(header_axis) => {
                let slack = 0.1 * axis.step();
                (header_axis.start() - axis.start()).abs() < slack
                    && (header_axis.stop() - axis.stop()).abs() < slack
            }
            Err(_) => false,
        }
    }
}

/// A FITS cube opened for channel-by-channel reading
pub struct FitsCube {
    path: PathBuf,
    file: FitsFile,
    hdu: FitsHdu,
    shape: CubeShape,
}

impl FitsCube {
    /// Open a cube and validate that its spatial grid is square
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = FitsFile::open(&path).map_err(|e| CleanError::fits(&path, e))?;
        let hdu = file.primary_hdu().map_err(|e| CleanError::fits(&path, e))?;

        // fitsio reports the shape slowest axis first: [NAXIS3, NAXIS2, NAXIS1]
        let dimensions = match &hdu.info {
            HduInfo::ImageInfo { shape, .. } => shape.clone(),
            HduInfo::TableInfo { .. } => {
                return Err(CleanError::fits(&path, "primary HDU is a table, not an image"));
            }
            HduInfo::AnyInfo => {
                return Err(CleanError::fits(&path, "unknown primary HDU type"));
            }
        };

        let (channels, rows, cols) = match dimensions.as_slice() {
            [rows, cols] => (1, *rows, *cols),
            [channels, rows, cols] => (*channels, *rows, *cols),
            // a degenerate Stokes axis is common in radio images
            [1, channels, rows, cols] => (*channels, *rows, *cols),
            other => {
                return Err(CleanError::dimension(format!(
                    "{}: unsupported image shape {:?}",
                    path.display(),
                    other
                )));
            }
        };

        if rows != cols || rows == 0 || channels == 0 {
            return Err(CleanError::dimension(format!(
                "{}: expected square channel planes, got {} channels of {}x{}",
                path.display(),
                channels,
                rows,
                cols
            )));
        }

        let shape = CubeShape {
            channels,
            side: rows,
        };
        log::info!("Opened {}: {}", path.display(), shape);

        Ok(Self {
            path,
            file,
            hdu,
            shape,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frequency keywords of the third axis, if the header has them
    pub fn frequency_metadata(&mut self) -> Option<HeaderFrequency> {
        let reference_value: f64 = self.hdu.read_key(&mut self.file, "CRVAL3").ok()?;
        let step: f64 = self.hdu.read_key(&mut self.file, "CDELT3").ok()?;
        let reference_pixel: f64 = self.hdu.read_key(&mut self.file, "CRPIX3").unwrap_or(1.0);
        let unit: String = self
            .hdu
            .read_key(&mut self.file, "CUNIT3")
            .unwrap_or_else(|_| "Hz".to_string());
        Some(HeaderFrequency {
            reference_value,
            step,
            reference_pixel,
            unit,
        })
    }

    /// Read the whole cube into memory
    pub fn read_cube(&mut self) -> Result<Cube> {
        let data: Vec<f64> = self
            .hdu
            .read_image(&mut self.file)
            .map_err(|e| CleanError::fits(&self.path, e))?;
        Cube::from_vec(self.shape.channels, self.shape.side, data)
    }
}

impl ChannelSource for FitsCube {
    fn shape(&self) -> CubeShape {
        self.shape
    }

    fn read_channel(&mut self, channel: usize) -> Result<Vec<f64>> {
        if channel >= self.shape.channels {
            return Err(CleanError::dimension(format!(
                "{}: channel {} out of range (cube has {})",
                self.path.display(),
                channel,
                self.shape.channels
            )));
        }
        let n = self.shape.pixels();
        let plane: Vec<f64> = self
            .hdu
            .read_section(&mut self.file, channel * n, (channel + 1) * n)
            .map_err(|e| CleanError::fits(&self.path, e))?;
        if plane.len() != n {
            return Err(CleanError::fits(
                &self.path,
                format!("channel {} holds {} values, expected {}", channel, plane.len(), n),
            ));
        }
        Ok(plane)
    }
}

/// Write an image (2D plane or 3D cube) of f64 values, replacing any existing file
fn write_image(path: &Path, dimensions: &[usize], data: &[f64]) -> Result<()> {
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions,
    };
    let mut file = FitsFile::create(path)
        .with_custom_primary(&description)
        .overwrite()
        .open()
        .map_err(|e| CleanError::fits(path, e))?;
    let hdu = file.primary_hdu().map_err(|e| CleanError::fits(path, e))?;
    hdu.write_image(&mut file, data)
        .map_err(|e| CleanError::fits(path, e))
}

/// Write one `side x side` plane
pub fn write_plane<P: AsRef<Path>>(path: P, side: usize, plane: &[f64]) -> Result<()> {
    let path = path.as_ref();
    if plane.len() != side * side {
        return Err(CleanError::dimension(format!(
            "{}: {} values do not form a {}x{} plane",
            path.display(),
            plane.len(),
            side,
            side
        )));
    }
    write_image(path, &[side, side], plane)
}

/// Write a whole cube as a single 3D image
pub fn write_cube<P: AsRef<Path>>(path: P, cube: &Cube) -> Result<()> {
    write_image(
        path.as_ref(),
        &[cube.channels(), cube.side(), cube.side()],
        cube.data(),
    )
}

/// Writes each channel to `{dir}/{prefix}_{channel}.fits`
pub struct FitsDirectorySink {
    dir: PathBuf,
    prefix: String,
}

impl FitsDirectorySink {
    pub fn create<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| CleanError::io(&dir, e))?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
        })
    }

    pub fn channel_path(&self, channel: usize) -> PathBuf {
        self.dir.join(format!("{}_{}.fits", self.prefix, channel))
    }
}

impl ChannelSink for FitsDirectorySink {
    fn write_channel(&mut self, channel: usize, side: usize, plane: &[f64]) -> Result<()> {
        write_plane(self.channel_path(channel), side, plane)
    }
}
