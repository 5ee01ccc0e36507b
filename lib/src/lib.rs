//! fgclean Library
//!
//! Foreground removal for 21-cm spectral image cubes. Provides two
//! independent techniques: principal component subtraction across the
//! frequency axis, and per-pixel polynomial fitting of the Fourier-transformed
//! channel series, with FITS and scratch-file I/O for cubes too large to hold
//! twice in memory.

pub mod cube;
pub mod error;
pub mod fits_io;
pub mod frequency;
pub mod pca;
pub mod pipeline;
pub mod polyfit;
#[cfg(feature = "image")]
pub mod preview;
pub mod scratch;
pub mod spectral;
pub mod utils;

pub use cube::{Cube, PixelMajorCube};
pub use error::{CleanError, Stage};
pub use frequency::FrequencyAxis;
pub use num_complex::Complex64;
pub use pipeline::{PcaPipeline, PolyFitConfig, PolyFitPipeline, RunReport};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library
///
/// Sets up logging when the `env_logger` feature is enabled.
pub fn init() {
    #[cfg(feature = "env_logger")]
    {
        let _ = env_logger::try_init();
    }
}

/// Result type for cube cleaning operations
pub type Result<T> = std::result::Result<T, CleanError>;
