//! Utility functions for formatting and common configurations
//!
//! Provides helper functions used by client applications and a set of named
//! presets for well-known data sets.

use crate::fits_io::{ChannelSource, FitsCube};
use crate::frequency::FrequencyAxis;
use crate::Result;

/// Format a frequency in MHz for display
pub fn format_frequency(freq_mhz: f64) -> String {
    if freq_mhz >= 1000.0 {
        format!("{:.3} GHz", freq_mhz / 1000.0)
    } else {
        format!("{:.2} MHz", freq_mhz)
    }
}

/// Format a byte count for display
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Memory needed for one pixel-major component cube of f64 values
pub fn component_cube_bytes(channels: usize, side: usize) -> usize {
    channels * side * side * std::mem::size_of::<f64>()
}

/// Open a cube and decide its frequency axis.
///
/// An explicit axis wins over the header; a disagreement is only logged.
/// Without an explicit axis the header keywords are required.
pub fn resolve_frequency_axis(
    cube: &mut FitsCube,
    explicit: Option<FrequencyAxis>,
) -> Result<FrequencyAxis> {
    let channels = cube.shape().channels;
    let header = cube.frequency_metadata();

    match (explicit, header) {
        (Some(axis), Some(header)) => {
            if !header.agrees_with(&axis) {
                log::warn!(
                    "Header frequency axis ({} {} + {} per channel) disagrees with {}; using the latter",
                    header.reference_value,
                    header.unit,
                    header.step,
                    axis
                );
            }
            Ok(axis)
        }
        (Some(axis), None) => Ok(axis),
        (None, Some(header)) => {
            let axis = header.axis_mhz(channels)?;
            log::info!("Frequency axis from header: {}", axis);
            Ok(axis)
        }
        (None, None) => Err(crate::CleanError::config(
            "frequency axis",
            "not given and the cube header has no CRVAL3/CDELT3",
        )),
    }
}

/// Named frequency-axis configurations
pub mod presets {
    use super::*;

    /// Preset information structure
    pub struct PresetInfo {
        pub id: usize,
        pub name: &'static str,
        pub description: &'static str,
        pub axis: FrequencyAxis,
    }

    /// SKA Data Challenge 3a: 106 to 196 MHz in 0.1 MHz channels
    pub fn sdc3a() -> FrequencyAxis {
        FrequencyAxis::from_constants(106.0, 0.1, 901)
    }

    /// First 151 channels of the SDC3a band, 106 to 121 MHz
    pub fn sdc3a_low() -> FrequencyAxis {
        FrequencyAxis::from_constants(106.0, 0.1, 151)
    }

    /// List all presets with detailed info
    pub fn list_presets() -> Vec<PresetInfo> {
        vec![
            PresetInfo {
                id: 0,
                name: "sdc3a",
                description: "106-196 MHz, 0.1 MHz step, 901 channels",
                axis: sdc3a(),
            },
            PresetInfo {
                id: 1,
                name: "sdc3a-low",
                description: "106-121 MHz, 0.1 MHz step, 151 channels",
                axis: sdc3a_low(),
            },
        ]
    }

    /// Get a preset by name
    pub fn get_preset(name: &str) -> Option<PresetInfo> {
        list_presets()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}
