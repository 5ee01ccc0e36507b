//! Scratch storage for Fourier-plane components
//!
//! Channel planes are written one file per (component, kind, channel) so that
//! the channel-major output of the forward transform can be re-read as one
//! pixel-major cube per component without both layouts being resident.
//!
//! A store is owned by a single run. Nothing guards against two runs sharing
//! a directory. Cleanup only touches plane files, so the directory may be
//! shared with other output.

use crate::cube::PixelMajorCube;
use crate::{CleanError, Result};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"FGSCR001";

/// Real or imaginary part of a Fourier plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Real,
    Imag,
}

impl Component {
    /// Processing order of the components
    pub const ALL: [Component; 2] = [Component::Real, Component::Imag];

    pub fn tag(&self) -> &'static str {
        match self {
            Component::Real => "real",
            Component::Imag => "imag",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Whether a plane is straight from the forward transform or already fitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    Raw,
    Clean,
}

impl PlaneKind {
    pub fn tag(&self) -> &'static str {
        match self {
            PlaneKind::Raw => "raw",
            PlaneKind::Clean => "clean",
        }
    }
}

/// Directory of scratch planes
#[derive(Debug)]
pub struct ScratchStore {
    dir: PathBuf,
}

impl ScratchStore {
    /// Create (or reuse) the scratch directory
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| CleanError::io(&dir, e))?;
        log::debug!("Scratch store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding one plane, e.g. `real_raw_12.bin`
    pub fn plane_path(&self, component: Component, kind: PlaneKind, channel: usize) -> PathBuf {
        self.dir
            .join(format!("{}_{}_{}.bin", component.tag(), kind.tag(), channel))
    }

    pub fn write_plane(
        &self,
        component: Component,
        kind: PlaneKind,
        channel: usize,
        plane: &[f64],
    ) -> Result<()> {
        let path = self.plane_path(component, kind, channel);
        let file = File::create(&path).map_err(|e| CleanError::io(&path, e))?;
        let mut writer = BufWriter::new(file);

        writer
            .write_all(MAGIC)
            .and_then(|_| writer.write_all(&(plane.len() as u64).to_le_bytes()))
            .and_then(|_| writer.write_all(bytemuck::cast_slice(plane)))
            .and_then(|_| writer.flush())
            .map_err(|e| CleanError::io(&path, e))
    }

    /// Read one plane, checking that it holds exactly `expected_len` values
    pub fn read_plane(
        &self,
        component: Component,
        kind: PlaneKind,
        channel: usize,
        expected_len: usize,
    ) -> Result<Vec<f64>> {
        let path = self.plane_path(component, kind, channel);
        let file = File::open(&path).map_err(|e| CleanError::io(&path, e))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 16];
        reader
            .read_exact(&mut header)
            .map_err(|e| CleanError::io(&path, e))?;
        if &header[..8] != MAGIC {
            return Err(CleanError::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "not a scratch plane"),
            ));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&header[8..]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        if len != expected_len {
            return Err(CleanError::io(
                &path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("plane holds {} values, expected {}", len, expected_len),
                ),
            ));
        }

        let mut plane = vec![0.0f64; len];
        reader
            .read_exact(bytemuck::cast_slice_mut(&mut plane))
            .map_err(|e| CleanError::io(&path, e))?;
        Ok(plane)
    }

    /// Load every channel of one component into the pixel-major layout
    pub fn load_component(
        &self,
        component: Component,
        kind: PlaneKind,
        channels: usize,
        side: usize,
    ) -> Result<PixelMajorCube> {
        let mut cube = PixelMajorCube::zeros(channels, side);
        for channel in 0..channels {
            log::debug!(
                "Loading {} {} plane {}/{}",
                component,
                kind.tag(),
                channel + 1,
                channels
            );
            let plane = self.read_plane(component, kind, channel, side * side)?;
            cube.set_channel(channel, &plane);
        }
        Ok(cube)
    }

    /// Write every channel of a pixel-major component cube back as planes
    pub fn store_component(
        &self,
        component: Component,
        kind: PlaneKind,
        cube: &PixelMajorCube,
    ) -> Result<()> {
        let mut plane = vec![0.0; cube.pixels()];
        for channel in 0..cube.channels() {
            log::debug!(
                "Saving {} {} plane {}/{}",
                component,
                kind.tag(),
                channel + 1,
                cube.channels()
            );
            cube.copy_channel_into(channel, &mut plane);
            self.write_plane(component, kind, channel, &plane)?;
        }
        Ok(())
    }

    /// Delete every scratch plane, then the directory if nothing else is left in it
    pub fn remove(self) -> Result<()> {
        let entries = fs::read_dir(&self.dir).map_err(|e| CleanError::io(&self.dir, e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| CleanError::io(&self.dir, e))?;
            let path = entry.path();
            let is_plane = entry.file_type().map(|t| t.is_file()).unwrap_or(false)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_plane_file_name);
            if is_plane {
                fs::remove_file(&path).map_err(|e| CleanError::io(&path, e))?;
                removed += 1;
            }
        }

        let empty = fs::read_dir(&self.dir)
            .map_err(|e| CleanError::io(&self.dir, e))?
            .next()
            .is_none();
        if empty {
            fs::remove_dir(&self.dir).map_err(|e| CleanError::io(&self.dir, e))?;
            log::info!("Removed scratch directory {}", self.dir.display());
        } else {
            log::info!(
                "Removed {} scratch planes, leaving {} in place",
                removed,
                self.dir.display()
            );
        }
        Ok(())
    }
}

/// Whether `name` has the form `{component}_{kind}_{channel}.bin`
fn is_plane_file_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".bin") else {
        return false;
    };
    let mut parts = stem.splitn(3, '_');
    let component = parts.next();
    let kind = parts.next();
    let channel = parts.next();
    matches!(component, Some("real") | Some("imag"))
        && matches!(kind, Some("raw") | Some("clean"))
        && channel.is_some_and(|c| !c.is_empty() && c.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::Cube;

    #[test]
    fn test_plane_naming() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::create(dir.path()).unwrap();
        let path = store.plane_path(Component::Imag, PlaneKind::Clean, 42);
        assert_eq!(path.file_name().unwrap(), "imag_clean_42.bin");
    }

    #[test]
    fn test_plane_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::create(dir.path().join("TEMP")).unwrap();
        let plane: Vec<f64> = (0..9).map(|v| v as f64 * -1.5).collect();

        store
            .write_plane(Component::Real, PlaneKind::Raw, 3, &plane)
            .unwrap();
        let back = store
            .read_plane(Component::Real, PlaneKind::Raw, 3, 9)
            .unwrap();
        assert_eq!(back, plane);
    }

    #[test]
    fn test_read_rejects_wrong_length_and_missing_plane() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::create(dir.path()).unwrap();
        store
            .write_plane(Component::Real, PlaneKind::Raw, 0, &[1.0, 2.0, 3.0, 4.0])
            .unwrap();

        let err = store
            .read_plane(Component::Real, PlaneKind::Raw, 0, 9)
            .unwrap_err();
        assert!(matches!(err, CleanError::Io { .. }));

        let err = store
            .read_plane(Component::Imag, PlaneKind::Raw, 0, 4)
            .unwrap_err();
        assert!(err.to_string().contains("imag_raw_0.bin"));
    }

    #[test]
    fn test_read_rejects_truncated_plane() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::create(dir.path()).unwrap();
        store
            .write_plane(Component::Real, PlaneKind::Raw, 0, &[1.0; 4])
            .unwrap();

        let path = store.plane_path(Component::Real, PlaneKind::Raw, 0);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(store.read_plane(Component::Real, PlaneKind::Raw, 0, 4).is_err());
    }

    #[test]
    fn test_component_transpose_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::create(dir.path()).unwrap();

        let channels = 4;
        let side = 3;
        let cube = Cube::from_vec(
            channels,
            side,
            (0..channels * side * side).map(|v| v as f64).collect(),
        )
        .unwrap();
        for c in 0..channels {
            store
                .write_plane(Component::Imag, PlaneKind::Raw, c, cube.channel(c))
                .unwrap();
        }

        let pixel_major = store
            .load_component(Component::Imag, PlaneKind::Raw, channels, side)
            .unwrap();
        assert_eq!(pixel_major.series(2, 1), cube.pixel_series(2, 1).as_slice());

        store
            .store_component(Component::Imag, PlaneKind::Clean, &pixel_major)
            .unwrap();
        for c in 0..channels {
            let plane = store
                .read_plane(Component::Imag, PlaneKind::Clean, c, side * side)
                .unwrap();
            assert_eq!(plane.as_slice(), cube.channel(c));
        }
    }

    #[test]
    fn test_remove_spares_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::create(dir.path()).unwrap();
        store
            .write_plane(Component::Imag, PlaneKind::Clean, 12, &[0.0])
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();
        fs::write(dir.path().join("real_raw_x.bin"), "keep").unwrap();

        store.remove().unwrap();
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("real_raw_x.bin").exists());
        assert!(!dir.path().join("imag_clean_12.bin").exists());
    }

    #[test]
    fn test_plane_file_names() {
        assert!(is_plane_file_name("real_raw_0.bin"));
        assert!(is_plane_file_name("imag_clean_901.bin"));
        assert!(!is_plane_file_name("data_clean_0.fits"));
        assert!(!is_plane_file_name("real_raw_.bin"));
        assert!(!is_plane_file_name("real_old_3.bin"));
    }

    #[test]
    fn test_remove_deletes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let scratch_dir = dir.path().join("TEMP");
        let store = ScratchStore::create(&scratch_dir).unwrap();
        store
            .write_plane(Component::Real, PlaneKind::Raw, 0, &[0.0])
            .unwrap();
        store.remove().unwrap();
        assert!(!scratch_dir.exists());
    }
}
