//! Watch-directory virtual spectrometer.
//!
//! Another process owns the "real" instrument and exchanges data with us through a
//! shared directory:
//!
//! - `spectrometer.json` describes the device (pixel count and initial settings).
//! - We drop settings as `command-00000001.csv`, `command-00000002.csv`, ... each
//!   holding one `setting,value` line. Files are written to a `.tmp` name and renamed
//!   into place so the peer never sees a partial command.
//! - The peer drops spectra as `spectrum*.csv`; we consume the lexically first one,
//!   one value per line (`x,y` lines use the second column), and delete it.
//!
//! Command files left over from an earlier session are deleted on connect.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LinkError, LinkResult};
use crate::identity::DeviceId;

/// File that marks a directory as a virtual spectrometer.
pub const SETTINGS_FILE: &str = "spectrometer.json";

const COMMAND_PREFIX: &str = "command";
const SPECTRUM_PREFIX: &str = "spectrum";
const CSV_SUFFIX: &str = "csv";

/// Whether `dir` exists, is writable, and contains [`SETTINGS_FILE`].
pub fn is_spectrometer_dir(dir: &Path) -> bool {
    let Ok(meta) = fs::metadata(dir) else {
        return false;
    };
    meta.is_dir() && !meta.permissions().readonly() && dir.join(SETTINGS_FILE).is_file()
}

/// Contents of `spectrometer.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    /// Pixels per spectrum; incoming spectra are padded or truncated to this.
    pub pixels: usize,
    /// Integration time in ms.
    pub integration_time_ms: u32,
    /// Serial number, for display.
    pub serial_number: Option<String>,
    /// Model name, for display.
    pub model: Option<String>,
    /// Wavelength calibration coefficients.
    pub wavelength_coeffs: Vec<f64>,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            pixels: 1024,
            integration_time_ms: 100,
            serial_number: None,
            model: None,
            wavelength_coeffs: Vec::new(),
        }
    }
}

/// A connected watch-directory spectrometer.
#[derive(Debug)]
pub struct FileSpectrometer {
    directory: PathBuf,
    settings: FileSettings,
    command_count: u64,
}

impl FileSpectrometer {
    /// Connect to the directory a `FILE:` identity names.
    pub fn open(identity: &DeviceId) -> LinkResult<Self> {
        let directory = identity
            .directory()
            .ok_or_else(|| LinkError::Configuration(format!("{identity} is not a FILE identity")))?;
        Self::connect(directory)
    }

    /// Connect to `directory`: validate it, clear stale commands, load settings.
    pub fn connect(directory: impl Into<PathBuf>) -> LinkResult<Self> {
        let directory = directory.into();
        if !is_spectrometer_dir(&directory) {
            return Err(LinkError::Configuration(format!(
                "{} is not a writable directory containing {SETTINGS_FILE}",
                directory.display()
            )));
        }

        let text = fs::read_to_string(directory.join(SETTINGS_FILE))?;
        let settings: FileSettings = serde_json::from_str(&text)?;

        let spec = Self {
            directory,
            settings,
            command_count: 0,
        };
        spec.erase_commands()?;
        info!(dir = %spec.directory.display(), pixels = spec.settings.pixels, "Connected file spectrometer");
        Ok(spec)
    }

    /// Loaded settings.
    pub fn settings(&self) -> &FileSettings {
        &self.settings
    }

    /// Commands written this session.
    pub fn command_count(&self) -> u64 {
        self.command_count
    }

    /// Watched directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn matching(&self, prefix: &str) -> LinkResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(prefix) && name.ends_with(CSV_SUFFIX) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Delete every `command*csv` file in the directory.
    pub fn erase_commands(&self) -> LinkResult<usize> {
        let stale = self.matching(COMMAND_PREFIX)?;
        for path in &stale {
            debug!(path = %path.display(), "Deleting stale command");
            fs::remove_file(path)?;
        }
        Ok(stale.len())
    }

    /// Write one `setting,value` command file. Returns its path.
    pub fn write_setting(&mut self, setting: &str, value: impl Display) -> LinkResult<PathBuf> {
        let line = format!("{setting},{value}");
        self.command_count += 1;
        let path = self
            .directory
            .join(format!("{COMMAND_PREFIX}-{:08}.{CSV_SUFFIX}", self.command_count));
        let tmp = path.with_extension(format!("{CSV_SUFFIX}.tmp"));
        fs::write(&tmp, &line)?;
        fs::rename(&tmp, &path)?;
        debug!(command = %line, path = %path.display(), "Wrote command");

        if setting == "integration_time_ms" {
            match line[setting.len() + 1..].trim().parse() {
                Ok(ms) => self.settings.integration_time_ms = ms,
                Err(_) => warn!(command = %line, "Non-numeric integration time"),
            }
        }
        Ok(path)
    }

    /// Consume the oldest pending spectrum, or `None` if the peer has not produced one.
    ///
    /// Malformed spectrum files are logged and deleted so later reads can proceed.
    /// The result is padded with zeros or truncated to the configured pixel count.
    pub fn get_line(&mut self) -> LinkResult<Option<Vec<f64>>> {
        for path in self.matching(SPECTRUM_PREFIX)? {
            let parsed = parse_spectrum(&fs::read_to_string(&path)?);

            if let Err(e) = fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Could not delete spectrum");
                if parsed.is_err() {
                    return Err(LinkError::Transport(format!(
                        "{}: malformed spectrum could not be removed: {e}",
                        path.display()
                    )));
                }
            }

            let mut spectrum = match parsed {
                Ok(spectrum) => spectrum,
                Err(reason) => {
                    warn!(path = %path.display(), %reason, "Discarding malformed spectrum");
                    continue;
                }
            };

            let pixels = self.settings.pixels;
            if spectrum.len() != pixels {
                warn!(
                    read = spectrum.len(),
                    expected = pixels,
                    path = %path.display(),
                    "Spectrum length does not match pixel count"
                );
                spectrum.resize(pixels, 0.0);
            }
            return Ok(Some(spectrum));
        }
        Ok(None)
    }
}

/// One value per line, either bare or as the second CSV column.
fn parse_spectrum(text: &str) -> Result<Vec<f64>, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let column = line.split(',').map(str::trim).nth(1).unwrap_or(line);
            column
                .parse::<f64>()
                .map_err(|e| format!("bad value '{column}': {e}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn virtual_dir(pixels: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            format!(r#"{{"pixels": {pixels}, "serial_number": "VIRT-1"}}"#),
        )
        .unwrap();
        dir
    }

    #[test]
    fn connect_erases_stale_commands() {
        let dir = virtual_dir(4);
        fs::write(dir.path().join("command-00000007.csv"), "gain,3").unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();
        let spec = FileSpectrometer::connect(dir.path()).unwrap();
        assert!(!dir.path().join("command-00000007.csv").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(spec.settings().serial_number.as_deref(), Some("VIRT-1"));
    }

    #[test]
    fn commands_are_numbered_and_complete() {
        let dir = virtual_dir(4);
        let mut spec = FileSpectrometer::connect(dir.path()).unwrap();
        let first = spec.write_setting("detector_gain", 8).unwrap();
        let second = spec.write_setting("integration_time_ms", 250).unwrap();
        assert!(first.ends_with("command-00000001.csv"));
        assert!(second.ends_with("command-00000002.csv"));
        assert_eq!(fs::read_to_string(&second).unwrap(), "integration_time_ms,250");
        assert_eq!(spec.settings().integration_time_ms, 250);
        assert_eq!(spec.command_count(), 2);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn get_line_consumes_oldest_and_pads() {
        let dir = virtual_dir(4);
        let mut spec = FileSpectrometer::connect(dir.path()).unwrap();
        assert_eq!(spec.get_line().unwrap(), None);

        fs::write(dir.path().join("spectrum-002.csv"), "9\n9\n").unwrap();
        fs::write(dir.path().join("spectrum-001.csv"), "500.1, 10\n500.2, 11\n500.3, 12\n").unwrap();
        assert_eq!(spec.get_line().unwrap(), Some(vec![10.0, 11.0, 12.0, 0.0]));
        assert!(!dir.path().join("spectrum-001.csv").exists());
        assert_eq!(spec.get_line().unwrap(), Some(vec![9.0, 9.0, 0.0, 0.0]));
    }

    #[test]
    fn malformed_spectrum_is_discarded_not_retried() {
        let dir = virtual_dir(2);
        let mut spec = FileSpectrometer::connect(dir.path()).unwrap();
        fs::write(dir.path().join("spectrum-001.csv"), "1\nNaN-ish\n").unwrap();
        fs::write(dir.path().join("spectrum-002.csv"), "3\n4\n").unwrap();

        assert_eq!(spec.get_line().unwrap(), Some(vec![3.0, 4.0]));
        assert!(!dir.path().join("spectrum-001.csv").exists());
        assert_eq!(spec.get_line().unwrap(), None);
    }

    #[test]
    fn long_spectrum_is_truncated() {
        let dir = virtual_dir(2);
        let mut spec = FileSpectrometer::connect(dir.path()).unwrap();
        fs::write(dir.path().join("spectrum.csv"), "1\n2\n3\n").unwrap();
        assert_eq!(spec.get_line().unwrap(), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn connect_rejects_incomplete_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileSpectrometer::connect(dir.path()),
            Err(LinkError::Configuration(_))
        ));
    }
}
