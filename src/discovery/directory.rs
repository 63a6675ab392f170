//! Watch-directory virtual spectrometers.

use std::path::PathBuf;

use tracing::{trace, warn};

use super::DiscoveryStrategy;
use crate::error::LinkResult;
use crate::identity::DeviceId;
use crate::transport::file::is_spectrometer_dir;

/// Reports a `FILE:` identity for each configured directory that currently holds a
/// virtual spectrometer (exists, is writable, contains `spectrometer.json`).
#[derive(Debug, Clone, Default)]
pub struct DirectoryWatch {
    directories: Vec<PathBuf>,
}

impl DirectoryWatch {
    /// Watch `directories`.
    pub fn new<I, P>(directories: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            directories: directories.into_iter().map(Into::into).collect(),
        }
    }

    /// Configured directories.
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }
}

impl DiscoveryStrategy for DirectoryWatch {
    fn name(&self) -> &str {
        "directory"
    }

    fn list_current_devices(&mut self) -> LinkResult<Vec<DeviceId>> {
        Ok(self
            .directories
            .iter()
            .filter(|dir| {
                let ok = is_spectrometer_dir(dir);
                trace!(dir = %dir.display(), ok, "Checked watch directory");
                ok
            })
            .filter_map(|dir| match DeviceId::file(dir) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "Skipping watch directory");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_complete_directories_are_reported() {
        let ready = tempfile::tempdir().unwrap();
        std::fs::write(ready.path().join("spectrometer.json"), "{}").unwrap();
        let empty = tempfile::tempdir().unwrap();

        let mut watch = DirectoryWatch::new([
            ready.path().to_path_buf(),
            empty.path().to_path_buf(),
            PathBuf::from("/definitely/not/here"),
        ]);
        let found = watch.list_current_devices().unwrap();
        assert_eq!(found, vec![DeviceId::file(ready.path()).unwrap()]);
    }
}
