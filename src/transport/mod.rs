//! Non-USB spectrometer transports.

pub mod file;

pub use file::{FileSettings, FileSpectrometer};
