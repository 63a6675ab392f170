//! Custom error types for the crate.
//!
//! This module defines the primary error type, `LinkError`, used by every component
//! that can fail. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle errors from identity parsing, engine construction, transfers, and
//! configuration loading.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: A component was built with settings that cannot work, such as
//!   a BLE discovery engine with no delivery sink. Raised at construction time.
//! - **`Parse`**: A canonical identity string did not match any recognized grammar, or
//!   one of its typed fields failed to parse.
//! - **`Transport`**: A control transfer failed or returned a response too short to
//!   interpret.
//! - **`Ble`**: The BLE backend reported a failure. The scan loop catches these at its
//!   boundary, so callers normally only see them in logs.
//! - **`Config`**, **`Io`**, **`Json`**: Wrapped errors from figment, the filesystem,
//!   and serde_json.
//!
//! Several failure modes are deliberately *not* errors: an unresolvable USB bus/address
//! produces an identity with `-1` sentinels, an unmapped command returns the table's
//! default buffer, and an unsupported monitoring platform falls back to polling.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Errors raised by identity, discovery, dispatch, and configuration code.
#[derive(Error, Debug)]
pub enum LinkError {
    /// A component was constructed with an unusable configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A canonical identity string could not be parsed.
    #[error("Cannot parse device id '{input}': {reason}")]
    Parse {
        /// The offending input.
        input: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A control transfer failed or returned an unusable response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The BLE backend failed.
    #[error("BLE error: {0}")]
    Ble(String),

    /// Configuration file or environment could not be loaded.
    #[error("Config loading error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Filesystem I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON profile or settings file was malformed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LinkError {
    /// Build a [`LinkError::Parse`] for `input`.
    pub fn parse(input: impl Into<String>, reason: impl Into<String>) -> Self {
        LinkError::Parse {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry or continue after this error.
    ///
    /// Construction and parse errors are programming or input mistakes; transfer and
    /// backend failures are usually transient (device unplugged, adapter busy).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::Transport(_) | LinkError::Ble(_) | LinkError::Io(_)
        )
    }
}

impl From<figment::Error> for LinkError {
    fn from(value: figment::Error) -> Self {
        LinkError::Config(Box::new(value))
    }
}
