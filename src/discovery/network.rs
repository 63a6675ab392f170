//! Statically configured network spectrometers.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::DiscoveryStrategy;
use crate::error::LinkResult;
use crate::identity::DeviceId;

/// Address and port of a network spectrometer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TcpEndpoint {
    /// Host name or IP address.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

/// Reports a `TCP:` identity for each configured endpoint.
///
/// Endpoints are not probed; reachability is checked at connect time.
#[derive(Debug, Clone, Default)]
pub struct AddressList {
    endpoints: Vec<TcpEndpoint>,
}

impl AddressList {
    /// List `endpoints`.
    pub fn new(endpoints: impl IntoIterator<Item = TcpEndpoint>) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
        }
    }

    /// Configured endpoints.
    pub fn endpoints(&self) -> &[TcpEndpoint] {
        &self.endpoints
    }
}

impl DiscoveryStrategy for AddressList {
    fn name(&self) -> &str {
        "tcp"
    }

    fn list_current_devices(&mut self) -> LinkResult<Vec<DeviceId>> {
        trace!(count = self.endpoints.len(), "Listing configured network devices");
        Ok(self
            .endpoints
            .iter()
            .map(|ep| DeviceId::tcp(ep.address.as_str(), ep.port))
            .collect())
    }
}
