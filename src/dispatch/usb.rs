//! Real USB endpoint using nusb vendor control transfers.

use std::time::Duration;

use nusb::transfer::{Control, ControlType, Recipient};
use tracing::{debug, info};

use super::{ControlRequest, ControlTransfer, Direction};
use crate::error::{LinkError, LinkResult};
use crate::identity::DeviceId;

const TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// An opened USB spectrometer.
pub struct UsbSpectrometer {
    identity: DeviceId,
    interface: nusb::Interface,
}

impl std::fmt::Debug for UsbSpectrometer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbSpectrometer")
            .field("identity", &self.identity)
            .finish()
    }
}

impl UsbSpectrometer {
    /// Open the device a `USB:` identity names and claim interface 0.
    pub fn open(identity: &DeviceId) -> LinkResult<Self> {
        let coords = identity
            .usb_coordinates()
            .ok_or_else(|| LinkError::Configuration(format!("{identity} is not a USB identity")))?;

        let info = nusb::list_devices()
            .map_err(|e| LinkError::Transport(format!("USB enumeration: {e}")))?
            .find(|dev| {
                dev.vendor_id() == coords.vendor_id
                    && dev.product_id() == coords.product_id
                    && (!coords.is_resolved()
                        || (i32::from(dev.bus_number()) == coords.bus
                            && i32::from(dev.device_address()) == coords.address))
            })
            .ok_or_else(|| LinkError::Transport(format!("{identity} not present on the bus")))?;

        let device = info
            .open()
            .map_err(|e| LinkError::Transport(format!("USB open: {e}")))?;
        let interface = device
            .claim_interface(0)
            .map_err(|e| LinkError::Transport(format!("claim interface 0: {e}")))?;

        info!(device = %identity, "Opened USB spectrometer");
        Ok(Self {
            identity: identity.clone(),
            interface,
        })
    }

    /// Identity this handle was opened for.
    pub fn identity(&self) -> &DeviceId {
        &self.identity
    }
}

impl ControlTransfer for UsbSpectrometer {
    fn control_transfer(&mut self, request: ControlRequest) -> LinkResult<Vec<u8>> {
        let control = Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: request.request,
            value: request.value,
            index: request.index,
        };
        debug!(device = %self.identity, %request, "USB control transfer");

        match request.direction {
            Direction::DeviceToHost => {
                let mut buf = vec![0u8; usize::from(request.length)];
                let n = self
                    .interface
                    .control_in_blocking(control, &mut buf, TRANSFER_TIMEOUT)
                    .map_err(|e| LinkError::Transport(format!("control_in({request}): {e}")))?;
                buf.truncate(n);
                Ok(buf)
            }
            Direction::HostToDevice => {
                // Vendor writes carry a zero-filled data stage of `length` bytes.
                let payload = vec![0u8; usize::from(request.length)];
                self.interface
                    .control_out_blocking(control, &payload, TRANSFER_TIMEOUT)
                    .map_err(|e| LinkError::Transport(format!("control_out({request}): {e}")))?;
                Ok(Vec::new())
            }
        }
    }
}
