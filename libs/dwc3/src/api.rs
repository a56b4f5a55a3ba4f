use std::fmt;
use std::sync::Arc;

use usb_device::endpoint::{EndpointAddress, EndpointType};

use crate::platform::Bti;
use crate::Result;

/// Operating role of the controller. Values match the mode-switch wire encoding.
#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsbMode {
    Inactive = 0,
    Host = 1,
    Peripheral = 2,
    /// Dual-role; not supported by this core
    Otg = 3,
}

/// Negotiated link speed as reported to the upstream client.
#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsbSpeed {
    Undefined = 0,
    Full = 1,
    High = 3,
    /// SuperSpeed and SuperSpeedPlus both land here
    Super = 4,
}

/// Where the EP0 control engine is in a control transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ep0State {
    None,
    Setup,
    DataOut,
    DataIn,
    Status,
    Stall,
}

/// Standard endpoint descriptor, as handed down by the function driver.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}
impl EndpointDescriptor {
    pub fn address(&self) -> EndpointAddress { EndpointAddress::from(self.b_endpoint_address) }

    pub fn ep_type(&self) -> EndpointType {
        match self.bm_attributes & 0x3 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }

    /// Packet size without the high-bandwidth multiplier bits.
    pub fn max_packet(&self) -> u16 { self.w_max_packet_size & 0x7ff }
}

/// SuperSpeed endpoint companion descriptor.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SsEpCompDescriptor {
    pub b_max_burst: u8,
    pub bm_attributes: u8,
    pub w_bytes_per_interval: u16,
}

pub type CompleteCallback = Box<dyn FnOnce(Result<()>, usize) + Send>;

/// A transfer submitted by the function driver.
///
/// Completing a request consumes it, so each request is handed back to its owner exactly once.
pub struct UsbRequest {
    pub ep_address: u8,
    pub length: usize,
    complete_cb: CompleteCallback,
}
impl UsbRequest {
    pub fn new<F>(ep_address: u8, length: usize, complete_cb: F) -> Self
    where
        F: FnOnce(Result<()>, usize) + Send + 'static,
    {
        UsbRequest { ep_address, length, complete_cb: Box::new(complete_cb) }
    }

    /// Hand the request back to its owner with the final status and the number of bytes moved.
    pub fn complete(self, status: Result<()>, actual: usize) { (self.complete_cb)(status, actual) }
}
impl fmt::Debug for UsbRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbRequest").field("ep_address", &self.ep_address).field("length", &self.length).finish()
    }
}

/// Callbacks into the upstream (function-side) client.
pub trait UsbDciInterface: Send + Sync {
    fn set_connected(&self, connected: bool);
    fn set_speed(&self, speed: UsbSpeed);
}

/// Role selection. Implemented by the controller, and optionally consumed from a board-level
/// helper that drives an external mux or VBUS switch.
pub trait UsbModeSwitch: Send + Sync {
    fn set_mode(&self, mode: UsbMode) -> Result<()>;
}

/// Peripheral-role surface offered to the function driver.
pub trait UsbDci: Send + Sync {
    /// Queue a request. Requests for bad endpoints are completed with `InvalidArgs` right away.
    fn request_queue(&self, req: UsbRequest);
    fn set_interface(&self, intf: Arc<dyn UsbDciInterface>) -> Result<()>;
    fn config_ep(&self, ep_desc: &EndpointDescriptor, ss_comp_desc: Option<&SsEpCompDescriptor>) -> Result<()>;
    fn disable_ep(&self, ep_address: u8) -> Result<()>;
    fn ep_set_stall(&self, ep_address: u8) -> Result<()>;
    fn ep_clear_stall(&self, ep_address: u8) -> Result<()>;
    fn get_bti(&self) -> Bti;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolId {
    UsbDci,
    UsbModeSwitch,
    PlatformDev,
}

/// Capabilities the controller hands out from `get_protocol`.
pub enum Protocol<'a> {
    Dci(&'a dyn UsbDci),
    ModeSwitch(&'a dyn UsbModeSwitch),
}
