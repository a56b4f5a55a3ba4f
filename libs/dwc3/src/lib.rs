//! Control core for Synopsys DWC3 dual-role USB 3.x controllers.
//!
//! The controller can run as a USB peripheral or hand its register window to an xHCI host
//! driver. This crate arbitrates between those roles, tracks the peripheral-side connection
//! (bus reset, speed negotiation, disconnect) and owns the request queues of every non-control
//! endpoint. Register primitives, DMA memory, the EP0 protocol engine, the hardware command
//! encoder and the event ring are supplied by the platform through the traits in [`platform`].
//!
//! Locking follows three domains:
//! - the mode lock, held for a whole role transition (may block on child device creation);
//! - one lock per endpoint record, guarding its queue and flags;
//! - the register lock, guarding the CSR window and the small amount of link state.
//!
//! An endpoint lock may be held while the register lock is taken for a single update, never
//! the other way around. Completion callbacks and upstream notifications run with no lock held.

pub mod api;
mod connection;
mod controller;
mod endpoint;
mod mode;
pub mod platform;
pub mod regs;

#[cfg(test)]
mod fakes;

use std::fmt;

pub use api::*;
pub use controller::{Collaborators, Dwc3, Dwc3Config, Event};
pub use endpoint::{ep_num, EndpointInfo, EP0_IN, EP0_OUT};
pub use mode::ReleaseToken;

/// Number of physical endpoints on the core, including the EP0 OUT/IN pair.
pub const DWC3_MAX_EPS: usize = 32;
/// Size of the device event ring handed to the event subsystem.
pub const EVENT_BUFFER_SIZE: usize = 4096;
/// Size of each non-control endpoint's TRB ring.
pub const EP_FIFO_SIZE: usize = 4096;

// platform resource indices
pub const MMIO_USB3OTG: u32 = 0;
pub const IRQ_USB3: u32 = 0;
pub const BTI_USB3: u32 = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Endpoint address or index outside the range an operation accepts
    InvalidArgs,
    /// OTG mode, isochronous endpoints, or a protocol this core doesn't provide
    NotSupported,
    /// A platform resource (window, interrupt, BTI, DMA buffer, thread) couldn't be obtained
    NoResources,
    /// Synthetic status for requests drained by reset, disconnect or reconfiguration
    IoNotPresent,
    /// A register never reached its expected value
    TimedOut,
    /// Operation not valid in the endpoint's or controller's current state
    BadState,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgs => f.write_str("invalid arguments"),
            Error::NotSupported => f.write_str("not supported"),
            Error::NoResources => f.write_str("resource unavailable"),
            Error::IoNotPresent => f.write_str("device not present"),
            Error::TimedOut => f.write_str("timed out waiting for hardware"),
            Error::BadState => f.write_str("bad state"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
