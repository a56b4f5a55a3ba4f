//! Services the controller core consumes from its environment.
//!
//! None of these are implemented here: the platform bus provides the register window,
//! interrupt, BTI and DMA memory; the EP0 engine, command encoder and event ring live in their
//! own subsystems; the host bridge publishes the xHCI child device.

use std::sync::Arc;

use bitflags::bitflags;
use usb_device::endpoint::EndpointType;

use crate::api::ProtocolId;
use crate::mode::ReleaseToken;
use crate::Result;

/// Raw 32-bit access to a memory-mapped register window. Offsets are in bytes.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// Bus transaction initiator handle used to pin DMA memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Bti(pub u32);

bitflags! {
    pub struct BufferFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CONTIG = 1 << 2;
        const RO = Self::READ.bits;
        const RW = Self::READ.bits | Self::WRITE.bits;
    }
}

/// A pinned, device-visible buffer. Released on drop.
pub trait DmaBuffer: Send + Sync {
    fn size(&self) -> usize;
    fn phys(&self) -> u64;
    fn cache_flush(&self, offset: usize, len: usize);
}

/// A mapped interrupt. Dropping it unmaps the interrupt.
pub trait Interrupt: Send + Sync {
    /// Cancel any thread blocked waiting on this interrupt.
    fn destroy(&self);
}

pub trait Platform: Send + Sync {
    fn map_mmio(&self, index: u32) -> Result<Arc<dyn Mmio>>;
    fn map_interrupt(&self, index: u32) -> Result<Box<dyn Interrupt>>;
    fn get_bti(&self, index: u32) -> Result<Bti>;
    fn alloc_buffer(&self, bti: Bti, size: usize, flags: BufferFlags) -> Result<Box<dyn DmaBuffer>>;
}

/// Hooks into the EP0 control-transfer engine.
pub trait Ep0Engine: Send + Sync {
    fn init(&self, buffer: &dyn DmaBuffer) -> Result<()>;
    /// Arm EP0 for the next SETUP packet.
    fn start(&self);
    /// Abort any control transfer in progress.
    fn reset(&self);
    /// A transfer on EP0 OUT (0) or EP0 IN (1) finished.
    fn transfer_complete(&self, ep_num: u8);
}

/// Endpoint commands issued through the DEPCMD registers.
pub trait EpCommands: Send + Sync {
    /// `modify` is set when reprogramming an endpoint that is already configured, such as EP0
    /// after speed negotiation.
    fn configure_endpoint(
        &self,
        ep_num: u8,
        ep_type: EndpointType,
        max_packet_size: u16,
        interval: u8,
        modify: bool,
    ) -> Result<()>;
    fn start_transfer(&self, ep_num: u8, trb_phys: u64, length: usize) -> Result<()>;
    fn end_transfer(&self, ep_num: u8);
    fn set_stall(&self, ep_num: u8);
    fn clear_stall(&self, ep_num: u8);
}

/// The device event ring. `start` programs the ring and unmasks device events.
pub trait EventRing: Send + Sync {
    fn start(&self, buffer: &dyn DmaBuffer);
    fn stop(&self);
}

pub const BIND_PLATFORM_DEV_VID: u32 = 0x0100;
pub const BIND_PLATFORM_DEV_PID: u32 = 0x0101;
pub const BIND_PLATFORM_DEV_DID: u32 = 0x0102;

pub const PDEV_VID_GENERIC: u32 = 0;
pub const PDEV_PID_GENERIC: u32 = 0;
pub const PDEV_DID_USB_XHCI: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceProp {
    pub id: u32,
    pub value: u32,
}

/// Everything a host bridge needs to publish the xHCI child.
pub struct ChildDeviceArgs {
    pub name: &'static str,
    pub proto_id: ProtocolId,
    pub props: Vec<DeviceProp>,
    /// The child talks to the same register window and interrupt as the controller, so its
    /// resource lookups go straight to the parent platform.
    pub parent: Arc<dyn Platform>,
    /// Held by the child for its whole lifetime; dropping it reports the release back to the
    /// controller.
    pub release: ReleaseToken,
}

/// Handle to a published child device.
#[derive(Debug, PartialEq, Eq)]
pub struct ChildDevice {
    id: u64,
}
impl ChildDevice {
    pub fn new(id: u64) -> Self { ChildDevice { id } }

    pub fn id(&self) -> u64 { self.id }
}

pub trait HostBridge: Send + Sync {
    fn add_device(&self, args: ChildDeviceArgs) -> Result<ChildDevice>;
    /// Schedule removal. The child may keep running until its release token is dropped.
    fn remove_device(&self, dev: ChildDevice);
}
