//! DWC3 global and device register map, plus a CSR accessor over the platform's MMIO window.
//!
//! Offsets are byte offsets from the start of the USB3OTG window. Only the registers the role
//! and connection logic touch are described here; endpoint command registers and the event
//! buffer registers belong to the command and event subsystems.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bitfield::bitfield;

use crate::platform::Mmio;
use crate::{Error, Result};

#[derive(Debug, Copy, Clone)]
pub struct Register {
    /// Byte offset of this register within the window
    offset: usize,
    /// Mask of implemented bits
    mask: u32,
}
impl Register {
    pub const fn new(offset: usize, mask: u32) -> Register { Register { offset, mask } }

    pub const fn offset(&self) -> usize { self.offset }

    pub const fn mask(&self) -> u32 { self.mask }
}

#[derive(Debug, Copy, Clone)]
pub struct Field {
    /// Unshifted mask, e.g. 0b111 for a 3-bit field
    mask: u32,
    /// Offset of the first bit in this field
    offset: usize,
    register: Register,
}
impl Field {
    pub const fn new(width: usize, offset: usize, register: Register) -> Field {
        let mask = if width < 32 { (1 << width) - 1 } else { 0xFFFF_FFFF };
        Field { mask, offset, register }
    }

    pub const fn offset(&self) -> usize { self.offset }

    pub const fn mask(&self) -> u32 { self.mask }

    pub const fn register(&self) -> Register { self.register }
}

pub const GCTL: Register = Register::new(0xc110, 0xFFFF_FFFF);
pub const GCTL_DSBLCLKGTNG: Field = Field::new(1, 0, GCTL);
pub const GCTL_U2EXIT_LFPS: Field = Field::new(1, 2, GCTL);
pub const GCTL_PRTCAPDIR: Field = Field::new(2, 12, GCTL);
pub const GCTL_U2RSTECN: Field = Field::new(1, 16, GCTL);
pub const GCTL_PWRDNSCALE: Field = Field::new(13, 19, GCTL);

pub const GCTL_PRTCAPDIR_HOST: u32 = 1;
pub const GCTL_PRTCAPDIR_DEVICE: u32 = 2;
pub const GCTL_PRTCAPDIR_OTG: u32 = 3;

pub const GSTS: Register = Register::new(0xc118, 0xFFFF_FFFF);

pub const GUSB2PHYCFG0: Register = Register::new(0xc200, 0xFFFF_FFFF);
pub const GUSB2PHYCFG_SUSPENDUSB20: Field = Field::new(1, 6, GUSB2PHYCFG0);
pub const GUSB2PHYCFG_USBTRDTIM: Field = Field::new(4, 10, GUSB2PHYCFG0);

pub const GUSB3PIPECTL0: Register = Register::new(0xc2c0, 0xFFFF_FFFF);
pub const GUSB3PIPECTL_SS_TX_DE_EMPHASIS: Field = Field::new(2, 1, GUSB3PIPECTL0);
pub const GUSB3PIPECTL_LFPSFILTER: Field = Field::new(1, 9, GUSB3PIPECTL0);
pub const GUSB3PIPECTL_SUSPENDENABLE: Field = Field::new(1, 17, GUSB3PIPECTL0);
pub const GUSB3PIPECTL_DELAYP1TRANS: Field = Field::new(1, 18, GUSB3PIPECTL0);

pub const DCFG: Register = Register::new(0xc700, 0xFFFF_FFFF);
pub const DCFG_DEVSPD: Field = Field::new(3, 0, DCFG);
pub const DCFG_DEVADDR: Field = Field::new(7, 3, DCFG);
pub const DCFG_NUMP: Field = Field::new(5, 17, DCFG);

pub const DCTL: Register = Register::new(0xc704, 0xFFFF_FFFF);
pub const DCTL_CSFTRST: Field = Field::new(1, 30, DCTL);
pub const DCTL_RUN_STOP: Field = Field::new(1, 31, DCTL);

pub const DSTS: Register = Register::new(0xc70c, 0xFFFF_FFFF);
pub const DSTS_CONNECTSPD: Field = Field::new(3, 0, DSTS);

pub const DALEPENA: Register = Register::new(0xc720, 0xFFFF_FFFF);

/// Speed encoding shared by DSTS.CONNECTSPD and DCFG.DEVSPD.
#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
pub enum HwSpeed {
    High = 0,
    Full = 1,
    Super = 4,
    EnhancedSuper = 5,
}

bitfield! {
    pub struct Dsts(u32);
    impl Debug;
    pub connectspd, _: 2, 0;
    pub soffn, _: 16, 3;
    pub rxfifoempty, _: 17;
    pub usblnkst, _: 21, 18;
    pub devctrlhlt, _: 22;
    pub coreidle, _: 23;
    pub sss, _: 24;
    pub rss, _: 25;
    pub sre, _: 28;
    pub dcnrd, _: 29;
}

bitfield! {
    pub struct Gsts(u32);
    impl Debug;
    pub curmod, _: 1, 0;
    pub buserraddrvld, _: 4;
    pub csr_timeout, _: 5;
    pub device_ip, _: 6;
    pub host_ip, _: 7;
    pub adp_ip, _: 8;
    pub bc_ip, _: 9;
    pub otg_ip, _: 10;
    pub ssic_ip, _: 11;
    pub cbelt, _: 31, 20;
}

/// Field-level access to a register window.
///
/// Callers are expected to hold the controller's register lock; the accessor itself does no
/// serialization beyond what the underlying window provides.
#[derive(Clone)]
pub struct Csr {
    mmio: Arc<dyn Mmio>,
}
impl Csr {
    pub fn new(mmio: Arc<dyn Mmio>) -> Self { Csr { mmio } }

    /// Read the contents of this register
    pub fn r(&self, reg: Register) -> u32 { self.mmio.read32(reg.offset) & reg.mask }

    /// Read a field from this register
    pub fn rf(&self, field: Field) -> u32 {
        (self.mmio.read32(field.register.offset) >> field.offset) & field.mask
    }

    /// Read-modify-write a given field
    pub fn rmwf(&self, field: Field, value: u32) {
        let previous = self.mmio.read32(field.register.offset) & !(field.mask << field.offset);
        self.mmio.write32(field.register.offset, previous | ((value & field.mask) << field.offset));
    }

    /// Write a given field without reading it first; other bits are written as zero
    pub fn wfo(&self, field: Field, value: u32) {
        self.mmio.write32(field.register.offset, (value & field.mask) << field.offset);
    }

    /// Write the entire contents of a register without reading it first
    pub fn wo(&self, reg: Register, value: u32) { self.mmio.write32(reg.offset, value) }

    /// Zero a field from a provided value
    pub fn zf(&self, field: Field, value: u32) -> u32 { value & !(field.mask << field.offset) }

    /// Shift & mask a value to its final field position
    pub fn ms(&self, field: Field, value: u32) -> u32 { (value & field.mask) << field.offset }

    /// Poll until `(reg & bits) == expected`, sleeping `interval` between reads.
    ///
    /// Gives up with `TimedOut` once `timeout` has elapsed.
    pub fn wait_bits(
        &self,
        reg: Register,
        bits: u32,
        expected: u32,
        interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        poll_bits(|| self.r(reg), reg, bits, expected, interval, timeout)
    }
}

/// Like [`Csr::wait_bits`], but every read goes through `read`, so a caller can take its register
/// lock for the single access and sleep without it.
pub fn poll_bits<F: FnMut() -> u32>(
    mut read: F,
    reg: Register,
    bits: u32,
    expected: u32,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let value = read() & reg.mask;
        if value & bits == expected {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            log::error!(
                "register {:#x} stuck at {:#x} (bits {:#x}, expected {:#x})",
                reg.offset,
                value,
                bits,
                expected
            );
            return Err(Error::TimedOut);
        }
        thread::sleep(interval);
    }
}
