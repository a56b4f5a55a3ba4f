use num_traits::FromPrimitive;
use usb_device::endpoint::EndpointType;

use crate::api::{Ep0State, UsbSpeed};
use crate::controller::Dwc3;
use crate::endpoint::{EP0_IN, EP0_OUT};
use crate::regs::*;
use crate::Error;

impl HwSpeed {
    /// Link speed as the upstream client sees it, and the EP0 packet size that goes with it.
    pub fn usb_speed(&self) -> (UsbSpeed, u16) {
        match self {
            HwSpeed::High => (UsbSpeed::High, 64),
            HwSpeed::Full => (UsbSpeed::Full, 64),
            HwSpeed::Super | HwSpeed::EnhancedSuper => (UsbSpeed::Super, 512),
        }
    }
}

impl Dwc3 {
    pub(crate) fn usb_reset(&self) {
        log::info!("usb reset");

        self.ep0.reset();
        self.regs.lock().unwrap().ep0_state = Ep0State::None;
        self.end_all_transfers();
        self.set_address(0);
        self.ep0.start();
        if let Some(intf) = self.interface() {
            intf.set_connected(true);
        }
    }

    pub(crate) fn disconnected(&self) {
        log::info!("disconnected");

        self.commands.end_transfer(EP0_OUT);
        self.regs.lock().unwrap().ep0_state = Ep0State::None;

        if let Some(intf) = self.interface() {
            intf.set_connected(false);
        }
        self.end_all_transfers();
    }

    pub(crate) fn connection_done(&self) {
        let (speed, ep0_max_packet) = {
            let mut regs = self.regs.lock().unwrap();
            let code = Dsts(regs.csr.r(DSTS)).connectspd();
            let (speed, ep0_max_packet) = match HwSpeed::from_u32(code) {
                Some(hw) => hw.usb_speed(),
                None => {
                    log::error!("connection done: unsupported speed {}", code);
                    (UsbSpeed::Undefined, 0)
                }
            };
            regs.speed = speed;
            (speed, ep0_max_packet)
        };
        log::info!("connected at {:?}", speed);

        if ep0_max_packet != 0 {
            self.ep0_set_max_packet(ep0_max_packet);
            for ep_num in [EP0_OUT, EP0_IN] {
                if let Err(e) =
                    self.commands.configure_endpoint(ep_num, EndpointType::Control, ep0_max_packet, 0, true)
                {
                    log::error!("ep{} reconfigure failed: {:?}", ep_num, e);
                }
            }
        }

        if let Some(intf) = self.interface() {
            intf.set_speed(speed);
        }
    }

    pub fn set_address(&self, address: u8) {
        let regs = self.regs.lock().unwrap();
        regs.csr.rmwf(DCFG_DEVADDR, address as u32);
    }

    /// Disable every endpoint except EP0 and cancel whatever they had outstanding.
    pub fn reset_configuration(&self) {
        for index in self.eps.non_control() {
            self.ep_mark_disabled(index);
        }
        {
            let regs = self.regs.lock().unwrap();
            regs.csr.wo(DALEPENA, (1 << EP0_OUT) | (1 << EP0_IN));
        }
        self.end_all_transfers();
    }

    fn end_all_transfers(&self) {
        for index in self.eps.non_control() {
            self.ep_end_transfers(index, Error::IoNotPresent);
            self.ep_reset_stall(index);
        }
    }

    pub fn print_status(&self) {
        let regs = self.regs.lock().unwrap();
        log::trace!("{:?}", Dsts(regs.csr.r(DSTS)));
        log::trace!("{:?}", Gsts(regs.csr.r(GSTS)));
    }
}
