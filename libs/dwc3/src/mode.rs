use std::sync::Weak;

use crossbeam_channel::{Receiver, Sender};
use num_traits::ToPrimitive;

use crate::api::{ProtocolId, UsbMode};
use crate::controller::Dwc3;
use crate::platform::*;
use crate::regs::*;
use crate::{Error, Result, IRQ_USB3};

pub(crate) struct ModeState {
    pub(crate) mode: UsbMode,
    pub(crate) irq: Option<Box<dyn Interrupt>>,
    /// The live host child and the sequence number its release token carries
    pub(crate) xhci_dev: Option<(ChildDevice, u64)>,
    /// Sequence number of the host child being torn down; peripheral mode starts once that
    /// particular child is gone.
    pub(crate) start_peripheral_on_release: Option<u64>,
    child_seq: u64,
}
impl ModeState {
    pub(crate) fn new() -> Self {
        ModeState {
            mode: UsbMode::Inactive,
            irq: None,
            xhci_dev: None,
            start_peripheral_on_release: None,
            child_seq: 0,
        }
    }
}

pub(crate) enum ModeMessage {
    /// The xHCI child with this sequence number has been released by its host bridge
    ChildReleased(u64),
    /// Reply once every message sent before this one has been handled
    Sync(Sender<()>),
    Quit,
}

/// Proof of life for the host-mode child device.
///
/// The host bridge keeps this for as long as the child exists. Dropping it (or calling
/// [`ReleaseToken::release`]) tells the controller the child is gone, which is when a deferred
/// switch into peripheral mode actually happens. The notification is handled on the
/// controller's mode worker, so it is safe to release from inside `HostBridge::remove_device`.
pub struct ReleaseToken {
    sender: Sender<ModeMessage>,
    child: u64,
}
impl ReleaseToken {
    pub(crate) fn new(sender: Sender<ModeMessage>, child: u64) -> Self { ReleaseToken { sender, child } }

    pub fn release(self) {}
}
impl Drop for ReleaseToken {
    fn drop(&mut self) {
        // the worker is gone if the controller was already torn down
        self.sender.send(ModeMessage::ChildReleased(self.child)).ok();
    }
}

pub(crate) fn mode_worker(dwc: Weak<Dwc3>, receiver: Receiver<ModeMessage>) {
    log::trace!("mode worker started");
    loop {
        match receiver.recv() {
            Ok(ModeMessage::ChildReleased(child)) => match dwc.upgrade() {
                Some(dwc) => dwc.xhci_release(child),
                None => break,
            },
            Ok(ModeMessage::Sync(ack)) => {
                ack.send(()).ok();
            }
            Ok(ModeMessage::Quit) | Err(_) => break,
        }
    }
    log::trace!("mode worker exiting");
}

impl Dwc3 {
    pub(crate) fn switch_mode(&self, requested: UsbMode) -> Result<()> {
        if requested == UsbMode::Otg {
            return Err(Error::NotSupported);
        }

        let mut state = self.mode.lock().unwrap();
        if state.mode == requested {
            return Ok(());
        }
        log::info!("usb mode {:?} -> {:?}", state.mode, requested);

        match state.mode {
            UsbMode::Peripheral => {
                if let Err(e) = self.stop_peripheral_mode(&mut state) {
                    self.mode_rollback(&mut state);
                    return Err(e);
                }
            }
            UsbMode::Host => {
                if let Some((dev, seq)) = state.xhci_dev.take() {
                    self.host_bridge.remove_device(dev);
                    if requested == UsbMode::Peripheral {
                        log::info!("peripheral mode will start once the xhci child is released");
                        state.start_peripheral_on_release = Some(seq);
                        return Ok(());
                    }
                }
            }
            _ => {}
        }

        state.start_peripheral_on_release = None;
        if let Some(ums) = &self.mode_switch {
            if let Err(e) = ums.set_mode(requested) {
                log::error!("mode switch helper refused {:?}: {:?}", requested, e);
                self.mode_rollback(&mut state);
                return Err(e);
            }
        }

        let started = match requested {
            UsbMode::Peripheral => self.start_peripheral_mode(&mut state),
            UsbMode::Host => self.start_host_mode(&mut state),
            _ => Ok(()),
        };
        if let Err(e) = started {
            self.mode_rollback(&mut state);
            return Err(e);
        }

        state.mode = requested;
        Ok(())
    }

    /// Runs on the mode worker once the host bridge lets go of the xHCI child.
    pub(crate) fn xhci_release(&self, child: u64) {
        let mut state = self.mode.lock().unwrap();
        log::debug!("xhci child #{} released", child);
        if state.start_peripheral_on_release != Some(child) {
            return;
        }
        state.start_peripheral_on_release = None;
        match self.start_peripheral_mode(&mut state) {
            Ok(()) => state.mode = UsbMode::Peripheral,
            Err(e) => {
                log::error!("deferred peripheral start failed: {:?}", e);
                self.mode_rollback(&mut state);
            }
        }
    }

    fn mode_rollback(&self, state: &mut ModeState) {
        if let Some(ums) = &self.mode_switch {
            if let Err(e) = ums.set_mode(UsbMode::Inactive) {
                log::error!("mode switch helper failed to go inactive: {:?}", e);
            }
        }
        state.mode = UsbMode::Inactive;
    }

    fn start_peripheral_mode(&self, state: &mut ModeState) -> Result<()> {
        let irq = self.platform.map_interrupt(IRQ_USB3).map_err(|e| {
            log::error!("failed to map usb3 interrupt: {:?}", e);
            e
        })?;
        state.irq = Some(irq);

        {
            let regs = self.regs.lock().unwrap();
            let csr = &regs.csr;

            // PHYs: no suspend, fixed turnaround, LFPS filtering
            let phy2 = csr.zf(GUSB2PHYCFG_SUSPENDUSB20, csr.zf(GUSB2PHYCFG_USBTRDTIM, csr.r(GUSB2PHYCFG0)));
            csr.wo(GUSB2PHYCFG0, phy2 | csr.ms(GUSB2PHYCFG_USBTRDTIM, self.config.usb2_turnaround));
            let phy3 =
                csr.zf(GUSB3PIPECTL_SUSPENDENABLE, csr.zf(GUSB3PIPECTL_DELAYP1TRANS, csr.r(GUSB3PIPECTL0)));
            csr.wo(
                GUSB3PIPECTL0,
                phy3 | csr.ms(GUSB3PIPECTL_LFPSFILTER, 1) | csr.ms(GUSB3PIPECTL_SS_TX_DE_EMPHASIS, 1),
            );

            csr.wo(
                GCTL,
                csr.ms(GCTL_U2EXIT_LFPS, 1)
                    | csr.ms(GCTL_PRTCAPDIR, GCTL_PRTCAPDIR_DEVICE)
                    | csr.ms(GCTL_U2RSTECN, 1)
                    | csr.ms(GCTL_PWRDNSCALE, 2),
            );

            let mut dcfg = csr.r(DCFG);
            dcfg = csr.zf(DCFG_NUMP, dcfg) | csr.ms(DCFG_NUMP, self.config.num_packets);
            dcfg = csr.zf(DCFG_DEVSPD, dcfg) | csr.ms(DCFG_DEVSPD, self.config.max_speed.to_u32().unwrap_or(0));
            dcfg = csr.zf(DCFG_DEVADDR, dcfg);
            csr.wo(DCFG, dcfg);

            self.events.start(self.event_buffer.as_ref());
        }

        self.ep0.start();

        let regs = self.regs.lock().unwrap();
        regs.csr.wo(DCTL, regs.csr.ms(DCTL_RUN_STOP, 1));
        Ok(())
    }

    fn stop_peripheral_mode(&self, state: &mut ModeState) -> Result<()> {
        self.events.stop();
        state.irq = None;
        self.disconnected();
        self.halt()
    }

    /// Clear RUN_STOP and soft-reset the core, waiting for the reset to finish.
    ///
    /// The register lock is only held for each access, never across the sleeps.
    fn halt(&self) -> Result<()> {
        let reset_bit = {
            let regs = self.regs.lock().unwrap();
            let csr = &regs.csr;
            let dctl = csr.zf(DCTL_RUN_STOP, csr.r(DCTL)) | csr.ms(DCTL_CSFTRST, 1);
            csr.wo(DCTL, dctl);
            csr.ms(DCTL_CSFTRST, 1)
        };
        poll_bits(
            || self.regs.lock().unwrap().csr.r(DCTL),
            DCTL,
            reset_bit,
            0,
            self.config.poll_interval,
            self.config.poll_timeout,
        )
    }

    fn start_host_mode(&self, state: &mut ModeState) -> Result<()> {
        state.child_seq += 1;
        let seq = state.child_seq;
        {
            let regs = self.regs.lock().unwrap();
            let csr = &regs.csr;
            csr.wo(
                GCTL,
                csr.ms(GCTL_U2EXIT_LFPS, 1)
                    | csr.ms(GCTL_PRTCAPDIR, GCTL_PRTCAPDIR_HOST)
                    | csr.ms(GCTL_U2RSTECN, 1)
                    | csr.ms(GCTL_PWRDNSCALE, 2),
            );
        }

        let args = ChildDeviceArgs {
            name: "dwc3",
            proto_id: ProtocolId::PlatformDev,
            props: vec![
                DeviceProp { id: BIND_PLATFORM_DEV_VID, value: PDEV_VID_GENERIC },
                DeviceProp { id: BIND_PLATFORM_DEV_PID, value: PDEV_PID_GENERIC },
                DeviceProp { id: BIND_PLATFORM_DEV_DID, value: PDEV_DID_USB_XHCI },
            ],
            parent: self.platform.clone(),
            release: ReleaseToken::new(self.mode_tx.clone(), seq),
        };
        match self.host_bridge.add_device(args) {
            Ok(dev) => {
                log::debug!("xhci child {} (#{}) added", dev.id(), seq);
                state.xhci_dev = Some((dev, seq));
                Ok(())
            }
            Err(e) => {
                log::error!("failed to add xhci child device: {:?}", e);
                Err(e)
            }
        }
    }
}
