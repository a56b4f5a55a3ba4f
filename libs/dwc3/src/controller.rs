use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};

use crate::api::*;
use crate::endpoint::{ep_num, EndpointStore, EP0_IN, EP0_OUT};
use crate::mode::{mode_worker, ModeMessage, ModeState};
use crate::platform::*;
use crate::regs::{Csr, HwSpeed};
use crate::{Error, Result, BTI_USB3, DWC3_MAX_EPS, EVENT_BUFFER_SIZE, MMIO_USB3OTG};

/// Runtime knobs, fixed at bind.
#[derive(Debug, Copy, Clone)]
pub struct Dwc3Config {
    /// DCFG.NUMP: receive buffers the core advertises per burst
    pub num_packets: u32,
    /// Fastest speed the device side will negotiate
    pub max_speed: HwSpeed,
    /// GUSB2PHYCFG.USBTRDTIM, in PHY clocks
    pub usb2_turnaround: u32,
    pub poll_interval: Duration,
    /// Upper bound on any register poll, such as waiting out a core soft reset
    pub poll_timeout: Duration,
    /// Physical endpoints implemented by this instance of the core, EP0 pair included
    pub num_endpoints: usize,
}
impl Default for Dwc3Config {
    fn default() -> Self {
        Dwc3Config {
            num_packets: 16,
            max_speed: HwSpeed::Super,
            usb2_turnaround: 9,
            poll_interval: Duration::from_millis(1),
            poll_timeout: Duration::from_millis(100),
            num_endpoints: DWC3_MAX_EPS,
        }
    }
}

/// External services the controller is bound to.
pub struct Collaborators {
    pub platform: Arc<dyn Platform>,
    /// Board helper that switches an external mux or VBUS; optional
    pub mode_switch: Option<Arc<dyn UsbModeSwitch>>,
    pub ep0: Arc<dyn Ep0Engine>,
    pub commands: Arc<dyn EpCommands>,
    pub events: Arc<dyn EventRing>,
    pub host_bridge: Arc<dyn HostBridge>,
}

/// Device events, as decoded from the event ring by the interrupt path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    Disconnected,
    UsbReset,
    ConnectionDone,
    TransferComplete { ep_num: u8, status: Result<()>, actual: usize },
}

/// State guarded by the register lock.
pub(crate) struct HwState {
    pub(crate) csr: Csr,
    pub(crate) speed: UsbSpeed,
    pub(crate) ep0_state: Ep0State,
}

pub struct Dwc3 {
    pub(crate) config: Dwc3Config,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) mode_switch: Option<Arc<dyn UsbModeSwitch>>,
    pub(crate) ep0: Arc<dyn Ep0Engine>,
    pub(crate) commands: Arc<dyn EpCommands>,
    pub(crate) events: Arc<dyn EventRing>,
    pub(crate) host_bridge: Arc<dyn HostBridge>,
    pub(crate) bti: Bti,
    pub(crate) event_buffer: Box<dyn DmaBuffer>,
    #[allow(dead_code)] // owned for the EP0 engine's DMA
    ep0_buffer: Box<dyn DmaBuffer>,
    /// Coarse lock, held across a whole role transition
    pub(crate) mode: Mutex<ModeState>,
    pub(crate) regs: Mutex<HwState>,
    pub(crate) eps: EndpointStore,
    dci_intf: Mutex<Option<Arc<dyn UsbDciInterface>>>,
    pub(crate) mode_tx: Sender<ModeMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dwc3 {
    /// Acquire the controller's resources and start its mode worker. The controller comes up
    /// Inactive. On failure everything acquired so far is released again.
    pub fn bind(collab: Collaborators, config: Dwc3Config) -> Result<Arc<Dwc3>> {
        log::info!("dwc3 bind");
        if config.num_endpoints < 2 || config.num_endpoints > DWC3_MAX_EPS {
            return Err(Error::InvalidArgs);
        }
        let platform = collab.platform;

        let bti = platform.get_bti(BTI_USB3).map_err(|e| {
            log::error!("dwc3 bind: get_bti failed: {:?}", e);
            e
        })?;
        let mmio = platform.map_mmio(MMIO_USB3OTG).map_err(|e| {
            log::error!("dwc3 bind: map_mmio failed: {:?}", e);
            e
        })?;
        let event_buffer = platform
            .alloc_buffer(bti, EVENT_BUFFER_SIZE, BufferFlags::RO | BufferFlags::CONTIG)
            .map_err(|e| {
                log::error!("dwc3 bind: event buffer allocation failed: {:?}", e);
                e
            })?;
        event_buffer.cache_flush(0, EVENT_BUFFER_SIZE);
        let ep0_buffer = platform
            .alloc_buffer(bti, u16::MAX as usize, BufferFlags::RW | BufferFlags::CONTIG)
            .map_err(|e| {
                log::error!("dwc3 bind: ep0 buffer allocation failed: {:?}", e);
                e
            })?;
        collab.ep0.init(ep0_buffer.as_ref()).map_err(|e| {
            log::error!("dwc3 bind: ep0 init failed: {:?}", e);
            e
        })?;

        let (mode_tx, mode_rx) = unbounded();
        let dwc = Arc::new(Dwc3 {
            config,
            platform,
            mode_switch: collab.mode_switch,
            ep0: collab.ep0,
            commands: collab.commands,
            events: collab.events,
            host_bridge: collab.host_bridge,
            bti,
            event_buffer,
            ep0_buffer,
            mode: Mutex::new(ModeState::new()),
            regs: Mutex::new(HwState { csr: Csr::new(mmio), speed: UsbSpeed::Undefined, ep0_state: Ep0State::None }),
            eps: EndpointStore::new(config.num_endpoints),
            dci_intf: Mutex::new(None),
            mode_tx,
            worker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&dwc);
        let worker = thread::Builder::new()
            .name("dwc3 mode".into())
            .spawn(move || mode_worker(weak, mode_rx))
            .map_err(|e| {
                log::error!("dwc3 bind: couldn't start mode worker: {:?}", e);
                Error::NoResources
            })?;
        *dwc.worker.lock().unwrap() = Some(worker);
        Ok(dwc)
    }

    /// Cancel anything waiting on the interrupt and stop the mode worker.
    pub fn unbind(&self) {
        log::info!("dwc3 unbind");
        if let Some(irq) = &self.mode.lock().unwrap().irq {
            irq.destroy();
        }
        self.stop_worker();
    }

    /// Block until the mode worker has handled every message queued so far.
    pub fn sync_mode_worker(&self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.mode_tx.send(ModeMessage::Sync(tx)).is_ok() {
            rx.recv().ok();
        }
    }

    fn stop_worker(&self) {
        self.mode_tx.send(ModeMessage::Quit).ok();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            // the worker may be dropping the last reference itself
            if worker.thread().id() != thread::current().id() {
                worker.join().ok();
            }
        }
    }

    pub fn get_protocol(&self, proto_id: ProtocolId) -> Result<Protocol<'_>> {
        match proto_id {
            ProtocolId::UsbDci => Ok(Protocol::Dci(self)),
            ProtocolId::UsbModeSwitch => Ok(Protocol::ModeSwitch(self)),
            _ => Err(Error::NotSupported),
        }
    }

    /// Entry point for the interrupt path.
    pub fn handle_event(&self, event: Event) {
        log::trace!("event {:?}", event);
        match event {
            Event::Disconnected => self.disconnected(),
            Event::UsbReset => self.usb_reset(),
            Event::ConnectionDone => self.connection_done(),
            Event::TransferComplete { ep_num, status, actual } => {
                if ep_num == EP0_OUT || ep_num == EP0_IN {
                    self.ep0.transfer_complete(ep_num);
                } else {
                    self.ep_transfer_complete(ep_num, status, actual);
                }
            }
        }
    }

    pub fn mode(&self) -> UsbMode { self.mode.lock().unwrap().mode }

    /// True while a switch from host to peripheral waits on the xHCI child's release.
    pub fn is_peripheral_start_deferred(&self) -> bool {
        self.mode.lock().unwrap().start_peripheral_on_release.is_some()
    }

    pub fn speed(&self) -> UsbSpeed { self.regs.lock().unwrap().speed }

    pub fn ep0_state(&self) -> Ep0State { self.regs.lock().unwrap().ep0_state }

    pub fn set_ep0_state(&self, state: Ep0State) { self.regs.lock().unwrap().ep0_state = state; }

    pub fn config(&self) -> &Dwc3Config { &self.config }

    pub(crate) fn interface(&self) -> Option<Arc<dyn UsbDciInterface>> { self.dci_intf.lock().unwrap().clone() }
}

impl Drop for Dwc3 {
    fn drop(&mut self) {
        for index in self.eps.non_control() {
            self.ep_end_transfers(index, Error::IoNotPresent);
        }
        for ep_num in 0..self.eps.len() as u8 {
            self.ep_fifo_release(ep_num);
        }
        self.stop_worker();
        log::debug!("dwc3 released");
    }
}

impl UsbDci for Dwc3 {
    fn request_queue(&self, req: UsbRequest) { self.ep_queue(req) }

    fn set_interface(&self, intf: Arc<dyn UsbDciInterface>) -> Result<()> {
        *self.dci_intf.lock().unwrap() = Some(intf);
        Ok(())
    }

    fn config_ep(&self, ep_desc: &EndpointDescriptor, ss_comp_desc: Option<&SsEpCompDescriptor>) -> Result<()> {
        self.ep_config(ep_desc, ss_comp_desc)
    }

    fn disable_ep(&self, ep_address: u8) -> Result<()> { self.ep_disable(ep_address) }

    fn ep_set_stall(&self, ep_address: u8) -> Result<()> { self.ep_stall(ep_num(ep_address), true) }

    fn ep_clear_stall(&self, ep_address: u8) -> Result<()> { self.ep_stall(ep_num(ep_address), false) }

    fn get_bti(&self) -> Bti { self.bti }
}

impl UsbModeSwitch for Dwc3 {
    fn set_mode(&self, mode: UsbMode) -> Result<()> { self.switch_mode(mode) }
}
