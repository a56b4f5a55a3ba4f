//! Recording stand-ins for the controller's collaborators, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use usb_device::endpoint::EndpointType;

use crate::api::*;
use crate::controller::{Collaborators, Dwc3, Dwc3Config};
use crate::platform::*;
use crate::regs::{DCTL, DCTL_CSFTRST};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ep0Init(usize),
    Ep0Start,
    Ep0Reset,
    Ep0Complete(u8),
    ConfigureEndpoint { ep_num: u8, ep_type: EndpointType, max_packet_size: u16, interval: u8, modify: bool },
    StartTransfer { ep_num: u8, length: usize },
    EndTransfer(u8),
    SetStall(u8),
    ClearStall(u8),
    EventsStart,
    EventsStop,
    MapInterrupt,
    InterruptDestroyed,
    InterruptDropped,
    AddDevice(&'static str),
    RemoveDevice(u64),
    Assist(UsbMode),
    Connected(bool),
    Speed(UsbSpeed),
}

/// Ordered log of every call made into the fakes.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);
impl Journal {
    pub fn push(&self, call: Call) { self.0.lock().unwrap().push(call) }

    pub fn calls(&self) -> Vec<Call> { self.0.lock().unwrap().clone() }

    pub fn clear(&self) { self.0.lock().unwrap().clear() }

    pub fn contains(&self, call: &Call) -> bool { self.0.lock().unwrap().contains(call) }

    pub fn count<F: Fn(&Call) -> bool>(&self, f: F) -> usize { self.0.lock().unwrap().iter().filter(|c| f(c)).count() }

    pub fn filter<F: Fn(&Call) -> bool>(&self, f: F) -> Vec<Call> {
        self.0.lock().unwrap().iter().filter(|c| f(c)).cloned().collect()
    }
}

/// Sparse register file. Bits marked self-clearing never stick, which is how the soft reset
/// bit behaves on real hardware once the reset is done.
#[derive(Default)]
pub struct FakeMmio {
    regs: Mutex<HashMap<usize, u32>>,
    self_clearing: Mutex<HashMap<usize, u32>>,
    writes: AtomicUsize,
}
impl FakeMmio {
    pub fn new() -> Self { FakeMmio::default() }

    pub fn self_clearing(&self, offset: usize, bits: u32) {
        *self.self_clearing.lock().unwrap().entry(offset).or_insert(0) |= bits;
    }

    pub fn stop_self_clearing(&self, offset: usize) { self.self_clearing.lock().unwrap().remove(&offset); }

    /// Set a register as the hardware would, without counting it as a driver write.
    pub fn poke(&self, offset: usize, value: u32) { self.regs.lock().unwrap().insert(offset, value); }

    pub fn peek(&self, offset: usize) -> u32 { self.regs.lock().unwrap().get(&offset).copied().unwrap_or(0) }

    pub fn write_count(&self) -> usize { self.writes.load(Ordering::SeqCst) }
}
impl Mmio for FakeMmio {
    fn read32(&self, offset: usize) -> u32 { self.peek(offset) }

    fn write32(&self, offset: usize, value: u32) {
        let clear = self.self_clearing.lock().unwrap().get(&offset).copied().unwrap_or(0);
        self.regs.lock().unwrap().insert(offset, value & !clear);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MmioWindow {
    mmio: Arc<FakeMmio>,
    live: Arc<AtomicUsize>,
}
impl Mmio for MmioWindow {
    fn read32(&self, offset: usize) -> u32 { self.mmio.read32(offset) }

    fn write32(&self, offset: usize, value: u32) { self.mmio.write32(offset, value) }
}
impl Drop for MmioWindow {
    fn drop(&mut self) { self.live.fetch_sub(1, Ordering::SeqCst); }
}

struct FakeBuffer {
    size: usize,
    phys: u64,
    live: Arc<AtomicUsize>,
    flushes: Arc<AtomicUsize>,
}
impl DmaBuffer for FakeBuffer {
    fn size(&self) -> usize { self.size }

    fn phys(&self) -> u64 { self.phys }

    fn cache_flush(&self, _offset: usize, _len: usize) { self.flushes.fetch_add(1, Ordering::SeqCst); }
}
impl Drop for FakeBuffer {
    fn drop(&mut self) { self.live.fetch_sub(1, Ordering::SeqCst); }
}

struct FakeInterrupt {
    journal: Journal,
}
impl Interrupt for FakeInterrupt {
    fn destroy(&self) { self.journal.push(Call::InterruptDestroyed) }
}
impl Drop for FakeInterrupt {
    fn drop(&mut self) { self.journal.push(Call::InterruptDropped) }
}

pub struct FakePlatform {
    journal: Journal,
    mmio: Arc<FakeMmio>,
    live_buffers: Arc<AtomicUsize>,
    live_windows: Arc<AtomicUsize>,
    flushes: Arc<AtomicUsize>,
    allocations: Mutex<Vec<(usize, BufferFlags)>>,
    next_phys: AtomicU64,
    alloc_budget: Mutex<Option<usize>>,
    fail_bti: AtomicBool,
    fail_mmio: AtomicBool,
    fail_interrupt: AtomicBool,
}
impl FakePlatform {
    fn new(journal: Journal, mmio: Arc<FakeMmio>) -> Self {
        FakePlatform {
            journal,
            mmio,
            live_buffers: Arc::new(AtomicUsize::new(0)),
            live_windows: Arc::new(AtomicUsize::new(0)),
            flushes: Arc::new(AtomicUsize::new(0)),
            allocations: Mutex::new(Vec::new()),
            next_phys: AtomicU64::new(0x8000_0000),
            alloc_budget: Mutex::new(None),
            fail_bti: AtomicBool::new(false),
            fail_mmio: AtomicBool::new(false),
            fail_interrupt: AtomicBool::new(false),
        }
    }

    pub fn fail_bti(&self, fail: bool) { self.fail_bti.store(fail, Ordering::SeqCst) }

    pub fn fail_mmio(&self, fail: bool) { self.fail_mmio.store(fail, Ordering::SeqCst) }

    pub fn fail_interrupt(&self, fail: bool) { self.fail_interrupt.store(fail, Ordering::SeqCst) }

    /// Let `count` more allocations succeed, then fail the rest.
    pub fn fail_alloc_after(&self, count: usize) { *self.alloc_budget.lock().unwrap() = Some(count) }

    pub fn live_buffers(&self) -> usize { self.live_buffers.load(Ordering::SeqCst) }

    pub fn live_windows(&self) -> usize { self.live_windows.load(Ordering::SeqCst) }

    pub fn flushes(&self) -> usize { self.flushes.load(Ordering::SeqCst) }

    pub fn allocations(&self) -> Vec<(usize, BufferFlags)> { self.allocations.lock().unwrap().clone() }
}
impl Platform for FakePlatform {
    fn map_mmio(&self, _index: u32) -> Result<Arc<dyn Mmio>> {
        if self.fail_mmio.load(Ordering::SeqCst) {
            return Err(Error::NoResources);
        }
        self.live_windows.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MmioWindow { mmio: self.mmio.clone(), live: self.live_windows.clone() }))
    }

    fn map_interrupt(&self, _index: u32) -> Result<Box<dyn Interrupt>> {
        if self.fail_interrupt.load(Ordering::SeqCst) {
            return Err(Error::NoResources);
        }
        self.journal.push(Call::MapInterrupt);
        Ok(Box::new(FakeInterrupt { journal: self.journal.clone() }))
    }

    fn get_bti(&self, _index: u32) -> Result<Bti> {
        if self.fail_bti.load(Ordering::SeqCst) {
            return Err(Error::NoResources);
        }
        Ok(Bti(7))
    }

    fn alloc_buffer(&self, _bti: Bti, size: usize, flags: BufferFlags) -> Result<Box<dyn DmaBuffer>> {
        if let Some(budget) = self.alloc_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(Error::NoResources);
            }
            *budget -= 1;
        }
        self.allocations.lock().unwrap().push((size, flags));
        self.live_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBuffer {
            size,
            phys: self.next_phys.fetch_add(0x1_0000, Ordering::SeqCst),
            live: self.live_buffers.clone(),
            flushes: self.flushes.clone(),
        }))
    }
}

pub struct FakeEp0 {
    journal: Journal,
    fail_init: AtomicBool,
}
impl FakeEp0 {
    pub fn fail_init(&self, fail: bool) { self.fail_init.store(fail, Ordering::SeqCst) }
}
impl Ep0Engine for FakeEp0 {
    fn init(&self, buffer: &dyn DmaBuffer) -> Result<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(Error::NoResources);
        }
        self.journal.push(Call::Ep0Init(buffer.size()));
        Ok(())
    }

    fn start(&self) { self.journal.push(Call::Ep0Start) }

    fn reset(&self) { self.journal.push(Call::Ep0Reset) }

    fn transfer_complete(&self, ep_num: u8) { self.journal.push(Call::Ep0Complete(ep_num)) }
}

pub struct FakeCommands {
    journal: Journal,
    fail_start: AtomicBool,
}
impl FakeCommands {
    pub fn fail_start_transfers(&self, fail: bool) { self.fail_start.store(fail, Ordering::SeqCst) }
}
impl EpCommands for FakeCommands {
    fn configure_endpoint(
        &self,
        ep_num: u8,
        ep_type: EndpointType,
        max_packet_size: u16,
        interval: u8,
        modify: bool,
    ) -> Result<()> {
        self.journal.push(Call::ConfigureEndpoint { ep_num, ep_type, max_packet_size, interval, modify });
        Ok(())
    }

    fn start_transfer(&self, ep_num: u8, _trb_phys: u64, length: usize) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::BadState);
        }
        self.journal.push(Call::StartTransfer { ep_num, length });
        Ok(())
    }

    fn end_transfer(&self, ep_num: u8) { self.journal.push(Call::EndTransfer(ep_num)) }

    fn set_stall(&self, ep_num: u8) { self.journal.push(Call::SetStall(ep_num)) }

    fn clear_stall(&self, ep_num: u8) { self.journal.push(Call::ClearStall(ep_num)) }
}

pub struct FakeEvents {
    journal: Journal,
}
impl EventRing for FakeEvents {
    fn start(&self, _buffer: &dyn DmaBuffer) { self.journal.push(Call::EventsStart) }

    fn stop(&self) { self.journal.push(Call::EventsStop) }
}

pub struct FakeAssist {
    journal: Journal,
    fail: AtomicBool,
}
impl FakeAssist {
    pub fn fail(&self, fail: bool) { self.fail.store(fail, Ordering::SeqCst) }
}
impl UsbModeSwitch for FakeAssist {
    fn set_mode(&self, mode: UsbMode) -> Result<()> {
        self.journal.push(Call::Assist(mode));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::BadState);
        }
        Ok(())
    }
}

pub struct FakeClient {
    journal: Journal,
}
impl UsbDciInterface for FakeClient {
    fn set_connected(&self, connected: bool) { self.journal.push(Call::Connected(connected)) }

    fn set_speed(&self, speed: UsbSpeed) { self.journal.push(Call::Speed(speed)) }
}

/// What the last published child was given.
pub struct ChildSnapshot {
    pub proto_id: ProtocolId,
    pub props: Vec<DeviceProp>,
    pub parent: Arc<dyn Platform>,
}

/// Keeps each child's release token until told to let go, like a host bridge whose xHCI
/// driver takes a while to unbind.
pub struct FakeHostBridge {
    journal: Journal,
    next_id: AtomicU64,
    live: Mutex<Vec<(u64, ChildDeviceArgs)>>,
    removing: Mutex<Vec<(u64, ChildDeviceArgs)>>,
    last: Mutex<Option<ChildSnapshot>>,
    removed: AtomicUsize,
    fail_add: AtomicBool,
    release_on_remove: bool,
}
impl FakeHostBridge {
    fn new(journal: Journal, release_on_remove: bool) -> Self {
        FakeHostBridge {
            journal,
            next_id: AtomicU64::new(1),
            live: Mutex::new(Vec::new()),
            removing: Mutex::new(Vec::new()),
            last: Mutex::new(None),
            removed: AtomicUsize::new(0),
            fail_add: AtomicBool::new(false),
            release_on_remove,
        }
    }

    pub fn fail_add(&self, fail: bool) { self.fail_add.store(fail, Ordering::SeqCst) }

    /// Drop every release token still held.
    pub fn release_all(&self) {
        let removing: Vec<(u64, ChildDeviceArgs)> = self.removing.lock().unwrap().drain(..).collect();
        let live: Vec<(u64, ChildDeviceArgs)> = self.live.lock().unwrap().drain(..).collect();
        drop(removing);
        drop(live);
    }

    /// Drop the release token of one child that is being removed.
    pub fn release(&self, id: u64) {
        let args = {
            let mut removing = self.removing.lock().unwrap();
            let pos = removing.iter().position(|(child, _)| *child == id);
            pos.map(|pos| removing.remove(pos).1)
        };
        drop(args);
    }

    /// Children that were removed but still hold their release token.
    pub fn removing_children(&self) -> usize { self.removing.lock().unwrap().len() }

    pub fn live_children(&self) -> usize { self.live.lock().unwrap().len() }

    pub fn removed(&self) -> usize { self.removed.load(Ordering::SeqCst) }

    pub fn last_args(&self) -> Option<ChildSnapshot> { self.last.lock().unwrap().take() }
}
impl HostBridge for FakeHostBridge {
    fn add_device(&self, args: ChildDeviceArgs) -> Result<ChildDevice> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(Error::NoResources);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.journal.push(Call::AddDevice(args.name));
        *self.last.lock().unwrap() =
            Some(ChildSnapshot { proto_id: args.proto_id, props: args.props.clone(), parent: args.parent.clone() });
        self.live.lock().unwrap().push((id, args));
        Ok(ChildDevice::new(id))
    }

    fn remove_device(&self, dev: ChildDevice) {
        self.journal.push(Call::RemoveDevice(dev.id()));
        self.removed.fetch_add(1, Ordering::SeqCst);
        let child = {
            let mut live = self.live.lock().unwrap();
            let pos = live.iter().position(|(id, _)| *id == dev.id());
            pos.map(|pos| live.remove(pos))
        };
        if let Some((id, args)) = child {
            if self.release_on_remove {
                args.release.release();
            } else {
                self.removing.lock().unwrap().push((id, args));
            }
        }
    }
}

/// Every fake, wired to one journal.
pub struct Fakes {
    pub journal: Journal,
    pub mmio: Arc<FakeMmio>,
    pub platform: Arc<FakePlatform>,
    pub ep0: Arc<FakeEp0>,
    pub commands: Arc<FakeCommands>,
    pub events: Arc<FakeEvents>,
    pub bridge: Arc<FakeHostBridge>,
    pub assist: Option<Arc<FakeAssist>>,
}
impl Fakes {
    pub fn new() -> Self { Fakes::with(false, false) }

    fn with(assist: bool, release_on_remove: bool) -> Self {
        let journal = Journal::default();
        let mmio = Arc::new(FakeMmio::new());
        mmio.self_clearing(DCTL.offset(), DCTL_CSFTRST.mask() << DCTL_CSFTRST.offset());
        Fakes {
            platform: Arc::new(FakePlatform::new(journal.clone(), mmio.clone())),
            ep0: Arc::new(FakeEp0 { journal: journal.clone(), fail_init: AtomicBool::new(false) }),
            commands: Arc::new(FakeCommands { journal: journal.clone(), fail_start: AtomicBool::new(false) }),
            events: Arc::new(FakeEvents { journal: journal.clone() }),
            bridge: Arc::new(FakeHostBridge::new(journal.clone(), release_on_remove)),
            assist: if assist {
                Some(Arc::new(FakeAssist { journal: journal.clone(), fail: AtomicBool::new(false) }))
            } else {
                None
            },
            mmio,
            journal,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            platform: self.platform.clone(),
            mode_switch: self.assist.clone().map(|a| a as Arc<dyn UsbModeSwitch>),
            ep0: self.ep0.clone(),
            commands: self.commands.clone(),
            events: self.events.clone(),
            host_bridge: self.bridge.clone(),
        }
    }
}

/// A bound controller plus handles on all of its fakes. The journal starts out empty.
pub struct TestBed {
    pub dwc: Arc<Dwc3>,
    pub journal: Journal,
    pub mmio: Arc<FakeMmio>,
    pub platform: Arc<FakePlatform>,
    pub commands: Arc<FakeCommands>,
    pub bridge: Arc<FakeHostBridge>,
    pub client: Arc<FakeClient>,
    assist: Option<Arc<FakeAssist>>,
}
impl TestBed {
    pub fn new() -> Self { TestBed::builder().build() }

    pub fn builder() -> TestBedBuilder {
        TestBedBuilder { config: Dwc3Config::default(), assist: false, release_on_remove: false }
    }

    pub fn attach_client(&self) {
        UsbDci::set_interface(&*self.dwc, self.client.clone()).unwrap();
    }

    pub fn assist(&self) -> &FakeAssist { self.assist.as_deref().expect("test bed built without an assist") }
}

pub struct TestBedBuilder {
    config: Dwc3Config,
    assist: bool,
    release_on_remove: bool,
}
impl TestBedBuilder {
    pub fn num_endpoints(mut self, count: usize) -> Self {
        self.config.num_endpoints = count;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn with_assist(mut self) -> Self {
        self.assist = true;
        self
    }

    /// Have the host bridge drop the release token from inside `remove_device`.
    pub fn release_on_remove(mut self) -> Self {
        self.release_on_remove = true;
        self
    }

    pub fn build(self) -> TestBed {
        let fakes = Fakes::with(self.assist, self.release_on_remove);
        let dwc = Dwc3::bind(fakes.collaborators(), self.config).unwrap();
        fakes.journal.clear();
        TestBed {
            dwc,
            client: Arc::new(FakeClient { journal: fakes.journal.clone() }),
            journal: fakes.journal,
            mmio: fakes.mmio,
            platform: fakes.platform,
            commands: fakes.commands,
            bridge: fakes.bridge,
            assist: fakes.assist,
        }
    }
}

pub fn bulk_desc(ep_address: u8, max_packet: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        b_endpoint_address: ep_address,
        bm_attributes: 0x02,
        w_max_packet_size: max_packet,
        b_interval: 0,
    }
}

/// Collects request completions, tagged with an id chosen by the test.
#[derive(Clone, Default)]
pub struct Completed(Arc<Mutex<Vec<(u32, Result<()>, usize)>>>);
impl Completed {
    pub fn new() -> Self { Completed::default() }

    pub fn record(&self, id: u32, status: Result<()>, actual: usize) {
        self.0.lock().unwrap().push((id, status, actual))
    }

    pub fn request(&self, id: u32, ep_address: u8, length: usize) -> UsbRequest {
        let done = self.clone();
        UsbRequest::new(ep_address, length, move |status, actual| done.record(id, status, actual))
    }

    /// Everything completed so far, in completion order. Clears the record.
    pub fn take(&self) -> Vec<(u32, Result<()>, usize)> { self.0.lock().unwrap().drain(..).collect() }

    pub fn ids(&self) -> Vec<u32> { self.0.lock().unwrap().iter().map(|(id, _, _)| *id).collect() }
}
