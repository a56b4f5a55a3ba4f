use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

use crate::api::{EndpointDescriptor, SsEpCompDescriptor, UsbRequest};
use crate::controller::Dwc3;
use crate::platform::{BufferFlags, DmaBuffer};
use crate::regs::DALEPENA;
use crate::{Error, Result, EP_FIFO_SIZE};

pub const EP0_OUT: u8 = 0;
pub const EP0_IN: u8 = 1;

/// Physical endpoint number for a USB endpoint address: OUT endpoints are even, IN are odd.
///
/// Reserved address bits 4..=6 are ignored.
pub fn ep_num(ep_address: u8) -> u8 {
    let addr = EndpointAddress::from(ep_address);
    (((addr.index() & 0xF) as u8) << 1) | if addr.is_in() { 1 } else { 0 }
}

/// A physical endpoint number that has been checked against the non-control range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct EpIndex(u8);
impl EpIndex {
    pub(crate) fn num(self) -> u8 { self.0 }
}

struct Completion {
    req: UsbRequest,
    status: Result<()>,
    actual: usize,
}

pub(crate) struct Endpoint {
    ep_num: u8,
    address: EndpointAddress,
    ep_type: EndpointType,
    max_packet_size: u16,
    interval: u8,
    max_burst: u8,
    enabled: bool,
    stalled: bool,
    queued_reqs: VecDeque<UsbRequest>,
    /// Request the hardware currently owns. Whoever takes it out completes it.
    current_req: Option<UsbRequest>,
    /// TRB ring, allocated on first configure and kept until teardown
    fifo: Option<Box<dyn DmaBuffer>>,
    /// Finished requests waiting for their callbacks, in retirement order
    completions: VecDeque<Completion>,
    /// Set while some thread is running this endpoint's callbacks
    completing: bool,
}
impl Endpoint {
    fn new(ep_num: u8) -> Self {
        let dir = if ep_num & 1 != 0 { UsbDirection::In } else { UsbDirection::Out };
        Endpoint {
            ep_num,
            address: EndpointAddress::from_parts((ep_num >> 1) as usize, dir),
            ep_type: if ep_num < 2 { EndpointType::Control } else { EndpointType::Bulk },
            max_packet_size: 0,
            interval: 0,
            max_burst: 0,
            enabled: false,
            stalled: false,
            queued_reqs: VecDeque::new(),
            current_req: None,
            fifo: None,
            completions: VecDeque::new(),
            completing: false,
        }
    }

    fn retire(&mut self, req: UsbRequest, status: Result<()>, actual: usize) {
        self.completions.push_back(Completion { req, status, actual });
    }
}

/// Snapshot of an endpoint record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub ep_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
    pub max_burst: u8,
    pub enabled: bool,
    pub stalled: bool,
    pub active: bool,
    pub queued: usize,
}

/// Arena of endpoint records indexed by physical endpoint number.
pub(crate) struct EndpointStore {
    eps: Vec<Mutex<Endpoint>>,
}
impl EndpointStore {
    pub(crate) fn new(count: usize) -> Self {
        EndpointStore { eps: (0..count as u8).map(|i| Mutex::new(Endpoint::new(i))).collect() }
    }

    pub(crate) fn len(&self) -> usize { self.eps.len() }

    /// Accepts only non-control endpoints that exist on this core.
    pub(crate) fn index(&self, ep_num: u8) -> Result<EpIndex> {
        if ep_num < 2 || ep_num as usize >= self.eps.len() {
            return Err(Error::InvalidArgs);
        }
        Ok(EpIndex(ep_num))
    }

    pub(crate) fn index_for_address(&self, ep_address: u8) -> Result<EpIndex> { self.index(ep_num(ep_address)) }

    pub(crate) fn non_control(&self) -> impl Iterator<Item = EpIndex> {
        (2..self.eps.len() as u8).map(EpIndex)
    }

    pub(crate) fn lock(&self, index: EpIndex) -> MutexGuard<'_, Endpoint> {
        self.eps[index.0 as usize].lock().unwrap()
    }

    /// Unchecked access, for EP0 and teardown.
    pub(crate) fn lock_raw(&self, ep_num: u8) -> Option<MutexGuard<'_, Endpoint>> {
        self.eps.get(ep_num as usize).map(|ep| ep.lock().unwrap())
    }
}

impl Dwc3 {
    pub(crate) fn ep_config(
        &self,
        ep_desc: &EndpointDescriptor,
        ss_comp_desc: Option<&SsEpCompDescriptor>,
    ) -> Result<()> {
        let index = self.eps.index_for_address(ep_desc.b_endpoint_address)?;
        let ep_type = ep_desc.ep_type();
        if ep_type == EndpointType::Isochronous {
            log::error!("isochronous endpoints are not supported");
            return Err(Error::NotSupported);
        }

        // allocate outside the endpoint lock; a racing configure may beat us to it
        let fifo = if self.eps.lock(index).fifo.is_none() {
            let fifo = self.platform.alloc_buffer(self.bti, EP_FIFO_SIZE, BufferFlags::RW | BufferFlags::CONTIG)?;
            fifo.cache_flush(0, EP_FIFO_SIZE);
            Some(fifo)
        } else {
            None
        };

        {
            let mut ep = self.eps.lock(index);
            if ep.fifo.is_none() {
                ep.fifo = fifo;
            }
            ep.ep_type = ep_type;
            ep.max_packet_size = ep_desc.max_packet();
            ep.interval = ep_desc.b_interval;
            ep.max_burst = ss_comp_desc.map(|c| c.b_max_burst).unwrap_or(0);

            self.commands.configure_endpoint(index.num(), ep_type, ep.max_packet_size, ep.interval, false)?;
            self.ep_enable(index.num(), true);
            ep.enabled = true;
            log::debug!(
                "ep{} configured: {:?} mps {} interval {}",
                index.num(),
                ep_type,
                ep.max_packet_size,
                ep.interval
            );
            self.queue_next_locked(&mut ep);
        }
        self.ep_finish(index);
        Ok(())
    }

    pub(crate) fn ep_disable(&self, ep_address: u8) -> Result<()> {
        let index = self.eps.index_for_address(ep_address)?;
        let mut ep = self.eps.lock(index);
        self.ep_enable(index.num(), false);
        ep.enabled = false;
        ep.stalled = false;
        Ok(())
    }

    pub(crate) fn ep_stall(&self, ep_num: u8, stall: bool) -> Result<()> {
        let index = self.eps.index(ep_num)?;
        {
            let mut ep = self.eps.lock(index);
            if !ep.enabled {
                return Err(Error::BadState);
            }
            if stall && !ep.stalled {
                self.commands.set_stall(ep_num);
            } else if !stall && ep.stalled {
                self.commands.clear_stall(ep_num);
            }
            ep.stalled = stall;
            if !stall {
                self.queue_next_locked(&mut ep);
            }
        }
        self.ep_finish(index);
        Ok(())
    }

    /// Forget that the endpoint was enabled, without touching DALEPENA.
    pub(crate) fn ep_mark_disabled(&self, index: EpIndex) {
        let mut ep = self.eps.lock(index);
        ep.enabled = false;
        ep.stalled = false;
    }

    /// Drop a stall left over from before a reset, regardless of whether the endpoint is enabled.
    pub(crate) fn ep_reset_stall(&self, index: EpIndex) {
        let mut ep = self.eps.lock(index);
        if ep.stalled {
            self.commands.clear_stall(index.num());
            ep.stalled = false;
        }
    }

    pub(crate) fn ep_queue(&self, req: UsbRequest) {
        let index = match self.eps.index_for_address(req.ep_address) {
            Ok(index) => index,
            Err(e) => {
                log::error!("request_queue: bad ep address {:#04x}", req.ep_address);
                req.complete(Err(e), 0);
                return;
            }
        };
        log::trace!("request_queue ep{} len {}", index.num(), req.length);
        {
            let mut ep = self.eps.lock(index);
            ep.queued_reqs.push_back(req);
            self.queue_next_locked(&mut ep);
        }
        self.ep_finish(index);
    }

    /// Cancel the in-flight request and everything queued behind it, completing each with
    /// `reason` in submission order.
    pub(crate) fn ep_end_transfers(&self, index: EpIndex, reason: Error) {
        {
            let mut ep = self.eps.lock(index);
            if let Some(req) = ep.current_req.take() {
                self.commands.end_transfer(index.num());
                ep.retire(req, Err(reason), 0);
            }
            while let Some(req) = ep.queued_reqs.pop_front() {
                ep.retire(req, Err(reason), 0);
            }
        }
        self.ep_finish(index);
    }

    /// Hardware retired the in-flight transfer on a non-control endpoint.
    pub(crate) fn ep_transfer_complete(&self, ep_num: u8, status: Result<()>, actual: usize) {
        let index = match self.eps.index(ep_num) {
            Ok(index) => index,
            Err(_) => {
                log::error!("transfer complete on bad endpoint {}", ep_num);
                return;
            }
        };
        {
            let mut ep = self.eps.lock(index);
            match ep.current_req.take() {
                Some(req) => ep.retire(req, status, actual),
                // already claimed by end_transfers
                None => log::debug!("ep{}: completion with no request in flight", ep_num),
            }
            self.queue_next_locked(&mut ep);
        }
        self.ep_finish(index);
    }

    pub(crate) fn ep_fifo_release(&self, ep_num: u8) {
        if let Some(mut ep) = self.eps.lock_raw(ep_num) {
            ep.fifo.take();
        }
    }

    pub(crate) fn ep0_set_max_packet(&self, max_packet_size: u16) {
        for num in [EP0_OUT, EP0_IN] {
            if let Some(mut ep) = self.eps.lock_raw(num) {
                ep.max_packet_size = max_packet_size;
            }
        }
    }

    pub fn endpoint_info(&self, ep_num: u8) -> Option<EndpointInfo> {
        self.eps.lock_raw(ep_num).map(|ep| EndpointInfo {
            address: u8::from(ep.address),
            ep_type: ep.ep_type,
            max_packet_size: ep.max_packet_size,
            interval: ep.interval,
            max_burst: ep.max_burst,
            enabled: ep.enabled,
            stalled: ep.stalled,
            active: ep.current_req.is_some(),
            queued: ep.queued_reqs.len(),
        })
    }

    fn ep_enable(&self, ep_num: u8, enable: bool) {
        let regs = self.regs.lock().unwrap();
        let value = regs.csr.r(DALEPENA);
        let bit = 1 << ep_num;
        regs.csr.wo(DALEPENA, if enable { value | bit } else { value & !bit });
    }

    /// Hand queued requests to the hardware while the endpoint can take them.
    fn queue_next_locked(&self, ep: &mut Endpoint) {
        while ep.current_req.is_none() && ep.enabled && !ep.stalled {
            let Some(req) = ep.queued_reqs.pop_front() else {
                break;
            };
            let trb_phys = ep.fifo.as_ref().map(|f| f.phys()).unwrap_or(0);
            match self.commands.start_transfer(ep.ep_num, trb_phys, req.length) {
                Ok(()) => ep.current_req = Some(req),
                Err(e) => {
                    log::error!("ep{}: start transfer failed: {:?}", ep.ep_num, e);
                    ep.retire(req, Err(e), 0);
                }
            }
        }
    }

    /// Run pending callbacks with no lock held. Only one thread drains a given endpoint at a
    /// time, so callbacks fire in retirement order even when several paths retire requests
    /// concurrently; callbacks may queue new requests on the same endpoint.
    fn ep_finish(&self, index: EpIndex) {
        let slot = &self.eps.eps[index.0 as usize];
        {
            let mut ep = slot.lock().unwrap();
            if ep.completing || ep.completions.is_empty() {
                return;
            }
            ep.completing = true;
        }
        loop {
            let next = {
                let mut ep = slot.lock().unwrap();
                match ep.completions.pop_front() {
                    Some(c) => c,
                    None => {
                        ep.completing = false;
                        return;
                    }
                }
            };
            next.req.complete(next.status, next.actual);
        }
    }
}
