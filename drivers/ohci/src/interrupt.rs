//! Interrupt transfers
//!
//! Asynchronous interrupt transfers are registered once and then serviced
//! by [`OhciController::house_keeper`], which the embedding environment
//! calls periodically. Each registration owns one ED on the periodic tree,
//! its TD chain and a mapped receive buffer, all recorded in an
//! [`InterruptContext`] held by the controller's [`InterruptRegistry`].
//!
//! Synchronous interrupt transfers use the same schedule path but are torn
//! down before returning and never enter the registry.

use alloc::{boxed::Box, vec, vec::Vec};
use core::fmt;

use log::{debug, info, warn};

use crate::{
    controller::OhciController,
    descriptor::{Ed, EdDirection, Td, TdPid},
    ed::{ListKind, PeriodicSchedule},
    error::{OhciError, OhciResult},
    platform::{BusAddr, DmaMapping, MapOperation, OhciPlatform},
    regs::{control, interrupt},
    transfer::{check_toggle, transfer_outcome, MAX_BYTES_PER_TD},
    usb::{endpoint_is_in, endpoint_number, Completion, UsbResult, UsbSpeed},
};

/// Completion handler for an asynchronous interrupt transfer
///
/// Receives the bytes that arrived and the bus-level result of the round.
/// Anything the handler needs is captured by the closure.
pub type InterruptCallback = Box<dyn FnMut(&[u8], UsbResult) + Send>;

/// Bookkeeping for one live asynchronous interrupt transfer
pub struct InterruptContext {
    pub(crate) device_address: u8,
    pub(crate) endpoint_address: u8,
    pub(crate) ed: BusAddr,
    pub(crate) td_head: BusAddr,
    pub(crate) speed: UsbSpeed,
    pub(crate) max_packet: u16,
    pub(crate) interval: u8,
    callback: InterruptCallback,
    pub(crate) periodic: bool,
    mapping: DmaMapping,
    buffer: Vec<u8>,
    /// Toggle the current round of TDs started with
    pub(crate) toggle: u8,
}

impl fmt::Debug for InterruptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptContext")
            .field("device_address", &self.device_address)
            .field("endpoint_address", &self.endpoint_address)
            .field("ed", &self.ed)
            .field("td_head", &self.td_head)
            .field("speed", &self.speed)
            .field("max_packet", &self.max_packet)
            .field("interval", &self.interval)
            .field("periodic", &self.periodic)
            .field("length", &self.buffer.len())
            .field("toggle", &self.toggle)
            .finish_non_exhaustive()
    }
}

impl InterruptContext {
    fn matches(&self, device_address: u8, endpoint_address: u8) -> bool {
        self.device_address == device_address && self.endpoint_address == endpoint_address
    }
}

/// Live asynchronous interrupt transfers
pub struct InterruptRegistry {
    entries: Vec<InterruptContext>,
}

impl InterruptRegistry {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, device_address: u8, endpoint_address: u8) -> bool {
        self.entries
            .iter()
            .any(|e| e.matches(device_address, endpoint_address))
    }

    fn insert(&mut self, context: InterruptContext) {
        self.entries.push(context);
    }

    fn take(&mut self, device_address: u8, endpoint_address: u8) -> Option<InterruptContext> {
        let index = self
            .entries
            .iter()
            .position(|e| e.matches(device_address, endpoint_address))?;
        Some(self.entries.remove(index))
    }
}

impl Default for InterruptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_interrupt_request(endpoint_address: u8, data_length: usize, toggle: u8) -> OhciResult<()> {
    if !endpoint_is_in(endpoint_address) {
        return Err(OhciError::InvalidParameter {
            name: "endpoint_address",
            reason: "interrupt transfers must be IN",
        });
    }
    if data_length == 0 || data_length > MAX_BYTES_PER_TD {
        return Err(OhciError::InvalidParameter {
            name: "data_length",
            reason: "must be 1..=4096 bytes",
        });
    }
    check_toggle(toggle)
}

impl<P: OhciPlatform> OhciController<P> {
    /// Queue an IN chain for `endpoint_address` on the least loaded tree
    /// node serving `interval`.
    ///
    /// The ED is returned skipped; the caller makes it live once its own
    /// bookkeeping is in place. Nothing stays linked or allocated on error.
    #[allow(clippy::too_many_arguments)]
    fn queue_interrupt_chain(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        interval: u8,
        buffer: BusAddr,
        data_length: usize,
        toggle: &mut u8,
    ) -> OhciResult<(BusAddr, BusAddr)> {
        let endpoint = endpoint_number(endpoint_address);
        let depth = PeriodicSchedule::depth_for_interval(interval);
        let node = self
            .find_least_loaded_list(depth)
            .ok_or(OhciError::ResourceExhausted {
                resource: "periodic schedule node",
            })?;

        let (ed, created) =
            match self.find_working_endpoint(node, device_address, endpoint, EdDirection::In) {
                Some(ed) => {
                    Ed::new(&self.platform, ed).set_skip(true);
                    (ed, false)
                }
                None => {
                    let ed =
                        self.create_ed(device_address, endpoint, EdDirection::In, speed, max_packet)?;
                    if let Err(e) = self.attach_to_list(ListKind::Interrupt, ed, Some(node)) {
                        self.free_ed(ed);
                        return Err(e);
                    }
                    (ed, true)
                }
            };

        let head = match self.build_bulk_or_interrupt_chain(
            TdPid::In,
            buffer,
            data_length,
            toggle,
            max_packet,
        ) {
            Ok(head) => head,
            Err(e) => {
                if created {
                    self.unlink_interrupt_ed(ed);
                    self.free_ed(ed);
                } else {
                    Ed::new(&self.platform, ed).set_skip(false);
                }
                return Err(e);
            }
        };
        self.attach_chain_to_ed(ed, head);
        debug!(
            "OHCI: interrupt ED {:?} for {}:{:02x} at depth {} (interval {})",
            ed, device_address, endpoint_address, depth, interval
        );
        Ok((ed, head))
    }

    /// Clear skip on `ed` and make sure periodic processing is running
    fn make_periodic_live(&self, ed: BusAddr) {
        Ed::new(&self.platform, ed).set_skip(false);
        let regs = self.regs();
        if !regs.list_enabled(control::PLE) {
            regs.set_list_enable(control::PLE, true);
            self.platform.stall(self.config.periodic_settle_us);
        }
    }

    /// Register a periodic IN transfer.
    ///
    /// Every `polling_interval` frames the controller polls the endpoint
    /// for up to `data_length` bytes; [`house_keeper`](Self::house_keeper)
    /// hands each completed round to `callback` and re-arms the chain.
    #[allow(clippy::too_many_arguments)]
    pub fn async_interrupt_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        toggle: u8,
        polling_interval: u8,
        data_length: usize,
        callback: InterruptCallback,
    ) -> OhciResult<()> {
        check_interrupt_request(endpoint_address, data_length, toggle)?;
        if polling_interval == 0 {
            return Err(OhciError::InvalidParameter {
                name: "polling_interval",
                reason: "must be 1..=255",
            });
        }
        if self.interrupts.contains(device_address, endpoint_address) {
            warn!(
                "OHCI: interrupt transfer for {}:{:02x} already registered",
                device_address, endpoint_address
            );
            return Err(OhciError::InvalidParameter {
                name: "endpoint_address",
                reason: "asynchronous transfer already registered",
            });
        }

        let buffer = vec![0u8; data_length];
        let mapping = self
            .platform
            .map(MapOperation::BusMasterWrite, &buffer)
            .ok_or(OhciError::ResourceExhausted {
                resource: "bus master mapping",
            })?;

        let mut next_toggle = toggle;
        let (ed, td_head) = match self.queue_interrupt_chain(
            device_address,
            endpoint_address,
            speed,
            max_packet,
            polling_interval,
            mapping.bus_addr,
            data_length,
            &mut next_toggle,
        ) {
            Ok(queued) => queued,
            Err(e) => {
                self.platform.unmap(mapping);
                return Err(e);
            }
        };

        self.interrupts.insert(InterruptContext {
            device_address,
            endpoint_address,
            ed,
            td_head,
            speed,
            max_packet,
            interval: polling_interval,
            callback,
            periodic: true,
            mapping,
            buffer,
            toggle,
        });
        self.make_periodic_live(ed);
        info!(
            "OHCI: async interrupt {}:{:02x} registered, {} bytes every {} ms",
            device_address, endpoint_address, data_length, polling_interval
        );
        Ok(())
    }

    /// Cancel a registration and return the toggle the endpoint expects
    /// next
    pub fn cancel_async_interrupt_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
    ) -> OhciResult<u8> {
        let context = self
            .interrupts
            .take(device_address, endpoint_address)
            .ok_or(OhciError::InvalidParameter {
                name: "endpoint_address",
                reason: "no asynchronous transfer registered",
            })?;

        debug!("OHCI: canceling {:?}", context);
        let regs = self.regs();
        let periodic_on = regs.list_enabled(control::PLE);
        regs.set_list_enable(control::PLE, false);

        let toggle = self
            .check_if_done(context.ed, context.td_head, context.toggle)
            .next_toggle;

        for ed in self.unlink_interrupt_eds(device_address, endpoint_number(endpoint_address)) {
            if ed != context.ed {
                let stale = Ed::new(&self.platform, ed).head();
                self.destroy_chain(stale);
                self.free_ed(ed);
            }
        }
        // The registered ED may already be off the tree if the schedule was
        // rebuilt underneath it
        self.unlink_interrupt_ed(context.ed);
        self.release_context(context);

        if periodic_on {
            self.regs().set_list_enable(control::PLE, true);
        }
        info!(
            "OHCI: async interrupt {}:{:02x} canceled, toggle {}",
            device_address, endpoint_address, toggle
        );
        Ok(toggle)
    }

    /// Free the chain, ED and mapping of an unlinked context
    fn release_context(&mut self, context: InterruptContext) {
        self.destroy_chain(context.td_head);
        self.free_ed(context.ed);
        self.platform.unmap(context.mapping);
    }

    /// Tear down every registered asynchronous transfer
    pub(crate) fn free_interrupt_memory(&mut self) {
        let entries = core::mem::take(&mut self.interrupts.entries);
        if !entries.is_empty() {
            debug!("OHCI: freeing {} async interrupt transfer(s)", entries.len());
        }
        for context in entries {
            self.unlink_interrupt_ed(context.ed);
            self.release_context(context);
        }
    }

    /// Perform a one-shot interrupt IN transfer and wait for it.
    ///
    /// `toggle` is updated the same way as for
    /// [`bulk_transfer`](Self::bulk_transfer).
    #[allow(clippy::too_many_arguments)]
    pub fn sync_interrupt_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        data: &mut [u8],
        toggle: &mut u8,
        timeout_ms: u32,
    ) -> OhciResult<Completion> {
        check_interrupt_request(endpoint_address, data.len(), *toggle)?;
        let packet_limit = if speed == UsbSpeed::Full { 64 } else { 8 };
        if max_packet > packet_limit {
            return Err(OhciError::InvalidParameter {
                name: "max_packet",
                reason: "too large for the device speed",
            });
        }
        if self.interrupts.contains(device_address, endpoint_address) {
            return Err(OhciError::InvalidParameter {
                name: "endpoint_address",
                reason: "endpoint has an asynchronous transfer registered",
            });
        }

        let mapping = self
            .platform
            .map(MapOperation::BusMasterWrite, data)
            .ok_or(OhciError::ResourceExhausted {
                resource: "bus master mapping",
            })?;

        let start_toggle = *toggle;
        let mut next_toggle = start_toggle;
        let (ed, head) = match self.queue_interrupt_chain(
            device_address,
            endpoint_address,
            speed,
            max_packet,
            1,
            mapping.bus_addr,
            data.len(),
            &mut next_toggle,
        ) {
            Ok(queued) => queued,
            Err(e) => {
                self.platform.unmap(mapping);
                return Err(e);
            }
        };
        self.make_periodic_live(ed);

        let result = self.wait_for_completion(ed, head, start_toggle, timeout_ms);

        self.unlink_interrupt_ed(ed);
        self.destroy_chain(head);
        self.free_ed(ed);

        let outcome = transfer_outcome("interrupt transfer", &result, timeout_ms);
        match outcome {
            Ok(()) => {
                let len = result.length.min(data.len());
                self.platform.read_dma(mapping.bus_addr, &mut data[..len]);
                *toggle = next_toggle;
            }
            Err(_) => *toggle = result.next_toggle,
        }
        self.platform.unmap(mapping);
        outcome.map(|()| Completion::new(result.length))
    }

    /// Deliver finished asynchronous interrupt rounds and re-arm them.
    ///
    /// Each completed chain's data goes to its callback; periodic entries
    /// are handed back to the controller with the toggle continuing where
    /// the round ended.
    pub fn house_keeper(&mut self) {
        let mut entries = core::mem::take(&mut self.interrupts.entries);
        let mut index = 0;
        while index < entries.len() {
            let context = &mut entries[index];
            let result = self.check_if_done(context.ed, context.td_head, context.toggle);
            if !result.done {
                index += 1;
                continue;
            }
            let len = result.length.min(context.buffer.len());
            self.platform
                .read_dma(context.mapping.bus_addr, &mut context.buffer[..len]);
            (context.callback)(&context.buffer[..len], result.usb_result());

            if context.periodic {
                self.rearm_interrupt(context, result.next_toggle);
                index += 1;
            } else {
                let context = entries.remove(index);
                self.unlink_interrupt_ed(context.ed);
                self.release_context(context);
            }
        }
        self.interrupts.entries = entries;

        self.clear_done_head();
        self.regs().clear_interrupt_status(interrupt::WDH);
    }

    fn rearm_interrupt(&self, context: &mut InterruptContext, toggle: u8) {
        let ed = Ed::new(&self.platform, context.ed);
        ed.set_skip(true);
        let mut next = toggle;
        let mut td = context.td_head;
        while !td.is_null() {
            let view = Td::new(&self.platform, td);
            view.rearm(next);
            next ^= 1;
            td = view.next_sw();
        }
        ed.reset_head(context.td_head);
        ed.set_skip(false);
        context.toggle = toggle;
    }

    /// Number of live asynchronous interrupt transfers
    pub fn async_transfer_count(&self) -> usize {
        self.interrupts.len()
    }
}
