//! Transfer engine and completion poller
//!
//! Control and bulk transfers run one at a time: the list is quiesced, a
//! skipped ED with its TD chain is linked in, the ED is made live and list
//! processing restarted, then the chain is polled until every TD has left
//! the "not accessed" state or the caller's timeout runs out.
//!
//! Everything a transfer acquires is recorded in a [`StagedTransfer`] and
//! released by [`OhciController::release_staged`] on every exit path.

use log::{debug, error, trace, warn};

use crate::{
    controller::OhciController,
    descriptor::{dump_chain, ConditionCode, Ed, EdDirection, TdPid, TransferDescriptor},
    ed::ListKind,
    error::{OhciError, OhciResult},
    platform::{BusAddr, DmaMapping, MapOperation, OhciPlatform},
    regs::{command, control},
    usb::{
        endpoint_is_in, endpoint_number, Completion, DataDirection, DeviceRequest, UsbResult,
        UsbSpeed,
    },
};

/// Largest data stage accepted for a control transfer
pub const MAX_BYTES_PER_TD: usize = 0x1000;

/// Packet sizes a full/low-speed control or bulk endpoint may report
const VALID_MAX_PACKET: [u16; 4] = [8, 16, 32, 64];

/// Completion state of one TD chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdResult {
    /// No TD is left for the controller to process
    pub done: bool,
    /// First error code met, `NoError` when all TDs passed, `NotAccessed`
    /// while pending
    pub code: ConditionCode,
    /// Toggle the next packet on this endpoint must carry
    pub next_toggle: u8,
    /// Data bytes moved by completed non-SETUP TDs
    pub length: usize,
}

impl EdResult {
    pub fn usb_result(&self) -> UsbResult {
        self.code.to_usb_result()
    }
}

/// Resources held by an in-flight control or bulk transfer
pub(crate) struct StagedTransfer {
    list: ListKind,
    ed: Option<BusAddr>,
    tds: BusAddr,
    request: Option<DmaMapping>,
    data: Option<DmaMapping>,
}

impl StagedTransfer {
    pub(crate) fn new(list: ListKind) -> Self {
        Self {
            list,
            ed: None,
            tds: BusAddr::NULL,
            request: None,
            data: None,
        }
    }
}

pub(crate) fn check_max_packet(max_packet: u16) -> OhciResult<()> {
    if VALID_MAX_PACKET.contains(&max_packet) {
        Ok(())
    } else {
        Err(OhciError::InvalidParameter {
            name: "max_packet",
            reason: "must be 8, 16, 32 or 64",
        })
    }
}

pub(crate) fn check_toggle(toggle: u8) -> OhciResult<()> {
    if toggle > 1 {
        return Err(OhciError::InvalidParameter {
            name: "toggle",
            reason: "must be 0 or 1",
        });
    }
    Ok(())
}

/// Turn a finished poll into the caller-facing outcome
pub(crate) fn transfer_outcome(
    operation: &'static str,
    result: &EdResult,
    timeout_ms: u32,
) -> OhciResult<()> {
    if !result.done {
        warn!("OHCI: {} timeout, > {} ms", operation, timeout_ms);
        return Err(OhciError::Timeout {
            operation,
            result: UsbResult::NOTEXECUTE | UsbResult::TIMEOUT,
        });
    }
    match result.code {
        ConditionCode::NoError => Ok(()),
        code => {
            error!("OHCI: {} broken, condition code {:?}", operation, code);
            Err(OhciError::DeviceError {
                result: code.to_usb_result(),
            })
        }
    }
}

impl<P: OhciPlatform> OhciController<P> {
    fn map_buffer(&self, operation: MapOperation, buffer: &[u8]) -> OhciResult<DmaMapping> {
        self.platform
            .map(operation, buffer)
            .ok_or(OhciError::ResourceExhausted {
                resource: "bus master mapping",
            })
    }

    /// Inspect a TD chain without waiting.
    ///
    /// `toggle` is the toggle the first TD was built with; it is what
    /// `next_toggle` reports while nothing has completed. A TD that failed
    /// keeps the toggle of the packet that failed.
    pub fn check_if_done(&self, ed: BusAddr, head_td: BusAddr, toggle: u8) -> EdResult {
        let mut result = EdResult {
            done: false,
            code: ConditionCode::NotAccessed,
            next_toggle: toggle,
            length: 0,
        };
        let mut td = head_td;
        while !td.is_null() {
            let image = TransferDescriptor::load(&self.platform, td);
            let code = image.condition_code();
            if code.is_pending() {
                // A halted ED never reaches this TD
                result.done = Ed::new(&self.platform, ed).is_halted();
                trace!("OHCI: TD {:?} pending, ED halted={}", td, result.done);
                return result;
            }
            if code != ConditionCode::NoError {
                result.done = true;
                result.code = code;
                result.next_toggle = image.toggle();
                return result;
            }
            if image.pid() != TdPid::Setup {
                result.length += image.transferred() as usize;
            }
            // Hardware advances the TD's toggle after every acknowledged
            // packet, so a retired TD already holds the next one
            result.next_toggle = image.toggle();
            td = BusAddr::new(image.next_sw);
        }
        result.done = true;
        result.code = ConditionCode::NoError;
        result
    }

    /// Poll `check_if_done` every `poll_interval_us` until the chain is
    /// done or `timeout_ms` increments have passed
    pub(crate) fn wait_for_completion(
        &self,
        ed: BusAddr,
        head_td: BusAddr,
        toggle: u8,
        timeout_ms: u32,
    ) -> EdResult {
        let mut result = self.check_if_done(ed, head_td, toggle);
        let mut waited = 0u32;
        while !result.done && waited <= timeout_ms {
            self.platform.stall(self.config.poll_interval_us);
            waited += 1;
            result = self.check_if_done(ed, head_td, toggle);
        }
        result
    }

    /// Give back everything a control or bulk transfer acquired.
    ///
    /// The ED is skipped and unlinked before anything it references is
    /// freed; fields that were never filled in are skipped.
    pub(crate) fn release_staged(&mut self, staged: StagedTransfer) {
        if let Some(ed) = staged.ed {
            self.detach_from_async_list(staged.list, ed);
        }
        if let Some(mapping) = staged.data {
            self.platform.unmap(mapping);
        }
        self.destroy_chain(staged.tds);
        if let Some(mapping) = staged.request {
            self.platform.unmap(mapping);
        }
        if let Some(ed) = staged.ed {
            self.free_ed(ed);
        }
    }

    /// Submit a control transfer to endpoint 0 and wait for it.
    ///
    /// `data` must be `None` for [`DataDirection::NoData`] and present
    /// otherwise. On success the returned length counts data stage bytes
    /// actually moved.
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer(
        &mut self,
        device_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        request: &DeviceRequest,
        direction: DataDirection,
        data: Option<&mut [u8]>,
        timeout_ms: u32,
    ) -> OhciResult<Completion> {
        check_max_packet(max_packet)?;
        if speed == UsbSpeed::Low && max_packet != 8 {
            return Err(OhciError::InvalidParameter {
                name: "max_packet",
                reason: "low speed control endpoints use 8",
            });
        }
        match (direction, &data) {
            (DataDirection::NoData, Some(_)) => {
                return Err(OhciError::InvalidParameter {
                    name: "data",
                    reason: "no-data request with a buffer",
                })
            }
            (DataDirection::In | DataDirection::Out, None) => {
                return Err(OhciError::InvalidParameter {
                    name: "data",
                    reason: "data stage without a buffer",
                })
            }
            _ => {}
        }
        let data_len = data.as_ref().map_or(0, |d| d.len());
        if data_len > MAX_BYTES_PER_TD {
            return Err(OhciError::InvalidParameter {
                name: "data",
                reason: "longer than one control transfer",
            });
        }

        debug!(
            "OHCI: control {:?} to {} (mps {}) request {:02x}/{:02x} len {}",
            direction, device_address, max_packet, request.request_type, request.request, data_len
        );
        let mut staged = StagedTransfer::new(ListKind::Control);
        let outcome = self.run_control(
            &mut staged,
            device_address,
            speed,
            max_packet,
            request,
            direction,
            data,
            timeout_ms,
        );
        self.release_staged(staged);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn run_control(
        &mut self,
        staged: &mut StagedTransfer,
        device_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        request: &DeviceRequest,
        direction: DataDirection,
        data: Option<&mut [u8]>,
        timeout_ms: u32,
    ) -> OhciResult<Completion> {
        let data_pid = match direction {
            DataDirection::In => TdPid::In,
            _ => TdPid::Out,
        };

        self.regs().set_list_enable(control::CLE, false);
        self.regs().set_command(command::CLF, false);
        self.platform.stall(self.config.list_settle_us);
        self.regs().set_control_head(BusAddr::NULL);

        let ed = self.create_ed(device_address, 0, EdDirection::FromTd, speed, max_packet)?;
        staged.ed = Some(ed);
        self.attach_to_list(ListKind::Control, ed, None)?;

        let request_bytes = request.to_bytes();
        let request_map = self.map_buffer(MapOperation::BusMasterRead, &request_bytes)?;
        staged.request = Some(request_map);

        let mut data = data.filter(|d| !d.is_empty());
        let data_addr = match data.as_deref() {
            Some(buffer) => {
                let operation = if direction == DataDirection::In {
                    MapOperation::BusMasterWrite
                } else {
                    MapOperation::BusMasterRead
                };
                let mapping = self.map_buffer(operation, buffer)?;
                staged.data = Some(mapping);
                mapping.bus_addr
            }
            None => BusAddr::NULL,
        };
        let data_len = data.as_ref().map_or(0, |d| d.len());

        let head = self.build_control_chain(
            data_pid,
            request_map.bus_addr,
            data_addr,
            data_len,
            max_packet,
        )?;
        staged.tds = head;
        self.attach_chain_to_ed(ed, head);
        dump_chain(&self.platform, ed, head);

        Ed::new(&self.platform, ed).set_skip(false);
        self.regs().set_list_enable(control::CLE, true);
        self.regs().set_command(command::CLF, true);
        self.platform.stall(self.config.list_settle_us);

        let result = self.wait_for_completion(ed, head, 0, timeout_ms);
        transfer_outcome("control transfer", &result, timeout_ms)?;

        if let (Some(buffer), Some(mapping), DataDirection::In) =
            (data.as_deref_mut(), staged.data, direction)
        {
            let len = result.length.min(buffer.len());
            self.platform.read_dma(mapping.bus_addr, &mut buffer[..len]);
        }
        Ok(Completion::new(result.length))
    }

    /// Submit a bulk transfer and wait for it.
    ///
    /// Bit 7 of `endpoint_address` selects IN. `toggle` is updated on every
    /// outcome: on success to the value after the last TD, on failure to the
    /// toggle of the first packet that did not complete.
    #[allow(clippy::too_many_arguments)]
    pub fn bulk_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        data: &mut [&mut [u8]],
        toggle: &mut u8,
        timeout_ms: u32,
    ) -> OhciResult<Completion> {
        if data.len() != 1 {
            return Err(OhciError::Unsupported {
                operation: "multi-buffer bulk transfer",
            });
        }
        let buffer = &mut *data[0];
        if buffer.is_empty() {
            return Err(OhciError::InvalidParameter {
                name: "data",
                reason: "empty bulk transfer",
            });
        }
        check_toggle(*toggle)?;
        check_max_packet(max_packet)?;

        debug!(
            "OHCI: bulk ep {:02x} on {} len {} toggle {}",
            endpoint_address,
            device_address,
            buffer.len(),
            toggle
        );
        let mut staged = StagedTransfer::new(ListKind::Bulk);
        let outcome = self.run_bulk(
            &mut staged,
            device_address,
            endpoint_address,
            speed,
            max_packet,
            buffer,
            toggle,
            timeout_ms,
        );
        self.release_staged(staged);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn run_bulk(
        &mut self,
        staged: &mut StagedTransfer,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        buffer: &mut [u8],
        toggle: &mut u8,
        timeout_ms: u32,
    ) -> OhciResult<Completion> {
        let is_in = endpoint_is_in(endpoint_address);
        let (direction, pid, operation) = if is_in {
            (EdDirection::In, TdPid::In, MapOperation::BusMasterWrite)
        } else {
            (EdDirection::Out, TdPid::Out, MapOperation::BusMasterRead)
        };

        self.regs().set_list_enable(control::BLE, false);
        self.regs().set_command(command::BLF, false);
        self.platform.stall(self.config.list_settle_us);
        self.regs().set_bulk_head(BusAddr::NULL);

        let ed = self.create_ed(
            device_address,
            endpoint_number(endpoint_address),
            direction,
            speed,
            max_packet,
        )?;
        staged.ed = Some(ed);
        self.attach_to_list(ListKind::Bulk, ed, None)?;

        let mapping = self.map_buffer(operation, buffer)?;
        staged.data = Some(mapping);

        let start_toggle = *toggle;
        let mut next_toggle = start_toggle;
        let head = self.build_bulk_or_interrupt_chain(
            pid,
            mapping.bus_addr,
            buffer.len(),
            &mut next_toggle,
            max_packet,
        )?;
        staged.tds = head;
        self.attach_chain_to_ed(ed, head);
        dump_chain(&self.platform, ed, head);

        Ed::new(&self.platform, ed).set_skip(false);
        self.regs().set_command(command::BLF, true);
        self.regs().set_list_enable(control::BLE, true);
        self.platform.stall(self.config.list_settle_us);

        let result = self.wait_for_completion(ed, head, start_toggle, timeout_ms);
        if let Err(e) = transfer_outcome("bulk transfer", &result, timeout_ms) {
            *toggle = result.next_toggle;
            return Err(e);
        }
        *toggle = next_toggle;

        if is_in {
            let len = result.length.min(buffer.len());
            self.platform.read_dma(mapping.bus_addr, &mut buffer[..len]);
        }
        Ok(Completion::new(result.length))
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::{config::OhciConfig, sim::SimPlatform};

    #[test]
    fn test_check_if_done_walks_software_links() {
        let sim = SimPlatform::new(1);
        let mut hc = OhciController::new(&sim, OhciConfig::default()).unwrap();
        let ed = hc
            .create_ed(1, 1, EdDirection::Out, UsbSpeed::Full, 8)
            .unwrap();
        let mut toggle = 1;
        let head = hc
            .build_bulk_or_interrupt_chain(TdPid::Out, BusAddr::new(0x0050_0000), 24, &mut toggle, 8)
            .unwrap();

        let pending = hc.check_if_done(ed, head, 1);
        assert!(!pending.done);
        assert_eq!(pending.next_toggle, 1);

        // Retire the first TD the way hardware does: CC written, toggle
        // advanced, CBP cleared, hardware link pointed at the done queue
        let mut first = TransferDescriptor::load(&sim, head);
        first.control &= !TransferDescriptor::CC_MASK;
        first.control ^= 1 << TransferDescriptor::T_SHIFT;
        first.current_buffer = 0;
        first.next_td = 0;
        first.store(&sim, head);

        let partial = hc.check_if_done(ed, head, 1);
        assert!(!partial.done);
        assert_eq!(partial.length, 8);
        assert_eq!(partial.next_toggle, 0);

        // Second TD stalls
        let second = BusAddr::new(first.next_sw);
        let mut image = TransferDescriptor::load(&sim, second);
        image.control = (image.control & !TransferDescriptor::CC_MASK)
            | (4 << TransferDescriptor::CC_SHIFT);
        image.store(&sim, second);

        let broken = hc.check_if_done(ed, head, 1);
        assert!(broken.done);
        assert_eq!(broken.code, ConditionCode::Stall);
        assert_eq!(broken.usb_result(), UsbResult::STALL);
        assert_eq!(broken.next_toggle, 0);
        hc.destroy_chain(head);
    }

    #[test]
    fn test_outcome_taxonomy() {
        let pending = EdResult {
            done: false,
            code: ConditionCode::NotAccessed,
            next_toggle: 0,
            length: 0,
        };
        let err = transfer_outcome("bulk transfer", &pending, 5).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.transfer_result().contains(UsbResult::NOTEXECUTE));

        let stalled = EdResult {
            done: true,
            code: ConditionCode::Stall,
            ..pending
        };
        assert_eq!(
            transfer_outcome("bulk transfer", &stalled, 5),
            Err(OhciError::DeviceError {
                result: UsbResult::STALL
            })
        );

        let ok = EdResult {
            done: true,
            code: ConditionCode::NoError,
            ..pending
        };
        assert_eq!(transfer_outcome("bulk transfer", &ok, 5), Ok(()));
    }

    #[test]
    fn test_max_packet_validation() {
        for mps in [8, 16, 32, 64] {
            assert!(check_max_packet(mps).is_ok());
        }
        for mps in [0, 7, 9, 128, 512] {
            assert!(check_max_packet(mps).is_err());
        }
        assert!(check_toggle(1).is_ok());
        assert!(check_toggle(2).is_err());
    }
}
