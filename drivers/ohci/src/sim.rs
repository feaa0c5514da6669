//! Software model of an OHCI controller and its host environment
//!
//! [`SimPlatform`] implements [`OhciPlatform`] over flat bus memory, a
//! register file with OHCI write semantics, a root hub with a configurable
//! number of ports and a set of [`SimDevice`]s addressed by function
//! address.
//!
//! Time only moves inside [`OhciPlatform::stall`]. Each whole millisecond
//! is one frame: root hub port resets progress and, while the controller
//! is Operational, the model walks the periodic, control and bulk
//! schedules the way the hardware does. Retired TDs are pushed onto the
//! done queue through their `next_td` word and the ED head moves past them.
//!
//! Failure injection covers allocation and mapping failures, a controller
//! reset bit that never clears, port resets that never complete and a
//! frame clock that never starts.

use alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec};

use log::trace;
use spin::Mutex;

use crate::{
    descriptor::{hcca, ConditionCode, EdDirection, EndpointDescriptor, TdPid, TransferDescriptor},
    platform::{BusAddr, DmaMapping, DmaRegion, MapOperation, OhciPlatform, PAGE_SIZE},
    regs::{command, control, interrupt, offset, port, rh_a, rh_status},
};

/// Bus address of the first byte of simulated memory
pub const MEMORY_BASE: u32 = 0x0010_0000;
/// Pages of simulated memory
pub const MEMORY_PAGES: usize = 1024;

/// Frames a port stays in reset
const PORT_RESET_FRAMES: u32 = 10;
/// Bound on ED and TD walks per frame
const MAX_WALK: usize = 4096;
const REVISION: u32 = 0x10;

const CC_NO_ERROR: u32 = 0;
const CC_STALL: u32 = 4;
const CC_DEVICE_NOT_RESPONDING: u32 = 5;
const CC_DATA_OVERRUN: u32 = 8;

/// How a device answers one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimReply {
    /// Handshake ACK; carries the data for an IN transaction
    Ack(Vec<u8>),
    Nak,
    Stall,
    /// No handshake at all
    NoResponse,
}

/// A USB function behind the simulated root hub
pub trait SimDevice: Send {
    /// Handle one transaction on `endpoint`.
    ///
    /// `out_data` holds the payload of SETUP and OUT transactions;
    /// `in_capacity` is the most an IN transaction may return.
    fn handle(
        &mut self,
        endpoint: u8,
        pid: TdPid,
        toggle: u8,
        out_data: &[u8],
        in_capacity: usize,
    ) -> SimReply;
}

/// One acknowledged transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTransaction {
    pub address: u8,
    pub endpoint: u8,
    pub pid: TdPid,
    pub toggle: u8,
    pub length: usize,
    pub frame: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct SimPort {
    connected: bool,
    low_speed: bool,
    powered: bool,
    enabled: bool,
    suspended: bool,
    resetting: Option<u32>,
    stuck_reset: bool,
    change: u32,
}

impl SimPort {
    fn status(&self) -> u32 {
        let mut value = self.change;
        if self.connected {
            value |= port::CCS;
            if self.low_speed {
                value |= port::LSDA;
            }
        }
        if self.enabled {
            value |= port::PES;
        }
        if self.suspended {
            value |= port::PSS;
        }
        if self.resetting.is_some() {
            value |= port::PRS;
        }
        if self.powered {
            value |= port::PPS;
        }
        value
    }

    fn command(&mut self, bits: u32) {
        // Change bits are write-one-to-clear
        self.change &= !(bits & port::CHANGE_MASK);

        if bits & port::WRITE_CLEAR_PORT_ENABLE != 0 {
            self.enabled = false;
        }
        if bits & port::WRITE_SET_PORT_ENABLE != 0 {
            if self.connected {
                self.enabled = true;
            } else {
                self.change |= port::CSC;
            }
        }
        if bits & port::WRITE_SET_PORT_SUSPEND != 0 {
            if self.connected && self.enabled {
                self.suspended = true;
            } else if !self.connected {
                self.change |= port::CSC;
            }
        }
        if bits & port::WRITE_CLEAR_SUSPEND_STATUS != 0 && self.suspended {
            self.suspended = false;
            self.change |= port::PSSC;
        }
        if bits & port::WRITE_SET_PORT_RESET != 0 {
            if self.connected {
                self.resetting = Some(PORT_RESET_FRAMES);
            } else {
                self.change |= port::CSC;
            }
        }
        if bits & port::WRITE_SET_PORT_POWER != 0 {
            self.powered = true;
        }
        if bits & port::WRITE_CLEAR_PORT_POWER != 0 {
            self.powered = false;
            self.enabled = false;
            self.suspended = false;
        }
    }

    fn tick(&mut self) {
        if self.stuck_reset {
            return;
        }
        if let Some(frames) = self.resetting {
            if frames <= 1 {
                self.resetting = None;
                self.enabled = true;
                self.change |= port::PRSC;
            } else {
                self.resetting = Some(frames - 1);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Registers {
    control: u32,
    command_status: u32,
    interrupt_status: u32,
    interrupt_enable: u32,
    hcca: u32,
    control_head: u32,
    bulk_head: u32,
    fm_interval: u32,
    periodic_start: u32,
    rh_descriptor_a: u32,
    rh_descriptor_b: u32,
}

struct SimState {
    memory: Vec<u8>,
    pages: Vec<bool>,
    coherent_pages: usize,
    mappings: BTreeMap<usize, DmaRegion>,
    next_handle: usize,
    allocations_left: Option<usize>,
    mappings_left: Option<usize>,

    regs: Registers,
    stuck_reset: bool,
    ports: Vec<SimPort>,
    devices: BTreeMap<u8, Box<dyn SimDevice>>,

    frame: u32,
    frame_clock_stopped: bool,
    elapsed_us: u64,
    partial_us: u32,
    done_queue: u32,
    transactions: Vec<SimTransaction>,
}

/// Outcome of servicing one TD
enum TdOutcome {
    /// TD still owned by the controller; stop on this ED for the frame
    Pending,
    Retired,
    /// Retired with an error; the ED is now halted
    Halted,
}

impl SimState {
    fn new(ports: u8) -> Self {
        Self {
            memory: vec![0; MEMORY_PAGES * PAGE_SIZE],
            pages: vec![false; MEMORY_PAGES],
            coherent_pages: 0,
            mappings: BTreeMap::new(),
            next_handle: 1,
            allocations_left: None,
            mappings_left: None,
            regs: Registers {
                rh_descriptor_a: u32::from(ports) & rh_a::NDP_MASK,
                ..Registers::default()
            },
            stuck_reset: false,
            ports: vec![SimPort::default(); usize::from(ports)],
            devices: BTreeMap::new(),
            frame: 0,
            frame_clock_stopped: false,
            elapsed_us: 0,
            partial_us: 0,
            done_queue: 0,
            transactions: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    fn index(&self, addr: u32, len: usize) -> Option<usize> {
        let start = addr.checked_sub(MEMORY_BASE)? as usize;
        (start + len <= self.memory.len()).then_some(start)
    }

    fn read(&self, addr: u32, buf: &mut [u8]) {
        match self.index(addr, buf.len()) {
            Some(start) => buf.copy_from_slice(&self.memory[start..start + buf.len()]),
            None => buf.fill(0),
        }
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        if let Some(start) = self.index(addr, data.len()) {
            self.memory[start..start + data.len()].copy_from_slice(data);
        }
    }

    fn read_u32(&self, addr: u32) -> u32 {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    fn take_pages(&mut self, count: usize) -> Option<DmaRegion> {
        let count = count.max(1);
        let mut run = 0;
        for page in 0..self.pages.len() {
            run = if self.pages[page] { 0 } else { run + 1 };
            if run == count {
                let first = page + 1 - count;
                for used in &mut self.pages[first..=page] {
                    *used = true;
                }
                let start = first * PAGE_SIZE;
                self.memory[start..start + count * PAGE_SIZE].fill(0);
                return Some(DmaRegion {
                    bus_addr: BusAddr::new(MEMORY_BASE + start as u32),
                    pages: count,
                });
            }
        }
        None
    }

    fn give_pages(&mut self, region: DmaRegion) {
        let first = (region.bus_addr.as_u32() - MEMORY_BASE) as usize / PAGE_SIZE;
        for used in self.pages.iter_mut().skip(first).take(region.pages) {
            *used = false;
        }
    }

    // ------------------------------------------------------------------
    // Registers
    // ------------------------------------------------------------------

    fn read_register(&self, reg: u32) -> u32 {
        match reg {
            offset::HC_REVISION => REVISION,
            offset::HC_CONTROL => self.regs.control,
            offset::HC_COMMAND_STATUS => self.regs.command_status,
            offset::HC_INTERRUPT_STATUS => self.regs.interrupt_status,
            offset::HC_INTERRUPT_ENABLE | offset::HC_INTERRUPT_DISABLE => {
                self.regs.interrupt_enable
            }
            offset::HC_HCCA => self.regs.hcca,
            offset::HC_CONTROL_HEAD_ED => self.regs.control_head,
            offset::HC_BULK_HEAD_ED => self.regs.bulk_head,
            offset::HC_DONE_HEAD => self.done_queue,
            offset::HC_FM_INTERVAL => self.regs.fm_interval,
            offset::HC_FM_NUMBER => self.frame & 0xFFFF,
            offset::HC_PERIODIC_START => self.regs.periodic_start,
            offset::HC_RH_DESCRIPTOR_A => self.regs.rh_descriptor_a,
            offset::HC_RH_DESCRIPTOR_B => self.regs.rh_descriptor_b,
            offset::HC_RH_STATUS => 0,
            reg if reg >= offset::HC_RH_PORT_STATUS => {
                let index = ((reg - offset::HC_RH_PORT_STATUS) / 4) as usize;
                self.ports.get(index).map_or(0, SimPort::status)
            }
            _ => 0,
        }
    }

    fn write_register(&mut self, reg: u32, value: u32) {
        match reg {
            offset::HC_CONTROL => self.regs.control = value,
            offset::HC_COMMAND_STATUS => {
                if value & command::HCR != 0 {
                    self.software_reset();
                } else {
                    self.regs.command_status = value;
                }
            }
            offset::HC_INTERRUPT_STATUS => self.regs.interrupt_status &= !value,
            offset::HC_INTERRUPT_ENABLE => self.regs.interrupt_enable |= value,
            offset::HC_INTERRUPT_DISABLE => self.regs.interrupt_enable &= !value,
            offset::HC_HCCA => self.regs.hcca = value & !0xFF,
            offset::HC_CONTROL_HEAD_ED => self.regs.control_head = value & !0xF,
            offset::HC_BULK_HEAD_ED => self.regs.bulk_head = value & !0xF,
            offset::HC_FM_INTERVAL => self.regs.fm_interval = value,
            offset::HC_PERIODIC_START => self.regs.periodic_start = value,
            offset::HC_RH_DESCRIPTOR_A => {
                let ndp = self.regs.rh_descriptor_a & rh_a::NDP_MASK;
                self.regs.rh_descriptor_a = (value & !rh_a::NDP_MASK) | ndp;
            }
            offset::HC_RH_DESCRIPTOR_B => self.regs.rh_descriptor_b = value,
            offset::HC_RH_STATUS => {
                if value & rh_status::LPSC != 0 {
                    for port in &mut self.ports {
                        port.powered = true;
                    }
                }
                if value & rh_status::LPS != 0 {
                    for port in &mut self.ports {
                        port.command(port::WRITE_CLEAR_PORT_POWER);
                    }
                }
            }
            reg if reg >= offset::HC_RH_PORT_STATUS => {
                let index = ((reg - offset::HC_RH_PORT_STATUS) / 4) as usize;
                if let Some(port) = self.ports.get_mut(index) {
                    port.command(value);
                }
            }
            _ => {}
        }
    }

    fn software_reset(&mut self) {
        if self.stuck_reset {
            self.regs.command_status |= command::HCR;
            return;
        }
        let rh_a = self.regs.rh_descriptor_a & rh_a::NDP_MASK;
        self.regs = Registers {
            control: control::HCFS_SUSPEND << control::HCFS_SHIFT,
            rh_descriptor_a: rh_a,
            ..Registers::default()
        };
        self.done_queue = 0;
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    fn advance(&mut self, microseconds: u32) {
        self.elapsed_us += u64::from(microseconds);
        self.partial_us += microseconds;
        while self.partial_us >= 1000 {
            self.partial_us -= 1000;
            self.run_frame();
        }
    }

    fn run_frame(&mut self) {
        for port in &mut self.ports {
            port.tick();
        }
        let state = (self.regs.control & control::HCFS_MASK) >> control::HCFS_SHIFT;
        if state != control::HCFS_OPERATIONAL || self.frame_clock_stopped {
            return;
        }

        self.frame = self.frame.wrapping_add(1);
        let hcca_base = self.regs.hcca;
        if hcca_base != 0 {
            self.write_u32(hcca_base + hcca::FRAME_NUMBER, self.frame & 0xFFFF);
        }
        self.regs.interrupt_status |= interrupt::SF;

        if self.regs.control & control::PLE != 0 && hcca_base != 0 {
            let slot = (self.frame as usize) % hcca::INTERRUPT_TABLE_ENTRIES;
            let head = self.read_u32(hcca_base + hcca::interrupt_entry(slot));
            self.walk_list(head, true);
        }
        if self.regs.control & control::CLE != 0
            && self.regs.command_status & command::CLF != 0
            && !self.walk_list(self.regs.control_head, false)
        {
            self.regs.command_status &= !command::CLF;
        }
        if self.regs.control & control::BLE != 0
            && self.regs.command_status & command::BLF != 0
            && !self.walk_list(self.regs.bulk_head, false)
        {
            self.regs.command_status &= !command::BLF;
        }

        if self.done_queue != 0
            && self.regs.interrupt_status & interrupt::WDH == 0
            && hcca_base != 0
        {
            self.write_u32(hcca_base + hcca::DONE_HEAD, self.done_queue);
            self.done_queue = 0;
            self.regs.interrupt_status |= interrupt::WDH;
        }
    }

    /// Service every ED from `head`; returns whether any ED had TDs queued
    fn walk_list(&mut self, head: u32, periodic: bool) -> bool {
        let mut busy = false;
        let mut ed = head & EndpointDescriptor::LINK_MASK;
        for _ in 0..MAX_WALK {
            if ed == 0 {
                break;
            }
            busy |= self.service_ed(ed, periodic);
            ed = self.read_u32(ed + EndpointDescriptor::NEXT_OFFSET) & EndpointDescriptor::LINK_MASK;
        }
        busy
    }

    /// Process the TDs queued on one ED; periodic EDs get one TD per frame
    fn service_ed(&mut self, ed: u32, periodic: bool) -> bool {
        let image = EndpointDescriptor::load(&MemoryView(&*self), BusAddr::new(ed));
        if image.is_skipped() || image.is_halted() || image.head() == image.tail() {
            return false;
        }
        for _ in 0..MAX_WALK {
            let current = EndpointDescriptor::load(&MemoryView(&*self), BusAddr::new(ed));
            if current.is_halted() || current.head() == current.tail() {
                break;
            }
            match self.service_td(ed, &current) {
                TdOutcome::Pending | TdOutcome::Halted => break,
                TdOutcome::Retired if periodic => break,
                TdOutcome::Retired => {}
            }
        }
        true
    }

    fn service_td(&mut self, ed_addr: u32, ed: &EndpointDescriptor) -> TdOutcome {
        let td_addr = ed.head().as_u32();
        let mut td = TransferDescriptor::load(&MemoryView(&*self), BusAddr::new(td_addr));
        let pid = match ed.direction() {
            EdDirection::Out => TdPid::Out,
            EdDirection::In => TdPid::In,
            EdDirection::FromTd => td.pid(),
        };
        let address = ed.function_address();
        let endpoint = ed.endpoint_number();
        let max_packet = usize::from(ed.max_packet_size()).max(1);

        loop {
            let toggle = if td.toggle_field() & TransferDescriptor::T_FROM_TD != 0 {
                td.toggle()
            } else {
                ed.toggle_carry()
            };
            let remaining = if td.current_buffer == 0 {
                0
            } else {
                (td.buffer_end - td.current_buffer + 1) as usize
            };
            let packet = remaining.min(max_packet);
            let mut out = vec![0u8; if pid == TdPid::In { 0 } else { packet }];
            self.read(td.current_buffer, &mut out);

            let reply = match self.devices.get_mut(&address) {
                Some(device) => device.handle(endpoint, pid, toggle, &out, packet),
                None => SimReply::NoResponse,
            };
            trace!(
                "sim: frame {} {}:{} {:?} DATA{} {} bytes -> {:?}",
                self.frame,
                address,
                endpoint,
                pid,
                toggle,
                packet,
                reply
            );

            let moved = match reply {
                SimReply::Nak => return TdOutcome::Pending,
                SimReply::Stall => return self.retire(ed_addr, td_addr, &mut td, CC_STALL),
                SimReply::NoResponse => {
                    td.control |= TransferDescriptor::EC_MASK;
                    return self.retire(ed_addr, td_addr, &mut td, CC_DEVICE_NOT_RESPONDING);
                }
                SimReply::Ack(data) if pid == TdPid::In => {
                    if data.len() > packet {
                        return self.retire(ed_addr, td_addr, &mut td, CC_DATA_OVERRUN);
                    }
                    self.write(td.current_buffer, &data);
                    data.len()
                }
                SimReply::Ack(_) => packet,
            };
            self.transactions.push(SimTransaction {
                address,
                endpoint,
                pid,
                toggle,
                length: moved,
                frame: self.frame,
            });

            // Advance the toggle and the buffer pointer
            td.control ^= 1 << TransferDescriptor::T_SHIFT;
            let short = moved < packet;
            if moved == remaining {
                td.current_buffer = 0;
            } else if moved > 0 {
                td.current_buffer += moved as u32;
            }
            if td.current_buffer == 0 || short {
                // Buffer rounding is always set by the engine
                return self.retire(ed_addr, td_addr, &mut td, CC_NO_ERROR);
            }
        }
    }

    /// Move a TD onto the done queue and the ED past it
    fn retire(&mut self, ed_addr: u32, td_addr: u32, td: &mut TransferDescriptor, code: u32) -> TdOutcome {
        let next = td.next_td & EndpointDescriptor::LINK_MASK;
        td.control = (td.control & !TransferDescriptor::CC_MASK) | (code << TransferDescriptor::CC_SHIFT);
        td.next_td = self.done_queue;
        self.done_queue = td_addr;
        self.write_u32(td_addr + TransferDescriptor::CONTROL_OFFSET, td.control);
        self.write_u32(td_addr + TransferDescriptor::CBP_OFFSET, td.current_buffer);
        self.write_u32(td_addr + TransferDescriptor::NEXT_OFFSET, td.next_td);

        let carry = if ConditionCode::from_raw(code) == ConditionCode::NoError {
            u32::from(td.toggle()) << 1
        } else {
            u32::from(td.toggle()) << 1 | EndpointDescriptor::HEAD_HALTED
        };
        self.write_u32(ed_addr + EndpointDescriptor::HEAD_OFFSET, next | carry);
        if code == CC_NO_ERROR {
            TdOutcome::Retired
        } else {
            TdOutcome::Halted
        }
    }
}

/// Lets the descriptor image loaders read straight out of locked state
struct MemoryView<'a>(&'a SimState);

impl OhciPlatform for MemoryView<'_> {
    fn read_register(&self, reg: u32) -> u32 {
        self.0.read_register(reg)
    }

    fn write_register(&self, _reg: u32, _value: u32) {}

    fn stall(&self, _microseconds: u32) {}

    fn allocate_coherent(&self, _pages: usize) -> Option<DmaRegion> {
        None
    }

    fn free_coherent(&self, _region: DmaRegion) {}

    fn map(&self, _operation: MapOperation, _buffer: &[u8]) -> Option<DmaMapping> {
        None
    }

    fn unmap(&self, _mapping: DmaMapping) {}

    fn read_dma(&self, addr: BusAddr, buf: &mut [u8]) {
        self.0.read(addr.as_u32(), buf);
    }

    fn write_dma(&self, _addr: BusAddr, _data: &[u8]) {}
}

/// Simulated controller, bus memory and root hub
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl SimPlatform {
    /// Controller with `ports` root hub ports, nothing connected
    pub fn new(ports: u8) -> Self {
        Self {
            state: Mutex::new(SimState::new(ports)),
        }
    }

    /// Attach a device answering to `address`
    pub fn attach_device(&self, address: u8, device: Box<dyn SimDevice>) {
        self.state.lock().devices.insert(address, device);
    }

    pub fn detach_device(&self, address: u8) {
        self.state.lock().devices.remove(&address);
    }

    /// Plug something into `port`; sets the connect status change
    pub fn connect(&self, port: u8, low_speed: bool) {
        if let Some(p) = self.state.lock().ports.get_mut(usize::from(port)) {
            p.connected = true;
            p.low_speed = low_speed;
            p.change |= port::CSC;
        }
    }

    pub fn disconnect(&self, port: u8) {
        if let Some(p) = self.state.lock().ports.get_mut(usize::from(port)) {
            p.connected = false;
            p.enabled = false;
            p.suspended = false;
            p.change |= port::CSC | port::PESC;
        }
    }

    /// Refuse coherent allocations after `count` more succeed
    pub fn fail_allocations_after(&self, count: usize) {
        self.state.lock().allocations_left = Some(count);
    }

    /// Refuse bus-master mappings after `count` more succeed
    pub fn fail_mappings_after(&self, count: usize) {
        self.state.lock().mappings_left = Some(count);
    }

    /// Lift both allocation limits
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.allocations_left = None;
        state.mappings_left = None;
    }

    /// Coherent pages allocated and not yet freed
    pub fn outstanding_pages(&self) -> usize {
        self.state.lock().coherent_pages
    }

    /// Mappings made and not yet unmapped
    pub fn outstanding_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Keep the controller reset bit set forever
    pub fn set_stuck_reset(&self, stuck: bool) {
        self.state.lock().stuck_reset = stuck;
    }

    /// Keep resets on `port` from ever completing
    pub fn set_stuck_port_reset(&self, port: u8, stuck: bool) {
        if let Some(p) = self.state.lock().ports.get_mut(usize::from(port)) {
            p.stuck_reset = stuck;
        }
    }

    /// Stop frame generation even while Operational
    pub fn set_frame_clock_stopped(&self, stopped: bool) {
        self.state.lock().frame_clock_stopped = stopped;
    }

    /// Acknowledged transactions so far, oldest first
    pub fn transactions(&self) -> Vec<SimTransaction> {
        self.state.lock().transactions.clone()
    }

    pub fn clear_transactions(&self) {
        self.state.lock().transactions.clear();
    }

    /// Frames run while Operational
    pub fn frame(&self) -> u32 {
        self.state.lock().frame
    }

    /// Total simulated time
    pub fn elapsed_us(&self) -> u64 {
        self.state.lock().elapsed_us
    }
}

impl OhciPlatform for SimPlatform {
    fn read_register(&self, reg: u32) -> u32 {
        self.state.lock().read_register(reg)
    }

    fn write_register(&self, reg: u32, value: u32) {
        self.state.lock().write_register(reg, value);
    }

    fn stall(&self, microseconds: u32) {
        self.state.lock().advance(microseconds);
    }

    fn allocate_coherent(&self, pages: usize) -> Option<DmaRegion> {
        let mut state = self.state.lock();
        if let Some(left) = state.allocations_left {
            if left == 0 {
                return None;
            }
            state.allocations_left = Some(left - 1);
        }
        let region = state.take_pages(pages)?;
        state.coherent_pages += region.pages;
        Some(region)
    }

    fn free_coherent(&self, region: DmaRegion) {
        let mut state = self.state.lock();
        state.give_pages(region);
        state.coherent_pages = state.coherent_pages.saturating_sub(region.pages);
    }

    fn map(&self, operation: MapOperation, buffer: &[u8]) -> Option<DmaMapping> {
        let mut state = self.state.lock();
        if let Some(left) = state.mappings_left {
            if left == 0 {
                return None;
            }
            state.mappings_left = Some(left - 1);
        }
        let region = state.take_pages(buffer.len().div_ceil(PAGE_SIZE))?;
        if operation != MapOperation::BusMasterWrite {
            state.write(region.bus_addr.as_u32(), buffer);
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.mappings.insert(handle, region);
        Some(DmaMapping {
            bus_addr: region.bus_addr,
            len: buffer.len(),
            operation,
            handle,
        })
    }

    fn unmap(&self, mapping: DmaMapping) {
        let mut state = self.state.lock();
        if let Some(region) = state.mappings.remove(&mapping.handle) {
            state.give_pages(region);
        }
    }

    fn read_dma(&self, addr: BusAddr, buf: &mut [u8]) {
        self.state.lock().read(addr.as_u32(), buf);
    }

    fn write_dma(&self, addr: BusAddr, data: &[u8]) {
        self.state.lock().write(addr.as_u32(), data);
    }
}
