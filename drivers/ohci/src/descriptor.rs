//! Hardware descriptor layouts
//!
//! Endpoint and transfer descriptors live in coherent memory and are shared
//! with the controller. Two ways to reach them:
//! - [`EndpointDescriptor`] / [`TransferDescriptor`] are plain images used to
//!   write a fresh descriptor before it is linked anywhere, and to inspect one
//! - [`Ed`] / [`Td`] are word-level views for descriptors the controller may
//!   already be walking; each setter touches exactly one 32-bit word

use log::debug;

use crate::{
    platform::{BusAddr, OhciPlatform},
    usb::UsbResult,
};

/// Descriptors are 16-byte aligned; the low nibble of a link carries flags
pub const DESCRIPTOR_ALIGN: u32 = 16;

// ============================================================================
// HCCA
// ============================================================================

/// Host Controller Communication Area layout
#[allow(dead_code)]
pub mod hcca {
    /// Bytes the controller owns; the rest of the page is unused
    pub const SIZE: usize = 256;
    pub const ALIGN: u32 = 256;
    pub const INTERRUPT_TABLE: u32 = 0x00;
    pub const INTERRUPT_TABLE_ENTRIES: usize = 32;
    pub const FRAME_NUMBER: u32 = 0x80;
    pub const DONE_HEAD: u32 = 0x84;

    pub const fn interrupt_entry(index: usize) -> u32 {
        INTERRUPT_TABLE + 4 * index as u32
    }
}

// ============================================================================
// Endpoint Descriptor
// ============================================================================

/// Direction field of an ED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdDirection {
    /// Each TD carries its own PID (control endpoints)
    FromTd = 0,
    Out = 1,
    In = 2,
}

impl EdDirection {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            1 => Self::Out,
            2 => Self::In,
            _ => Self::FromTd,
        }
    }
}

/// Endpoint Descriptor image (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub control: u32,
    pub tail_td: u32,
    pub head_td: u32,
    pub next_ed: u32,
}

impl EndpointDescriptor {
    /// Bytes the controller reads
    pub const SIZE: usize = 16;

    pub const CONTROL_OFFSET: u32 = 0x0;
    pub const TAIL_OFFSET: u32 = 0x4;
    pub const HEAD_OFFSET: u32 = 0x8;
    pub const NEXT_OFFSET: u32 = 0xC;

    pub const FA_MASK: u32 = 0x7F;
    pub const EN_SHIFT: u32 = 7;
    pub const EN_MASK: u32 = 0xF << 7;
    pub const D_SHIFT: u32 = 11;
    pub const D_MASK: u32 = 0x3 << 11;
    /// Low speed
    pub const S: u32 = 1 << 13;
    /// Skip
    pub const K: u32 = 1 << 14;
    /// Isochronous format
    pub const F: u32 = 1 << 15;
    pub const MPS_SHIFT: u32 = 16;
    pub const MPS_MASK: u32 = 0x7FF << 16;

    pub const HEAD_HALTED: u32 = 1 << 0;
    pub const HEAD_TOGGLE_CARRY: u32 = 1 << 1;
    pub const LINK_MASK: u32 = !(DESCRIPTOR_ALIGN - 1);

    /// Skipped, unlinked endpoint with no TDs
    pub fn new(
        function_address: u8,
        endpoint: u8,
        direction: EdDirection,
        low_speed: bool,
        max_packet_size: u16,
    ) -> Self {
        let mut control = (function_address as u32 & Self::FA_MASK)
            | ((endpoint as u32) << Self::EN_SHIFT & Self::EN_MASK)
            | ((direction as u32) << Self::D_SHIFT & Self::D_MASK)
            | Self::K
            | ((max_packet_size as u32) << Self::MPS_SHIFT & Self::MPS_MASK);
        if low_speed {
            control |= Self::S;
        }
        Self {
            control,
            ..Self::default()
        }
    }

    pub fn load<P: OhciPlatform>(platform: &P, addr: BusAddr) -> Self {
        Self {
            control: platform.read_u32(addr.offset(Self::CONTROL_OFFSET)),
            tail_td: platform.read_u32(addr.offset(Self::TAIL_OFFSET)),
            head_td: platform.read_u32(addr.offset(Self::HEAD_OFFSET)),
            next_ed: platform.read_u32(addr.offset(Self::NEXT_OFFSET)),
        }
    }

    /// Write the whole image; only valid while the ED is unlinked
    pub fn store<P: OhciPlatform>(&self, platform: &P, addr: BusAddr) {
        platform.write_u32(addr.offset(Self::TAIL_OFFSET), self.tail_td);
        platform.write_u32(addr.offset(Self::HEAD_OFFSET), self.head_td);
        platform.write_u32(addr.offset(Self::NEXT_OFFSET), self.next_ed);
        platform.write_u32(addr.offset(Self::CONTROL_OFFSET), self.control);
    }

    pub fn function_address(&self) -> u8 {
        (self.control & Self::FA_MASK) as u8
    }

    pub fn endpoint_number(&self) -> u8 {
        ((self.control & Self::EN_MASK) >> Self::EN_SHIFT) as u8
    }

    pub fn direction(&self) -> EdDirection {
        EdDirection::from_bits((self.control & Self::D_MASK) >> Self::D_SHIFT)
    }

    pub fn is_low_speed(&self) -> bool {
        self.control & Self::S != 0
    }

    pub fn is_skipped(&self) -> bool {
        self.control & Self::K != 0
    }

    pub fn max_packet_size(&self) -> u16 {
        ((self.control & Self::MPS_MASK) >> Self::MPS_SHIFT) as u16
    }

    pub fn is_halted(&self) -> bool {
        self.head_td & Self::HEAD_HALTED != 0
    }

    pub fn toggle_carry(&self) -> u8 {
        ((self.head_td & Self::HEAD_TOGGLE_CARRY) >> 1) as u8
    }

    pub fn head(&self) -> BusAddr {
        BusAddr::new(self.head_td & Self::LINK_MASK)
    }

    pub fn tail(&self) -> BusAddr {
        BusAddr::new(self.tail_td & Self::LINK_MASK)
    }

    pub fn next(&self) -> BusAddr {
        BusAddr::new(self.next_ed & Self::LINK_MASK)
    }
}

/// Word-level view of an ED in shared memory
pub struct Ed<'a, P: OhciPlatform> {
    platform: &'a P,
    addr: BusAddr,
}

impl<'a, P: OhciPlatform> Ed<'a, P> {
    pub fn new(platform: &'a P, addr: BusAddr) -> Self {
        Self { platform, addr }
    }

    pub fn addr(&self) -> BusAddr {
        self.addr
    }

    pub fn image(&self) -> EndpointDescriptor {
        EndpointDescriptor::load(self.platform, self.addr)
    }

    fn read(&self, offset: u32) -> u32 {
        self.platform.read_u32(self.addr.offset(offset))
    }

    fn write(&self, offset: u32, value: u32) {
        self.platform.write_u32(self.addr.offset(offset), value);
    }

    pub fn control(&self) -> u32 {
        self.read(EndpointDescriptor::CONTROL_OFFSET)
    }

    pub fn set_skip(&self, skip: bool) {
        let control = self.control();
        let control = if skip {
            control | EndpointDescriptor::K
        } else {
            control & !EndpointDescriptor::K
        };
        self.write(EndpointDescriptor::CONTROL_OFFSET, control);
    }

    pub fn is_skipped(&self) -> bool {
        self.control() & EndpointDescriptor::K != 0
    }

    /// Raw head word including the halted and toggle-carry flags
    pub fn head_word(&self) -> u32 {
        self.read(EndpointDescriptor::HEAD_OFFSET)
    }

    pub fn head(&self) -> BusAddr {
        BusAddr::new(self.head_word() & EndpointDescriptor::LINK_MASK)
    }

    pub fn is_halted(&self) -> bool {
        self.head_word() & EndpointDescriptor::HEAD_HALTED != 0
    }

    /// Point the ED at a new first TD, keeping the toggle carry and clearing
    /// the halted flag
    pub fn set_head(&self, td: BusAddr) {
        let carry = self.head_word() & EndpointDescriptor::HEAD_TOGGLE_CARRY;
        self.write(
            EndpointDescriptor::HEAD_OFFSET,
            (td.as_u32() & EndpointDescriptor::LINK_MASK) | carry,
        );
    }

    /// Restart the ED at `td` with halted and toggle carry both cleared
    pub fn reset_head(&self, td: BusAddr) {
        self.write(
            EndpointDescriptor::HEAD_OFFSET,
            td.as_u32() & EndpointDescriptor::LINK_MASK,
        );
    }

    pub fn tail(&self) -> BusAddr {
        BusAddr::new(self.read(EndpointDescriptor::TAIL_OFFSET) & EndpointDescriptor::LINK_MASK)
    }

    pub fn next(&self) -> BusAddr {
        BusAddr::new(self.read(EndpointDescriptor::NEXT_OFFSET) & EndpointDescriptor::LINK_MASK)
    }

    pub fn set_next(&self, ed: BusAddr) {
        self.write(EndpointDescriptor::NEXT_OFFSET, ed.as_u32());
    }
}

// ============================================================================
// Transfer Descriptor
// ============================================================================

/// PID carried by a general TD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdPid {
    Setup = 0,
    Out = 1,
    In = 2,
}

impl TdPid {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Setup,
            1 => Self::Out,
            _ => Self::In,
        }
    }

    /// PID of the status stage that closes a control transfer whose data
    /// stage used `self`
    pub fn status_stage(self) -> Self {
        match self {
            Self::Out => Self::In,
            _ => Self::Out,
        }
    }
}

/// Completion status written back by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionCode {
    NoError,
    Crc,
    BitStuffing,
    DataToggleMismatch,
    Stall,
    DeviceNotResponding,
    PidCheckFailure,
    UnexpectedPid,
    DataOverrun,
    DataUnderrun,
    BufferOverrun,
    BufferUnderrun,
    /// Reserved codes 10 and 11
    Reserved(u8),
    /// Still owned by the controller
    NotAccessed,
}

impl ConditionCode {
    /// Value software writes into a TD it hands to the controller
    pub const TO_BE_PROCESSED: u32 = 0xF;

    pub fn from_raw(raw: u32) -> Self {
        match raw & 0xF {
            0 => Self::NoError,
            1 => Self::Crc,
            2 => Self::BitStuffing,
            3 => Self::DataToggleMismatch,
            4 => Self::Stall,
            5 => Self::DeviceNotResponding,
            6 => Self::PidCheckFailure,
            7 => Self::UnexpectedPid,
            8 => Self::DataOverrun,
            9 => Self::DataUnderrun,
            12 => Self::BufferOverrun,
            13 => Self::BufferUnderrun,
            14 | 15 => Self::NotAccessed,
            other => Self::Reserved(other as u8),
        }
    }

    pub fn is_pending(self) -> bool {
        self == Self::NotAccessed
    }

    /// Portable result bitmask for this code
    pub fn to_usb_result(self) -> UsbResult {
        match self {
            Self::NoError => UsbResult::empty(),
            Self::NotAccessed => UsbResult::NOTEXECUTE,
            Self::Stall => UsbResult::STALL,
            Self::Crc => UsbResult::CRC,
            Self::BitStuffing => UsbResult::BITSTUFF,
            Self::DeviceNotResponding => UsbResult::TIMEOUT,
            Self::DataOverrun => UsbResult::BABBLE,
            Self::DataUnderrun | Self::BufferOverrun | Self::BufferUnderrun => UsbResult::BUFFER,
            Self::DataToggleMismatch
            | Self::PidCheckFailure
            | Self::UnexpectedPid
            | Self::Reserved(_) => UsbResult::SYSTEM,
        }
    }
}

/// General Transfer Descriptor image
///
/// The controller reads the first 16 bytes. The second half is the software
/// side record: the link the engine follows (hardware rewrites `next_td`
/// when it retires a TD to the done queue), where the data stage starts, and
/// how many bytes the TD covers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub control: u32,
    pub current_buffer: u32,
    pub next_td: u32,
    pub buffer_end: u32,
    pub next_sw: u32,
    pub data_buffer: u32,
    pub actual_length: u32,
    pub reserved: u32,
}

impl TransferDescriptor {
    /// Hardware part plus side record
    pub const SIZE: usize = 32;

    pub const CONTROL_OFFSET: u32 = 0x00;
    pub const CBP_OFFSET: u32 = 0x04;
    pub const NEXT_OFFSET: u32 = 0x08;
    pub const BE_OFFSET: u32 = 0x0C;
    pub const NEXT_SW_OFFSET: u32 = 0x10;
    pub const DATA_BUFFER_OFFSET: u32 = 0x14;
    pub const LENGTH_OFFSET: u32 = 0x18;

    /// Buffer rounding: a short final packet is not an error
    pub const R: u32 = 1 << 18;
    pub const DP_SHIFT: u32 = 19;
    pub const DP_MASK: u32 = 0x3 << 19;
    pub const DI_SHIFT: u32 = 21;
    pub const DI_MASK: u32 = 0x7 << 21;
    pub const T_SHIFT: u32 = 24;
    pub const T_MASK: u32 = 0x3 << 24;
    /// Toggle taken from the TD rather than the ED carry
    pub const T_FROM_TD: u32 = 0x2;
    pub const EC_SHIFT: u32 = 26;
    pub const EC_MASK: u32 = 0x3 << 26;
    pub const CC_SHIFT: u32 = 28;
    pub const CC_MASK: u32 = 0xF << 28;

    /// Interrupt at end of frame of completion
    pub const DI_NO_DELAY: u32 = 0;

    /// Armed TD covering `len` bytes at `buffer` (`len == 0` leaves both
    /// buffer pointers null)
    pub fn new(pid: TdPid, toggle: u32, buffer: BusAddr, len: u32) -> Self {
        let control = Self::R
            | ((pid as u32) << Self::DP_SHIFT & Self::DP_MASK)
            | (Self::DI_NO_DELAY << Self::DI_SHIFT & Self::DI_MASK)
            | (toggle << Self::T_SHIFT & Self::T_MASK)
            | (ConditionCode::TO_BE_PROCESSED << Self::CC_SHIFT);
        let (current_buffer, buffer_end) = if len == 0 || buffer.is_null() {
            (0, 0)
        } else {
            (buffer.as_u32(), buffer.as_u32() + len - 1)
        };
        Self {
            control,
            current_buffer,
            buffer_end,
            data_buffer: buffer.as_u32(),
            actual_length: len,
            ..Self::default()
        }
    }

    pub fn load<P: OhciPlatform>(platform: &P, addr: BusAddr) -> Self {
        let word = |offset: u32| platform.read_u32(addr.offset(offset));
        Self {
            control: word(Self::CONTROL_OFFSET),
            current_buffer: word(Self::CBP_OFFSET),
            next_td: word(Self::NEXT_OFFSET),
            buffer_end: word(Self::BE_OFFSET),
            next_sw: word(Self::NEXT_SW_OFFSET),
            data_buffer: word(Self::DATA_BUFFER_OFFSET),
            actual_length: word(Self::LENGTH_OFFSET),
            reserved: 0,
        }
    }

    /// Write the whole image; only valid while no ED points at the TD
    pub fn store<P: OhciPlatform>(&self, platform: &P, addr: BusAddr) {
        let write = |offset: u32, value: u32| platform.write_u32(addr.offset(offset), value);
        write(Self::CONTROL_OFFSET, self.control);
        write(Self::CBP_OFFSET, self.current_buffer);
        write(Self::NEXT_OFFSET, self.next_td);
        write(Self::BE_OFFSET, self.buffer_end);
        write(Self::NEXT_SW_OFFSET, self.next_sw);
        write(Self::DATA_BUFFER_OFFSET, self.data_buffer);
        write(Self::LENGTH_OFFSET, self.actual_length);
    }

    pub fn pid(&self) -> TdPid {
        TdPid::from_bits((self.control & Self::DP_MASK) >> Self::DP_SHIFT)
    }

    /// Full 2-bit toggle field
    pub fn toggle_field(&self) -> u32 {
        (self.control & Self::T_MASK) >> Self::T_SHIFT
    }

    /// Data toggle bit (DATA0 = 0, DATA1 = 1)
    pub fn toggle(&self) -> u8 {
        (self.toggle_field() & 1) as u8
    }

    pub fn condition_code(&self) -> ConditionCode {
        ConditionCode::from_raw((self.control & Self::CC_MASK) >> Self::CC_SHIFT)
    }

    pub fn error_count(&self) -> u32 {
        (self.control & Self::EC_MASK) >> Self::EC_SHIFT
    }

    /// Bytes moved so far, per the current buffer pointer
    pub fn transferred(&self) -> u32 {
        if self.current_buffer == 0 {
            self.actual_length
        } else {
            self.current_buffer.saturating_sub(self.data_buffer)
        }
    }
}

/// Word-level view of a TD in shared memory
pub struct Td<'a, P: OhciPlatform> {
    platform: &'a P,
    addr: BusAddr,
}

impl<'a, P: OhciPlatform> Td<'a, P> {
    pub fn new(platform: &'a P, addr: BusAddr) -> Self {
        Self { platform, addr }
    }

    pub fn image(&self) -> TransferDescriptor {
        TransferDescriptor::load(self.platform, self.addr)
    }

    fn read(&self, offset: u32) -> u32 {
        self.platform.read_u32(self.addr.offset(offset))
    }

    fn write(&self, offset: u32, value: u32) {
        self.platform.write_u32(self.addr.offset(offset), value);
    }

    /// Software link; never rewritten by the controller
    pub fn next_sw(&self) -> BusAddr {
        BusAddr::new(self.read(TransferDescriptor::NEXT_SW_OFFSET))
    }

    /// Link the TD to `next` in both the hardware and software chains
    pub fn link(&self, next: BusAddr) {
        self.write(TransferDescriptor::NEXT_OFFSET, next.as_u32());
        self.write(TransferDescriptor::NEXT_SW_OFFSET, next.as_u32());
    }

    pub fn condition_code(&self) -> ConditionCode {
        let control = self.read(TransferDescriptor::CONTROL_OFFSET);
        ConditionCode::from_raw((control & TransferDescriptor::CC_MASK) >> TransferDescriptor::CC_SHIFT)
    }

    /// Hand a completed TD back to the controller for another round
    pub fn rearm(&self, toggle: u8) {
        let image = self.image();
        let control = (image.control & !(TransferDescriptor::CC_MASK | TransferDescriptor::T_MASK))
            | (ConditionCode::TO_BE_PROCESSED << TransferDescriptor::CC_SHIFT)
            | (((TransferDescriptor::T_FROM_TD | toggle as u32) << TransferDescriptor::T_SHIFT)
                & TransferDescriptor::T_MASK);
        let current_buffer = if image.actual_length == 0 {
            0
        } else {
            image.data_buffer
        };
        self.write(TransferDescriptor::CBP_OFFSET, current_buffer);
        self.write(TransferDescriptor::NEXT_OFFSET, image.next_sw);
        self.write(TransferDescriptor::CONTROL_OFFSET, control);
    }
}

/// Log an ED and every TD on its software chain
pub fn dump_chain<P: OhciPlatform>(platform: &P, ed: BusAddr, first_td: BusAddr) {
    let image = EndpointDescriptor::load(platform, ed);
    debug!(
        "OHCI: ED {:?} fa={} ep={} dir={:?} mps={} skip={} halted={} head={:?} tail={:?} next={:?}",
        ed,
        image.function_address(),
        image.endpoint_number(),
        image.direction(),
        image.max_packet_size(),
        image.is_skipped(),
        image.is_halted(),
        image.head(),
        image.tail(),
        image.next()
    );
    let mut td = first_td;
    while !td.is_null() {
        let t = TransferDescriptor::load(platform, td);
        debug!(
            "OHCI:   TD {:?} pid={:?} toggle={} cc={:?} cbp=0x{:08x} be=0x{:08x} len={}",
            td,
            t.pid(),
            t.toggle(),
            t.condition_code(),
            t.current_buffer,
            t.buffer_end,
            t.actual_length
        );
        td = BusAddr::new(t.next_sw);
    }
}
