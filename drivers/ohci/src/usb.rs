//! Caller-facing USB types
//!
//! Everything a USB bus layer passes into or receives from the host
//! controller: speeds, setup packets, result bitmasks, root hub port status
//! and controller state.

use bitflags::bitflags;

/// USB device speeds reachable through an OHCI root hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,  // 1.5 Mbps
    Full, // 12 Mbps
    High, // 480 Mbps, never reported by OHCI
}

/// Direction of the data stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    In,
    Out,
    NoData,
}

/// Endpoint address bit selecting device-to-host
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Endpoint number portion of an endpoint address
pub const fn endpoint_number(endpoint_address: u8) -> u8 {
    endpoint_address & 0x0F
}

pub const fn endpoint_is_in(endpoint_address: u8) -> bool {
    endpoint_address & ENDPOINT_DIR_IN != 0
}

/// Standard 8-byte setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl DeviceRequest {
    /// Size of the setup packet on the wire
    pub const SIZE: usize = 8;

    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Little-endian wire image
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

bitflags! {
    /// Bus-level transfer result, reported separately from the call outcome
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsbResult: u32 {
        const NOTEXECUTE = 0x0001;
        const STALL = 0x0002;
        const BUFFER = 0x0004;
        const BABBLE = 0x0008;
        const NAK = 0x0010;
        const CRC = 0x0020;
        const TIMEOUT = 0x0040;
        const BITSTUFF = 0x0080;
        const SYSTEM = 0x0100;
    }
}

bitflags! {
    /// Root hub port status
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION = 0x0001;
        const ENABLE = 0x0002;
        const SUSPEND = 0x0004;
        const OVERCURRENT = 0x0008;
        const RESET = 0x0010;
        const POWER = 0x0100;
        const LOW_SPEED = 0x0200;
    }
}

bitflags! {
    /// Root hub port status-change bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PortChange: u16 {
        const C_CONNECTION = 0x0001;
        const C_ENABLE = 0x0002;
        const C_SUSPEND = 0x0004;
        const C_OVERCURRENT = 0x0008;
        const C_RESET = 0x0010;
    }
}

/// Snapshot of one root hub port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbPortStatus {
    pub status: PortStatus,
    pub change: PortChange,
}

impl UsbPortStatus {
    pub fn speed(&self) -> UsbSpeed {
        if self.status.contains(PortStatus::LOW_SPEED) {
            UsbSpeed::Low
        } else {
            UsbSpeed::Full
        }
    }
}

/// Root hub port features that can be set or cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFeature {
    Enable,
    Suspend,
    Reset,
    Power,
    ConnectChange,
    EnableChange,
    SuspendChange,
    OverCurrentChange,
    ResetChange,
}

bitflags! {
    /// Controller reset scope
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResetAttributes: u16 {
        /// Drive USB reset on the whole bus
        const GLOBAL = 0x0001;
        /// Reset the controller itself
        const HOST_CONTROLLER = 0x0002;
    }
}

/// Abstract controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcState {
    Halt,
    Operational,
    Suspend,
}

/// Static controller capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub max_speed: UsbSpeed,
    pub port_count: u8,
    pub is_64bit: bool,
}

/// Outcome of a successful transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Always empty on success; kept so callers see one result shape
    pub result: UsbResult,
    /// Bytes moved in the data stage
    pub length: usize,
}

impl Completion {
    pub fn new(length: usize) -> Self {
        Self {
            result: UsbResult::empty(),
            length,
        }
    }
}
