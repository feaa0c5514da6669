//! OHCI operational register layout
//!
//! Offsets and bit positions follow the OHCI 1.0a register map.
//! [`OperationalRegisters`] wraps the read-modify-write sequences the engine
//! performs on them.

use crate::platform::{BusAddr, OhciPlatform};

/// Register offsets from the controller's MMIO base
#[allow(dead_code)]
pub mod offset {
    pub const HC_REVISION: u32 = 0x00;
    pub const HC_CONTROL: u32 = 0x04;
    pub const HC_COMMAND_STATUS: u32 = 0x08;
    pub const HC_INTERRUPT_STATUS: u32 = 0x0C;
    pub const HC_INTERRUPT_ENABLE: u32 = 0x10;
    pub const HC_INTERRUPT_DISABLE: u32 = 0x14;
    pub const HC_HCCA: u32 = 0x18;
    pub const HC_PERIOD_CURRENT_ED: u32 = 0x1C;
    pub const HC_CONTROL_HEAD_ED: u32 = 0x20;
    pub const HC_CONTROL_CURRENT_ED: u32 = 0x24;
    pub const HC_BULK_HEAD_ED: u32 = 0x28;
    pub const HC_BULK_CURRENT_ED: u32 = 0x2C;
    pub const HC_DONE_HEAD: u32 = 0x30;
    pub const HC_FM_INTERVAL: u32 = 0x34;
    pub const HC_FM_REMAINING: u32 = 0x38;
    pub const HC_FM_NUMBER: u32 = 0x3C;
    pub const HC_PERIODIC_START: u32 = 0x40;
    pub const HC_LS_THRESHOLD: u32 = 0x44;
    pub const HC_RH_DESCRIPTOR_A: u32 = 0x48;
    pub const HC_RH_DESCRIPTOR_B: u32 = 0x4C;
    pub const HC_RH_STATUS: u32 = 0x50;
    /// First port; port `n` lives at `HC_RH_PORT_STATUS + 4 * n`
    pub const HC_RH_PORT_STATUS: u32 = 0x54;

    pub const fn port_status(port: u8) -> u32 {
        HC_RH_PORT_STATUS + 4 * port as u32
    }
}

/// HcControl bits
#[allow(dead_code)]
pub mod control {
    /// Control/bulk service ratio
    pub const CBSR_MASK: u32 = 0x3;
    pub const PLE: u32 = 1 << 2;
    pub const IE: u32 = 1 << 3;
    pub const CLE: u32 = 1 << 4;
    pub const BLE: u32 = 1 << 5;
    pub const HCFS_SHIFT: u32 = 6;
    pub const HCFS_MASK: u32 = 0x3 << HCFS_SHIFT;
    pub const IR: u32 = 1 << 8;
    pub const RWC: u32 = 1 << 9;
    pub const RWE: u32 = 1 << 10;

    /// Values of the 2-bit functional state field
    pub const HCFS_RESET: u32 = 0;
    pub const HCFS_RESUME: u32 = 1;
    pub const HCFS_OPERATIONAL: u32 = 2;
    pub const HCFS_SUSPEND: u32 = 3;
}

/// HcCommandStatus bits
#[allow(dead_code)]
pub mod command {
    pub const HCR: u32 = 1 << 0;
    pub const CLF: u32 = 1 << 1;
    pub const BLF: u32 = 1 << 2;
    pub const OCR: u32 = 1 << 3;
}

/// HcInterruptStatus / Enable / Disable bits
#[allow(dead_code)]
pub mod interrupt {
    pub const SO: u32 = 1 << 0;
    /// Writeback done head
    pub const WDH: u32 = 1 << 1;
    /// Start of frame
    pub const SF: u32 = 1 << 2;
    pub const RD: u32 = 1 << 3;
    pub const UE: u32 = 1 << 4;
    pub const FNO: u32 = 1 << 5;
    pub const RHSC: u32 = 1 << 6;
    pub const OC: u32 = 1 << 30;
    pub const MIE: u32 = 1 << 31;
}

/// HcFmInterval fields and the values programmed at reset
#[allow(dead_code)]
pub mod frame {
    pub const FI_MASK: u32 = 0x3FFF;
    pub const FSMPS_SHIFT: u32 = 16;
    pub const FSMPS_MASK: u32 = 0x7FFF << FSMPS_SHIFT;
    pub const FIT: u32 = 1 << 31;

    /// 12000 bit times per 1 ms frame, minus one
    pub const FRAME_INTERVAL: u32 = 0x2EDF;
    pub const FS_LARGEST_DATA_PACKET: u32 = 0x2778;
    /// 90% of the frame interval
    pub const PERIODIC_START: u32 = 0x2A2F;
    pub const PERIODIC_START_MASK: u32 = 0x3FFF;
    /// 4:1 control/bulk
    pub const CONTROL_BULK_RATIO: u32 = 3;
}

/// HcRhDescriptorA fields
#[allow(dead_code)]
pub mod rh_a {
    pub const NDP_MASK: u32 = 0xFF;
    pub const PSM: u32 = 1 << 8;
    pub const NPS: u32 = 1 << 9;
    pub const DT: u32 = 1 << 10;
    pub const OCPM: u32 = 1 << 11;
    pub const NOCP: u32 = 1 << 12;
    pub const POTPGT_SHIFT: u32 = 24;
}

/// HcRhDescriptorB fields
#[allow(dead_code)]
pub mod rh_b {
    pub const DR_MASK: u32 = 0xFFFF;
    pub const PPCM_SHIFT: u32 = 16;
    pub const PPCM_MASK: u32 = 0xFFFF << PPCM_SHIFT;
}

/// HcRhStatus bits
#[allow(dead_code)]
pub mod rh_status {
    /// Read: local power status; write: clear global power
    pub const LPS: u32 = 1 << 0;
    pub const OCI: u32 = 1 << 1;
    pub const DRWE: u32 = 1 << 15;
    /// Read: local power status change; write: set global power
    pub const LPSC: u32 = 1 << 16;
    pub const OCIC: u32 = 1 << 17;
    pub const CRWE: u32 = 1 << 31;
}

/// HcRhPortStatus bits
///
/// Status bits double as commands when written: a write of one to a status
/// bit performs the action named in the `WRITE_*` alias, a write of zero
/// does nothing. Change bits are write-one-to-clear.
#[allow(dead_code)]
pub mod port {
    pub const CCS: u32 = 1 << 0;
    pub const PES: u32 = 1 << 1;
    pub const PSS: u32 = 1 << 2;
    pub const POCI: u32 = 1 << 3;
    pub const PRS: u32 = 1 << 4;
    pub const PPS: u32 = 1 << 8;
    pub const LSDA: u32 = 1 << 9;

    pub const CSC: u32 = 1 << 16;
    pub const PESC: u32 = 1 << 17;
    pub const PSSC: u32 = 1 << 18;
    pub const OCIC: u32 = 1 << 19;
    pub const PRSC: u32 = 1 << 20;
    pub const CHANGE_MASK: u32 = CSC | PESC | PSSC | OCIC | PRSC;

    pub const WRITE_CLEAR_PORT_ENABLE: u32 = CCS;
    pub const WRITE_SET_PORT_ENABLE: u32 = PES;
    pub const WRITE_SET_PORT_SUSPEND: u32 = PSS;
    pub const WRITE_CLEAR_SUSPEND_STATUS: u32 = POCI;
    pub const WRITE_SET_PORT_RESET: u32 = PRS;
    pub const WRITE_SET_PORT_POWER: u32 = PPS;
    pub const WRITE_CLEAR_PORT_POWER: u32 = LSDA;
}

/// Typed access to one controller's operational registers
pub struct OperationalRegisters<'a, P: OhciPlatform> {
    platform: &'a P,
}

impl<'a, P: OhciPlatform> OperationalRegisters<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    pub fn read(&self, offset: u32) -> u32 {
        self.platform.read_register(offset)
    }

    pub fn write(&self, offset: u32, value: u32) {
        self.platform.write_register(offset, value);
    }

    /// Read-modify-write `mask` to all ones or all zeroes
    pub fn update(&self, offset: u32, mask: u32, set: bool) {
        let value = self.read(offset);
        let value = if set { value | mask } else { value & !mask };
        self.write(offset, value);
    }

    /// Replace the field selected by `mask` with `value << shift`
    pub fn write_field(&self, offset: u32, mask: u32, shift: u32, value: u32) {
        let current = self.read(offset) & !mask;
        self.write(offset, current | ((value << shift) & mask));
    }

    pub fn list_enabled(&self, enable_bit: u32) -> bool {
        self.read(offset::HC_CONTROL) & enable_bit != 0
    }

    /// Set or clear PLE/IE/CLE/BLE bits in HcControl
    pub fn set_list_enable(&self, enable_bits: u32, on: bool) {
        self.update(offset::HC_CONTROL, enable_bits, on);
    }

    pub fn functional_state(&self) -> u32 {
        (self.read(offset::HC_CONTROL) & control::HCFS_MASK) >> control::HCFS_SHIFT
    }

    pub fn set_functional_state(&self, state: u32) {
        self.write_field(
            offset::HC_CONTROL,
            control::HCFS_MASK,
            control::HCFS_SHIFT,
            state,
        );
    }

    pub fn command_status(&self) -> u32 {
        self.read(offset::HC_COMMAND_STATUS)
    }

    pub fn set_command(&self, bits: u32, on: bool) {
        self.update(offset::HC_COMMAND_STATUS, bits, on);
    }

    pub fn interrupt_status(&self) -> u32 {
        self.read(offset::HC_INTERRUPT_STATUS)
    }

    /// Write-one-to-clear
    pub fn clear_interrupt_status(&self, bits: u32) {
        self.write(offset::HC_INTERRUPT_STATUS, bits);
    }

    pub fn control_head(&self) -> BusAddr {
        BusAddr::new(self.read(offset::HC_CONTROL_HEAD_ED))
    }

    pub fn set_control_head(&self, ed: BusAddr) {
        self.write(offset::HC_CONTROL_HEAD_ED, ed.as_u32());
    }

    pub fn bulk_head(&self) -> BusAddr {
        BusAddr::new(self.read(offset::HC_BULK_HEAD_ED))
    }

    pub fn set_bulk_head(&self, ed: BusAddr) {
        self.write(offset::HC_BULK_HEAD_ED, ed.as_u32());
    }

    pub fn set_hcca(&self, hcca: BusAddr) {
        self.write(offset::HC_HCCA, hcca.as_u32());
    }

    pub fn frame_number(&self) -> u16 {
        (self.read(offset::HC_FM_NUMBER) & 0xFFFF) as u16
    }

    /// Number of downstream ports reported in HcRhDescriptorA
    pub fn port_count(&self) -> u8 {
        (self.read(offset::HC_RH_DESCRIPTOR_A) & rh_a::NDP_MASK) as u8
    }

    pub fn port_status(&self, port: u8) -> u32 {
        self.read(offset::port_status(port))
    }

    /// Issue a port command; see [`port`] for write semantics
    pub fn write_port_status(&self, port: u8, bits: u32) {
        self.write(offset::port_status(port), bits);
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    #[test]
    fn test_functional_state_field() {
        let sim = SimPlatform::new(2);
        let regs = OperationalRegisters::new(&sim);
        regs.write(offset::HC_CONTROL, control::CLE | control::IR);
        regs.set_functional_state(control::HCFS_SUSPEND);
        assert_eq!(regs.functional_state(), control::HCFS_SUSPEND);
        // Neighbouring bits survive the field write
        assert_eq!(
            regs.read(offset::HC_CONTROL) & (control::CLE | control::IR),
            control::CLE | control::IR
        );
    }

    #[test]
    fn test_list_enable_bits() {
        let sim = SimPlatform::new(2);
        let regs = OperationalRegisters::new(&sim);
        regs.set_list_enable(control::PLE | control::BLE, true);
        assert!(regs.list_enabled(control::PLE));
        assert!(regs.list_enabled(control::BLE));
        assert!(!regs.list_enabled(control::CLE));
        regs.set_list_enable(control::PLE, false);
        assert!(!regs.list_enabled(control::PLE));
        assert!(regs.list_enabled(control::BLE));
    }

    #[test]
    fn test_port_status_offsets() {
        assert_eq!(offset::port_status(0), 0x54);
        assert_eq!(offset::port_status(3), 0x60);
    }
}
