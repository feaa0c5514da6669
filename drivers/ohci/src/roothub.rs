//! Controller state and root hub
//!
//! Capability and state queries, the reset and bring-up sequences, and
//! root hub port management. Every port command is followed by a bounded
//! poll of the status bit it should have changed; running out of retries
//! is reported as [`OhciError::HardwareError`] rather than retried.

use log::{debug, error, info, warn};

use crate::{
    controller::OhciController,
    error::{OhciError, OhciResult},
    platform::{BusAddr, OhciPlatform},
    regs::{command, control, frame, interrupt, offset, port, rh_a, rh_b, rh_status},
    usb::{
        Capability, HcState, PortChange, PortFeature, PortStatus, ResetAttributes, UsbPortStatus,
        UsbSpeed,
    },
};

/// Port status register bits and the caller-facing flags they map to
const STATUS_BITS: [(u32, PortStatus); 7] = [
    (port::CCS, PortStatus::CONNECTION),
    (port::PES, PortStatus::ENABLE),
    (port::PSS, PortStatus::SUSPEND),
    (port::POCI, PortStatus::OVERCURRENT),
    (port::PRS, PortStatus::RESET),
    (port::PPS, PortStatus::POWER),
    (port::LSDA, PortStatus::LOW_SPEED),
];

const CHANGE_BITS: [(u32, PortChange); 5] = [
    (port::CSC, PortChange::C_CONNECTION),
    (port::PESC, PortChange::C_ENABLE),
    (port::PSSC, PortChange::C_SUSPEND),
    (port::OCIC, PortChange::C_OVERCURRENT),
    (port::PRSC, PortChange::C_RESET),
];

/// Translate a raw HcRhPortStatus value
pub fn decode_port_status(raw: u32) -> UsbPortStatus {
    let mut status = UsbPortStatus::default();
    for (bit, flag) in STATUS_BITS {
        if raw & bit != 0 {
            status.status |= flag;
        }
    }
    for (bit, flag) in CHANGE_BITS {
        if raw & bit != 0 {
            status.change |= flag;
        }
    }
    status
}

impl<P: OhciPlatform> OhciController<P> {
    pub fn capability(&self) -> Capability {
        Capability {
            max_speed: UsbSpeed::Full,
            port_count: self.regs().port_count(),
            is_64bit: false,
        }
    }

    pub fn state(&self) -> HcState {
        match self.regs().functional_state() {
            control::HCFS_OPERATIONAL => HcState::Operational,
            control::HCFS_SUSPEND => HcState::Suspend,
            // Reset and Resume
            _ => HcState::Halt,
        }
    }

    pub fn set_state(&mut self, state: HcState) -> OhciResult<()> {
        let outcome = match state {
            HcState::Halt => {
                self.regs().set_functional_state(control::HCFS_RESET);
                Ok(())
            }
            HcState::Operational => self.bring_up(),
            HcState::Suspend => {
                self.regs().set_functional_state(control::HCFS_SUSPEND);
                Ok(())
            }
        };
        self.platform.stall(self.config.state_settle_us);
        if outcome.is_ok() {
            info!("OHCI: state -> {:?}", state);
        }
        outcome
    }

    /// Enable all lists, enter Operational and wait for the first SOF
    fn bring_up(&self) -> OhciResult<()> {
        let regs = self.regs();
        regs.set_list_enable(control::PLE | control::CLE | control::BLE, true);
        regs.set_functional_state(control::HCFS_OPERATIONAL);
        self.platform.stall(self.config.bring_up_settle_us);

        let mut seen = regs.interrupt_status() & interrupt::SF != 0;
        let mut retries = 0;
        while !seen && retries < self.config.sof_retry_budget {
            self.platform.stall(self.config.poll_interval_us);
            retries += 1;
            seen = regs.interrupt_status() & interrupt::SF != 0;
        }
        if !seen {
            error!("OHCI: no start of frame after entering Operational");
            return Err(OhciError::HardwareError {
                register: "HcInterruptStatus",
                expected: "start of frame",
            });
        }
        regs.clear_interrupt_status(interrupt::SF);
        self.platform.stall(self.config.state_settle_us);
        Ok(())
    }

    /// Reset the controller and/or the bus and reprogram the operational
    /// registers.
    ///
    /// Every registered asynchronous interrupt transfer is discarded and
    /// the periodic tree is rebuilt. The controller is left halted with
    /// empty control and bulk lists.
    pub fn reset(&mut self, attributes: ResetAttributes) -> OhciResult<()> {
        if attributes.bits() & !ResetAttributes::all().bits() != 0 {
            return Err(OhciError::InvalidParameter {
                name: "attributes",
                reason: "unknown reset attribute",
            });
        }

        if attributes.contains(ResetAttributes::HOST_CONTROLLER) {
            self.reset_host_controller()?;
        }

        self.free_interrupt_memory();
        self.free_interrupt_tree();
        self.init_interrupt_tree()?;

        let regs = self.regs();
        regs.write_field(offset::HC_FM_INTERVAL, frame::FI_MASK, 0, frame::FRAME_INTERVAL);
        if attributes.contains(ResetAttributes::GLOBAL) {
            regs.set_functional_state(control::HCFS_RESET);
            self.platform.stall(self.config.reset_settle_us);
        }

        regs.write_field(
            offset::HC_FM_INTERVAL,
            frame::FSMPS_MASK,
            frame::FSMPS_SHIFT,
            frame::FS_LARGEST_DATA_PACKET,
        );
        regs.write_field(offset::HC_FM_INTERVAL, frame::FI_MASK, 0, frame::FRAME_INTERVAL);
        regs.write_field(
            offset::HC_PERIODIC_START,
            frame::PERIODIC_START_MASK,
            0,
            frame::PERIODIC_START,
        );
        regs.write_field(
            offset::HC_CONTROL,
            control::CBSR_MASK,
            0,
            frame::CONTROL_BULK_RATIO,
        );
        regs.set_command(command::CLF | command::BLF, false);

        regs.update(offset::HC_RH_DESCRIPTOR_A, rh_a::PSM, false);
        regs.update(offset::HC_RH_DESCRIPTOR_A, rh_a::NPS | rh_a::NOCP, true);
        regs.write_field(offset::HC_RH_DESCRIPTOR_B, rh_b::DR_MASK, 0, 0);
        regs.write_field(
            offset::HC_RH_DESCRIPTOR_B,
            rh_b::PPCM_MASK,
            rh_b::PPCM_SHIFT,
            0xFFFF,
        );
        regs.write(offset::HC_RH_STATUS, rh_status::LPSC);
        regs.write_port_status(0, port::WRITE_SET_PORT_POWER);

        for index in 0..regs.port_count() {
            self.reset_port(index);
        }

        let regs = self.regs();
        regs.set_hcca(self.hcca.bus_addr);
        regs.set_control_head(BusAddr::NULL);
        regs.set_bulk_head(BusAddr::NULL);
        info!("OHCI: reset complete ({:?})", attributes);
        Ok(())
    }

    fn reset_host_controller(&self) -> OhciResult<()> {
        let regs = self.regs();
        self.platform.stall(self.config.reset_settle_us);
        regs.set_command(command::HCR, true);
        self.platform.stall(self.config.reset_settle_us);

        for _ in 0..self.config.reset_retry_budget {
            self.platform.stall(self.config.reset_retry_delay_us);
            if regs.command_status() & command::HCR == 0 {
                return Ok(());
            }
        }
        error!("OHCI: host controller reset did not complete");
        Err(OhciError::HardwareError {
            register: "HcCommandStatus",
            expected: "HostControllerReset to clear",
        })
    }

    /// Reset and enable one port during controller reset; failures are
    /// logged and the port is left alone
    fn reset_port(&self, index: u8) {
        if let Err(e) = self.set_feature(index, PortFeature::Reset) {
            warn!("OHCI: port {} reset failed: {}", index, e);
            return;
        }
        self.platform.stall(self.config.port_reset_hold_us);
        // Clearing Reset is a no-op; the controller ends the reset itself
        self.platform.stall(self.config.port_step_us);
        if let Err(e) = self.set_feature(index, PortFeature::Enable) {
            warn!("OHCI: port {} enable failed: {}", index, e);
        }
        self.platform.stall(self.config.port_step_us);
    }

    fn check_port(&self, index: u8) -> OhciResult<()> {
        if index >= self.regs().port_count() {
            return Err(OhciError::InvalidParameter {
                name: "port",
                reason: "no such root hub port",
            });
        }
        Ok(())
    }

    /// Poll the port until `done` holds, within the port retry budget
    fn wait_port(
        &self,
        index: u8,
        expected: &'static str,
        done: impl Fn(u32) -> bool,
    ) -> OhciResult<()> {
        for _ in 0..self.config.port_retry_budget {
            self.platform.stall(self.config.port_retry_delay_us);
            if done(self.regs().port_status(index)) {
                return Ok(());
            }
        }
        Err(OhciError::HardwareError {
            register: "HcRhPortStatus",
            expected,
        })
    }

    pub fn port_status(&self, index: u8) -> OhciResult<UsbPortStatus> {
        self.check_port(index)?;
        Ok(decode_port_status(self.regs().port_status(index)))
    }

    pub fn set_port_feature(&mut self, index: u8, feature: PortFeature) -> OhciResult<()> {
        self.set_feature(index, feature)
    }

    fn set_feature(&self, index: u8, feature: PortFeature) -> OhciResult<()> {
        self.check_port(index)?;
        let regs = self.regs();
        match feature {
            PortFeature::Power => {
                regs.write_port_status(index, port::WRITE_SET_PORT_POWER);
                self.wait_port(index, "port power on", |s| s & port::PPS != 0)?;
            }
            PortFeature::Reset => {
                regs.write_port_status(index, port::WRITE_SET_PORT_RESET);
                self.wait_port(index, "port reset to complete", |s| {
                    s & port::PRSC != 0 && s & port::PRS == 0
                })?;
                regs.write_port_status(index, port::PRSC);
            }
            PortFeature::Enable => {
                regs.write_port_status(index, port::WRITE_SET_PORT_ENABLE);
                self.wait_port(index, "port enabled", |s| s & port::PES != 0)?;
            }
            PortFeature::Suspend => {
                regs.write_port_status(index, port::WRITE_SET_PORT_SUSPEND);
                self.wait_port(index, "port suspended", |s| s & port::PSS != 0)?;
            }
            _ => {
                return Err(OhciError::InvalidParameter {
                    name: "feature",
                    reason: "cannot be set on a root hub port",
                })
            }
        }
        debug!("OHCI: port {} set {:?}", index, feature);
        Ok(())
    }

    pub fn clear_port_feature(&mut self, index: u8, feature: PortFeature) -> OhciResult<()> {
        self.check_port(index)?;
        let (command, bit, expected) = match feature {
            PortFeature::Enable => (port::WRITE_CLEAR_PORT_ENABLE, port::PES, "port disabled"),
            PortFeature::Suspend => (
                port::WRITE_CLEAR_SUSPEND_STATUS,
                port::PSS,
                "port resumed",
            ),
            PortFeature::Reset => return Ok(()),
            PortFeature::Power => (port::WRITE_CLEAR_PORT_POWER, port::PPS, "port power off"),
            PortFeature::ConnectChange => (port::CSC, port::CSC, "connect change cleared"),
            PortFeature::EnableChange => (port::PESC, port::PESC, "enable change cleared"),
            PortFeature::SuspendChange => (port::PSSC, port::PSSC, "suspend change cleared"),
            PortFeature::OverCurrentChange => {
                (port::OCIC, port::OCIC, "over-current change cleared")
            }
            PortFeature::ResetChange => (port::PRSC, port::PRSC, "reset change cleared"),
        };
        self.regs().write_port_status(index, command);
        self.wait_port(index, expected, |s| s & bit == 0)?;
        debug!("OHCI: port {} cleared {:?}", index, feature);
        Ok(())
    }
}
