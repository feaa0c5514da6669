//! Controller lifecycle and root hub port management

mod common;

use common::*;
use ohci_hcd::{
    sim::SimPlatform, HcState, InterruptCallback, OhciController, OhciError, OhciPlatform, PortChange,
    PortFeature, PortStatus, ResetAttributes, UsbHostController, UsbResult, UsbSpeed,
};

#[test]
fn test_capability_and_state_transitions() {
    let sim = SimPlatform::new(3);
    let mut hc = OhciController::new(&sim, test_config()).unwrap();
    let capability = hc.capability();
    assert_eq!(capability.port_count, 3);
    assert_eq!(capability.max_speed, UsbSpeed::Full);
    assert!(!capability.is_64bit);
    assert_eq!(hc.name(), "OHCI");

    hc.reset(ResetAttributes::HOST_CONTROLLER).unwrap();
    assert_ne!(hc.state(), HcState::Operational);

    hc.set_state(HcState::Operational).unwrap();
    assert_eq!(hc.state(), HcState::Operational);
    let frame = sim.frame();
    sim.stall(5_000);
    assert_eq!(sim.frame(), frame + 5);
    assert_eq!(u32::from(hc.hcca_frame_number()), sim.frame());

    hc.set_state(HcState::Suspend).unwrap();
    assert_eq!(hc.state(), HcState::Suspend);
    let frame = sim.frame();
    sim.stall(5_000);
    assert_eq!(sim.frame(), frame);

    hc.set_state(HcState::Halt).unwrap();
    assert_eq!(hc.state(), HcState::Halt);
}

#[test]
fn test_reset_enables_connected_ports() {
    let sim = SimPlatform::new(2);
    sim.connect(0, false);
    sim.connect(1, true);
    let mut hc = operational(&sim);

    let full = hc.port_status(0).unwrap();
    assert!(full
        .status
        .contains(PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::POWER));
    assert_eq!(full.speed(), UsbSpeed::Full);
    // Reset change was acknowledged by the reset sequence
    assert!(!full.change.contains(PortChange::C_RESET));
    assert!(full.change.contains(PortChange::C_CONNECTION));

    let low = hc.port_status(1).unwrap();
    assert!(low.status.contains(PortStatus::ENABLE));
    assert_eq!(low.speed(), UsbSpeed::Low);

    hc.clear_port_feature(0, PortFeature::ConnectChange).unwrap();
    assert!(hc.port_status(0).unwrap().change.is_empty());
}

#[test]
fn test_empty_port_is_skipped_during_reset() {
    let sim = SimPlatform::new(2);
    sim.connect(1, false);
    let hc = operational(&sim);
    let empty = hc.port_status(0).unwrap();
    assert!(!empty.status.contains(PortStatus::ENABLE));
    assert!(hc.port_status(1).unwrap().status.contains(PortStatus::ENABLE));
}

#[test]
fn test_stuck_port_reset_is_a_hardware_error() {
    let sim = SimPlatform::new(2);
    sim.connect(0, false);
    sim.connect(1, false);
    sim.set_stuck_port_reset(1, true);
    // The reset sequence logs the stuck port and carries on
    let mut hc = operational(&sim);
    assert!(!hc.port_status(1).unwrap().status.contains(PortStatus::ENABLE));
    assert!(hc.port_status(0).unwrap().status.contains(PortStatus::ENABLE));

    assert_eq!(
        hc.set_port_feature(1, PortFeature::Reset),
        Err(OhciError::HardwareError {
            register: "HcRhPortStatus",
            expected: "port reset to complete",
        })
    );
    // Still resetting, and the change bit was never acknowledged or set
    let status = hc.port_status(1).unwrap();
    assert!(status.status.contains(PortStatus::RESET));
    assert!(!status.status.contains(PortStatus::ENABLE));
    assert!(!status.change.contains(PortChange::C_RESET));
}

#[test]
fn test_port_reset_feature() {
    let sim = SimPlatform::new(1);
    sim.connect(0, false);
    let mut hc = operational(&sim);

    hc.clear_port_feature(0, PortFeature::Enable).unwrap();
    assert!(!hc.port_status(0).unwrap().status.contains(PortStatus::ENABLE));

    hc.set_port_feature(0, PortFeature::Reset).unwrap();
    let status = hc.port_status(0).unwrap();
    assert!(status.status.contains(PortStatus::ENABLE));
    assert!(!status.status.contains(PortStatus::RESET));
    assert!(!status.change.contains(PortChange::C_RESET));

    // Clearing reset is accepted and does nothing
    hc.clear_port_feature(0, PortFeature::Reset).unwrap();
}

#[test]
fn test_suspend_resume_and_power() {
    let sim = SimPlatform::new(1);
    sim.connect(0, false);
    let mut hc = operational(&sim);

    hc.set_port_feature(0, PortFeature::Suspend).unwrap();
    assert!(hc.port_status(0).unwrap().status.contains(PortStatus::SUSPEND));

    hc.clear_port_feature(0, PortFeature::Suspend).unwrap();
    let status = hc.port_status(0).unwrap();
    assert!(!status.status.contains(PortStatus::SUSPEND));
    assert!(status.change.contains(PortChange::C_SUSPEND));
    hc.clear_port_feature(0, PortFeature::SuspendChange).unwrap();

    hc.clear_port_feature(0, PortFeature::Power).unwrap();
    let status = hc.port_status(0).unwrap();
    assert!(!status.status.contains(PortStatus::POWER));
    assert!(!status.status.contains(PortStatus::ENABLE));

    hc.set_port_feature(0, PortFeature::Power).unwrap();
    assert!(hc.port_status(0).unwrap().status.contains(PortStatus::POWER));
}

#[test]
fn test_port_argument_checks() {
    let sim = SimPlatform::new(2);
    let mut hc = operational(&sim);

    assert!(matches!(
        hc.port_status(2),
        Err(OhciError::InvalidParameter { name: "port", .. })
    ));
    assert!(matches!(
        hc.set_port_feature(5, PortFeature::Power),
        Err(OhciError::InvalidParameter { name: "port", .. })
    ));
    assert!(matches!(
        hc.set_port_feature(0, PortFeature::ConnectChange),
        Err(OhciError::InvalidParameter { name: "feature", .. })
    ));
    assert!(matches!(
        hc.reset(ResetAttributes::from_bits_retain(0x80)),
        Err(OhciError::InvalidParameter { name: "attributes", .. })
    ));
}

#[test]
fn test_stuck_controller_reset() {
    let sim = SimPlatform::new(1);
    let mut hc = OhciController::new(&sim, test_config()).unwrap();
    sim.set_stuck_reset(true);
    assert!(matches!(
        hc.reset(ResetAttributes::HOST_CONTROLLER),
        Err(OhciError::HardwareError {
            register: "HcCommandStatus",
            ..
        })
    ));

    // Bus-only reset does not touch the reset bit
    assert!(hc.reset(ResetAttributes::GLOBAL).is_ok());
}

#[test]
fn test_no_start_of_frame_is_a_hardware_error() {
    let sim = SimPlatform::new(1);
    let mut hc = OhciController::new(&sim, test_config()).unwrap();
    hc.reset(ResetAttributes::HOST_CONTROLLER).unwrap();

    sim.set_frame_clock_stopped(true);
    assert_eq!(
        hc.set_state(HcState::Operational),
        Err(OhciError::HardwareError {
            register: "HcInterruptStatus",
            expected: "start of frame",
        })
    );

    sim.set_frame_clock_stopped(false);
    hc.set_state(HcState::Operational).unwrap();
    assert!(sim.frame() > 0);
}

#[test]
fn test_shutdown_returns_every_page() {
    let sim = SimPlatform::new(1);
    let (device, _reports) = ReportEndpoint::new(1);
    sim.attach_device(2, Box::new(device));
    let mut hc = operational(&sim);
    let callback: InterruptCallback = Box::new(|_: &[u8], _: UsbResult| {});
    hc.async_interrupt_transfer(2, 0x81, UsbSpeed::Full, 8, 0, 2, 8, callback)
        .unwrap();
    assert!(sim.outstanding_pages() > 0);

    hc.shutdown();
    assert_eq!(sim.outstanding_pages(), 0);
    assert_eq!(sim.outstanding_mappings(), 0);
}

#[test]
fn test_drop_releases_like_shutdown() {
    let sim = SimPlatform::new(1);
    {
        let _hc = operational(&sim);
        assert!(sim.outstanding_pages() >= 2);
    }
    assert_eq!(sim.outstanding_pages(), 0);
}
