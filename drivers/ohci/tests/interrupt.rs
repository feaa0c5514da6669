//! Periodic schedule: asynchronous and synchronous interrupt transfers

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use ohci_hcd::{
    ed::PeriodicSchedule, sim::SimPlatform, InterruptCallback, OhciError, OhciPlatform,
    ResetAttributes,
    UsbResult, UsbSpeed,
};

const DEVICE: u8 = 2;
const REPORT_EP: u8 = 0x81;

type Rounds = Arc<Mutex<Vec<(Vec<u8>, UsbResult)>>>;

fn recorder() -> (InterruptCallback, Rounds) {
    let rounds: Rounds = Arc::new(Mutex::new(Vec::new()));
    let sink = rounds.clone();
    let callback: InterruptCallback = Box::new(move |data: &[u8], result: UsbResult| {
        sink.lock().unwrap().push((data.to_vec(), result));
    });
    (callback, rounds)
}

#[test]
fn test_interval_ten_polls_every_eight_frames() {
    // Literal doubling loop: 10 covers 2, 4 and 8 but not 16
    assert_eq!(PeriodicSchedule::depth_for_interval(10), 2);

    let sim = SimPlatform::new(1);
    let (device, reports) = ReportEndpoint::new(1);
    sim.attach_device(DEVICE, Box::new(device));
    sim.connect(0, false);
    let mut hc = operational(&sim);
    sim.clear_transactions();

    // Four full packets queue four TDs, one serviced per visit
    for i in 0..4u8 {
        reports.lock().unwrap().push_back(vec![i; 8]);
    }
    let (callback, rounds) = recorder();
    hc.async_interrupt_transfer(DEVICE, REPORT_EP, UsbSpeed::Full, 8, 0, 10, 32, callback)
        .unwrap();
    assert_eq!(hc.async_transfer_count(), 1);
    sim.stall(40_000);

    let log = transactions_for(&sim, DEVICE, 1);
    assert_eq!(log.len(), 4);
    for pair in log.windows(2) {
        assert_eq!(pair[1].frame - pair[0].frame, 8);
    }
    let toggles: Vec<_> = log.iter().map(|t| t.toggle).collect();
    assert_eq!(toggles, [0, 1, 0, 1]);

    hc.house_keeper();
    let rounds = rounds.lock().unwrap();
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].0.len(), 32);
    assert_eq!(rounds[0].0[8..16], [1; 8]);
    assert!(rounds[0].1.is_empty());
}

#[test]
fn test_async_rounds_are_delivered_and_rearmed() {
    let sim = SimPlatform::new(1);
    let (device, reports) = ReportEndpoint::new(1);
    sim.attach_device(DEVICE, Box::new(device));
    sim.connect(0, false);
    let mut hc = operational(&sim);
    sim.clear_transactions();

    let (callback, rounds) = recorder();
    hc.async_interrupt_transfer(DEVICE, REPORT_EP, UsbSpeed::Low, 8, 0, 8, 8, callback)
        .unwrap();

    // Nothing to report yet: the TD stays with the controller
    sim.stall(20_000);
    hc.house_keeper();
    assert!(rounds.lock().unwrap().is_empty());

    reports.lock().unwrap().push_back(vec![0x01, 0x00, 0x04]);
    sim.stall(20_000);
    hc.house_keeper();

    reports.lock().unwrap().push_back(vec![0x00, 0x00, 0x05, 0x06]);
    sim.stall(20_000);
    hc.house_keeper();

    {
        let rounds = rounds.lock().unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].0, [0x01, 0x00, 0x04]);
        assert_eq!(rounds[1].0, [0x00, 0x00, 0x05, 0x06]);
    }
    let toggles: Vec<_> = transactions_for(&sim, DEVICE, 1)
        .iter()
        .map(|t| t.toggle)
        .collect();
    assert_eq!(toggles, [0, 1]);

    // Two packets went through, so the endpoint expects DATA0 next
    assert_eq!(hc.cancel_async_interrupt_transfer(DEVICE, REPORT_EP), Ok(0));
    assert_eq!(hc.async_transfer_count(), 0);
    assert_eq!(hc.descriptors_in_use(), TREE_DESCRIPTORS);
    assert_eq!(sim.outstanding_mappings(), 0);

    // Gone from the schedule: later reports are never fetched
    reports.lock().unwrap().push_back(vec![0xFF]);
    sim.stall(40_000);
    hc.house_keeper();
    assert_eq!(rounds.lock().unwrap().len(), 2);
    assert_eq!(reports.lock().unwrap().len(), 1);
}

#[test]
fn test_cancel_mid_round_returns_carried_toggle() {
    let sim = SimPlatform::new(1);
    let (device, reports) = ReportEndpoint::new(1);
    sim.attach_device(DEVICE, Box::new(device));
    let mut hc = operational(&sim);

    let (callback, _rounds) = recorder();
    hc.async_interrupt_transfer(DEVICE, REPORT_EP, UsbSpeed::Full, 8, 1, 1, 16, callback)
        .unwrap();
    // First of two TDs completes, the second NAKs
    reports.lock().unwrap().push_back(vec![7; 8]);
    sim.stall(10_000);
    assert_eq!(hc.cancel_async_interrupt_transfer(DEVICE, REPORT_EP), Ok(0));
    assert_eq!(hc.descriptors_in_use(), TREE_DESCRIPTORS);
}

#[test]
fn test_registration_rules() {
    let sim = SimPlatform::new(1);
    let (device, _reports) = ReportEndpoint::new(1);
    sim.attach_device(DEVICE, Box::new(device));
    let mut hc = operational(&sim);

    let (callback, _) = recorder();
    assert!(matches!(
        hc.async_interrupt_transfer(DEVICE, 0x01, UsbSpeed::Full, 8, 0, 8, 8, callback),
        Err(OhciError::InvalidParameter { name: "endpoint_address", .. })
    ));
    let (callback, _) = recorder();
    assert!(matches!(
        hc.async_interrupt_transfer(DEVICE, REPORT_EP, UsbSpeed::Full, 8, 0, 0, 8, callback),
        Err(OhciError::InvalidParameter { name: "polling_interval", .. })
    ));
    let (callback, _) = recorder();
    assert!(matches!(
        hc.async_interrupt_transfer(DEVICE, REPORT_EP, UsbSpeed::Full, 8, 0, 8, 0, callback),
        Err(OhciError::InvalidParameter { name: "data_length", .. })
    ));
    let (callback, _) = recorder();
    assert!(matches!(
        hc.async_interrupt_transfer(DEVICE, REPORT_EP, UsbSpeed::Full, 8, 3, 8, 8, callback),
        Err(OhciError::InvalidParameter { name: "toggle", .. })
    ));

    let (callback, _) = recorder();
    hc.async_interrupt_transfer(DEVICE, REPORT_EP, UsbSpeed::Full, 8, 0, 8, 8, callback)
        .unwrap();
    let (callback, _) = recorder();
    assert!(matches!(
        hc.async_interrupt_transfer(DEVICE, REPORT_EP, UsbSpeed::Full, 8, 0, 16, 8, callback),
        Err(OhciError::InvalidParameter { name: "endpoint_address", .. })
    ));
    assert_eq!(hc.async_transfer_count(), 1);

    // A one-shot transfer may not race the registered one
    let mut buffer = [0u8; 8];
    let mut toggle = 0;
    assert!(matches!(
        hc.sync_interrupt_transfer(
            DEVICE,
            REPORT_EP,
            UsbSpeed::Full,
            8,
            &mut buffer,
            &mut toggle,
            10
        ),
        Err(OhciError::InvalidParameter { name: "endpoint_address", .. })
    ));

    assert!(matches!(
        hc.cancel_async_interrupt_transfer(DEVICE, 0x82),
        Err(OhciError::InvalidParameter { .. })
    ));
}

#[test]
fn test_sync_transfer_reads_report() {
    let sim = SimPlatform::new(1);
    let (device, reports) = ReportEndpoint::new(1);
    sim.attach_device(DEVICE, Box::new(device));
    let mut hc = operational(&sim);
    sim.clear_transactions();

    reports.lock().unwrap().push_back(vec![9, 8, 7]);
    let mut buffer = [0u8; 8];
    let mut toggle = 1;
    let completion = hc
        .sync_interrupt_transfer(
            DEVICE,
            REPORT_EP,
            UsbSpeed::Full,
            8,
            &mut buffer,
            &mut toggle,
            50,
        )
        .unwrap();
    assert_eq!(completion.length, 3);
    assert_eq!(buffer[..3], [9, 8, 7]);
    assert_eq!(toggle, 0);
    assert_eq!(transactions_for(&sim, DEVICE, 1)[0].toggle, 1);

    // Nothing stays behind: no registration, no descriptors, no mappings
    assert_eq!(hc.async_transfer_count(), 0);
    assert_eq!(hc.descriptors_in_use(), TREE_DESCRIPTORS);
    assert_eq!(sim.outstanding_mappings(), 0);
}

#[test]
fn test_sync_transfer_limits_and_timeout() {
    let sim = SimPlatform::new(1);
    let (device, _reports) = ReportEndpoint::new(1);
    sim.attach_device(DEVICE, Box::new(device));
    let mut hc = operational(&sim);
    let mut buffer = [0u8; 8];
    let mut toggle = 0;

    assert!(matches!(
        hc.sync_interrupt_transfer(
            DEVICE,
            REPORT_EP,
            UsbSpeed::Low,
            16,
            &mut buffer,
            &mut toggle,
            10
        ),
        Err(OhciError::InvalidParameter { name: "max_packet", .. })
    ));

    let err = hc
        .sync_interrupt_transfer(
            DEVICE,
            REPORT_EP,
            UsbSpeed::Full,
            8,
            &mut buffer,
            &mut toggle,
            10,
        )
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(toggle, 0);
    assert_eq!(hc.descriptors_in_use(), TREE_DESCRIPTORS);
    assert_eq!(sim.outstanding_mappings(), 0);
}

#[test]
fn test_reset_discards_registrations() {
    let sim = SimPlatform::new(1);
    let (device, _reports) = ReportEndpoint::new(1);
    sim.attach_device(DEVICE, Box::new(device));
    let mut hc = operational(&sim);

    for endpoint in [0x81, 0x82, 0x83] {
        let (callback, _) = recorder();
        hc.async_interrupt_transfer(DEVICE, endpoint, UsbSpeed::Full, 8, 0, 4, 8, callback)
            .unwrap();
    }
    assert_eq!(hc.async_transfer_count(), 3);
    assert_eq!(sim.outstanding_mappings(), 3);

    hc.reset(ResetAttributes::GLOBAL).unwrap();
    assert_eq!(hc.async_transfer_count(), 0);
    assert_eq!(hc.descriptors_in_use(), TREE_DESCRIPTORS);
    assert_eq!(sim.outstanding_mappings(), 0);
}
