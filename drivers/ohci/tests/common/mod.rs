//! Shared fixture for the integration tests: a fast timing configuration,
//! a controller brought up on a [`SimPlatform`] and a handful of simulated
//! USB functions.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use ohci_hcd::{
    descriptor::TdPid,
    sim::{SimDevice, SimPlatform, SimReply, SimTransaction},
    DeviceRequest, HcState, OhciConfig, OhciController, ResetAttributes,
};

/// Blocks the periodic tree keeps allocated for its anchors
pub const TREE_DESCRIPTORS: usize = 63;

pub const GET_DESCRIPTOR: u8 = 0x06;
pub const SET_ADDRESS: u8 = 0x05;

/// Device descriptor of a full-speed HID keyboard
pub const DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x08, 0x6d, 0x04, 0x1c, 0xc3, 0x00, 0x01, 0x01,
    0x02, 0x00, 0x01,
];

/// Timing short enough to keep simulated time small
pub fn test_config() -> OhciConfig {
    OhciConfig {
        list_settle_us: 1_000,
        reset_settle_us: 1_000,
        port_reset_hold_us: 1_000,
        bring_up_settle_us: 2_000,
        ..OhciConfig::new()
    }
}

/// Controller reset and brought up to Operational
pub fn operational(sim: &SimPlatform) -> OhciController<&SimPlatform> {
    let mut hc = OhciController::new(sim, test_config()).unwrap();
    hc.reset(ResetAttributes::HOST_CONTROLLER | ResetAttributes::GLOBAL)
        .unwrap();
    hc.set_state(HcState::Operational).unwrap();
    hc
}

/// Acknowledged transactions addressed to one endpoint
pub fn transactions_for(sim: &SimPlatform, address: u8, endpoint: u8) -> Vec<SimTransaction> {
    sim.transactions()
        .into_iter()
        .filter(|t| t.address == address && t.endpoint == endpoint)
        .collect()
}

/// Endpoint 0 of a device that answers GET_DESCRIPTOR(Device) and accepts
/// every other request without a data stage
pub struct ControlResponder {
    requests: Arc<Mutex<Vec<DeviceRequest>>>,
    pending_in: VecDeque<u8>,
}

impl ControlResponder {
    pub fn new() -> (Self, Arc<Mutex<Vec<DeviceRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                requests: requests.clone(),
                pending_in: VecDeque::new(),
            },
            requests,
        )
    }
}

impl SimDevice for ControlResponder {
    fn handle(
        &mut self,
        endpoint: u8,
        pid: TdPid,
        _toggle: u8,
        out_data: &[u8],
        in_capacity: usize,
    ) -> SimReply {
        if endpoint != 0 {
            return SimReply::Stall;
        }
        match pid {
            TdPid::Setup => {
                let Ok(bytes) = <[u8; 8]>::try_from(out_data) else {
                    return SimReply::Stall;
                };
                let request = DeviceRequest::from_bytes(&bytes);
                self.pending_in.clear();
                if request.request == GET_DESCRIPTOR && request.value >> 8 == 1 {
                    let len = usize::from(request.length).min(DEVICE_DESCRIPTOR.len());
                    self.pending_in.extend(&DEVICE_DESCRIPTOR[..len]);
                }
                self.requests.lock().unwrap().push(request);
                SimReply::Ack(Vec::new())
            }
            TdPid::In => {
                let len = in_capacity.min(self.pending_in.len());
                SimReply::Ack(self.pending_in.drain(..len).collect())
            }
            TdPid::Out => SimReply::Ack(Vec::new()),
        }
    }
}

/// Bulk endpoint pair: OUT bytes are collected, IN reads drain a source
pub struct BulkLoop {
    pub out_endpoint: u8,
    pub in_endpoint: u8,
    received: Arc<Mutex<Vec<u8>>>,
    source: Arc<Mutex<VecDeque<u8>>>,
}

impl BulkLoop {
    pub fn new(
        out_endpoint: u8,
        in_endpoint: u8,
    ) -> (Self, Arc<Mutex<Vec<u8>>>, Arc<Mutex<VecDeque<u8>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                out_endpoint,
                in_endpoint,
                received: received.clone(),
                source: source.clone(),
            },
            received,
            source,
        )
    }
}

impl SimDevice for BulkLoop {
    fn handle(
        &mut self,
        endpoint: u8,
        pid: TdPid,
        _toggle: u8,
        out_data: &[u8],
        in_capacity: usize,
    ) -> SimReply {
        match pid {
            TdPid::Out if endpoint == self.out_endpoint => {
                self.received.lock().unwrap().extend_from_slice(out_data);
                SimReply::Ack(Vec::new())
            }
            TdPid::In if endpoint == self.in_endpoint => {
                let mut source = self.source.lock().unwrap();
                let len = in_capacity.min(source.len());
                SimReply::Ack(source.drain(..len).collect())
            }
            _ => SimReply::Stall,
        }
    }
}

/// Acknowledges `packets` transactions, then stalls every endpoint
pub struct StallAfter {
    pub packets: usize,
}

impl SimDevice for StallAfter {
    fn handle(
        &mut self,
        _endpoint: u8,
        pid: TdPid,
        _toggle: u8,
        _out_data: &[u8],
        in_capacity: usize,
    ) -> SimReply {
        if self.packets == 0 {
            return SimReply::Stall;
        }
        self.packets -= 1;
        match pid {
            TdPid::In => SimReply::Ack(vec![0xA5; in_capacity]),
            _ => SimReply::Ack(Vec::new()),
        }
    }
}

/// Never has anything to say
pub struct NakForever;

impl SimDevice for NakForever {
    fn handle(
        &mut self,
        _endpoint: u8,
        _pid: TdPid,
        _toggle: u8,
        _out_data: &[u8],
        _in_capacity: usize,
    ) -> SimReply {
        SimReply::Nak
    }
}

/// Interrupt IN endpoint delivering queued reports, NAKing when idle
pub struct ReportEndpoint {
    pub endpoint: u8,
    reports: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl ReportEndpoint {
    pub fn new(endpoint: u8) -> (Self, Arc<Mutex<VecDeque<Vec<u8>>>>) {
        let reports = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                endpoint,
                reports: reports.clone(),
            },
            reports,
        )
    }
}

impl SimDevice for ReportEndpoint {
    fn handle(
        &mut self,
        endpoint: u8,
        pid: TdPid,
        _toggle: u8,
        _out_data: &[u8],
        in_capacity: usize,
    ) -> SimReply {
        if endpoint != self.endpoint || pid != TdPid::In {
            return SimReply::Stall;
        }
        match self.reports.lock().unwrap().pop_front() {
            Some(mut report) => {
                report.truncate(in_capacity);
                SimReply::Ack(report)
            }
            None => SimReply::Nak,
        }
    }
}
