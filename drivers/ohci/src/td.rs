//! Transfer descriptor chains
//!
//! A chain is singly linked through both the hardware `next_td` word and the
//! software link in the side record. The controller rewrites `next_td` when
//! it retires a TD onto the done queue, so everything here walks the
//! software link.

use crate::{
    controller::OhciController,
    descriptor::{Ed, Td, TdPid, TransferDescriptor},
    error::OhciResult,
    platform::{BusAddr, OhciPlatform},
    pool::DescriptorKind,
    usb::DeviceRequest,
};

/// Setup stage is always DATA0
const SETUP_TOGGLE: u32 = TransferDescriptor::T_FROM_TD;
/// Status stage is always DATA1
const STATUS_TOGGLE: u32 = TransferDescriptor::T_FROM_TD | 1;

/// Head and tail of a chain under construction
#[derive(Debug, Clone, Copy, Default)]
struct ChainBuilder {
    head: BusAddr,
    tail: BusAddr,
}

impl ChainBuilder {
    fn push<P: OhciPlatform>(&mut self, platform: &P, td: BusAddr) {
        if self.head.is_null() {
            self.head = td;
        } else {
            Td::new(platform, self.tail).link(td);
        }
        self.tail = td;
    }
}

impl<P: OhciPlatform> OhciController<P> {
    fn create_td(&mut self, image: TransferDescriptor) -> OhciResult<BusAddr> {
        let td = self.pool.allocate(&self.platform, DescriptorKind::Transfer)?;
        image.store(&self.platform, td);
        Ok(td)
    }

    /// Build SETUP, data and status TDs for a control transfer.
    ///
    /// `data_pid` is the data stage PID (OUT for no-data requests); the
    /// status stage runs the other way. Nothing is left allocated on error.
    pub fn build_control_chain(
        &mut self,
        data_pid: TdPid,
        request: BusAddr,
        data: BusAddr,
        data_len: usize,
        max_packet: u16,
    ) -> OhciResult<BusAddr> {
        let mut chain = ChainBuilder::default();
        match self.fill_control_chain(&mut chain, data_pid, request, data, data_len, max_packet) {
            Ok(()) => Ok(chain.head),
            Err(e) => {
                self.destroy_chain(chain.head);
                Err(e)
            }
        }
    }

    fn fill_control_chain(
        &mut self,
        chain: &mut ChainBuilder,
        data_pid: TdPid,
        request: BusAddr,
        data: BusAddr,
        data_len: usize,
        max_packet: u16,
    ) -> OhciResult<()> {
        let setup = self.create_td(TransferDescriptor::new(
            TdPid::Setup,
            SETUP_TOGGLE,
            request,
            DeviceRequest::SIZE as u32,
        ))?;
        chain.push(&self.platform, setup);

        let mut toggle = 1;
        self.fill_data_tds(chain, data_pid, data, data_len, max_packet, &mut toggle)?;

        let status = self.create_td(TransferDescriptor::new(
            data_pid.status_stage(),
            STATUS_TOGGLE,
            BusAddr::NULL,
            0,
        ))?;
        chain.push(&self.platform, status);
        Ok(())
    }

    /// Segment `data_len` bytes into `max_packet`-sized TDs.
    ///
    /// Each TD carries `toggle`, which flips after every TD; on success
    /// `toggle` holds the value for the next transfer on the endpoint. On
    /// error nothing is left allocated and `toggle` is unchanged.
    pub fn build_bulk_or_interrupt_chain(
        &mut self,
        pid: TdPid,
        data: BusAddr,
        data_len: usize,
        toggle: &mut u8,
        max_packet: u16,
    ) -> OhciResult<BusAddr> {
        let mut chain = ChainBuilder::default();
        let mut next_toggle = *toggle;
        match self.fill_data_tds(&mut chain, pid, data, data_len, max_packet, &mut next_toggle) {
            Ok(()) => {
                *toggle = next_toggle;
                Ok(chain.head)
            }
            Err(e) => {
                self.destroy_chain(chain.head);
                Err(e)
            }
        }
    }

    fn fill_data_tds(
        &mut self,
        chain: &mut ChainBuilder,
        pid: TdPid,
        data: BusAddr,
        data_len: usize,
        max_packet: u16,
        toggle: &mut u8,
    ) -> OhciResult<()> {
        let max_packet = usize::from(max_packet.max(1));
        let mut offset = 0;
        while offset < data_len {
            let len = (data_len - offset).min(max_packet);
            let td = self.create_td(TransferDescriptor::new(
                pid,
                TransferDescriptor::T_FROM_TD | u32::from(*toggle & 1),
                data.offset(offset as u32),
                len as u32,
            ))?;
            chain.push(&self.platform, td);
            *toggle ^= 1;
            offset += len;
        }
        Ok(())
    }

    /// Free every TD reachable from `head`
    pub fn destroy_chain(&mut self, head: BusAddr) {
        let mut td = head;
        while !td.is_null() {
            let next = Td::new(&self.platform, td).next_sw();
            self.pool.free(td);
            td = next;
        }
    }

    /// Append `td2`'s chain to the end of `td1`'s chain
    pub fn link_td(&mut self, td1: BusAddr, td2: BusAddr) {
        if td1.is_null() || td1 == td2 {
            return;
        }
        let mut last = td1;
        loop {
            let next = Td::new(&self.platform, last).next_sw();
            if next.is_null() {
                break;
            }
            last = next;
        }
        Td::new(&self.platform, last).link(td2);
    }

    /// Queue a chain on an ED, behind whatever it still holds
    pub fn attach_chain_to_ed(&mut self, ed: BusAddr, head: BusAddr) {
        let current = Ed::new(&self.platform, ed).head();
        if current.is_null() {
            Ed::new(&self.platform, ed).set_head(head);
        } else {
            self.link_td(current, head);
        }
    }

    /// Number of TDs on the software chain from `head`
    pub fn chain_len(&self, head: BusAddr) -> usize {
        let mut count = 0;
        let mut td = head;
        while !td.is_null() {
            count += 1;
            td = Td::new(&self.platform, td).next_sw();
        }
        count
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::{
        config::OhciConfig,
        descriptor::{ConditionCode, EdDirection},
        sim::SimPlatform,
        usb::UsbSpeed,
    };

    const TREE: usize = 63;

    fn chain_images(sim: &SimPlatform, head: BusAddr) -> Vec<TransferDescriptor> {
        let mut images = Vec::new();
        let mut td = head;
        while !td.is_null() {
            let image = TransferDescriptor::load(sim, td);
            td = BusAddr::new(image.next_sw);
            images.push(image);
        }
        images
    }

    #[test]
    fn test_control_chain_shape() {
        let sim = SimPlatform::new(1);
        let mut hc = OhciController::new(&sim, OhciConfig::default()).unwrap();
        let request = BusAddr::new(0x0020_0000);
        let data = BusAddr::new(0x0020_1000);

        for (len, mps) in [(0usize, 8u16), (8, 8), (18, 8), (64, 64), (200, 64)] {
            let head = hc
                .build_control_chain(TdPid::In, request, data, len, mps)
                .unwrap();
            let tds = chain_images(&sim, head);
            let data_tds = len.div_ceil(mps as usize);
            assert_eq!(tds.len(), 1 + data_tds + 1);

            assert_eq!(tds[0].pid(), TdPid::Setup);
            assert_eq!(tds[0].toggle_field(), 2);
            assert_eq!(tds[0].current_buffer, request.as_u32());
            assert_eq!(tds[0].buffer_end, request.as_u32() + 7);
            assert_eq!(tds[0].actual_length, 8);

            for (i, td) in tds[1..=data_tds].iter().enumerate() {
                assert_eq!(td.pid(), TdPid::In);
                assert_eq!(td.toggle() as usize, (i + 1) % 2);
                assert_eq!(td.condition_code(), ConditionCode::NotAccessed);
            }

            let status = tds.last().unwrap();
            assert_eq!(status.pid(), TdPid::Out);
            assert_eq!(status.toggle_field(), 3);
            assert_eq!(status.current_buffer, 0);
            // Hardware and software links agree on a fresh chain
            for td in &tds {
                assert_eq!(td.next_td, td.next_sw);
            }
            hc.destroy_chain(head);
        }
        assert_eq!(hc.descriptors_in_use(), TREE);
    }

    #[test]
    fn test_no_data_control_chain_has_in_status() {
        let sim = SimPlatform::new(1);
        let mut hc = OhciController::new(&sim, OhciConfig::default()).unwrap();
        let head = hc
            .build_control_chain(TdPid::Out, BusAddr::new(0x0020_0000), BusAddr::NULL, 0, 8)
            .unwrap();
        let tds = chain_images(&sim, head);
        assert_eq!(tds.len(), 2);
        assert_eq!(tds[1].pid(), TdPid::In);
        hc.destroy_chain(head);
    }

    #[test]
    fn test_bulk_chain_segmentation_and_toggle() {
        let sim = SimPlatform::new(1);
        let mut hc = OhciController::new(&sim, OhciConfig::default()).unwrap();
        let data = BusAddr::new(0x0030_0000);

        let mut toggle = 0;
        let head = hc
            .build_bulk_or_interrupt_chain(TdPid::Out, data, 200, &mut toggle, 64)
            .unwrap();
        let tds = chain_images(&sim, head);
        let lengths: Vec<u32> = tds.iter().map(|t| t.actual_length).collect();
        let toggles: Vec<u8> = tds.iter().map(|t| t.toggle()).collect();
        assert_eq!(lengths, [64, 64, 64, 8]);
        assert_eq!(toggles, [0, 1, 0, 1]);
        assert_eq!(toggle, 0);
        assert_eq!(tds[3].current_buffer, data.as_u32() + 192);
        assert_eq!(tds[3].buffer_end, data.as_u32() + 199);
        hc.destroy_chain(head);

        // Output toggle = input toggle XOR (N mod 2)
        for (len, start) in [(1usize, 0u8), (1, 1), (64, 1), (65, 1), (130, 0), (192, 1)] {
            let mut toggle = start;
            let head = hc
                .build_bulk_or_interrupt_chain(TdPid::In, data, len, &mut toggle, 64)
                .unwrap();
            let n = hc.chain_len(head);
            assert_eq!(toggle, start ^ (n as u8 % 2));
            hc.destroy_chain(head);
        }
        assert_eq!(hc.descriptors_in_use(), TREE);
    }

    #[test]
    fn test_chain_allocation_failure_leaves_nothing() {
        let sim = SimPlatform::new(1);
        let mut hc = OhciController::new(&sim, OhciConfig::default()).unwrap();
        // Leave two free blocks on the only pool page, then refuse to grow
        let mut spare = Vec::new();
        while hc.descriptors_in_use() < 126 {
            spare.push(hc.create_td(TransferDescriptor::default()).unwrap());
        }
        let before = hc.descriptors_in_use();
        sim.fail_allocations_after(0);

        let mut toggle = 1;
        let result = hc.build_bulk_or_interrupt_chain(
            TdPid::Out,
            BusAddr::new(0x0030_0000),
            8 * 5,
            &mut toggle,
            8,
        );
        assert!(result.is_err());
        assert_eq!(toggle, 1);
        assert_eq!(hc.descriptors_in_use(), before);

        let result = hc.build_control_chain(
            TdPid::In,
            BusAddr::new(0x0020_0000),
            BusAddr::new(0x0030_0000),
            64,
            8,
        );
        assert!(result.is_err());
        assert_eq!(hc.descriptors_in_use(), before);
        assert_eq!(spare.len(), before - TREE);
    }

    #[test]
    fn test_attach_chain_to_ed_appends() {
        let sim = SimPlatform::new(1);
        let mut hc = OhciController::new(&sim, OhciConfig::default()).unwrap();
        let ed = hc
            .create_ed(2, 1, EdDirection::In, UsbSpeed::Full, 8)
            .unwrap();
        let mut toggle = 0;
        let first = hc
            .build_bulk_or_interrupt_chain(TdPid::In, BusAddr::new(0x0040_0000), 16, &mut toggle, 8)
            .unwrap();
        let second = hc
            .build_bulk_or_interrupt_chain(TdPid::In, BusAddr::new(0x0040_0100), 8, &mut toggle, 8)
            .unwrap();
        hc.attach_chain_to_ed(ed, first);
        assert_eq!(Ed::new(&sim, ed).head(), first);
        hc.attach_chain_to_ed(ed, second);
        assert_eq!(hc.chain_len(first), 3);
        hc.destroy_chain(first);
        hc.destroy_chain(BusAddr::NULL);
    }
}
