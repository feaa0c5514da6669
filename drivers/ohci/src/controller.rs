//! OHCI controller context
//!
//! [`OhciController`] owns everything one controller instance needs: the
//! platform handle, the HCCA page, the descriptor pool, the periodic
//! scheduling tree and the asynchronous interrupt registry. The schedule
//! managers, transfer engine and root hub code add their operations to it
//! from their own modules.

use log::{debug, info};

use crate::{
    config::OhciConfig,
    descriptor::hcca,
    ed::PeriodicSchedule,
    error::{OhciError, OhciResult},
    host::UsbHostController,
    interrupt::{InterruptCallback, InterruptRegistry},
    platform::{BusAddr, DmaRegion, OhciPlatform},
    pool::DescriptorPool,
    regs::{control, OperationalRegisters},
    usb::{
        Capability, Completion, DataDirection, DeviceRequest, HcState, PortFeature,
        ResetAttributes, UsbPortStatus, UsbSpeed,
    },
};

/// One OHCI host controller
pub struct OhciController<P: OhciPlatform> {
    pub(crate) platform: P,
    pub(crate) config: OhciConfig,
    pub(crate) pool: DescriptorPool,
    pub(crate) hcca: DmaRegion,
    pub(crate) schedule: PeriodicSchedule,
    pub(crate) interrupts: InterruptRegistry,
    released: bool,
}

impl<P: OhciPlatform> OhciController<P> {
    /// Allocate the HCCA and build the periodic tree.
    ///
    /// The controller hardware is not touched; call
    /// [`reset`](Self::reset) and then
    /// [`set_state`](Self::set_state)`(HcState::Operational)` to start it.
    pub fn new(platform: P, config: OhciConfig) -> OhciResult<Self> {
        let hcca = platform
            .allocate_coherent(1)
            .ok_or(OhciError::ResourceExhausted { resource: "HCCA" })?;
        platform.zero_dma(hcca.bus_addr, hcca::SIZE);
        debug!("OHCI: HCCA at {:?}", hcca.bus_addr);

        let mut controller = Self {
            platform,
            config,
            pool: DescriptorPool::new(),
            hcca,
            schedule: PeriodicSchedule::new(),
            interrupts: InterruptRegistry::new(),
            released: false,
        };
        // On failure, Drop releases the partial tree and the HCCA
        controller.init_interrupt_tree()?;
        info!("OHCI: controller context ready");
        Ok(controller)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &OhciConfig {
        &self.config
    }

    pub(crate) fn regs(&self) -> OperationalRegisters<'_, P> {
        OperationalRegisters::new(&self.platform)
    }

    pub fn hcca_addr(&self) -> BusAddr {
        self.hcca.bus_addr
    }

    /// Frame number as last written back into the HCCA
    pub fn hcca_frame_number(&self) -> u16 {
        let mut bytes = [0u8; 2];
        self.platform
            .read_dma(self.hcca.bus_addr.offset(hcca::FRAME_NUMBER), &mut bytes);
        u16::from_le_bytes(bytes)
    }

    pub(crate) fn clear_done_head(&self) {
        self.platform
            .write_u32(self.hcca.bus_addr.offset(hcca::DONE_HEAD), 0);
    }

    /// Descriptor blocks currently allocated, tree anchors included
    pub fn descriptors_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Stop list processing without touching the functional state
    pub fn stop(&self) {
        self.regs().set_list_enable(
            control::PLE | control::CLE | control::IE | control::BLE,
            false,
        );
    }

    /// Halt the schedule and free every descriptor, the tree and the HCCA
    pub fn shutdown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stop();
        self.free_interrupt_memory();
        self.free_interrupt_tree();
        self.pool.release_all(&self.platform);
        self.platform.free_coherent(self.hcca);
        info!("OHCI: controller released");
    }
}

impl<P: OhciPlatform> Drop for OhciController<P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<P: OhciPlatform> UsbHostController for OhciController<P> {
    fn name(&self) -> &str {
        "OHCI"
    }

    fn capability(&self) -> Capability {
        OhciController::capability(self)
    }

    fn reset(&mut self, attributes: ResetAttributes) -> OhciResult<()> {
        OhciController::reset(self, attributes)
    }

    fn state(&self) -> HcState {
        OhciController::state(self)
    }

    fn set_state(&mut self, state: HcState) -> OhciResult<()> {
        OhciController::set_state(self, state)
    }

    fn control_transfer(
        &mut self,
        device_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        request: &DeviceRequest,
        direction: DataDirection,
        data: Option<&mut [u8]>,
        timeout_ms: u32,
    ) -> OhciResult<Completion> {
        OhciController::control_transfer(
            self,
            device_address,
            speed,
            max_packet,
            request,
            direction,
            data,
            timeout_ms,
        )
    }

    fn bulk_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        data: &mut [&mut [u8]],
        toggle: &mut u8,
        timeout_ms: u32,
    ) -> OhciResult<Completion> {
        OhciController::bulk_transfer(
            self,
            device_address,
            endpoint_address,
            speed,
            max_packet,
            data,
            toggle,
            timeout_ms,
        )
    }

    fn async_interrupt_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        toggle: u8,
        polling_interval: u8,
        data_length: usize,
        callback: InterruptCallback,
    ) -> OhciResult<()> {
        OhciController::async_interrupt_transfer(
            self,
            device_address,
            endpoint_address,
            speed,
            max_packet,
            toggle,
            polling_interval,
            data_length,
            callback,
        )
    }

    fn cancel_async_interrupt_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
    ) -> OhciResult<u8> {
        OhciController::cancel_async_interrupt_transfer(self, device_address, endpoint_address)
    }

    fn sync_interrupt_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        data: &mut [u8],
        toggle: &mut u8,
        timeout_ms: u32,
    ) -> OhciResult<Completion> {
        OhciController::sync_interrupt_transfer(
            self,
            device_address,
            endpoint_address,
            speed,
            max_packet,
            data,
            toggle,
            timeout_ms,
        )
    }

    fn isochronous_transfer(
        &mut self,
        _device_address: u8,
        _endpoint_address: u8,
        _max_packet: u16,
        _data: &mut [u8],
    ) -> OhciResult<Completion> {
        Err(OhciError::Unsupported {
            operation: "isochronous transfer",
        })
    }

    fn async_isochronous_transfer(
        &mut self,
        _device_address: u8,
        _endpoint_address: u8,
        _max_packet: u16,
        _data_length: usize,
        _callback: InterruptCallback,
    ) -> OhciResult<()> {
        Err(OhciError::Unsupported {
            operation: "asynchronous isochronous transfer",
        })
    }

    fn port_status(&self, port: u8) -> OhciResult<UsbPortStatus> {
        OhciController::port_status(self, port)
    }

    fn set_port_feature(&mut self, port: u8, feature: PortFeature) -> OhciResult<()> {
        OhciController::set_port_feature(self, port, feature)
    }

    fn clear_port_feature(&mut self, port: u8, feature: PortFeature) -> OhciResult<()> {
        OhciController::clear_port_feature(self, port, feature)
    }
}
