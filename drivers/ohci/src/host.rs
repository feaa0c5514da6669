//! USB host controller trait
//!
//! The surface a USB bus layer drives: controller lifecycle, the four
//! transfer types and root hub port management. [`OhciController`] is the
//! implementation in this crate.
//!
//! [`OhciController`]: crate::OhciController

use crate::{
    error::OhciResult,
    interrupt::InterruptCallback,
    usb::{
        Capability, Completion, DataDirection, DeviceRequest, HcState, PortFeature,
        ResetAttributes, UsbPortStatus, UsbSpeed,
    },
};

/// USB host controller trait
pub trait UsbHostController {
    /// Get controller name
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Reset the controller and/or the bus
    fn reset(&mut self, attributes: ResetAttributes) -> OhciResult<()>;

    fn state(&self) -> HcState;

    fn set_state(&mut self, state: HcState) -> OhciResult<()>;

    /// Perform a control transfer on endpoint 0
    ///
    /// `data` must be `None` for [`DataDirection::NoData`].
    #[allow(clippy::too_many_arguments)]
    fn control_transfer(
        &mut self,
        device_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        request: &DeviceRequest,
        direction: DataDirection,
        data: Option<&mut [u8]>,
        timeout_ms: u32,
    ) -> OhciResult<Completion>;

    /// Perform a bulk transfer; only a single data buffer is supported
    #[allow(clippy::too_many_arguments)]
    fn bulk_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        data: &mut [&mut [u8]],
        toggle: &mut u8,
        timeout_ms: u32,
    ) -> OhciResult<Completion>;

    /// Register a periodic IN transfer whose completions are reported
    /// through `callback` by the housekeeping poll
    #[allow(clippy::too_many_arguments)]
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
    ) -> OhciResult<()>;

    /// Cancel a periodic transfer, returning the toggle to resume with
    fn cancel_async_interrupt_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
    ) -> OhciResult<u8>;

    /// Perform a one-shot interrupt IN transfer
    #[allow(clippy::too_many_arguments)]
    fn sync_interrupt_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        speed: UsbSpeed,
        max_packet: u16,
        data: &mut [u8],
        toggle: &mut u8,
        timeout_ms: u32,
    ) -> OhciResult<Completion>;

    fn isochronous_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        max_packet: u16,
        data: &mut [u8],
    ) -> OhciResult<Completion>;

    fn async_isochronous_transfer(
        &mut self,
        device_address: u8,
        endpoint_address: u8,
        max_packet: u16,
        data_length: usize,
        callback: InterruptCallback,
    ) -> OhciResult<()>;

    /// Check port status
    fn port_status(&self, port: u8) -> OhciResult<UsbPortStatus>;

    fn set_port_feature(&mut self, port: u8, feature: PortFeature) -> OhciResult<()>;

    fn clear_port_feature(&mut self, port: u8, feature: PortFeature) -> OhciResult<()>;
}
