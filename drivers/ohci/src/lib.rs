//! OHCI host controller engine for VeridianOS
//!
//! Drives a USB 1.1 Open Host Controller Interface: descriptor memory,
//! the control/bulk lists and the periodic interrupt tree, control, bulk
//! and interrupt transfers, and the root hub ports. The engine reaches
//! hardware only through an [`OhciPlatform`]; the `sim` feature provides a
//! software controller model behind the same trait for tests and bring-up.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod controller;
pub mod descriptor;
pub mod ed;
pub mod error;
pub mod host;
pub mod interrupt;
pub mod platform;
pub mod pool;
pub mod regs;
pub mod roothub;
pub mod td;
pub mod transfer;
pub mod usb;

#[cfg(feature = "sim")]
pub mod sim;

// Re-export commonly used items
pub use config::OhciConfig;
pub use controller::OhciController;
pub use error::{OhciError, OhciResult};
pub use host::UsbHostController;
pub use interrupt::InterruptCallback;
pub use platform::{BusAddr, DmaMapping, DmaRegion, MapOperation, OhciPlatform};
pub use usb::{
    Capability, Completion, DataDirection, DeviceRequest, HcState, PortChange, PortFeature,
    PortStatus, ResetAttributes, UsbPortStatus, UsbResult, UsbSpeed,
};
