//! Error types for the OHCI engine
//!
//! Failures are split the same way callers need to react to them:
//! - caller mistakes rejected before any register or descriptor is touched
//! - descriptor or mapping exhaustion, always after full rollback
//! - bus-level completion errors, which carry the [`UsbResult`] bitmask
//! - timeouts, kept apart from bus errors because they may be retried
//! - controller state that never reached the value it was driven towards

use core::fmt;

use crate::usb::UsbResult;

/// OHCI engine error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OhciError {
    /// Malformed argument
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },

    /// Operation the controller does not implement
    Unsupported { operation: &'static str },

    /// Descriptor pool or bus mapping could not be grown
    ResourceExhausted { resource: &'static str },

    /// Transfer completed with a non-zero condition code
    DeviceError { result: UsbResult },

    /// Transfer still pending when the caller's timeout ran out
    Timeout {
        operation: &'static str,
        result: UsbResult,
    },

    /// A status bit never reached the expected value within its retry budget
    HardwareError {
        register: &'static str,
        expected: &'static str,
    },
}

impl OhciError {
    /// Bus-level result bitmask carried by this error.
    ///
    /// Empty for errors that never reached the bus.
    pub fn transfer_result(&self) -> UsbResult {
        match self {
            Self::DeviceError { result } | Self::Timeout { result, .. } => *result,
            _ => UsbResult::empty(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl fmt::Display for OhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter { name, reason } => {
                write!(f, "Invalid parameter '{}': {}", name, reason)
            }
            Self::Unsupported { operation } => write!(f, "Operation not supported: {}", operation),
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::DeviceError { result } => {
                write!(f, "Transfer failed: result 0x{:x}", result.bits())
            }
            Self::Timeout { operation, result } => {
                write!(
                    f,
                    "Timeout in {}: result 0x{:x}",
                    operation,
                    result.bits()
                )
            }
            Self::HardwareError { register, expected } => {
                write!(f, "Hardware error: {} never reported {}", register, expected)
            }
        }
    }
}

/// Result type for OHCI operations
pub type OhciResult<T> = Result<T, OhciError>;

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn test_transfer_result_only_for_bus_errors() {
        let stall = OhciError::DeviceError {
            result: UsbResult::STALL,
        };
        assert_eq!(stall.transfer_result(), UsbResult::STALL);

        let timeout = OhciError::Timeout {
            operation: "bulk transfer",
            result: UsbResult::NOTEXECUTE,
        };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.transfer_result(), UsbResult::NOTEXECUTE);

        let bad = OhciError::InvalidParameter {
            name: "port",
            reason: "out of range",
        };
        assert!(bad.transfer_result().is_empty());
        assert!(!bad.is_timeout());
    }

    #[test]
    fn test_display() {
        let err = OhciError::HardwareError {
            register: "HcCommandStatus",
            expected: "HCR clear",
        };
        assert_eq!(
            err.to_string(),
            "Hardware error: HcCommandStatus never reported HCR clear"
        );
        let err = OhciError::DeviceError {
            result: UsbResult::STALL | UsbResult::CRC,
        };
        assert_eq!(err.to_string(), "Transfer failed: result 0x22");
    }
}
