//! USB host stack: EHCI controller, control transfers, enumeration and
//! boot-protocol HID polling.

pub mod ehci;
pub mod enumeration;
pub mod hid;
pub mod host;
pub mod queue;
pub mod request;
pub mod transfer;

use core::fmt;

/// Common USB error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// No controller, no register window or no device answering.
    HardwareAbsent,
    /// CAPLENGTH outside the range an EHCI controller reports.
    InvalidCapLength(u8),
    /// BAR0 is not a usable 32-bit memory BAR.
    InvalidBar(u32),
    /// The status stage did not retire within the poll budget, or an earlier
    /// stage halted.
    Timeout,
    /// DMA memory for descriptors or buffers ran out.
    AllocationFailed,
    /// The data stage does not fit in one transfer descriptor.
    BufferTooLarge(usize),
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::HardwareAbsent => write!(f, "Hardware absent"),
            UsbError::InvalidCapLength(len) => write!(f, "Invalid capability length {:#04x}", len),
            UsbError::InvalidBar(bar) => write!(f, "Unusable BAR {:#010x}", bar),
            UsbError::Timeout => write!(f, "Transfer timed out"),
            UsbError::AllocationFailed => write!(f, "Out of DMA memory"),
            UsbError::BufferTooLarge(len) => write!(f, "Data stage of {} bytes too large", len),
        }
    }
}

/// Direction of a control transfer's data stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }
}
