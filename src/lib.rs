#![cfg_attr(not(test), no_std)]

//! Orbita USB host stack
//!
//! Finds an EHCI controller on the PCI bus, brings it out of reset, enumerates
//! the single boot-protocol HID device attached to it and turns its reports
//! into input events for the rest of the kernel.

pub mod config;
pub mod delay;
pub mod drivers;
pub mod input;
#[cfg(target_arch = "x86_64")]
pub mod logger;
pub mod memory;
#[cfg(target_arch = "x86_64")]
pub mod serial;

#[cfg(test)]
mod testing;

pub use config::UsbConfig;
pub use drivers::usb::host::{ControllerInfo, PollDivider, UsbHost};
pub use drivers::usb::UsbError;
