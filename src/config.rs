//! Tunables for the USB host stack
//!
//! There is no hardware timer this early in boot, so every delay is a busy-wait
//! iteration count. They live here so a board (or a test) can shorten them.

use core::ops::RangeInclusive;
use log::LevelFilter;

/// Maximum number of USB controllers tracked in the inventory.
pub const MAX_CONTROLLERS: usize = 8;

/// Upper bound for a fetched configuration descriptor; longer ones are truncated.
pub const CONFIG_BUFFER_LEN: usize = 64;

/// Capacity of the abstract input event queue.
pub const INPUT_QUEUE_CAPACITY: usize = 16;

/// Runtime configuration of the USB stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbConfig {
    /// First PCI bus scanned for controllers
    pub first_bus: u8,
    /// Last PCI bus scanned (inclusive)
    pub last_bus: u8,
    /// Spins between controller reset steps
    pub reset_settle_spins: u32,
    /// Spins the port-reset bit is held asserted
    pub port_reset_spins: u32,
    /// Polls of the status stage before a transfer is declared timed out
    pub completion_spins: u32,
    /// HID polling runs once every `poll_divider` scheduler ticks
    pub poll_divider: u32,
    /// Max packet size used for endpoint zero
    pub max_packet_size0: u16,
    /// Level handed to the serial logger
    pub log_level: LevelFilter,
}

impl UsbConfig {
    pub const fn new() -> Self {
        Self {
            first_bus: 0,
            last_bus: 0,
            reset_settle_spins: 100_000,
            port_reset_spins: 200_000,
            completion_spins: 1_000_000,
            poll_divider: 8,
            max_packet_size0: 64,
            log_level: LevelFilter::Info,
        }
    }

    /// Buses visited by the controller scan.
    pub fn buses(&self) -> RangeInclusive<u8> {
        self.first_bus..=self.last_bus
    }

    pub const fn with_buses(mut self, first: u8, last: u8) -> Self {
        self.first_bus = first;
        self.last_bus = last;
        self
    }

    /// Shrink every busy-wait; used when delays are simulated.
    pub const fn with_spins(mut self, reset: u32, port_reset: u32, completion: u32) -> Self {
        self.reset_settle_spins = reset;
        self.port_reset_spins = port_reset;
        self.completion_spins = completion;
        self
    }

    pub const fn with_poll_divider(mut self, divider: u32) -> Self {
        self.poll_divider = divider;
        self
    }

    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self::new()
    }
}
