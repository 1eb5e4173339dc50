//! EHCI (Enhanced Host Controller Interface) driver
//!
//! Owns the controller's memory-mapped register window and performs the
//! reset / port-reset bring-up. Transfers are built in [`super::transfer`].

use core::fmt;
use core::ptr::{read_volatile, write_volatile};

use bit_field::BitField;
use bitflags::bitflags;
use log::{debug, info};

use super::UsbError;
use crate::config::UsbConfig;
use crate::delay::Delay;

/// Capability registers, relative to BAR0
pub mod cap_regs {
    /// Capability register length in the low byte
    pub const CAPLENGTH: usize = 0x00;
    /// Structural parameters
    pub const HCSPARAMS: usize = 0x04;
    /// Capability parameters
    pub const HCCPARAMS: usize = 0x08;
}

/// Operational registers, relative to BAR0 + CAPLENGTH
pub mod op_regs {
    pub const USBCMD: usize = 0x00;
    /// Write-1-to-clear status
    pub const USBSTS: usize = 0x04;
    pub const USBINTR: usize = 0x08;
    pub const ASYNCLISTADDR: usize = 0x18;
    pub const CONFIGFLAG: usize = 0x40;
    pub const PORTSC_BASE: usize = 0x44;
}

/// Bounds on CAPLENGTH accepted from a real EHCI controller.
pub const CAPLENGTH_MIN: u8 = 0x10;
pub const CAPLENGTH_MAX: u8 = 0x40;

/// Every status bit the driver acknowledges after halting the controller.
const USBSTS_CLEAR_ALL: u32 = 0x3F;

bitflags! {
    /// USBCMD bits used by the driver
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCommand: u32 {
        const RUN = 1 << 0;
        const HC_RESET = 1 << 1;
        const ASYNC_ENABLE = 1 << 5;
    }
}

bitflags! {
    /// PORTSC bits used by the driver
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u32 {
        const CONNECTED = 1 << 0;
        const ENABLED = 1 << 2;
        const RESET = 1 << 8;
        const POWER = 1 << 12;
    }
}

/// 32-bit register access at byte offsets from a base
pub trait RegisterWindow {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&mut self, offset: usize, value: u32);
}

/// Registers reached through an identity-mapped MMIO region
pub struct MmioWindow {
    base: *mut u32,
}

impl MmioWindow {
    /// # Safety
    /// `base` must point to a mapped, uncached register region that stays
    /// valid for the lifetime of the window.
    pub unsafe fn new(base: usize) -> Self {
        Self { base: base as *mut u32 }
    }
}

impl RegisterWindow for MmioWindow {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        unsafe { read_volatile(self.base.add(offset / 4)) }
    }

    #[inline]
    fn write32(&mut self, offset: usize, value: u32) {
        unsafe { write_volatile(self.base.add(offset / 4), value) }
    }
}

impl fmt::Debug for MmioWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioWindow").field("base", &self.base).finish()
    }
}

/// Strip the flag bits from a memory BAR.
pub fn bar_base(bar0: u32) -> u32 {
    bar0 & 0xFFFF_FFF0
}

/// EHCI controller structure
pub struct EhciController<W> {
    regs: W,
    base: u32,
    cap_length: u8,
    hcs_params: u32,
    hcc_params: u32,
}

impl<W: RegisterWindow> EhciController<W> {
    /// Map the controller behind `bar0` and bring it out of reset.
    ///
    /// Only a null base or an implausible CAPLENGTH fail; the reset and
    /// port-reset steps after that are best effort.
    pub fn init<D: Delay>(
        bar0: u32,
        map: impl FnOnce(u32) -> W,
        delay: &mut D,
        config: &UsbConfig,
    ) -> Result<Self, UsbError> {
        let base = bar_base(bar0);
        if base == 0 {
            return Err(UsbError::HardwareAbsent);
        }

        let regs = map(base);
        let cap_length = regs.read32(cap_regs::CAPLENGTH).get_bits(0..8) as u8;
        if !(CAPLENGTH_MIN..=CAPLENGTH_MAX).contains(&cap_length) {
            return Err(UsbError::InvalidCapLength(cap_length));
        }

        let mut controller = Self {
            hcs_params: regs.read32(cap_regs::HCSPARAMS),
            hcc_params: regs.read32(cap_regs::HCCPARAMS),
            regs,
            base,
            cap_length,
        };
        info!(
            "EHCI caplen={} ports={}",
            controller.cap_length,
            controller.port_count()
        );

        controller.reset(delay, config);
        controller.reset_connected_ports(delay, config);
        Ok(controller)
    }

    /// Halt, acknowledge status, then pulse HCRESET.
    fn reset<D: Delay>(&mut self, delay: &mut D, config: &UsbConfig) {
        let mut command = self.command();
        command.remove(UsbCommand::RUN);
        self.set_command(command);
        delay.spin(config.reset_settle_spins);

        self.op_write(op_regs::USBSTS, USBSTS_CLEAR_ALL);
        self.op_write(op_regs::USBINTR, 0);

        self.set_command(command | UsbCommand::HC_RESET);
        delay.spin(config.reset_settle_spins);
        self.set_command(command - UsbCommand::HC_RESET);
        delay.spin(config.reset_settle_spins);

        // Route every port to this controller instead of the companions.
        self.op_write(op_regs::CONFIGFLAG, 1);
    }

    fn reset_connected_ports<D: Delay>(&mut self, delay: &mut D, config: &UsbConfig) {
        for port in 0..self.port_count() {
            let status = self.port_status(port);
            if !status.contains(PortStatus::CONNECTED) {
                continue;
            }
            info!("EHCI port connect: {}", port + 1);

            self.set_port_status(port, status | PortStatus::RESET);
            delay.spin(config.port_reset_spins);
            let status = self.port_status(port);
            self.set_port_status(port, status - PortStatus::RESET);
            debug!(
                "EHCI port {} {} after reset, status {:#010x}",
                port + 1,
                if self.port_enabled(port) { "enabled" } else { "not enabled" },
                self.port_status(port).bits()
            );
        }
    }

    /// Number of physical downstream ports (HCSPARAMS.N_PORTS).
    pub fn port_count(&self) -> u8 {
        self.hcs_params.get_bits(0..4) as u8
    }

    pub fn cap_length(&self) -> u8 {
        self.cap_length
    }

    pub fn hcs_params(&self) -> u32 {
        self.hcs_params
    }

    pub fn hcc_params(&self) -> u32 {
        self.hcc_params
    }

    /// Register base the window was mapped at.
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn op_read(&self, register: usize) -> u32 {
        self.regs.read32(self.cap_length as usize + register)
    }

    pub fn op_write(&mut self, register: usize, value: u32) {
        self.regs.write32(self.cap_length as usize + register, value)
    }

    pub fn command(&self) -> UsbCommand {
        UsbCommand::from_bits_retain(self.op_read(op_regs::USBCMD))
    }

    pub fn set_command(&mut self, command: UsbCommand) {
        self.op_write(op_regs::USBCMD, command.bits())
    }

    pub fn port_status(&self, port: u8) -> PortStatus {
        PortStatus::from_bits_retain(self.op_read(op_regs::PORTSC_BASE + port as usize * 4))
    }

    /// A high-speed device finished reset and the port passes traffic.
    pub fn port_enabled(&self, port: u8) -> bool {
        self.port_status(port).contains(PortStatus::ENABLED)
    }

    fn set_port_status(&mut self, port: u8, status: PortStatus) {
        self.op_write(op_regs::PORTSC_BASE + port as usize * 4, status.bits())
    }

    /// Point the async schedule at `queue_head` and turn it on.
    pub fn start_async(&mut self, queue_head: u32) {
        self.op_write(op_regs::ASYNCLISTADDR, queue_head);
        let command = self.command() | UsbCommand::ASYNC_ENABLE;
        self.set_command(command);
    }

    pub fn stop_async(&mut self) {
        let command = self.command() - UsbCommand::ASYNC_ENABLE;
        self.set_command(command);
    }

    pub fn async_enabled(&self) -> bool {
        self.command().contains(UsbCommand::ASYNC_ENABLE)
    }
}

impl<W> fmt::Debug for EhciController<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EhciController")
            .field("base", &format_args!("{:#010x}", self.base))
            .field("cap_length", &self.cap_length)
            .field("hcs_params", &self.hcs_params)
            .field("hcc_params", &self.hcc_params)
            .finish()
    }
}
