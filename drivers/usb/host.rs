//! USB host context
//!
//! Owns everything the stack keeps between boot and shutdown: the controller
//! inventory, the initialized EHCI controllers, the DMA allocator and the one
//! HID session. The kernel creates it once with [`UsbHost::init`] and calls
//! [`UsbHost::tick`] from a scheduler task.

use core::fmt;

use heapless::Vec;
use log::{info, warn};

use super::ehci::{EhciController, RegisterWindow};
use super::enumeration::{enumerate, HidSession};
use super::hid::{self, BootKeyboard};
use super::UsbError;
use crate::config::{UsbConfig, MAX_CONTROLLERS};
use crate::delay::Delay;
use crate::drivers::pci::{find_by_class, ConfigSpace, PciDevice, CLASS_SERIAL_BUS, SUBCLASS_USB};
use crate::input::InputSink;
use crate::memory::DmaAllocator;

/// Programming interface of a USB 2.0 EHCI controller.
pub const PROG_IF_EHCI: u8 = 0x20;

/// BAR0 memory type field value for a 64-bit BAR.
const BAR_TYPE_64: u32 = 0b10;

/// USB controller found on the PCI bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerInfo {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub bar0: u32,
}

impl ControllerInfo {
    fn new(device: &PciDevice, bar0: u32) -> Self {
        Self {
            bus: device.address.bus,
            device: device.address.device,
            function: device.address.function,
            class: device.class,
            subclass: device.subclass,
            prog_if: device.prog_if,
            bar0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.prog_if {
            0x00 => "UHCI",
            0x10 => "OHCI",
            PROG_IF_EHCI => "EHCI",
            0x30 => "xHCI",
            _ => "USB",
        }
    }
}

impl fmt::Display for ControllerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}:D{}:F{} PI=0x{:02X}", self.bus, self.device, self.function, self.prog_if)
    }
}

/// Check that BAR0 is a memory BAR the driver can reach with 32-bit pointers.
fn screen_bar<C: ConfigSpace + ?Sized>(
    config: &mut C,
    device: &PciDevice,
    bar0: u32,
) -> Result<u32, UsbError> {
    if bar0 & 1 != 0 || bar0 == 0 || bar0 == 0xFFFF_FFFF {
        return Err(UsbError::InvalidBar(bar0));
    }
    if (bar0 >> 1) & 0b11 == BAR_TYPE_64 && device.bar(config, 1) != 0 {
        return Err(UsbError::InvalidBar(bar0));
    }
    Ok(bar0)
}

/// Fires on every `divider`-th tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDivider {
    divider: u32,
    count: u32,
}

impl PollDivider {
    pub const fn new(divider: u32) -> Self {
        Self {
            divider: if divider == 0 { 1 } else { divider },
            count: 0,
        }
    }

    pub fn tick(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.divider {
            self.count = 0;
            true
        } else {
            false
        }
    }
}

/// The USB stack's owned state
pub struct UsbHost<W, A, D> {
    config: UsbConfig,
    dma: A,
    delay: D,
    inventory: Vec<ControllerInfo, MAX_CONTROLLERS>,
    controllers: Vec<EhciController<W>, MAX_CONTROLLERS>,
    session: HidSession,
    keyboard: BootKeyboard,
    divider: PollDivider,
}

impl<W: RegisterWindow, A: DmaAllocator, D: Delay> UsbHost<W, A, D> {
    /// Scan PCI for USB controllers, bring up every usable EHCI controller
    /// and enumerate the device on the first one.
    ///
    /// `map` turns a controller's register base into a register window.
    /// Failures are logged; the result is then a host without USB input.
    pub fn init<C, M>(pci: &mut C, mut map: M, dma: A, delay: D, config: UsbConfig) -> Self
    where
        C: ConfigSpace + ?Sized,
        M: FnMut(u32) -> W,
    {
        let mut host = Self {
            config,
            dma,
            delay,
            inventory: Vec::new(),
            controllers: Vec::new(),
            session: HidSession::unconfigured(),
            keyboard: BootKeyboard::new(),
            divider: PollDivider::new(config.poll_divider),
        };

        info!("USB scan...");
        let found: Vec<PciDevice, MAX_CONTROLLERS> =
            find_by_class(pci, config.buses(), CLASS_SERIAL_BUS, SUBCLASS_USB)
                .take(MAX_CONTROLLERS)
                .collect();

        for device in &found {
            let bar0 = device.bar(pci, 0);
            let info = ControllerInfo::new(device, bar0);
            let _ = host.inventory.push(info);
            info!("USB ctrl: {} {} bar0={:#010x}", info, info.kind(), bar0);

            if device.prog_if != PROG_IF_EHCI {
                continue;
            }
            let controller = screen_bar(pci, device, bar0).and_then(|bar0| {
                EhciController::init(bar0, &mut map, &mut host.delay, &host.config)
            });
            match controller {
                Ok(controller) => {
                    let _ = host.controllers.push(controller);
                }
                Err(err) => warn!("EHCI {} not initialized: {}", info, err),
            }
        }

        match host.controllers.first_mut() {
            Some(controller) => {
                host.session = enumerate(controller, &mut host.dma, &host.config);
            }
            None => info!("USB: no EHCI controller"),
        }
        host
    }

    /// Poll the HID device once. A no-op without a configured session.
    pub fn poll<S: InputSink + ?Sized>(&mut self, sink: &mut S) {
        if let Some(controller) = self.controllers.first_mut() {
            hid::poll(
                controller,
                &mut self.dma,
                &self.config,
                &self.session,
                &mut self.keyboard,
                sink,
            );
        }
    }

    /// Scheduler hook: polls on every `poll_divider`-th call.
    pub fn tick<S: InputSink + ?Sized>(&mut self, sink: &mut S) {
        if self.divider.tick() {
            self.poll(sink);
        }
    }

    /// Every USB controller seen on the bus, usable or not.
    pub fn controllers(&self) -> &[ControllerInfo] {
        &self.inventory
    }

    pub fn ehci_count(&self) -> usize {
        self.controllers.len()
    }

    pub fn ehci(&self) -> &[EhciController<W>] {
        &self.controllers
    }

    pub fn session(&self) -> &HidSession {
        &self.session
    }

    pub fn dma(&self) -> &A {
        &self.dma
    }

    pub fn config(&self) -> &UsbConfig {
        &self.config
    }
}

impl<W, A, D> fmt::Debug for UsbHost<W, A, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbHost")
            .field("inventory", &self.inventory)
            .field("ehci", &self.controllers.len())
            .field("session", &self.session)
            .finish()
    }
}
