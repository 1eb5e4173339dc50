//! Device enumeration
//!
//! A linear, one-shot walk from the default address to a configured boot
//! protocol HID interface. Any failed transfer ends the walk and leaves the
//! session unconfigured; nothing is retried.

use core::fmt;

use log::{info, trace, warn};

use super::ehci::{EhciController, RegisterWindow};
use super::request::{
    class_code, descriptor_type, hid_protocol, hid_subclass, ConfigHeader, DeviceDescriptor,
    SetupPacket, BOOT_PROTOCOL, CONFIG_HEADER_LEN, DEVICE_DESCRIPTOR_LEN,
};
use super::transfer::{control_transfer, ControlTarget};
use super::UsbError;
use crate::config::{UsbConfig, CONFIG_BUFFER_LEN};
use crate::memory::DmaAllocator;

/// Address every device answers on before SET_ADDRESS.
pub const DEFAULT_ADDRESS: u8 = 0;

/// The one address handed out; there is a single device and no pool.
pub const ASSIGNED_ADDRESS: u8 = 1;

/// Bytes fetched to probe a device at the default address.
const SHORT_DESCRIPTOR_LEN: usize = 8;

/// Largest report length a HID descriptor may declare.
pub const MAX_REPORT_LEN: u16 = 64;

const KEYBOARD_REPORT_LEN: u8 = 8;
const MOUSE_REPORT_LEN: u8 = 3;

/// Boot protocol device behind the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Keyboard,
    Mouse,
    None,
}

impl DeviceKind {
    pub fn from_protocol(protocol: u8) -> Self {
        match protocol {
            hid_protocol::KEYBOARD => DeviceKind::Keyboard,
            hid_protocol::MOUSE => DeviceKind::Mouse,
            _ => DeviceKind::None,
        }
    }

    /// Report length assumed when the HID descriptor declares none.
    pub fn default_report_len(self) -> u8 {
        match self {
            DeviceKind::Keyboard => KEYBOARD_REPORT_LEN,
            _ => MOUSE_REPORT_LEN,
        }
    }
}

/// The single enumerated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidSession {
    pub address: u8,
    pub interface: u8,
    pub protocol: u8,
    pub report_len: u8,
    pub kind: DeviceKind,
}

impl HidSession {
    pub const fn unconfigured() -> Self {
        Self {
            address: 0,
            interface: 0,
            protocol: 0,
            report_len: 0,
            kind: DeviceKind::None,
        }
    }

    /// An address was assigned and enumeration ran to the end.
    pub fn is_configured(&self) -> bool {
        self.address != 0
    }

    /// Configured with a keyboard or mouse interface worth polling.
    pub fn is_hid(&self) -> bool {
        self.is_configured() && self.kind != DeviceKind::None
    }
}

impl Default for HidSession {
    fn default() -> Self {
        Self::unconfigured()
    }
}

/// Steps of the enumeration walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationState {
    Init,
    GetShortDescriptor,
    SetAddress,
    GetFullDescriptor,
    GetConfigHeader,
    GetConfigFull,
    SetConfig,
    ParseInterfaces,
    SetProtocol,
    NotHid,
}

impl fmt::Display for EnumerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnumerationState::Init => "init",
            EnumerationState::GetShortDescriptor => "no device desc",
            EnumerationState::SetAddress => "set address",
            EnumerationState::GetFullDescriptor => "full desc",
            EnumerationState::GetConfigHeader => "cfg header",
            EnumerationState::GetConfigFull => "cfg read",
            EnumerationState::SetConfig => "set config",
            EnumerationState::ParseInterfaces => "parse interfaces",
            EnumerationState::SetProtocol => "set protocol",
            EnumerationState::NotHid => "not hid",
        };
        f.write_str(name)
    }
}

/// Boot interface found in a configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidInterface {
    pub interface: u8,
    pub protocol: u8,
    pub kind: DeviceKind,
    /// Report length declared by a HID descriptor, if one was in range.
    pub report_len: Option<u8>,
}

/// Walk the sub-descriptors of a configuration descriptor.
///
/// The last boot-subclass HID interface wins. A HID descriptor declaring a
/// report length in 1..=64 overrides the default length. Descriptors cut off
/// by the end of `config` are ignored.
pub fn parse_interfaces(config: &[u8]) -> Option<HidInterface> {
    let mut found: Option<HidInterface> = None;
    let mut report_len = None;

    let mut index = CONFIG_HEADER_LEN;
    while index + 2 < config.len() {
        let length = config[index] as usize;
        let kind = config[index + 1];
        if length == 0 {
            break;
        }
        if let Some(desc) = config.get(index..index + length).filter(|d| d.len() >= 9) {
            match kind {
                descriptor_type::INTERFACE => {
                    if desc[5] == class_code::HID && desc[6] == hid_subclass::BOOT {
                        found = Some(HidInterface {
                            interface: desc[2],
                            protocol: desc[7],
                            kind: DeviceKind::from_protocol(desc[7]),
                            report_len: None,
                        });
                    }
                }
                descriptor_type::HID => {
                    let declared = u16::from_le_bytes([desc[7], desc[8]]);
                    if (1..=MAX_REPORT_LEN).contains(&declared) {
                        report_len = Some(declared as u8);
                    }
                }
                _ => {}
            }
        }
        index += length;
    }

    found.map(|iface| HidInterface { report_len, ..iface })
}

/// Enumerator state carried between steps
struct Enumeration<'a, W, A: ?Sized> {
    controller: &'a mut EhciController<W>,
    dma: &'a mut A,
    config: &'a UsbConfig,
    session: HidSession,
    config_buffer: [u8; CONFIG_BUFFER_LEN],
    config_len: usize,
    configuration_value: u8,
    interface: Option<HidInterface>,
}

impl<W: RegisterWindow, A: DmaAllocator + ?Sized> Enumeration<'_, W, A> {
    fn transfer(
        &mut self,
        address: u8,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<(), UsbError> {
        let direction = setup.direction();
        control_transfer(
            self.controller,
            self.dma,
            ControlTarget::default_pipe(address, self.config.max_packet_size0),
            &setup,
            data,
            direction,
            self.config.completion_spins,
        )
    }

    /// Run one state and return the next one.
    fn step(&mut self, state: EnumerationState) -> Result<EnumerationState, UsbError> {
        use EnumerationState::*;

        let next = match state {
            Init => GetShortDescriptor,
            GetShortDescriptor => {
                let mut desc = [0u8; SHORT_DESCRIPTOR_LEN];
                let setup =
                    SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, desc.len() as u16);
                self.transfer(DEFAULT_ADDRESS, setup, &mut desc)?;
                SetAddress
            }
            SetAddress => {
                let setup = SetupPacket::set_address(ASSIGNED_ADDRESS);
                self.transfer(DEFAULT_ADDRESS, setup, &mut [])?;
                self.session.address = ASSIGNED_ADDRESS;
                GetFullDescriptor
            }
            GetFullDescriptor => {
                let mut desc = [0u8; DEVICE_DESCRIPTOR_LEN];
                let setup =
                    SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, desc.len() as u16);
                self.transfer(ASSIGNED_ADDRESS, setup, &mut desc)?;
                if let Some(device) = DeviceDescriptor::parse(&desc) {
                    info!(
                        "USB device {:04x}:{:04x} class={:#04x} ep0={}",
                        device.vendor_id, device.product_id, device.class, device.max_packet_size0
                    );
                }
                GetConfigHeader
            }
            GetConfigHeader => {
                let mut header = [0u8; CONFIG_HEADER_LEN];
                let setup = SetupPacket::get_descriptor(
                    descriptor_type::CONFIGURATION,
                    0,
                    header.len() as u16,
                );
                self.transfer(ASSIGNED_ADDRESS, setup, &mut header)?;
                let header = ConfigHeader::parse(&header).ok_or(UsbError::HardwareAbsent)?;
                self.config_len = (header.total_length as usize).min(CONFIG_BUFFER_LEN);
                self.configuration_value = header.configuration_value;
                GetConfigFull
            }
            GetConfigFull => {
                let len = self.config_len;
                let setup =
                    SetupPacket::get_descriptor(descriptor_type::CONFIGURATION, 0, len as u16);
                let mut buffer = [0u8; CONFIG_BUFFER_LEN];
                self.transfer(ASSIGNED_ADDRESS, setup, &mut buffer[..len])?;
                self.config_buffer = buffer;
                SetConfig
            }
            SetConfig => {
                let setup = SetupPacket::set_configuration(self.configuration_value);
                self.transfer(ASSIGNED_ADDRESS, setup, &mut [])?;
                ParseInterfaces
            }
            ParseInterfaces => {
                self.interface = parse_interfaces(&self.config_buffer[..self.config_len]);
                let kind = self.interface.map_or(DeviceKind::None, |iface| iface.kind);
                if let Some(iface) = self.interface {
                    self.session.interface = iface.interface;
                    self.session.protocol = iface.protocol;
                }
                self.session.kind = kind;
                self.session.report_len = self
                    .interface
                    .and_then(|iface| iface.report_len)
                    .unwrap_or_else(|| kind.default_report_len());
                match kind {
                    DeviceKind::None => NotHid,
                    _ => SetProtocol,
                }
            }
            SetProtocol | NotHid => state,
        };
        Ok(next)
    }
}

/// Enumerate the device at the default address of `controller`.
///
/// Returns an unconfigured session if any transfer fails.
pub fn enumerate<W: RegisterWindow, A: DmaAllocator + ?Sized>(
    controller: &mut EhciController<W>,
    dma: &mut A,
    config: &UsbConfig,
) -> HidSession {
    let mut walk = Enumeration {
        controller,
        dma,
        config,
        session: HidSession::unconfigured(),
        config_buffer: [0; CONFIG_BUFFER_LEN],
        config_len: 0,
        configuration_value: 0,
        interface: None,
    };

    let mut state = EnumerationState::Init;
    loop {
        trace!("USB enumeration: {}", state);
        match walk.step(state) {
            Ok(next) if next == state => break,
            Ok(next) => state = next,
            Err(err) => {
                warn!("USB: {} failed: {}", state, err);
                return HidSession::unconfigured();
            }
        }
    }

    let session = walk.session;
    if state == EnumerationState::SetProtocol {
        let setup = SetupPacket::hid_set_protocol(session.interface, BOOT_PROTOCOL);
        if let Err(err) = walk.transfer(session.address, setup, &mut []) {
            // Devices already in boot protocol may refuse; keep the session.
            warn!("USB: set protocol failed: {}", err);
        }
        info!(
            "USB HID ready: {:?} iface={} report_len={}",
            session.kind, session.interface, session.report_len
        );
    } else {
        info!("USB device at address {} has no boot HID interface", session.address);
    }
    session
}
