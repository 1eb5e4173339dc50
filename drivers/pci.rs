//! PCI configuration space access and bus enumeration

use bit_field::BitField;
use core::ops::RangeInclusive;

#[cfg(target_arch = "x86_64")]
use x86_64::instructions::port::Port;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const DEVICES_PER_BUS: u8 = 32;
const FUNCTIONS_PER_DEVICE: u8 = 8;

/// Vendor id read back for an unimplemented device or function.
pub const VENDOR_ABSENT: u16 = 0xFFFF;

/// Serial bus controller class and its USB subclass.
pub const CLASS_SERIAL_BUS: u8 = 0x0C;
pub const SUBCLASS_USB: u8 = 0x03;

/// Configuration space register offsets
pub mod offset {
    pub const VENDOR_ID: u8 = 0x00;
    pub const DEVICE_ID: u8 = 0x02;
    pub const PROG_IF: u8 = 0x09;
    pub const SUBCLASS: u8 = 0x0A;
    pub const CLASS: u8 = 0x0B;
    pub const BAR0: u8 = 0x10;
}

/// Location of a function on the PCI bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self { bus, device, function }
    }

    /// Mechanism #1 address word selecting the dword containing `offset`.
    pub fn config_address(&self, offset: u8) -> u32 {
        let mut address = 0u32;
        address.set_bit(31, true);
        address.set_bits(16..24, self.bus as u32);
        address.set_bits(11..16, (self.device & 0x1F) as u32);
        address.set_bits(8..11, (self.function & 0x07) as u32);
        address.set_bits(0..8, (offset & 0xFC) as u32);
        address
    }
}

/// Access to configuration space. Word and byte reads are carved out of the
/// containing dword.
pub trait ConfigSpace {
    fn read_dword(&mut self, address: PciAddress, offset: u8) -> u32;

    fn read_word(&mut self, address: PciAddress, offset: u8) -> u16 {
        let dword = self.read_dword(address, offset);
        (dword >> ((offset & 2) * 8)) as u16
    }

    fn read_byte(&mut self, address: PciAddress, offset: u8) -> u8 {
        let dword = self.read_dword(address, offset);
        (dword >> ((offset & 3) * 8)) as u8
    }
}

impl<C: ConfigSpace + ?Sized> ConfigSpace for &mut C {
    fn read_dword(&mut self, address: PciAddress, offset: u8) -> u32 {
        (**self).read_dword(address, offset)
    }
}

/// Configuration mechanism #1 through the 0xCF8/0xCFC port pair
#[cfg(target_arch = "x86_64")]
pub struct PortConfigSpace {
    address: Port<u32>,
    data: Port<u32>,
}

#[cfg(target_arch = "x86_64")]
impl PortConfigSpace {
    /// # Safety
    /// The caller must be the only user of the configuration ports.
    pub unsafe fn new() -> Self {
        Self {
            address: Port::new(CONFIG_ADDRESS),
            data: Port::new(CONFIG_DATA),
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl ConfigSpace for PortConfigSpace {
    fn read_dword(&mut self, address: PciAddress, offset: u8) -> u32 {
        unsafe {
            self.address.write(address.config_address(offset));
            self.data.read()
        }
    }
}

/// PCI device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

/// Basic PCI function information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDevice {
    pub address: PciAddress,
    pub id: PciDeviceId,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

impl PciDevice {
    /// Read base address register `index` (0..=5).
    pub fn bar<C: ConfigSpace + ?Sized>(&self, config: &mut C, index: u8) -> u32 {
        config.read_dword(self.address, offset::BAR0 + index * 4)
    }

    pub fn is_class(&self, class: u8, subclass: u8) -> bool {
        self.class == class && self.subclass == subclass
    }
}

fn read_device<C: ConfigSpace + ?Sized>(
    config: &mut C,
    address: PciAddress,
    vendor_id: u16,
) -> PciDevice {
    let device_id = config.read_word(address, offset::DEVICE_ID);
    PciDevice {
        address,
        id: PciDeviceId { vendor_id, device_id },
        class: config.read_byte(address, offset::CLASS),
        subclass: config.read_byte(address, offset::SUBCLASS),
        prog_if: config.read_byte(address, offset::PROG_IF),
    }
}

/// Lazy walk over every present function on a range of buses.
///
/// A device whose function 0 is absent is skipped entirely; an absent higher
/// function only skips that function. Calling [`scan`] again rescans.
pub struct BusScan<'a, C: ConfigSpace + ?Sized> {
    config: &'a mut C,
    buses: RangeInclusive<u8>,
    bus: Option<u8>,
    device: u8,
    function: u8,
}

/// Enumerate the functions present on `buses`.
pub fn scan<C: ConfigSpace + ?Sized>(config: &mut C, buses: RangeInclusive<u8>) -> BusScan<'_, C> {
    BusScan {
        config,
        buses,
        bus: None,
        device: 0,
        function: 0,
    }
}

/// Functions on `buses` matching a class/subclass pair.
pub fn find_by_class<C: ConfigSpace + ?Sized>(
    config: &mut C,
    buses: RangeInclusive<u8>,
    class: u8,
    subclass: u8,
) -> impl Iterator<Item = PciDevice> + '_ {
    scan(config, buses).filter(move |d| d.is_class(class, subclass))
}

impl<C: ConfigSpace + ?Sized> Iterator for BusScan<'_, C> {
    type Item = PciDevice;

    fn next(&mut self) -> Option<PciDevice> {
        loop {
            let bus = match self.bus {
                Some(bus) => bus,
                None => {
                    let bus = self.buses.next()?;
                    self.bus = Some(bus);
                    self.device = 0;
                    self.function = 0;
                    bus
                }
            };
            if self.device >= DEVICES_PER_BUS {
                self.bus = None;
                continue;
            }
            if self.function >= FUNCTIONS_PER_DEVICE {
                self.device += 1;
                self.function = 0;
                continue;
            }

            let address = PciAddress::new(bus, self.device, self.function);
            self.function += 1;

            let vendor_id = self.config.read_word(address, offset::VENDOR_ID);
            if vendor_id == VENDOR_ABSENT {
                if address.function == 0 {
                    self.function = FUNCTIONS_PER_DEVICE;
                }
                continue;
            }
            return Some(read_device(&mut *self.config, address, vendor_id));
        }
    }
}
