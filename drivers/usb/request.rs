//! USB setup packets and the descriptor constants needed for enumeration

use super::Direction;

/// Descriptor types
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const HID: u8 = 0x21;
}

/// Interface class codes
pub mod class_code {
    pub const HID: u8 = 0x03;
}

/// HID subclass codes
pub mod hid_subclass {
    pub const BOOT: u8 = 0x01;
}

/// HID boot interface protocols
pub mod hid_protocol {
    pub const KEYBOARD: u8 = 0x01;
    pub const MOUSE: u8 = 0x02;
}

/// Standard requests
pub mod request {
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// HID class requests
pub mod hid_request {
    pub const GET_REPORT: u8 = 0x01;
    pub const SET_PROTOCOL: u8 = 0x0B;
}

/// bmRequestType values
pub mod request_type {
    /// Standard, device recipient, device to host
    pub const DEVICE_IN: u8 = 0x80;
    /// Standard, device recipient, host to device
    pub const DEVICE_OUT: u8 = 0x00;
    /// Class, interface recipient, host to device
    pub const CLASS_INTERFACE_OUT: u8 = 0x21;
    /// Class, interface recipient, device to host
    pub const CLASS_INTERFACE_IN: u8 = 0xA1;
}

/// HID report type carried in the high byte of GET_REPORT's wValue.
const REPORT_TYPE_INPUT: u16 = 0x01;

/// Value passed to SET_PROTOCOL to select the boot protocol.
pub const BOOT_PROTOCOL: u8 = 0;

/// The 8-byte packet sent in a control transfer's SETUP stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn get_descriptor(kind: u8, index: u8, length: u16) -> Self {
        Self {
            request_type: request_type::DEVICE_IN,
            request: request::GET_DESCRIPTOR,
            value: (kind as u16) << 8 | index as u16,
            index: 0,
            length,
        }
    }

    pub fn set_address(address: u8) -> Self {
        Self {
            request_type: request_type::DEVICE_OUT,
            request: request::SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    pub fn set_configuration(value: u8) -> Self {
        Self {
            request_type: request_type::DEVICE_OUT,
            request: request::SET_CONFIGURATION,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub fn hid_set_protocol(interface: u8, protocol: u8) -> Self {
        Self {
            request_type: request_type::CLASS_INTERFACE_OUT,
            request: hid_request::SET_PROTOCOL,
            value: protocol as u16,
            index: interface as u16,
            length: 0,
        }
    }

    /// GET_REPORT for input report id 0.
    pub fn hid_get_report(interface: u8, length: u16) -> Self {
        Self {
            request_type: request_type::CLASS_INTERFACE_IN,
            request: hid_request::GET_REPORT,
            value: REPORT_TYPE_INPUT << 8,
            index: interface as u16,
            length,
        }
    }

    /// Direction of the data stage, from bit 7 of bmRequestType.
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Wire format, little-endian.
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// Length of a complete device descriptor.
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// Length of a configuration descriptor header.
pub const CONFIG_HEADER_LEN: usize = 9;

/// Fields of the device descriptor the stack reports at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DEVICE_DESCRIPTOR_LEN || bytes[1] != descriptor_type::DEVICE {
            return None;
        }
        Some(Self {
            usb_version: u16::from_le_bytes([bytes[2], bytes[3]]),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: u16::from_le_bytes([bytes[8], bytes[9]]),
            product_id: u16::from_le_bytes([bytes[10], bytes[11]]),
            num_configurations: bytes[17],
        })
    }
}

/// Header fields of a configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigHeader {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
}

impl ConfigHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CONFIG_HEADER_LEN {
            return None;
        }
        Some(Self {
            total_length: u16::from_le_bytes([bytes[2], bytes[3]]),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_requests_on_the_wire() {
        assert_eq!(
            SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 8).to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00]
        );
        assert_eq!(
            SetupPacket::get_descriptor(descriptor_type::CONFIGURATION, 0, 9).to_bytes(),
            [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x00]
        );
        assert_eq!(SetupPacket::set_address(1).to_bytes(), [0x00, 0x05, 0x01, 0, 0, 0, 0, 0]);
        assert_eq!(SetupPacket::set_configuration(2).to_bytes(), [0x00, 0x09, 0x02, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_hid_class_requests_on_the_wire() {
        assert_eq!(
            SetupPacket::hid_set_protocol(1, BOOT_PROTOCOL).to_bytes(),
            [0x21, 0x0B, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            SetupPacket::hid_get_report(0, 8).to_bytes(),
            [0xA1, 0x01, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00]
        );
    }

    #[test]
    fn test_direction_from_request_type() {
        assert_eq!(SetupPacket::hid_get_report(0, 3).direction(), Direction::In);
        assert_eq!(SetupPacket::set_address(1).direction(), Direction::Out);
        let packet = SetupPacket::hid_get_report(2, 8);
        assert_eq!(SetupPacket::from_bytes(packet.to_bytes()), packet);
    }

    #[test]
    fn test_device_descriptor_parse() {
        let bytes = [
            18, 0x01, 0x00, 0x02, 0, 0, 0, 64, 0x6D, 0x04, 0x1C, 0xC3, 0x00, 0x01, 1, 2, 0, 1,
        ];
        let desc = DeviceDescriptor::parse(&bytes).expect("descriptor");
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.vendor_id, 0x046D);
        assert_eq!(desc.product_id, 0xC31C);
        assert_eq!(desc.max_packet_size0, 64);
        assert_eq!(desc.num_configurations, 1);
        assert!(DeviceDescriptor::parse(&bytes[..8]).is_none());
    }

    #[test]
    fn test_config_header_parse() {
        let header =
            ConfigHeader::parse(&[9, 0x02, 0x22, 0x00, 1, 1, 0, 0xA0, 50]).expect("header");
        assert_eq!(header.total_length, 34);
        assert_eq!(header.configuration_value, 1);
        assert!(ConfigHeader::parse(&[9, 2, 0]).is_none());
    }
}
