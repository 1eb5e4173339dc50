#[path = "../../drivers/pci.rs"]
pub mod pci;

#[path = "../../drivers/usb/mod.rs"]
pub mod usb;
