//! Host-side fakes for the hardware seams

use std::alloc::{alloc_zeroed, Layout};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::delay::Delay;
use crate::drivers::pci::{offset, ConfigSpace, PciAddress};
use crate::drivers::usb::ehci::{op_regs, PortStatus, RegisterWindow, UsbCommand};
use crate::drivers::usb::queue::token;
use crate::drivers::usb::request::{
    descriptor_type, hid_request, request, request_type, SetupPacket,
};
use crate::memory::{BumpAllocator, PAGE_SIZE};

/// Bus address the test arena is presented at.
const PHYS_BASE: u32 = 0x0100_0000;

/// Page-aligned, zeroed arena shared by a bump allocator and the fake controller.
///
/// The allocation is leaked so that copies of the handle never dangle.
#[derive(Debug, Clone, Copy)]
pub struct TestMemory {
    base: *mut u8,
    size: usize,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE).expect("layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "test arena allocation failed");
        Self { base, size }
    }

    pub fn phys_base(&self) -> u32 {
        PHYS_BASE
    }

    pub fn allocator(&self) -> BumpAllocator {
        unsafe { BumpAllocator::new(self.base, PHYS_BASE, self.size) }
    }

    pub fn contains(&self, phys: u32, len: usize) -> bool {
        phys >= PHYS_BASE && (phys - PHYS_BASE) as usize + len <= self.size
    }

    fn ptr(&self, phys: u32, len: usize) -> *mut u8 {
        assert!(self.contains(phys, len), "bus address {:#x} outside test memory", phys);
        unsafe { self.base.add((phys - PHYS_BASE) as usize) }
    }

    pub fn read_u32(&self, phys: u32) -> u32 {
        unsafe { self.ptr(phys, 4).cast::<u32>().read_volatile() }
    }

    pub fn write_u32(&self, phys: u32, value: u32) {
        unsafe { self.ptr(phys, 4).cast::<u32>().write_volatile(value) }
    }

    pub fn read_bytes(&self, phys: u32, len: usize) -> Vec<u8> {
        let ptr = self.ptr(phys, len);
        (0..len).map(|i| unsafe { ptr.add(i).read_volatile() }).collect()
    }

    pub fn write_bytes(&self, phys: u32, bytes: &[u8]) {
        let ptr = self.ptr(phys, bytes.len());
        for (i, byte) in bytes.iter().enumerate() {
            unsafe { ptr.add(i).write_volatile(*byte) }
        }
    }
}

/// Configuration space backed by a table of present functions.
#[derive(Debug, Default)]
pub struct FakeConfigSpace {
    functions: BTreeMap<PciAddress, [u32; 64]>,
    reads: BTreeMap<PciAddress, usize>,
}

impl FakeConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(
        &mut self,
        address: PciAddress,
        vendor_id: u16,
        class: u8,
        subclass: u8,
        prog_if: u8,
        bar0: u32,
    ) {
        let mut space = [0u32; 64];
        space[0] = 0x24CD_0000 | vendor_id as u32;
        space[2] = u32::from_le_bytes([0x10, prog_if, subclass, class]);
        space[(offset::BAR0 / 4) as usize] = bar0;
        self.functions.insert(address, space);
    }

    pub fn set_dword(&mut self, address: PciAddress, offset: u8, value: u32) {
        if let Some(space) = self.functions.get_mut(&address) {
            space[(offset / 4) as usize] = value;
        }
    }

    /// Configuration reads that targeted `address`.
    pub fn reads_of(&self, address: PciAddress) -> usize {
        self.reads.get(&address).copied().unwrap_or(0)
    }
}

impl ConfigSpace for FakeConfigSpace {
    fn read_dword(&mut self, address: PciAddress, offset: u8) -> u32 {
        *self.reads.entry(address).or_default() += 1;
        self.functions
            .get(&address)
            .map_or(0xFFFF_FFFF, |space| space[(offset / 4) as usize])
    }
}

/// Records every busy-wait instead of spinning.
#[derive(Debug, Default)]
pub struct CountingDelay {
    pub calls: Vec<u32>,
}

impl Delay for CountingDelay {
    fn spin(&mut self, iterations: u32) {
        self.calls.push(iterations);
    }
}

/// HID descriptor of a mouse declaring a 4-byte report.
pub const HID_DESCRIPTOR_MOUSE: [u8; 9] = [9, 0x21, 0x11, 0x01, 0, 1, 0x22, 4, 0];

/// A one-interface configuration descriptor with an interrupt IN endpoint.
pub fn config_descriptor(class: u8, subclass: u8, protocol: u8, hid: Option<[u8; 9]>) -> Vec<u8> {
    let mut desc = vec![9, descriptor_type::CONFIGURATION, 0, 0, 1, 1, 0, 0xA0, 50];
    desc.extend_from_slice(&[9, descriptor_type::INTERFACE, 0, 0, 1, class, subclass, protocol, 0]);
    if let Some(hid) = hid {
        desc.extend_from_slice(&hid);
    }
    desc.extend_from_slice(&[7, descriptor_type::ENDPOINT, 0x81, 0x03, 8, 0, 10]);
    let total = desc.len() as u16;
    desc[2..4].copy_from_slice(&total.to_le_bytes());
    desc
}

/// Scripted boot keyboard or mouse on the default control pipe.
#[derive(Debug, Clone)]
pub struct FakeHidDevice {
    pub address: u8,
    pub device_descriptor: [u8; 18],
    pub config_descriptor: Vec<u8>,
    /// Reports handed out by GET_REPORT; the last one repeats once drained.
    pub reports: VecDeque<Vec<u8>>,
    pub last_report: Vec<u8>,
    /// Every request seen, with the address it was sent to.
    pub requests: Vec<(u8, SetupPacket)>,
    pub configuration: Option<u8>,
    pub protocol: Option<u8>,
    /// Stop answering once this many requests have been answered.
    pub silent_after: Option<usize>,
    /// Request code answered with a STALL handshake on the SETUP stage.
    pub stall: Option<u8>,
}

impl FakeHidDevice {
    fn with_protocol(protocol: u8, report_len: usize) -> Self {
        Self {
            address: 0,
            device_descriptor: [
                18, descriptor_type::DEVICE, 0x00, 0x02, 0, 0, 0, 64, 0x6D, 0x04, 0x1C, 0xC3, 0x00,
                0x01, 1, 2, 0, 1,
            ],
            config_descriptor: config_descriptor(0x03, 0x01, protocol, None),
            reports: VecDeque::new(),
            last_report: vec![0; report_len],
            requests: Vec::new(),
            configuration: None,
            protocol: None,
            silent_after: None,
            stall: None,
        }
    }

    pub fn keyboard() -> Self {
        Self::with_protocol(1, 8)
    }

    pub fn mouse() -> Self {
        Self::with_protocol(2, 3)
    }

    pub fn queue_report(&mut self, report: &[u8]) {
        self.reports.push_back(report.to_vec());
    }

    /// Answer a SETUP packet. `None` leaves the transfer pending forever.
    fn handle(&mut self, address: u8, setup: SetupPacket) -> Option<Vec<u8>> {
        if address != self.address {
            return None;
        }
        self.requests.push((address, setup));
        if self.silent_after.is_some_and(|limit| self.requests.len() > limit) {
            return None;
        }

        let mut reply = match (setup.request_type, setup.request) {
            (request_type::DEVICE_IN, request::GET_DESCRIPTOR) => match (setup.value >> 8) as u8 {
                descriptor_type::DEVICE => self.device_descriptor.to_vec(),
                descriptor_type::CONFIGURATION => self.config_descriptor.clone(),
                _ => return None,
            },
            (request_type::DEVICE_OUT, request::SET_ADDRESS) => {
                self.address = setup.value as u8;
                Vec::new()
            }
            (request_type::DEVICE_OUT, request::SET_CONFIGURATION) => {
                self.configuration = Some(setup.value as u8);
                Vec::new()
            }
            (request_type::CLASS_INTERFACE_OUT, hid_request::SET_PROTOCOL) => {
                self.protocol = Some(setup.value as u8);
                Vec::new()
            }
            (request_type::CLASS_INTERFACE_IN, hid_request::GET_REPORT) => {
                if let Some(report) = self.reports.pop_front() {
                    self.last_report = report;
                }
                self.last_report.clone()
            }
            _ => return None,
        };
        reply.truncate(setup.length as usize);
        Some(reply)
    }
}

#[derive(Debug)]
struct EhciState {
    cap_length: u8,
    regs: BTreeMap<usize, u32>,
    writes: Vec<(usize, u32)>,
    memory: TestMemory,
    device: Option<FakeHidDevice>,
    schedule_runs: usize,
}

impl EhciState {
    /// Walk the queue head at ASYNCLISTADDR and retire every descriptor the
    /// device answers, the way the controller would over a few microframes.
    fn run_async_schedule(&mut self) {
        let list_addr = self.cap_length as usize + op_regs::ASYNCLISTADDR;
        let queue_head = self.regs.get(&list_addr).copied().unwrap_or(0);
        if !self.memory.contains(queue_head, 0x30) {
            return;
        }
        self.schedule_runs += 1;

        let memory = self.memory;
        let address = (memory.read_u32(queue_head + 4) & 0x7F) as u8;
        let mut pending: Option<VecDeque<u8>> = None;
        let mut next = memory.read_u32(queue_head + 0x10);

        while next & 1 == 0 && memory.contains(next, 32) {
            let qtd = next & !0x1F;
            let token_word = memory.read_u32(qtd + 8);
            if token_word & token::ACTIVE == 0 {
                break;
            }
            let length = ((token_word >> 16) & 0x7FFF) as usize;
            let buffer = memory.read_u32(qtd + 12);

            match (token_word >> 8) & 0b11 {
                2 => {
                    let bytes = memory.read_bytes(buffer, 8);
                    let mut packet = [0u8; 8];
                    packet.copy_from_slice(&bytes);
                    let Some(device) = self.device.as_mut() else { return };
                    let setup = SetupPacket::from_bytes(packet);
                    if address == device.address && device.stall == Some(setup.request) {
                        device.requests.push((address, setup));
                        memory.write_u32(qtd + 8, (token_word & !token::ACTIVE) | token::HALTED);
                        return;
                    }
                    match device.handle(address, setup) {
                        Some(reply) => pending = Some(reply.into()),
                        None => return,
                    }
                }
                1 => {
                    let Some(reply) = pending.as_mut() else { return };
                    let count = length.min(reply.len());
                    let chunk: Vec<u8> = reply.drain(..count).collect();
                    if count > 0 {
                        memory.write_bytes(buffer, &chunk);
                    }
                }
                _ => {
                    if pending.is_none() {
                        return;
                    }
                }
            }

            memory.write_u32(qtd + 8, token_word & !token::ACTIVE);
            next = memory.read_u32(qtd);
        }
    }
}

/// EHCI register file that runs the async schedule synchronously whenever
/// USBCMD is written with the async-enable bit set.
#[derive(Debug, Clone)]
pub struct FakeEhci {
    state: Rc<RefCell<EhciState>>,
}

impl FakeEhci {
    pub fn new(cap_length: u8, ports: u8, memory: TestMemory) -> Self {
        let mut regs = BTreeMap::new();
        regs.insert(0x00, 0x0100_0000 | cap_length as u32);
        regs.insert(0x04, ports as u32);
        Self {
            state: Rc::new(RefCell::new(EhciState {
                cap_length,
                regs,
                writes: Vec::new(),
                memory,
                device: None,
                schedule_runs: 0,
            })),
        }
    }

    pub fn attach(&self, device: FakeHidDevice) {
        self.state.borrow_mut().device = Some(device);
    }

    /// Mark `port` as connected and powered.
    pub fn connect_port(&self, port: u8) {
        let mut state = self.state.borrow_mut();
        let offset = state.cap_length as usize + op_regs::PORTSC_BASE + port as usize * 4;
        state.regs.insert(offset, (PortStatus::CONNECTED | PortStatus::POWER).bits());
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.state.borrow().regs.get(&offset).copied().unwrap_or(0)
    }

    /// Set a register without recording a driver write.
    pub fn set_reg(&self, offset: usize, value: u32) {
        self.state.borrow_mut().regs.insert(offset, value);
    }

    /// Register writes issued by the driver, in order.
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.borrow().writes.clone()
    }

    pub fn schedule_runs(&self) -> usize {
        self.state.borrow().schedule_runs
    }

    pub fn with_device<R>(&self, f: impl FnOnce(&mut FakeHidDevice) -> R) -> R {
        let mut state = self.state.borrow_mut();
        f(state.device.as_mut().expect("no device attached"))
    }
}

impl RegisterWindow for FakeEhci {
    fn read32(&self, offset: usize) -> u32 {
        self.reg(offset)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        let mut state = self.state.borrow_mut();
        state.writes.push((offset, value));
        let previous = state.regs.insert(offset, value).unwrap_or(0);
        let portsc = state.cap_length as usize + op_regs::PORTSC_BASE;
        let reset = PortStatus::RESET.bits();
        let leaving_reset = previous & reset != 0 && value & reset == 0;
        if offset >= portsc && leaving_reset && value & PortStatus::CONNECTED.bits() != 0 {
            // A high-speed device comes out of reset with the port enabled.
            state.regs.insert(offset, value | PortStatus::ENABLED.bits());
        }
        let usbcmd = state.cap_length as usize + op_regs::USBCMD;
        if offset == usbcmd && value & UsbCommand::ASYNC_ENABLE.bits() != 0 {
            state.run_async_schedule();
        }
    }
}
