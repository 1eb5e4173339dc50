//! EHCI queue heads and queue element transfer descriptors
//!
//! Both structures are read and written by the controller through DMA, so
//! their layout is fixed by the EHCI specification (section 3.5 and 3.6):
//! 32-byte alignment and byte-exact field offsets, checked at compile time
//! below. The controller rewrites tokens and overlays while software holds
//! shared references, so every dword sits in an `UnsafeCell` and is only
//! touched through volatile accesses.

use core::cell::UnsafeCell;
use core::mem::{align_of, offset_of, size_of};
use core::ptr::{read_volatile, write_volatile};

use bit_field::BitField;

use super::Direction;
use crate::memory::PAGE_SIZE;

/// Link pointer terminate bit.
pub const LINK_TERMINATE: u32 = 1;

/// Link pointer type field value for a queue head.
pub const LINK_TYPE_QH: u32 = 0b01 << 1;

/// Buffer page pointers carried by one descriptor.
pub const BUFFER_PAGES: usize = 5;

/// Largest transfer one descriptor can describe, assuming a page-aligned start.
pub const MAX_TRANSFER_BYTES: usize = 0x5000;

/// Token bits
pub mod token {
    pub const HALTED: u32 = 1 << 6;
    pub const ACTIVE: u32 = 1 << 7;
    pub const DATA_TOGGLE: u32 = 1 << 31;
}

/// Endpoint characteristics: data toggle comes from the qTD, not the QH.
const EP_DATA_TOGGLE_CONTROL: usize = 14;

/// USB packet identifier encoded in a qTD token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

impl Pid {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Pid::Out),
            1 => Some(Pid::In),
            2 => Some(Pid::Setup),
            _ => None,
        }
    }
}

impl From<Direction> for Pid {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::In => Pid::In,
            Direction::Out => Pid::Out,
        }
    }
}

/// Build an active qTD token.
pub fn build_token(pid: Pid, length: u16, data_toggle: bool) -> u32 {
    let mut value = token::ACTIVE;
    value.set_bits(8..10, pid as u32);
    value.set_bits(16..31, (length as u32) & 0x7FFF);
    value.set_bit(31, data_toggle);
    value
}

/// Page pointer list for a buffer starting at `address`: the first entry is
/// the address itself, each following one is the start of the next 4 KiB page.
pub fn page_pointers(address: u32) -> [u32; BUFFER_PAGES] {
    let mut pages = [0u32; BUFFER_PAGES];
    let mut current = address;
    for page in pages.iter_mut() {
        *page = current;
        current = (current & !(PAGE_SIZE as u32 - 1)).wrapping_add(PAGE_SIZE as u32);
    }
    pages
}

/// Endpoint characteristics dword of a high-speed control queue head.
pub fn endpoint_characteristics(address: u8, endpoint: u8, max_packet: u16) -> u32 {
    let mut value = 0u32;
    value.set_bits(0..7, (address & 0x7F) as u32);
    value.set_bits(8..12, (endpoint & 0x0F) as u32);
    value.set_bit(EP_DATA_TOGGLE_CONTROL, true);
    value.set_bits(16..27, (max_packet & 0x7FF) as u32);
    value
}

/// A dword shared with the controller.
type DmaWord = UnsafeCell<u32>;

fn load(word: &DmaWord) -> u32 {
    unsafe { read_volatile(word.get()) }
}

fn store(word: &DmaWord, value: u32) {
    unsafe { write_volatile(word.get(), value) }
}

/// The dword layout shared by a qTD and a queue head's transfer overlay
#[repr(C)]
pub struct QtdWords {
    next: DmaWord,
    alt_next: DmaWord,
    token: DmaWord,
    buffer: [DmaWord; BUFFER_PAGES],
}

impl QtdWords {
    const fn empty() -> Self {
        Self {
            next: UnsafeCell::new(LINK_TERMINATE),
            alt_next: UnsafeCell::new(LINK_TERMINATE),
            token: UnsafeCell::new(0),
            buffer: [
                UnsafeCell::new(0),
                UnsafeCell::new(0),
                UnsafeCell::new(0),
                UnsafeCell::new(0),
                UnsafeCell::new(0),
            ],
        }
    }

    pub fn next(&self) -> u32 {
        load(&self.next)
    }

    pub fn set_next(&mut self, link: u32) {
        store(&self.next, link)
    }

    pub fn alt_next(&self) -> u32 {
        load(&self.alt_next)
    }

    pub fn set_alt_next(&mut self, link: u32) {
        store(&self.alt_next, link)
    }

    pub fn token(&self) -> u32 {
        load(&self.token)
    }

    pub fn set_token(&mut self, value: u32) {
        store(&self.token, value)
    }

    pub fn buffer(&self, page: usize) -> u32 {
        load(&self.buffer[page])
    }

    /// Fill the page pointer list for a buffer at bus address `address`.
    pub fn set_buffer(&mut self, address: u32) {
        for (word, pointer) in self.buffer.iter().zip(page_pointers(address)) {
            store(word, pointer);
        }
    }
}

/// Queue element transfer descriptor: one stage of a transfer
#[repr(C, align(32))]
pub struct TransferDescriptor {
    words: QtdWords,
}

impl TransferDescriptor {
    /// A terminated, inactive descriptor.
    pub const fn new() -> Self {
        Self {
            words: QtdWords::empty(),
        }
    }

    /// Arm the descriptor for one stage of a transfer.
    pub fn prepare(&mut self, pid: Pid, length: u16, data_toggle: bool, buffer: Option<u32>) {
        if let Some(address) = buffer {
            self.words.set_buffer(address);
        }
        self.words.set_token(build_token(pid, length, data_toggle));
    }

    pub fn link_to(&mut self, next: u32) {
        self.words.set_next(next);
    }

    pub fn next(&self) -> u32 {
        self.words.next()
    }

    pub fn token(&self) -> u32 {
        self.words.token()
    }

    pub fn pid(&self) -> Option<Pid> {
        Pid::from_bits(self.token().get_bits(8..10))
    }

    pub fn length(&self) -> u16 {
        self.token().get_bits(16..31) as u16
    }

    pub fn data_toggle(&self) -> bool {
        self.token().get_bit(31)
    }

    /// Set by software, cleared by the controller when the stage retires.
    pub fn is_active(&self) -> bool {
        self.token() & token::ACTIVE != 0
    }

    /// Set by the controller when the endpoint stalls or the stage errors out.
    pub fn is_halted(&self) -> bool {
        self.token() & token::HALTED != 0
    }

    pub fn buffer(&self, page: usize) -> u32 {
        self.words.buffer(page)
    }
}

impl Default for TransferDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue head: the endpoint a transfer runs against
#[repr(C, align(32))]
pub struct QueueHead {
    horizontal_link: DmaWord,
    endpoint_characteristics: DmaWord,
    endpoint_capabilities: DmaWord,
    current_qtd: DmaWord,
    overlay: QtdWords,
}

impl QueueHead {
    pub const fn new() -> Self {
        Self {
            horizontal_link: UnsafeCell::new(LINK_TERMINATE),
            endpoint_characteristics: UnsafeCell::new(0),
            endpoint_capabilities: UnsafeCell::new(0),
            current_qtd: UnsafeCell::new(0),
            overlay: QtdWords::empty(),
        }
    }

    /// Make this queue head the only entry of the async list, pointing at
    /// itself, and configure it for `endpoint_characteristics`.
    pub fn configure(&mut self, own_address: u32, endpoint_characteristics: u32) {
        store(&self.horizontal_link, own_address | LINK_TYPE_QH);
        store(&self.endpoint_characteristics, endpoint_characteristics);
    }

    /// Seed the overlay so the controller fetches `first` on its first pass.
    pub fn set_first_qtd(&mut self, first: u32) {
        store(&self.current_qtd, 0);
        self.overlay.set_next(first);
        self.overlay.set_alt_next(LINK_TERMINATE);
    }

    pub fn horizontal_link(&self) -> u32 {
        load(&self.horizontal_link)
    }

    pub fn endpoint_characteristics(&self) -> u32 {
        load(&self.endpoint_characteristics)
    }

    pub fn endpoint_capabilities(&self) -> u32 {
        load(&self.endpoint_capabilities)
    }

    pub fn current_qtd(&self) -> u32 {
        load(&self.current_qtd)
    }

    pub fn overlay(&self) -> &QtdWords {
        &self.overlay
    }
}

impl Default for QueueHead {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    assert!(size_of::<QtdWords>() == 32);
    assert!(size_of::<TransferDescriptor>() == 32);
    assert!(align_of::<TransferDescriptor>() == 32);
    assert!(offset_of!(QtdWords, next) == 0x00);
    assert!(offset_of!(QtdWords, alt_next) == 0x04);
    assert!(offset_of!(QtdWords, token) == 0x08);
    assert!(offset_of!(QtdWords, buffer) == 0x0C);
    assert!(align_of::<QueueHead>() == 32);
    assert!(offset_of!(QueueHead, horizontal_link) == 0x00);
    assert!(offset_of!(QueueHead, endpoint_characteristics) == 0x04);
    assert!(offset_of!(QueueHead, endpoint_capabilities) == 0x08);
    assert!(offset_of!(QueueHead, current_qtd) == 0x0C);
    assert!(offset_of!(QueueHead, overlay) == 0x10);
};
