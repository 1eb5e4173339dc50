//! DMA memory for controller descriptors
//!
//! The controller walks queue heads and transfer descriptors by bus address,
//! so every allocation handed to it carries both the CPU pointer and the
//! 32-bit address the hardware sees. The kernel only offers an
//! "allocate aligned, never freed" primitive; `BumpAllocator` models it.

use core::fmt;
use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

/// Page granularity shared by the allocator and the EHCI buffer pointers.
pub const PAGE_SIZE: usize = 4096;

/// A block of DMA-visible memory
pub struct DmaBuffer {
    virt: NonNull<u8>,
    phys: u32,
    len: usize,
}

impl DmaBuffer {
    /// Bus address of the first byte.
    pub fn phys(&self) -> u32 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: the allocator handed out `len` bytes that nothing else owns.
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: see `as_slice`.
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len) }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("phys", &format_args!("{:#010x}", self.phys))
            .field("len", &self.len)
            .finish()
    }
}

/// Source of DMA memory
pub trait DmaAllocator {
    /// Allocate `size` bytes whose bus address is a multiple of `align`.
    fn allocate(&mut self, size: usize, align: usize) -> Option<DmaBuffer>;
}

impl<A: DmaAllocator + ?Sized> DmaAllocator for &mut A {
    fn allocate(&mut self, size: usize, align: usize) -> Option<DmaBuffer> {
        (**self).allocate(size, align)
    }
}

/// Monotonic allocator over a fixed region. Nothing is ever released.
#[derive(Debug)]
pub struct BumpAllocator {
    virt_start: usize,
    phys_start: usize,
    size: usize,
    next: usize,
}

impl BumpAllocator {
    /// Create an allocator over `[virt_start, virt_start + size)` which the
    /// controller sees at `phys_start`.
    ///
    /// # Safety
    /// The region must be valid, unused by anything else and live forever.
    /// Both addresses must share the same offset within a page so that an
    /// aligned bus address is also an aligned pointer.
    pub unsafe fn new(virt_start: *mut u8, phys_start: u32, size: usize) -> Self {
        Self {
            virt_start: virt_start as usize,
            phys_start: phys_start as usize,
            size,
            next: 0,
        }
    }

    /// Allocator for identity-mapped memory, as set up by the boot code.
    ///
    /// # Safety
    /// Same requirements as [`BumpAllocator::new`].
    pub unsafe fn identity(start: u32, size: usize) -> Self {
        Self::new(start as usize as *mut u8, start, size)
    }

    /// Bytes consumed so far, alignment padding included.
    pub fn high_water_mark(&self) -> usize {
        self.next
    }

    pub fn remaining(&self) -> usize {
        self.size - self.next
    }
}

impl DmaAllocator for BumpAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Option<DmaBuffer> {
        if size == 0 {
            return None;
        }
        let align = if align == 0 { 4 } else { align };
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return None;
        }

        let start = align_up(self.phys_start.checked_add(self.next)?, align);
        let offset = start - self.phys_start;
        let end = offset.checked_add(size)?;
        if end > self.size || start as u64 + size as u64 > 1 << 32 {
            return None;
        }
        self.next = end;

        Some(DmaBuffer {
            virt: NonNull::new((self.virt_start + offset) as *mut u8)?,
            phys: start as u32,
            len: size,
        })
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A typed value living in DMA memory.
///
/// There is no `Drop`: the memory belongs to the allocator forever, which is
/// what the bump allocator underneath can offer.
pub struct DmaBox<T> {
    ptr: NonNull<T>,
    phys: u32,
}

impl<T> DmaBox<T> {
    /// Move `value` into freshly allocated DMA memory aligned for `T`.
    pub fn new_in<A: DmaAllocator + ?Sized>(value: T, dma: &mut A) -> Option<Self> {
        let buffer = dma.allocate(size_of::<T>(), align_of::<T>())?;
        let ptr = buffer.as_ptr().cast::<T>();
        if (ptr as usize) % align_of::<T>() != 0 {
            return None;
        }
        // Safety: the buffer is large enough, aligned and exclusively ours.
        unsafe { ptr.write(value) };
        Some(Self {
            ptr: NonNull::new(ptr)?,
            phys: buffer.phys(),
        })
    }

    /// Bus address of the value.
    pub fn phys(&self) -> u32 {
        self.phys
    }
}

impl<T> Deref for DmaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: written in `new_in` and never freed.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for DmaBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: `DmaBox` is the only owner of the allocation.
        unsafe { self.ptr.as_mut() }
    }
}
