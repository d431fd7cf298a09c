//! Flat, page granular physical memory.
//!
//! Byte addressable and little endian, such that instruction fetches (always
//! LE) and word loads work the same. Offsets start at 0 and end at
//! `capacity()`; anything past that faults.
//!
//! Raw storage comes from a [`PageAllocator`], so the backing store can be
//! swapped without touching the decoder or the engine.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::Range;
use std::ptr::NonNull;
use std::slice;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("access of {len} bytes at offset {offset:#x} exceeds capacity {capacity:#x}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("allocation of {bytes} bytes failed")]
    OutOfMemory { bytes: usize },
    #[error("invalid memory capacity of {requested} bytes")]
    InvalidCapacity { requested: usize },
}

/// Host page size in bytes.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

/// Owned, zero initialized storage handed out by a [`PageAllocator`].
///
/// The storage is released when the value is dropped.
pub trait PageStore: Send {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// Source of raw page storage.
pub trait PageAllocator: Send {
    /// `len` is always a non-zero multiple of [`page_size`].
    fn allocate_zeroed(&self, len: usize) -> Result<Box<dyn PageStore>, MemoryError>;
}

/// Page aligned allocation from the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapPages;

struct HeapBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is uniquely owned, nothing else holds the pointer.
unsafe impl Send for HeapBuffer {}

impl PageAllocator for HeapPages {
    fn allocate_zeroed(&self, len: usize) -> Result<Box<dyn PageStore>, MemoryError> {
        let layout = Layout::from_size_align(len, page_size())
            .map_err(|_| MemoryError::InvalidCapacity { requested: len })?;
        if layout.size() == 0 {
            return Err(MemoryError::InvalidCapacity { requested: len });
        }
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(MemoryError::OutOfMemory { bytes: len })?;
        Ok(Box::new(HeapBuffer { ptr, layout }))
    }
}

impl PageStore for HeapBuffer {
    fn bytes(&self) -> &[u8] {
        // SAFETY: `ptr` points to `layout.size()` initialized bytes owned by `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `HeapPages::allocate_zeroed` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Anonymous private `mmap`. Pages are only backed by the OS once touched,
/// which keeps large, sparsely used memories cheap.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapPages;

#[cfg(unix)]
struct MmapBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

#[cfg(unix)]
unsafe impl Send for MmapBuffer {}

#[cfg(unix)]
impl PageAllocator for MmapPages {
    fn allocate_zeroed(&self, len: usize) -> Result<Box<dyn PageStore>, MemoryError> {
        if len == 0 {
            return Err(MemoryError::InvalidCapacity { requested: len });
        }
        // SAFETY: anonymous mapping, no file descriptor or fixed address involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::OutOfMemory { bytes: len });
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::OutOfMemory { bytes: len })?;
        Ok(Box::new(MmapBuffer { ptr, len }))
    }
}

#[cfg(unix)]
impl PageStore for MmapBuffer {
    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes long, readable and zero filled.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[cfg(unix)]
impl Drop for MmapBuffer {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `MmapPages::allocate_zeroed`.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Bytes to copy to `offset` when memory is (re)initialized.
///
/// Only borrowed for the duration of a load, never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor<'a> {
    pub offset: usize,
    pub bytes: &'a [u8],
}

impl<'a> MemoryDescriptor<'a> {
    pub const fn new(offset: usize, bytes: &'a [u8]) -> Self {
        MemoryDescriptor { offset, bytes }
    }
}

pub struct Memory {
    allocator: Box<dyn PageAllocator>,
    storage: Box<dyn PageStore>,
    /// # INVARIANT
    /// A non-zero multiple of the page size, equal to the storage length.
    capacity: usize,
}

impl Memory {
    /// Allocates zeroed memory of at least `capacity` bytes from the heap.
    pub fn new(capacity: usize) -> Result<Self, MemoryError> {
        Self::with_allocator(capacity, Box::new(HeapPages))
    }

    pub fn with_allocator(
        capacity: usize,
        allocator: Box<dyn PageAllocator>,
    ) -> Result<Self, MemoryError> {
        let capacity = round_to_pages(capacity)?;
        let storage = allocator.allocate_zeroed(capacity)?;
        Ok(Memory {
            allocator,
            storage,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn range(&self, offset: usize, len: usize) -> Result<Range<usize>, MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(offset..end),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity,
            }),
        }
    }

    /// Copies the descriptor verbatim. Nothing is written if it does not fit.
    pub fn add_descriptor(&mut self, descriptor: &MemoryDescriptor<'_>) -> Result<(), MemoryError> {
        let range = self.range(descriptor.offset, descriptor.bytes.len())?;
        self.storage.bytes_mut()[range].copy_from_slice(descriptor.bytes);
        Ok(())
    }

    /// Applies descriptors in order. Later ones may overwrite earlier ones.
    ///
    /// Stops at the first descriptor that does not fit; the ones before it
    /// stay applied.
    pub fn load(&mut self, descriptors: &[MemoryDescriptor<'_>]) -> Result<(), MemoryError> {
        descriptors
            .iter()
            .try_for_each(|descriptor| self.add_descriptor(descriptor))
    }

    /// Swaps in freshly zeroed storage of the same capacity and drops the old one.
    ///
    /// The new storage is allocated before the old one is released, so for a
    /// moment both are held and peak usage is twice the capacity. In exchange
    /// an allocation failure leaves the current content in place.
    pub fn reallocate(&mut self) -> Result<(), MemoryError> {
        self.storage = self.allocator.allocate_zeroed(self.capacity)?;
        Ok(())
    }

    pub fn reset(&mut self, descriptors: &[MemoryDescriptor<'_>]) -> Result<(), MemoryError> {
        self.reallocate()?;
        self.load(descriptors)
    }

    pub fn read_slice(&self, offset: usize, len: usize) -> Result<&[u8], MemoryError> {
        let range = self.range(offset, len)?;
        Ok(&self.storage.bytes()[range])
    }

    fn read_array<const WIDTH: usize>(&self, offset: usize) -> Result<[u8; WIDTH], MemoryError> {
        let mut buf = [0u8; WIDTH];
        buf.copy_from_slice(self.read_slice(offset, WIDTH)?);
        Ok(buf)
    }

    fn write_array<const WIDTH: usize>(
        &mut self,
        offset: usize,
        bytes: [u8; WIDTH],
    ) -> Result<(), MemoryError> {
        let range = self.range(offset, WIDTH)?;
        self.storage.bytes_mut()[range].copy_from_slice(&bytes);
        Ok(())
    }

    pub fn read_word(&self, offset: usize) -> Result<u32, MemoryError> {
        self.read_array(offset).map(u32::from_le_bytes)
    }

    pub fn read_halfword(&self, offset: usize) -> Result<u16, MemoryError> {
        self.read_array(offset).map(u16::from_le_bytes)
    }

    pub fn read_byte(&self, offset: usize) -> Result<u8, MemoryError> {
        self.read_array(offset).map(u8::from_le_bytes)
    }

    pub fn write_word(&mut self, offset: usize, val: u32) -> Result<(), MemoryError> {
        self.write_array(offset, val.to_le_bytes())
    }

    pub fn write_halfword(&mut self, offset: usize, val: u16) -> Result<(), MemoryError> {
        self.write_array(offset, val.to_le_bytes())
    }

    pub fn write_byte(&mut self, offset: usize, val: u8) -> Result<(), MemoryError> {
        self.write_array(offset, [val])
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

fn round_to_pages(requested: usize) -> Result<usize, MemoryError> {
    let page = page_size();
    if requested == 0 {
        return Err(MemoryError::InvalidCapacity { requested });
    }
    requested
        .checked_next_multiple_of(page)
        .ok_or(MemoryError::InvalidCapacity { requested })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_pages() {
        let page = page_size();
        let mem = Memory::new(1).unwrap();
        assert_eq!(mem.capacity(), page);
        let mem = Memory::new(page).unwrap();
        assert_eq!(mem.capacity(), page);
        let mem = Memory::new(page + 1).unwrap();
        assert_eq!(mem.capacity(), 2 * page);
    }

    #[test]
    fn invalid_capacity() {
        assert_eq!(
            Memory::new(0).unwrap_err(),
            MemoryError::InvalidCapacity { requested: 0 }
        );
        assert_eq!(
            Memory::new(usize::MAX).unwrap_err(),
            MemoryError::InvalidCapacity {
                requested: usize::MAX
            }
        );
    }

    #[test]
    fn mem_test() {
        let mut mem = Memory::new(0x1000).unwrap();

        mem.write_word(0x100, 0x12_34_56_78)
            .expect("Write bound check failed");
        assert_eq!(mem.read_slice(0x100, 4).unwrap(), [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(
            mem.read_word(0x100).expect("Read bounds check failed"),
            0x12_34_56_78
        );
        assert_eq!(mem.read_halfword(0x102).unwrap(), 0x1234);
        assert_eq!(mem.read_byte(0x101).unwrap(), 0x56);
    }

    #[test]
    fn zero_initialized() {
        let mem = Memory::new(0x2000).unwrap();
        assert!(mem.read_slice(0, mem.capacity()).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn descriptors_overwrite_in_order() {
        let mut mem = Memory::new(0x1000).unwrap();
        mem.load(&[
            MemoryDescriptor::new(0, &[1, 2, 3, 4]),
            MemoryDescriptor::new(2, &[9, 9]),
        ])
        .unwrap();
        assert_eq!(mem.read_slice(0, 5).unwrap(), [1, 2, 9, 9, 0]);
    }

    #[test]
    fn descriptor_past_end_is_rejected() {
        let mut mem = Memory::new(0x1000).unwrap();
        let capacity = mem.capacity();
        mem.add_descriptor(&MemoryDescriptor::new(capacity - 4, &[0xaa; 4]))
            .unwrap();

        let err = mem
            .add_descriptor(&MemoryDescriptor::new(capacity - 1, &[1, 2]))
            .unwrap_err();
        assert_eq!(
            err,
            MemoryError::OutOfBounds {
                offset: capacity - 1,
                len: 2,
                capacity
            }
        );
        assert_eq!(mem.read_slice(capacity - 4, 4).unwrap(), [0xaa; 4]);
    }

    #[test]
    fn failing_descriptor_keeps_earlier_ones() {
        let mut mem = Memory::new(0x1000).unwrap();
        let capacity = mem.capacity();
        let err = mem.load(&[
            MemoryDescriptor::new(0, &[7, 7]),
            MemoryDescriptor::new(capacity, &[1]),
            MemoryDescriptor::new(4, &[8]),
        ]);
        assert!(matches!(err, Err(MemoryError::OutOfBounds { .. })));
        assert_eq!(mem.read_slice(0, 5).unwrap(), [7, 7, 0, 0, 0]);
    }

    #[test]
    fn access_out_of_bounds() {
        let mut mem = Memory::new(0x1000).unwrap();
        let capacity = mem.capacity();
        assert!(mem.read_word(capacity - 3).is_err());
        assert!(mem.read_byte(capacity).is_err());
        assert!(mem.read_word(usize::MAX - 1).is_err());
        assert!(mem.write_halfword(capacity - 1, 0xffff).is_err());
        assert_eq!(mem.read_byte(capacity - 1).unwrap(), 0);
    }

    #[test]
    fn reset_clears_previous_content() {
        let mut mem = Memory::new(0x1000).unwrap();
        mem.load(&[MemoryDescriptor::new(0x10, &[0xff; 16])]).unwrap();
        mem.reset(&[MemoryDescriptor::new(0, &[1])]).unwrap();
        assert_eq!(mem.read_byte(0).unwrap(), 1);
        assert!(mem.read_slice(1, 0x40).unwrap().iter().all(|&b| b == 0));
    }

    #[cfg(unix)]
    #[test]
    fn mmap_backing() {
        let mut mem = Memory::with_allocator(0x3000, Box::new(MmapPages)).unwrap();
        mem.write_word(0x2ffc, 0xdead_beef).unwrap();
        assert_eq!(mem.read_word(0x2ffc).unwrap(), 0xdead_beef);
        mem.reset(&[]).unwrap();
        assert_eq!(mem.read_word(0x2ffc).unwrap(), 0);
    }

    struct FailingAllocator;

    impl PageAllocator for FailingAllocator {
        fn allocate_zeroed(&self, len: usize) -> Result<Box<dyn PageStore>, MemoryError> {
            Err(MemoryError::OutOfMemory { bytes: len })
        }
    }

    #[test]
    fn allocation_failure_is_out_of_memory() {
        let err = Memory::with_allocator(0x1000, Box::new(FailingAllocator)).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));
    }

    /// Hands out `remaining` heap allocations, then runs out.
    struct LimitedAllocator {
        remaining: std::cell::Cell<usize>,
    }

    impl PageAllocator for LimitedAllocator {
        fn allocate_zeroed(&self, len: usize) -> Result<Box<dyn PageStore>, MemoryError> {
            match self.remaining.get() {
                0 => Err(MemoryError::OutOfMemory { bytes: len }),
                n => {
                    self.remaining.set(n - 1);
                    HeapPages.allocate_zeroed(len)
                }
            }
        }
    }

    #[test]
    fn failed_reset_keeps_content() {
        let allocator = LimitedAllocator {
            remaining: std::cell::Cell::new(1),
        };
        let mut mem = Memory::with_allocator(0x1000, Box::new(allocator)).unwrap();
        mem.write_word(0x40, 0x1234_5678).unwrap();

        let err = mem.reset(&[MemoryDescriptor::new(0, &[1])]).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));
        assert_eq!(mem.read_word(0x40).unwrap(), 0x1234_5678);
        assert_eq!(mem.read_byte(0).unwrap(), 0);
    }
}
