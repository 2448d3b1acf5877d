//! DMA memory regions and the carveout allocator.
//!
//! A [`DmaRegion`] pairs a CPU-visible pointer with the device-visible
//! address of the same memory. Regions are zeroed when released so model
//! weights and feature maps never linger in the carveout.
//!
//! [`CarveoutAllocator`] is the provided allocator: one pinned anonymous
//! mapping standing in for the platform carveout, carved into regions by a
//! first-fit range allocator. The device sees the carveout at a fixed base
//! address; region device addresses are base plus offset.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use rustix::mm::{mlock, mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::{AevumError, Result};

/// Allocation granularity within the carveout.
const DMA_ALIGN: usize = 64;

/// Backing memory behind a [`DmaRegion`].
///
/// Implementations guarantee that `cpu_ptr` stays valid and points to
/// `size` bytes of memory reachable by the device at `device_addr` for as
/// long as the value lives, and that dropping the value releases the
/// backing allocation.
pub trait DmaMemory: Debug + Send + Sync {
    /// CPU-visible pointer to the start of the region.
    fn cpu_ptr(&self) -> *mut u8;
    /// Device-visible address of the same memory.
    fn device_addr(&self) -> u64;
    /// Region size in bytes.
    fn size(&self) -> usize;
}

/// Source of DMA regions shared with the accelerator.
pub trait DmaAllocator: Debug + Send + Sync {
    /// Allocate a region of exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero size, `OutOfMemory` when the backing
    /// store is exhausted.
    fn alloc(&self, size: usize) -> Result<DmaRegion>;
}

/// One CPU/device-shared memory region. Zeroed on release.
#[derive(Debug)]
pub struct DmaRegion {
    inner: Box<dyn DmaMemory>,
}

impl DmaRegion {
    /// Wrap allocator-provided backing memory.
    pub fn new(inner: Box<dyn DmaMemory>) -> Self {
        Self { inner }
    }

    /// Device-visible address of the region.
    pub fn device_addr(&self) -> u64 {
        self.inner.device_addr()
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Copy bytes out of the region.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the window falls outside the region.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_window(offset, out.len())?;
        // SAFETY: cpu_ptr is valid for `size` bytes (DmaMemory contract) and
        // the window was bounds-checked above. CPU-side accesses are
        // serialized by the caller; the device only touches the region
        // while an inference owns it.
        unsafe {
            std::ptr::copy_nonoverlapping(self.inner.cpu_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Copy bytes into the region.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the window falls outside the region.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_window(offset, data.len())?;
        // SAFETY: as in `read_at`; the source slice cannot overlap the
        // mapping because it is a safe Rust reference.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.inner.cpu_ptr().add(offset), data.len());
        }
        Ok(())
    }

    fn check_window(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(AevumError::invalid_argument(format!(
                "window {offset}+{len} outside region of {} bytes",
                self.size()
            )));
        }
        Ok(())
    }

    fn zero(&self) {
        // SAFETY: cpu_ptr valid for `size` bytes per the DmaMemory contract.
        unsafe {
            std::ptr::write_bytes(self.inner.cpu_ptr(), 0, self.size());
        }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        self.zero();
    }
}

/// First-fit allocator over one pinned anonymous mapping.
#[derive(Debug, Clone)]
pub struct CarveoutAllocator {
    shared: Arc<CarveoutShared>,
}

#[derive(Debug)]
struct CarveoutShared {
    base: *mut u8,
    len: usize,
    device_base: u64,
    free: Mutex<Vec<FreeRange>>,
}

// SAFETY: `base` points to a process-private mapping owned by this struct;
// all range bookkeeping goes through the `free` mutex and region contents
// are only touched through DmaRegion's serialized accessors.
unsafe impl Send for CarveoutShared {}
unsafe impl Sync for CarveoutShared {}

#[derive(Debug, Clone, Copy)]
struct FreeRange {
    offset: usize,
    len: usize,
}

impl CarveoutAllocator {
    /// Map and pin a carveout of `len` bytes, visible to the device at
    /// `device_base`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero length, `OutOfMemory` if the mapping
    /// cannot be created.
    pub fn new(device_base: u64, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(AevumError::invalid_argument("zero-length carveout"));
        }

        // SAFETY: null hint and a fresh length; the mapping is released in
        // CarveoutShared::drop with the same length.
        let base = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .map_err(|e| AevumError::out_of_memory(format!("carveout mmap of {len} bytes: {e}")))?;

        // Pinning keeps the pages resident like a real carveout. Without
        // CAP_IPC_LOCK large carveouts may exceed RLIMIT_MEMLOCK; the
        // allocator stays usable unpinned.
        // SAFETY: `base` was just mapped for `len` bytes.
        if let Err(e) = unsafe { mlock(base, len) } {
            tracing::warn!("Failed to pin carveout memory, continuing unpinned: {e}");
        }

        tracing::debug!(
            "Carveout mapped. base={base:p}, device_base={device_base:#x}, len={len:#x}"
        );

        Ok(Self {
            shared: Arc::new(CarveoutShared {
                base: base.cast(),
                len,
                device_base,
                free: Mutex::new(vec![FreeRange { offset: 0, len }]),
            }),
        })
    }

    /// Bytes currently available, summed over all free ranges.
    pub fn free_bytes(&self) -> usize {
        self.shared.free.lock().iter().map(|r| r.len).sum()
    }
}

impl DmaAllocator for CarveoutAllocator {
    fn alloc(&self, size: usize) -> Result<DmaRegion> {
        if size == 0 {
            return Err(AevumError::invalid_argument("zero-size DMA allocation"));
        }

        let need = size.div_ceil(DMA_ALIGN) * DMA_ALIGN;
        let mut free = self.shared.free.lock();
        let slot = free
            .iter()
            .position(|r| r.len >= need)
            .ok_or_else(|| {
                AevumError::out_of_memory(format!("carveout exhausted allocating {size} bytes"))
            })?;

        let offset = free[slot].offset;
        if free[slot].len == need {
            free.remove(slot);
        } else {
            free[slot].offset += need;
            free[slot].len -= need;
        }
        drop(free);

        tracing::trace!("Carveout alloc. offset={offset:#x}, size={size:#x}");

        Ok(DmaRegion::new(Box::new(CarveoutRegion {
            shared: Arc::clone(&self.shared),
            offset,
            reserved: need,
            size,
        })))
    }
}

#[derive(Debug)]
struct CarveoutRegion {
    shared: Arc<CarveoutShared>,
    offset: usize,
    reserved: usize,
    size: usize,
}

impl DmaMemory for CarveoutRegion {
    fn cpu_ptr(&self) -> *mut u8 {
        // SAFETY: offset + reserved lies within the carveout mapping by
        // construction in `alloc`.
        unsafe { self.shared.base.add(self.offset) }
    }

    fn device_addr(&self) -> u64 {
        self.shared.device_base + self.offset as u64
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for CarveoutRegion {
    fn drop(&mut self) {
        let mut free = self.shared.free.lock();
        let insert_at = free
            .iter()
            .position(|r| r.offset > self.offset)
            .unwrap_or(free.len());
        free.insert(
            insert_at,
            FreeRange {
                offset: self.offset,
                len: self.reserved,
            },
        );

        // Coalesce with neighbours to keep the list short.
        if insert_at + 1 < free.len()
            && free[insert_at].offset + free[insert_at].len == free[insert_at + 1].offset
        {
            free[insert_at].len += free[insert_at + 1].len;
            free.remove(insert_at + 1);
        }
        if insert_at > 0
            && free[insert_at - 1].offset + free[insert_at - 1].len == free[insert_at].offset
        {
            free[insert_at - 1].len += free[insert_at].len;
            free.remove(insert_at);
        }
    }
}

impl Drop for CarveoutShared {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe the mapping created in `new`; no
        // regions outlive the shared state (they hold an Arc to it).
        if let Err(e) = unsafe { munmap(self.base.cast(), self.len) } {
            tracing::warn!("Failed to unmap carveout: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_size() {
        let pool = CarveoutAllocator::new(0x6000_0000, 4096).unwrap();
        assert!(matches!(
            pool.alloc(0),
            Err(AevumError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn data_round_trip() {
        let pool = CarveoutAllocator::new(0x6000_0000, 4096).unwrap();
        let region = pool.alloc(256).unwrap();
        assert_eq!(region.size(), 256);
        assert_eq!(region.device_addr(), 0x6000_0000);

        region.write_at(16, b"feature map").unwrap();
        let mut out = [0u8; 11];
        region.read_at(16, &mut out).unwrap();
        assert_eq!(&out, b"feature map");

        let mut oob = [0u8; 8];
        assert!(region.read_at(252, &mut oob).is_err());
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let pool = CarveoutAllocator::new(0x6000_0000, 1024).unwrap();
        let _a = pool.alloc(512).unwrap();
        let _b = pool.alloc(512).unwrap();
        assert!(matches!(
            pool.alloc(64),
            Err(AevumError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn release_zeroes_and_reuses() {
        let pool = CarveoutAllocator::new(0x6000_0000, 1024).unwrap();
        let first = pool.alloc(128).unwrap();
        let addr = first.device_addr();
        first.write_at(0, &[0xAA; 128]).unwrap();
        drop(first);

        // First-fit hands back the same range, now zeroed.
        let second = pool.alloc(128).unwrap();
        assert_eq!(second.device_addr(), addr);
        let mut out = [0xFFu8; 128];
        second.read_at(0, &mut out).unwrap();
        assert_eq!(out, [0u8; 128]);
    }

    #[test]
    fn free_ranges_coalesce() {
        let pool = CarveoutAllocator::new(0x6000_0000, 4096).unwrap();
        let a = pool.alloc(1024).unwrap();
        let b = pool.alloc(1024).unwrap();
        let c = pool.alloc(1024).unwrap();
        drop(a);
        drop(c);
        drop(b);
        assert_eq!(pool.free_bytes(), 4096);
        // A full-size allocation only succeeds if the ranges merged.
        assert!(pool.alloc(4096).is_ok());
    }
}
