//! User-visible DMA buffer handles.
//!
//! A [`Buffer`] is a cheaply clonable handle to one DMA region. Handle
//! clones stand in for the file-descriptor duplication of a kernel driver:
//! every inference that uses a buffer holds its own clone, and the region
//! is destroyed (and zeroed) when the last clone drops.

use std::sync::Arc;

use aevum_proto::WireBuffer;

use crate::dma::{DmaAllocator, DmaRegion};
use crate::error::Result;

/// A reference-counted memory object shared with the accelerator.
#[derive(Debug, Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

#[derive(Debug)]
struct BufferInner {
    region: DmaRegion,
}

impl Buffer {
    pub(crate) fn create(dma: &dyn DmaAllocator, size: usize) -> Result<Self> {
        let region = dma.alloc(size)?;
        tracing::debug!(
            "Buffer create. device_addr={:#x}, size={size}",
            region.device_addr()
        );
        Ok(Self {
            inner: Arc::new(BufferInner { region }),
        })
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.region.size() as u64
    }

    /// Map the buffer's CPU pages into a view the caller can read and
    /// write. Contents are shared live with any accelerator access; the
    /// view keeps the buffer alive like a mapping keeps its file.
    pub fn map(&self) -> BufferView {
        BufferView {
            buffer: self.clone(),
        }
    }

    /// Number of live handles, inferences included. Diagnostics only.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// The buffer's descriptor in the accelerator's address space.
    pub(crate) fn wire_ref(&self) -> WireBuffer {
        WireBuffer {
            ptr: self.inner.region.device_addr() as u32,
            size: self.inner.region.size() as u32,
        }
    }
}

/// A mapped window onto a buffer's memory.
#[derive(Debug, Clone)]
pub struct BufferView {
    buffer: Buffer,
}

impl BufferView {
    /// Bytes visible through the view.
    pub fn len(&self) -> usize {
        self.buffer.inner.region.size()
    }

    /// Whether the underlying buffer is empty. Never true for buffers the
    /// allocator produced.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes out of the shared memory.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the window exceeds the buffer.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.buffer.inner.region.read_at(offset, out)
    }

    /// Copy bytes into the shared memory.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the window exceeds the buffer.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.buffer.inner.region.write_at(offset, data)
    }
}
