//! One-shot tensor allocator over a single backend buffer.
//!
//! Best-fit placement over an address-sorted free list with coalescing on
//! free. A measure allocator runs the same logic against a sentinel base to
//! compute worst-case peaks without touching any memory or tensor.

use crate::backend::buffer::{self, Buffer, BufferType};
use crate::error::{Error, ErrorKind, Result};
use crate::tensor::Tensor;
use tracing::trace;

pub const MAX_FREE_BLOCKS: usize = 256;

/// Sentinel base address for measure allocators.
const MEASURE_BASE: usize = 0x1000;

/// Offset into `base + offset` rounded up so the sum is aligned.
pub(crate) fn aligned_offset(base: usize, offset: usize, alignment: usize) -> usize {
    assert!(alignment.is_power_of_two());
    let align = (alignment - ((base + offset) % alignment)) % alignment;
    offset + align
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    addr: usize,
    size: usize,
}

pub struct TensorAlloc {
    buffer: Option<Buffer>,
    buft: BufferType,
    base: usize,
    alignment: usize,
    size: usize,
    free_blocks: Vec<FreeBlock>,
    max_size: usize,
}

impl TensorAlloc {
    /// Measure allocator for the given buffer type: same placement
    /// decisions, sentinel addresses, no memory.
    pub fn new_measure(buft: &BufferType) -> TensorAlloc {
        let mut alloc = TensorAlloc {
            buffer: None,
            buft: buft.clone(),
            base: MEASURE_BASE,
            alignment: buft.alignment(),
            size: usize::MAX / 2,
            free_blocks: Vec::new(),
            max_size: 0,
        };
        alloc.reset();
        alloc
    }

    /// Real allocator bound to an existing backend buffer.
    pub fn new_from_buffer(buffer: &Buffer) -> TensorAlloc {
        let mut alloc = TensorAlloc {
            buffer: Some(buffer.clone()),
            buft: buffer.buft(),
            base: buffer.base() as usize,
            alignment: buffer.buft().alignment(),
            size: buffer.size(),
            free_blocks: Vec::new(),
            max_size: 0,
        };
        alloc.reset();
        alloc
    }

    /// Reinstates a single free block covering the whole buffer, starting at
    /// the first aligned offset, and clears the `max_size` watermark.
    pub fn reset(&mut self) {
        self.free_blocks.clear();
        let align_offset = aligned_offset(self.base, 0, self.alignment);
        let size = if self.is_measure() {
            // half the address space, so aligning can never overflow
            usize::MAX / 2
        } else {
            self.size.saturating_sub(align_offset)
        };
        self.free_blocks.push(FreeBlock { addr: self.base + align_offset, size });
        self.max_size = 0;
    }

    pub fn is_measure(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// High-water mark relative to the buffer base since the last reset.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The aligned size this allocator charges for `tensor`.
    pub fn tensor_size(&self, tensor: &Tensor) -> usize {
        let size = match &self.buffer {
            Some(buffer) => buffer.alloc_size(tensor),
            None => self.buft.alloc_size(tensor),
        };
        aligned_offset(0, size, self.alignment)
    }

    /// Picks a placement for `tensor` and returns its address. In real mode
    /// the tensor's `buffer`/`data` are stamped and the buffer's init hook
    /// runs; a measure allocator leaves the tensor untouched.
    pub fn alloc(&mut self, tensor: &Tensor) -> Result<usize> {
        assert!(tensor.view_src().is_none(), "views get their address from their source");
        assert!(tensor.data().is_null(), "tensor already has storage");

        let size = self.tensor_size(tensor);
        let n = self.free_blocks.len();
        let mut max_avail = 0usize;

        // find the best fitting free block besides the last block
        let mut best_fit: Option<usize> = None;
        let mut best_size = usize::MAX;
        for (i, block) in self.free_blocks.iter().enumerate().take(n.saturating_sub(1)) {
            max_avail = max_avail.max(block.size);
            if block.size >= size && block.size <= best_size {
                best_fit = Some(i);
                best_size = block.size;
            }
        }

        let chosen = match best_fit {
            Some(i) => i,
            None => {
                // the last block is our last resort
                match self.free_blocks.last() {
                    Some(block) if block.size >= size => n - 1,
                    other => {
                        if let Some(block) = other {
                            max_avail = max_avail.max(block.size);
                        }
                        return Err(Error::new(ErrorKind::OutOfSpace {
                            needed: size,
                            largest: max_avail,
                        }));
                    }
                }
            }
        };

        let addr = self.free_blocks[chosen].addr;
        self.free_blocks[chosen].addr += size;
        self.free_blocks[chosen].size -= size;
        if self.free_blocks[chosen].size == 0 {
            self.free_blocks.remove(chosen);
        }

        self.max_size = self.max_size.max(addr - self.base + size);

        trace!(
            tensor = %tensor.name(),
            size,
            offset = addr - self.base,
            measure = self.is_measure(),
            "talloc: alloc"
        );

        if let Some(buffer) = &self.buffer {
            buffer::tensor_alloc(buffer, tensor, addr as *mut u8);
        }

        Ok(addr)
    }

    /// Returns a tensor's range to the free list. Tensors living in another
    /// buffer are ignored; the graph allocator routinely tries to free
    /// weights it does not own.
    pub fn free_tensor(&mut self, tensor: &Tensor) -> Result<()> {
        let Some(buffer) = &self.buffer else {
            // measure allocators are driven through free_raw
            return Ok(());
        };
        if tensor.buffer().as_ref() != Some(buffer) {
            return Ok(());
        }
        let addr = tensor.data() as usize;
        let size = self.tensor_size(tensor);
        trace!(tensor = %tensor.name(), size, offset = addr - self.base, "talloc: free");
        self.free_raw(addr, size)
    }

    /// Returns the range `[addr, addr + size)` to the free list, merging
    /// with neighbours. The free list stays sorted by address.
    pub fn free_raw(&mut self, addr: usize, size: usize) -> Result<()> {
        for i in 0..self.free_blocks.len() {
            let block = self.free_blocks[i];
            // range sits at the end of this block
            if block.addr + block.size == addr {
                self.free_blocks[i].size += size;
                // the grown block may now touch the next one
                if i + 1 < self.free_blocks.len()
                    && self.free_blocks[i].addr + self.free_blocks[i].size
                        == self.free_blocks[i + 1].addr
                {
                    self.free_blocks[i].size += self.free_blocks[i + 1].size;
                    self.free_blocks.remove(i + 1);
                }
                return Ok(());
            }
            // range sits right before this block
            if addr + size == block.addr {
                self.free_blocks[i].addr = addr;
                self.free_blocks[i].size += size;
                if i > 0
                    && self.free_blocks[i - 1].addr + self.free_blocks[i - 1].size
                        == self.free_blocks[i].addr
                {
                    self.free_blocks[i - 1].size += self.free_blocks[i].size;
                    self.free_blocks.remove(i);
                }
                return Ok(());
            }
        }

        // otherwise insert a new block, keeping the list address-sorted
        if self.free_blocks.len() == MAX_FREE_BLOCKS {
            return Err(Error::new(ErrorKind::TooManyFreeBlocks { cap: MAX_FREE_BLOCKS }));
        }
        let pos = self.free_blocks.partition_point(|b| b.addr < addr);
        self.free_blocks.insert(pos, FreeBlock { addr, size });
        Ok(())
    }

    #[cfg(test)]
    fn free_list(&self) -> Vec<(usize, usize)> {
        self.free_blocks.iter().map(|b| (b.addr - self.base, b.size)).collect()
    }
}

/// Allocates every unallocated tensor of `tensors` into one fresh buffer of
/// the given type; views are initialized from their sources. The order of
/// `tensors` must place view sources before their views.
pub fn alloc_tensors(tensors: &[Tensor], buft: &BufferType) -> Result<Buffer> {
    let alignment = buft.alignment();

    let mut nbytes = 0usize;
    for t in tensors {
        if t.data().is_null() && t.view_src().is_none() {
            nbytes += aligned_offset(0, buft.alloc_size(t), alignment);
        }
    }
    if nbytes == 0 {
        return Err(Error::msg("no tensors to allocate"));
    }

    let buffer = buft.alloc_buffer(nbytes)?;
    let mut talloc = TensorAlloc::new_from_buffer(&buffer);

    for t in tensors {
        if !t.data().is_null() {
            continue;
        }
        if t.view_src().is_none() {
            talloc.alloc(t)?;
        } else {
            buffer::view_init(t);
        }
    }

    Ok(buffer)
}
