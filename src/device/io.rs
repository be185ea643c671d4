//! Collaborator contracts consumed by the runtime.
//!
//! The runtime never touches hardware directly. Bring-up code hands it two
//! objects:
//!
//! - a [`RegisterIo`] for the MMIO register space of the vector unit
//! - a [`DmaAllocator`] for coherent staging buffers
//!
//! Both are shared as `Arc<dyn Trait>` so that contexts, the VRF manager and
//! memory operations can all reach the same device.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{VectorError, VectorResult};

/// Synchronous register accessor for the vector unit's MMIO space.
///
/// Implementations must only block for bus latency. Offsets are byte offsets
/// from the start of the register space.
pub trait RegisterIo: Send + Sync {
    /// Read a 32-bit register.
    fn read32(&self, offset: u64) -> VectorResult<u32>;

    /// Write a 32-bit register.
    fn write32(&self, offset: u64, value: u32) -> VectorResult<()>;

    /// Read a 64-bit register as two 32-bit halves (low word first).
    fn read64(&self, offset: u64) -> VectorResult<u64> {
        let lo = self.read32(offset)? as u64;
        let hi = self.read32(offset + 4)? as u64;
        Ok(lo | (hi << 32))
    }

    /// Write a 64-bit register as two 32-bit halves (low word first).
    fn write64(&self, offset: u64, value: u64) -> VectorResult<()> {
        self.write32(offset, value as u32)?;
        self.write32(offset + 4, (value >> 32) as u32)
    }

    /// Copy a byte range out of register space.
    ///
    /// The default goes through aligned 32-bit reads, so windows whose
    /// offset or length is not a multiple of four still work.
    fn copy_from_io(&self, offset: u64, buf: &mut [u8]) -> VectorResult<()> {
        let end = offset + buf.len() as u64;
        let mut word_addr = offset & !3;
        let mut word = [0u8; 4];

        while word_addr < end {
            LittleEndian::write_u32(&mut word, self.read32(word_addr)?);

            let lo = word_addr.max(offset);
            let hi = (word_addr + 4).min(end);
            let src = (lo - word_addr) as usize..(hi - word_addr) as usize;
            let dst = (lo - offset) as usize..(hi - offset) as usize;
            buf[dst].copy_from_slice(&word[src]);

            word_addr += 4;
        }
        Ok(())
    }

    /// Copy a byte range into register space.
    ///
    /// Partial words at either end are read back and merged first.
    fn copy_to_io(&self, offset: u64, data: &[u8]) -> VectorResult<()> {
        let end = offset + data.len() as u64;
        let mut word_addr = offset & !3;
        let mut word = [0u8; 4];

        while word_addr < end {
            let lo = word_addr.max(offset);
            let hi = (word_addr + 4).min(end);

            if hi - lo < 4 {
                LittleEndian::write_u32(&mut word, self.read32(word_addr)?);
            }

            let dst = (lo - word_addr) as usize..(hi - word_addr) as usize;
            let src = (lo - offset) as usize..(hi - offset) as usize;
            word[dst].copy_from_slice(&data[src]);
            self.write32(word_addr, LittleEndian::read_u32(&word))?;

            word_addr += 4;
        }
        Ok(())
    }
}

/// A DMA-coherent buffer handed out by a [`DmaAllocator`].
///
/// Deliberately not `Clone`: a buffer is freed exactly once by passing it
/// back to [`DmaAllocator::free_coherent`] (usually through a [`DmaGuard`]).
#[derive(Debug, PartialEq, Eq)]
pub struct DmaBuffer {
    cpu_handle: u64,
    device_addr: u64,
    len: usize,
}

impl DmaBuffer {
    /// Describe a buffer; only allocator implementations should call this.
    pub fn new(cpu_handle: u64, device_addr: u64, len: usize) -> Self {
        Self { cpu_handle, device_addr, len }
    }

    /// Opaque CPU-side handle.
    pub fn cpu_handle(&self) -> u64 {
        self.cpu_handle
    }

    /// Address the device uses to reach the buffer.
    pub fn device_addr(&self) -> u64 {
        self.device_addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Coherent DMA buffer allocator.
pub trait DmaAllocator: Send + Sync {
    /// Allocate a coherent buffer of `size` bytes.
    fn alloc_coherent(&self, size: usize) -> VectorResult<DmaBuffer>;

    /// Return a buffer to the allocator.
    fn free_coherent(&self, buffer: DmaBuffer);

    /// Fill part of a buffer from the CPU side.
    fn write_coherent(&self, buffer: &DmaBuffer, offset: usize, data: &[u8]) -> VectorResult<()>;

    /// Read part of a buffer from the CPU side.
    fn read_coherent(&self, buffer: &DmaBuffer, offset: usize, out: &mut [u8]) -> VectorResult<()>;
}

/// Scoped ownership of a [`DmaBuffer`]; frees it on drop.
pub struct DmaGuard<'a> {
    allocator: &'a dyn DmaAllocator,
    buffer: Option<DmaBuffer>,
}

impl<'a> DmaGuard<'a> {
    /// Allocate a buffer that is released when the guard goes out of scope.
    pub fn alloc(allocator: &'a dyn DmaAllocator, size: usize) -> VectorResult<Self> {
        let buffer = allocator.alloc_coherent(size)?;
        if buffer.len() < size {
            let got = buffer.len();
            allocator.free_coherent(buffer);
            return Err(VectorError::InvalidState(format!(
                "allocator returned {} bytes for a {} byte request",
                got, size
            )));
        }
        Ok(Self { allocator, buffer: Some(buffer) })
    }

    pub fn device_addr(&self) -> u64 {
        self.buffer.as_ref().map_or(0, DmaBuffer::device_addr)
    }

    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, DmaBuffer::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> VectorResult<()> {
        match &self.buffer {
            Some(buffer) => self.allocator.write_coherent(buffer, offset, data),
            None => Err(VectorError::InvalidState("DMA buffer already released".into())),
        }
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> VectorResult<()> {
        match &self.buffer {
            Some(buffer) => self.allocator.read_coherent(buffer, offset, out),
            None => Err(VectorError::InvalidState("DMA buffer already released".into())),
        }
    }

    /// Free the buffer now instead of at end of scope.
    pub fn release(mut self) {
        self.free();
    }

    fn free(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            log::trace!(
                "Freeing DMA buffer @ 0x{:X} ({} bytes)",
                buffer.device_addr(),
                buffer.len()
            );
            self.allocator.free_coherent(buffer);
        }
    }
}

impl Drop for DmaGuard<'_> {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Word-addressed register file for exercising the default methods.
    #[derive(Default)]
    struct WordRegs {
        words: Mutex<BTreeMap<u64, u32>>,
    }

    impl RegisterIo for WordRegs {
        fn read32(&self, offset: u64) -> VectorResult<u32> {
            assert_eq!(offset % 4, 0, "unaligned read32");
            Ok(*self.words.lock().unwrap().get(&offset).unwrap_or(&0))
        }

        fn write32(&self, offset: u64, value: u32) -> VectorResult<()> {
            assert_eq!(offset % 4, 0, "unaligned write32");
            self.words.lock().unwrap().insert(offset, value);
            Ok(())
        }
    }

    #[test]
    fn test_read64_write64_split() {
        let regs = WordRegs::default();
        regs.write64(0x10, 0x1122_3344_5566_7788).unwrap();

        assert_eq!(regs.read32(0x10).unwrap(), 0x5566_7788);
        assert_eq!(regs.read32(0x14).unwrap(), 0x1122_3344);
        assert_eq!(regs.read64(0x10).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_unaligned_copy_preserves_neighbours() {
        let regs = WordRegs::default();
        regs.write32(0x0, 0xAAAA_AAAA).unwrap();
        regs.write32(0x4, 0xBBBB_BBBB).unwrap();

        // Write 3 bytes starting at offset 2
        regs.copy_to_io(0x2, &[0x01, 0x02, 0x03]).unwrap();

        assert_eq!(regs.read32(0x0).unwrap(), 0x0201_AAAA);
        assert_eq!(regs.read32(0x4).unwrap(), 0xBBBB_BB03);

        let mut out = [0u8; 5];
        regs.copy_from_io(0x1, &mut out).unwrap();
        assert_eq!(out, [0xAA, 0x01, 0x02, 0x03, 0xBB]);
    }

    struct CountingAlloc {
        frees: AtomicUsize,
    }

    impl DmaAllocator for CountingAlloc {
        fn alloc_coherent(&self, size: usize) -> VectorResult<DmaBuffer> {
            Ok(DmaBuffer::new(1, 0x8000_0000, size))
        }

        fn free_coherent(&self, _buffer: DmaBuffer) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }

        fn write_coherent(&self, _b: &DmaBuffer, _o: usize, _d: &[u8]) -> VectorResult<()> {
            Ok(())
        }

        fn read_coherent(&self, _b: &DmaBuffer, _o: usize, _d: &mut [u8]) -> VectorResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_guard_frees_once() {
        let alloc = CountingAlloc { frees: AtomicUsize::new(0) };
        {
            let guard = DmaGuard::alloc(&alloc, 64).unwrap();
            assert_eq!(guard.len(), 64);
            assert_eq!(guard.device_addr(), 0x8000_0000);
        }
        assert_eq!(alloc.frees.load(Ordering::SeqCst), 1);

        let guard = DmaGuard::alloc(&alloc, 16).unwrap();
        guard.release();
        assert_eq!(alloc.frees.load(Ordering::SeqCst), 2);
    }
}
