use std::cell::Cell;

use byteorder::{ByteOrder, LittleEndian};

use crate::core::types::{Address, MemoryCopyError};

/**
 * Utility functions for copying memory out of a target.
 *
 * A target is anything that can copy raw bytes at an address: a live process, or a frozen set of
 * memory segments loaded from a target description. Words are decoded little-endian, which is
 * what every architecture we understand uses.
 */

const MAX_COPY_LENGTH: usize = 20_000_000;

pub trait TargetMemory {
    fn copy_address(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryCopyError>;

    fn copy(&self, addr: usize, length: usize) -> Result<Vec<u8>, MemoryCopyError> {
        if length > MAX_COPY_LENGTH {
            return Err(MemoryCopyError::RequestTooLarge(length));
        }
        let mut copy = vec![0; length];
        self.copy_address(addr, &mut copy)?;
        Ok(copy)
    }

    /// Reads one pointer-sized word. Misaligned reads are refused rather than attempted.
    fn read_word(&self, addr: Address, pointer_size: usize) -> Result<usize, MemoryCopyError> {
        check_pointer_size(pointer_size)?;
        if !addr.is_aligned(pointer_size) {
            return Err(MemoryCopyError::Misaligned(addr.as_usize(), pointer_size));
        }
        let bytes = self.copy(addr.as_usize(), pointer_size)?;
        Ok(LittleEndian::read_uint(&bytes, pointer_size) as usize)
    }

    fn read_address(
        &self,
        addr: Address,
        pointer_size: usize,
    ) -> Result<Option<Address>, MemoryCopyError> {
        Ok(Address::new(self.read_word(addr, pointer_size)?))
    }

    fn read_u16(&self, addr: Address) -> Result<u16, MemoryCopyError> {
        if !addr.is_aligned(2) {
            return Err(MemoryCopyError::Misaligned(addr.as_usize(), 2));
        }
        let bytes = self.copy(addr.as_usize(), 2)?;
        Ok(LittleEndian::read_u16(&bytes))
    }
}

impl<'a, T: TargetMemory + ?Sized> TargetMemory for &'a T {
    fn copy_address(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryCopyError> {
        (**self).copy_address(addr, buf)
    }
}

impl TargetMemory for remoteprocess::Process {
    fn copy_address(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryCopyError> {
        use remoteprocess::ProcessMemory;

        self.read(addr, buf).map_err(|e| {
            debug!("read of {} bytes at {:#x} failed: {}", buf.len(), addr, e);
            MemoryCopyError::from_os_error(addr, std::io::Error::last_os_error())
        })
    }
}

fn check_pointer_size(pointer_size: usize) -> Result<(), MemoryCopyError> {
    if pointer_size == 0 || pointer_size > 8 {
        return Err(MemoryCopyError::Message(format!(
            "unsupported pointer size {}",
            pointer_size
        )));
    }
    Ok(())
}

fn check_fits(word: u64, pointer_size: usize) -> Result<(), MemoryCopyError> {
    if pointer_size < 8 && word >> (pointer_size * 8) != 0 {
        return Err(MemoryCopyError::Message(format!(
            "{:#x} does not fit in {} bytes",
            word, pointer_size
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    base: usize,
    bytes: Vec<u8>,
}

impl Segment {
    fn end(&self) -> usize {
        self.base + self.bytes.len()
    }

    fn range(&self, addr: usize, length: usize) -> Option<std::ops::Range<usize>> {
        let start = addr.checked_sub(self.base)?;
        let end = start.checked_add(length)?;
        if end <= self.bytes.len() {
            Some(start..end)
        } else {
            None
        }
    }
}

/// Memory of a stopped target, held as a set of non-overlapping segments. Reads must fall
/// entirely inside one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    segments: Vec<Segment>,
}

impl MemorySnapshot {
    pub fn new() -> MemorySnapshot {
        MemorySnapshot::default()
    }

    pub fn add_segment(&mut self, base: usize, bytes: Vec<u8>) -> Result<(), MemoryCopyError> {
        let end = base
            .checked_add(bytes.len())
            .ok_or(MemoryCopyError::InvalidAddressError(base))?;
        if self.segments.iter().any(|s| base < s.end() && s.base < end) {
            return Err(MemoryCopyError::Message(format!(
                "segment at {:#x} overlaps an existing segment",
                base
            )));
        }
        self.segments.push(Segment { base, bytes });
        Ok(())
    }

    /// Adds a segment made of consecutive pointer-sized words starting at `base`.
    pub fn add_words(
        &mut self,
        base: usize,
        words: &[u64],
        pointer_size: usize,
    ) -> Result<(), MemoryCopyError> {
        check_pointer_size(pointer_size)?;
        let mut bytes = vec![0; words.len() * pointer_size];
        for (chunk, word) in bytes.chunks_mut(pointer_size).zip(words) {
            check_fits(*word, pointer_size)?;
            LittleEndian::write_uint(chunk, *word, pointer_size);
        }
        self.add_segment(base, bytes)
    }

    pub fn write_bytes(&mut self, addr: usize, data: &[u8]) -> Result<(), MemoryCopyError> {
        for segment in self.segments.iter_mut() {
            if let Some(range) = segment.range(addr, data.len()) {
                segment.bytes[range].copy_from_slice(data);
                return Ok(());
            }
        }
        Err(MemoryCopyError::InvalidAddressError(addr))
    }

    pub fn write_word(
        &mut self,
        addr: usize,
        value: u64,
        pointer_size: usize,
    ) -> Result<(), MemoryCopyError> {
        check_pointer_size(pointer_size)?;
        check_fits(value, pointer_size)?;
        let mut bytes = vec![0; pointer_size];
        LittleEndian::write_uint(&mut bytes, value, pointer_size);
        self.write_bytes(addr, &bytes)
    }
}

impl TargetMemory for MemorySnapshot {
    fn copy_address(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryCopyError> {
        for segment in &self.segments {
            if let Some(range) = segment.range(addr, buf.len()) {
                buf.copy_from_slice(&segment.bytes[range]);
                return Ok(());
            }
        }
        Err(MemoryCopyError::InvalidAddressError(addr))
    }
}

/// Wraps a target and counts the reads that go through it, successful or not.
pub struct CountingMemory<M> {
    inner: M,
    reads: Cell<usize>,
    highest: Cell<Option<usize>>,
}

impl<M: TargetMemory> CountingMemory<M> {
    pub fn new(inner: M) -> CountingMemory<M> {
        CountingMemory {
            inner,
            reads: Cell::new(0),
            highest: Cell::new(None),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    /// The highest address any read touched, or `None` when nothing was read.
    pub fn highest_address(&self) -> Option<usize> {
        self.highest.get()
    }

    pub fn reset(&self) {
        self.reads.set(0);
        self.highest.set(None);
    }
}

impl<M: TargetMemory> TargetMemory for CountingMemory<M> {
    fn copy_address(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryCopyError> {
        self.reads.set(self.reads.get() + 1);
        let last = addr.saturating_add(buf.len().saturating_sub(1));
        self.highest
            .set(Some(self.highest.get().map_or(last, |h| h.max(last))));
        self.inner.copy_address(addr, buf)
    }
}
