//! Byte-level access to the guest's linear memory.

use crate::error::{Error, Result};

/// A byte range in guest memory, as exchanged across the boundary.
///
/// Stored in guest memory as `[u32 LE offset][u32 LE len]` so it can be
/// returned through a single `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WidePtr {
    pub offset: u32,
    pub len: u32,
}

impl WidePtr {
    pub const SIZE: u32 = 8;

    #[must_use]
    pub const fn new(offset: u32, len: u32) -> Self {
        Self { offset, len }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0; 8];
        out[..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            offset: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Guest linear memory plus the guest's own allocator.
///
/// Implementations must bounds-check every access against the memory's
/// current size and report [`Error::OutOfBounds`] rather than panicking.
pub trait GuestMemory {
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the range exceeds guest memory.
    fn read_bytes(&mut self, offset: u32, len: u32) -> Result<Vec<u8>>;

    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the range exceeds guest memory.
    fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<()>;

    /// Ask the guest allocator for `len` bytes.
    ///
    /// # Errors
    /// Returns [`Error::AllocationFailed`] if the allocator traps or returns
    /// null for a non-empty request.
    fn allocate(&mut self, len: u32) -> Result<u32>;

    /// Return a buffer to the guest allocator.
    ///
    /// # Errors
    /// Returns [`Error::Wasm`] if the guest traps while freeing.
    fn deallocate(&mut self, offset: u32) -> Result<()>;

    /// Read a UTF-8 string; `what` names the field for error reporting.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] or [`Error::Decode`].
    fn read_str(&mut self, offset: u32, len: u32, what: &'static str) -> Result<String> {
        let bytes = self.read_bytes(offset, len)?;
        String::from_utf8(bytes).map_err(|e| Error::Decode {
            what,
            source: Box::new(e),
        })
    }

    /// Copy `bytes` into a freshly allocated guest buffer. The allocation is
    /// returned to the guest if the copy fails.
    ///
    /// # Errors
    /// Returns [`Error::AllocationFailed`] or [`Error::OutOfBounds`].
    fn write_buffer(&mut self, bytes: &[u8]) -> Result<WidePtr> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::AllocationFailed {
            len: u32::MAX,
            reason: format!("{} bytes exceed the 32-bit address space", bytes.len()),
        })?;
        let offset = self.allocate(len)?;
        if let Err(e) = self.write_bytes(offset, bytes) {
            // Report the write failure, not a secondary free failure.
            let _ = self.deallocate(offset);
            return Err(e);
        }
        Ok(WidePtr::new(offset, len))
    }

    /// Store `ptr` in an 8-byte guest allocation and return its address.
    ///
    /// # Errors
    /// Returns [`Error::AllocationFailed`] or [`Error::OutOfBounds`].
    fn write_wide_pointer(&mut self, ptr: WidePtr) -> Result<u32> {
        let outer = self.allocate(WidePtr::SIZE)?;
        if let Err(e) = self.write_bytes(outer, &ptr.to_bytes()) {
            let _ = self.deallocate(outer);
            return Err(e);
        }
        Ok(outer)
    }

    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the record lies outside guest memory.
    fn read_wide_pointer(&mut self, outer: u32) -> Result<WidePtr> {
        let bytes = self.read_bytes(outer, WidePtr::SIZE)?;
        let mut record = [0; 8];
        record.copy_from_slice(&bytes);
        Ok(WidePtr::from_bytes(record))
    }
}

/// Checked `offset..offset + len` into a memory of `size` bytes.
pub(crate) fn checked_range(offset: u32, len: usize, size: usize) -> Result<std::ops::Range<usize>> {
    let start = offset as usize;
    start
        .checked_add(len)
        .filter(|end| *end <= size)
        .map(|end| start..end)
        .ok_or(Error::OutOfBounds {
            offset: offset.into(),
            len: len as u64,
        })
}
