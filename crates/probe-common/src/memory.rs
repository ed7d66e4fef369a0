//! Bounded reads of untrusted memory.
//!
//! Hooks never dereference kernel or user pointers directly: every access goes
//! through [`MemoryReader::read_bytes`], the equivalent of `bpf_probe_read`.
//! A read either fills the whole destination or fails, leaving the caller to
//! decide how to degrade.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("failed reading {len} bytes at {addr:#x}")]
    Fault { addr: u64, len: usize },
    #[error("address {base:#x} + {offset:#x} out of range")]
    Overflow { base: u64, offset: u64 },
}

/// Address of the field at `offset` inside the structure at `base`.
///
/// `base` usually comes from untrusted memory: an address past the end of
/// the address space is a failed read, never a wrapped one.
pub fn field_addr(base: u64, offset: u64) -> Result<u64, ReadError> {
    base.checked_add(offset).ok_or(ReadError::Overflow { base, offset })
}

pub trait MemoryReader: Send + Sync {
    /// Copy `dest.len()` bytes starting at `src` into `dest`.
    fn read_bytes(&self, dest: &mut [u8], src: u64) -> Result<(), ReadError>;

    fn read_array<const N: usize>(&self, src: u64) -> Result<[u8; N], ReadError> {
        let mut buf = [0; N];
        self.read_bytes(&mut buf, src)?;
        Ok(buf)
    }

    fn read_u16(&self, src: u64) -> Result<u16, ReadError> {
        self.read_array(src).map(u16::from_ne_bytes)
    }

    fn read_i16(&self, src: u64) -> Result<i16, ReadError> {
        self.read_array(src).map(i16::from_ne_bytes)
    }

    fn read_u32(&self, src: u64) -> Result<u32, ReadError> {
        self.read_array(src).map(u32::from_ne_bytes)
    }

    fn read_u64(&self, src: u64) -> Result<u64, ReadError> {
        self.read_array(src).map(u64::from_ne_bytes)
    }
}

impl<M: MemoryReader + ?Sized> MemoryReader for &M {
    fn read_bytes(&self, dest: &mut [u8], src: u64) -> Result<(), ReadError> {
        (**self).read_bytes(dest, src)
    }
}

/// Memory which can't be read at all. Useful for hooks which receive all
/// their data as arguments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemory;

impl MemoryReader for NoMemory {
    fn read_bytes(&self, dest: &mut [u8], src: u64) -> Result<(), ReadError> {
        Err(ReadError::Fault {
            addr: src,
            len: dest.len(),
        })
    }
}
