use std::collections::BTreeMap;

use crate::{MemoryReader, ReadError};

/// Sparse fake address space used to feed hooks with kernel and user
/// structures. Only bytes explicitly written are readable: any read touching
/// an unmapped byte fails, just like `bpf_probe_read` on a bad pointer.
#[derive(Debug, Default, Clone)]
pub struct FakeMemory {
    bytes: BTreeMap<u64, u8>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `data` starting at `addr`.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> &mut Self {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
        self
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) -> &mut Self {
        self.write(addr, &value.to_ne_bytes())
    }

    pub fn write_i16(&mut self, addr: u64, value: i16) -> &mut Self {
        self.write(addr, &value.to_ne_bytes())
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> &mut Self {
        self.write(addr, &value.to_ne_bytes())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> &mut Self {
        self.write(addr, &value.to_ne_bytes())
    }

    /// Unmap `len` bytes starting at `addr`.
    pub fn unmap(&mut self, addr: u64, len: usize) -> &mut Self {
        for i in 0..len as u64 {
            self.bytes.remove(&(addr + i));
        }
        self
    }
}

impl MemoryReader for FakeMemory {
    fn read_bytes(&self, dest: &mut [u8], src: u64) -> Result<(), ReadError> {
        let err = ReadError::Fault {
            addr: src,
            len: dest.len(),
        };
        if src == 0 {
            return Err(err);
        }
        for (i, b) in dest.iter_mut().enumerate() {
            *b = *src
                .checked_add(i as u64)
                .and_then(|addr| self.bytes.get(&addr))
                .ok_or(err)?;
        }
        Ok(())
    }
}
