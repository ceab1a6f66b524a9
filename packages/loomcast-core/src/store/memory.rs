//! Heap-backed content store.

use std::collections::HashMap;

use crate::error::{StreamError, StreamResult};

use super::{AllocHandle, ContentStore};

/// In-memory store: one `Vec<u8>` per allocation, budget enforced on the
/// sum of live allocation sizes.
pub struct InMemoryStore {
    capacity: u64,
    in_use: u64,
    next_handle: u64,
    allocations: HashMap<u64, Vec<u8>>,
}

impl InMemoryStore {
    /// Creates a store with the given byte budget.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            in_use: 0,
            next_handle: 1,
            allocations: HashMap::new(),
        }
    }

    fn get(&self, handle: AllocHandle) -> StreamResult<&Vec<u8>> {
        self.allocations
            .get(&handle.0)
            .ok_or_else(|| StreamError::Internal(format!("unknown allocation {}", handle.0)))
    }

    fn get_mut(&mut self, handle: AllocHandle) -> StreamResult<&mut Vec<u8>> {
        self.allocations
            .get_mut(&handle.0)
            .ok_or_else(|| StreamError::Internal(format!("unknown allocation {}", handle.0)))
    }
}

impl ContentStore for InMemoryStore {
    fn alloc(&mut self, size: usize) -> Option<AllocHandle> {
        if self.in_use + size as u64 > self.capacity {
            return None;
        }
        let handle = AllocHandle(self.next_handle);
        self.next_handle += 1;
        self.allocations.insert(handle.0, vec![0u8; size]);
        self.in_use += size as u64;
        Some(handle)
    }

    fn free(&mut self, handle: AllocHandle) -> StreamResult<()> {
        match self.allocations.remove(&handle.0) {
            Some(data) => {
                self.in_use -= data.len() as u64;
                Ok(())
            }
            None => Err(StreamError::Internal(format!(
                "double free of allocation {}",
                handle.0
            ))),
        }
    }

    fn write(&mut self, handle: AllocHandle, offset: usize, data: &[u8]) -> StreamResult<()> {
        let alloc = self.get_mut(handle)?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= alloc.len())
            .ok_or_else(|| StreamError::InvalidArgument("write outside allocation".into()))?;
        alloc[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, handle: AllocHandle, offset: usize, buf: &mut [u8]) -> StreamResult<()> {
        let alloc = self.get(handle)?;
        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= alloc.len())
            .ok_or_else(|| StreamError::InvalidArgument("read outside allocation".into()))?;
        buf.copy_from_slice(&alloc[offset..end]);
        Ok(())
    }

    fn allocation_size(&self, handle: AllocHandle) -> StreamResult<usize> {
        Ok(self.get(handle)?.len())
    }

    fn bytes_in_use(&self) -> u64 {
        self.in_use
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_in_use_tracks_live_allocations() {
        let mut store = InMemoryStore::new(100);
        let a = store.alloc(30).unwrap();
        let b = store.alloc(40).unwrap();
        assert_eq!(store.bytes_in_use(), 70);
        store.free(a).unwrap();
        assert_eq!(store.bytes_in_use(), 40);
        store.free(b).unwrap();
        assert_eq!(store.bytes_in_use(), 0);
    }

    #[test]
    fn double_free_is_an_error() {
        let mut store = InMemoryStore::new(100);
        let a = store.alloc(10).unwrap();
        store.free(a).unwrap();
        assert!(store.free(a).is_err());
    }
}
