//! Disk-spill content store.
//!
//! Keeps allocations in memory while the in-memory share of the budget
//! lasts, then backs further allocations with extents of an unlinked
//! temporary file. The overall budget covers both tiers; the interface is
//! identical to the in-memory store.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{StreamError, StreamResult};

use super::{AllocHandle, ContentStore};

enum Backing {
    Memory(Vec<u8>),
    /// Extent in the spill file.
    File { offset: u64, size: usize },
}

/// Free extent in the spill file, reused first-fit.
struct FreeExtent {
    offset: u64,
    size: usize,
}

/// Content store that spills past-`mem_limit` allocations to a temp file.
pub struct SpillStore {
    capacity: u64,
    mem_limit: u64,
    in_use: u64,
    mem_in_use: u64,
    next_handle: u64,
    allocations: HashMap<u64, Backing>,
    file: File,
    file_end: u64,
    free_extents: Vec<FreeExtent>,
}

impl SpillStore {
    /// Creates a spill store.
    ///
    /// `capacity` is the overall budget; `mem_limit` bounds the in-memory
    /// tier; `dir` hosts the (immediately unlinked) spill file.
    pub fn new(capacity: u64, mem_limit: u64, dir: &Path) -> StreamResult<Self> {
        let file = tempfile::tempfile_in(dir)
            .map_err(|e| StreamError::Internal(format!("spill file creation failed: {e}")))?;
        log::debug!(
            "[Store] Spill store created: capacity={}, mem_limit={}, dir={}",
            capacity,
            mem_limit,
            dir.display()
        );
        Ok(Self {
            capacity,
            mem_limit,
            in_use: 0,
            mem_in_use: 0,
            next_handle: 1,
            allocations: HashMap::new(),
            file,
            file_end: 0,
            free_extents: Vec::new(),
        })
    }

    fn file_extent(&mut self, size: usize) -> u64 {
        if let Some(pos) = self.free_extents.iter().position(|e| e.size >= size) {
            let extent = &mut self.free_extents[pos];
            let offset = extent.offset;
            if extent.size == size {
                self.free_extents.swap_remove(pos);
            } else {
                extent.offset += size as u64;
                extent.size -= size;
            }
            return offset;
        }
        let offset = self.file_end;
        self.file_end += size as u64;
        offset
    }

    fn io_err(e: std::io::Error) -> StreamError {
        StreamError::Internal(format!("spill file I/O failed: {e}"))
    }
}

impl ContentStore for SpillStore {
    fn alloc(&mut self, size: usize) -> Option<AllocHandle> {
        if self.in_use + size as u64 > self.capacity {
            return None;
        }
        let handle = AllocHandle(self.next_handle);
        self.next_handle += 1;

        let backing = if self.mem_in_use + size as u64 <= self.mem_limit {
            self.mem_in_use += size as u64;
            Backing::Memory(vec![0u8; size])
        } else {
            let offset = self.file_extent(size);
            // Zero-fill so reads before the first write are defined.
            let zeroes = vec![0u8; size];
            if self.file.seek(SeekFrom::Start(offset)).is_err()
                || self.file.write_all(&zeroes).is_err()
            {
                log::warn!("[Store] Spill extent initialization failed, declining allocation");
                self.free_extents.push(FreeExtent { offset, size });
                return None;
            }
            Backing::File { offset, size }
        };

        self.allocations.insert(handle.0, backing);
        self.in_use += size as u64;
        Some(handle)
    }

    fn free(&mut self, handle: AllocHandle) -> StreamResult<()> {
        match self.allocations.remove(&handle.0) {
            Some(Backing::Memory(data)) => {
                self.mem_in_use -= data.len() as u64;
                self.in_use -= data.len() as u64;
                Ok(())
            }
            Some(Backing::File { offset, size }) => {
                self.in_use -= size as u64;
                self.free_extents.push(FreeExtent { offset, size });
                Ok(())
            }
            None => Err(StreamError::Internal(format!(
                "double free of allocation {}",
                handle.0
            ))),
        }
    }

    fn write(&mut self, handle: AllocHandle, offset: usize, data: &[u8]) -> StreamResult<()> {
        match self.allocations.get_mut(&handle.0) {
            Some(Backing::Memory(alloc)) => {
                let end = offset
                    .checked_add(data.len())
                    .filter(|&end| end <= alloc.len())
                    .ok_or_else(|| {
                        StreamError::InvalidArgument("write outside allocation".into())
                    })?;
                alloc[offset..end].copy_from_slice(data);
                Ok(())
            }
            Some(&mut Backing::File {
                offset: base,
                size,
            }) => {
                if offset.checked_add(data.len()).map_or(true, |end| end > size) {
                    return Err(StreamError::InvalidArgument(
                        "write outside allocation".into(),
                    ));
                }
                self.file
                    .seek(SeekFrom::Start(base + offset as u64))
                    .and_then(|_| self.file.write_all(data))
                    .map_err(Self::io_err)
            }
            None => Err(StreamError::Internal(format!(
                "unknown allocation {}",
                handle.0
            ))),
        }
    }

    fn read(&mut self, handle: AllocHandle, offset: usize, buf: &mut [u8]) -> StreamResult<()> {
        match self.allocations.get(&handle.0) {
            Some(Backing::Memory(alloc)) => {
                let end = offset
                    .checked_add(buf.len())
                    .filter(|&end| end <= alloc.len())
                    .ok_or_else(|| {
                        StreamError::InvalidArgument("read outside allocation".into())
                    })?;
                buf.copy_from_slice(&alloc[offset..end]);
                Ok(())
            }
            Some(&Backing::File { offset: base, size }) => {
                if offset.checked_add(buf.len()).map_or(true, |end| end > size) {
                    return Err(StreamError::InvalidArgument(
                        "read outside allocation".into(),
                    ));
                }
                self.file
                    .seek(SeekFrom::Start(base + offset as u64))
                    .and_then(|_| self.file.read_exact(buf))
                    .map_err(Self::io_err)
            }
            None => Err(StreamError::Internal(format!(
                "unknown allocation {}",
                handle.0
            ))),
        }
    }

    fn allocation_size(&self, handle: AllocHandle) -> StreamResult<usize> {
        match self.allocations.get(&handle.0) {
            Some(Backing::Memory(data)) => Ok(data.len()),
            Some(&Backing::File { size, .. }) => Ok(size),
            None => Err(StreamError::Internal(format!(
                "unknown allocation {}",
                handle.0
            ))),
        }
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
    fn overflow_spills_to_file_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpillStore::new(1024, 8, dir.path()).unwrap();

        // First allocation fits in memory, second must spill.
        let a = store.alloc(8).unwrap();
        let b = store.alloc(64).unwrap();
        store.write(a, 0, b"memchunk").unwrap();
        store.write(b, 10, b"spilled-bytes").unwrap();

        let mut buf = vec![0u8; 13];
        store.read(b, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"spilled-bytes");

        // Zero-fill before first write.
        let mut head = vec![0xffu8; 10];
        store.read(b, 0, &mut head).unwrap();
        assert_eq!(head, vec![0u8; 10]);
    }

    #[test]
    fn freed_extents_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpillStore::new(1024, 0, dir.path()).unwrap();

        let a = store.alloc(32).unwrap();
        store.free(a).unwrap();
        let before = store.file_end;
        let _b = store.alloc(32).unwrap();
        assert_eq!(store.file_end, before, "extent reused, file did not grow");
    }
}
