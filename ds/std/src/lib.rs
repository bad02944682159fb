// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs::File, os::unix::fs::FileExt};

use log::error;
use saiga_ds::{BlockStorage, Error, IoError, Result, SECTOR_SIZE};

/// Block storage backed by a disk image file.
pub struct FileStorageServer {
    file: File,
    sector_count: u64,
}

impl FileStorageServer {
    pub fn new(file_path: &str) -> Result<Self> {
        let file = File::open(file_path).map_err(|_| Error::Io(IoError::ReadFailed))?;
        let sector_count = file
            .metadata()
            .map_err(|_| Error::Io(IoError::ReadFailed))?
            .len()
            / SECTOR_SIZE;
        Ok(Self { file, sector_count })
    }
}

impl BlockStorage for FileStorageServer {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read(&self, sector: u64, offset: u32, buffer: &mut [u8]) -> Result<()> {
        let Some(start) = sector
            .checked_mul(SECTOR_SIZE)
            .and_then(|start| start.checked_add(offset as u64))
            .filter(|start| {
                start
                    .checked_add(buffer.len() as u64)
                    .is_some_and(|end| end <= self.sector_count * SECTOR_SIZE)
            })
        else {
            error!(
                "Read of {} bytes at sector {sector} offset {offset} is out of range",
                buffer.len()
            );
            return Err(Error::Io(IoError::OutOfRange));
        };
        self.file
            .read_exact_at(buffer, start)
            .map_err(|_| Error::Io(IoError::ReadFailed))
    }
}

/// Block storage backed by memory.
pub struct MemoryStorageServer {
    bytes: Vec<u8>,
}

impl MemoryStorageServer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl BlockStorage for MemoryStorageServer {
    fn sector_count(&self) -> u64 {
        self.bytes.len() as u64 / SECTOR_SIZE
    }

    fn read(&self, sector: u64, offset: u32, buffer: &mut [u8]) -> Result<()> {
        let Some(bytes) = sector
            .checked_mul(SECTOR_SIZE)
            .and_then(|start| start.checked_add(offset as u64))
            .and_then(|start| usize::try_from(start).ok())
            .and_then(|start| start.checked_add(buffer.len()).map(|end| start..end))
            .and_then(|range| self.bytes.get(range))
        else {
            error!(
                "Read of {} bytes at sector {sector} offset {offset} is out of range",
                buffer.len()
            );
            return Err(Error::Io(IoError::OutOfRange));
        };
        buffer.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_read_within_bounds() {
        let storage = MemoryStorageServer::new((0..=255).cycle().take(2048).collect());
        let mut buffer = [0u8; 4];
        storage.read(1, 2, &mut buffer).unwrap();
        assert_eq!(buffer, [2, 3, 4, 5]);
    }

    #[test]
    fn memory_read_crosses_sectors() {
        let storage = MemoryStorageServer::new((0..=255).cycle().take(2048).collect());
        let mut buffer = [0u8; 8];
        storage.read(0, 508, &mut buffer).unwrap();
        assert_eq!(buffer, [252, 253, 254, 255, 0, 1, 2, 3]);
    }

    #[test]
    fn memory_read_past_end_is_out_of_range() {
        let storage = MemoryStorageServer::new(vec![0u8; 1024]);
        let mut buffer = [0u8; 16];
        assert!(matches!(
            storage.read(2, 0, &mut buffer),
            Err(Error::Io(IoError::OutOfRange))
        ));
    }
}
