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

pub use saiga_err::*;

/// The addressing unit shared by all block storage devices, in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Per-read observer, invoked with the first sector of a read, the byte
/// offset into that sector, and the read length in bytes. Passed down as a
/// transient closure argument, never installed on the device.
pub type ReadHook<'a> = dyn FnMut(u64, u32, usize) + 'a;

pub trait BlockStorage {
    /// The number of addressable sectors on the device.
    fn sector_count(&self) -> u64;

    /// Reads `buffer.len()` bytes starting `offset` bytes into `sector`.
    ///
    /// `offset` shall be less than [`SECTOR_SIZE`]; the read itself crosses
    /// sector boundaries freely. Reading past the end of the device fails
    /// with [`IoError::OutOfRange`].
    fn read(&self, sector: u64, offset: u32, buffer: &mut [u8]) -> Result<()>;
}

impl<DS: BlockStorage + ?Sized> BlockStorage for &DS {
    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn read(&self, sector: u64, offset: u32, buffer: &mut [u8]) -> Result<()> {
        (**self).read(sector, offset, buffer)
    }
}
