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

use log::{error, warn};
use saiga_ds::{BlockStorage, ReadHook, SECTOR_SIZE};
use saiga_fs::{
    find_file, DirectoryWalk, EntryInfo, Error, File, FileKind, FileSystem, FsError, IoError,
    Result,
};
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

/// The signature in the superblock.
const SIGNATURE: &[u8; 16] = b"!EssenceFS2-----";
/// The signature in directory entries.
const DIRENTRY_SIGNATURE: &[u8; 8] = b"DirEntry";
/// The newest on-disk revision this driver can read.
const DRIVER_VERSION: u16 = 10;
/// Valid block sizes are nonzero and have no bit set outside this mask,
/// which makes them multiples of 512 that comfortably fit 32 bits.
const BLOCK_SIZE_MASK: u64 = 0x1FF_FE00;
/// The superblock lives at byte offset 8192.
const SUPERBLOCK_SECTOR: u64 = 16;

/// DirectoryEntry.node_type: a file.
const NODE_TYPE_FILE: u8 = 1;
/// DirectoryEntry.node_type: a directory.
const NODE_TYPE_DIRECTORY: u8 = 2;

/// Contains the data of the file, or a directory's list of entries.
const ATTRIBUTE_DATA: u16 = 1;
/// Contains the UTF-8 filename.
const ATTRIBUTE_FILENAME: u16 = 2;

/// The data is stored in the attribute itself.
const INDIRECTION_DIRECT: u8 = 1;
/// The attribute contains an extent list that points to the data.
const INDIRECTION_L1: u8 = 2;

const NOT_ESSENCE_FS: &str = "not an essencefs filesystem";

pub struct FileSystemServer<DS: BlockStorage> {
    block_storage: DS,

    superblock: Box<Superblock>,
    block_size: u64,
    /// The root directory entry, replaced by the entry last resolved through
    /// [`FileSystem::open`] or [`FileSystem::dir`].
    current_entry: Box<DirectoryEntry>,
}

impl<DS: BlockStorage> FileSystemServer<DS> {
    pub fn new(block_storage: DS) -> Result<Self> {
        let mut superblock = Superblock::new_box_zeroed().map_err(|_| Error::OutOfMemory)?;
        read_at(&block_storage, SUPERBLOCK_SECTOR, 0, superblock.as_mut_bytes())
            .map_err(rewrite_out_of_range)?;

        if superblock.signature != *SIGNATURE {
            error!("Superblock signature shall be \"!EssenceFS2-----\"");
            return Err(Error::Fs(FsError::BadFs(NOT_ESSENCE_FS)));
        }
        let required_read_version = superblock.required_read_version.get();
        if required_read_version > DRIVER_VERSION {
            error!(
                "Required read version ({required_read_version}) shall be at most {DRIVER_VERSION}"
            );
            return Err(Error::Fs(FsError::BadFs(NOT_ESSENCE_FS)));
        }
        let block_size = superblock.block_size.get();
        if block_size == 0 || block_size & !BLOCK_SIZE_MASK != 0 {
            error!("Block size ({block_size}) shall be a nonzero multiple of 512 within {BLOCK_SIZE_MASK:#x}");
            return Err(Error::Fs(FsError::BadFs(NOT_ESSENCE_FS)));
        }
        if superblock.block_count.get() == 0 {
            error!("Block count shall be nonzero");
            return Err(Error::Fs(FsError::BadFs(NOT_ESSENCE_FS)));
        }
        if superblock.mounted != 0 {
            warn!("Volume is mounted or was not cleanly unmounted");
        }

        let mut current_entry = DirectoryEntry::new_box_zeroed().map_err(|_| Error::OutOfMemory)?;
        read_at(
            &block_storage,
            superblock.root.block.get().wrapping_mul(block_size / SECTOR_SIZE),
            superblock.root.offset_into_block.get() as u64,
            current_entry.as_mut_bytes(),
        )
        .map_err(rewrite_out_of_range)?;
        if current_entry.signature != *DIRENTRY_SIGNATURE {
            error!("Root directory entry signature shall be \"DirEntry\"");
            return Err(Error::Fs(FsError::BadFs("incorrect directory signature")));
        }

        Ok(Self {
            block_storage,
            superblock,
            block_size,
            current_entry,
        })
    }

    /// Reads `buffer.len()` bytes of `entry`'s data starting at byte
    /// `position`, clamped to the file size. Returns the number of bytes
    /// read, which falls short of the clamped length only when the extent
    /// list ends early. `hook` observes every block storage read issued on
    /// behalf of this call.
    fn read_file(
        &self,
        entry: &DirectoryEntry,
        position: u64,
        buffer: &mut [u8],
        mut hook: Option<&mut ReadHook<'_>>,
    ) -> Result<usize> {
        let bytes = entry.as_bytes();
        let Some((attribute_offset, attribute_size)) =
            find_attribute(entry, ATTRIBUTE_DATA, size_of::<DataAttribute>())
        else {
            error!("Directory entry shall have a data attribute");
            return Err(Error::Fs(FsError::BadFs("extents are missing")));
        };
        let attribute = &bytes[attribute_offset..attribute_offset + attribute_size];
        let (data, _) = DataAttribute::read_from_prefix(attribute)
            .map_err(|_| Error::Fs(FsError::BadFs("extents are missing")))?;

        let data_offset = data.data_offset as usize;
        if data_offset > attribute_size {
            error!("Data offset ({data_offset}) shall be within the attribute ({attribute_size})");
            return Err(Error::Fs(FsError::BadFs("data offset is too large")));
        }
        let payload_size = attribute_size - data_offset;

        let file_size = entry.file_size.get();
        if position > file_size {
            return Err(Error::Io(IoError::OutOfRange));
        }
        let mut length = buffer.len().min((file_size - position) as usize);

        match data.indirection {
            INDIRECTION_DIRECT => {
                let available = (data.count.get() as usize).max(payload_size);
                if position > available as u64 {
                    return Err(Error::Io(IoError::OutOfRange));
                }
                let position = position as usize;
                length = length.min(available - position);
                // The declared byte count may exceed the attribute; the copy
                // still never leaves the 1024-byte entry buffer.
                let start = (attribute_offset + data_offset + position).min(bytes.len());
                let end = (start + length).min(bytes.len());
                buffer[..end - start].copy_from_slice(&bytes[start..end]);
                Ok(end - start)
            }
            INDIRECTION_L1 => {
                let mut extent_offset = data_offset;
                let mut current_position: u64 = 0;
                let mut current_start: u64 = 0;
                let mut already_read = 0;

                for _ in 0..data.count.get() {
                    if already_read >= length {
                        break;
                    }
                    if extent_offset >= attribute.len() {
                        break;
                    }
                    let header = attribute[extent_offset];
                    extent_offset += 1;
                    let start_bytes = (header & 7) as usize + 1;
                    let count_bytes = ((header >> 3) & 7) as usize + 1;
                    if extent_offset + start_bytes + count_bytes > payload_size {
                        return Ok(already_read);
                    }

                    // The start is a signed big-endian delta to the previous
                    // extent's starting block.
                    let mut start: u64 = if attribute[extent_offset] & 0x80 != 0 {
                        u64::MAX
                    } else {
                        0
                    };
                    for _ in 0..start_bytes {
                        start = (start << 8) | attribute[extent_offset] as u64;
                        extent_offset += 1;
                    }
                    let mut count: u64 = 0;
                    for _ in 0..count_bytes {
                        count = (count << 8) | attribute[extent_offset] as u64;
                        extent_offset += 1;
                    }
                    current_start = current_start.wrapping_add(start);

                    let extent_bytes = count.wrapping_mul(self.block_size);
                    if current_position.wrapping_add(extent_bytes) < position {
                        current_position = current_position.wrapping_add(extent_bytes);
                        continue;
                    }
                    let skip = position.saturating_sub(current_position);
                    let to_read = ((length - already_read) as u64)
                        .min(extent_bytes.wrapping_sub(skip)) as usize;

                    let sector = current_start
                        .wrapping_mul(self.block_size / SECTOR_SIZE)
                        .wrapping_add(skip / SECTOR_SIZE);
                    let offset = (skip & 0x1FF) as u32;
                    if let Some(hook) = hook.as_deref_mut() {
                        hook(sector, offset, to_read);
                    }
                    self.block_storage.read(
                        sector,
                        offset,
                        &mut buffer[already_read..already_read + to_read],
                    )?;

                    already_read += to_read;
                    current_position = current_position.wrapping_add(extent_bytes);
                }

                Ok(already_read)
            }
            indirection => {
                error!("Data indirection ({indirection}) shall be direct or level-1");
                Err(Error::Fs(FsError::BadFs("unknown redirection")))
            }
        }
    }

    /// Walks `directory` slot by slot, handing every well-formed child entry
    /// to `hook`. Malformed slots are skipped, never fatal.
    fn iterate_directory(
        &self,
        directory: &DirectoryEntry,
        hook: &mut dyn FnMut(&str, FileKind, Box<DirectoryEntry>) -> bool,
    ) -> Result<bool> {
        if directory.node_type != NODE_TYPE_DIRECTORY {
            return Err(Error::Fs(FsError::BadFileType));
        }
        let directory_size = directory.file_size.get();
        if directory_size >= 0x8000_0000 {
            error!("Directory size ({directory_size}) shall be below 2 GiB");
            return Err(Error::Fs(FsError::BadFs("directory too large")));
        }

        let mut position = 0;
        while position < directory_size {
            let mut child = DirectoryEntry::new_box_zeroed().map_err(|_| Error::OutOfMemory)?;
            self.read_file(directory, position, child.as_mut_bytes(), None)?;
            position += size_of::<DirectoryEntry>() as u64;

            if child.signature != *DIRENTRY_SIGNATURE {
                continue;
            }
            let Some((name_offset, name_size)) =
                find_attribute(&child, ATTRIBUTE_FILENAME, size_of::<FilenameAttribute>())
            else {
                continue;
            };
            let Ok((name_attribute, _)) =
                FilenameAttribute::read_from_prefix(&child.as_bytes()[name_offset..])
            else {
                continue;
            };
            let name_length = name_attribute.length.get() as usize;
            if name_length > name_size - size_of::<FilenameAttribute>() {
                continue;
            }
            let name_start = name_offset + size_of::<FilenameAttribute>();
            let Ok(name) =
                String::from_utf8(child.as_bytes()[name_start..name_start + name_length].to_vec())
            else {
                continue;
            };

            let kind = match child.node_type {
                NODE_TYPE_DIRECTORY => FileKind::Directory,
                NODE_TYPE_FILE => FileKind::Regular,
                _ => FileKind::Unknown,
            };
            if hook(&name, kind, child) {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

impl<DS: BlockStorage> DirectoryWalk for FileSystemServer<DS> {
    type Node = Box<DirectoryEntry>;

    fn iterate(
        &self,
        directory: &Self::Node,
        hook: &mut dyn FnMut(&str, FileKind, Self::Node) -> bool,
    ) -> Result<bool> {
        self.iterate_directory(directory, hook)
    }
}

impl<DS: BlockStorage> FileSystem for FileSystemServer<DS> {
    type File = FileHandle<DS>;

    fn open(mut self, path: &str) -> Result<FileHandle<DS>> {
        let root = self.current_entry.clone();
        let entry = find_file(&self, root, path, FileKind::Regular)?;
        self.current_entry = entry;

        let size = self.current_entry.file_size.get();
        Ok(FileHandle {
            file_system: self,
            size,
            position: 0,
        })
    }

    fn dir(&mut self, path: &str, hook: &mut dyn FnMut(&str, &EntryInfo) -> bool) -> Result<()> {
        let root = self.current_entry.clone();
        let directory = find_file(&*self, root, path, FileKind::Directory)?;
        self.current_entry = directory;

        self.iterate_directory(&self.current_entry, &mut |name, kind, child| {
            let info = EntryInfo {
                is_dir: kind == FileKind::Directory,
                mtime_seconds: child.modification_time.get() / 1_000_000,
            };
            hook(name, &info)
        })?;
        Ok(())
    }

    fn label(&self) -> Result<String> {
        let volume_name = &self.superblock.volume_name;
        let length = volume_name
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(volume_name.len());
        Ok(String::from_utf8_lossy(&volume_name[..length]).into_owned())
    }

    fn uuid(&self) -> Result<String> {
        Ok(self
            .superblock
            .identifier
            .0
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect())
    }
}

/// An opened file. Carries its own mount, which is released on drop.
pub struct FileHandle<DS: BlockStorage> {
    file_system: FileSystemServer<DS>,
    size: u64,
    position: u64,
}

impl<DS: BlockStorage> FileHandle<DS> {
    /// Like [`File::read`], with `hook` observing every block storage read
    /// this call issues.
    pub fn read_with_hook(
        &mut self,
        buffer: &mut [u8],
        hook: Option<&mut ReadHook<'_>>,
    ) -> Result<usize> {
        let read = self.file_system.read_file(
            &self.file_system.current_entry,
            self.position,
            buffer,
            hook,
        )?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<DS: BlockStorage> File for FileHandle<DS> {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        self.read_with_hook(buffer, None)
    }

    fn seek(&mut self, position: u64) {
        self.position = position;
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Reads `buffer.len()` bytes starting `offset` bytes into `sector`,
/// normalizing offsets beyond the sector size.
fn read_at<DS: BlockStorage>(
    block_storage: &DS,
    sector: u64,
    offset: u64,
    buffer: &mut [u8],
) -> Result<()> {
    block_storage.read(
        sector.wrapping_add(offset / SECTOR_SIZE),
        (offset % SECTOR_SIZE) as u32,
        buffer,
    )
}

/// Reads past the end of the device during mount mean this is no volume of
/// ours; they are reported as a bad file system.
fn rewrite_out_of_range(error: Error) -> Error {
    match error {
        Error::Io(IoError::OutOfRange) => Error::Fs(FsError::BadFs(NOT_ESSENCE_FS)),
        error => error,
    }
}

/// Returns the offset and declared size of the first attribute of
/// `attribute_type` whose size is at least `min_size`, walking the entry's
/// attribute list. The walk stops at misaligned offsets and at sizes that
/// are below the header size or extend past the entry.
fn find_attribute(
    entry: &DirectoryEntry,
    attribute_type: u16,
    min_size: usize,
) -> Option<(usize, usize)> {
    let bytes = entry.as_bytes();
    let mut offset = entry.attribute_offset.get() as usize;
    while offset <= bytes.len() - size_of::<AttributeHeader>() {
        if offset & 7 != 0 {
            return None;
        }
        let (header, _) = AttributeHeader::read_from_prefix(&bytes[offset..]).ok()?;
        let size = header.size.get() as usize;
        if size < size_of::<AttributeHeader>() || offset + size > bytes.len() {
            return None;
        }
        if header.attribute_type.get() == attribute_type && size >= min_size {
            return Some((offset, size));
        }
        offset += size;
    }

    None
}

/// The unique identifier of a volume, installation, or node. Opaque 16
/// bytes, compared bytewise.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct UniqueId([u8; 16]);

/// Locates a directory entry on the volume.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DirEntryRef {
    /// The block containing the directory entry.
    block: U64,
    /// Offset into the block to find the directory entry.
    offset_into_block: U32,
    reserved: U32,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct Superblock {
    /// The file system signature; shall be "!EssenceFS2-----".
    signature: [u8; 16],
    /// The name of the volume, UTF-8, zero-padded.
    volume_name: [u8; 32],
    /// If this is greater than the driver's version, then the file system
    /// cannot be read.
    required_read_version: U16,
    /// If this is greater than the driver's version, then the file system
    /// cannot be written. Irrelevant to this read-only driver.
    required_write_version: U16,
    /// CRC-32 checksum of the superblock. Not verified.
    checksum: U32,
    /// Non-zero to indicate that the volume is mounted, or was not properly
    /// unmounted.
    mounted: u8,
    reserved1: [u8; 7],
    /// The size of a block on the volume, a multiple of the sector size.
    block_size: U64,
    /// The number of blocks on the volume.
    block_count: U64,
    /// The number of blocks that are in use.
    blocks_used: U64,
    /// The number of blocks in a group.
    blocks_per_group: U32,
    reserved2: [u8; 4],
    /// The number of groups on the volume.
    group_count: U64,
    /// The number of blocks used to store a group's block bitmap.
    blocks_per_group_block_bitmap: U64,
    /// The first block in the group descriptor table.
    gdt_first_block: U64,
    /// The number of directory entries in a block.
    directory_entries_per_block: U64,
    reserved3: [u8; 8],
    /// The unique identifier for the volume.
    identifier: UniqueId,
    /// The unique identifier of the installation this volume was made for.
    /// All zero for a non-installation volume.
    os_installation: UniqueId,
    /// The identifier to give to the next created file.
    next_identifier: UniqueId,
    /// The kernel, for convenient access by the bootloader.
    kernel: DirEntryRef,
    /// The root directory.
    root: DirEntryRef,
    reserved4: [u8; 8192 - 216],
}

#[repr(C)]
#[derive(Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DirectoryEntry {
    /// Shall be "DirEntry".
    signature: [u8; 8],
    /// Identifier of the node.
    identifier: UniqueId,
    /// CRC-32 checksum of the directory entry. Not verified.
    checksum: U32,
    /// Offset to the first attribute.
    attribute_offset: U16,
    /// 1 for a file, 2 for a directory.
    node_type: u8,
    /// The number of attributes in the list.
    attribute_count: u8,
    /// Microseconds since 1st January 1970.
    creation_time: U64,
    /// Microseconds since 1st January 1970.
    access_time: U64,
    /// Microseconds since 1st January 1970.
    modification_time: U64,
    /// The amount of data referenced by the data attribute, in bytes.
    file_size: U64,
    /// Identifier of the parent directory.
    parent: UniqueId,
    /// Identifier of the file content type.
    content_type: UniqueId,
    /// The attribute list: 8-byte aligned records, each led by an
    /// [`AttributeHeader`].
    attributes: [u8; 1024 - 96],
}

/// Leads every attribute in a directory entry's attribute list. The size is
/// the total in-place size of the attribute including this header; it shall
/// be 8-byte aligned and keep the attribute within its entry.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct AttributeHeader {
    attribute_type: U16,
    size: U16,
}

/// The fixed part of a FILENAME attribute; the UTF-8 filename follows.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct FilenameAttribute {
    attribute_type: U16,
    size: U16,
    /// The length of the filename in bytes; bytes beyond it are padding.
    length: U16,
    reserved: U16,
}

/// The fixed part of a DATA attribute; the inline data or extent list
/// follows at `data_offset`.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DataAttribute {
    attribute_type: U16,
    size: U16,
    /// The indirection used to access the data.
    indirection: u8,
    /// The offset into the attribute where the data or extent list can be
    /// found.
    data_offset: u8,
    /// The number of data bytes in the attribute, or extents in the list.
    count: U16,
    reserved: [u8; 24],
}

const _: () = assert!(size_of::<Superblock>() == 8192);
const _: () = assert!(size_of::<DirectoryEntry>() == 1024);
const _: () = assert!(size_of::<DataAttribute>() == 32);
