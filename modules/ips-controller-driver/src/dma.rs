// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Physical memory handling.
//!
//! Two kinds of memory are shared with the controller:
//!
//! - Regions allocated by the driver itself, such as the buffer containing the command frames.
//! They are represented by [`DmaRegion`] and freed when dropped.
//! - Buffers provided by the user of the driver and that contain the data to read or write.
//! They are lent to the controller for the duration of a command, through a
//! [`TransferMapping`].

use crate::{HwAccessRef, MAX_TRANSFER_SIZE};

use alloc::vec;
use arrayvec::ArrayVec;
use core::{alloc::Layout, convert::TryFrom as _, fmt, num::NonZeroU32};
use smallvec::SmallVec;

/// Maximum number of physical segments that a single command can refer to.
pub const MAX_SEGMENTS: usize = 16;

/// Direction of a transfer of data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaDirection {
    /// The controller reads the buffer.
    ToDevice,
    /// The controller writes the buffer.
    FromDevice,
}

/// Contiguous range of physical memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaSegment {
    pub address: u32,
    pub length: u32,
}

/// Mapping of a buffer, as returned by [`HwAccessRef::map_transfer`].
#[derive(Debug)]
pub struct PlatformMapping {
    /// Opaque identifier that the platform uses to refer to this mapping afterwards.
    pub id: u64,
    /// Physical segments, in the order in which they cover the buffer.
    pub segments: SmallVec<[DmaSegment; MAX_SEGMENTS]>,
}

/// Error while allocating a [`DmaRegion`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "failed to allocate {} bytes of physical memory", size)]
pub struct AllocFailed {
    pub size: usize,
}

/// Error while mapping a buffer.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum MapError {
    /// The buffer is made of more physical segments than a command can refer to.
    #[display(fmt = "buffer spans {} physical segments", _0)]
    TooManySegments(usize),
    /// The platform refused to map the buffer.
    #[display(fmt = "platform failed to map the buffer")]
    MapFailed,
    /// The buffer is larger than what a command can transfer.
    #[display(fmt = "buffer of {} bytes is too large", _0)]
    TooLarge(usize),
}

/// Physically-contiguous region of memory below 4 GiB, owned by the driver.
///
/// The region is freed when this object is dropped.
pub struct DmaRegion<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access: TAcc,
    pointer: NonZeroU32,
    layout: Layout,
}

impl<TAcc> DmaRegion<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Allocates a new region. Its content is unspecified.
    pub async fn new(hardware_access: TAcc, layout: Layout) -> Result<Self, AllocFailed> {
        let pointer = hardware_access
            .alloc32(layout)
            .await
            .map_err(|()| AllocFailed {
                size: layout.size(),
            })?;

        Ok(DmaRegion {
            hardware_access,
            pointer,
            layout,
        })
    }

    /// Returns the physical address of the start of the region.
    pub fn pointer(&self) -> NonZeroU32 {
        self.pointer
    }

    /// Returns the physical address of the given offset within the region.
    ///
    /// # Panics
    ///
    /// Panics if the offset is out of range.
    pub fn address_of(&self, offset: usize) -> u32 {
        assert!(offset <= self.layout.size());
        // The region is below 4 GiB, and so is every offset within it.
        self.pointer.get() + u32::try_from(offset).unwrap()
    }

    /// Returns the size in bytes of the region.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Writes `data` at the given offset.
    ///
    /// # Panics
    ///
    /// Panics if the write is out of range.
    pub async fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.layout.size());
        unsafe {
            self.hardware_access
                .write_memory_u8(u64::from(self.address_of(offset)), data)
                .await;
        }
    }

    /// Fills `dest` with the content of the region at the given offset.
    ///
    /// # Panics
    ///
    /// Panics if the read is out of range.
    pub async fn read(&self, offset: usize, dest: &mut [u8]) {
        assert!(offset + dest.len() <= self.layout.size());
        unsafe {
            self.hardware_access
                .read_memory_u8(u64::from(self.address_of(offset)), dest)
                .await;
        }
    }

    /// Reads a little-endian 32-bit word at the given offset.
    pub async fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.layout.size());
        let mut out = [0];
        unsafe {
            self.hardware_access
                .read_memory_u32_le(u64::from(self.address_of(offset)), &mut out)
                .await;
        }
        out[0]
    }

    /// Writes a little-endian 32-bit word at the given offset.
    pub async fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.layout.size());
        unsafe {
            self.hardware_access
                .write_memory_u32_le(u64::from(self.address_of(offset)), &[value])
                .await;
        }
    }

    /// Fills `len` bytes starting at `offset` with zeroes.
    pub async fn zero(&self, offset: usize, len: usize) {
        self.write(offset, &vec![0; len]).await;
    }
}

impl<TAcc> fmt::Debug for DmaRegion<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("pointer", &self.pointer)
            .field("len", &self.layout.size())
            .finish()
    }
}

impl<TAcc> Drop for DmaRegion<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    fn drop(&mut self) {
        unsafe {
            self.hardware_access
                .dealloc(u64::from(self.pointer.get()), self.layout);
        }
    }
}

/// Buffer of the user currently lent to the controller.
///
/// Must be passed back to [`unmap_transfer`] once the controller is done with it. This object
/// can't be cloned, which guarantees that a buffer is unmapped only once.
#[derive(Debug)]
pub struct TransferMapping {
    id: u64,
    segments: ArrayVec<[DmaSegment; MAX_SEGMENTS]>,
    direction: DmaDirection,
    len: usize,
}

impl TransferMapping {
    /// Returns the physical segments of the buffer.
    pub fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    /// Returns the number of bytes of the buffer.
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Lends a buffer to the controller.
///
/// On success, the content of the buffer has been made visible to the device.
///
/// # Safety
///
/// `buffer` must point to `len` bytes that stay valid and don't move until the returned mapping
/// is passed to [`unmap_transfer`].
pub unsafe fn map_transfer<TAcc>(
    hardware_access: &TAcc,
    buffer: *mut u8,
    len: usize,
    direction: DmaDirection,
) -> Result<TransferMapping, MapError>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    if len > MAX_TRANSFER_SIZE {
        return Err(MapError::TooLarge(len));
    }

    let mapping = hardware_access
        .map_transfer(buffer, len, direction)
        .map_err(|()| MapError::MapFailed)?;

    if mapping.segments.is_empty() {
        hardware_access.unmap_transfer(mapping.id);
        return Err(MapError::MapFailed);
    }

    if mapping.segments.len() > MAX_SEGMENTS {
        log::debug!(
            "buffer of {} bytes spans {} segments",
            len,
            mapping.segments.len()
        );
        hardware_access.unmap_transfer(mapping.id);
        return Err(MapError::TooManySegments(mapping.segments.len()));
    }

    hardware_access.sync_for_device(mapping.id);

    Ok(TransferMapping {
        id: mapping.id,
        segments: mapping.segments.into_iter().collect(),
        direction,
        len,
    })
}

/// Takes back a buffer from the controller.
///
/// On return, the writes performed by the device are visible in the buffer.
pub fn unmap_transfer<TAcc>(hardware_access: &TAcc, mapping: TransferMapping)
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    // Safety: a `TransferMapping` is only ever created by `map_transfer` and is consumed here.
    unsafe {
        hardware_access.sync_for_cpu(mapping.id);
        hardware_access.unmap_transfer(mapping.id);
    }
}
