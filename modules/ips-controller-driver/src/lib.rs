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

//! Driver for the IBM/Adaptec ServeRAID family of RAID controllers.
//!
//! The controller exposes its logical drives ("volumes") to the host. Commands are written by
//! the host in physical memory, in the form of fixed-size *command frames*, and the physical
//! address of a frame is then handed to the controller. Once the controller is done, it reports
//! a 32-bit status word containing the identifier of the command.
//!
//! Two generations of the hardware exist, and they disagree about how frames are submitted and
//! how status words are retrieved:
//!
//! - The *Copperhead* generation uses a command channel protected by a semaphore bit, and a ring
//! of status words located in host memory.
//! - The *Morpheus* generation uses a pair of memory-mapped queue ports, one inbound and one
//! outbound.
//!
//! See the [`controller`] module for the state machine of a controller.

#![no_std]

extern crate alloc;

use core::{alloc::Layout, future::Future, num::NonZeroU32, time::Duration};

pub mod controller;
pub mod dma;
pub mod info;

mod retry;

#[cfg(test)]
mod mock;

pub use controller::{
    init_controller, CommandError, CompletedTransfer, Controller, ControllerConfig,
    ControllerStats, Generation, InitError, PendingTransfer, Rejected, TransferDirection,
    TransferRequest,
};
pub use dma::{DmaDirection, DmaSegment, MapError, PlatformMapping};

/// Size in bytes of a sector of a logical drive.
pub const SECTOR_SIZE: usize = 512;

/// Maximum number of bytes that a single command can transfer.
pub const MAX_TRANSFER_SIZE: usize = 64 * 1024;

/// Maximum number of commands that a controller can ever have in flight.
pub const MAX_COMMANDS: usize = 128;

/// Maximum number of logical drives of a controller.
pub const MAX_DRIVES: usize = 8;

/// Abstraction over the hardware.
///
/// The code of this library doesn't assume that it can directly access physical memory. Instead,
/// any access to physical memory, including the memory-mapped registers of the controller, is
/// done through this trait.
///
/// # Safety
///
/// Implementations must perform the memory accesses that are requested, in the order in which
/// the returned futures are polled to completion.
pub unsafe trait HwAccessRef<'a>: Copy + Clone {
    type Delay: Future<Output = ()> + 'a;
    type ReadMemFutureU8: Future<Output = ()> + 'a;
    type ReadMemFutureU32: Future<Output = ()> + 'a;
    type WriteMemFutureU8: Future<Output = ()> + 'a;
    type WriteMemFutureU32: Future<Output = ()> + 'a;
    type Alloc32: Future<Output = Result<NonZeroU32, ()>> + 'a;

    unsafe fn read_memory_u8(self, address: u64, dest: &'a mut [u8]) -> Self::ReadMemFutureU8;
    unsafe fn read_memory_u32_le(self, address: u64, dest: &'a mut [u32])
        -> Self::ReadMemFutureU32;
    unsafe fn write_memory_u8(self, address: u64, data: &'a [u8]) -> Self::WriteMemFutureU8;
    unsafe fn write_memory_u32_le(self, address: u64, data: &'a [u32]) -> Self::WriteMemFutureU32;

    /// Allocates a buffer in physical memory, below the 4 GiB boundary. Does not need to be
    /// cleared with 0s.
    ///
    /// > **Note**: The value returned is not a pointer, as the buffer is not necessarily
    /// >           directly accessible. All accesses to the buffer must be performed through the
    /// >           other methods of this trait.
    fn alloc32(self, layout: Layout) -> Self::Alloc32;

    /// Deallocates a previously-allocated block of physical memory.
    ///
    /// # Safety
    ///
    /// `address` must be a value previously-returned by a call to `alloc32`, and `layout` must
    /// match the layout that was passed to `alloc32`.
    unsafe fn dealloc(self, address: u64, layout: Layout);

    /// Pins a buffer of host memory and returns the list of physical segments that the
    /// controller must use to access it.
    ///
    /// The returned list can contain more segments than the controller supports. It is the
    /// responsibility of the caller to check this.
    ///
    /// # Safety
    ///
    /// `buffer` must point to `len` bytes that stay valid and don't move until the mapping is
    /// passed to `unmap_transfer`.
    unsafe fn map_transfer(
        self,
        buffer: *mut u8,
        len: usize,
        direction: dma::DmaDirection,
    ) -> Result<dma::PlatformMapping, ()>;

    /// Makes the content of a mapped buffer visible to the device. Called before the
    /// controller is given the buffer.
    ///
    /// # Safety
    ///
    /// `mapping` must be the identifier of a mapping that hasn't been unmapped yet.
    unsafe fn sync_for_device(self, mapping: u64);

    /// Makes the writes performed by the device visible to the host. Called after the
    /// controller is done with the buffer.
    ///
    /// # Safety
    ///
    /// `mapping` must be the identifier of a mapping that hasn't been unmapped yet.
    unsafe fn sync_for_cpu(self, mapping: u64);

    /// Releases a mapping previously returned by `map_transfer`.
    ///
    /// # Safety
    ///
    /// `mapping` must be the identifier of a mapping that hasn't been unmapped yet.
    unsafe fn unmap_transfer(self, mapping: u64);

    /// Returns a future that is ready after the given duration has passed.
    fn delay(self, duration: Duration) -> Self::Delay;

    /// Returns the time elapsed since an arbitrary point in the past. Must never go backwards.
    fn monotonic_clock(self) -> Duration;
}
