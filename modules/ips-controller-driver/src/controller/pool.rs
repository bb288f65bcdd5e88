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

//! Pool of command slots.
//!
//! Each slot owns a fixed part of a physically-contiguous region, where its command frame and
//! scatter-gather table are written. The identifier of a slot is also the identifier that the
//! controller reports in the status word once the command is complete.

use super::{frame::SLOT_BUFFER_SIZE, Job};
use crate::{dma::DmaRegion, HwAccessRef, MAX_COMMANDS};

use alloc::{collections::VecDeque, vec::Vec};
use core::convert::TryFrom as _;
use spinning_top::Spinlock;

bitflags::bitflags! {
    /// State of a command slot.
    pub struct SlotFlags: u8 {
        /// The command reads data from the controller.
        const READ = 0b0001;
        /// The command writes data to the controller.
        const WRITE = 0b0010;
        /// The issuer waits for the completion by polling.
        const POLL = 0b0100;
        /// The command has been submitted and hasn't been completed yet.
        const RUNNING = 0b1000;
    }
}

/// State of a single command slot.
#[derive(Default)]
pub(crate) struct Slot {
    pub flags: SlotFlags,
    /// True if the slot is in the free list, or about to be pushed to it.
    pub free: bool,
    /// Present only while the slot is running.
    pub job: Option<Job>,
    /// General and extended status of the last completion.
    pub status: Option<(u8, u8)>,
}

impl Default for SlotFlags {
    fn default() -> Self {
        SlotFlags::empty()
    }
}

pub(crate) struct SlotPool<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Contains the command frames of all the slots. Large enough for [`MAX_COMMANDS`] slots.
    buffer: DmaRegion<TAcc>,
    slots: Vec<Spinlock<Slot>>,
    /// Identifiers of the free slots, in the order in which they will be handed out.
    free: Spinlock<VecDeque<u8>>,
}

impl<TAcc> SlotPool<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Builds a pool of `capacity` slots whose frames are stored in `buffer`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 or above [`MAX_COMMANDS`], or if `buffer` is too small.
    pub async fn new(buffer: DmaRegion<TAcc>, capacity: usize) -> Self {
        assert!(buffer.len() >= MAX_COMMANDS * SLOT_BUFFER_SIZE);
        buffer.zero(0, buffer.len()).await;

        let mut pool = SlotPool {
            buffer,
            slots: Vec::new(),
            free: Spinlock::new(VecDeque::new()),
        };
        pool.reinitialize(capacity);
        pool
    }

    /// Replaces all the slots with `capacity` new free slots.
    ///
    /// Must only be called while no slot is in use.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 or above [`MAX_COMMANDS`].
    pub fn reinitialize(&mut self, capacity: usize) {
        assert!(capacity >= 1 && capacity <= MAX_COMMANDS);
        debug_assert!(self.slots.iter_mut().all(|s| s.get_mut().job.is_none()));

        self.slots = (0..capacity)
            .map(|_| {
                Spinlock::new(Slot {
                    free: true,
                    ..Default::default()
                })
            })
            .collect();
        *self.free.get_mut() = (0..capacity).map(|id| u8::try_from(id).unwrap()).collect();
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of slots currently in the free list.
    pub fn num_free(&self) -> usize {
        self.free.lock().len()
    }

    /// Takes the slot at the head of the free list. Returns `None` if all slots are in use.
    pub fn acquire(&self) -> Option<u8> {
        let id = self.free.lock().pop_front()?;
        let mut slot = self.slots[usize::from(id)].lock();
        debug_assert!(slot.free && slot.job.is_none());
        slot.free = false;
        slot.flags = SlotFlags::empty();
        slot.status = None;
        Some(id)
    }

    /// Puts back a slot at the tail of the free list, after erasing its frame.
    ///
    /// The job of the slot, if any, must have been taken out beforehand. Releasing a slot that
    /// is already free is ignored.
    pub async fn release(&self, id: u8) {
        {
            let mut slot = self.slots[usize::from(id)].lock();
            if slot.free {
                log::error!("slot {} released twice", id);
                return;
            }
            debug_assert!(slot.job.is_none());
            slot.free = true;
            slot.flags = SlotFlags::empty();
            slot.job = None;
        }

        self.buffer
            .zero(usize::from(id) * SLOT_BUFFER_SIZE, SLOT_BUFFER_SIZE)
            .await;
        self.free.lock().push_back(id);
    }

    /// Returns the state of a slot.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn slot(&self, id: u8) -> &Spinlock<Slot> {
        &self.slots[usize::from(id)]
    }

    /// Returns the physical address of the frame of a slot.
    pub fn frame_address(&self, id: u8) -> u32 {
        self.buffer.address_of(usize::from(id) * SLOT_BUFFER_SIZE)
    }

    /// Writes the frame of a slot, followed with its scatter-gather table.
    pub async fn write_frame(&self, id: u8, data: &[u8]) {
        assert!(data.len() <= SLOT_BUFFER_SIZE);
        self.buffer
            .write(usize::from(id) * SLOT_BUFFER_SIZE, data)
            .await;
    }

    /// Reads back the frame of a slot and its scatter-gather table.
    #[cfg(test)]
    pub async fn read_slot_buffer(&self, id: u8) -> [u8; SLOT_BUFFER_SIZE] {
        let mut out = [0; SLOT_BUFFER_SIZE];
        self.buffer
            .read(usize::from(id) * SLOT_BUFFER_SIZE, &mut out)
            .await;
        out
    }
}
