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

//! Copperhead generation.
//!
//! Frames are submitted through a command channel, made of an address register (CCSA) and a
//! control register (CCC). The channel can only accept a new frame when the semaphore bit of
//! CCC is clear.
//!
//! Status words are written by the controller in a ring located in host memory. The
//! controller advances the head register (SQH) after each write, and the host acknowledges the
//! words it has consumed by writing the tail register (SQT).

use super::{
    super::{registers::*, status::StatusWord, ControllerConfig},
    SubmitError,
};
use crate::{
    dma::{AllocFailed, DmaRegion},
    retry::BoundedRetry,
    HwAccessRef,
};

use core::{alloc::Layout, time::Duration};
use futures::lock::Mutex;

pub(crate) struct Copperhead<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access: TAcc,
    regs_loc: u64,
    /// Ring of status words.
    status_queue: DmaRegion<TAcc>,
    /// Number of words in the ring.
    depth: usize,
    cursor: Mutex<Cursor>,
    semaphore_attempts: u32,
    semaphore_interval: Duration,
}

/// Position of the host in the ring.
#[derive(Debug)]
struct Cursor {
    /// Physical address of the last word consumed, as last written to SQT.
    tail: u32,
    /// Index of the last word consumed.
    index: usize,
}

impl<TAcc> Copperhead<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Allocates the status queue and points the controller to it.
    ///
    /// # Safety
    ///
    /// `regs_loc` must be the location of the registers of a Copperhead controller.
    ///
    /// # Panics
    ///
    /// Panics if `config.status_queue_depth` is below 2.
    pub async unsafe fn new(
        hardware_access: TAcc,
        regs_loc: u64,
        config: &ControllerConfig,
    ) -> Result<Self, AllocFailed> {
        let depth = config.status_queue_depth;
        assert!(depth >= 2);
        let size = depth * 4;

        let layout = Layout::from_size_align(size, 8).map_err(|_| AllocFailed { size })?;
        let status_queue = DmaRegion::new(hardware_access.clone(), layout).await?;
        status_queue.zero(0, size).await;

        let start = status_queue.pointer().get();
        let end = status_queue.address_of(size);

        let copperhead = Copperhead {
            hardware_access,
            regs_loc,
            status_queue,
            depth,
            cursor: Mutex::new(Cursor {
                tail: start,
                index: 0,
            }),
            semaphore_attempts: config.semaphore_attempts,
            semaphore_interval: config.semaphore_interval,
        };

        copperhead.write_register(COPPERHEAD_SQS_OFFSET, start).await;
        copperhead.write_register(COPPERHEAD_SQE_OFFSET, end).await;
        copperhead.write_register(COPPERHEAD_SQH_OFFSET, start + 4).await;
        copperhead.write_register(COPPERHEAD_SQT_OFFSET, start).await;

        log::debug!(
            "status queue of {} entries at {:#x}-{:#x}",
            depth,
            start,
            end
        );

        Ok(copperhead)
    }

    /// The ring is empty when the head immediately follows the tail, so one entry always stays
    /// unused.
    pub fn max_outstanding(&self) -> usize {
        self.depth - 1
    }

    async fn read_register(&self, offset: u64) -> u32 {
        let mut out = [0];
        unsafe {
            self.hardware_access
                .read_memory_u32_le(self.regs_loc + offset, &mut out)
                .await;
        }
        out[0]
    }

    async fn write_register(&self, offset: u64, value: u32) {
        unsafe {
            self.hardware_access
                .write_memory_u32_le(self.regs_loc + offset, &[value])
                .await;
        }
    }

    pub async fn submit(&self, frame_address: u32) -> Result<(), SubmitError> {
        let mut retry = BoundedRetry::new(self.semaphore_attempts, self.semaphore_interval);
        loop {
            if !retry.next_attempt(&self.hardware_access).await {
                log::error!("semaphore timeout while submitting {:#x}", frame_address);
                return Err(SubmitError::SemaphoreTimeout);
            }

            if self.read_register(COPPERHEAD_CCC_OFFSET).await & COPPERHEAD_CCC_SEM == 0 {
                break;
            }
        }

        self.write_register(COPPERHEAD_CCSA_OFFSET, frame_address)
            .await;
        unsafe {
            self.hardware_access
                .write_memory_u8(
                    self.regs_loc + COPPERHEAD_CCC_OFFSET,
                    &COPPERHEAD_CCC_START.to_le_bytes(),
                )
                .await;
        }

        Ok(())
    }

    pub async fn enable_interrupts(&self) {
        unsafe {
            self.hardware_access
                .write_memory_u8(self.regs_loc + COPPERHEAD_HIS_OFFSET, &[COPPERHEAD_HIS_EN])
                .await;
        }
    }

    pub async fn disable_interrupts(&self) {
        unsafe {
            self.hardware_access
                .write_memory_u8(self.regs_loc + COPPERHEAD_HIS_OFFSET, &[0])
                .await;
        }
    }

    /// Reads and acknowledges the interrupt status.
    pub async fn has_pending_interrupt(&self) -> bool {
        let mut his = [0];
        unsafe {
            self.hardware_access
                .read_memory_u8(self.regs_loc + COPPERHEAD_HIS_OFFSET, &mut his)
                .await;
            self.hardware_access
                .write_memory_u8(self.regs_loc + COPPERHEAD_HIS_OFFSET, &his)
                .await;
        }

        // 0xff is what reading a removed device returns.
        his[0] != 0xff && (his[0] & COPPERHEAD_HIS_SCE) != 0
    }

    pub async fn dequeue_status(&self) -> Option<StatusWord> {
        let mut cursor = self.cursor.lock().await;

        let start = self.status_queue.pointer().get();
        let end = self.status_queue.address_of(self.depth * 4);

        let mut tail = cursor.tail + 4;
        if tail == end {
            tail = start;
        }

        if tail == self.read_register(COPPERHEAD_SQH_OFFSET).await {
            return None;
        }

        cursor.tail = tail;
        cursor.index = (cursor.index + 1) % self.depth;
        debug_assert_eq!((cursor.tail - start) as usize, cursor.index * 4);

        let raw = self.status_queue.read_u32(cursor.index * 4).await;
        self.write_register(COPPERHEAD_SQT_OFFSET, tail).await;
        StatusWord::from_raw(raw)
    }
}
