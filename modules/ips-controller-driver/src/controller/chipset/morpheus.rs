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

//! Morpheus generation.
//!
//! Writing the address of a frame to the inbound queue port submits it. Reading the outbound
//! queue port pops a status word, or returns `0xffffffff` if there is none.

use super::super::{registers::*, status::StatusWord};
use crate::HwAccessRef;

pub(crate) struct Morpheus<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access: TAcc,
    regs_loc: u64,
}

impl<TAcc> Morpheus<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// # Safety
    ///
    /// `regs_loc` must be the location of the registers of a Morpheus controller.
    pub unsafe fn new(hardware_access: TAcc, regs_loc: u64) -> Self {
        Morpheus {
            hardware_access,
            regs_loc,
        }
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

    pub async fn submit(&self, frame_address: u32) {
        self.write_register(MORPHEUS_IQP_OFFSET, frame_address)
            .await;
    }

    pub async fn enable_interrupts(&self) {
        let mask = self.read_register(MORPHEUS_OIM_OFFSET).await;
        self.write_register(MORPHEUS_OIM_OFFSET, mask & !MORPHEUS_OIM_DS)
            .await;
    }

    pub async fn disable_interrupts(&self) {
        let mask = self.read_register(MORPHEUS_OIM_OFFSET).await;
        self.write_register(MORPHEUS_OIM_OFFSET, mask | MORPHEUS_OIM_DS)
            .await;
    }

    /// Doesn't need any acknowledgement: the interrupt stays asserted as long as the outbound
    /// queue isn't empty.
    pub async fn has_pending_interrupt(&self) -> bool {
        self.read_register(MORPHEUS_OIS_OFFSET).await & MORPHEUS_OIS_PEND != 0
    }

    pub async fn dequeue_status(&self) -> Option<StatusWord> {
        StatusWord::from_raw(self.read_register(MORPHEUS_OQP_OFFSET).await)
    }
}
