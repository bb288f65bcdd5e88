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

//! Controller initialization.
//!
//! The controller doesn't need to be reset. The driver allocates the memory it shares with the
//! controller, then asks the firmware about the adapter and its volumes.
//!
//! The number of commands that the adapter can process concurrently is only known after the
//! first management command has completed. Until then, the pool contains a single slot.

use super::{
    chipset::Chipset, deadlines::Deadlines, frame::SLOT_BUFFER_SIZE, pool::SlotPool,
    CommandError, Controller, ControllerConfig, Counters, Generation,
};
use crate::{
    dma::{AllocFailed, DmaRegion},
    info::{self, ControllerInfo},
    HwAccessRef, MAX_COMMANDS,
};

use core::alloc::Layout;
use futures::lock::Mutex;
use spinning_top::Spinlock;

/// Error that can happen during initialization.
#[derive(Debug, derive_more::Display)]
pub enum InitError {
    /// The status queue must contain at least two entries. Copperhead only.
    #[display(fmt = "status queue depth too small: {}", _0)]
    StatusQueueDepth(usize),
    /// Failed to allocate the memory containing the command frames.
    #[display(fmt = "failed to allocate command buffer: {}", _0)]
    CommandBufferAlloc(AllocFailed),
    /// Failed to allocate the memory where the adapter writes management information.
    #[display(fmt = "failed to allocate info buffer: {}", _0)]
    InfoBufferAlloc(AllocFailed),
    /// Failed to allocate the status queue. Copperhead only.
    #[display(fmt = "failed to allocate status queue: {}", _0)]
    StatusQueueAlloc(AllocFailed),
    #[display(fmt = "failed to get adapter info: {}", _0)]
    AdapterInfo(CommandError),
    #[display(fmt = "failed to get drive info: {}", _0)]
    DriveInfo(CommandError),
    #[display(fmt = "failed to get configuration: {}", _0)]
    Configuration(CommandError),
}

fn region_layout(size: usize) -> Result<Layout, AllocFailed> {
    Layout::from_size_align(size, 8).map_err(|_| AllocFailed { size })
}

/// Initializes a controller whose registers are memory-mapped at the given location.
///
/// On success, interrupts of the controller are enabled.
///
/// # Safety
///
/// `regs_loc` must be the physical location of the registers of a controller of the given
/// generation, and nothing else must access these registers.
pub async unsafe fn init_controller<TAcc>(
    access: TAcc,
    generation: Generation,
    regs_loc: u64,
    config: ControllerConfig,
) -> Result<Controller<TAcc>, InitError>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    if generation == Generation::Copperhead && config.status_queue_depth < 2 {
        return Err(InitError::StatusQueueDepth(config.status_queue_depth));
    }

    let command_buffer = {
        let layout = region_layout(MAX_COMMANDS * SLOT_BUFFER_SIZE)
            .map_err(InitError::CommandBufferAlloc)?;
        DmaRegion::new(access.clone(), layout)
            .await
            .map_err(InitError::CommandBufferAlloc)?
    };

    let scratch = {
        let layout = region_layout(info::SCRATCH_SIZE).map_err(InitError::InfoBufferAlloc)?;
        DmaRegion::new(access.clone(), layout)
            .await
            .map_err(InitError::InfoBufferAlloc)?
    };

    let chipset = Chipset::new(access.clone(), generation, regs_loc, &config)
        .await
        .map_err(InitError::StatusQueueAlloc)?;

    let mut controller = Controller {
        hardware_access: access,
        pool: SlotPool::new(command_buffer, 1).await,
        scratch: Mutex::new(scratch),
        info: Spinlock::new(ControllerInfo::default()),
        deadlines: Spinlock::new(Deadlines::new(MAX_COMMANDS)),
        draining: Mutex::new(()),
        counters: Counters::default(),
        chipset,
        config,
    };

    let adapter = controller
        .read_adapter_info()
        .await
        .map_err(InitError::AdapterInfo)?;
    let drives = controller
        .read_drive_info()
        .await
        .map_err(InitError::DriveInfo)?;
    let configuration = controller
        .read_configuration()
        .await
        .map_err(InitError::Configuration)?;
    // Older adapters don't necessarily have this page.
    let nvram_page5 = match controller.read_nvram_page5().await {
        Ok(page) => Some(page),
        Err(err) => {
            log::debug!("failed to read NVRAM page 5: {}", err);
            None
        }
    };

    if adapter.command_count == 0 {
        log::warn!("adapter reports 0 commands; using a single command slot");
    }
    let mut slots = info::command_slots(adapter.command_count);
    if let Some(max) = controller.chipset.max_outstanding() {
        if slots > max {
            log::warn!(
                "status queue only holds {} entries; using {} command slots instead of {}",
                max,
                max,
                slots
            );
            slots = max;
        }
    }
    controller.pool.reinitialize(slots);

    *controller.info.get_mut() = ControllerInfo {
        adapter,
        drives,
        configuration,
        nvram_page5,
    };

    controller.chipset.enable_interrupts().await;

    {
        let known = controller.info.lock();
        log::info!(
            "ServeRAID {}, FW {}, BIOS {}, {} cmds, {} LD(s)",
            info::model_or_unknown(&known),
            known.adapter.firmware_version(),
            known.adapter.bios_version(),
            controller.pool.capacity(),
            known.volume_count()
        );
    }

    Ok(controller)
}
