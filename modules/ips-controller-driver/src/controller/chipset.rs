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

//! Generations of the hardware.
//!
//! Both generations understand the same command frames and report the same status words, but
//! they disagree on how frames are handed to the controller and how status words are retrieved.

use super::{registers, status::StatusWord, ControllerConfig};
use crate::{dma::AllocFailed, HwAccessRef};

mod copperhead;
mod morpheus;

pub const PCI_VENDOR_IBM: u16 = 0x1014;
pub const PCI_VENDOR_ADAPTEC2: u16 = 0x9005;
pub const PCI_DEVICE_IBM_SERVERAID: u16 = 0x002e;
pub const PCI_DEVICE_IBM_SERVERAID2: u16 = 0x01bd;
pub const PCI_DEVICE_ADAPTEC2_SERVERAID: u16 = 0x0250;

/// Generation of a controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Generation {
    /// Command channel protected by a semaphore, and status queue in host memory.
    Copperhead,
    /// Inbound and outbound queue ports.
    Morpheus,
}

impl Generation {
    /// Determines the generation of a controller from its PCI identifiers. Returns `None` if
    /// the device isn't a supported controller.
    pub fn from_pci_ids(vendor_id: u16, device_id: u16) -> Option<Self> {
        match (vendor_id, device_id) {
            (PCI_VENDOR_IBM, PCI_DEVICE_IBM_SERVERAID) => Some(Generation::Copperhead),
            (PCI_VENDOR_IBM, PCI_DEVICE_IBM_SERVERAID2)
            | (PCI_VENDOR_ADAPTEC2, PCI_DEVICE_ADAPTEC2_SERVERAID) => Some(Generation::Morpheus),
            _ => None,
        }
    }

    /// Offset, in the PCI configuration space, of the BAR that points to the registers.
    pub fn registers_bar(&self) -> u8 {
        match self {
            Generation::Copperhead => 0x14,
            Generation::Morpheus => 0x10,
        }
    }

    /// Size in bytes of the window of registers to map.
    pub fn registers_window_size(&self) -> u64 {
        registers::REGISTERS_WINDOW_SIZE
    }
}

/// Error when submitting a command.
#[derive(Debug, derive_more::Display)]
pub(crate) enum SubmitError {
    /// The command channel stayed busy for too long.
    #[display(fmt = "command channel busy")]
    SemaphoreTimeout,
}

/// Access to a controller, for the protocol of its generation.
pub(crate) enum Chipset<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    Copperhead(copperhead::Copperhead<TAcc>),
    Morpheus(morpheus::Morpheus<TAcc>),
}

impl<TAcc> Chipset<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Prepares the communication with a controller whose registers are at `regs_loc`.
    ///
    /// Interrupts are left disabled.
    ///
    /// # Safety
    ///
    /// `regs_loc` must be the physical location of the registers of a controller of the given
    /// generation.
    pub async unsafe fn new(
        hardware_access: TAcc,
        generation: Generation,
        regs_loc: u64,
        config: &ControllerConfig,
    ) -> Result<Self, AllocFailed> {
        Ok(match generation {
            Generation::Copperhead => Chipset::Copperhead(
                copperhead::Copperhead::new(hardware_access, regs_loc, config).await?,
            ),
            Generation::Morpheus => {
                Chipset::Morpheus(morpheus::Morpheus::new(hardware_access, regs_loc))
            }
        })
    }

    pub fn generation(&self) -> Generation {
        match self {
            Chipset::Copperhead(_) => Generation::Copperhead,
            Chipset::Morpheus(_) => Generation::Morpheus,
        }
    }

    /// Maximum number of commands that can be in flight at the same time, if the controller
    /// imposes a limit.
    pub fn max_outstanding(&self) -> Option<usize> {
        match self {
            Chipset::Copperhead(c) => Some(c.max_outstanding()),
            Chipset::Morpheus(_) => None,
        }
    }

    /// Hands the frame at the given physical address to the controller.
    pub async fn submit(&self, frame_address: u32) -> Result<(), SubmitError> {
        match self {
            Chipset::Copperhead(c) => c.submit(frame_address).await,
            Chipset::Morpheus(c) => {
                c.submit(frame_address).await;
                Ok(())
            }
        }
    }

    pub async fn enable_interrupts(&self) {
        match self {
            Chipset::Copperhead(c) => c.enable_interrupts().await,
            Chipset::Morpheus(c) => c.enable_interrupts().await,
        }
    }

    pub async fn disable_interrupts(&self) {
        match self {
            Chipset::Copperhead(c) => c.disable_interrupts().await,
            Chipset::Morpheus(c) => c.disable_interrupts().await,
        }
    }

    /// Returns true if the controller is the source of the interrupt being processed.
    pub async fn has_pending_interrupt(&self) -> bool {
        match self {
            Chipset::Copperhead(c) => c.has_pending_interrupt().await,
            Chipset::Morpheus(c) => c.has_pending_interrupt().await,
        }
    }

    /// Pops the next status word. Returns `None` if there's none.
    pub async fn dequeue_status(&self) -> Option<StatusWord> {
        match self {
            Chipset::Copperhead(c) => c.dequeue_status().await,
            Chipset::Morpheus(c) => c.dequeue_status().await,
        }
    }

    /// Tries to bring the controller back to a sane state after a command has timed out.
    ///
    /// Neither generation currently does anything besides logging.
    pub async fn reset(&self) {
        log::debug!("{:?}: reset not supported", self.generation());
    }
}
