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

//! Register offsets and bits of both generations of controllers.

/// Size in bytes of the window of registers.
pub const REGISTERS_WINDOW_SIZE: u64 = 128;

// Copperhead.

/// Host interrupt status. 8 bits.
pub const COPPERHEAD_HIS_OFFSET: u64 = 0x08;
/// Command channel system address.
pub const COPPERHEAD_CCSA_OFFSET: u64 = 0x10;
/// Command channel control. Read as 32 bits, written as 16 bits.
pub const COPPERHEAD_CCC_OFFSET: u64 = 0x14;
/// Status queue head, written by the controller.
pub const COPPERHEAD_SQH_OFFSET: u64 = 0x20;
/// Status queue tail, written by the host.
pub const COPPERHEAD_SQT_OFFSET: u64 = 0x24;
/// Status queue end.
pub const COPPERHEAD_SQE_OFFSET: u64 = 0x28;
/// Status queue start.
pub const COPPERHEAD_SQS_OFFSET: u64 = 0x2c;

/// Status completion event: at least one status is in the status queue.
pub const COPPERHEAD_HIS_SCE: u8 = 0x01;
/// Interrupts enabled.
pub const COPPERHEAD_HIS_EN: u8 = 0x80;

/// Set while the command channel is busy.
pub const COPPERHEAD_CCC_SEM: u32 = 0x0008;
/// Value to write to start the command whose address is in CCSA.
pub const COPPERHEAD_CCC_START: u16 = 0x101a;

// Morpheus.

/// Outbound interrupt status.
pub const MORPHEUS_OIS_OFFSET: u64 = 0x30;
/// Outbound interrupt mask.
pub const MORPHEUS_OIM_OFFSET: u64 = 0x34;
/// Inbound queue port. Written with the address of a command frame.
pub const MORPHEUS_IQP_OFFSET: u64 = 0x40;
/// Outbound queue port. Reading pops a status word.
pub const MORPHEUS_OQP_OFFSET: u64 = 0x44;

/// At least one status word is available in the outbound queue.
pub const MORPHEUS_OIS_PEND: u32 = 0x8;
/// Outbound interrupts disabled.
pub const MORPHEUS_OIM_DS: u32 = 0x8;
