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

//! Command frames.
//!
//! A command is described to the controller by a 24-bytes frame, optionally followed with a
//! table of up to 16 scatter-gather entries when the data buffer isn't physically contiguous.

use crate::dma::{DmaSegment, MAX_SEGMENTS};

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::convert::TryFrom as _;

/// Size in bytes of a command frame.
pub const COMMAND_FRAME_SIZE: usize = 24;
/// Size in bytes of a scatter-gather entry.
pub const SG_ENTRY_SIZE: usize = 8;
/// Size in bytes reserved for each command: a frame followed with a full scatter-gather table.
pub const SLOT_BUFFER_SIZE: usize = COMMAND_FRAME_SIZE + MAX_SEGMENTS * SG_ENTRY_SIZE;

pub const OPCODE_READ: u8 = 0x02;
pub const OPCODE_WRITE: u8 = 0x03;
pub const OPCODE_GET_ADAPTER_INFO: u8 = 0x05;
pub const OPCODE_FLUSH: u8 = 0x0a;
pub const OPCODE_GET_DRIVE_INFO: u8 = 0x19;
pub const OPCODE_READ_CONFIG: u8 = 0x38;
pub const OPCODE_RW_NVRAM_PAGE: u8 = 0xbc;
/// Added to the opcode of a read or write when the data is described by a scatter-gather table.
pub const OPCODE_SG_FLAG: u8 = 0x80;

/// Command frame, in the format the controller reads it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: u8,
    /// Identifier of the slot. Reported back by the controller in the status word.
    pub slot_id: u8,
    /// Logical drive, or page number for NVRAM accesses.
    pub target: u8,
    /// Number of scatter-gather entries. 0 if `sg_address` directly points to the data.
    pub sg_count: u8,
    pub block_number: u32,
    /// Address of the data, or of the scatter-gather table.
    pub sg_address: u32,
    pub block_count: u16,
    pub seg4g: u8,
    pub esg: u8,
    pub system_address: u32,
    pub control: u32,
}

impl CommandFrame {
    /// Encodes the frame.
    pub fn encode(&self) -> [u8; COMMAND_FRAME_SIZE] {
        let mut out = [0; COMMAND_FRAME_SIZE];
        out[0] = self.opcode;
        out[1] = self.slot_id;
        out[2] = self.target;
        out[3] = self.sg_count;
        out[4..8].copy_from_slice(&self.block_number.to_le_bytes());
        out[8..12].copy_from_slice(&self.sg_address.to_le_bytes());
        out[12..14].copy_from_slice(&self.block_count.to_le_bytes());
        out[14] = self.seg4g;
        out[15] = self.esg;
        out[16..20].copy_from_slice(&self.system_address.to_le_bytes());
        out[20..24].copy_from_slice(&self.control.to_le_bytes());
        out
    }

    /// Decodes a frame.
    pub fn decode(bytes: &[u8; COMMAND_FRAME_SIZE]) -> Self {
        let le32 =
            |n: usize| u32::from_le_bytes([bytes[n], bytes[n + 1], bytes[n + 2], bytes[n + 3]]);
        CommandFrame {
            opcode: bytes[0],
            slot_id: bytes[1],
            target: bytes[2],
            sg_count: bytes[3],
            block_number: le32(4),
            sg_address: le32(8),
            block_count: u16::from_le_bytes([bytes[12], bytes[13]]),
            seg4g: bytes[14],
            esg: bytes[15],
            system_address: le32(16),
            control: le32(20),
        }
    }

    /// Points the frame to the given data segments.
    ///
    /// A single segment is referred to directly. Multiple segments are described by the
    /// returned table, that must be written right after the frame, whose physical address is
    /// `frame_address`.
    ///
    /// # Panics
    ///
    /// Panics if there are more than [`MAX_SEGMENTS`] segments.
    pub fn attach_segments(
        &mut self,
        frame_address: u32,
        segments: &[DmaSegment],
    ) -> ArrayVec<[ScatterGatherEntry; MAX_SEGMENTS]> {
        assert!(segments.len() <= MAX_SEGMENTS);

        let mut table = ArrayVec::new();
        match segments {
            [] => {}
            [single] => {
                self.sg_count = 0;
                self.sg_address = single.address;
            }
            segments => {
                self.sg_count = u8::try_from(segments.len()).unwrap();
                self.sg_address = frame_address + u32::try_from(COMMAND_FRAME_SIZE).unwrap();
                self.opcode |= OPCODE_SG_FLAG;
                table.extend(segments.iter().map(|s| ScatterGatherEntry {
                    address: s.address,
                    length: s.length,
                }));
            }
        }
        table
    }
}

/// Entry of a scatter-gather table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScatterGatherEntry {
    pub address: u32,
    pub length: u32,
}

impl ScatterGatherEntry {
    pub fn encode(&self) -> [u8; SG_ENTRY_SIZE] {
        let mut out = [0; SG_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.address.to_le_bytes());
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; SG_ENTRY_SIZE]) -> Self {
        ScatterGatherEntry {
            address: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Encodes a frame followed with its scatter-gather table.
pub fn encode_with_table(frame: &CommandFrame, table: &[ScatterGatherEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMMAND_FRAME_SIZE + table.len() * SG_ENTRY_SIZE);
    out.extend_from_slice(&frame.encode());
    for entry in table {
        out.extend_from_slice(&entry.encode());
    }
    out
}
