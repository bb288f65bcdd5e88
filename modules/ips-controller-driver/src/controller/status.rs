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

//! Status words reported by the controller when a command is complete.

use core::fmt;

/// Value read from the status queue when it is empty.
pub const NO_STATUS: u32 = 0xffff_ffff;

/// Status word of a completed command.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct StatusWord(u32);

/// How a command ended, according to its general status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The controller had to retry or correct something, but the command succeeded.
    Recovered,
    Failed,
}

impl StatusWord {
    /// Interprets a raw value. Returns `None` if it indicates an empty queue.
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw == NO_STATUS {
            None
        } else {
            Some(StatusWord(raw))
        }
    }

    /// Builds a status word from its components.
    pub fn new(slot_id: u8, basic_status: u8, extended_status: u8) -> Self {
        StatusWord(
            u32::from(slot_id) << 8
                | u32::from(basic_status) << 16
                | u32::from(extended_status) << 24,
        )
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Identifier of the command slot this status refers to.
    pub fn slot_id(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn basic_status(&self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    /// Low 4 bits of the basic status.
    pub fn general_status(&self) -> u8 {
        ((self.0 >> 16) & 0xf) as u8
    }

    pub fn extended_status(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn outcome(&self) -> Outcome {
        match self.general_status() {
            0 => Outcome::Success,
            1 => Outcome::Recovered,
            _ => Outcome::Failed,
        }
    }
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StatusWord")
            .field("slot_id", &self.slot_id())
            .field("basic", &format_args!("{:#x}", self.basic_status()))
            .field("extended", &format_args!("{:#x}", self.extended_status()))
            .finish()
    }
}
