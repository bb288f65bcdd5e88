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

use alloc::{collections::BTreeSet, vec, vec::Vec};
use core::time::Duration;
use smallvec::SmallVec;

/// Deadlines of the commands in flight, ordered by expiration time.
#[derive(Debug)]
pub(crate) struct Deadlines {
    /// Deadline of each slot, indexed by slot id.
    armed: Vec<Option<Duration>>,
    /// Same content as `armed`, ordered.
    queue: BTreeSet<(Duration, u8)>,
}

impl Deadlines {
    pub fn new(num_slots: usize) -> Self {
        Deadlines {
            armed: vec![None; num_slots],
            queue: BTreeSet::new(),
        }
    }

    /// Sets the deadline of a slot, replacing the previous one if any.
    pub fn arm(&mut self, slot: u8, deadline: Duration) {
        self.disarm(slot);
        self.armed[usize::from(slot)] = Some(deadline);
        self.queue.insert((deadline, slot));
    }

    /// Removes the deadline of a slot. Returns false if it didn't have one.
    pub fn disarm(&mut self, slot: u8) -> bool {
        match self.armed[usize::from(slot)].take() {
            Some(deadline) => {
                let _was_in = self.queue.remove(&(deadline, slot));
                debug_assert!(_was_in);
                true
            }
            None => false,
        }
    }

    /// Returns the earliest deadline.
    pub fn next(&self) -> Option<Duration> {
        self.queue.iter().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns the slots whose deadline is before or equal to `now`, earliest
    /// first.
    pub fn pop_expired(&mut self, now: Duration) -> SmallVec<[u8; 8]> {
        let mut out = SmallVec::new();
        while let Some(&(deadline, slot)) = self.queue.iter().next() {
            if deadline > now {
                break;
            }
            self.queue.remove(&(deadline, slot));
            self.armed[usize::from(slot)] = None;
            out.push(slot);
        }
        out
    }
}
