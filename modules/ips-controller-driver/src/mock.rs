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

//! Emulated controller, used by the tests.
//!
//! Physical memory is a flat array of bytes, and the registers of the controller live at
//! [`REGS_BASE`]. Management commands are answered immediately. Data commands are either
//! answered immediately or held until the test completes them.

#![cfg(test)]

use crate::{
    controller::{
        frame::{self, CommandFrame, ScatterGatherEntry, COMMAND_FRAME_SIZE, SG_ENTRY_SIZE},
        registers::*,
        status::StatusWord,
    },
    dma::{DmaDirection, DmaSegment, PlatformMapping},
    Generation, HwAccessRef, SECTOR_SIZE,
};

use alloc::{collections::VecDeque, sync::Arc, vec, vec::Vec};
use core::{alloc::Layout, convert::TryFrom as _, num::NonZeroU32, time::Duration};
use futures::future;
use hashbrown::HashMap;
use spinning_top::Spinlock;

/// Location of the registers of the emulated controller.
pub const REGS_BASE: u64 = 0xfeb0_0000;

const MEMORY_SIZE: usize = 4 * 1024 * 1024;
/// Allocations start here, so that no allocation is ever at address 0.
const FIRST_ALLOCATION: u64 = 0x1000;

/// What to do with read and write commands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataPolicy {
    /// Report them as complete as soon as they are submitted.
    Complete,
    /// Keep them until [`MockHw::complete_held`] is called.
    Hold,
}

/// Volume reported by the emulated firmware.
#[derive(Debug, Clone)]
struct Volume {
    raid_level: u8,
    sectors: u32,
}

struct Mapping {
    host: usize,
    len: usize,
    physical: u64,
    direction: DmaDirection,
}

struct State {
    generation: Generation,
    memory: Vec<u8>,
    clock: Duration,

    next_allocation: u64,
    allocations: HashMap<u64, Layout, fnv::FnvBuildHasher>,
    remaining_allocations: Option<usize>,
    mappings: HashMap<u64, Mapping, fnv::FnvBuildHasher>,
    next_mapping_id: u64,
    segment_size: usize,
    fail_mappings: bool,

    // Copperhead.
    interrupts_enabled: bool,
    status_pending: bool,
    ccsa: u32,
    semaphore_busy_reads: u32,
    sq_start: u32,
    sq_end: u32,
    sq_head: u32,
    sq_tail: u32,

    // Morpheus.
    oim: u32,
    outbound: VecDeque<u32>,

    // Firmware.
    command_count: u8,
    adapter_type: u16,
    volumes: Vec<Volume>,
    failing_opcodes: HashMap<u8, u8, fnv::FnvBuildHasher>,
    data_policy: DataPolicy,
    read_fill: u8,
    submitted: Vec<CommandFrame>,
    held: Vec<CommandFrame>,
    written: Vec<u8>,
}

/// Emulated controller. Clones share the same state.
#[derive(Clone)]
pub struct MockHw {
    state: Arc<Spinlock<State>>,
}

impl MockHw {
    pub fn new(generation: Generation) -> Self {
        MockHw {
            state: Arc::new(Spinlock::new(State {
                generation,
                memory: vec![0; MEMORY_SIZE],
                clock: Duration::from_secs(0),
                next_allocation: FIRST_ALLOCATION,
                allocations: HashMap::default(),
                remaining_allocations: None,
                mappings: HashMap::default(),
                next_mapping_id: 1,
                segment_size: 4096,
                fail_mappings: false,
                interrupts_enabled: false,
                status_pending: false,
                ccsa: 0,
                semaphore_busy_reads: 0,
                sq_start: 0,
                sq_end: 0,
                sq_head: 0,
                sq_tail: 0,
                oim: MORPHEUS_OIM_DS,
                outbound: VecDeque::new(),
                command_count: 32,
                adapter_type: 11,
                volumes: vec![Volume {
                    raid_level: 5,
                    sectors: 1_000_000,
                }],
                failing_opcodes: HashMap::default(),
                data_policy: DataPolicy::Complete,
                read_fill: 0x5a,
                submitted: Vec::new(),
                held: Vec::new(),
                written: Vec::new(),
            })),
        }
    }

    pub fn generation(&self) -> Generation {
        self.state.lock().generation
    }

    /// Sets the number of concurrent commands reported by the firmware.
    pub fn set_command_count(&self, count: u8) {
        self.state.lock().command_count = count;
    }

    /// Replaces the volumes reported by the firmware with volumes of the given sizes, in
    /// sectors.
    pub fn set_volumes(&self, sizes: &[u32]) {
        self.state.lock().volumes = sizes
            .iter()
            .map(|sectors| Volume {
                raid_level: 1,
                sectors: *sectors,
            })
            .collect();
    }

    pub fn set_data_policy(&self, policy: DataPolicy) {
        self.state.lock().data_policy = policy;
    }

    /// Commands with the given opcode will complete with the given basic status.
    pub fn fail_opcode(&self, opcode: u8, basic_status: u8) {
        self.state
            .lock()
            .failing_opcodes
            .insert(opcode, basic_status);
    }

    /// The command channel will report itself as busy during the next `reads` reads.
    pub fn set_semaphore_busy(&self, reads: u32) {
        self.state.lock().semaphore_busy_reads = reads;
    }

    /// Only the next `count` allocations will succeed.
    pub fn fail_allocations_after(&self, count: usize) {
        self.state.lock().remaining_allocations = Some(count);
    }

    pub fn fail_mappings(&self, fail: bool) {
        self.state.lock().fail_mappings = fail;
    }

    /// Sets the size of the physical segments that mapped buffers are split into.
    pub fn set_segment_size(&self, size: usize) {
        self.state.lock().segment_size = size;
    }

    pub fn advance(&self, duration: Duration) {
        self.state.lock().clock += duration;
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Writes physical memory directly.
    pub fn poke(&self, address: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let address = usize::try_from(address).unwrap();
        state.memory[address..address + data.len()].copy_from_slice(data);
    }

    /// Returns all the frames submitted so far.
    pub fn submitted(&self) -> Vec<CommandFrame> {
        self.state.lock().submitted.clone()
    }

    /// Returns the content of all the buffers written by write commands so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Completes a held data command.
    pub fn complete_held(&self, slot_id: u8, basic_status: u8, extended_status: u8) {
        let mut state = self.state.lock();
        let position = state
            .held
            .iter()
            .position(|f| f.slot_id == slot_id)
            .unwrap();
        let frame = state.held.remove(position);
        state.finish_data(&frame, basic_status, extended_status);
    }

    /// Pushes a status word as if the controller had reported it.
    pub fn push_status(&self, raw: u32) {
        self.state.lock().post_status(raw);
    }

    pub fn interrupts_enabled(&self) -> bool {
        let state = self.state.lock();
        match state.generation {
            Generation::Copperhead => state.interrupts_enabled,
            Generation::Morpheus => state.oim & MORPHEUS_OIM_DS == 0,
        }
    }

    /// Returns the start, end, head and tail registers of the status queue.
    pub fn status_queue_registers(&self) -> (u32, u32, u32, u32) {
        let state = self.state.lock();
        (state.sq_start, state.sq_end, state.sq_head, state.sq_tail)
    }
}

impl State {
    fn read_memory(&self, address: u64, dest: &mut [u8]) {
        let address = usize::try_from(address).unwrap();
        dest.copy_from_slice(&self.memory[address..address + dest.len()]);
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) {
        let address = usize::try_from(address).unwrap();
        self.memory[address..address + data.len()].copy_from_slice(data);
    }

    fn read_register_u8(&mut self, offset: u64) -> u8 {
        assert_eq!(offset, COPPERHEAD_HIS_OFFSET);
        let mut value = 0;
        if self.interrupts_enabled {
            value |= COPPERHEAD_HIS_EN;
        }
        if self.status_pending {
            value |= COPPERHEAD_HIS_SCE;
        }
        value
    }

    fn write_register_u8(&mut self, offset: u64, data: &[u8]) {
        match (offset, data) {
            (COPPERHEAD_HIS_OFFSET, [value]) => {
                self.interrupts_enabled = value & COPPERHEAD_HIS_EN != 0;
                if value & COPPERHEAD_HIS_SCE != 0 {
                    self.status_pending = false;
                }
            }
            (COPPERHEAD_CCC_OFFSET, [lo, hi]) => {
                assert_eq!(u16::from_le_bytes([*lo, *hi]), COPPERHEAD_CCC_START);
                assert_eq!(self.semaphore_busy_reads, 0);
                let address = self.ccsa;
                self.submit(address);
            }
            _ => panic!("unexpected register write at {:#x}", offset),
        }
    }

    fn read_register_u32(&mut self, offset: u64) -> u32 {
        match offset {
            COPPERHEAD_CCC_OFFSET => {
                if self.semaphore_busy_reads > 0 {
                    if self.semaphore_busy_reads != u32::MAX {
                        self.semaphore_busy_reads -= 1;
                    }
                    COPPERHEAD_CCC_SEM
                } else {
                    0
                }
            }
            COPPERHEAD_SQH_OFFSET => self.sq_head,
            COPPERHEAD_SQT_OFFSET => self.sq_tail,
            MORPHEUS_OIS_OFFSET if !self.outbound.is_empty() => MORPHEUS_OIS_PEND,
            MORPHEUS_OIS_OFFSET => 0,
            MORPHEUS_OIM_OFFSET => self.oim,
            MORPHEUS_OQP_OFFSET => self.outbound.pop_front().unwrap_or(0xffff_ffff),
            _ => panic!("unexpected register read at {:#x}", offset),
        }
    }

    fn write_register_u32(&mut self, offset: u64, value: u32) {
        match offset {
            COPPERHEAD_CCSA_OFFSET => self.ccsa = value,
            COPPERHEAD_SQS_OFFSET => self.sq_start = value,
            COPPERHEAD_SQE_OFFSET => self.sq_end = value,
            COPPERHEAD_SQH_OFFSET => self.sq_head = value,
            COPPERHEAD_SQT_OFFSET => self.sq_tail = value,
            MORPHEUS_OIM_OFFSET => self.oim = value,
            MORPHEUS_IQP_OFFSET => self.submit(value),
            _ => panic!("unexpected register write at {:#x}", offset),
        }
    }

    fn allocate(&mut self, layout: Layout) -> Option<u64> {
        let align = layout.align() as u64;
        let address = (self.next_allocation + align - 1) / align * align;
        let end = address + layout.size() as u64;
        if end > MEMORY_SIZE as u64 {
            return None;
        }
        self.next_allocation = end.max(address + 1);
        Some(address)
    }

    fn post_status(&mut self, raw: u32) {
        match self.generation {
            Generation::Copperhead => {
                let head = self.sq_head;
                self.write_memory(u64::from(head), &raw.to_le_bytes());
                self.sq_head = if head + 4 == self.sq_end {
                    self.sq_start
                } else {
                    head + 4
                };
                self.status_pending = true;
            }
            Generation::Morpheus => self.outbound.push_back(raw),
        }
    }

    fn complete(&mut self, slot_id: u8, basic_status: u8, extended_status: u8) {
        let status = StatusWord::new(slot_id, basic_status, extended_status);
        self.post_status(status.raw());
    }

    /// Returns the segments of memory a data command refers to.
    fn data_segments(&self, frame: &CommandFrame) -> Vec<DmaSegment> {
        if frame.sg_count == 0 {
            return vec![DmaSegment {
                address: frame.sg_address,
                length: u32::from(frame.block_count) * SECTOR_SIZE as u32,
            }];
        }

        (0..usize::from(frame.sg_count))
            .map(|n| {
                let mut entry = [0; SG_ENTRY_SIZE];
                self.read_memory(
                    u64::from(frame.sg_address) + (n * SG_ENTRY_SIZE) as u64,
                    &mut entry,
                );
                let entry = ScatterGatherEntry::decode(&entry);
                DmaSegment {
                    address: entry.address,
                    length: entry.length,
                }
            })
            .collect()
    }

    fn finish_data(&mut self, frame: &CommandFrame, basic_status: u8, extended_status: u8) {
        if basic_status == 0 {
            let is_read = frame.opcode & !frame::OPCODE_SG_FLAG == frame::OPCODE_READ;
            for segment in self.data_segments(frame) {
                if is_read {
                    let fill = vec![self.read_fill; segment.length as usize];
                    self.write_memory(u64::from(segment.address), &fill);
                } else {
                    let mut data = vec![0; segment.length as usize];
                    self.read_memory(u64::from(segment.address), &mut data);
                    self.written.extend_from_slice(&data);
                }
            }
        }

        self.complete(frame.slot_id, basic_status, extended_status);
    }

    fn submit(&mut self, frame_address: u32) {
        let mut bytes = [0; COMMAND_FRAME_SIZE];
        self.read_memory(u64::from(frame_address), &mut bytes);
        let frame = CommandFrame::decode(&bytes);
        self.submitted.push(frame.clone());

        let failure = self.failing_opcodes.get(&frame.opcode).copied();
        let data_opcode = frame.opcode & !frame::OPCODE_SG_FLAG;
        if data_opcode == frame::OPCODE_READ || data_opcode == frame::OPCODE_WRITE {
            match (failure, self.data_policy) {
                (Some(basic), _) => self.complete(frame.slot_id, basic, 0),
                (None, DataPolicy::Complete) => self.finish_data(&frame, 0, 0),
                (None, DataPolicy::Hold) => self.held.push(frame),
            }
            return;
        }

        if let Some(basic) = failure {
            self.complete(frame.slot_id, basic, 0);
            return;
        }

        let reply = match frame.opcode {
            frame::OPCODE_GET_ADAPTER_INFO => Some(self.adapter_info()),
            frame::OPCODE_GET_DRIVE_INFO => Some(self.drive_info()),
            frame::OPCODE_READ_CONFIG => Some(self.configuration()),
            frame::OPCODE_RW_NVRAM_PAGE => {
                assert_eq!(frame.target, 5);
                Some(self.nvram_page5())
            }
            _ => None,
        };
        if let Some(reply) = reply {
            self.write_memory(u64::from(frame.sg_address), &reply);
        }

        self.complete(frame.slot_id, 0, 0);
    }

    fn adapter_info(&self) -> Vec<u8> {
        let mut out = vec![0; 196];
        out[0] = u8::try_from(self.volumes.len()).unwrap();
        out[8..16].copy_from_slice(b"7.12.07\0");
        out[16..24].copy_from_slice(b"7.10.18\0");
        for (n, volume) in self.volumes.iter().enumerate() {
            out[24 + n * 4..28 + n * 4].copy_from_slice(&volume.sectors.to_le_bytes());
        }
        out[56] = self.command_count;
        out
    }

    fn drive_info(&self) -> Vec<u8> {
        let mut out = vec![0; 68];
        out[0] = u8::try_from(self.volumes.len()).unwrap();
        for (n, volume) in self.volumes.iter().enumerate() {
            let entry = &mut out[4 + n * 8..4 + (n + 1) * 8];
            entry[0] = u8::try_from(n).unwrap();
            entry[2] = volume.raid_level;
            entry[3] = 0x03;
            entry[4..8].copy_from_slice(&volume.sectors.to_le_bytes());
        }
        out
    }

    /// Each volume is made of a single disk, located on channel 0 at the target equal to the
    /// volume number. Only the first half of each disk belongs to its volume.
    fn configuration(&self) -> Vec<u8> {
        let mut out = vec![0; 4508];
        out[0] = u8::try_from(self.volumes.len()).unwrap();
        for (n, volume) in self.volumes.iter().enumerate() {
            let ld = 60 + n * 204;
            out[ld + 2] = 0x03;
            out[ld + 4] = 1;
            out[ld + 8..ld + 12].copy_from_slice(&volume.sectors.to_le_bytes());
            out[ld + 12] = 0;
            out[ld + 13] = u8::try_from(n).unwrap();
            out[ld + 20..ld + 24].copy_from_slice(&volume.sectors.to_le_bytes());

            let dev = 1692 + n * 36;
            out[dev + 3] = 0x81 | 0x08;
            let device_sectors = volume.sectors.saturating_mul(2);
            out[dev + 4..dev + 8].copy_from_slice(&device_sectors.to_le_bytes());
            out[dev + 8..dev + 16].copy_from_slice(b"IBM-ESXS");
        }
        out
    }

    fn nvram_page5(&self) -> Vec<u8> {
        let mut out = vec![0; 128];
        out[6..8].copy_from_slice(&self.adapter_type.to_le_bytes());
        out
    }
}

unsafe impl<'a> HwAccessRef<'a> for &'a MockHw {
    type Delay = future::Ready<()>;
    type ReadMemFutureU8 = future::Ready<()>;
    type ReadMemFutureU32 = future::Ready<()>;
    type WriteMemFutureU8 = future::Ready<()>;
    type WriteMemFutureU32 = future::Ready<()>;
    type Alloc32 = future::Ready<Result<NonZeroU32, ()>>;

    unsafe fn read_memory_u8(self, address: u64, dest: &'a mut [u8]) -> Self::ReadMemFutureU8 {
        let mut state = self.state.lock();
        if address >= REGS_BASE {
            assert_eq!(dest.len(), 1);
            dest[0] = state.read_register_u8(address - REGS_BASE);
        } else {
            state.read_memory(address, dest);
        }
        future::ready(())
    }

    unsafe fn read_memory_u32_le(
        self,
        address: u64,
        dest: &'a mut [u32],
    ) -> Self::ReadMemFutureU32 {
        let mut state = self.state.lock();
        if address >= REGS_BASE {
            assert_eq!(dest.len(), 1);
            dest[0] = state.read_register_u32(address - REGS_BASE);
        } else {
            for (n, word) in dest.iter_mut().enumerate() {
                let mut bytes = [0; 4];
                state.read_memory(address + n as u64 * 4, &mut bytes);
                *word = u32::from_le_bytes(bytes);
            }
        }
        future::ready(())
    }

    unsafe fn write_memory_u8(self, address: u64, data: &'a [u8]) -> Self::WriteMemFutureU8 {
        let mut state = self.state.lock();
        if address >= REGS_BASE {
            state.write_register_u8(address - REGS_BASE, data);
        } else {
            state.write_memory(address, data);
        }
        future::ready(())
    }

    unsafe fn write_memory_u32_le(self, address: u64, data: &'a [u32]) -> Self::WriteMemFutureU32 {
        let mut state = self.state.lock();
        if address >= REGS_BASE {
            assert_eq!(data.len(), 1);
            state.write_register_u32(address - REGS_BASE, data[0]);
        } else {
            for (n, word) in data.iter().enumerate() {
                state.write_memory(address + n as u64 * 4, &word.to_le_bytes());
            }
        }
        future::ready(())
    }

    fn alloc32(self, layout: Layout) -> Self::Alloc32 {
        let mut state = self.state.lock();
        if let Some(remaining) = state.remaining_allocations.as_mut() {
            if *remaining == 0 {
                return future::ready(Err(()));
            }
            *remaining -= 1;
        }

        let address = match state.allocate(layout) {
            Some(address) => address,
            None => return future::ready(Err(())),
        };
        state.allocations.insert(address, layout);
        future::ready(Ok(
            NonZeroU32::new(u32::try_from(address).unwrap()).unwrap()
        ))
    }

    unsafe fn dealloc(self, address: u64, layout: Layout) {
        let previous = self.state.lock().allocations.remove(&address);
        assert_eq!(previous, Some(layout), "bad deallocation at {:#x}", address);
    }

    unsafe fn map_transfer(
        self,
        buffer: *mut u8,
        len: usize,
        direction: DmaDirection,
    ) -> Result<PlatformMapping, ()> {
        let mut state = self.state.lock();
        if state.fail_mappings {
            return Err(());
        }

        let physical = state
            .allocate(Layout::from_size_align(len, 512).unwrap())
            .ok_or(())?;
        // The bounce memory starts as a copy of the buffer, whatever the direction.
        let initial = core::slice::from_raw_parts(buffer as *const u8, len);
        state.write_memory(physical, initial);

        let segment_size = state.segment_size;
        let segments = (0..len)
            .step_by(segment_size)
            .map(|offset| DmaSegment {
                address: u32::try_from(physical + offset as u64).unwrap(),
                length: u32::try_from(segment_size.min(len - offset)).unwrap(),
            })
            .collect();

        let id = state.next_mapping_id;
        state.next_mapping_id += 1;
        state.mappings.insert(
            id,
            Mapping {
                host: buffer as usize,
                len,
                physical,
                direction,
            },
        );

        Ok(PlatformMapping { id, segments })
    }

    unsafe fn sync_for_device(self, mapping: u64) {
        let mut state = self.state.lock();
        let (host, len, physical, direction) = {
            let m = &state.mappings[&mapping];
            (m.host, m.len, m.physical, m.direction)
        };
        if direction == DmaDirection::ToDevice {
            let data = core::slice::from_raw_parts(host as *const u8, len);
            state.write_memory(physical, data);
        }
    }

    unsafe fn sync_for_cpu(self, mapping: u64) {
        let state = self.state.lock();
        let m = &state.mappings[&mapping];
        if m.direction == DmaDirection::FromDevice {
            let data = core::slice::from_raw_parts_mut(m.host as *mut u8, m.len);
            state.read_memory(m.physical, data);
        }
    }

    unsafe fn unmap_transfer(self, mapping: u64) {
        let previous = self.state.lock().mappings.remove(&mapping);
        assert!(previous.is_some(), "mapping {} unmapped twice", mapping);
    }

    fn delay(self, duration: Duration) -> Self::Delay {
        self.state.lock().clock += duration;
        future::ready(())
    }

    fn monotonic_clock(self) -> Duration {
        self.state.lock().clock
    }
}
