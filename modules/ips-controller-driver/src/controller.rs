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

//! State machine of a controller.
//!
//! # Overview
//!
//! A [`Controller`] is created with [`init_controller`]. Afterwards, transfers can be started in
//! two ways:
//!
//! - [`Controller::submit`] starts a transfer and immediately returns a [`PendingTransfer`]
//! future. The transfer completes when the controller reports it, which the driver notices
//! during calls to [`Controller::on_interrupt`] or [`Controller::process_completions`], or when
//! its deadline expires, which the driver notices during calls to
//! [`Controller::check_timeouts`]. The user is responsible for calling these methods, for
//! example when the controller raises an interrupt and when the timer returned by
//! [`Controller::next_deadline`] fires.
//! - [`Controller::execute_polled`] starts a transfer and actively waits for its completion by
//! polling the controller. This can be used when interrupts aren't available, for example when
//! writing a crash dump.
//!
//! In both cases, the number of commands in flight is bounded by the number of command slots.
//! When no slot is available, the request is given back to the caller in a [`Rejected`].

use crate::{
    dma::{self, DmaDirection, DmaRegion, MapError, TransferMapping},
    info::{
        self, AdapterInfo, AdapterSummary, Configuration, ControllerInfo, DiskSummary, DriveInfo,
        LookupError, NvramPage5, VolumeSummary,
    },
    retry::BoundedRetry,
    HwAccessRef, MAX_TRANSFER_SIZE, SECTOR_SIZE,
};

use alloc::{vec, vec::Vec};
use core::{
    convert::TryFrom as _,
    fmt,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
    time::Duration,
};
use futures::{channel::oneshot, lock::Mutex};
use spinning_top::Spinlock;

pub use chipset::{
    Generation, PCI_DEVICE_ADAPTEC2_SERVERAID, PCI_DEVICE_IBM_SERVERAID,
    PCI_DEVICE_IBM_SERVERAID2, PCI_VENDOR_ADAPTEC2, PCI_VENDOR_IBM,
};
pub use init::{init_controller, InitError};

pub mod frame;
pub mod status;

mod chipset;
mod deadlines;
mod init;
mod pool;
pub(crate) mod registers;

use frame::{CommandFrame, ScatterGatherEntry};
use pool::SlotFlags;
use status::{Outcome, StatusWord};

/// Tunable parameters of a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Time after which a transfer started with [`Controller::submit`] is considered lost.
    pub command_timeout: Duration,
    /// Number of times the status queue is checked while waiting for a polled command, before
    /// giving up.
    pub poll_attempts: u32,
    /// Time between two checks of the status queue while waiting for a polled command.
    pub poll_interval: Duration,
    /// Number of times the command channel is checked before giving up on a submission.
    /// Copperhead only.
    pub semaphore_attempts: u32,
    /// Time between two checks of the command channel. Copperhead only.
    pub semaphore_interval: Duration,
    /// Number of entries of the status queue. Copperhead only.
    ///
    /// Must be at least 2. The number of commands in flight is limited to one less than this
    /// value.
    pub status_queue_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            command_timeout: Duration::from_secs(5),
            poll_attempts: 100,
            poll_interval: Duration::from_micros(100),
            semaphore_attempts: 100,
            semaphore_interval: Duration::from_micros(100),
            status_queue_depth: crate::MAX_COMMANDS + 1,
        }
    }
}

/// Direction of a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferDirection {
    /// From the volume to the buffer.
    Read,
    /// From the buffer to the volume.
    Write,
}

/// Transfer to perform on a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    /// Volume to read from or write to.
    pub target: u8,
    /// First sector of the transfer.
    pub block: u32,
    /// Number of sectors to transfer.
    pub block_count: u16,
    /// Must be exactly `block_count * SECTOR_SIZE` bytes long. For reads, is overwritten with
    /// the data read from the volume.
    pub data: Vec<u8>,
}

impl TransferRequest {
    /// Builds a request that reads `block_count` sectors into a newly-allocated buffer.
    pub fn read(target: u8, block: u32, block_count: u16) -> Self {
        TransferRequest {
            direction: TransferDirection::Read,
            target,
            block,
            block_count,
            data: vec![0; usize::from(block_count) * SECTOR_SIZE],
        }
    }

    /// Builds a request that writes `data` starting at the given sector.
    pub fn write(target: u8, block: u32, data: Vec<u8>) -> Self {
        TransferRequest {
            direction: TransferDirection::Write,
            target,
            block,
            block_count: u16::try_from(data.len() / SECTOR_SIZE).unwrap_or(u16::MAX),
            data,
        }
    }
}

/// Result of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub result: Result<(), CommandError>,
    /// Buffer of the request. For successful reads, contains the data read from the volume.
    pub data: Vec<u8>,
    /// Number of bytes that haven't been transferred.
    pub residual: usize,
}

/// Request that couldn't be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub error: CommandError,
    /// The request, given back as it was passed.
    pub request: TransferRequest,
}

/// Error that can happen to a command.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum CommandError {
    /// All the command slots are in use.
    #[display(fmt = "no command slot available")]
    ResourceExhausted,
    /// Failed to lend the data buffer to the controller.
    #[display(fmt = "failed to map the data buffer: {}", _0)]
    MappingFailed(MapError),
    /// The controller reported a failure.
    #[display(fmt = "controller error (status {:#x}, extended {:#x})", basic, extended)]
    HardwareError { basic: u8, extended: u8 },
    /// The controller didn't complete the command in time.
    #[display(fmt = "command timed out")]
    Timeout,
    /// The request refers to a volume that doesn't exist, or to sectors outside of the volume.
    #[display(fmt = "invalid request")]
    InvalidRequest,
    /// The command was abandoned before it could complete.
    #[display(fmt = "command aborted")]
    Aborted,
}

/// Statistics about a controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Commands handed to the controller, including the ones issued by the driver itself.
    pub submitted: u64,
    /// Commands for which the controller has reported a status.
    pub completed: u64,
    pub recovered_errors: u64,
    pub hard_errors: u64,
    pub timeouts: u64,
    pub resets: u64,
    /// Status words with an invalid slot identifier.
    pub invalid_completions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    recovered_errors: AtomicU64,
    hard_errors: AtomicU64,
    timeouts: AtomicU64,
    resets: AtomicU64,
    invalid_completions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ControllerStats {
        ControllerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            recovered_errors: self.recovered_errors.load(Ordering::Relaxed),
            hard_errors: self.hard_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            invalid_completions: self.invalid_completions.load(Ordering::Relaxed),
        }
    }
}

/// Transfer started with [`Controller::submit`]. Resolves when it is complete.
#[must_use]
pub struct PendingTransfer {
    slot: u8,
    receiver: oneshot::Receiver<CompletedTransfer>,
}

impl PendingTransfer {
    /// Returns the identifier of the command slot used by the transfer.
    pub fn slot_id(&self) -> u8 {
        self.slot
    }
}

impl Future for PendingTransfer {
    type Output = CompletedTransfer;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(completed)) => Poll::Ready(completed),
            // The controller has been destroyed.
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(CompletedTransfer {
                result: Err(CommandError::Aborted),
                data: Vec::new(),
                residual: 0,
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for PendingTransfer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PendingTransfer").field(&self.slot).finish()
    }
}

/// What a running slot is doing.
pub(crate) struct Job {
    /// Data buffer lent to the controller, if any.
    mapping: Option<TransferMapping>,
    handler: Handler,
}

/// What to do when the command of a slot completes.
enum Handler {
    /// Resolve the [`PendingTransfer`] of the user.
    DataTransfer {
        data: Vec<u8>,
        reply: oneshot::Sender<CompletedTransfer>,
    },
    /// Command issued by the driver itself. The issuer polls for the outcome.
    Management,
}

/// Controller that has been initialized.
pub struct Controller<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access: TAcc,
    config: ControllerConfig,
    chipset: chipset::Chipset<TAcc>,
    pool: pool::SlotPool<TAcc>,
    /// Buffer where management commands store their results.
    scratch: Mutex<DmaRegion<TAcc>>,
    info: Spinlock<ControllerInfo>,
    deadlines: Spinlock<deadlines::Deadlines>,
    /// Locked by whoever pulls status words out of the controller.
    draining: Mutex<()>,
    counters: Counters,
}

impl<TAcc> Controller<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    pub fn generation(&self) -> Generation {
        self.chipset.generation()
    }

    /// Returns the number of transfers that can be in flight at the same time.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Returns the number of command slots currently available.
    pub fn free_slots(&self) -> usize {
        self.pool.num_free()
    }

    pub fn stats(&self) -> ControllerStats {
        self.counters.snapshot()
    }

    /// Returns everything the driver knows about the adapter.
    pub fn info(&self) -> ControllerInfo {
        self.info.lock().clone()
    }

    /// Returns the number of volumes of the adapter. Valid targets for transfers are
    /// `0..num_volumes()`.
    pub fn num_volumes(&self) -> usize {
        self.info.lock().volume_count()
    }

    pub fn adapter_summary(&self) -> AdapterSummary {
        self.info.lock().summary(self.pool.capacity())
    }

    pub fn volume(&self, volume: usize) -> Result<VolumeSummary, LookupError> {
        self.info.lock().volume(volume)
    }

    /// Returns the `disk`th member of the given volume.
    pub fn volume_disk(&self, volume: usize, disk: usize) -> Result<DiskSummary, LookupError> {
        self.info.lock().volume_disk(volume, disk)
    }

    /// Returns the earliest time, as reported by [`HwAccessRef::monotonic_clock`], when
    /// [`Controller::check_timeouts`] has something to do.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.deadlines.lock().next()
    }

    /// Starts a transfer.
    ///
    /// The returned future resolves once the controller has completed the transfer, or once
    /// [`Controller::check_timeouts`] has determined that it timed out.
    pub async fn submit(&self, request: TransferRequest) -> Result<PendingTransfer, Rejected> {
        let (slot, receiver, _) = self.start_transfer(request, false).await?;
        Ok(PendingTransfer { slot, receiver })
    }

    /// Performs a transfer and waits for its completion by polling the controller.
    ///
    /// Other commands that complete in the meantime are processed as well.
    pub async fn execute_polled(
        &self,
        request: TransferRequest,
    ) -> Result<CompletedTransfer, Rejected> {
        let _draining = self.draining.lock().await;

        let (slot, receiver, launched) = self.start_transfer(request, true).await?;
        if launched {
            let _ = self.wait_polled(slot).await;
        }

        Ok(PendingTransfer { slot, receiver }.await)
    }

    /// Must be called when the controller might have raised an interrupt.
    ///
    /// Returns false if the controller isn't the source of the interrupt.
    pub async fn on_interrupt(&self) -> bool {
        let _draining = self.draining.lock().await;
        if !self.chipset.has_pending_interrupt().await {
            return false;
        }

        let num = self.drain_locked().await;
        log::trace!("interrupt: {} completion(s)", num);
        true
    }

    /// Processes all the status words reported by the controller, without checking whether an
    /// interrupt is pending. Returns the number of transfers that have completed.
    pub async fn process_completions(&self) -> usize {
        let _draining = self.draining.lock().await;
        self.drain_locked().await
    }

    /// Aborts the transfers whose deadline has expired. Returns the number of transfers
    /// aborted.
    ///
    /// Should be called at the time returned by [`Controller::next_deadline`].
    pub async fn check_timeouts(&self) -> usize {
        let now = self.hardware_access.monotonic_clock();
        let expired = self.deadlines.lock().pop_expired(now);

        let mut num_aborted = 0;
        for id in expired {
            let job = match self.take_job(id, None) {
                Some(job) => job,
                None => continue,
            };

            log::error!("command {} timed out", id);
            Counters::bump(&self.counters.timeouts);
            let _ = self.finish(id, job, Err(CommandError::Timeout)).await;

            self.chipset.reset().await;
            Counters::bump(&self.counters.resets);
            num_aborted += 1;
        }

        num_aborted
    }

    /// Asks the controller to write its cache to the disks.
    pub async fn flush(&self) -> Result<(), CommandError> {
        self.management_command(frame::OPCODE_FLUSH, 0, 0, SlotFlags::empty())
            .await
    }

    /// Reads the configuration again, so that the state of the volumes and disks is up to date.
    pub async fn refresh_configuration(&self) -> Result<(), CommandError> {
        let configuration = self.read_configuration().await?;
        self.info.lock().configuration = configuration;
        Ok(())
    }

    /// Disables the interrupts of the controller, then destroys the controller. Transfers still
    /// in flight are aborted.
    pub async fn shutdown(self) {
        self.chipset.disable_interrupts().await;

        let capacity = u8::try_from(self.pool.capacity()).unwrap_or(u8::MAX);
        for id in 0..capacity {
            if let Some(job) = self.take_job(id, None) {
                log::debug!("aborting command {}", id);
                let _ = self.finish(id, job, Err(CommandError::Aborted)).await;
            }
        }
    }

    fn validate(&self, request: &TransferRequest) -> Result<(), CommandError> {
        let sectors = self
            .info
            .lock()
            .target_sectors(request.target)
            .ok_or(CommandError::InvalidRequest)?;

        let end = u64::from(request.block) + u64::from(request.block_count);
        if request.block_count == 0 || end > u64::from(sectors) {
            return Err(CommandError::InvalidRequest);
        }

        let len = request.data.len();
        if len != usize::from(request.block_count) * SECTOR_SIZE || len > MAX_TRANSFER_SIZE {
            return Err(CommandError::InvalidRequest);
        }

        Ok(())
    }

    /// Acquires a slot, maps the buffer, and submits the command.
    ///
    /// On success, returns the slot, the receiver of the completion, and whether the command
    /// has actually been handed to the controller. If it hasn't, the completion has already
    /// been sent.
    async fn start_transfer(
        &self,
        request: TransferRequest,
        poll: bool,
    ) -> Result<(u8, oneshot::Receiver<CompletedTransfer>, bool), Rejected> {
        if let Err(error) = self.validate(&request) {
            return Err(Rejected { error, request });
        }

        let id = match self.pool.acquire() {
            Some(id) => id,
            None => {
                return Err(Rejected {
                    error: CommandError::ResourceExhausted,
                    request,
                })
            }
        };

        let mut request = request;
        let (opcode, dma_direction, mut flags) = match request.direction {
            TransferDirection::Read => (
                frame::OPCODE_READ,
                DmaDirection::FromDevice,
                SlotFlags::READ,
            ),
            TransferDirection::Write => (
                frame::OPCODE_WRITE,
                DmaDirection::ToDevice,
                SlotFlags::WRITE,
            ),
        };
        if poll {
            flags |= SlotFlags::POLL;
        }

        let (buffer, len) = (request.data.as_mut_ptr(), request.data.len());
        // The heap allocation of `request.data` doesn't move until the job is finished, even
        // though the `Vec` itself is moved into the job.
        let mapping =
            match unsafe { dma::map_transfer(&self.hardware_access, buffer, len, dma_direction) } {
                Ok(mapping) => mapping,
                Err(err) => {
                    log::debug!("failed to map buffer for command {}: {}", id, err);
                    self.pool.release(id).await;
                    return Err(Rejected {
                        error: CommandError::MappingFailed(err),
                        request,
                    });
                }
            };

        let mut frame = CommandFrame {
            opcode,
            target: request.target,
            block_number: request.block,
            block_count: request.block_count,
            ..Default::default()
        };
        let table = frame.attach_segments(self.pool.frame_address(id), mapping.segments());

        let (reply, receiver) = oneshot::channel();
        let job = Job {
            mapping: Some(mapping),
            handler: Handler::DataTransfer {
                data: request.data,
                reply,
            },
        };

        let launched = self.launch(id, frame, &table, flags, job, !poll).await;
        Ok((id, receiver, launched))
    }

    /// Writes the frame of a slot, marks it as running, and hands it to the controller.
    ///
    /// If the controller doesn't accept the command, the job is finished with a timeout and
    /// false is returned.
    async fn launch(
        &self,
        id: u8,
        mut frame: CommandFrame,
        table: &[ScatterGatherEntry],
        flags: SlotFlags,
        job: Job,
        with_deadline: bool,
    ) -> bool {
        frame.slot_id = id;
        self.pool
            .write_frame(id, &frame::encode_with_table(&frame, table))
            .await;

        {
            let mut slot = self.pool.slot(id).lock();
            slot.flags = flags | SlotFlags::RUNNING;
            slot.job = Some(job);
        }

        if with_deadline {
            let deadline = self.hardware_access.monotonic_clock() + self.config.command_timeout;
            self.deadlines.lock().arm(id, deadline);
        }

        log::trace!(
            "submitting command {}: opcode {:#x}, target {}, block {}, count {}",
            id,
            frame.opcode,
            frame.target,
            frame.block_number,
            frame.block_count
        );
        Counters::bump(&self.counters.submitted);

        match self.chipset.submit(self.pool.frame_address(id)).await {
            Ok(()) => true,
            Err(err) => {
                log::error!("failed to submit command {}: {}", id, err);
                if let Some(job) = self.take_job(id, None) {
                    let _ = self.finish(id, job, Err(CommandError::Timeout)).await;
                }
                false
            }
        }
    }

    /// Issues a command on behalf of the driver and waits for its completion by polling.
    async fn management_command(
        &self,
        opcode: u8,
        target: u8,
        buffer_address: u32,
        flags: SlotFlags,
    ) -> Result<(), CommandError> {
        let _draining = self.draining.lock().await;

        let id = self.pool.acquire().ok_or(CommandError::ResourceExhausted)?;
        let frame = CommandFrame {
            opcode,
            target,
            sg_address: buffer_address,
            ..Default::default()
        };
        let job = Job {
            mapping: None,
            handler: Handler::Management,
        };

        if !self
            .launch(id, frame, &[], flags | SlotFlags::POLL, job, false)
            .await
        {
            return Err(CommandError::Timeout);
        }

        self.wait_polled(id).await
    }

    /// Issues a management command that fills part of the scratch region, then decodes the
    /// result.
    async fn fetch<T>(
        &self,
        opcode: u8,
        target: u8,
        offset: usize,
        size: usize,
        decode: fn(&[u8]) -> T,
    ) -> Result<T, CommandError> {
        let scratch = self.scratch.lock().await;
        self.management_command(opcode, target, scratch.address_of(offset), SlotFlags::READ)
            .await?;

        let mut bytes = vec![0; size];
        scratch.read(offset, &mut bytes).await;
        Ok(decode(&bytes))
    }

    pub(crate) async fn read_adapter_info(&self) -> Result<AdapterInfo, CommandError> {
        self.fetch(
            frame::OPCODE_GET_ADAPTER_INFO,
            0,
            info::ADAPTER_INFO_OFFSET,
            AdapterInfo::SIZE,
            AdapterInfo::decode,
        )
        .await
    }

    pub(crate) async fn read_drive_info(&self) -> Result<DriveInfo, CommandError> {
        self.fetch(
            frame::OPCODE_GET_DRIVE_INFO,
            0,
            info::DRIVE_INFO_OFFSET,
            DriveInfo::SIZE,
            DriveInfo::decode,
        )
        .await
    }

    pub(crate) async fn read_configuration(&self) -> Result<Configuration, CommandError> {
        self.fetch(
            frame::OPCODE_READ_CONFIG,
            0,
            info::CONFIGURATION_OFFSET,
            Configuration::SIZE,
            Configuration::decode,
        )
        .await
    }

    pub(crate) async fn read_nvram_page5(&self) -> Result<NvramPage5, CommandError> {
        self.fetch(
            frame::OPCODE_RW_NVRAM_PAGE,
            5,
            info::NVRAM_PAGE5_OFFSET,
            NvramPage5::SIZE,
            NvramPage5::decode,
        )
        .await
    }

    /// Polls the controller until the command of the given slot completes.
    ///
    /// Must be called while holding the `draining` lock.
    async fn wait_polled(&self, id: u8) -> Result<(), CommandError> {
        loop {
            let mut retry = BoundedRetry::new(self.config.poll_attempts, self.config.poll_interval);

            let status = loop {
                if !retry.next_attempt(&self.hardware_access).await {
                    log::error!("timeout while polling for command {}", id);
                    if let Some(job) = self.take_job(id, None) {
                        Counters::bump(&self.counters.timeouts);
                        let _ = self.finish(id, job, Err(CommandError::Timeout)).await;
                    }
                    return Err(CommandError::Timeout);
                }

                match self.chipset.dequeue_status().await {
                    Some(status) if self.is_valid(status) => break status,
                    Some(status) => self.discard(status),
                    None => {}
                }
            };

            let outcome = self.complete(status).await;
            if status.slot_id() == id {
                return outcome.unwrap_or(Err(CommandError::Aborted));
            }
        }
    }

    /// Processes status words until the controller has none left.
    ///
    /// Must be called while holding the `draining` lock.
    async fn drain_locked(&self) -> usize {
        let mut num_completed = 0;
        while let Some(status) = self.chipset.dequeue_status().await {
            if !self.is_valid(status) {
                self.discard(status);
                continue;
            }

            if self.complete(status).await.is_some() {
                num_completed += 1;
            }
        }
        num_completed
    }

    fn is_valid(&self, status: StatusWord) -> bool {
        usize::from(status.slot_id()) < self.pool.capacity()
    }

    fn discard(&self, status: StatusWord) {
        log::error!("invalid command id {} in {:?}", status.slot_id(), status);
        Counters::bump(&self.counters.invalid_completions);
    }

    /// Removes the job of a slot, if it is running.
    fn take_job(&self, id: u8, status: Option<(u8, u8)>) -> Option<Job> {
        let mut slot = self.pool.slot(id).lock();
        if !slot.flags.contains(SlotFlags::RUNNING) {
            return None;
        }

        slot.flags.remove(SlotFlags::RUNNING);
        if status.is_some() {
            slot.status = status;
        }
        slot.job.take()
    }

    /// Handles the status word of a slot. Returns `None` if the slot wasn't running.
    async fn complete(&self, status: StatusWord) -> Option<Result<(), CommandError>> {
        let id = status.slot_id();
        let (general, extended) = (status.general_status(), status.extended_status());

        let job = match self.take_job(id, Some((general, extended))) {
            Some(job) => job,
            None => {
                log::warn!("completion for command {} which isn't running", id);
                return None;
            }
        };

        Counters::bump(&self.counters.completed);
        let result = match status.outcome() {
            Outcome::Success => Ok(()),
            Outcome::Recovered => {
                log::warn!("command {}: recovered error {:#x}", id, extended);
                Counters::bump(&self.counters.recovered_errors);
                Ok(())
            }
            Outcome::Failed => {
                let basic = status.basic_status();
                log::error!(
                    "command {}: error {:#x}, extended {:#x}",
                    id,
                    basic,
                    extended
                );
                Counters::bump(&self.counters.hard_errors);
                Err(CommandError::HardwareError { basic, extended })
            }
        };

        log::trace!("command {} complete: {:?}", id, result);
        Some(self.finish(id, job, result).await)
    }

    /// Takes back the buffer of a job, releases its slot, and notifies its issuer.
    async fn finish(
        &self,
        id: u8,
        job: Job,
        result: Result<(), CommandError>,
    ) -> Result<(), CommandError> {
        self.deadlines.lock().disarm(id);

        if let Some(mapping) = job.mapping {
            dma::unmap_transfer(&self.hardware_access, mapping);
        }

        self.pool.release(id).await;

        if let Handler::DataTransfer { data, reply } = job.handler {
            let residual = if result.is_ok() { 0 } else { data.len() };
            let _ = reply.send(CompletedTransfer {
                result: result.clone(),
                data,
                residual,
            });
        }

        result
    }
}

impl<TAcc> fmt::Debug for Controller<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Controller")
            .field("capacity", &self.pool.capacity())
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}
