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

use super::{controller, controller_with, GENERATIONS};
use crate::{
    controller::{status::StatusWord, CommandError, ControllerConfig, TransferRequest},
    mock::{DataPolicy, MockHw},
    Generation,
};

use alloc::vec::Vec;
use futures::{executor::block_on, prelude::*};

#[test]
fn one_interrupt_drains_everything() {
    for generation in GENERATIONS.iter().copied() {
        let hw = MockHw::new(generation);
        let controller = controller(&hw);
        hw.set_data_policy(DataPolicy::Hold);

        let pending = (0..10)
            .map(|n| block_on(controller.submit(TransferRequest::read(0, n, 1))).unwrap())
            .collect::<Vec<_>>();
        for transfer in pending.iter().rev() {
            hw.complete_held(transfer.slot_id(), 0, 0);
        }

        assert!(block_on(controller.on_interrupt()));
        for transfer in pending {
            assert_eq!(transfer.now_or_never().unwrap().result, Ok(()));
        }

        // Nothing left.
        assert!(!block_on(controller.on_interrupt()));
        assert_eq!(block_on(controller.process_completions()), 0);
        assert_eq!(controller.stats().completed, 4 + 10);
    }
}

#[test]
fn invalid_identifiers_are_discarded() {
    for generation in GENERATIONS.iter().copied() {
        let hw = MockHw::new(generation);
        hw.set_command_count(8);
        let controller = controller(&hw);
        hw.set_data_policy(DataPolicy::Hold);

        let pending = block_on(controller.submit(TransferRequest::read(0, 0, 1))).unwrap();
        hw.push_status(StatusWord::new(8, 0, 0).raw());
        hw.push_status(StatusWord::new(200, 0, 0).raw());
        hw.complete_held(pending.slot_id(), 0, 0);

        assert_eq!(block_on(controller.process_completions()), 1);
        assert_eq!(block_on(pending).result, Ok(()));

        let stats = controller.stats();
        assert_eq!(stats.invalid_completions, 2);
        assert_eq!(stats.completed, 4 + 1);
        assert_eq!(controller.free_slots(), 8);
    }
}

#[test]
fn completion_of_idle_slot_is_ignored() {
    let hw = MockHw::new(Generation::Morpheus);
    let controller = controller(&hw);

    hw.push_status(StatusWord::new(3, 0, 0).raw());
    assert_eq!(block_on(controller.process_completions()), 0);
    assert_eq!(controller.free_slots(), controller.capacity());
    assert_eq!(controller.stats().invalid_completions, 0);
}

#[test]
fn copperhead_ring_wraps_around() {
    let hw = MockHw::new(Generation::Copperhead);
    let config = ControllerConfig {
        status_queue_depth: 4,
        ..Default::default()
    };
    let controller = controller_with(&hw, config);
    let (start, end, _, _) = hw.status_queue_registers();
    assert_eq!(end - start, 16);
    assert_eq!(controller.capacity(), 3);

    for n in 0..10 {
        let completed =
            block_on(controller.execute_polled(TransferRequest::read(0, n, 1))).unwrap();
        assert_eq!(completed.result, Ok(()));

        let (_, _, head, tail) = hw.status_queue_registers();
        assert!(head >= start && head < end);
        assert!(tail >= start && tail < end);
        // Everything reported has been consumed.
        assert_eq!(if tail + 4 == end { start } else { tail + 4 }, head);
    }

    // Several words at once, across the end of the ring.
    hw.set_data_policy(DataPolicy::Hold);
    let pending = (0..3)
        .map(|n| block_on(controller.submit(TransferRequest::read(0, n, 1))).unwrap())
        .collect::<Vec<_>>();
    for transfer in &pending {
        hw.complete_held(transfer.slot_id(), 0, 0);
    }
    assert!(block_on(controller.on_interrupt()));
    for transfer in pending {
        assert_eq!(transfer.now_or_never().unwrap().result, Ok(()));
    }
    assert_eq!(block_on(controller.process_completions()), 0);
}

#[test]
fn polling_completes_other_transfers() {
    for generation in GENERATIONS.iter().copied() {
        let hw = MockHw::new(generation);
        let controller = controller(&hw);
        hw.set_data_policy(DataPolicy::Hold);

        let other = block_on(controller.submit(TransferRequest::read(0, 0, 1))).unwrap();
        hw.complete_held(other.slot_id(), 0, 0);

        hw.set_data_policy(DataPolicy::Complete);
        let completed = block_on(controller.execute_polled(TransferRequest::read(0, 1, 1))).unwrap();
        assert_eq!(completed.result, Ok(()));

        // The other transfer has been completed while polling.
        assert_eq!(other.now_or_never().unwrap().result, Ok(()));
        assert_eq!(block_on(controller.process_completions()), 0);
        assert_eq!(controller.free_slots(), controller.capacity());
    }
}

#[test]
fn copperhead_ring_never_overflows() {
    let hw = MockHw::new(Generation::Copperhead);
    hw.set_command_count(8);
    let config = ControllerConfig {
        status_queue_depth: 4,
        ..Default::default()
    };
    let controller = controller_with(&hw, config);
    assert_eq!(controller.capacity(), 3);
    hw.set_data_policy(DataPolicy::Hold);

    let pending = (0..3)
        .map(|n| block_on(controller.submit(TransferRequest::read(0, n, 1))).unwrap())
        .collect::<Vec<_>>();
    let rejected = block_on(controller.submit(TransferRequest::read(0, 3, 1))).unwrap_err();
    assert_eq!(rejected.error, CommandError::ResourceExhausted);

    // Every command that can be in flight fits in the ring at the same time.
    for transfer in &pending {
        hw.complete_held(transfer.slot_id(), 0, 0);
    }
    assert!(block_on(controller.on_interrupt()));
    for transfer in pending {
        assert_eq!(transfer.now_or_never().unwrap().result, Ok(()));
    }
    assert_eq!(controller.free_slots(), 3);
}

#[test]
fn morpheus_ignores_status_queue_depth() {
    let hw = MockHw::new(Generation::Morpheus);
    let config = ControllerConfig {
        status_queue_depth: 0,
        ..Default::default()
    };
    assert_eq!(controller_with(&hw, config).capacity(), 32);
}
