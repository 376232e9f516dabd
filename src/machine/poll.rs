//! Attribute polling sub-machine (level 2).
//!
//! `PollIdle` waits for a `Poll` trigger and snapshots the queue of items
//! worth reading. `PollNext` starts one read at a time; `PollBusy` waits for
//! its confirm or timeout. Failed reads are retried with a cap, unreachable
//! devices drop the whole queue.
//!
//! The queue is consumed from the tail (`Vec::pop`); the builder reverses
//! its traversal so popping yields the original item order.

use crate::config::{MAX_POLL_ITEM_RETRIES, MIN_MAC_POLL_RX_ON};
use crate::event::{Event, EventKind};
use crate::transport::{read_function, TransportResult, APS_SUCCESS};
use crate::StateLevel;

use super::{DeviceContext, DeviceMachine, MachineState, PollItem};

/// Collect all items ready for polling.
///
/// An item qualifies when its value is unset or older than its refresh
/// interval and its description supplies a non-empty read recipe.
pub(super) fn build_poll_queue(machine: &DeviceMachine, ctx: &DeviceContext<'_>) -> Vec<PollItem> {
    let mut result = Vec::new();

    for (unique_id, kind) in machine.sub_device_pairs() {
        let Some(sub) = ctx.store.get(*kind, unique_id) else {
            continue;
        };
        for item in sub.items() {
            if let Some(last_set) = item.last_set() {
                if last_set.elapsed() < item.refresh_interval() {
                    continue;
                }
            }
            let Some(recipe) = item.read_parameters() else {
                continue;
            };
            if recipe.is_empty() {
                continue;
            }
            result.push(PollItem {
                kind: *kind,
                unique_id: unique_id.clone(),
                suffix: item.suffix(),
                recipe: recipe.clone(),
                retry: 0,
            });
        }
    }

    result.reverse();
    result
}

/// Waits for a poll trigger and fills the queue.
pub(super) fn poll_idle(machine: &mut DeviceMachine, event: &Event, ctx: &mut DeviceContext<'_>) {
    match event.kind() {
        EventKind::StateEnter => {
            tracing::debug!("device {} poll idle", machine.key());
        }
        EventKind::Poll => {
            machine.poll_queue = build_poll_queue(machine, ctx);
            if !machine.poll_queue.is_empty() {
                machine.set_state(Some(MachineState::PollNext), StateLevel::Poll, ctx);
            }
        }
        _ => {}
    }
}

/// Starts the read for the tail item, or drains back to `PollIdle`.
pub(super) fn poll_next(machine: &mut DeviceMachine, event: &Event, ctx: &mut DeviceContext<'_>) {
    match event.kind() {
        EventKind::StateEnter | EventKind::StateTimeout => loop {
            if !machine.reachable(ctx.registry) {
                machine.poll_queue.clear();
            }

            if machine.poll_queue.is_empty() {
                machine.set_state(Some(MachineState::PollIdle), StateLevel::Poll, ctx);
                return;
            }

            let Some((kind, unique_id, suffix, recipe)) = machine
                .poll_queue
                .last()
                .map(|p| (p.kind, p.unique_id.clone(), p.suffix, p.recipe.clone()))
            else {
                return;
            };

            let Some(read) = read_function(&recipe) else {
                tracing::debug!(
                    "device {} poll: no read function for {}",
                    machine.key(),
                    suffix
                );
                machine.poll_queue.pop();
                continue;
            };

            machine.read_in_flight = TransportResult::default();
            let (ext, nwk) = machine.addresses();
            let target = ctx
                .store
                .get(kind, &unique_id)
                .and_then(|sub| sub.item(suffix).map(|item| (sub, item)));
            if let Some((sub, item)) = target {
                machine.read_in_flight = read(sub, item, &recipe, ext, nwk, &mut *ctx.transport);
            }

            if machine.read_in_flight.enqueued {
                machine.set_state(Some(MachineState::PollBusy), StateLevel::Poll, ctx);
            } else {
                let key = machine.key();
                if let Some(poll) = machine.poll_queue.last_mut() {
                    poll.retry += 1;
                    tracing::debug!(
                        "device {} poll: failed to enqueue read for {}",
                        key,
                        suffix
                    );
                    if poll.retry >= MAX_POLL_ITEM_RETRIES {
                        machine.poll_queue.pop();
                    }
                    // Try again after the poll window.
                    machine.start_timer(StateLevel::Poll, MIN_MAC_POLL_RX_ON);
                }
            }
            return;
        },
        EventKind::StateLeave => {
            machine.stop_timer(StateLevel::Poll);
        }
        _ => {}
    }
}

/// Waits for the confirm (or timeout) of the outstanding poll read.
pub(super) fn poll_busy(machine: &mut DeviceMachine, event: &Event, ctx: &mut DeviceContext<'_>) {
    match event.kind() {
        EventKind::StateEnter => {
            machine.start_timer(StateLevel::Poll, MIN_MAC_POLL_RX_ON);
        }
        EventKind::StateLeave => {
            machine.stop_timer(StateLevel::Poll);
        }
        EventKind::ApsConfirm
            if event.aps_confirm_id() == machine.read_in_flight.request_id =>
        {
            tracing::debug!(
                "device {} poll confirm status 0x{:02X}",
                machine.key(),
                event.aps_confirm_status()
            );

            if event.aps_confirm_status() == APS_SUCCESS {
                machine.poll_queue.pop();
            } else if let Some(poll) = machine.poll_queue.last_mut() {
                poll.retry += 1;
                if poll.retry >= MAX_POLL_ITEM_RETRIES {
                    machine.poll_queue.pop();
                }
            }
            machine.set_state(Some(MachineState::PollNext), StateLevel::Poll, ctx);
        }
        EventKind::StateTimeout => {
            machine.set_state(Some(MachineState::PollNext), StateLevel::Poll, ctx);
        }
        _ => {}
    }
}
