//! #7 Operational steady state.
//!
//! `Idle` is a composite: entering it installs the binding audit at level 1
//! and the poll machine at level 2, leaving tears both down. Every other
//! event is first run through item-change reconciliation and then fanned out
//! to the sub-levels, so all sub-machines observe the same event stream.

use crate::event::{Event, EventKind};
use crate::StateLevel;

use super::{DeviceContext, DeviceMachine, MachineState};

pub(super) fn idle(machine: &mut DeviceMachine, event: &Event, ctx: &mut DeviceContext<'_>) {
    match event.kind() {
        EventKind::StateEnter => {
            machine.set_state(Some(MachineState::Binding), StateLevel::Binding, ctx);
            machine.set_state(Some(MachineState::PollIdle), StateLevel::Poll, ctx);
            return;
        }
        EventKind::StateLeave => {
            machine.set_state(None, StateLevel::Binding, ctx);
            machine.set_state(None, StateLevel::Poll, ctx);
            return;
        }
        EventKind::DdfReload => {
            // Re-run discovery against the reloaded description; leaving
            // Idle tears the sub-machines down on the way out.
            machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
        }
        _ => {}
    }

    check_item_changes(machine, event, ctx);

    // Process parallel states.
    for level in StateLevel::SUB_LEVELS {
        machine.handle_event(event, level, ctx);
    }
}

/// Item-change reconciliation.
///
/// Activity events (`Awake`, `Poll`) touch every sub-device; anything else
/// touches only the sub-device named by the event's resource prefix and
/// identifier. For each touched sub-device with pending state changes, the
/// change named by the event kind is verified against the item's current
/// value and every pending change is ticked, then settled changes are swept.
fn check_item_changes(machine: &mut DeviceMachine, event: &Event, ctx: &mut DeviceContext<'_>) {
    let targets: Vec<_> = if matches!(event.kind(), EventKind::Awake | EventKind::Poll) {
        machine.sub_device_pairs().to_vec()
    } else {
        machine
            .sub_device_key(event.resource(), event.id(), &*ctx.store)
            .map(|(kind, unique_id)| (unique_id, kind))
            .into_iter()
            .collect()
    };

    for (unique_id, kind) in targets {
        let Some(sub) = ctx.store.get_mut(kind, &unique_id) else {
            continue;
        };
        if sub.state_changes().is_empty() {
            continue;
        }

        let mut changes = std::mem::take(sub.state_changes_mut());
        for change in &mut changes {
            if let Some(suffix) = event.kind().item_suffix() {
                if let Some(item) = sub.item(suffix) {
                    change.verify_item_change(item);
                }
            }
            change.tick(sub, &mut *ctx.transport);
        }
        *sub.state_changes_mut() = changes;
        sub.cleanup_state_changes();
    }
}
