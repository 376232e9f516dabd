//! Binding-table audit sub-machine (level 1).
//!
//! `Binding` naps until device activity falls outside the verification
//! window, then `BindingTableVerify` walks the node's binding table one
//! entry per self-emitted `BindingTick`, reporting each entry for
//! observability. Missing or empty tables are non-fatal; the walk simply
//! completes and the machine naps until the next window.

use tokio::time::Instant;

use crate::config::BINDING_VERIFY_PERIOD;
use crate::event::{Event, EventKind};
use crate::node::BindingDestination;
use crate::resource::RESOURCE_DEVICES;
use crate::transport::{ZDP_NOT_SUPPORTED, ZDP_SUCCESS};
use crate::StateLevel;

use super::{DeviceContext, DeviceMachine, MachineState};

/// Waits for activity and rate-limits the verification walk.
pub(super) fn binding(machine: &mut DeviceMachine, event: &Event, ctx: &mut DeviceContext<'_>) {
    if event.kind() == EventKind::StateEnter {
        tracing::debug!("device {} binding handler installed", machine.key());
    }

    match event.kind() {
        EventKind::Poll | EventKind::Awake => {
            let due = machine
                .binding
                .verified_at
                .map_or(true, |at| at.elapsed() > BINDING_VERIFY_PERIOD);
            if due {
                tracing::debug!("device {} verifying bindings", machine.key());
            } else {
                return;
            }
        }
        EventKind::BindingTable => {
            // Status from a table request elsewhere in the system; track
            // whether the node answers Mgmt_Bind at all, then walk.
            let status = event.num();
            if status == i64::from(ZDP_SUCCESS) {
                machine.binding.mgmt_bind_supported = true;
            } else if status == i64::from(ZDP_NOT_SUPPORTED) {
                machine.binding.mgmt_bind_supported = false;
            }
        }
        _ => return,
    }

    machine.binding.iter = 0;
    machine.set_state(
        Some(MachineState::BindingTableVerify),
        StateLevel::Binding,
        ctx,
    );
    ctx.queue.push(Event::new(
        RESOURCE_DEVICES,
        EventKind::BindingTick,
        0,
        machine.key(),
    ));
}

/// Walks the binding table, one entry per tick.
pub(super) fn binding_table_verify(
    machine: &mut DeviceMachine,
    event: &Event,
    ctx: &mut DeviceContext<'_>,
) {
    if event.kind() != EventKind::BindingTick {
        // Other events do not re-arm the loop; only ticks drive it.
        return;
    }

    let table_len = machine
        .node(ctx.registry)
        .map_or(0, |node| node.binding_table().len());

    if machine.binding.iter >= table_len {
        machine.binding.verified_at = Some(Instant::now());
        machine.set_state(Some(MachineState::Binding), StateLevel::Binding, ctx);
        return;
    }

    if let Some(entry) = machine
        .node(ctx.registry)
        .and_then(|node| node.binding_table().get(machine.binding.iter))
    {
        let age_secs = entry
            .confirmed_at
            .map_or(-1, |at| at.elapsed().as_secs() as i64);
        match entry.destination {
            BindingDestination::Extended { address, endpoint } => {
                tracing::debug!(
                    "binding 0x{:016X} cluster 0x{:04X} -> ext 0x{:016X} endpoint 0x{:02X}, confirmed {} s ago",
                    entry.src_address,
                    entry.cluster_id,
                    address,
                    endpoint,
                    age_secs
                );
            }
            BindingDestination::Group(group) => {
                tracing::debug!(
                    "binding 0x{:016X} cluster 0x{:04X} -> group 0x{:04X}, confirmed {} s ago",
                    entry.src_address,
                    entry.cluster_id,
                    group,
                    age_secs
                );
            }
        }
    }

    machine.binding.iter += 1;
    ctx.queue.push(Event::new(
        RESOURCE_DEVICES,
        EventKind::BindingTick,
        0,
        machine.key(),
    ));
}
