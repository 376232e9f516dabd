//! Primary lifecycle states: `Init` through `GetDdf`, plus `Dead`.
//!
//! The chain verifies one prerequisite per state (node descriptor, active
//! endpoints, simple descriptors, basic-cluster identity) and funnels every
//! failure — enqueue refusal, non-success confirm, timeout, unreachable
//! device — back through `Init`, which re-evaluates from scratch on the next
//! activity event. Receiving the awaited data also goes back through `Init`
//! with a synthetic `Awake` so the chain immediately advances one state
//! further.

use crate::config::MIN_MAC_POLL_RX_ON;
use crate::event::{Event, EventKind};
use crate::resource::{self, ItemSuffix, Value, RESOURCE_DEVICES};
use crate::transport::{TransportResult, ZclReadParam, APS_SUCCESS};
use crate::StateLevel;

use super::{DeviceContext, DeviceMachine, MachineState};

/// Vendor prefix bits of the coordinator's own radio MAC.
const COORDINATOR_VENDOR_BITS: u64 = 0x00212E0000000000;

/// Keys with a zero upper half carry a 32-bit green-power source id instead
/// of a MAC.
const GREEN_POWER_KEY_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// ZCL basic cluster and its identity attributes.
const BASIC_CLUSTER: u16 = 0x0000;
const BASIC_ATTR_MANUFACTURER_NAME: u16 = 0x0004;
const BASIC_ATTR_MODEL_ID: u16 = 0x0005;

/// #1 Entry point after construction and the universal re-evaluation sink.
pub(super) fn init(machine: &mut DeviceMachine, event: &Event, ctx: &mut DeviceContext<'_>) {
    if event.kind() != EventKind::AttrLastSeen {
        tracing::debug!(
            "device {} init event {:?}/{}",
            machine.key(),
            event.kind(),
            event.resource()
        );
    }

    if event.kind() == EventKind::StateEnter {
        // Whatever was in flight belongs to a previous life of the chain;
        // its confirm will no longer match.
        machine.zdp_in_flight = TransportResult::default();

        if machine.key().value() & COORDINATOR_VENDOR_BITS == COORDINATOR_VENDOR_BITS {
            machine.resolve_node(ctx.registry);
            let is_coordinator = machine
                .node(ctx.registry)
                .map_or(false, |node| node.nwk_address() == 0x0000);
            if is_coordinator {
                machine.set_state(Some(MachineState::Dead), StateLevel::Main, ctx);
                return;
            }
        }
    }

    if matches!(
        event.kind(),
        EventKind::Poll
            | EventKind::Awake
            | EventKind::ConfigReachable
            | EventKind::StateReachable
            | EventKind::StateTimeout
            | EventKind::AttrLastUpdated
    ) {
        if machine.node(ctx.registry).is_none() {
            machine.resolve_node(ctx.registry);
        }

        if let Some(node) = machine.node(ctx.registry) {
            let (ext, nwk) = (node.ext_address(), node.nwk_address());
            machine.set_item_value(resource::ATTR_EXT_ADDRESS, Value::UInt(ext));
            machine.set_item_value(resource::ATTR_NWK_ADDRESS, Value::UInt(u64::from(nwk)));

            // Got a node, jump to verification.
            if node.node_descriptor().is_some() || machine.reachable(ctx.registry) {
                machine.set_state(Some(MachineState::NodeDescriptor), StateLevel::Main, ctx);
            }
        } else {
            tracing::debug!("device {} init: no node found", machine.key());

            if machine.key().value() & GREEN_POWER_KEY_MASK == 0 {
                // Green-power-only node; nothing to discover over ZDP.
                machine.set_state(Some(MachineState::Dead), StateLevel::Main, ctx);
            }
        }
    }
}

fn zdp_confirm_failed(machine: &DeviceMachine, event: &Event) -> bool {
    debug_assert_eq!(event.device_key(), machine.key());
    machine.zdp_in_flight.request_id == event.aps_confirm_id()
        && event.aps_confirm_status() != APS_SUCCESS
}

/// #2 Ensures a ZDP node descriptor is known.
pub(super) fn node_descriptor(
    machine: &mut DeviceMachine,
    event: &Event,
    ctx: &mut DeviceContext<'_>,
) {
    match event.kind() {
        EventKind::StateEnter => {
            let Some(node) = machine.node(ctx.registry) else {
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
                return;
            };
            if node.node_descriptor().is_some() {
                tracing::debug!("device {} node descriptor verified", machine.key());
                machine.set_state(Some(MachineState::ActiveEndpoints), StateLevel::Main, ctx);
            } else if !machine.reachable(ctx.registry) {
                // Can't be queried now, go back to #1.
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            } else {
                let (_, nwk) = machine.addresses();
                machine.zdp_in_flight = ctx.transport.zdp_node_descriptor_req(nwk);
                if machine.zdp_in_flight.enqueued {
                    machine.start_timer(StateLevel::Main, MIN_MAC_POLL_RX_ON);
                } else {
                    machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
                }
            }
        }
        EventKind::ApsConfirm => {
            if zdp_confirm_failed(machine, event) {
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            }
        }
        EventKind::NodeDescriptor => {
            machine.stop_timer(StateLevel::Main);
            machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            ctx.queue.push(Event::new(
                RESOURCE_DEVICES,
                EventKind::Awake,
                0,
                machine.key(),
            ));
        }
        EventKind::StateTimeout => {
            tracing::debug!("device {} node descriptor read timed out", machine.key());
            machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
        }
        _ => {}
    }
}

/// #3 Ensures the active endpoint list is known.
pub(super) fn active_endpoints(
    machine: &mut DeviceMachine,
    event: &Event,
    ctx: &mut DeviceContext<'_>,
) {
    match event.kind() {
        EventKind::StateEnter => {
            let Some(node) = machine.node(ctx.registry) else {
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
                return;
            };
            if !node.endpoints().is_empty() {
                tracing::debug!("device {} active endpoints verified", machine.key());
                machine.set_state(Some(MachineState::SimpleDescriptor), StateLevel::Main, ctx);
            } else if !machine.reachable(ctx.registry) {
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            } else {
                let (_, nwk) = machine.addresses();
                machine.zdp_in_flight = ctx.transport.zdp_active_endpoints_req(nwk);
                if machine.zdp_in_flight.enqueued {
                    machine.start_timer(StateLevel::Main, MIN_MAC_POLL_RX_ON);
                } else {
                    machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
                }
            }
        }
        EventKind::ApsConfirm => {
            if zdp_confirm_failed(machine, event) {
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            }
        }
        EventKind::ActiveEndpoints => {
            machine.stop_timer(StateLevel::Main);
            machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            ctx.queue.push(Event::new(
                RESOURCE_DEVICES,
                EventKind::Awake,
                0,
                machine.key(),
            ));
        }
        EventKind::StateTimeout => {
            tracing::debug!("device {} active endpoints read timed out", machine.key());
            machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
        }
        _ => {}
    }
}

/// #4 Ensures every active endpoint has a valid simple descriptor.
pub(super) fn simple_descriptor(
    machine: &mut DeviceMachine,
    event: &Event,
    ctx: &mut DeviceContext<'_>,
) {
    match event.kind() {
        EventKind::StateEnter => {
            let Some(node) = machine.node(ctx.registry) else {
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
                return;
            };

            let need_fetch = node.endpoints().iter().copied().find(|&endpoint| {
                node.simple_descriptor(endpoint)
                    .map_or(true, |sd| !sd.is_valid())
            });

            match need_fetch {
                None => {
                    tracing::debug!("device {} simple descriptors verified", machine.key());
                    machine.set_state(Some(MachineState::BasicCluster), StateLevel::Main, ctx);
                }
                Some(_) if !machine.reachable(ctx.registry) => {
                    machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
                }
                Some(endpoint) => {
                    let (_, nwk) = machine.addresses();
                    machine.zdp_in_flight = ctx.transport.zdp_simple_descriptor_req(nwk, endpoint);
                    if machine.zdp_in_flight.enqueued {
                        machine.start_timer(StateLevel::Main, MIN_MAC_POLL_RX_ON);
                    } else {
                        machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
                    }
                }
            }
        }
        EventKind::ApsConfirm => {
            if zdp_confirm_failed(machine, event) {
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            }
        }
        EventKind::SimpleDescriptor => {
            machine.stop_timer(StateLevel::Main);
            machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            ctx.queue.push(Event::new(
                RESOURCE_DEVICES,
                EventKind::Awake,
                0,
                machine.key(),
            ));
        }
        EventKind::StateTimeout => {
            tracing::debug!("device {} simple descriptor read timed out", machine.key());
            machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
        }
        _ => {}
    }
}

/// Try to populate a device item from any sub-device that already carries it.
fn fill_item_from_sub_devices(
    machine: &mut DeviceMachine,
    suffix: ItemSuffix,
    store: &dyn crate::resource::ResourceStore,
) -> bool {
    if machine.item(suffix).map_or(false, |item| item.is_set()) {
        return true;
    }

    let pairs = machine.sub_device_pairs().to_vec();
    for (unique_id, kind) in pairs {
        let Some(sub) = store.get(kind, &unique_id) else {
            continue;
        };
        let Some(sub_item) = sub.item(suffix) else {
            continue;
        };
        if !sub_item.is_set() {
            continue;
        }
        if let Some(value) = sub_item.value().cloned() {
            if machine.set_item_value(suffix, value) {
                return true;
            }
        }
    }
    false
}

/// Send a ZCL read for one basic-cluster attribute towards the endpoint
/// advertising the cluster on its server side.
fn zcl_read(
    machine: &mut DeviceMachine,
    cluster_id: u16,
    attribute_id: u16,
    ctx: &mut DeviceContext<'_>,
) -> bool {
    if !machine.reachable(ctx.registry) {
        tracing::debug!("device {} not reachable, skipping read", machine.key());
        return false;
    }

    let Some(node) = machine.node(ctx.registry) else {
        return false;
    };
    let Some(sd) = node.simple_descriptor_for_server_cluster(cluster_id) else {
        tracing::debug!(
            "device {} has no endpoint serving cluster 0x{:04X}",
            machine.key(),
            cluster_id
        );
        return false;
    };

    let param = ZclReadParam {
        endpoint: sd.endpoint,
        cluster_id,
        attribute_ids: vec![attribute_id],
        manufacturer_code: 0,
    };
    let (ext, nwk) = machine.addresses();
    machine.read_in_flight = ctx.transport.zcl_read_attributes(&param, ext, nwk);
    machine.read_in_flight.enqueued
}

/// #5 Reads the identifying basic-cluster attributes needed to match a
/// device description: manufacturer name and model id, in that order.
///
/// Each item is first populated from a sub-device that already has it; only
/// when unavailable is a read issued. One outstanding read at a time; the
/// response re-enters `Init`, and re-entry here finds the item set.
pub(super) fn basic_cluster(
    machine: &mut DeviceMachine,
    event: &Event,
    ctx: &mut DeviceContext<'_>,
) {
    const ITEMS: [(ItemSuffix, u16, u16); 2] = [
        (
            resource::ATTR_MANUFACTURER_NAME,
            BASIC_CLUSTER,
            BASIC_ATTR_MANUFACTURER_NAME,
        ),
        (resource::ATTR_MODEL_ID, BASIC_CLUSTER, BASIC_ATTR_MODEL_ID),
    ];

    match event.kind() {
        EventKind::StateEnter => {
            let mut populated = 0;

            for (suffix, cluster_id, attribute_id) in ITEMS {
                if fill_item_from_sub_devices(machine, suffix, &*ctx.store) {
                    populated += 1;
                    continue;
                }

                if zcl_read(machine, cluster_id, attribute_id, ctx) {
                    machine.start_timer(StateLevel::Main, MIN_MAC_POLL_RX_ON);
                    return; // keep state, wait for the response or timeout
                }

                tracing::debug!("device {} failed to read {}", machine.key(), suffix);
                break;
            }

            if populated != ITEMS.len() {
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            } else {
                tracing::debug!(
                    "device {} model id: {}",
                    machine.key(),
                    machine
                        .item(resource::ATTR_MODEL_ID)
                        .map_or("", |item| item.to_str())
                );
                machine.set_state(Some(MachineState::GetDdf), StateLevel::Main, ctx);
            }
        }
        EventKind::ApsConfirm => {
            debug_assert_eq!(event.device_key(), machine.key());
            if machine.read_in_flight.request_id == event.aps_confirm_id()
                && event.aps_confirm_status() != APS_SUCCESS
            {
                machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            }
        }
        EventKind::AttrManufacturerName | EventKind::AttrModelId => {
            tracing::debug!("device {} received {:?}", machine.key(), event.kind());
            machine.stop_timer(StateLevel::Main);
            machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
            ctx.queue.push(Event::new(
                RESOURCE_DEVICES,
                EventKind::Awake,
                0,
                machine.key(),
            ));
        }
        EventKind::StateTimeout => {
            tracing::debug!("device {} basic cluster read timed out", machine.key());
            machine.set_state(Some(MachineState::Init), StateLevel::Main, ctx);
        }
        _ => {}
    }
}

/// #6 Bridge to the external DDF engine.
///
/// The engine matches the identity attributes against its description files
/// asynchronously; a positive response means the device was initialized and
/// the machine can go operational.
pub(super) fn get_ddf(machine: &mut DeviceMachine, event: &Event, ctx: &mut DeviceContext<'_>) {
    match event.kind() {
        EventKind::StateEnter => {
            ctx.queue.push(Event::new(
                RESOURCE_DEVICES,
                EventKind::DdfInitRequest,
                0,
                machine.key(),
            ));
        }
        EventKind::DdfInitResponse => {
            if event.num() == 1 {
                machine.set_state(Some(MachineState::Idle), StateLevel::Main, ctx);
            } else {
                machine.set_state(Some(MachineState::Dead), StateLevel::Main, ctx);
            }
        }
        _ => {}
    }
}

/// #8 Terminal state: consumes events and remains. The outer system must
/// destroy the machine to restart handling.
pub(super) fn dead(machine: &mut DeviceMachine, event: &Event, _ctx: &mut DeviceContext<'_>) {
    if event.kind() == EventKind::StateEnter {
        tracing::debug!("device {} entered dead state", machine.key());
    }
}
