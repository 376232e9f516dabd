//! End-to-end lifecycle scenarios: one device machine driven through
//! discovery, DDF hand-over, polling and the binding audit against mock
//! collaborators.

mod helpers;

use std::time::Duration;

use harness::{Harness, SentRequest};
use zigbee_device_runtime::prelude::*;
use zigbee_device_runtime::resource::{
    ATTR_MANUFACTURER_NAME, ATTR_MODEL_ID, STATE_REACHABLE,
};

const KEY: u64 = 0x00212E0000ABCDEF;
const NWK: u16 = 0x4001;

fn key() -> DeviceKey {
    DeviceKey::new(KEY)
}

fn device_event(kind: EventKind, num: i64, key: DeviceKey) -> Event {
    Event::new(RESOURCE_DEVICES, kind, num, key)
}

/// A sub-device already carrying the identity attributes, so the basic
/// cluster stage populates the device by copy instead of reading.
fn identified_sub(unique_id: &str) -> Resource {
    let mut sub = Resource::new(ResourceKind::Sensors, unique_id);
    sub.add_item(ATTR_MANUFACTURER_NAME)
        .set_value(Value::Str("acme".into()));
    sub.add_item(ATTR_MODEL_ID)
        .set_value(Value::Str("acme.widget".into()));
    sub
}

/// Create the machine and walk ZDP discovery until the active-endpoints
/// request is outstanding.
fn discover_until_active_endpoints(h: &mut Harness, key: DeviceKey) {
    h.create(key);
    h.registry.insert(key, Node::new(key.value(), NWK));
    h.awake(key);
    h.drive();
    assert_eq!(
        h.transport.sent.last(),
        Some(&SentRequest::NodeDescriptor { nwk: NWK })
    );

    h.registry.node_mut(key).set_node_descriptor(NodeDescriptor {
        receiver_on_when_idle: false,
        manufacturer_code: 0x115F,
    });
    h.push(device_event(EventKind::NodeDescriptor, 0, key));
    h.drive();
    assert_eq!(
        h.transport.sent.last(),
        Some(&SentRequest::ActiveEndpoints { nwk: NWK })
    );
    assert_eq!(
        h.state(key, StateLevel::Main),
        Some(MachineState::ActiveEndpoints)
    );
}

/// Continue discovery through the DDF hand-over into Idle. Assumes the
/// identity attributes are copyable from a registered sub-device.
fn discover_to_idle(h: &mut Harness, key: DeviceKey) {
    discover_until_active_endpoints(h, key);

    h.registry.node_mut(key).set_endpoints(vec![1]);
    h.push(device_event(EventKind::ActiveEndpoints, 0, key));
    h.drive();
    assert_eq!(
        h.transport.sent.last(),
        Some(&SentRequest::SimpleDescriptor {
            nwk: NWK,
            endpoint: 1
        })
    );

    h.registry.node_mut(key).add_simple_descriptor(SimpleDescriptor {
        endpoint: 1,
        profile_id: 0x0104,
        device_id: 0x0302,
        server_clusters: vec![0x0000, 0x0402, 0x0405],
        client_clusters: vec![],
    });
    h.push(device_event(EventKind::SimpleDescriptor, 0, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::GetDdf));

    h.push(device_event(EventKind::DdfInitResponse, 1, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::Idle));
}

/// Cold discovery happy path: unknown key to operational Idle with both
/// sub-machines installed, one prerequisite per round trip.
#[tokio::test(start_paused = true)]
async fn cold_discovery_happy_path() {
    helpers::configure_tracing();
    let key = key();
    let mut h = Harness::managed();
    h.create(key);

    // No node resolvable yet: the machine stays in Init and stays quiet.
    h.awake(key);
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::Init));
    assert!(h.transport.sent.is_empty());

    // The registry resolves a node with an empty descriptor.
    h.registry.insert(key, Node::new(key.value(), NWK));
    h.awake(key);
    h.drive();
    assert_eq!(
        h.transport.sent,
        vec![SentRequest::NodeDescriptor { nwk: NWK }]
    );

    h.registry.node_mut(key).set_node_descriptor(NodeDescriptor {
        receiver_on_when_idle: false,
        manufacturer_code: 0x115F,
    });
    h.push(device_event(EventKind::NodeDescriptor, 0, key));
    h.drive();
    assert_eq!(
        h.transport.sent.last(),
        Some(&SentRequest::ActiveEndpoints { nwk: NWK })
    );

    h.registry.node_mut(key).set_endpoints(vec![1]);
    h.push(device_event(EventKind::ActiveEndpoints, 0, key));
    h.drive();
    assert_eq!(
        h.transport.sent.last(),
        Some(&SentRequest::SimpleDescriptor {
            nwk: NWK,
            endpoint: 1
        })
    );

    h.registry.node_mut(key).add_simple_descriptor(SimpleDescriptor {
        endpoint: 1,
        profile_id: 0x0104,
        device_id: 0x0302,
        server_clusters: vec![0x0000],
        client_clusters: vec![],
    });
    h.push(device_event(EventKind::SimpleDescriptor, 0, key));
    h.drive();

    // Basic cluster: manufacturer name is read first, on the endpoint
    // serving cluster 0x0000.
    assert_eq!(
        h.state(key, StateLevel::Main),
        Some(MachineState::BasicCluster)
    );
    let read = h.transport.zcl_reads().last().cloned().cloned().unwrap();
    assert_eq!(read.endpoint, 1);
    assert_eq!(read.cluster_id, 0x0000);
    assert_eq!(read.attribute_ids, vec![0x0004]);

    // The parsed response sets the item; the change event drives the next
    // read.
    h.machine_mut(key)
        .set_item_value(ATTR_MANUFACTURER_NAME, Value::Str("acme".into()));
    h.push(device_event(EventKind::AttrManufacturerName, 0, key));
    h.drive();
    let read = h.transport.zcl_reads().last().cloned().cloned().unwrap();
    assert_eq!(read.attribute_ids, vec![0x0005]);

    h.machine_mut(key)
        .set_item_value(ATTR_MODEL_ID, Value::Str("acme.widget".into()));
    h.push(device_event(EventKind::AttrModelId, 0, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::GetDdf));

    // DDF matched and applied.
    h.push(device_event(EventKind::DdfInitResponse, 1, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::Idle));
    assert_eq!(
        h.state(key, StateLevel::Binding),
        Some(MachineState::Binding)
    );
    assert_eq!(h.state(key, StateLevel::Poll), Some(MachineState::PollIdle));
}

/// The coordinator's own key resolves with network address 0 and parks in
/// Dead without a single request.
#[tokio::test(start_paused = true)]
async fn coordinator_parks_in_dead() {
    helpers::configure_tracing();
    let key = DeviceKey::new(0x00212E0000000001);
    let mut h = Harness::managed();
    h.registry.insert(key, Node::new(key.value(), 0x0000));
    h.create(key);
    h.awake(key);
    h.drive();

    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::Dead));
    assert!(h.transport.sent.is_empty());
}

/// A DDF rejection is terminal as well.
#[tokio::test(start_paused = true)]
async fn ddf_rejection_parks_in_dead() {
    helpers::configure_tracing();
    let key = key();
    let mut h = Harness::managed();
    let uid = "00:21:2e:00:00:ab:cd:ef-01";
    h.create(key);
    h.store.resources.push(identified_sub(uid));
    h.machine_mut(key).add_sub_device(uid, ResourceKind::Sensors);

    discover_until_active_endpoints(&mut h, key);
    h.registry.node_mut(key).set_endpoints(vec![1]);
    h.push(device_event(EventKind::ActiveEndpoints, 0, key));
    h.drive();
    h.registry.node_mut(key).add_simple_descriptor(SimpleDescriptor {
        endpoint: 1,
        profile_id: 0x0104,
        device_id: 0x0302,
        server_clusters: vec![0x0000],
        client_clusters: vec![],
    });
    h.push(device_event(EventKind::SimpleDescriptor, 0, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::GetDdf));

    h.push(device_event(EventKind::DdfInitResponse, 0, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::Dead));
    assert_eq!(h.state(key, StateLevel::Binding), None);
    assert_eq!(h.state(key, StateLevel::Poll), None);
}

/// No answer within the poll window fires the state timeout back to Init; a
/// later wake-up repeats the request.
#[tokio::test(start_paused = true)]
async fn timeout_returns_to_init_and_awake_retries() {
    helpers::configure_tracing();
    let key = key();
    let mut h = Harness::managed();
    discover_until_active_endpoints(&mut h, key);

    let requests = |h: &Harness| {
        h.transport
            .count_of(|r| matches!(r, SentRequest::ActiveEndpoints { .. }))
    };
    assert_eq!(requests(&h), 1);

    tokio::time::advance(Duration::from_millis(8001)).await;
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::Init));
    assert_eq!(requests(&h), 1);

    h.awake(key);
    h.drive();
    assert_eq!(
        h.state(key, StateLevel::Main),
        Some(MachineState::ActiveEndpoints)
    );
    assert_eq!(requests(&h), 2);
}

/// Two pollable items are read in traversal order, each confirmed read is
/// removed, and the drained queue falls back to PollIdle. Fresh items are
/// not picked up by the next rebuild.
#[tokio::test(start_paused = true)]
async fn poll_success_then_quiescence() {
    helpers::configure_tracing();
    let key = key();
    let uid = "00:21:2e:00:00:ab:cd:ef-01";
    let mut h = Harness::managed();
    h.create(key);

    let mut sub = identified_sub(uid);
    sub.add_item("state/temperature")
        .set_refresh_interval(Duration::from_secs(60))
        .set_read_parameters(ReadRecipe::zcl_attr(1, 0x0402, vec![0x0000]));
    sub.add_item("state/humidity")
        .set_refresh_interval(Duration::from_secs(60))
        .set_read_parameters(ReadRecipe::zcl_attr(1, 0x0405, vec![0x0000]));
    h.store.resources.push(sub);
    h.machine_mut(key).add_sub_device(uid, ResourceKind::Sensors);

    discover_to_idle(&mut h, key);
    // Identity came from the sub-device: no ZCL traffic during discovery.
    assert!(h.transport.zcl_reads().is_empty());

    h.poll(key);
    h.drive();
    assert_eq!(h.state(key, StateLevel::Poll), Some(MachineState::PollBusy));
    let read = h.transport.zcl_reads().last().cloned().cloned().unwrap();
    assert_eq!(read.cluster_id, 0x0402, "temperature polled first");

    let first = h.transport.last_request_id();
    h.push(Event::aps_confirm(RESOURCE_DEVICES, first, 0x00, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Poll), Some(MachineState::PollBusy));
    let read = h.transport.zcl_reads().last().cloned().cloned().unwrap();
    assert_eq!(read.cluster_id, 0x0405, "humidity polled second");

    let second = h.transport.last_request_id();
    h.push(Event::aps_confirm(RESOURCE_DEVICES, second, 0x00, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Poll), Some(MachineState::PollIdle));
    assert_eq!(h.transport.zcl_reads().len(), 2);

    // Parsed reports land in the store; a rebuild right after finds nothing
    // stale.
    let sub = h.store.resource_mut(ResourceKind::Sensors, uid);
    sub.item_mut("state/temperature")
        .unwrap()
        .set_value(Value::UInt(2150));
    sub.item_mut("state/humidity")
        .unwrap()
        .set_value(Value::UInt(4870));

    h.poll(key);
    h.drive();
    assert_eq!(h.state(key, StateLevel::Poll), Some(MachineState::PollIdle));
    assert_eq!(h.transport.zcl_reads().len(), 2, "no re-poll of fresh items");
}

/// An item whose read never enqueues is retried three times and then
/// dropped without any confirmation.
#[tokio::test(start_paused = true)]
async fn poll_retry_exhaustion_drops_item() {
    helpers::configure_tracing();
    let key = key();
    let uid = "00:21:2e:00:00:ab:cd:ef-01";
    let mut h = Harness::managed();
    h.create(key);

    let mut sub = identified_sub(uid);
    sub.add_item("state/temperature")
        .set_refresh_interval(Duration::from_secs(60))
        .set_read_parameters(ReadRecipe::zcl_attr(1, 0x0402, vec![0x0000]));
    h.store.resources.push(sub);
    h.machine_mut(key).add_sub_device(uid, ResourceKind::Sensors);

    discover_to_idle(&mut h, key);

    // Keep the device reachable across the retry windows.
    h.machine_mut(key)
        .set_item_value(STATE_REACHABLE, Value::Bool(true));
    h.transport.accept = false;

    h.poll(key);
    h.drive();
    assert_eq!(h.state(key, StateLevel::Poll), Some(MachineState::PollNext));
    assert_eq!(h.transport.zcl_reads().len(), 1);

    tokio::time::advance(Duration::from_millis(8001)).await;
    h.drive();
    assert_eq!(h.transport.zcl_reads().len(), 2);

    tokio::time::advance(Duration::from_millis(8001)).await;
    h.drive();
    assert_eq!(h.transport.zcl_reads().len(), 3, "third attempt drops the item");

    tokio::time::advance(Duration::from_millis(8001)).await;
    h.drive();
    assert_eq!(h.state(key, StateLevel::Poll), Some(MachineState::PollIdle));
    assert_eq!(h.transport.zcl_reads().len(), 3, "no fourth attempt");
}

/// The binding walk runs on the first wake-up, is suppressed inside the
/// five-minute window and runs again after it.
#[tokio::test(start_paused = true)]
async fn binding_audit_respects_cadence() {
    helpers::configure_tracing();
    let key = key();
    let uid = "00:21:2e:00:00:ab:cd:ef-01";
    let mut h = Harness::managed();
    h.create(key);
    h.store.resources.push(identified_sub(uid));
    h.machine_mut(key).add_sub_device(uid, ResourceKind::Sensors);

    discover_to_idle(&mut h, key);
    assert!(h.machine(key).binding_verified_at().is_none());

    let node = h.registry.node_mut(key);
    node.add_binding(BindingEntry {
        src_address: key.value(),
        cluster_id: 0x0006,
        destination: BindingDestination::Extended {
            address: 0x00212E0000C0FFEE,
            endpoint: 1,
        },
        confirmed_at: None,
    });
    node.add_binding(BindingEntry {
        src_address: key.value(),
        cluster_id: 0x0008,
        destination: BindingDestination::Group(0x0002),
        confirmed_at: None,
    });

    h.awake(key);
    h.drive();
    let first = h
        .machine(key)
        .binding_verified_at()
        .expect("first walk completed");

    // Within the window: wake-ups do not restart the walk.
    tokio::time::advance(Duration::from_secs(60)).await;
    h.awake(key);
    h.drive();
    assert_eq!(h.machine(key).binding_verified_at(), Some(first));

    // Past the window: a new walk runs.
    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    h.awake(key);
    h.drive();
    let second = h
        .machine(key)
        .binding_verified_at()
        .expect("second walk completed");
    assert!(second > first);
}

/// A binding-table status event updates Mgmt_Bind support tracking.
#[tokio::test(start_paused = true)]
async fn binding_table_status_tracks_support() {
    helpers::configure_tracing();
    let key = key();
    let uid = "00:21:2e:00:00:ab:cd:ef-01";
    let mut h = Harness::managed();
    h.create(key);
    h.store.resources.push(identified_sub(uid));
    h.machine_mut(key).add_sub_device(uid, ResourceKind::Sensors);
    discover_to_idle(&mut h, key);

    assert!(!h.machine(key).mgmt_bind_supported());
    h.push(device_event(EventKind::BindingTable, 0x00, key));
    h.drive();
    assert!(h.machine(key).mgmt_bind_supported());

    h.push(device_event(EventKind::BindingTable, 0x84, key));
    h.drive();
    assert!(!h.machine(key).mgmt_bind_supported());
}

/// Re-running discovery over a fully discovered, reachable node advances
/// straight back to Idle without touching the transport.
#[tokio::test(start_paused = true)]
async fn rediscovery_issues_no_requests() {
    helpers::configure_tracing();
    let key = key();
    let uid = "00:21:2e:00:00:ab:cd:ef-01";
    let mut h = Harness::managed();
    h.create(key);
    h.store.resources.push(identified_sub(uid));
    h.machine_mut(key).add_sub_device(uid, ResourceKind::Sensors);
    discover_to_idle(&mut h, key);

    let sent_before = h.transport.sent.len();

    // A description reload tears Idle down and re-runs the chain.
    h.push(device_event(EventKind::DdfReload, 0, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::Init));
    assert_eq!(h.state(key, StateLevel::Binding), None);
    assert_eq!(h.state(key, StateLevel::Poll), None);

    h.awake(key);
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::GetDdf));

    h.push(device_event(EventKind::DdfInitResponse, 1, key));
    h.drive();
    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::Idle));
    assert_eq!(h.transport.sent.len(), sent_before, "everything was cached");
}

/// A pending state change is driven by device activity: the wake-up ticks a
/// verification read, the matching item event marks it satisfied, and the
/// settled change is swept.
#[tokio::test(start_paused = true)]
async fn state_change_verified_and_swept() {
    use zigbee_device_runtime::StateChange;

    helpers::configure_tracing();
    let key = key();
    let uid = "00:21:2e:00:00:ab:cd:ef-01";
    let mut h = Harness::managed();
    h.create(key);

    let mut sub = identified_sub(uid);
    sub.set_device_address(key.value(), NWK);
    sub.add_item(STATE_REACHABLE)
        .set_read_parameters(ReadRecipe::zcl_attr(1, 0x0000, vec![0x0000]));
    sub.add_state_change(StateChange::new(STATE_REACHABLE, Value::Bool(true)));
    h.store.resources.push(sub);
    h.machine_mut(key).add_sub_device(uid, ResourceKind::Sensors);

    discover_to_idle(&mut h, key);
    let reads_before = h.transport.zcl_reads().len();

    // Activity ticks the pending change: one verification read goes out.
    h.awake(key);
    h.drive();
    assert_eq!(h.transport.zcl_reads().len(), reads_before + 1);
    assert_eq!(
        h.store
            .resource_mut(ResourceKind::Sensors, uid)
            .state_changes()
            .len(),
        1
    );

    // The item catches up; the matching change event settles and sweeps it.
    h.store
        .resource_mut(ResourceKind::Sensors, uid)
        .item_mut(STATE_REACHABLE)
        .unwrap()
        .set_value(Value::Bool(true));
    h.push(Event::with_id(
        RESOURCE_SENSORS,
        EventKind::StateReachable,
        uid,
        0,
        key,
    ));
    h.drive();
    assert!(h
        .store
        .resource_mut(ResourceKind::Sensors, uid)
        .state_changes()
        .is_empty());
}

/// An unmanaged machine is never routed to and never acts.
#[tokio::test(start_paused = true)]
async fn unmanaged_machine_stays_inert() {
    helpers::configure_tracing();
    let key = key();
    let mut h = Harness {
        event_loop: MachineEventLoop::new(MachineConfig::default()),
        transport: harness::RecordingTransport::new(),
        registry: harness::TestRegistry::default(),
        store: harness::TestStore::default(),
    };
    h.registry.insert(key, Node::new(key.value(), NWK));
    h.create(key);
    h.awake(key);
    h.drive();

    assert_eq!(h.state(key, StateLevel::Main), Some(MachineState::Init));
    assert!(h.transport.sent.is_empty());
}
