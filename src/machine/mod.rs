//! # Device State Machine (Kernel)
//!
//! One [`DeviceMachine`] per physical device, organized as a small stack of
//! concurrent handler levels:
//!
//! | Level | Occupant |
//! |-------|----------|
//! | 0 | primary lifecycle: `Init` → … → `Idle` (or `Dead`) |
//! | 1 | binding-table audit, only while level 0 is `Idle` |
//! | 2 | attribute polling, only while level 0 is `Idle` |
//!
//! ## Transition contract
//!
//! `set_state` delivers `StateLeave` to the outgoing handler inline, then
//! enqueues `StateEnter` as an event for the new one. `StateLeave` for H is
//! therefore always observed strictly before `StateEnter` for H′, and a
//! handler's own transition can never recurse into itself. `StateEnter` is
//! the only way a handler learns it was entered; it must not assume any
//! previous state.
//!
//! ## Timers
//!
//! One single-shot timer per level. Expiry produces a `StateTimeout` event
//! routed to that level only. Each timer carries an epoch incremented on
//! every arm/cancel; expiries whose epoch no longer matches are discarded on
//! delivery, so a late expiry can never reach the wrong handler. The kernel
//! cancels a level's timer on every transition away from its handler.
//!
//! ## Handler dispatch
//!
//! States are a closed enum and dispatch is one `match`; the set of legal
//! transitions is statically visible in the handler modules
//! ([`discovery`](self), idle, binding, poll).

mod binding;
mod discovery;
mod idle;
mod poll;

use tokio::time::Instant;

use crate::config::{MachineConfig, LAST_AWAKE_FALLBACK, MIN_MAC_POLL_RX_ON};
use crate::event::{Event, EventKind, EventQueue};
use crate::node::{Node, NodeRegistry};
use crate::resource::{
    self, generate_unique_id, ItemSuffix, ReadRecipe, Resource, ResourceItem, ResourceKind,
    ResourceStore, Value, RESOURCE_DEVICES,
};
use crate::transport::{TransportController, TransportResult};
use crate::{DeviceKey, StateLevel, STATE_LEVEL_COUNT};

// ============================================================================
// STATES
// ============================================================================

/// All handler states, across every level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    /// Entry point and universal re-evaluation sink (level 0).
    Init,
    /// Ensures the ZDP node descriptor exists (level 0).
    NodeDescriptor,
    /// Ensures the active endpoint list exists (level 0).
    ActiveEndpoints,
    /// Ensures every endpoint has a valid simple descriptor (level 0).
    SimpleDescriptor,
    /// Reads the identifying basic-cluster attributes (level 0).
    BasicCluster,
    /// Bridges to the external DDF engine (level 0).
    GetDdf,
    /// Operational steady state hosting the sub-machines (level 0).
    Idle,
    /// Terminal state; consumes events forever (level 0).
    Dead,
    /// Waits for the next binding verification window (level 1).
    Binding,
    /// Walks the binding table entry by entry (level 1).
    BindingTableVerify,
    /// Waits for a poll trigger (level 2).
    PollIdle,
    /// Starts the read for the next queued poll item (level 2).
    PollNext,
    /// Waits for the confirm of an outstanding poll read (level 2).
    PollBusy,
}

// ============================================================================
// CONTEXT
// ============================================================================

/// Collaborator access handed into every dispatch.
///
/// The machine owns none of these; the outer system decides their lifetimes.
pub struct DeviceContext<'a> {
    pub transport: &'a mut dyn TransportController,
    pub registry: &'a dyn NodeRegistry,
    pub store: &'a mut dyn ResourceStore,
    /// FIFO the machine emits synthetic events into.
    pub queue: &'a mut EventQueue,
}

// ============================================================================
// INTERNAL BOOKKEEPING
// ============================================================================

#[derive(Debug, Default)]
struct TimerSlot {
    deadline: Option<Instant>,
    epoch: u64,
}

/// One queued attribute read.
///
/// Holds `(kind, unique id, suffix)` instead of references; the resource is
/// re-resolved through the store when the item is polled, so a sub-device
/// deleted mid-queue simply fails its read.
#[derive(Debug, Clone)]
pub(crate) struct PollItem {
    pub kind: ResourceKind,
    pub unique_id: String,
    pub suffix: ItemSuffix,
    pub recipe: ReadRecipe,
    pub retry: u8,
}

/// Context of the binding sub-machine.
#[derive(Debug, Default)]
pub(crate) struct BindingContext {
    /// Completion instant of the last full walk, `None` before the first.
    pub verified_at: Option<Instant>,
    /// Walk position into the node's binding table.
    pub iter: usize,
    /// Whether the node answers Mgmt_Bind requests.
    pub mgmt_bind_supported: bool,
}

// ============================================================================
// DEVICE MACHINE
// ============================================================================

/// Per-device lifecycle state machine.
pub struct DeviceMachine {
    key: DeviceKey,
    managed: bool,
    state: [Option<MachineState>; STATE_LEVEL_COUNT],
    timers: [TimerSlot; STATE_LEVEL_COUNT],
    /// Instant the device was last observed awake.
    awake: Option<Instant>,
    /// Whether the node registry ever resolved this key.
    node_resolved: bool,
    /// `(unique id, kind)` pairs; append-only, resolved on demand.
    sub_devices: Vec<(String, ResourceKind)>,
    /// Outstanding network-service request.
    pub(crate) zdp_in_flight: TransportResult,
    /// Outstanding attribute read.
    pub(crate) read_in_flight: TransportResult,
    /// LIFO-consumed poll queue.
    pub(crate) poll_queue: Vec<PollItem>,
    pub(crate) binding: BindingContext,
    /// The device's own attribute items.
    items: Resource,
}

impl DeviceMachine {
    /// Construct a machine in `Init` with its canonical item set.
    pub fn new(key: DeviceKey, config: &MachineConfig) -> Self {
        let mut items = Resource::new(ResourceKind::Devices, generate_unique_id(key, 0, 0));
        items.add_item(resource::STATE_REACHABLE);
        items.add_item(resource::ATTR_SLEEPER);
        items.add_item(resource::ATTR_EXT_ADDRESS);
        items.add_item(resource::ATTR_NWK_ADDRESS);
        items.add_item(resource::ATTR_MANUFACTURER_NAME);
        items.add_item(resource::ATTR_MODEL_ID);

        let mut state = [None; STATE_LEVEL_COUNT];
        state[StateLevel::Main.index()] = Some(MachineState::Init);

        Self {
            key,
            managed: config.managed,
            state,
            timers: Default::default(),
            awake: None,
            node_resolved: false,
            sub_devices: Vec::new(),
            zdp_in_flight: TransportResult::default(),
            read_in_flight: TransportResult::default(),
            poll_queue: Vec::new(),
            binding: BindingContext::default(),
            items,
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    /// Whether the state machine handles this device at all. Unmanaged
    /// machines stay inert; the legacy path owns the device.
    pub fn managed(&self) -> bool {
        self.managed
    }

    /// Current handler at a level, `None` when the level is vacant.
    pub fn state(&self, level: StateLevel) -> Option<MachineState> {
        self.state[level.index()]
    }

    pub fn item(&self, suffix: ItemSuffix) -> Option<&ResourceItem> {
        self.items.item(suffix)
    }

    pub fn item_mut(&mut self, suffix: ItemSuffix) -> Option<&mut ResourceItem> {
        self.items.item_mut(suffix)
    }

    /// Set one of the device's own items; false on type mismatch or unknown
    /// suffix.
    pub fn set_item_value(&mut self, suffix: ItemSuffix, value: Value) -> bool {
        self.items
            .item_mut(suffix)
            .map_or(false, |item| item.set_value(value))
    }

    /// Canonical addresses copied from the resolved node.
    pub(crate) fn addresses(&self) -> (u64, u16) {
        (
            self.items.item(resource::ATTR_EXT_ADDRESS).map_or(0, ResourceItem::to_u64),
            self.items.item(resource::ATTR_NWK_ADDRESS).map_or(0, ResourceItem::to_u64) as u16,
        )
    }

    // ------------------------------------------------------------------
    // Sub-devices
    // ------------------------------------------------------------------

    /// Register a sub-device. Append-only; duplicates by unique id are
    /// ignored. Removal is the store collaborator's business.
    pub fn add_sub_device(&mut self, unique_id: impl Into<String>, kind: ResourceKind) {
        let unique_id = unique_id.into();
        if self.sub_devices.iter().any(|(uid, _)| *uid == unique_id) {
            return;
        }
        self.sub_devices.push((unique_id, kind));
    }

    pub(crate) fn sub_device_pairs(&self) -> &[(String, ResourceKind)] {
        &self.sub_devices
    }

    /// Resolve all registered sub-devices, dropping any the store no longer
    /// knows.
    pub fn sub_devices<'s>(&self, store: &'s dyn ResourceStore) -> Vec<&'s Resource> {
        self.sub_devices
            .iter()
            .filter_map(|(uid, kind)| store.get(*kind, uid))
            .collect()
    }

    /// Find the sub-device whose `attr/uniqueid` or `attr/id` matches
    /// `identifier`, optionally narrowed by resource prefix.
    pub(crate) fn sub_device_key(
        &self,
        prefix: &str,
        identifier: &str,
        store: &dyn ResourceStore,
    ) -> Option<(ResourceKind, String)> {
        for (uid, kind) in &self.sub_devices {
            if !prefix.is_empty() && kind.prefix() != prefix {
                continue;
            }
            let Some(sub) = store.get(*kind, uid) else {
                continue;
            };
            let id_matches = sub
                .item(resource::ATTR_ID)
                .map_or(false, |i| i.to_str() == identifier);
            if sub.unique_id() == identifier || id_matches {
                return Some((*kind, uid.clone()));
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Node resolution
    // ------------------------------------------------------------------

    /// The registry node, once resolved. Looked up on every access so a
    /// deleted node is observed as absent rather than dangling.
    pub fn node<'r>(&self, registry: &'r dyn NodeRegistry) -> Option<&'r Node> {
        if self.node_resolved {
            registry.lookup(self.key)
        } else {
            None
        }
    }

    pub(crate) fn resolve_node(&mut self, registry: &dyn NodeRegistry) -> bool {
        if !self.node_resolved && registry.lookup(self.key).is_some() {
            self.node_resolved = true;
        }
        self.node_resolved
    }

    // ------------------------------------------------------------------
    // Binding audit observability
    // ------------------------------------------------------------------

    /// Completion instant of the last full binding-table walk.
    pub fn binding_verified_at(&self) -> Option<Instant> {
        self.binding.verified_at
    }

    /// Whether the node was observed answering Mgmt_Bind requests.
    pub fn mgmt_bind_supported(&self) -> bool {
        self.binding.mgmt_bind_supported
    }

    // ------------------------------------------------------------------
    // Reachability
    // ------------------------------------------------------------------

    /// Time since the device was last observed awake, or a large fallback
    /// when it never was.
    pub fn last_awake_elapsed(&self) -> std::time::Duration {
        self.awake.map_or(LAST_AWAKE_FALLBACK, |t| t.elapsed())
    }

    /// Reachability read-model over the device items plus `last awake`.
    ///
    /// Recently heard devices are reachable regardless of attributes; mains
    /// powered nodes (receiver on while idle) and declared non-sleepers
    /// report their `state/reachable` item; anything else is a sleeping
    /// endpoint that was not heard recently.
    pub fn reachable(&self, registry: &dyn NodeRegistry) -> bool {
        if self.last_awake_elapsed() < MIN_MAC_POLL_RX_ON {
            return true;
        }
        if let Some(node) = self.node(registry) {
            if let Some(descriptor) = node.node_descriptor() {
                if descriptor.receiver_on_when_idle {
                    return self
                        .items
                        .item(resource::STATE_REACHABLE)
                        .map_or(false, ResourceItem::to_bool);
                }
            }
        }
        if !self
            .items
            .item(resource::ATTR_SLEEPER)
            .map_or(false, ResourceItem::to_bool)
        {
            return self
                .items
                .item(resource::STATE_REACHABLE)
                .map_or(false, ResourceItem::to_bool);
        }
        false
    }

    // ------------------------------------------------------------------
    // Kernel: dispatch, transitions, timers
    // ------------------------------------------------------------------

    /// Route one event into the machine.
    ///
    /// `StateEnter`, `StateLeave` and `StateTimeout` are routed by the level
    /// in their payload, never by `level`; everything else goes to the
    /// handler at `level`. Dispatch at level 0 also refreshes the awake
    /// instant on `Awake`.
    pub fn handle_event(&mut self, event: &Event, level: StateLevel, ctx: &mut DeviceContext<'_>) {
        match event.kind() {
            EventKind::StateEnter | EventKind::StateLeave => {
                let Some(target) = StateLevel::from_index(event.num()) else {
                    tracing::warn!(
                        "device {} dropping {:?} with invalid level {}",
                        self.key,
                        event.kind(),
                        event.num()
                    );
                    return;
                };
                if let Some(state) = self.state[target.index()] {
                    self.run_handler(state, event, ctx);
                }
            }
            EventKind::StateTimeout => {
                let Some(target) = StateLevel::from_index(event.num()) else {
                    tracing::warn!(
                        "device {} dropping timeout with invalid level {}",
                        self.key,
                        event.num()
                    );
                    return;
                };
                if event.timer_epoch() != self.timers[target.index()].epoch {
                    tracing::trace!(
                        "device {} discarding stale timeout for level {:?}",
                        self.key,
                        target
                    );
                    return;
                }
                if let Some(state) = self.state[target.index()] {
                    self.run_handler(state, event, ctx);
                }
            }
            _ => {
                if let Some(state) = self.state[level.index()] {
                    if event.kind() == EventKind::Awake && level == StateLevel::Main {
                        self.awake = Some(Instant::now());
                    }
                    self.run_handler(state, event, ctx);
                }
            }
        }
    }

    fn run_handler(&mut self, state: MachineState, event: &Event, ctx: &mut DeviceContext<'_>) {
        match state {
            MachineState::Init => discovery::init(self, event, ctx),
            MachineState::NodeDescriptor => discovery::node_descriptor(self, event, ctx),
            MachineState::ActiveEndpoints => discovery::active_endpoints(self, event, ctx),
            MachineState::SimpleDescriptor => discovery::simple_descriptor(self, event, ctx),
            MachineState::BasicCluster => discovery::basic_cluster(self, event, ctx),
            MachineState::GetDdf => discovery::get_ddf(self, event, ctx),
            MachineState::Idle => idle::idle(self, event, ctx),
            MachineState::Dead => discovery::dead(self, event, ctx),
            MachineState::Binding => binding::binding(self, event, ctx),
            MachineState::BindingTableVerify => binding::binding_table_verify(self, event, ctx),
            MachineState::PollIdle => poll::poll_idle(self, event, ctx),
            MachineState::PollNext => poll::poll_next(self, event, ctx),
            MachineState::PollBusy => poll::poll_busy(self, event, ctx),
        }
    }

    /// Install a handler at a level.
    ///
    /// No-op when the handler is unchanged. Otherwise the outgoing handler
    /// observes `StateLeave` inline, its timer is cancelled, and `StateEnter`
    /// for the new handler is enqueued.
    pub(crate) fn set_state(
        &mut self,
        new_state: Option<MachineState>,
        level: StateLevel,
        ctx: &mut DeviceContext<'_>,
    ) {
        let idx = level.index();
        if self.state[idx] == new_state {
            return;
        }

        if let Some(old_state) = self.state[idx] {
            let leave = Event::new(
                RESOURCE_DEVICES,
                EventKind::StateLeave,
                idx as i64,
                self.key,
            );
            self.run_handler(old_state, &leave, ctx);
        }

        self.stop_timer(level);
        self.state[idx] = new_state;

        if new_state.is_some() {
            tracing::debug!(
                "device {} level {:?} -> {:?}",
                self.key,
                level,
                new_state
            );
            ctx.queue.push(Event::new(
                RESOURCE_DEVICES,
                EventKind::StateEnter,
                idx as i64,
                self.key,
            ));
        }
    }

    /// Arm the level's single-shot timer, replacing any running one.
    pub(crate) fn start_timer(&mut self, level: StateLevel, duration: std::time::Duration) {
        let slot = &mut self.timers[level.index()];
        slot.epoch = slot.epoch.wrapping_add(1);
        slot.deadline = Some(Instant::now() + duration);
    }

    /// Cancel the level's timer.
    ///
    /// Always advances the epoch: an expiry that already fired but was not
    /// yet delivered becomes stale too, so no handler ever sees a timeout it
    /// did not arm.
    pub(crate) fn stop_timer(&mut self, level: StateLevel) {
        let slot = &mut self.timers[level.index()];
        slot.epoch = slot.epoch.wrapping_add(1);
        slot.deadline = None;
    }

    /// Earliest armed timer deadline across all levels.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter_map(|slot| slot.deadline).min()
    }

    /// Convert due timers into `StateTimeout` events. Returns whether any
    /// fired.
    pub fn pump_timers(&mut self, queue: &mut EventQueue) -> bool {
        let now = Instant::now();
        let mut fired = false;
        for level in [StateLevel::Main, StateLevel::Binding, StateLevel::Poll] {
            let slot = &mut self.timers[level.index()];
            if let Some(deadline) = slot.deadline {
                if deadline <= now {
                    slot.deadline = None;
                    queue.push(Event::state_timeout(
                        RESOURCE_DEVICES,
                        level,
                        slot.epoch,
                        self.key,
                    ));
                    fired = true;
                }
            }
        }
        fired
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
