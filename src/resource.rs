//! # Resources and Attribute Items
//!
//! Sub-devices (sensors, lights) and the device itself are modeled as
//! [`Resource`]s: flat collections of typed attribute items addressed by a
//! stable suffix such as `attr/modelid` or `state/reachable`.
//!
//! The machine never caches pointers to sub-devices. It remembers
//! `(unique id, kind)` pairs and resolves them through the [`ResourceStore`]
//! on every access, tolerating deletion by the collaborator that owns the
//! store.
//!
//! [`StateChange`] objects ride along on a resource and reconcile a desired
//! item value against the device: `verify_item_change` marks a change
//! satisfied once the item reports the target value, `tick` re-issues a
//! verification read when its wait window expires. Both are driven from the
//! machine's Idle state.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::MIN_MAC_POLL_RX_ON;
use crate::transport::{TransportController, ZclReadParam};
use crate::DeviceKey;

// ============================================================================
// RESOURCE KINDS AND ITEM SUFFIXES
// ============================================================================

/// Resource prefix of physical devices.
pub const RESOURCE_DEVICES: &str = "/devices";
/// Resource prefix of sensor sub-devices.
pub const RESOURCE_SENSORS: &str = "/sensors";
/// Resource prefix of light sub-devices.
pub const RESOURCE_LIGHTS: &str = "/lights";

/// Kind tag narrowing sub-device resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Devices,
    Sensors,
    Lights,
}

impl ResourceKind {
    /// The resource prefix string used in events.
    pub const fn prefix(self) -> &'static str {
        match self {
            ResourceKind::Devices => RESOURCE_DEVICES,
            ResourceKind::Sensors => RESOURCE_SENSORS,
            ResourceKind::Lights => RESOURCE_LIGHTS,
        }
    }
}

/// Stable attribute item address within a resource.
pub type ItemSuffix = &'static str;

pub const ATTR_EXT_ADDRESS: ItemSuffix = "attr/extaddress";
pub const ATTR_NWK_ADDRESS: ItemSuffix = "attr/nwkaddress";
pub const ATTR_UNIQUE_ID: ItemSuffix = "attr/uniqueid";
pub const ATTR_ID: ItemSuffix = "attr/id";
pub const ATTR_MANUFACTURER_NAME: ItemSuffix = "attr/manufacturername";
pub const ATTR_MODEL_ID: ItemSuffix = "attr/modelid";
pub const ATTR_SLEEPER: ItemSuffix = "attr/sleeper";
pub const ATTR_LAST_SEEN: ItemSuffix = "attr/lastseen";
pub const STATE_REACHABLE: ItemSuffix = "state/reachable";
pub const CONFIG_REACHABLE: ItemSuffix = "config/reachable";
pub const STATE_LAST_UPDATED: ItemSuffix = "state/lastupdated";

// ============================================================================
// VALUES AND ITEMS
// ============================================================================

/// Attribute item value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    UInt(u64),
    Str(String),
}

/// One typed attribute on a resource.
#[derive(Debug, Clone)]
pub struct ResourceItem {
    suffix: ItemSuffix,
    value: Option<Value>,
    last_set: Option<Instant>,
    refresh_interval: Duration,
    read_parameters: Option<ReadRecipe>,
}

impl ResourceItem {
    pub fn new(suffix: ItemSuffix) -> Self {
        Self {
            suffix,
            value: None,
            last_set: None,
            refresh_interval: Duration::ZERO,
            read_parameters: None,
        }
    }

    pub fn suffix(&self) -> ItemSuffix {
        self.suffix
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Set the value and stamp `last_set`.
    ///
    /// Fails (returns false) when the item already holds a value of a
    /// different type; an item never changes type after its first set.
    pub fn set_value(&mut self, value: Value) -> bool {
        if let Some(existing) = &self.value {
            if std::mem::discriminant(existing) != std::mem::discriminant(&value) {
                return false;
            }
        }
        self.value = Some(value);
        self.last_set = Some(Instant::now());
        true
    }

    /// Instant of the last successful set, `None` while unset.
    pub fn last_set(&self) -> Option<Instant> {
        self.last_set
    }

    pub fn is_set(&self) -> bool {
        self.last_set.is_some()
    }

    pub fn to_bool(&self) -> bool {
        matches!(self.value, Some(Value::Bool(true)))
    }

    pub fn to_u64(&self) -> u64 {
        match self.value {
            Some(Value::UInt(v)) => v,
            _ => 0,
        }
    }

    pub fn to_str(&self) -> &str {
        match &self.value {
            Some(Value::Str(s)) => s,
            _ => "",
        }
    }

    /// Minimum age before the poll queue considers this item again.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn set_refresh_interval(&mut self, interval: Duration) -> &mut Self {
        self.refresh_interval = interval;
        self
    }

    /// DDF-supplied read recipe, `None` when the item is not pollable.
    pub fn read_parameters(&self) -> Option<&ReadRecipe> {
        self.read_parameters.as_ref()
    }

    pub fn set_read_parameters(&mut self, recipe: ReadRecipe) -> &mut Self {
        self.read_parameters = Some(recipe);
        self
    }
}

// ============================================================================
// READ RECIPES
// ============================================================================

/// Declarative description of how to read an item off the air.
///
/// Supplied per item by the device description (DDF) engine. The `function`
/// field selects the access function; only `"zcl:attr"` is resolvable here,
/// unknown names make the poll machinery skip the item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadRecipe {
    pub function: String,
    pub endpoint: u8,
    pub cluster_id: u16,
    pub attribute_ids: Vec<u16>,
    pub manufacturer_code: u16,
}

impl ReadRecipe {
    /// Standard ZCL read-attributes recipe.
    pub fn zcl_attr(endpoint: u8, cluster_id: u16, attribute_ids: Vec<u16>) -> Self {
        Self {
            function: "zcl:attr".to_string(),
            endpoint,
            cluster_id,
            attribute_ids,
            manufacturer_code: 0,
        }
    }

    /// An empty recipe never produces a poll item.
    pub fn is_empty(&self) -> bool {
        self.function.is_empty()
    }

    pub(crate) fn to_zcl_param(&self) -> ZclReadParam {
        ZclReadParam {
            endpoint: self.endpoint,
            cluster_id: self.cluster_id,
            attribute_ids: self.attribute_ids.clone(),
            manufacturer_code: self.manufacturer_code,
        }
    }
}

// ============================================================================
// STATE CHANGES
// ============================================================================

const STATE_CHANGE_MAX_READS: u8 = 3;

/// Progress of a pending state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    /// Not yet driven.
    Scheduled,
    /// Verification read issued, waiting for the item to catch up.
    WaitSync,
    /// Item reported the target value.
    Finished,
    /// Verification reads exhausted.
    Failed,
}

/// A desired item value awaiting on-air confirmation.
#[derive(Debug, Clone)]
pub struct StateChange {
    suffix: ItemSuffix,
    target: Value,
    state: ChangeState,
    wait_until: Option<Instant>,
    reads: u8,
}

impl StateChange {
    pub fn new(suffix: ItemSuffix, target: Value) -> Self {
        Self {
            suffix,
            target,
            state: ChangeState::Scheduled,
            wait_until: None,
            reads: 0,
        }
    }

    pub fn state(&self) -> ChangeState {
        self.state
    }

    pub fn suffix(&self) -> ItemSuffix {
        self.suffix
    }

    /// Mark the change satisfied when the item reports the target value.
    pub fn verify_item_change(&mut self, item: &ResourceItem) {
        if item.suffix() == self.suffix && item.value() == Some(&self.target) {
            self.state = ChangeState::Finished;
        }
    }

    /// Drive the next transport action once the wait window expired.
    ///
    /// Issues a verification read through the item's read recipe; after
    /// [`STATE_CHANGE_MAX_READS`] unanswered reads the change fails.
    pub fn tick(&mut self, resource: &Resource, transport: &mut dyn TransportController) {
        match self.state {
            ChangeState::Finished | ChangeState::Failed => return,
            ChangeState::Scheduled | ChangeState::WaitSync => {}
        }

        if let Some(wait_until) = self.wait_until {
            if Instant::now() < wait_until {
                return;
            }
        }

        if self.reads >= STATE_CHANGE_MAX_READS {
            tracing::debug!(
                "state change for {} gave up after {} reads",
                self.suffix,
                self.reads
            );
            self.state = ChangeState::Failed;
            return;
        }

        let Some(recipe) = resource.item(self.suffix).and_then(|i| i.read_parameters()) else {
            self.state = ChangeState::Failed;
            return;
        };

        let (ext, nwk) = resource.device_address();
        let result = transport.zcl_read_attributes(&recipe.to_zcl_param(), ext, nwk);
        if result.enqueued {
            self.reads += 1;
            self.state = ChangeState::WaitSync;
        }
        self.wait_until = Some(Instant::now() + MIN_MAC_POLL_RX_ON);
    }
}

// ============================================================================
// RESOURCES
// ============================================================================

/// A device or sub-device: attribute items plus pending state changes.
#[derive(Debug, Clone)]
pub struct Resource {
    kind: ResourceKind,
    items: Vec<ResourceItem>,
    state_changes: Vec<StateChange>,
    device_address: (u64, u16),
}

impl Resource {
    /// Create a resource seeded with its `attr/uniqueid` item.
    pub fn new(kind: ResourceKind, unique_id: impl Into<String>) -> Self {
        let mut resource = Self {
            kind,
            items: Vec::new(),
            state_changes: Vec::new(),
            device_address: (0, 0),
        };
        resource
            .add_item(ATTR_UNIQUE_ID)
            .set_value(Value::Str(unique_id.into()));
        resource
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn prefix(&self) -> &'static str {
        self.kind.prefix()
    }

    /// Add an item; returns the existing one when the suffix is already
    /// present.
    pub fn add_item(&mut self, suffix: ItemSuffix) -> &mut ResourceItem {
        if let Some(pos) = self.items.iter().position(|i| i.suffix() == suffix) {
            return &mut self.items[pos];
        }
        self.items.push(ResourceItem::new(suffix));
        let last = self.items.len() - 1;
        &mut self.items[last]
    }

    pub fn item(&self, suffix: ItemSuffix) -> Option<&ResourceItem> {
        self.items.iter().find(|i| i.suffix() == suffix)
    }

    pub fn item_mut(&mut self, suffix: ItemSuffix) -> Option<&mut ResourceItem> {
        self.items.iter_mut().find(|i| i.suffix() == suffix)
    }

    pub fn items(&self) -> &[ResourceItem] {
        &self.items
    }

    /// `attr/uniqueid` value, empty when never set.
    pub fn unique_id(&self) -> &str {
        self.item(ATTR_UNIQUE_ID).map_or("", |i| i.to_str())
    }

    /// Addresses of the owning physical device, used by verification reads.
    pub fn device_address(&self) -> (u64, u16) {
        self.device_address
    }

    pub fn set_device_address(&mut self, ext: u64, nwk: u16) {
        self.device_address = (ext, nwk);
    }

    pub fn add_state_change(&mut self, change: StateChange) {
        self.state_changes.push(change);
    }

    pub fn state_changes(&self) -> &[StateChange] {
        &self.state_changes
    }

    pub(crate) fn state_changes_mut(&mut self) -> &mut Vec<StateChange> {
        &mut self.state_changes
    }

    /// Sweep finished and failed changes.
    pub fn cleanup_state_changes(&mut self) {
        self.state_changes
            .retain(|c| !matches!(c.state(), ChangeState::Finished | ChangeState::Failed));
    }
}

/// Collaborator contract backing sub-device resolution.
pub trait ResourceStore {
    fn get(&self, kind: ResourceKind, unique_id: &str) -> Option<&Resource>;
    fn get_mut(&mut self, kind: ResourceKind, unique_id: &str) -> Option<&mut Resource>;
}

// ============================================================================
// UNIQUE IDS
// ============================================================================

/// Render the canonical unique id of an endpoint on a device.
///
/// The 64-bit address becomes colon-separated hex bytes, most significant
/// first, followed by the endpoint; a non-zero cluster id is appended for
/// cluster-scoped resources: `00:21:2e:00:00:ab:cd:ef-01-0006`.
pub fn generate_unique_id(key: DeviceKey, endpoint: u8, cluster_id: u16) -> String {
    let raw = key.value();
    let mut out = String::with_capacity(28);
    for shift in (0..8).rev() {
        let byte = (raw >> (shift * 8)) & 0xFF;
        if !out.is_empty() {
            out.push(':');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out.push_str(&format!("-{:02x}", endpoint));
    if cluster_id != 0 {
        out.push_str(&format!("-{:04x}", cluster_id));
    }
    out
}

// ============================================================================
// UNIT TESTS
// ============================================================================
