//! # zigbee-device-runtime
//!
//! Per-device lifecycle state machine for wireless mesh end-nodes connected
//! through a coordinator over a short-range personal-area network.
//!
//! For each physical device one [`DeviceMachine`] brings the node from
//! "unknown" to "operational": it issues network service requests (node
//! descriptor, active endpoints, simple descriptors), reads the identifying
//! basic-cluster attributes, hands over to a declarative device-description
//! engine, and then sustains two long-running background activities while the
//! node stays reachable: a binding-table audit and attribute polling.
//!
//! ## Architecture
//!
//! | Piece | Purpose |
//! |-------|---------|
//! | [`DeviceMachine`] | Hierarchical state machine, one per physical device |
//! | [`Event`] | Immutable value object delivered once, in order |
//! | [`MachineEventLoop`] | FIFO dispatcher driving all machines and their timers |
//! | [`TransportController`] | Collaborator that enqueues radio frames |
//! | [`NodeRegistry`] | Collaborator resolving discovered node metadata |
//! | [`ResourceStore`] | Collaborator backing sub-device attribute items |
//!
//! The machine runs single-threaded and cooperative: handlers run to
//! completion, synthetic events are enqueued (never called inline), and timer
//! expiries arrive as ordinary [`EventKind::StateTimeout`] events.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use zigbee_device_runtime::prelude::*;
//!
//! let config = MachineConfig::builder().managed(true).build();
//! let mut event_loop = MachineEventLoop::new(config);
//!
//! let key = DeviceKey::new(0x00212E0000ABCDEF);
//! event_loop.get_or_create(key)?;
//! event_loop.push(Event::new(RESOURCE_DEVICES, EventKind::Awake, 0, key));
//! event_loop.run_until_idle(&mut transport, &registry, &mut store);
//! ```
//!
//! Handlers never block and never panic; every failure mode is an observable
//! state transition (back to `Init` on the discovery path, retry-with-cap on
//! the poll path, or the terminal `Dead` state).

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod machine;
pub mod node;
pub mod resource;
pub mod transport;

pub use config::MachineConfig;
pub use dispatcher::{Command, DeviceContainer, LoopHandle, MachineEventLoop};
pub use error::{Error, Result};
pub use event::{Event, EventKind, EventQueue};
pub use machine::{DeviceContext, DeviceMachine, MachineState};
pub use node::{
    BindingDestination, BindingEntry, Node, NodeDescriptor, NodeRegistry, SimpleDescriptor,
};
pub use resource::{
    ReadRecipe, Resource, ResourceItem, ResourceKind, ResourceStore, StateChange, Value,
    RESOURCE_DEVICES, RESOURCE_LIGHTS, RESOURCE_SENSORS,
};
pub use transport::{TransportController, TransportResult, ZclReadParam};

// ============================================================================
// CORE IDENTIFIERS
// ============================================================================

/// Stable 64-bit device identifier.
///
/// For physical devices this is the MAC address. Green-power-only nodes carry
/// a 32-bit source id in the lower half (upper 32 bits zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey(u64);

impl DeviceKey {
    /// Create a new device key from a raw 64-bit address.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Key 0 is reserved and never names a device.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Number of concurrent state levels per machine.
pub const STATE_LEVEL_COUNT: usize = 3;

/// A level in the per-device handler stack.
///
/// Level 0 carries the primary lifecycle. Levels 1 and 2 host the binding and
/// polling sub-machines, which are installed only while level 0 sits in
/// [`MachineState::Idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateLevel {
    /// Primary lifecycle (discovery chain, Idle, Dead).
    Main,
    /// Binding-table audit sub-machine.
    Binding,
    /// Attribute polling sub-machine.
    Poll,
}

impl StateLevel {
    /// Array index of this level.
    pub const fn index(self) -> usize {
        match self {
            StateLevel::Main => 0,
            StateLevel::Binding => 1,
            StateLevel::Poll => 2,
        }
    }

    /// Recover a level from an event's auxiliary payload. Returns `None` for
    /// out-of-range values.
    pub const fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(StateLevel::Main),
            1 => Some(StateLevel::Binding),
            2 => Some(StateLevel::Poll),
            _ => None,
        }
    }

    /// The sub-machine levels, in dispatch order.
    pub const SUB_LEVELS: [StateLevel; 2] = [StateLevel::Binding, StateLevel::Poll];
}

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub mod prelude {
    pub use crate::config::{
        MachineConfig, BINDING_VERIFY_PERIOD, MAX_POLL_ITEM_RETRIES, MIN_MAC_POLL_RX_ON,
    };
    pub use crate::dispatcher::{Command, DeviceContainer, LoopHandle, MachineEventLoop};
    pub use crate::error::{Error, Result};
    pub use crate::event::{Event, EventKind, EventQueue};
    pub use crate::machine::{DeviceContext, DeviceMachine, MachineState};
    pub use crate::node::{
        BindingDestination, BindingEntry, Node, NodeDescriptor, NodeRegistry, SimpleDescriptor,
    };
    pub use crate::resource::{
        ReadRecipe, Resource, ResourceItem, ResourceKind, ResourceStore, Value, RESOURCE_DEVICES,
        RESOURCE_LIGHTS, RESOURCE_SENSORS,
    };
    pub use crate::transport::{TransportController, TransportResult, ZclReadParam};
    pub use crate::{DeviceKey, StateLevel};
}
