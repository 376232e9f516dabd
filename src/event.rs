//! # Events
//!
//! The machine is driven exclusively by [`Event`] values: immutable records
//! delivered once, in arrival order. Collaborators (transport confirms, node
//! registry notifications, the DDF engine) and the machines themselves all
//! speak this one vocabulary.
//!
//! An event carries a [`EventKind`] tag, the resource prefix of the
//! originating collaborator class, an optional sub-device identifier, one
//! auxiliary numeric payload and the target device key.
//!
//! Two payload conventions:
//!
//! - `StateEnter`/`StateLeave`/`StateTimeout` carry the target state level in
//!   the payload; the kernel routes them by that value, never by the caller's
//!   level.
//! - `ApsConfirm` packs `(request id, status)` into the payload; use
//!   [`Event::aps_confirm_id`] and [`Event::aps_confirm_status`] to unpack.

use std::collections::VecDeque;

use crate::resource::{self, ItemSuffix};
use crate::{DeviceKey, StateLevel};

// ============================================================================
// EVENT KINDS
// ============================================================================

/// Closed set of event tags understood by the device machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Periodic poll trigger from the outer system.
    Poll,
    /// The device was heard on air (MAC data poll, attribute report, ...).
    Awake,
    /// A handler was installed at the level in the payload.
    StateEnter,
    /// A handler is being removed at the level in the payload.
    StateLeave,
    /// The single-shot timer of the level in the payload expired.
    StateTimeout,
    /// Asynchronous delivery status for a previously enqueued frame.
    ApsConfirm,
    /// The node's ZDP node descriptor became available.
    NodeDescriptor,
    /// The node's active endpoint list became available.
    ActiveEndpoints,
    /// A simple descriptor for one endpoint became available.
    SimpleDescriptor,
    /// A binding-table request finished; payload carries the ZDP status.
    BindingTable,
    /// Self-scheduled step of the binding-table walk.
    BindingTick,
    /// Ask the DDF engine to match and apply a device description.
    DdfInitRequest,
    /// DDF engine reply; payload 1 means matched and applied.
    DdfInitResponse,
    /// The DDF engine reloaded descriptions out-of-band.
    DdfReload,
    /// `attr/lastseen` changed on a sub-device.
    AttrLastSeen,
    /// `state/lastupdated` changed on a sub-device.
    AttrLastUpdated,
    /// `config/reachable` changed.
    ConfigReachable,
    /// `state/reachable` changed.
    StateReachable,
    /// `attr/manufacturername` was set.
    AttrManufacturerName,
    /// `attr/modelid` was set.
    AttrModelId,
    /// `attr/extaddress` was set.
    AttrExtAddress,
    /// `attr/nwkaddress` was set.
    AttrNwkAddress,
    /// `attr/uniqueid` was set.
    AttrUniqueId,
    /// `attr/sleeper` was set.
    AttrSleeper,
}

impl EventKind {
    /// The attribute item suffix this event kind reports a change for, if
    /// any. Used by item-change reconciliation to verify pending changes.
    pub fn item_suffix(self) -> Option<ItemSuffix> {
        match self {
            EventKind::AttrLastSeen => Some(resource::ATTR_LAST_SEEN),
            EventKind::AttrLastUpdated => Some(resource::STATE_LAST_UPDATED),
            EventKind::ConfigReachable => Some(resource::CONFIG_REACHABLE),
            EventKind::StateReachable => Some(resource::STATE_REACHABLE),
            EventKind::AttrManufacturerName => Some(resource::ATTR_MANUFACTURER_NAME),
            EventKind::AttrModelId => Some(resource::ATTR_MODEL_ID),
            EventKind::AttrExtAddress => Some(resource::ATTR_EXT_ADDRESS),
            EventKind::AttrNwkAddress => Some(resource::ATTR_NWK_ADDRESS),
            EventKind::AttrUniqueId => Some(resource::ATTR_UNIQUE_ID),
            EventKind::AttrSleeper => Some(resource::ATTR_SLEEPER),
            _ => None,
        }
    }
}

// ============================================================================
// EVENT
// ============================================================================

/// Immutable event record.
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    resource: &'static str,
    id: String,
    num: i64,
    device_key: DeviceKey,
    timer_epoch: u64,
}

impl Event {
    /// Create an event without a sub-device identifier.
    pub fn new(resource: &'static str, kind: EventKind, num: i64, device_key: DeviceKey) -> Self {
        Self {
            kind,
            resource,
            id: String::new(),
            num,
            device_key,
            timer_epoch: 0,
        }
    }

    /// Create an event addressing one sub-device by identifier.
    pub fn with_id(
        resource: &'static str,
        kind: EventKind,
        id: impl Into<String>,
        num: i64,
        device_key: DeviceKey,
    ) -> Self {
        Self {
            kind,
            resource,
            id: id.into(),
            num,
            device_key,
            timer_epoch: 0,
        }
    }

    /// Create an APS confirmation carrying `(request_id, status)`.
    pub fn aps_confirm(
        resource: &'static str,
        request_id: u8,
        status: u8,
        device_key: DeviceKey,
    ) -> Self {
        let num = (i64::from(status) << 8) | i64::from(request_id);
        Self::new(resource, EventKind::ApsConfirm, num, device_key)
    }

    /// Create a timer expiry for one state level. The epoch pins the event to
    /// the timer arming that produced it; stale expiries are discarded on
    /// delivery.
    pub fn state_timeout(
        resource: &'static str,
        level: StateLevel,
        epoch: u64,
        device_key: DeviceKey,
    ) -> Self {
        let mut event = Self::new(
            resource,
            EventKind::StateTimeout,
            level.index() as i64,
            device_key,
        );
        event.timer_epoch = epoch;
        event
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn resource(&self) -> &'static str {
        self.resource
    }

    /// Sub-device identifier, empty when the event targets the device itself.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Auxiliary numeric payload.
    pub fn num(&self) -> i64 {
        self.num
    }

    pub fn device_key(&self) -> DeviceKey {
        self.device_key
    }

    /// Request id of an `ApsConfirm` event.
    pub fn aps_confirm_id(&self) -> u8 {
        (self.num & 0xFF) as u8
    }

    /// Status byte of an `ApsConfirm` event (0x00 = success).
    pub fn aps_confirm_status(&self) -> u8 {
        ((self.num >> 8) & 0xFF) as u8
    }

    pub(crate) fn timer_epoch(&self) -> u64 {
        self.timer_epoch
    }
}

// ============================================================================
// EVENT QUEUE
// ============================================================================

/// FIFO queue of events awaiting dispatch.
///
/// Handlers enqueue synthetic events (`StateEnter`, `Awake`, `BindingTick`,
/// `DdfInitRequest`) here instead of calling into each other, which keeps
/// delivery order strict and makes every transition observable.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// `ApsConfirm` packs request id and status losslessly into the payload.
    #[test]
    fn aps_confirm_packs_id_and_status() {
        let key = DeviceKey::new(0x00212E0000ABCDEF);
        let event = Event::aps_confirm(crate::RESOURCE_DEVICES, 0x2A, 0xE9, key);
        assert_eq!(event.kind(), EventKind::ApsConfirm);
        assert_eq!(event.aps_confirm_id(), 0x2A);
        assert_eq!(event.aps_confirm_status(), 0xE9);
        assert_eq!(event.device_key(), key);
    }

    proptest! {
        /// Packing round-trips for every (request id, status) pair.
        #[test]
        fn aps_confirm_roundtrip(request_id: u8, status: u8) {
            let event = Event::aps_confirm(
                crate::RESOURCE_DEVICES,
                request_id,
                status,
                DeviceKey::new(1),
            );
            prop_assert_eq!(event.aps_confirm_id(), request_id);
            prop_assert_eq!(event.aps_confirm_status(), status);
        }
    }

    /// Timer expiries carry their level in the payload and their arming epoch
    /// on the side.
    #[test]
    fn state_timeout_carries_level_and_epoch() {
        let event = Event::state_timeout(
            crate::RESOURCE_DEVICES,
            StateLevel::Poll,
            7,
            DeviceKey::new(1),
        );
        assert_eq!(event.num(), StateLevel::Poll.index() as i64);
        assert_eq!(event.timer_epoch(), 7);
    }

    /// Queue preserves FIFO order.
    #[test]
    fn queue_is_fifo() {
        let key = DeviceKey::new(1);
        let mut queue = EventQueue::new();
        queue.push(Event::new(crate::RESOURCE_DEVICES, EventKind::Awake, 0, key));
        queue.push(Event::new(crate::RESOURCE_DEVICES, EventKind::Poll, 0, key));
        assert_eq!(queue.pop().map(|e| e.kind()), Some(EventKind::Awake));
        assert_eq!(queue.pop().map(|e| e.kind()), Some(EventKind::Poll));
        assert!(queue.pop().is_none());
    }
}
