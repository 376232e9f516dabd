//! # Transport Contract
//!
//! The machine does not own a radio. It asks the [`TransportController`]
//! collaborator to enqueue ZDP and ZCL frames and learns about delivery via
//! `ApsConfirm` events carrying `(request id, status)`.
//!
//! Enqueueing is synchronous and non-blocking: the controller reports whether
//! the frame was accepted and which request id a later confirm will carry.
//! The machine tracks at most one outstanding network-service request and one
//! outstanding attribute read; confirms for any other id are ignored.

use crate::resource::{ReadRecipe, Resource, ResourceItem};

/// APS success status byte.
pub const APS_SUCCESS: u8 = 0x00;
/// ZDP success status.
pub const ZDP_SUCCESS: u8 = 0x00;
/// ZDP "request not supported by this node" status.
pub const ZDP_NOT_SUPPORTED: u8 = 0x84;

/// Outcome of an enqueue attempt.
///
/// Doubles as the machine's in-flight record: `request_id` is matched against
/// later `ApsConfirm` events, everything else is bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportResult {
    /// Whether the frame was accepted by the transport queue.
    pub enqueued: bool,
    /// APS request id a later confirm will carry.
    pub request_id: u8,
    /// ZCL/ZDP sequence number of the outgoing frame.
    pub sequence: u8,
}

/// Parameters of a ZCL read-attributes request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZclReadParam {
    pub endpoint: u8,
    pub cluster_id: u16,
    pub attribute_ids: Vec<u16>,
    /// 0 for standard attributes, a manufacturer code for vendor ones.
    pub manufacturer_code: u16,
}

/// Collaborator contract for enqueuing frames towards one node.
pub trait TransportController {
    /// Request the ZDP node descriptor.
    fn zdp_node_descriptor_req(&mut self, nwk: u16) -> TransportResult;

    /// Request the active endpoint list.
    fn zdp_active_endpoints_req(&mut self, nwk: u16) -> TransportResult;

    /// Request the simple descriptor of one endpoint.
    fn zdp_simple_descriptor_req(&mut self, nwk: u16, endpoint: u8) -> TransportResult;

    /// Enqueue a ZCL read-attributes request.
    fn zcl_read_attributes(&mut self, param: &ZclReadParam, ext: u64, nwk: u16)
        -> TransportResult;
}

// ============================================================================
// READ FUNCTIONS
// ============================================================================

/// An access function driving one read recipe.
pub type ReadFunction = fn(
    &Resource,
    &ResourceItem,
    &ReadRecipe,
    u64,
    u16,
    &mut dyn TransportController,
) -> TransportResult;

/// Resolve the access function named by a recipe.
///
/// Unknown function names yield `None`; the poll machinery drops such items
/// instead of guessing.
pub fn read_function(recipe: &ReadRecipe) -> Option<ReadFunction> {
    match recipe.function.as_str() {
        "zcl:attr" => Some(zcl_attr_read),
        _ => None,
    }
}

fn zcl_attr_read(
    _resource: &Resource,
    _item: &ResourceItem,
    recipe: &ReadRecipe,
    ext: u64,
    nwk: u16,
    transport: &mut dyn TransportController,
) -> TransportResult {
    transport.zcl_read_attributes(&recipe.to_zcl_param(), ext, nwk)
}
