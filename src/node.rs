//! # Node Registry Types
//!
//! Read-model of what the network layer knows about a node: its addresses,
//! the ZDP node descriptor, the active endpoint list, per-endpoint simple
//! descriptors and the persistent binding table.
//!
//! The machine holds no pointers into the registry. It resolves its node
//! lazily through [`NodeRegistry::lookup`] and tolerates the node vanishing
//! between events.

use tokio::time::Instant;

use crate::DeviceKey;

/// ZDP node descriptor, present once discovery fetched it.
#[derive(Debug, Clone, Default)]
pub struct NodeDescriptor {
    /// Whether the radio stays on while the device idles. Sleeping
    /// end-devices report false and are only reachable shortly after a MAC
    /// data poll.
    pub receiver_on_when_idle: bool,
    /// 16-bit manufacturer code from the descriptor.
    pub manufacturer_code: u16,
}

/// Per-endpoint metadata: device id plus server/client cluster lists.
#[derive(Debug, Clone)]
pub struct SimpleDescriptor {
    pub endpoint: u8,
    pub profile_id: u16,
    /// 0xFFFF marks a placeholder that still needs fetching.
    pub device_id: u16,
    pub server_clusters: Vec<u16>,
    pub client_clusters: Vec<u16>,
}

impl SimpleDescriptor {
    /// A descriptor with device id 0xFFFF was never actually received.
    pub fn is_valid(&self) -> bool {
        self.device_id != 0xFFFF
    }
}

/// Destination half of a binding-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingDestination {
    /// Unicast binding to another node's endpoint.
    Extended { address: u64, endpoint: u8 },
    /// Group binding.
    Group(u16),
}

/// One persistent binding on the node.
#[derive(Debug, Clone)]
pub struct BindingEntry {
    pub src_address: u64,
    pub cluster_id: u16,
    pub destination: BindingDestination,
    /// When the binding was last confirmed on air, if ever.
    pub confirmed_at: Option<Instant>,
}

/// Everything the network layer resolved about one node.
#[derive(Debug, Clone, Default)]
pub struct Node {
    ext_address: u64,
    nwk_address: u16,
    node_descriptor: Option<NodeDescriptor>,
    endpoints: Vec<u8>,
    simple_descriptors: Vec<SimpleDescriptor>,
    binding_table: Vec<BindingEntry>,
}

impl Node {
    pub fn new(ext_address: u64, nwk_address: u16) -> Self {
        Self {
            ext_address,
            nwk_address,
            ..Self::default()
        }
    }

    pub fn ext_address(&self) -> u64 {
        self.ext_address
    }

    pub fn nwk_address(&self) -> u16 {
        self.nwk_address
    }

    pub fn node_descriptor(&self) -> Option<&NodeDescriptor> {
        self.node_descriptor.as_ref()
    }

    pub fn set_node_descriptor(&mut self, descriptor: NodeDescriptor) {
        self.node_descriptor = Some(descriptor);
    }

    pub fn endpoints(&self) -> &[u8] {
        &self.endpoints
    }

    pub fn set_endpoints(&mut self, endpoints: Vec<u8>) {
        self.endpoints = endpoints;
    }

    /// Simple descriptor of one endpoint, if received.
    pub fn simple_descriptor(&self, endpoint: u8) -> Option<&SimpleDescriptor> {
        self.simple_descriptors
            .iter()
            .find(|sd| sd.endpoint == endpoint)
    }

    pub fn simple_descriptors(&self) -> &[SimpleDescriptor] {
        &self.simple_descriptors
    }

    /// First endpoint advertising `cluster_id` on its server side.
    pub fn simple_descriptor_for_server_cluster(
        &self,
        cluster_id: u16,
    ) -> Option<&SimpleDescriptor> {
        self.simple_descriptors
            .iter()
            .find(|sd| sd.server_clusters.contains(&cluster_id))
    }

    /// Add or replace the descriptor for its endpoint.
    pub fn add_simple_descriptor(&mut self, descriptor: SimpleDescriptor) {
        if let Some(existing) = self
            .simple_descriptors
            .iter_mut()
            .find(|sd| sd.endpoint == descriptor.endpoint)
        {
            *existing = descriptor;
        } else {
            self.simple_descriptors.push(descriptor);
        }
    }

    pub fn binding_table(&self) -> &[BindingEntry] {
        &self.binding_table
    }

    pub fn add_binding(&mut self, entry: BindingEntry) {
        self.binding_table.push(entry);
    }
}

/// Collaborator contract resolving device keys to nodes.
pub trait NodeRegistry {
    fn lookup(&self, key: DeviceKey) -> Option<&Node>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_simple_descriptor_is_invalid() {
        let sd = SimpleDescriptor {
            endpoint: 1,
            profile_id: 0x0104,
            device_id: 0xFFFF,
            server_clusters: vec![],
            client_clusters: vec![],
        };
        assert!(!sd.is_valid());
    }

    #[test]
    fn server_cluster_lookup_scans_all_endpoints() {
        let mut node = Node::new(0xAA, 0x1234);
        node.add_simple_descriptor(SimpleDescriptor {
            endpoint: 1,
            profile_id: 0x0104,
            device_id: 0x0302,
            server_clusters: vec![0x0406],
            client_clusters: vec![],
        });
        node.add_simple_descriptor(SimpleDescriptor {
            endpoint: 2,
            profile_id: 0x0104,
            device_id: 0x0302,
            server_clusters: vec![0x0000, 0x0400],
            client_clusters: vec![],
        });

        let sd = node.simple_descriptor_for_server_cluster(0x0000);
        assert_eq!(sd.map(|sd| sd.endpoint), Some(2));
        assert!(node.simple_descriptor_for_server_cluster(0x0500).is_none());
    }
}
