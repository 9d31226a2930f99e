//! Change notifications published by the topology actor.
use crate::{
    server_address::ServerAddress, server_description::ServerRole,
    topology_description::TopologyType,
};

/// Broadcast whenever the topology actor notices something worth reacting to. Receivers
/// that fall behind lose the oldest events, never the latest snapshot, which is always
/// available through [`Topology::watch_topology`](crate::Topology::watch_topology).
#[derive(Clone, Debug, PartialEq)]
pub enum TopologyEvent {
    /// A server changed role, epoch, membership or reachability.
    ServerDescriptionChanged {
        address: ServerAddress,
        previous_role: ServerRole,
        new_role: ServerRole,
    },
    TopologyTypeChanged {
        previous_type: TopologyType,
        new_type: TopologyType,
    },
    ServerAdded(ServerAddress),
    ServerRemoved(ServerAddress),
    /// The set used to have a primary and no longer has one.
    PrimaryLost,
    /// A server reported membership in a different replica set and was excluded.
    SetNameMismatch {
        address: ServerAddress,
        expected: String,
        actual: Option<String>,
    },
}
