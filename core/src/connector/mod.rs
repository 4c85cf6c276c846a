//! Bipartite-graph builders: choose which intermediate nodes exist between a
//! link node's left configuration set and its right configuration set.

pub mod all_to_all;
pub mod all_to_one;
pub mod topology_picker;

use distzero_transport::Id;

pub use all_to_all::{AllToAllConnector, LayerPlan, SpawnedRow};
pub use all_to_one::{weighted_round_robin, AllToOneAvailableConnector};

/// Either connector variant a [`crate::node::link::LinkNode`] can host.
///
/// These are two independent connector types rather than a single
/// configurable one: an `AllToAll`
/// connector is used when every left kid's contribution must reach every
/// right kid (e.g. feeding an aggregation), an `AllToOneAvailable` connector
/// when each left kid need only reach one right kid chosen by availability
/// (e.g. sharding/forwarding).
#[derive(Clone, Debug)]
pub enum Connector {
    /// A complete-bipartite interior built from a pair of balanced trees.
    AllToAll(AllToAllConnector),
    /// A single-hop interior assigning each left kid to one right parent.
    AllToOneAvailable(AllToOneAvailableConnector),
}

impl Connector {
    /// The interior layers, left-base-first, right-base-last, when this is
    /// an [`AllToAll`](Connector::AllToAll) connector.
    pub fn layers(&self) -> Option<&[Vec<Id>]> {
        match self {
            Connector::AllToAll(connector) => Some(connector.layers()),
            Connector::AllToOneAvailable(_) => None,
        }
    }
}
