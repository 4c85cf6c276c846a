//! Per-module event structs logged through a [`distzero_logging::Logger`].
//!
//! Every node-hosting type in this crate binds a named logger from a shared
//! [`distzero_logging::Registry`] for its own event type. These structs are
//! what ends up in that stream; tests can assert on them directly instead of
//! only on a node's final state.

use distzero_transport::Id;

/// Events emitted by a [`crate::node::data::DataNode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataNodeEvent {
    /// A new kid was spawned in response to low aggregate capacity.
    SpawnedKid {
        /// The id of the node that spawned the kid.
        node_id: Id,
        /// The id given to the new kid.
        kid_id: Id,
    },
    /// The root bumped its height by inserting a proxy.
    BumpedHeight {
        /// The id of the node that bumped.
        node_id: Id,
        /// The node's new height.
        new_height: i32,
    },
    /// Two underused kids were merged.
    MergedKids {
        /// The id of the parent that triggered the merge.
        node_id: Id,
        /// The kid that is merging into `right`.
        left: Id,
        /// The kid absorbing `left`.
        right: Id,
    },
    /// The root consumed a redundant sole-kid proxy.
    ConsumedProxy {
        /// The id of the root.
        node_id: Id,
        /// The id of the proxy that was consumed.
        proxy_id: Id,
    },
}

/// Events emitted by a [`crate::node::link::LinkNode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkNodeEvent {
    /// The node received enough left/right configurations to instantiate its connector.
    Configured {
        /// The id of the node that became configured.
        node_id: Id,
        /// How many interior layers the connector laid down.
        n_layers: usize,
    },
    /// A left kid was incrementally added to an already-configured connector.
    AppendedLeft {
        /// The id of the hosting link node.
        node_id: Id,
        /// The id of the newly appended left kid.
        kid_id: Id,
    },
    /// A right kid was incrementally added to an already-configured connector.
    AppendedRight {
        /// The id of the hosting link node.
        node_id: Id,
        /// The id of the newly appended right kid.
        kid_id: Id,
    },
    /// An hourglass layer was inserted, replacing a complete bipartite subgraph.
    InsertedHourglass {
        /// The id of the hosting link node.
        node_id: Id,
        /// The ids of the new bottleneck nodes.
        hourglass_node_ids: Vec<Id>,
    },
}

/// Events emitted by the transport layer ([`distzero_transport::Linker`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A pending message was retransmitted.
    Retransmitted {
        /// The id of the node doing the retransmitting.
        node_id: Id,
        /// The id of the receiver the message was resent to.
        receiver_id: Id,
        /// The sequence number retransmitted.
        sequence_number: u64,
    },
    /// A message arrived out of order.
    Reordered {
        /// The id of the node that observed the reorder.
        node_id: Id,
        /// The id of the sender whose message arrived early.
        sender_id: Id,
    },
    /// A message arrived that had already been delivered.
    Duplicated {
        /// The id of the node that observed the duplicate.
        node_id: Id,
        /// The id of the sender whose message was a repeat.
        sender_id: Id,
    },
}

/// Events emitted by the migration state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationEvent {
    /// A participant attached its migrator role.
    Attached {
        /// The migration this concerns.
        migration_id: Id,
        /// The id of the node that attached.
        node_id: Id,
    },
    /// A source performed the atomic flow swap.
    Switched {
        /// The migration this concerns.
        migration_id: Id,
        /// The id of the source that swapped.
        node_id: Id,
        /// The first sequence number live on the new flow.
        first_live_sequence_number: u64,
    },
    /// A participant's migrator was torn down.
    Terminated {
        /// The migration this concerns.
        migration_id: Id,
        /// The id of the node whose migrator was terminated.
        node_id: Id,
    },
}
