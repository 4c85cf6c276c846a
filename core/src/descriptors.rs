//! Static, in-memory descriptions of a distributed program, handed to the
//! runtime bootstrap. Every descriptor has a stable, serializable shape, and
//! `spawn_node` turns one into a running [`crate::node::data::DataNode`] or
//! [`crate::node::link::LinkNode`].

use serde::{Deserialize, Serialize};

use distzero_transport::{Handle, Id, Variant};

use crate::node::link::ConnectorKind;

/// Constructs a `DataNode`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataNodeConfig {
    /// The id the new node should use.
    pub node_id: Id,
    /// The new node's parent, if any (`None` for a dataset root).
    pub parent: Option<Handle>,
    /// Whether this tree carries external input or produces external output.
    pub variant: Variant,
    /// The new node's height (`-1` for a leaf).
    pub height: i32,
}

/// Constructs a `LinkNode`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkNodeConfig {
    /// The id the new node should use.
    pub node_id: Id,
    /// Which connector strategy the node will instantiate once configured.
    pub connector_kind: ConnectorKindConfig,
    /// How many left parents the node should expect a `configure_new_flow_left` from.
    pub expected_left_parents: usize,
    /// How many right parents the node should expect a `configure_new_flow_right` from.
    pub expected_right_parents: usize,
}

/// The serializable counterpart of [`ConnectorKind`] (which is not itself
/// `Serialize`/`Deserialize` since it carries no payload worth wire-encoding
/// beyond the choice itself).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorKindConfig {
    /// See [`ConnectorKind::AllToAll`].
    AllToAll,
    /// See [`ConnectorKind::AllToOneAvailable`].
    AllToOneAvailable,
}

impl From<ConnectorKindConfig> for ConnectorKind {
    fn from(config: ConnectorKindConfig) -> Self {
        match config {
            ConnectorKindConfig::AllToAll => ConnectorKind::AllToAll,
            ConnectorKindConfig::AllToOneAvailable => ConnectorKind::AllToOneAvailable,
        }
    }
}

/// Constructs an external-facing leaf: an `input` leaf accepting actions from
/// outside the system, or an `output` leaf exposing `get_output_state`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeafConfig {
    /// The id the new leaf should use.
    pub node_id: Id,
    /// The leaf's parent dataset node.
    pub parent: Handle,
    /// Whether the leaf accepts input or produces output.
    pub variant: Variant,
}

/// Constructs the coordinator `MigrationNode` for one migration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationNodeConfig {
    /// A fresh id for the migration (becomes every participant's `migration_id`).
    pub migration_id: Id,
    /// The ids of every participant, `source`/`sink` subsets drawn from these.
    pub participant_ids: Vec<Id>,
    /// Which participants play the `Source` role.
    pub source_ids: Vec<Id>,
    /// Which participants play the `Sink` role.
    pub sink_ids: Vec<Id>,
    /// Whether this migration performs the optional sync phase.
    pub will_sync: bool,
}

/// Constructs a sum-aggregating link node, i.e. an [`AllToAll`](ConnectorKind::AllToAll)
/// `LinkNode` tuned with the sum-node sender/receiver limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SumNodeConfig {
    /// The id the new node should use.
    pub node_id: Id,
    /// How many left parents the node should expect a configuration from.
    pub expected_left_parents: usize,
    /// How many right parents the node should expect a configuration from.
    pub expected_right_parents: usize,
}

/// The root of a compiled program: a forest of [`DatasetConfig`]s connected by
/// [`LinkNodeConfig`]s, handed to the bootstrap as a single unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgramNodeConfig {
    /// Every dataset in the program.
    pub datasets: Vec<DatasetConfig>,
    /// Every link fabric connecting two datasets (or a dataset and a link).
    pub links: Vec<LinkNodeConfig>,
}

/// One dataset (a tree-shaped logical keyspace) within a program.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// This dataset's root node config.
    pub root: DataNodeConfig,
    /// Whether this dataset carries external input or produces external output.
    pub variant: Variant,
}

/// Builds the [`DataNodeConfig`] for a fresh dataset root (no parent, height 1
/// so that [`crate::node::data::DataNode::initialize`] spawns its first kid).
pub fn dataset_root_config(variant: Variant) -> DataNodeConfig {
    DataNodeConfig { node_id: Id::new("DataNode_root"), parent: None, variant, height: 1 }
}

/// Builds the [`LeafConfig`] for a fresh leaf under `parent`.
pub fn leaf_config(parent: Handle, variant: Variant) -> LeafConfig {
    LeafConfig { node_id: Id::new("DataNode_leaf"), parent, variant }
}

/// Builds a [`SumNodeConfig`] expecting `expected_left_parents` senders and a
/// single right parent.
pub fn sum_node_config(expected_left_parents: usize) -> SumNodeConfig {
    SumNodeConfig { node_id: Id::new("SumNode"), expected_left_parents, expected_right_parents: 1 }
}
