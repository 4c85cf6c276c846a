//! The wire message model.
//!
//! Every message exchanged between nodes — whether delivered in-process or
//! carried in a `machine_deliver_to_node` UDP envelope — is one
//! [`NetworkMessage`] value: a single tagged Rust sum type standing in for
//! what would otherwise be a family of dynamically-typed records
//! (`messages.io`, `messages.migration`).

use serde::{Deserialize, Serialize};

use crate::handle::Handle;
use crate::ids::Id;

/// Which side of a dataset an importer/exporter pairing was established for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// The peer is acting as the sender of the pairing.
    Sender,
    /// The peer is acting as the receiver of the pairing.
    Receiver,
}

/// Whether a dataset tree carries external input or produces external output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variant {
    /// Leaves accept `InputAction` messages from outside the system.
    Input,
    /// Leaves maintain a monotonically-updated state visible to `get_output_state`.
    Output,
}

/// The opaque payload of one delta: an increment to fold into accumulated state.
///
/// The actual numeric operators (Plus, Project, Inject) a running dataflow
/// program applies are treated as opaque pure functions; this runtime only
/// needs to know how to *combine* deltas between ticks, which is addition,
/// for both message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaMessage {
    /// An increment forwarded from an upstream link or dataset node.
    Increment {
        /// The amount to add to accumulated state.
        amount: i64,
    },
    /// An action recorded directly at an input leaf.
    InputAction {
        /// The amount to add to accumulated state.
        number: i64,
    },
}

impl DeltaMessage {
    /// The amount this delta contributes, regardless of which variant it is.
    pub fn amount(&self) -> i64 {
        match self {
            DeltaMessage::Increment { amount } => *amount,
            DeltaMessage::InputAction { number } => *number,
        }
    }
}

/// A message carried by the reliable-sequenced transport between one
/// `Exporter` and its paired `Importer`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceMessage {
    /// Sent periodically by an `Importer` to advance its peer `Exporter`'s
    /// `least_unacknowledged_sequence_number`.
    Acknowledge {
        /// The new least-unacknowledged sequence number.
        sequence_number: u64,
    },
    /// One numbered application message.
    Receive {
        /// This message's position in the sender's outgoing stream.
        sequence_number: u64,
        /// The application payload.
        message: DeltaMessage,
    },
}

impl SequenceMessage {
    /// The sequence number this message concerns, whichever variant it is.
    pub fn sequence_number(&self) -> u64 {
        match self {
            SequenceMessage::Acknowledge { sequence_number } => *sequence_number,
            SequenceMessage::Receive { sequence_number, .. } => *sequence_number,
        }
    }
}

/// A kid handle plus the sender-side limit on how many upstream connections
/// it may accept, as exchanged in left configurations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KidConnection {
    /// The handle of the kid.
    pub handle: Handle,
    /// The maximum number of senders the kid should accept.
    pub connection_limit: u32,
}

/// Describes one left parent's contribution to a link node's left side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeftConfiguration {
    /// The height of the left parent.
    pub height: i32,
    /// Whether the left parent is a dataset node.
    pub is_data: bool,
    /// A handle to the left parent itself.
    pub node: Handle,
    /// The left parent's kids available to connect from.
    pub kids: Vec<KidConnection>,
}

/// Describes one right parent's acceptance of a link node's right side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightConfiguration {
    /// The number of kids the right parent has, if it is a dataset node.
    pub n_kids: Option<u32>,
    /// A handle to the right parent itself.
    pub parent_handle: Handle,
    /// The height of the right parent.
    pub height: i32,
    /// Whether the right parent is a dataset node.
    pub is_data: bool,
    /// The right parent's currently advertised availability.
    pub availability: u64,
    /// The maximum number of senders the right parent should accept.
    pub connection_limit: u32,
}

/// Per-role configuration attached to an `attach_migrator` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigratorRoleConfig {
    /// Configuration for a `Source` migrator.
    Source {
        /// Whether this migrator will participate in state syncing.
        will_sync: bool,
    },
    /// Configuration for a `Sink` migrator.
    Sink {
        /// New-flow senders already known at attach time, if any.
        new_flow_senders: Option<Vec<Handle>>,
        /// The ids of the old-flow senders this sink must hear swap markers from.
        old_flow_sender_ids: Vec<Id>,
        /// Whether this migrator will participate in state syncing.
        will_sync: bool,
    },
    /// Configuration for an `Insertion` migrator (fresh node added by the migration).
    Insertion {
        /// Whether this migrator will participate in state syncing.
        will_sync: bool,
    },
    /// Configuration for a `Removal` migrator (a node being excised).
    Removal {
        /// The ids of the old-flow senders this node must hear swap markers from.
        old_flow_sender_ids: Vec<Id>,
    },
}

/// The full tagged-record message family used to drive the migration protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationMessage {
    /// Establishes a transport-level pairing in either direction, ahead of
    /// the first application message flowing over it.
    ConnectNode {
        /// A handle usable to reach the node announcing the pairing.
        node: Handle,
        /// Whether the announcing node is acting as sender or receiver.
        direction: Direction,
    },

    /// Coordinator -> participant: create this participant's migrator role.
    AttachMigrator {
        /// The migration this role belongs to.
        migration_id: Id,
        /// A handle to the coordinating `MigrationNode`.
        migration: Handle,
        /// The role-specific configuration.
        config: MigratorRoleConfig,
    },
    /// Participant -> parent: this participant (and its whole subtree) has attached.
    AttachedMigrator {
        /// The migration this acknowledgement belongs to.
        migration_id: Id,
    },

    /// Coordinator -> sources: begin establishing the new flow.
    StartFlow {
        /// The migration this applies to.
        migration_id: Id,
    },
    /// Source -> new receiver (or sink -> new sender, symmetric): announce
    /// the sender's right-side shape.
    ConfigureNewFlowRight {
        /// `None` outside of a migration (used by plain dataset/link wiring).
        migration_id: Option<Id>,
        /// One entry per right parent being configured.
        right_configurations: Vec<RightConfiguration>,
    },
    /// The symmetric announcement of a node's left-side shape.
    ConfigureNewFlowLeft {
        /// `None` outside of a migration.
        migration_id: Option<Id>,
        /// One entry per left parent being configured.
        left_configurations: Vec<LeftConfiguration>,
    },
    /// Announces which node(s) will appear beneath a right parent.
    ConfigureRightParent {
        /// The migration this applies to.
        migration_id: Id,
        /// The kid ids that will appear beneath the announcing right parent.
        kid_ids: Vec<Id>,
    },
    /// A source's kids are told which node(s) will become their new right parents.
    SetSourceRightParents {
        /// The migration this applies to.
        migration_id: Id,
        /// The ids of the new right parents.
        configure_right_parent_ids: Vec<Id>,
    },
    /// Tells a kid which adjacent node to start a new flow with.
    SetNewFlowAdjacent {
        /// The migration this applies to.
        migration_id: Id,
        /// A handle to the new adjacent node.
        adjacent: Handle,
    },
    /// Replaces an expected left-configuration sender with a different node id
    /// (used when a source is itself replaced mid-setup).
    SubstituteLeftConfiguration {
        /// The node id that will now appear instead.
        new_node_id: Id,
    },
    /// Announces that a left parent has gained a new kid, outside of a migration.
    UpdateLeftConfiguration {
        /// The id of the left parent sending the update.
        parent_id: Id,
        /// The newly available kids.
        new_kids: Vec<KidConnection>,
        /// The left parent's height after the update.
        new_height: i32,
    },
    /// Announces that a right parent has gained a new kid, outside of a migration.
    UpdateRightConfiguration {
        /// The id of the right parent sending the update.
        parent_id: Id,
        /// The newly available kids.
        new_kids: Vec<Handle>,
        /// The right parent's height after the update.
        new_height: i32,
    },

    /// Sink -> coordinator: the new flow has started; carries the first
    /// sequence number observed on it.
    CompletedFlow {
        /// The first new-flow sequence number the sink will rely on.
        sequence_number: u64,
    },
    /// Bubbles "my whole subtree has started the new flow" up a sink tree.
    StartedFlow {
        /// The migration this applies to.
        migration_id: Id,
    },
    /// An old-flow source announces its own first-new-flow sequence number.
    ReplacingFlow {
        /// The first sequence number reflecting the new flow.
        sequence_number: u64,
    },

    /// Coordinator -> syncing sources: begin dividing state across receivers.
    StartSyncing {
        /// The migration this applies to.
        migration_id: Id,
        /// The receivers to divide state across.
        receivers: Vec<Handle>,
    },
    /// A syncing source's assignment of a state slice to one receiver.
    SetSumTotal {
        /// The migration this applies to.
        migration_id: Id,
        /// A handle to the sending source.
        from_node: Handle,
        /// This receiver's slice of the accumulated total.
        total: i64,
    },
    /// A receiver acknowledges it has incorporated its assigned slice.
    SumTotalSet,
    /// A migrator reports that all of its sync targets are synced.
    SyncerIsSynced,

    /// Coordinator -> all participants (top-down): enter `deltas_only` mode.
    PrepareForSwitch {
        /// The migration this applies to.
        migration_id: Id,
    },
    /// Participant -> parent (bottom-up): acknowledges `prepare_for_switch`.
    PreparedForSwitch {
        /// The migration this applies to.
        migration_id: Id,
    },
    /// Coordinator -> sources: perform the atomic flow swap.
    SwitchFlows {
        /// The migration this applies to.
        migration_id: Id,
    },
    /// A source announces the first sequence number after the cut on the old flow.
    SwappedFromDuplicate {
        /// The first post-cut sequence number on the old flow.
        first_live_sequence_number: u64,
    },
    /// A source announces the first sequence number after the cut on the new flow.
    SwappedToDuplicate {
        /// The first post-cut sequence number on the new flow.
        first_live_sequence_number: u64,
    },
    /// Bubbles "my whole subtree has swapped" up a sink tree.
    SwitchedFlows {
        /// The migration this applies to.
        migration_id: Id,
    },

    /// Coordinator -> all participants (top-down): tear down the migrator.
    TerminateMigrator {
        /// The migration this applies to.
        migration_id: Id,
    },
    /// Participant -> parent (bottom-up): acknowledges `terminate_migrator`.
    MigratorTerminated {
        /// The migration this applies to.
        migration_id: Id,
    },

    /// Installs a set of mirror exporters that every subsequent `export` also fans to.
    StartDuplicating {
        /// The id of the node that was receiving before duplication began.
        old_receiver_id: Id,
        /// A handle to the new mirror receiver.
        receiver: Handle,
    },
    /// Requests the end of a duplication phase.
    FinishDuplicating {
        /// The id of the receiver whose duplication should end.
        receiver_id: Id,
    },
    /// Acknowledges that a duplication phase has ended.
    FinishedDuplicating,

    /// Acknowledges that a new sender has finished being added.
    FinishedAddingSender {
        /// The id of the sender that finished being added.
        sender_id: Id,
    },

    /// A dataset root announces that it has bumped its height by inserting a proxy.
    BumpedHeight {
        /// A handle to the new proxy, now the dataset root's sole kid.
        proxy: Handle,
        /// The ids of the kids the proxy adopted.
        old_kid_ids: Vec<Id>,
        /// Whether the dataset is an input or output tree.
        variant: Variant,
    },

    /// Wraps a `SequenceMessage` so it can be routed to a migrator's private
    /// linker while a migration is in flight, instead of to the node's own
    /// linker.
    Sequence {
        /// The wrapped sequence-numbered payload.
        value: SequenceMessage,
    },
}

/// A handle plus an explicit request to add it as a new sender, used by the
/// `added_sender` control flow (a parent dataset node asking a child to
/// accept a newly-spawned sibling as a peer sender).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedSender {
    /// A handle to the new sending node.
    pub node: Handle,
    /// Where to report back once the sender finishes being added.
    pub respond_to: Handle,
}

/// Dataset-tree bookkeeping messages: parent/kid greetings, summaries, and
/// restructuring instructions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoMessage {
    /// Kid -> parent: sent once, after all adopted kids (if any) have greeted.
    HelloParent {
        /// A handle to the greeting kid.
        kid: Handle,
    },
    /// Kid -> parent: the kid is departing (merge completed, or killed).
    GoodbyeParent,
    /// Kid -> parent, periodic: aggregate subtree statistics.
    KidSummary {
        /// Leaves below this kid.
        size: u64,
        /// This kid's immediate kid count.
        n_kids: u32,
        /// This kid's advertised spare capacity.
        availability: u64,
    },
    /// Parent -> kid: merge into the named node, then depart.
    MergeWith {
        /// A handle to the node this kid should merge into.
        node: Handle,
    },
    /// New parent -> kid: the kid now reports to a different parent.
    Adopt {
        /// A handle to the new parent.
        new_parent: Handle,
    },
    /// Parent -> existing kid: a new sibling has been spawned; accept it as a peer sender.
    AddedSender(AddedSender),
}

/// One message, tagged by which family it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    /// A reliable-transport sequence message (`acknowledge`/`receive`).
    Sequence(SequenceMessage),
    /// A dataset-tree bookkeeping message.
    Io(IoMessage),
    /// A migration-protocol message.
    Migration(MigrationMessage),
}

/// The envelope carried by one UDP datagram on the data plane: a single
/// message destined for a single node, tagged with who sent it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDeliverToNode {
    /// The id of the destination node.
    pub node_id: Id,
    /// The id of the node that sent this message.
    pub sending_node_id: Id,
    /// The message payload.
    pub message: NetworkMessage,
}
