//! The dataset tree manager: a self-balancing tree of data nodes.

use std::collections::{HashMap, HashSet};

use distzero_logging::Logger;
use distzero_transport::{DeltaMessage, Deltas, Handle, Id, IoMessage, Linker, SequenceMessage, Transport, Variant};

use crate::config::SystemConfig;
use crate::errors::DistZeroError;
use crate::events::DataNodeEvent;

/// A kid's most recently reported aggregate statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KidSummary {
    /// Leaves below this kid.
    pub size: u64,
    /// This kid's immediate kid count.
    pub n_kids: u32,
    /// This kid's advertised spare capacity.
    pub availability: u64,
}

/// A side effect a [`DataNode`] wants the hosting machine to perform.
#[derive(Clone, Debug)]
pub enum DataNodeAction {
    /// Send `message` to `to`.
    Send {
        /// The destination handle.
        to: Handle,
        /// The message to deliver.
        message: IoMessage,
    },
    /// Ask the machine to spawn a fresh kid `DataNode` at `height`, to be
    /// parented by this node under `node_id`.
    SpawnKid {
        /// The id the new kid should use.
        node_id: Id,
        /// The height the new kid should be spawned at.
        height: i32,
    },
    /// Ask the machine to spawn a proxy node that adopts `adoptees`, as part
    /// of a height bump.
    SpawnProxy {
        /// The id the new proxy should use.
        node_id: Id,
        /// The height the new proxy should be spawned at.
        height: i32,
        /// The kids the proxy should immediately adopt.
        adoptees: Vec<Handle>,
    },
    /// Send a reliable-transport `message` to `to` (an acknowledgement, a
    /// retransmission, or a leaf's own numbered `input_action`).
    SendSequence {
        /// The destination handle.
        to: Handle,
        /// The sequence-numbered payload.
        message: SequenceMessage,
    },
}

/// One member of a dataset's self-balancing tree.
///
/// A `DataNode` of height `-1` is a leaf: an `input` leaf owns an `Importer`
/// fed by `input_action` messages; an `output` leaf owns a single
/// monotonically-updated piece of state. Every other `DataNode` manages a set
/// of kids bounded by [`SystemConfig::data_node_kids_limit`], growing by
/// spawning kids or (at the root) bumping its own height, and shrinking by
/// merging underused kids or (at the root) consuming a redundant proxy.
pub struct DataNode {
    id: Id,
    parent: Option<Handle>,
    variant: Variant,
    height: i32,
    config: SystemConfig,

    sent_hello: bool,
    kid_order: Vec<Id>,
    kids: HashMap<Id, Handle>,
    kid_summaries: HashMap<Id, KidSummary>,

    /// The adjacent link node: an input leaf's exporter receiver, or an
    /// output leaf's importer sender. `None` until connected.
    adjacent: Option<Handle>,
    linker: Linker,

    /// An output leaf's accumulator for numbered deltas from its one importer.
    deltas: Deltas,
    /// An input leaf's next outgoing sequence number.
    next_sequence_number: u64,
    /// While `true`, an output leaf buffers incoming deltas without folding
    /// them into `leaf_state`: set while this leaf's hosting migrator is
    /// between `prepare_for_switch` and the switch actually completing, so
    /// new-flow deltas that arrive early do not apply ahead of the cutover.
    deltas_only: bool,
    /// While duplicating during a migration, the additional receivers an
    /// input leaf's export also fans out to, keyed by receiver id.
    duplicate_receivers: HashMap<Id, Handle>,

    /// The leaf's current accumulated state (`output` variant only).
    leaf_state: i64,

    root_proxy_id: Option<Id>,
    kids_for_proxy_to_adopt: Option<Vec<Handle>>,
    root_consuming_proxy_id: Option<Id>,
    merging_kid_ids: HashSet<Id>,
    pending_spawned_kids: HashSet<Id>,

    time_since_no_mergeable_kids_ms: u64,
    time_since_no_consumable_proxy_ms: u64,
    warned_low_capacity: bool,

    logger: Option<Logger<DataNodeEvent>>,
}

impl DataNode {
    /// Constructs a new, not-yet-initialized data node.
    pub fn new(id: Id, parent: Option<Handle>, variant: Variant, height: i32, config: SystemConfig) -> Self {
        DataNode {
            id,
            parent,
            variant,
            height,
            config,
            sent_hello: false,
            kid_order: Vec::new(),
            kids: HashMap::new(),
            kid_summaries: HashMap::new(),
            adjacent: None,
            linker: Linker::new(),
            deltas: Deltas::new(),
            next_sequence_number: 0,
            deltas_only: false,
            duplicate_receivers: HashMap::new(),
            leaf_state: 0,
            root_proxy_id: None,
            kids_for_proxy_to_adopt: None,
            root_consuming_proxy_id: None,
            merging_kid_ids: HashSet::new(),
            pending_spawned_kids: HashSet::new(),
            time_since_no_mergeable_kids_ms: 0,
            time_since_no_consumable_proxy_ms: 0,
            warned_low_capacity: false,
            logger: None,
        }
    }

    /// Binds a logger for this node's [`DataNodeEvent`]s.
    pub fn set_logger(&mut self, logger: Logger<DataNodeEvent>) {
        self.logger = Some(logger);
    }

    /// This node's id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Whether this tree carries external input or produces external output.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// This node's height: `-1` for a leaf, `0` for the lowest interior level.
    pub fn height(&self) -> i32 {
        self.height
    }

    /// True iff this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.height == -1
    }

    /// True iff this node has no parent (the root of its dataset).
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// The number of immediate kids.
    pub fn kid_count(&self) -> usize {
        self.kid_order.len()
    }

    /// A leaf's current accumulated state (`output` variant only).
    pub fn current_state(&self) -> Result<i64, DistZeroError> {
        if !self.is_leaf() {
            return Err(DistZeroError::internal("non-leaf data nodes do not maintain current_state"));
        }
        Ok(self.leaf_state)
    }

    /// An `input` leaf's next outgoing sequence number, i.e. the sequence
    /// number the first post-migration-swap message will carry.
    pub fn next_sequence_number(&self) -> u64 {
        self.next_sequence_number
    }

    /// This node's kids, in greeting order (empty for a leaf).
    pub fn kid_ids(&self) -> &[Id] {
        &self.kid_order
    }

    fn branching_factor(&self) -> u64 {
        self.config.data_node_kids_limit as u64
    }

    /// Each leaf's contribution to its ancestors' availability; the original
    /// reuses the sum-node sender limit for this constant.
    fn leaf_availability(&self) -> u64 {
        self.config.sum_node_sender_limit as u64
    }

    fn kid_capacity_limit(&self) -> u64 {
        self.branching_factor().pow(self.height.max(0) as u32)
    }

    /// This node's advertised spare capacity, folding in both already-spawned
    /// kids' availability and the headroom to spawn more.
    pub fn availability(&self) -> u64 {
        if self.is_leaf() {
            return self.leaf_availability();
        }
        let from_spawned_kids: u64 = self.kid_summaries.values().map(|s| s.availability).sum();
        let from_room_to_spawn = self.leaf_availability()
            * self.kid_capacity_limit()
            * (self.branching_factor().saturating_sub(self.kid_summaries.len() as u64));
        from_spawned_kids + from_room_to_spawn
    }

    /// Runs once, right after construction: a height > 0 node with no initial
    /// kids must spawn one before it is ready for anything else; otherwise it
    /// greets its parent (if it has one).
    pub fn initialize(&mut self) -> Vec<DataNodeAction> {
        if self.height > 0 && self.kid_order.is_empty() {
            match self.spawn_kid() {
                Ok(action) => vec![action],
                Err(_) => Vec::new(),
            }
        } else if let Some(parent) = self.parent.clone() {
            self.send_hello_parent(&parent)
        } else {
            Vec::new()
        }
    }

    fn send_hello_parent(&mut self, parent: &Handle) -> Vec<DataNodeAction> {
        if self.sent_hello {
            return Vec::new();
        }
        self.sent_hello = true;
        vec![DataNodeAction::Send {
            to: parent.clone(),
            message: IoMessage::HelloParent { kid: Handle::new(self.id.clone(), Transport::Local) },
        }]
    }

    fn spawn_kid(&mut self) -> Result<DataNodeAction, DistZeroError> {
        if self.height == 0 {
            return Err(DistZeroError::internal("height 0 data nodes cannot spawn kids"));
        }
        if self.root_proxy_id.is_some() {
            return Err(DistZeroError::internal("root is bumping height; cannot spawn a kid"));
        }
        if self.root_consuming_proxy_id.is_some() {
            return Err(DistZeroError::internal("root is consuming a proxy; cannot spawn a kid"));
        }
        let node_id = Id::new("DataNode_kid");
        self.pending_spawned_kids.insert(node_id.clone());
        self.kid_summaries.insert(
            node_id.clone(),
            KidSummary { size: 0, n_kids: 0, availability: self.leaf_availability() * self.kid_capacity_limit() },
        );
        if let Some(logger) = &self.logger {
            logger.log(DataNodeEvent::SpawnedKid { node_id: self.id.clone(), kid_id: node_id.clone() });
        }
        Ok(DataNodeAction::SpawnKid { node_id, height: self.height - 1 })
    }

    /// Registers a newly-spawned (or adopted) kid once it greets with `hello_parent`.
    pub fn finish_adding_kid(&mut self, kid_id: Id, kid: Handle) {
        self.pending_spawned_kids.remove(&kid_id);
        if !self.kids.contains_key(&kid_id) {
            self.kid_order.push(kid_id.clone());
        }
        self.kids.insert(kid_id, kid);
    }

    /// Records a `kid_summary` report from `kid_id`.
    pub fn receive_kid_summary(&mut self, kid_id: Id, summary: KidSummary) {
        self.kid_summaries.insert(kid_id, summary);
    }

    /// Advances the node's internal timers and triggers restructuring.
    ///
    /// Checks for low total kid capacity (spawn a kid, or at the root, bump
    /// height), for mergeable kid pairs, and for a consumable proxy.
    pub fn elapse(&mut self, ms: u64) -> Vec<DataNodeAction> {
        let mut actions = Vec::new();

        if self.is_leaf() {
            actions.extend(self.elapse_linker(ms));
            return actions;
        }

        if self.height > 0 {
            actions.extend(self.check_for_low_capacity());
            actions.extend(self.check_for_mergeable_kids(ms));
        }
        actions.extend(self.check_for_consumable_proxy(ms));

        actions
    }

    /// Drains a leaf's acknowledgement and retransmission cadences.
    fn elapse_linker(&mut self, ms: u64) -> Vec<DataNodeAction> {
        let Some(adjacent) = self.adjacent.clone() else { return Vec::new() };
        let linker_actions = self.linker.elapse(ms);
        linker_actions
            .acknowledgements
            .into_iter()
            .chain(linker_actions.retransmissions)
            .map(|(_, message)| DataNodeAction::SendSequence { to: adjacent.clone(), message })
            .collect()
    }

    fn check_for_low_capacity(&mut self) -> Vec<DataNodeAction> {
        let total_kid_capacity: u64 =
            self.kid_summaries.values().map(|s| self.kid_capacity_limit().saturating_sub(s.size)).sum();

        if total_kid_capacity > self.config.total_kid_capacity_trigger {
            self.warned_low_capacity = false;
            return Vec::new();
        }

        if (self.kid_order.len() as u32) < self.config.data_node_kids_limit {
            if self.root_proxy_id.is_none() {
                return self.spawn_kid().map(|a| vec![a]).unwrap_or_default();
            }
            return Vec::new();
        }

        if self.parent.is_none() {
            if self.root_proxy_id.is_none() {
                return vec![self.bump_height()];
            }
            return Vec::new();
        }

        self.warned_low_capacity = true;
        Vec::new()
    }

    fn check_for_mergeable_kids(&mut self, ms: u64) -> Vec<DataNodeAction> {
        let best_pair = self.best_mergeable_kids();
        if best_pair.is_none() || !self.merging_kid_ids.is_empty() {
            self.time_since_no_mergeable_kids_ms = 0;
            return Vec::new();
        }

        self.time_since_no_mergeable_kids_ms += ms;
        if self.time_since_no_mergeable_kids_ms >= self.config.time_to_wait_before_kid_merge_ms {
            let (left, right) = best_pair.expect("checked above");
            return self.merge_kids(left, right);
        }
        Vec::new()
    }

    fn best_mergeable_kids(&self) -> Option<(Id, Id)> {
        if self.kid_summaries.len() < 2 {
            return None;
        }
        let max_n_kids = self.config.data_node_kids_limit;
        let mergeable_threshold = if max_n_kids <= 3 { 1 } else { max_n_kids / 3 };

        let mut pairs: Vec<(u32, Id)> =
            self.kid_summaries.iter().map(|(id, summary)| (summary.n_kids, id.clone())).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let (least_n_kids, least_id) = pairs.first()?.clone();
        let (next_least_n_kids, next_least_id) = pairs.get(1)?.clone();

        if least_n_kids <= mergeable_threshold && next_least_n_kids <= mergeable_threshold {
            Some((least_id, next_least_id))
        } else {
            None
        }
    }

    fn merge_kids(&mut self, left_kid_id: Id, right_kid_id: Id) -> Vec<DataNodeAction> {
        self.merging_kid_ids.insert(left_kid_id.clone());
        let (Some(left), Some(right)) = (self.kids.get(&left_kid_id), self.kids.get(&right_kid_id)) else {
            return Vec::new();
        };
        if let Some(logger) = &self.logger {
            logger.log(DataNodeEvent::MergedKids { node_id: self.id.clone(), left: left_kid_id.clone(), right: right_kid_id.clone() });
        }
        vec![DataNodeAction::Send { to: left.clone(), message: IoMessage::MergeWith { node: right.clone() } }]
    }

    fn check_for_consumable_proxy(&mut self, ms: u64) -> Vec<DataNodeAction> {
        if self.parent.is_some() {
            return Vec::new();
        }
        if self.kid_order.len() == 1 && self.root_consuming_proxy_id.is_none() && self.height > 1 {
            self.time_since_no_consumable_proxy_ms += ms;
            if self.time_since_no_consumable_proxy_ms >= self.config.time_to_wait_before_consume_proxy_ms {
                return self.consume_proxy();
            }
        } else {
            self.time_since_no_consumable_proxy_ms = 0;
        }
        Vec::new()
    }

    fn consume_proxy(&mut self) -> Vec<DataNodeAction> {
        if self.parent.is_some() || self.kid_order.len() != 1 {
            return Vec::new();
        }
        let proxy_id = self.kid_order[0].clone();
        let Some(proxy) = self.kids.get(&proxy_id).cloned() else { return Vec::new() };
        self.root_consuming_proxy_id = Some(proxy_id);
        vec![DataNodeAction::Send {
            to: proxy,
            message: IoMessage::MergeWith { node: Handle::new(self.id.clone(), Transport::Local) },
        }]
    }

    /// The root completes consuming its proxy once the proxy says `goodbye_parent`.
    pub fn complete_consuming_proxy(&mut self, proxy_id: &Id) -> Result<(), DistZeroError> {
        if self.parent.is_some() {
            return Err(DistZeroError::internal("only root nodes complete consuming a proxy"));
        }
        if self.height < 2 {
            return Err(DistZeroError::internal("root should have height >= 2 when consuming a proxy"));
        }
        if self.root_consuming_proxy_id.as_ref() != Some(proxy_id) {
            return Err(DistZeroError::internal("goodbye_parent from unexpected proxy"));
        }
        self.kid_order.retain(|id| id != proxy_id);
        self.kids.remove(proxy_id);
        self.kid_summaries.remove(proxy_id);
        self.root_consuming_proxy_id = None;
        self.height -= 1;
        if let Some(logger) = &self.logger {
            logger.log(DataNodeEvent::ConsumedProxy { node_id: self.id.clone(), proxy_id: proxy_id.clone() });
        }
        Ok(())
    }

    /// Starts bumping this root's height by spawning a proxy that adopts every current kid.
    fn bump_height(&mut self) -> DataNodeAction {
        let proxy_id = Id::new("DataNode_root_proxy");
        let adoptees: Vec<Handle> = self.kid_order.iter().filter_map(|id| self.kids.get(id).cloned()).collect();

        self.root_proxy_id = Some(proxy_id.clone());
        self.kids_for_proxy_to_adopt = Some(adoptees.clone());
        self.height += 1;
        self.kid_summaries.clear();

        if let Some(logger) = &self.logger {
            logger.log(DataNodeEvent::BumpedHeight { node_id: self.id.clone(), new_height: self.height });
        }
        DataNodeAction::SpawnProxy { node_id: proxy_id, height: self.height - 1, adoptees }
    }

    /// Finishes a height bump once the new proxy greets with `hello_parent`.
    pub fn finish_bumping_height(&mut self, proxy: Handle) -> Vec<DataNodeAction> {
        let proxy_id = proxy.node_id.clone();
        self.kid_summaries.clear();
        self.kid_order = vec![proxy_id.clone()];
        self.kids = HashMap::from([(proxy_id, proxy.clone())]);

        let old_kid_ids: Vec<Id> =
            self.kids_for_proxy_to_adopt.take().unwrap_or_default().into_iter().map(|h| h.node_id).collect();

        self.root_proxy_id = None;

        if let Some(adjacent) = self.adjacent.clone() {
            vec![DataNodeAction::Send {
                to: adjacent,
                message: IoMessage::AddedSender(distzero_transport::AddedSender {
                    node: proxy,
                    respond_to: Handle::new(self.id.clone(), Transport::Local),
                }),
            }]
        } else {
            let _ = old_kid_ids;
            Vec::new()
        }
    }

    /// Sets the adjacent link node handle (the exporter receiver for an
    /// `input` leaf, or the importer sender for an `output` leaf), and
    /// registers the matching half of the reliable-sequenced pairing.
    pub fn set_adjacent(&mut self, adjacent: Handle) {
        if self.is_leaf() {
            match self.variant {
                Variant::Output => {
                    self.linker.new_importer(adjacent.clone());
                    let _ = self.deltas.add_sender(adjacent.node_id.clone());
                }
                Variant::Input => {
                    self.linker.new_exporter(adjacent.clone(), true);
                }
            }
        }
        self.adjacent = Some(adjacent);
    }

    /// True while this leaf is buffering incoming deltas without applying them.
    pub fn is_deltas_only(&self) -> bool {
        self.deltas_only
    }

    /// Enters or leaves deltas-only mode.
    pub fn set_deltas_only(&mut self, deltas_only: bool) {
        self.deltas_only = deltas_only;
    }

    /// True iff every sender named in `before` has been seen at least
    /// through its cutoff, i.e. it is safe to finish deltas-only mode with
    /// `before` as the pop cap.
    pub fn deltas_cover(&self, before: &HashMap<Id, u64>) -> bool {
        self.deltas.covers(before)
    }

    /// Leaves deltas-only mode, folding every buffered delta up to (but not
    /// including) each sender's cutoff in `before` into accumulated state.
    pub fn finish_deltas_only(&mut self, before: &HashMap<Id, u64>) {
        let (new_state, _, _) = self.deltas.pop_deltas(self.leaf_state, Some(before));
        self.leaf_state = new_state;
        self.deltas_only = false;
    }

    /// Begins fanning out every future `input_action` export to `receivers`
    /// as well as this leaf's ordinary adjacent exporter, as part of a
    /// migration duplicating this leaf's outgoing flow to a node under
    /// construction.
    pub fn start_duplicating(&mut self, receivers: Vec<Handle>) {
        for receiver in receivers {
            self.duplicate_receivers.insert(receiver.node_id.clone(), receiver);
        }
    }

    /// Ends duplication to one receiver, returning its handle if it was
    /// being duplicated to.
    pub fn finish_duplicating(&mut self, receiver_id: &Id) -> Option<Handle> {
        self.duplicate_receivers.remove(receiver_id)
    }

    /// Applies an increment to an `output` leaf's accumulated state.
    pub fn apply_increment(&mut self, amount: i64) -> Result<(), DistZeroError> {
        if self.variant != Variant::Output || !self.is_leaf() {
            return Err(DistZeroError::internal("only output leaves maintain accumulated state"));
        }
        self.leaf_state += amount;
        Ok(())
    }

    /// Records one `input_action(amount)` at an `input` leaf, exporting it as
    /// the next numbered message to the adjacent link node.
    pub fn input_action(&mut self, amount: i64) -> Result<Vec<DataNodeAction>, DistZeroError> {
        if self.variant != Variant::Input || !self.is_leaf() {
            return Err(DistZeroError::internal("only input leaves accept input_action"));
        }
        let adjacent = self.adjacent.clone().ok_or_else(|| DistZeroError::internal("input leaf has no adjacent exporter"))?;
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        let message = SequenceMessage::Receive { sequence_number, message: DeltaMessage::InputAction { number: amount } };
        let exported = self
            .linker
            .exporter_mut(&adjacent.node_id)
            .ok_or_else(|| DistZeroError::internal("input leaf exporter missing"))?
            .export(sequence_number, message);
        let mut actions = vec![DataNodeAction::SendSequence { to: adjacent, message: exported.clone() }];
        actions.extend(
            self.duplicate_receivers
                .values()
                .map(|receiver| DataNodeAction::SendSequence { to: receiver.clone(), message: exported.clone() }),
        );
        Ok(actions)
    }

    /// Receives one [`SequenceMessage`] at an `output` leaf from its adjacent
    /// link node, buffering any new delta and folding the contiguous prefix
    /// into accumulated state.
    ///
    /// A message ahead of a gap is buffered rather than dropped: it is
    /// applied once the missing sequence numbers below it arrive, typically
    /// via retransmission. Duplicates are recovered locally (counted by the
    /// `Linker`, then ignored) rather than surfaced as errors.
    pub fn receive_sequence(&mut self, sender_id: Id, message: SequenceMessage) -> Result<(), DistZeroError> {
        if !self.is_leaf() {
            return Err(DistZeroError::internal("only leaves receive sequence messages"));
        }
        self.linker
            .receive_sequence_message(&sender_id, message.clone())
            .map_err(|e| DistZeroError::internal(e.to_string()))?;
        if self.variant != Variant::Output {
            return Ok(());
        }
        if let SequenceMessage::Receive { sequence_number, message: delta } = message {
            self.deltas.add_message(&sender_id, sequence_number, delta).map_err(|e| DistZeroError::internal(e.to_string()))?;
            // While deltas-only, new-flow deltas are buffered but withheld
            // from `leaf_state` until the migration finishes the switch and
            // explicitly pops them via `finish_deltas_only`.
            if !self.deltas_only {
                let (new_state, _, _) = self.deltas.pop_deltas(self.leaf_state, None);
                self.leaf_state = new_state;
            }
        }
        Ok(())
    }

    /// Dispatches one [`IoMessage`] addressed to this node from `sender_id`:
    /// every variant this node can be sent maps to one of the narrower
    /// handlers below.
    pub fn receive(&mut self, sender_id: Id, message: IoMessage) -> Result<Vec<DataNodeAction>, DistZeroError> {
        match message {
            IoMessage::HelloParent { kid } => {
                if self.root_proxy_id.as_ref() == Some(&sender_id) {
                    Ok(self.finish_bumping_height(kid))
                } else {
                    self.finish_adding_kid(sender_id, kid);
                    Ok(Vec::new())
                }
            }
            IoMessage::GoodbyeParent => {
                self.receive_goodbye_parent(sender_id)?;
                Ok(Vec::new())
            }
            IoMessage::KidSummary { size, n_kids, availability } => {
                self.receive_kid_summary(sender_id, KidSummary { size, n_kids, availability });
                Ok(Vec::new())
            }
            IoMessage::MergeWith { node } => self.receive_merge_with(node),
            IoMessage::Adopt { new_parent } => self.receive_adopt(new_parent),
            IoMessage::AddedSender(_) => Err(DistZeroError::internal("added_sender is only meaningful to a link node")),
        }
    }

    /// A `goodbye_parent` from `sender_id`: either the root finishing a proxy
    /// consumption, or any node finishing a kid merge.
    ///
    /// A `goodbye_parent` from a kid this node no longer tracks (e.g. one
    /// that adopted a height-bump proxy before this node heard of it) is
    /// tolerated as a no-op rather than treated as a protocol violation.
    fn receive_goodbye_parent(&mut self, sender_id: Id) -> Result<(), DistZeroError> {
        if self.root_consuming_proxy_id.as_ref() == Some(&sender_id) {
            return self.complete_consuming_proxy(&sender_id);
        }
        self.merging_kid_ids.remove(&sender_id);
        if self.kids.remove(&sender_id).is_some() {
            self.kid_order.retain(|id| id != &sender_id);
            self.kid_summaries.remove(&sender_id);
        }
        Ok(())
    }

    /// A `merge_with(new_parent)` command: hand every kid to `new_parent` via
    /// `adopt`, then depart from this node's own parent.
    fn receive_merge_with(&mut self, new_parent: Handle) -> Result<Vec<DataNodeAction>, DistZeroError> {
        let Some(parent) = self.parent.clone() else {
            return Err(DistZeroError::internal("root nodes cannot merge with another node"));
        };
        let mut actions: Vec<DataNodeAction> = self
            .kid_order
            .iter()
            .filter_map(|id| self.kids.get(id).cloned())
            .map(|kid| DataNodeAction::Send { to: kid, message: IoMessage::Adopt { new_parent: new_parent.clone() } })
            .collect();
        actions.push(DataNodeAction::Send { to: parent, message: IoMessage::GoodbyeParent });
        self.kid_order.clear();
        self.kids.clear();
        self.kid_summaries.clear();
        Ok(actions)
    }

    /// An `adopt(new_parent)` command: say goodbye to the old parent, then
    /// re-greet under the new one.
    fn receive_adopt(&mut self, new_parent: Handle) -> Result<Vec<DataNodeAction>, DistZeroError> {
        let Some(old_parent) = self.parent.clone() else {
            return Err(DistZeroError::internal("root nodes may not adopt a new parent"));
        };
        let mut actions = vec![DataNodeAction::Send { to: old_parent, message: IoMessage::GoodbyeParent }];
        self.parent = Some(new_parent.clone());
        self.sent_hello = false;
        actions.extend(self.send_hello_parent(&new_parent));
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SystemConfig {
        SystemConfig { data_node_kids_limit: 4, total_kid_capacity_trigger: 2, ..SystemConfig::default() }
    }

    #[test]
    fn root_spawns_a_kid_on_initialize_when_height_is_positive() {
        let mut node = DataNode::new(Id::new("root"), None, Variant::Output, 1, config());
        let actions = node.initialize();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], DataNodeAction::SpawnKid { .. }));
    }

    #[test]
    fn leaf_greets_its_parent_on_initialize() {
        let parent = Handle::new(Id::new("parent"), Transport::Local);
        let mut node = DataNode::new(Id::new("leaf"), Some(parent), Variant::Output, -1, config());
        let actions = node.initialize();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], DataNodeAction::Send { .. }));
    }

    #[test]
    fn bumps_height_when_full_and_low_on_capacity() {
        let mut node = DataNode::new(Id::new("root"), None, Variant::Output, 1, config());
        for i in 0..4 {
            let kid_id = Id::new(&format!("kid{i}"));
            node.finish_adding_kid(kid_id.clone(), Handle::new(kid_id.clone(), Transport::Local));
            node.receive_kid_summary(kid_id, KidSummary { size: 1000, n_kids: 0, availability: 0 });
        }
        let actions = node.elapse(1);
        assert!(actions.iter().any(|a| matches!(a, DataNodeAction::SpawnProxy { .. })));
        assert_eq!(node.height(), 2);
    }

    #[test]
    fn merges_two_small_kids_after_dwell_time() {
        let mut node = DataNode::new(Id::new("root"), None, Variant::Output, 1, config());
        for i in 0..2 {
            let kid_id = Id::new(&format!("kid{i}"));
            node.finish_adding_kid(kid_id.clone(), Handle::new(kid_id.clone(), Transport::Local));
            node.receive_kid_summary(kid_id, KidSummary { size: 0, n_kids: 0, availability: 1000 });
        }
        let before_dwell = node.elapse(config().time_to_wait_before_kid_merge_ms - 1);
        assert!(before_dwell.iter().all(|a| !matches!(a, DataNodeAction::Send { .. })));

        let after_dwell = node.elapse(2);
        assert!(after_dwell.iter().any(|a| matches!(a, DataNodeAction::Send { .. })));
    }

    #[test]
    fn merge_with_tells_every_kid_to_adopt_and_says_goodbye() {
        let parent = Handle::new(Id::new("parent"), Transport::Local);
        let new_parent = Handle::new(Id::new("right_kid"), Transport::Local);
        let mut node = DataNode::new(Id::new("left_kid"), Some(parent.clone()), Variant::Output, 0, config());
        let grandkid_id = Id::new("grandkid");
        let grandkid_handle = Handle::new(grandkid_id.clone(), Transport::Local);
        node.finish_adding_kid(grandkid_id.clone(), grandkid_handle.clone());

        let actions = node.receive(Id::new("parent"), IoMessage::MergeWith { node: new_parent }).unwrap();
        assert_eq!(node.kid_count(), 0);
        assert!(actions
            .iter()
            .any(|a| matches!(a, DataNodeAction::Send { to, message: IoMessage::Adopt { .. } } if *to == grandkid_handle)));
        assert!(actions.iter().any(|a| matches!(a, DataNodeAction::Send { to, message: IoMessage::GoodbyeParent } if *to == parent)));
    }

    #[test]
    fn adopt_says_goodbye_to_old_parent_and_hello_to_new_one() {
        let old_parent = Handle::new(Id::new("old_parent"), Transport::Local);
        let new_parent = Handle::new(Id::new("new_parent"), Transport::Local);
        let mut node = DataNode::new(Id::new("kid"), Some(old_parent.clone()), Variant::Output, -1, config());
        node.initialize();

        let actions = node.receive(Id::new("left_kid"), IoMessage::Adopt { new_parent: new_parent.clone() }).unwrap();
        assert!(actions.iter().any(|a| matches!(a, DataNodeAction::Send { to, message: IoMessage::GoodbyeParent } if *to == old_parent)));
        assert!(actions.iter().any(|a| matches!(a, DataNodeAction::Send { to, message: IoMessage::HelloParent { .. } } if *to == new_parent)));
    }

    #[test]
    fn goodbye_parent_completes_a_merge() {
        let mut node = DataNode::new(Id::new("root"), None, Variant::Output, 1, config());
        for i in 0..2 {
            let kid_id = Id::new(&format!("kid{i}"));
            node.finish_adding_kid(kid_id.clone(), Handle::new(kid_id.clone(), Transport::Local));
            node.receive_kid_summary(kid_id, KidSummary { size: 0, n_kids: 0, availability: 1000 });
        }
        node.elapse(config().time_to_wait_before_kid_merge_ms);
        assert_eq!(node.kid_count(), 2);

        let left_kid_id = node.kid_order[0].clone();
        node.receive(left_kid_id.clone(), IoMessage::GoodbyeParent).unwrap();
        assert_eq!(node.kid_count(), 1);
        assert!(!node.kid_order.contains(&left_kid_id));
    }
}
