//! The migration protocol: a coordinated, all-or-nothing replacement of one
//! flow subgraph by another while input keeps arriving.
//!
//! A `MigrationNode` coordinates a phased protocol (attach, start new flow,
//! flow started, optional sync, prepare for switch, switch, terminate) across
//! participants, each hosting exactly one [`Migrator`] role keyed by
//! `migration_id`, represented as a tagged enum rather than dynamic dispatch.

use std::collections::{HashMap, HashSet};

use distzero_logging::Logger;
use distzero_transport::{Handle, Id, MigrationMessage, MigratorRoleConfig};

use crate::errors::DistZeroError;
use crate::events::MigrationEvent;

/// Tracks a set of expected arrivals (e.g. "every kid has attached"),
/// reused across the attach, prepare-for-switch, switch, and terminate
/// phases, each of which waits for every expected peer before bubbling a
/// reply upward.
#[derive(Clone, Debug, Default)]
struct KidBarrier {
    expected: HashSet<Id>,
    arrived: HashSet<Id>,
}

impl KidBarrier {
    fn new(expected: HashSet<Id>) -> Self {
        KidBarrier { expected, arrived: HashSet::new() }
    }

    /// Records an arrival; returns `true` the moment every expected peer has arrived.
    fn arrive(&mut self, id: Id) -> bool {
        self.arrived.insert(id);
        self.is_complete()
    }

    fn is_complete(&self) -> bool {
        self.expected.is_subset(&self.arrived)
    }
}

/// The ids a `Sink`/`Removal` role must hear swap markers from before
/// declaring its switch complete: every old-flow sender, and (for a `Sink`
/// with new-flow senders already known) every new-flow sender. Roles with no
/// notion of flow senders (`Source`, `Insertion`) get two empty sets, so
/// their barriers degrade to whatever `expected_kids` alone provides.
fn flow_sender_ids(role: &MigratorRoleConfig) -> (HashSet<Id>, HashSet<Id>) {
    match role {
        MigratorRoleConfig::Sink { new_flow_senders, old_flow_sender_ids, .. } => (
            old_flow_sender_ids.iter().cloned().collect(),
            new_flow_senders.as_ref().map(|senders| senders.iter().map(|h| h.node_id.clone()).collect()).unwrap_or_default(),
        ),
        MigratorRoleConfig::Removal { old_flow_sender_ids } => (old_flow_sender_ids.iter().cloned().collect(), HashSet::new()),
        MigratorRoleConfig::Source { .. } | MigratorRoleConfig::Insertion { .. } => (HashSet::new(), HashSet::new()),
    }
}

/// A single participant's migration role, held in a node's `migrators`
/// table keyed by `migration_id`.
///
/// Handles the phase transitions common to every role; `switch_flows` and
/// `start_syncing` take state (a sequence number, an accumulated total) from
/// the hosting node directly, since a migrator does not itself own a linker
/// or leaf state.
pub struct Migrator {
    migration_id: Id,
    node_id: Id,
    role: MigratorRoleConfig,
    coordinator: Handle,

    attach_barrier: KidBarrier,
    flow_started_barrier: KidBarrier,
    prepare_barrier: KidBarrier,
    /// Gated on every old-flow sender reporting `swapped_from_duplicate`
    /// (plus this role's own kid subtree, if any).
    old_flow_switched_barrier: KidBarrier,
    /// Gated on every new-flow sender reporting `swapped_to_duplicate`
    /// (plus this role's own kid subtree, if any).
    new_flow_switched_barrier: KidBarrier,
    /// Set once both switch barriers have completed, so a later arrival on
    /// either barrier does not re-report `switched_flows` upward.
    switch_finished: bool,
    /// Per new-flow-sender cutoff reported by `swapped_to_duplicate`: the
    /// sequence number on the new flow that lines up with the old flow's
    /// cut point, used to pop a sink's buffered deltas-only backlog exactly
    /// up to the swap once the switch completes.
    new_flow_cutoff: HashMap<Id, u64>,
    terminate_barrier: KidBarrier,
    sync_barrier: KidBarrier,

    deltas_only: bool,
    logger: Option<Logger<MigrationEvent>>,
}

impl Migrator {
    /// Constructs a role for `node_id`, waiting on `expected_kids` (its
    /// subtree, if it has one) before bubbling attach/prepare/switch/
    /// terminate acknowledgements up to `coordinator`.
    pub fn new(migration_id: Id, node_id: Id, role: MigratorRoleConfig, coordinator: Handle, expected_kids: Vec<Id>) -> Self {
        let expected: HashSet<Id> = expected_kids.into_iter().collect();
        let (old_flow_senders, new_flow_senders) = flow_sender_ids(&role);
        let old_flow_switched: HashSet<Id> = expected.union(&old_flow_senders).cloned().collect();
        let new_flow_switched: HashSet<Id> = expected.union(&new_flow_senders).cloned().collect();
        Migrator {
            migration_id,
            node_id,
            role,
            coordinator,
            attach_barrier: KidBarrier::new(expected.clone()),
            flow_started_barrier: KidBarrier::new(expected.clone()),
            prepare_barrier: KidBarrier::new(expected.clone()),
            old_flow_switched_barrier: KidBarrier::new(old_flow_switched),
            new_flow_switched_barrier: KidBarrier::new(new_flow_switched),
            switch_finished: false,
            new_flow_cutoff: HashMap::new(),
            terminate_barrier: KidBarrier::new(expected),
            sync_barrier: KidBarrier::default(),
            deltas_only: false,
            logger: None,
        }
    }

    /// Binds a logger for this role's [`MigrationEvent`]s.
    pub fn set_logger(&mut self, logger: Logger<MigrationEvent>) {
        self.logger = Some(logger);
    }

    /// This role's migration id.
    pub fn migration_id(&self) -> &Id {
        &self.migration_id
    }

    /// True while this role is buffering new-flow deltas without applying them.
    pub fn is_deltas_only(&self) -> bool {
        self.deltas_only
    }

    /// The per-sender sequence number cutoff reported by new-flow senders so
    /// far, keyed by sender id: where a sink's buffered deltas-only backlog
    /// should be popped up to once the switch completes.
    pub fn new_flow_cutoff(&self) -> &HashMap<Id, u64> {
        &self.new_flow_cutoff
    }

    /// Runs once at creation: a leaf participant (no kids to wait on)
    /// attaches immediately.
    pub fn initialize(&mut self) -> Vec<(Handle, MigrationMessage)> {
        if self.attach_barrier.is_complete() {
            self.send_attached()
        } else {
            Vec::new()
        }
    }

    fn send_attached(&self) -> Vec<(Handle, MigrationMessage)> {
        vec![(self.coordinator.clone(), MigrationMessage::AttachedMigrator { migration_id: self.migration_id.clone() })]
    }

    /// Handles one migration message received from `sender_id`.
    ///
    /// `switch_flows` and `start_syncing` are not handled here: they need
    /// state (a sequence number, an accumulated total) the hosting node must
    /// supply, so the node calls those methods directly instead of routing
    /// the triggering message through `receive`.
    pub fn receive(&mut self, sender_id: &Id, message: &MigrationMessage) -> Result<Vec<(Handle, MigrationMessage)>, DistZeroError> {
        match message {
            MigrationMessage::AttachedMigrator { .. } => {
                if self.attach_barrier.arrive(sender_id.clone()) {
                    if let Some(logger) = &self.logger {
                        logger.log(MigrationEvent::Attached { migration_id: self.migration_id.clone(), node_id: self.node_id.clone() });
                    }
                    Ok(self.send_attached())
                } else {
                    Ok(Vec::new())
                }
            }
            MigrationMessage::CompletedFlow { .. } | MigrationMessage::StartedFlow { .. } => {
                if self.flow_started_barrier.arrive(sender_id.clone()) {
                    Ok(vec![(self.coordinator.clone(), MigrationMessage::StartedFlow { migration_id: self.migration_id.clone() })])
                } else {
                    Ok(Vec::new())
                }
            }
            MigrationMessage::SumTotalSet => {
                if self.sync_barrier.arrive(sender_id.clone()) {
                    Ok(vec![(self.coordinator.clone(), MigrationMessage::SyncerIsSynced)])
                } else {
                    Ok(Vec::new())
                }
            }
            MigrationMessage::PrepareForSwitch { .. } => {
                self.deltas_only = true;
                if self.prepare_barrier.is_complete() {
                    Ok(vec![(self.coordinator.clone(), MigrationMessage::PreparedForSwitch { migration_id: self.migration_id.clone() })])
                } else {
                    Ok(Vec::new())
                }
            }
            MigrationMessage::PreparedForSwitch { .. } => {
                if self.prepare_barrier.arrive(sender_id.clone()) && self.deltas_only {
                    Ok(vec![(self.coordinator.clone(), MigrationMessage::PreparedForSwitch { migration_id: self.migration_id.clone() })])
                } else {
                    Ok(Vec::new())
                }
            }
            MigrationMessage::SwappedFromDuplicate { .. } => {
                self.old_flow_switched_barrier.arrive(sender_id.clone());
                Ok(self.maybe_finish_switch())
            }
            MigrationMessage::SwappedToDuplicate { first_live_sequence_number } => {
                self.new_flow_cutoff.insert(sender_id.clone(), *first_live_sequence_number);
                self.new_flow_switched_barrier.arrive(sender_id.clone());
                Ok(self.maybe_finish_switch())
            }
            MigrationMessage::SwitchedFlows { .. } => {
                // A child migrator's own subtree has finished switching both
                // flows; it counts as an arrival on both barriers here.
                self.old_flow_switched_barrier.arrive(sender_id.clone());
                self.new_flow_switched_barrier.arrive(sender_id.clone());
                Ok(self.maybe_finish_switch())
            }
            MigrationMessage::TerminateMigrator { .. } => {
                if self.terminate_barrier.is_complete() {
                    Ok(vec![(self.coordinator.clone(), MigrationMessage::MigratorTerminated { migration_id: self.migration_id.clone() })])
                } else {
                    Ok(Vec::new())
                }
            }
            MigrationMessage::MigratorTerminated { .. } => {
                if self.terminate_barrier.arrive(sender_id.clone()) {
                    if let Some(logger) = &self.logger {
                        logger.log(MigrationEvent::Terminated { migration_id: self.migration_id.clone(), node_id: self.node_id.clone() });
                    }
                    Ok(vec![(self.coordinator.clone(), MigrationMessage::MigratorTerminated { migration_id: self.migration_id.clone() })])
                } else {
                    Ok(Vec::new())
                }
            }
            other => Err(DistZeroError::internal(format!("migrator for {:?} received unexpected message {other:?}", self.node_id))),
        }
    }

    /// Reports `switched_flows` upward the moment both the old-flow and
    /// new-flow switch barriers have completed, exactly once.
    fn maybe_finish_switch(&mut self) -> Vec<(Handle, MigrationMessage)> {
        if self.switch_finished {
            return Vec::new();
        }
        if self.old_flow_switched_barrier.is_complete() && self.new_flow_switched_barrier.is_complete() {
            self.switch_finished = true;
            self.deltas_only = false;
            vec![(self.coordinator.clone(), MigrationMessage::SwitchedFlows { migration_id: self.migration_id.clone() })]
        } else {
            Vec::new()
        }
    }

    /// A leaf sink/insertion role reports its local new-flow setup is done.
    pub fn flow_ready(&self) -> Vec<(Handle, MigrationMessage)> {
        vec![(self.coordinator.clone(), MigrationMessage::CompletedFlow { sequence_number: 0 })]
    }

    /// A syncing source divides `total` evenly across `receivers`, with any
    /// remainder going to the earliest receivers, and sends each its slice.
    pub fn start_syncing(&mut self, total: i64, receivers: &[Handle]) -> Result<Vec<(Handle, MigrationMessage)>, DistZeroError> {
        match &self.role {
            MigratorRoleConfig::Source { will_sync: true } => {
                self.sync_barrier = KidBarrier::new(receivers.iter().map(|h| h.node_id.clone()).collect());
                let n = receivers.len() as i64;
                let base = if n > 0 { total / n } else { 0 };
                let mut remainder = if n > 0 { total % n } else { 0 };
                let from_node = Handle::new(self.node_id.clone(), receivers.first().map(|h| h.transport).unwrap_or(distzero_transport::Transport::Local));
                let messages = receivers
                    .iter()
                    .map(|receiver| {
                        let mut slice = base;
                        if remainder > 0 {
                            slice += 1;
                            remainder -= 1;
                        }
                        (
                            receiver.clone(),
                            MigrationMessage::SetSumTotal { migration_id: self.migration_id.clone(), from_node: from_node.clone(), total: slice },
                        )
                    })
                    .collect();
                Ok(messages)
            }
            other => Err(DistZeroError::internal(format!("only syncing sources divide state, got {other:?}"))),
        }
    }

    /// A source performs the atomic flow swap, reporting the first sequence
    /// number live on each side of the cut.
    pub fn switch_flows(&mut self, first_live_sequence_number: u64) -> Result<Vec<(Handle, MigrationMessage)>, DistZeroError> {
        match &self.role {
            MigratorRoleConfig::Source { .. } => {
                if let Some(logger) = &self.logger {
                    logger.log(MigrationEvent::Switched {
                        migration_id: self.migration_id.clone(),
                        node_id: self.node_id.clone(),
                        first_live_sequence_number,
                    });
                }
                Ok(vec![
                    (self.coordinator.clone(), MigrationMessage::SwappedFromDuplicate { first_live_sequence_number }),
                    (self.coordinator.clone(), MigrationMessage::SwappedToDuplicate { first_live_sequence_number }),
                ])
            }
            other => Err(DistZeroError::internal(format!("only source migrators switch flows, got {other:?}"))),
        }
    }
}

/// Which phase a [`MigrationNode`] coordinator has reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Waiting for every participant's `attached_migrator`.
    Attaching,
    /// Sources have been told to start the new flow.
    StartingFlow,
    /// Every sink has reported the new flow is up.
    FlowStarted,
    /// Sources are dividing accumulated state across new receivers.
    Syncing,
    /// Every participant has entered `deltas_only` mode.
    PreparingForSwitch,
    /// Sources have performed the atomic cut.
    Switching,
    /// Tearing every migrator down.
    Terminating,
    /// The migration has fully completed.
    Done,
}

/// The coordinator of one migration, driving every participant through the
/// phases of the protocol in lock-step.
pub struct MigrationNode {
    migration_id: Id,
    self_handle: Handle,
    phase: MigrationPhase,
    participants: Vec<Id>,
    participant_handles: HashMap<Id, Handle>,
    role_configs: HashMap<Id, MigratorRoleConfig>,
    sources: HashSet<Id>,
    sinks: HashSet<Id>,
    will_sync: bool,
    sync_receivers: Vec<Handle>,

    attached: HashSet<Id>,
    flow_started: HashSet<Id>,
    synced: HashSet<Id>,
    prepared: HashSet<Id>,
    switched: HashSet<Id>,
    terminated: HashSet<Id>,

    logger: Option<Logger<MigrationEvent>>,
}

impl MigrationNode {
    /// Builds a coordinator for `migration_id` over `participants` (each with
    /// a handle and the role config the coordinator will hand it at attach
    /// time), with `sources`/`sinks` identifying which participants play
    /// those roles.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        migration_id: Id,
        self_handle: Handle,
        participants: Vec<(Id, Handle, MigratorRoleConfig)>,
        sources: Vec<Id>,
        sinks: Vec<Id>,
        will_sync: bool,
        sync_receivers: Vec<Handle>,
    ) -> Self {
        let mut participant_handles = HashMap::new();
        let mut role_configs = HashMap::new();
        let mut ids = Vec::new();
        for (id, handle, config) in participants {
            ids.push(id.clone());
            participant_handles.insert(id.clone(), handle);
            role_configs.insert(id, config);
        }
        MigrationNode {
            migration_id,
            self_handle,
            phase: MigrationPhase::Attaching,
            participants: ids,
            participant_handles,
            role_configs,
            sources: sources.into_iter().collect(),
            sinks: sinks.into_iter().collect(),
            will_sync,
            sync_receivers,
            attached: HashSet::new(),
            flow_started: HashSet::new(),
            synced: HashSet::new(),
            prepared: HashSet::new(),
            switched: HashSet::new(),
            terminated: HashSet::new(),
            logger: None,
        }
    }

    /// Binds a logger for this coordinator's [`MigrationEvent`]s.
    pub fn set_logger(&mut self, logger: Logger<MigrationEvent>) {
        self.logger = Some(logger);
    }

    /// The current phase.
    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Begins the migration by asking every participant to attach its role.
    pub fn initialize(&mut self) -> Vec<(Handle, MigrationMessage)> {
        self.participants
            .iter()
            .map(|id| {
                (
                    self.participant_handles[id].clone(),
                    MigrationMessage::AttachMigrator {
                        migration_id: self.migration_id.clone(),
                        migration: self.self_handle.clone(),
                        config: self.role_configs[id].clone(),
                    },
                )
            })
            .collect()
    }

    /// Handles one migration message received from `sender_id`, returning
    /// whatever messages this phase transition requires sending.
    pub fn receive(&mut self, sender_id: Id, message: &MigrationMessage) -> Result<Vec<(Handle, MigrationMessage)>, DistZeroError> {
        match message {
            MigrationMessage::AttachedMigrator { .. } => {
                self.attached.insert(sender_id);
                if self.phase == MigrationPhase::Attaching && self.attached.len() == self.participants.len() {
                    self.phase = MigrationPhase::StartingFlow;
                    return Ok(self.advance_messages());
                }
                Ok(Vec::new())
            }
            MigrationMessage::StartedFlow { .. } => {
                self.flow_started.insert(sender_id);
                if self.phase == MigrationPhase::StartingFlow && self.sinks.is_subset(&self.flow_started) {
                    self.phase = if self.will_sync { MigrationPhase::Syncing } else { MigrationPhase::PreparingForSwitch };
                    return Ok(self.advance_messages());
                }
                Ok(Vec::new())
            }
            MigrationMessage::SyncerIsSynced => {
                self.synced.insert(sender_id);
                if self.phase == MigrationPhase::Syncing && self.sources.is_subset(&self.synced) {
                    self.phase = MigrationPhase::PreparingForSwitch;
                    return Ok(self.advance_messages());
                }
                Ok(Vec::new())
            }
            MigrationMessage::PreparedForSwitch { .. } => {
                self.prepared.insert(sender_id);
                if self.phase == MigrationPhase::PreparingForSwitch && self.prepared.len() == self.participants.len() {
                    self.phase = MigrationPhase::Switching;
                    return Ok(self.advance_messages());
                }
                Ok(Vec::new())
            }
            MigrationMessage::SwitchedFlows { .. } => {
                self.switched.insert(sender_id);
                if self.phase == MigrationPhase::Switching && self.sources.is_subset(&self.switched) {
                    self.phase = MigrationPhase::Terminating;
                    return Ok(self.advance_messages());
                }
                Ok(Vec::new())
            }
            // Relayed informationally by a switching source; the coordinator
            // only gates phase advancement on `switched_flows`.
            MigrationMessage::SwappedFromDuplicate { .. } | MigrationMessage::SwappedToDuplicate { .. } => Ok(Vec::new()),
            MigrationMessage::MigratorTerminated { .. } => {
                self.terminated.insert(sender_id);
                if self.phase == MigrationPhase::Terminating && self.terminated.len() == self.participants.len() {
                    self.phase = MigrationPhase::Done;
                }
                Ok(Vec::new())
            }
            other => Err(DistZeroError::internal(format!("migration coordinator received unexpected message {other:?}"))),
        }
    }

    fn advance_messages(&self) -> Vec<(Handle, MigrationMessage)> {
        match self.phase {
            MigrationPhase::StartingFlow => {
                self.sources.iter().map(|id| (self.participant_handles[id].clone(), MigrationMessage::StartFlow { migration_id: self.migration_id.clone() })).collect()
            }
            MigrationPhase::Syncing => self
                .sources
                .iter()
                .map(|id| {
                    (
                        self.participant_handles[id].clone(),
                        MigrationMessage::StartSyncing { migration_id: self.migration_id.clone(), receivers: self.sync_receivers.clone() },
                    )
                })
                .collect(),
            MigrationPhase::PreparingForSwitch => self
                .participants
                .iter()
                .map(|id| (self.participant_handles[id].clone(), MigrationMessage::PrepareForSwitch { migration_id: self.migration_id.clone() }))
                .collect(),
            MigrationPhase::Switching => {
                self.sources.iter().map(|id| (self.participant_handles[id].clone(), MigrationMessage::SwitchFlows { migration_id: self.migration_id.clone() })).collect()
            }
            MigrationPhase::Terminating => self
                .participants
                .iter()
                .map(|id| (self.participant_handles[id].clone(), MigrationMessage::TerminateMigrator { migration_id: self.migration_id.clone() }))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distzero_transport::Transport;

    fn handle(prefix: &str) -> Handle {
        Handle::new(Id::new(prefix), Transport::Local)
    }

    #[test]
    fn kid_barrier_completes_only_once_every_expected_id_arrives() {
        let mut barrier = KidBarrier::new([Id::from_raw("a"), Id::from_raw("b")].into_iter().collect());
        assert!(!barrier.arrive(Id::from_raw("a")));
        assert!(barrier.arrive(Id::from_raw("b")));
    }

    #[test]
    fn a_leaf_migrator_attaches_immediately() {
        let mut migrator = Migrator::new(Id::new("Migration"), Id::new("Source"), MigratorRoleConfig::Source { will_sync: false }, handle("Coordinator"), Vec::new());
        let sent = migrator.initialize();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1, MigrationMessage::AttachedMigrator { .. }));
    }

    #[test]
    fn single_source_single_sink_migration_runs_to_completion() {
        let migration_id = Id::new("Migration");
        let source_id = Id::new("Source");
        let sink_id = Id::new("Sink");
        let coordinator_self = handle("Coordinator");

        let mut coordinator = MigrationNode::new(
            migration_id.clone(),
            coordinator_self.clone(),
            vec![
                (source_id.clone(), handle("SourceHandle"), MigratorRoleConfig::Source { will_sync: false }),
                (sink_id.clone(), handle("SinkHandle"), MigratorRoleConfig::Sink { new_flow_senders: None, old_flow_sender_ids: Vec::new(), will_sync: false }),
            ],
            vec![source_id.clone()],
            vec![sink_id.clone()],
            false,
            Vec::new(),
        );
        let mut source = Migrator::new(migration_id.clone(), source_id.clone(), MigratorRoleConfig::Source { will_sync: false }, coordinator_self.clone(), Vec::new());
        let mut sink = Migrator::new(migration_id.clone(), sink_id.clone(), MigratorRoleConfig::Sink { new_flow_senders: None, old_flow_sender_ids: Vec::new(), will_sync: false }, coordinator_self, Vec::new());

        coordinator.initialize();
        for (participant_id, message) in [(&source_id, source.initialize()), (&sink_id, sink.initialize())].into_iter().flat_map(|(id, msgs)| msgs.into_iter().map(move |(_, m)| (id, m))) {
            coordinator.receive(participant_id.clone(), &message).unwrap();
        }
        assert_eq!(coordinator.phase(), MigrationPhase::StartingFlow);

        let started = sink.flow_ready();
        for (_, message) in started {
            coordinator.receive(sink_id.clone(), &message).unwrap();
        }
        assert_eq!(coordinator.phase(), MigrationPhase::PreparingForSwitch);

        for (participant_id, migrator) in [(&source_id, &mut source), (&sink_id, &mut sink)] {
            let prepared = migrator.receive(&coordinator_self_id(), &MigrationMessage::PrepareForSwitch { migration_id: migration_id.clone() }).unwrap();
            for (_, message) in prepared {
                coordinator.receive(participant_id.clone(), &message).unwrap();
            }
        }
        assert_eq!(coordinator.phase(), MigrationPhase::Switching);

        for (_, message) in source.switch_flows(42).unwrap() {
            coordinator.receive(source_id.clone(), &message).unwrap();
        }
        let switched = source.receive(&source_id, &MigrationMessage::SwitchedFlows { migration_id: migration_id.clone() }).unwrap();
        for (_, message) in switched {
            coordinator.receive(source_id.clone(), &message).unwrap();
        }
        let sink_switched = sink.receive(&sink_id, &MigrationMessage::SwitchedFlows { migration_id: migration_id.clone() }).unwrap();
        for (_, message) in sink_switched {
            coordinator.receive(sink_id.clone(), &message).unwrap();
        }
        assert_eq!(coordinator.phase(), MigrationPhase::Terminating);

        for (participant_id, migrator) in [(&source_id, &mut source), (&sink_id, &mut sink)] {
            let terminated = migrator.receive(&coordinator_self_id(), &MigrationMessage::TerminateMigrator { migration_id: migration_id.clone() }).unwrap();
            for (_, message) in terminated {
                coordinator.receive(participant_id.clone(), &message).unwrap();
            }
        }
        assert_eq!(coordinator.phase(), MigrationPhase::Done);
    }

    fn coordinator_self_id() -> Id {
        Id::from_raw("coordinator-self")
    }
}
