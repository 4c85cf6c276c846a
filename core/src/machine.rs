//! The single-threaded, cooperatively-scheduled run-loop a machine uses to
//! host nodes.
//!
//! A `Machine` owns every node resident on it, dispatches `NetworkMessage`s
//! to the right one, and on each tick both elapses every node's timers and
//! drains whatever arrived on its data-plane (UDP) and control-plane (TCP)
//! sockets. Sockets here are plain blocking/nonblocking `std::net`, not an
//! async runtime.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use serde::Serialize;

use distzero_logging::Registry;
use distzero_transport::{
    Handle, Id, IoMessage, MachineDeliverToNode, MigrationMessage, MigratorRoleConfig, NetworkMessage,
    SequenceMessage, Transport, Variant,
};

use crate::config::{SystemConfig, MSG_BUFSIZE};
use crate::descriptors::{
    ConnectorKindConfig, DataNodeConfig, LeafConfig, LinkNodeConfig, MigrationNodeConfig, SumNodeConfig,
};
use crate::errors::DistZeroError;
use crate::events::{DataNodeEvent, LinkNodeEvent, MigrationEvent};
use crate::migration::{MigrationNode, Migrator};
use crate::node::data::{DataNode, DataNodeAction};
use crate::node::link::{LinkNode, LinkNodeAction};

/// The node kinds a `Machine` actually runs logic for.
///
/// A connector's interior layers (see [`crate::connector`]) are not given a
/// third, numerically-active kind here: the specific numeric operators a
/// dataflow program runs are out of scope, so an interior node spawned by a
/// [`LinkNode`] is tracked only for topology introspection.
/// [`crate::testing::SumAggregator`] is the test-only stand-in that gives an
/// interior position real behavior, wired up by a harness that does not
/// reuse `Machine` at all (see that module's doc comment).
enum NodeKind {
    Data(DataNode),
    Link(LinkNode),
    /// A connector interior position; carries no numeric state of its own.
    Interior {
        #[allow(dead_code)]
        senders: Vec<Id>,
        #[allow(dead_code)]
        receivers: Vec<Id>,
    },
}

/// One machine's resident nodes, migrators, and sockets.
pub struct Machine {
    config: SystemConfig,
    self_transport: Transport,
    nodes: HashMap<Id, NodeKind>,
    /// Participant migrator roles, keyed by the hosting node then by migration id.
    migrators: HashMap<Id, HashMap<Id, Migrator>>,
    /// Migration coordinators, keyed by their own id (which doubles as the migration id).
    migration_nodes: HashMap<Id, MigrationNode>,
    registry: Registry,
    inbox: VecDeque<MachineDeliverToNode>,
    udp_socket: Option<UdpSocket>,
    tcp_listener: Option<TcpListener>,
}

impl Machine {
    /// Builds a machine with no sockets bound: every handle it hands out
    /// addresses `Transport::Local`, suitable for the in-process test
    /// harness and single-machine deployments.
    pub fn new(config: SystemConfig) -> Self {
        Machine {
            config,
            self_transport: Transport::Local,
            nodes: HashMap::new(),
            migrators: HashMap::new(),
            migration_nodes: HashMap::new(),
            registry: Registry::new(Instant::now()),
            inbox: VecDeque::new(),
            udp_socket: None,
            tcp_listener: None,
        }
    }

    /// Binds the data-plane UDP socket and control-plane TCP listener, both
    /// nonblocking so a single cooperative thread can poll them once a tick.
    pub fn bind(config: SystemConfig, udp_addr: SocketAddr, tcp_addr: SocketAddr) -> std::io::Result<Self> {
        let udp_socket = UdpSocket::bind(udp_addr)?;
        udp_socket.set_nonblocking(true)?;
        let tcp_listener = TcpListener::bind(tcp_addr)?;
        tcp_listener.set_nonblocking(true)?;

        let mut machine = Machine::new(config);
        machine.self_transport = Transport::Udp(udp_addr);
        machine.udp_socket = Some(udp_socket);
        machine.tcp_listener = Some(tcp_listener);
        Ok(machine)
    }

    /// The config this machine's nodes were built with.
    pub fn config(&self) -> SystemConfig {
        self.config
    }

    /// A handle usable by anyone holding it to reach `node_id` on this machine.
    pub fn handle_for(&self, node_id: &Id) -> Handle {
        Handle::new(node_id.clone(), self.self_transport)
    }

    /// True iff `node_id` is hosted on this machine.
    pub fn contains(&self, node_id: &Id) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Binds a [`DataNodeEvent`] logger for `node_id`, registering it under
    /// `name` for later lookup via [`Self::registry`].
    pub fn log_data_node(&mut self, node_id: &Id, name: &str, action: Box<dyn Fn(&Duration, &[(Duration, DataNodeEvent)])>) {
        self.registry.insert(name.to_string(), action);
        let Some(logger) = self.registry.get::<DataNodeEvent>(name) else { return };
        if let Some(NodeKind::Data(node)) = self.nodes.get_mut(node_id) {
            node.set_logger(logger);
        }
    }

    /// Binds a [`LinkNodeEvent`] logger for `node_id`, registering it under `name`.
    pub fn log_link_node(&mut self, node_id: &Id, name: &str, action: Box<dyn Fn(&Duration, &[(Duration, LinkNodeEvent)])>) {
        self.registry.insert(name.to_string(), action);
        let Some(logger) = self.registry.get::<LinkNodeEvent>(name) else { return };
        if let Some(NodeKind::Link(node)) = self.nodes.get_mut(node_id) {
            node.set_logger(logger);
        }
    }

    /// The named-logger registry backing this machine's nodes.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ---- spawning ----------------------------------------------------

    /// Spawns a fresh [`DataNode`] from `cfg`, enacting whatever it does on
    /// `initialize`.
    pub fn spawn_data_node(&mut self, cfg: DataNodeConfig) -> Id {
        let node_id = cfg.node_id.clone();
        let mut node = DataNode::new(node_id.clone(), cfg.parent, cfg.variant, cfg.height, self.config);
        let actions = node.initialize();
        self.nodes.insert(node_id.clone(), NodeKind::Data(node));
        self.enact_data_actions(node_id.clone(), actions);
        self.drain();
        node_id
    }

    /// Spawns an external-facing leaf (height `-1`) under `cfg.parent`.
    pub fn spawn_leaf(&mut self, cfg: LeafConfig) -> Id {
        self.spawn_data_node(DataNodeConfig { node_id: cfg.node_id, parent: Some(cfg.parent), variant: cfg.variant, height: -1 })
    }

    /// Spawns an uninitialized [`LinkNode`], waiting for its expected left
    /// and right configurations.
    pub fn spawn_link_node(&mut self, cfg: LinkNodeConfig) -> Id {
        let node_id = cfg.node_id.clone();
        let node = LinkNode::new(node_id.clone(), cfg.connector_kind.into(), cfg.expected_left_parents, cfg.expected_right_parents, self.config);
        self.nodes.insert(node_id.clone(), NodeKind::Link(node));
        node_id
    }

    /// Spawns a sum-aggregating [`LinkNode`], tuned with `SystemConfig`'s
    /// sum-node sender/receiver limits (see [`crate::descriptors::sum_node_config`]).
    pub fn spawn_sum_node(&mut self, cfg: SumNodeConfig) -> Id {
        self.spawn_link_node(LinkNodeConfig {
            node_id: cfg.node_id,
            connector_kind: ConnectorKindConfig::AllToAll,
            expected_left_parents: cfg.expected_left_parents,
            expected_right_parents: cfg.expected_right_parents,
        })
    }

    /// Spawns the coordinator for one migration, kicking off the `Attaching`
    /// phase against every participant.
    ///
    /// Every participant in `cfg.participant_ids` must already be resident
    /// on *some* machine reachable by a handle this machine can construct
    /// (local participants are resolved via [`Self::handle_for`]; remote
    /// ones should be attached through [`Self::spawn_migration_with_handles`]
    /// instead).
    pub fn spawn_migration(&mut self, cfg: MigrationNodeConfig) -> Id {
        let handles: HashMap<Id, Handle> = cfg.participant_ids.iter().map(|id| (id.clone(), self.handle_for(id))).collect();
        self.spawn_migration_with_handles(cfg, handles)
    }

    /// As [`Self::spawn_migration`], but resolving participant handles from
    /// `handles` instead of assuming every participant is local.
    pub fn spawn_migration_with_handles(&mut self, cfg: MigrationNodeConfig, handles: HashMap<Id, Handle>) -> Id {
        let migration_id = cfg.migration_id.clone();
        let self_handle = self.handle_for(&migration_id);
        let sources: std::collections::HashSet<Id> = cfg.source_ids.iter().cloned().collect();
        let sinks: std::collections::HashSet<Id> = cfg.sink_ids.iter().cloned().collect();

        let participants: Vec<(Id, Handle, MigratorRoleConfig)> = cfg
            .participant_ids
            .iter()
            .map(|id| {
                let handle = handles.get(id).cloned().unwrap_or_else(|| self.handle_for(id));
                let role = if sources.contains(id) {
                    MigratorRoleConfig::Source { will_sync: cfg.will_sync }
                } else if sinks.contains(id) {
                    MigratorRoleConfig::Sink { new_flow_senders: None, old_flow_sender_ids: Vec::new(), will_sync: cfg.will_sync }
                } else {
                    MigratorRoleConfig::Insertion { will_sync: cfg.will_sync }
                };
                (id.clone(), handle, role)
            })
            .collect();
        let sync_receivers: Vec<Handle> = cfg.sink_ids.iter().map(|id| handles.get(id).cloned().unwrap_or_else(|| self.handle_for(id))).collect();

        let mut coordinator =
            MigrationNode::new(migration_id.clone(), self_handle, participants, cfg.source_ids, cfg.sink_ids, cfg.will_sync, sync_receivers);
        let actions = coordinator.initialize();
        self.migration_nodes.insert(migration_id.clone(), coordinator);
        self.enact_migration_actions(migration_id.clone(), actions);
        self.drain();
        migration_id
    }

    /// Binds a [`MigrationEvent`] logger for a migration coordinator.
    pub fn log_migration(&mut self, migration_id: &Id, name: &str, action: Box<dyn Fn(&Duration, &[(Duration, MigrationEvent)])>) {
        self.registry.insert(name.to_string(), action);
        let Some(logger) = self.registry.get::<MigrationEvent>(name) else { return };
        if let Some(coordinator) = self.migration_nodes.get_mut(migration_id) {
            coordinator.set_logger(logger);
        }
    }

    fn spawn_kid_of(&mut self, parent_id: &Id, node_id: Id, height: i32, variant: Variant) {
        let parent_handle = self.handle_for(parent_id);
        let mut kid = DataNode::new(node_id.clone(), Some(parent_handle), variant, height, self.config);
        let actions = kid.initialize();
        self.nodes.insert(node_id.clone(), NodeKind::Data(kid));
        self.enact_data_actions(node_id, actions);
    }

    /// Spawns the proxy a height bump asks for, seeding it directly with the
    /// kids it is adopting (bypassing the usual greet-then-register
    /// handshake, since the adoptees are already known) and redirecting each
    /// adoptee to it with an `adopt` message.
    fn spawn_proxy(&mut self, root_id: &Id, node_id: Id, height: i32, variant: Variant, adoptees: Vec<Handle>) {
        let parent_handle = self.handle_for(root_id);
        let mut proxy = DataNode::new(node_id.clone(), Some(parent_handle), variant, height, self.config);
        for adoptee in &adoptees {
            proxy.finish_adding_kid(adoptee.node_id.clone(), adoptee.clone());
        }
        let actions = proxy.initialize();
        self.nodes.insert(node_id.clone(), NodeKind::Data(proxy));
        self.enact_data_actions(node_id.clone(), actions);

        let proxy_handle = self.handle_for(&node_id);
        for adoptee in adoptees {
            self.queue_local(adoptee.node_id, node_id.clone(), NetworkMessage::Io(IoMessage::Adopt { new_parent: proxy_handle.clone() }));
        }
    }

    fn spawn_interior(&mut self, node_id: Id, senders: Vec<Id>, receivers: Vec<Id>) {
        self.nodes.insert(node_id, NodeKind::Interior { senders, receivers });
    }

    // ---- enacting node-reported side effects --------------------------

    fn enact_data_actions(&mut self, node_id: Id, actions: Vec<DataNodeAction>) {
        for action in actions {
            match action {
                DataNodeAction::Send { to, message } => self.send(node_id.clone(), &to, NetworkMessage::Io(message)),
                DataNodeAction::SendSequence { to, message } => self.send(node_id.clone(), &to, NetworkMessage::Sequence(message)),
                DataNodeAction::SpawnKid { node_id: kid_id, height } => {
                    let variant = self.node_variant(&node_id).unwrap_or(Variant::Output);
                    self.spawn_kid_of(&node_id, kid_id, height, variant);
                }
                DataNodeAction::SpawnProxy { node_id: proxy_id, height, adoptees } => {
                    let variant = self.node_variant(&node_id).unwrap_or(Variant::Output);
                    self.spawn_proxy(&node_id, proxy_id, height, variant, adoptees);
                }
            }
        }
    }

    fn enact_link_actions(&mut self, node_id: Id, actions: Vec<LinkNodeAction>) {
        for action in actions {
            match action {
                LinkNodeAction::Send { to, message } => self.send(node_id.clone(), &to, NetworkMessage::Migration(message)),
                LinkNodeAction::SpawnInterior { node_id: interior_id, senders, receivers } => {
                    self.spawn_interior(interior_id, senders, receivers);
                }
            }
        }
    }

    fn enact_migration_actions(&mut self, node_id: Id, actions: Vec<(Handle, MigrationMessage)>) {
        for (to, message) in actions {
            self.send(node_id.clone(), &to, NetworkMessage::Migration(message));
        }
    }

    fn node_variant(&self, node_id: &Id) -> Option<Variant> {
        match self.nodes.get(node_id) {
            Some(NodeKind::Data(node)) => Some(node.variant()),
            _ => None,
        }
    }

    // ---- message delivery ---------------------------------------------

    fn queue_local(&mut self, node_id: Id, sending_node_id: Id, message: NetworkMessage) {
        self.inbox.push_back(MachineDeliverToNode { node_id, sending_node_id, message });
    }

    fn send(&mut self, sending_node_id: Id, to: &Handle, message: NetworkMessage) {
        match to.transport {
            Transport::Local => self.queue_local(to.node_id.clone(), sending_node_id, message),
            Transport::Udp(addr) => self.send_udp(sending_node_id, to.node_id.clone(), addr, message),
        }
    }

    fn send_udp(&mut self, sending_node_id: Id, node_id: Id, addr: SocketAddr, message: NetworkMessage) {
        let envelope = MachineDeliverToNode { node_id: node_id.clone(), sending_node_id, message };
        let Some(socket) = &self.udp_socket else {
            // No transport established at the machine layer: logged and
            // dropped rather than surfaced to the node.
            eprintln!("distzero: dropping message to {node_id} at {addr}: no UDP transport bound");
            return;
        };
        match serde_json::to_vec(&envelope) {
            Ok(datagram) => {
                if let Err(error) = socket.send_to(&datagram, addr) {
                    eprintln!("distzero: failed to send to {node_id} at {addr}: {error}");
                }
            }
            Err(error) => eprintln!("distzero: failed to encode message to {node_id}: {error}"),
        }
    }

    /// Drains the inbox, dispatching every queued message and queuing
    /// whatever replies those dispatches produce, until no more are pending.
    ///
    /// This is what gives dispatch its "synchronous within `receive`,
    /// suspended only between ticks" character without recursing through
    /// Rust's call stack: every enact step enqueues rather than dispatches
    /// immediately, and the run-loop (`elapse`, `spawn_*`, the socket
    /// drains) calls this once it is done enqueuing.
    fn drain(&mut self) {
        while let Some(msg) = self.inbox.pop_front() {
            if let Err(error) = self.deliver(msg) {
                eprintln!("distzero: {error}");
            }
        }
    }

    fn deliver(&mut self, msg: MachineDeliverToNode) -> Result<(), DistZeroError> {
        let MachineDeliverToNode { node_id, sending_node_id, message } = msg;
        match message {
            NetworkMessage::Io(io_message) => self.deliver_io(node_id, sending_node_id, io_message),
            NetworkMessage::Sequence(seq) => self.deliver_sequence(node_id, sending_node_id, seq),
            NetworkMessage::Migration(migration_message) => self.deliver_migration(node_id, sending_node_id, migration_message),
        }
    }

    fn deliver_io(&mut self, node_id: Id, sending_node_id: Id, message: IoMessage) -> Result<(), DistZeroError> {
        // `added_sender` is the one `IoMessage` a `DataNode` emits but never
        // itself receives: a parent sends it to its leaf's *adjacent* link
        // node, so the machine (not the node) resolves it into a connector
        // update, treating it as an ordinary left-kid append and replying
        // with `finished_adding_sender` once that succeeds.
        if let IoMessage::AddedSender(added) = &message {
            if let Some(NodeKind::Link(_)) = self.nodes.get(&node_id) {
                let connection_limit = self.config.sum_node_receiver_limit;
                let kid = distzero_transport::KidConnection { handle: added.node.clone(), connection_limit };
                let respond_to = added.respond_to.clone();
                let sender_id = added.node.node_id.clone();
                if let Some(NodeKind::Link(link)) = self.nodes.get_mut(&node_id) {
                    let actions = link.add_left_kid(&sending_node_id, kid)?;
                    self.enact_link_actions(node_id.clone(), actions);
                }
                self.queue_local(respond_to.node_id.clone(), node_id, NetworkMessage::Migration(MigrationMessage::FinishedAddingSender { sender_id }));
                return Ok(());
            }
        }

        match self.nodes.get_mut(&node_id) {
            Some(NodeKind::Data(node)) => {
                let actions = node.receive(sending_node_id, message)?;
                self.enact_data_actions(node_id, actions);
                Ok(())
            }
            Some(NodeKind::Link(_)) => Err(DistZeroError::internal(format!("link node {node_id} received an unsupported io message {message:?}"))),
            Some(NodeKind::Interior { .. }) => Ok(()),
            None => Err(DistZeroError::NoTransport(node_id)),
        }
    }

    fn deliver_sequence(&mut self, node_id: Id, sending_node_id: Id, message: SequenceMessage) -> Result<(), DistZeroError> {
        match self.nodes.get_mut(&node_id) {
            Some(NodeKind::Data(node)) => {
                node.receive_sequence(sending_node_id, message)?;
                self.finish_pending_deltas_only(&node_id);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(DistZeroError::NoTransport(node_id)),
        }
    }

    /// A sink whose migrator has already cleared its switch barriers but
    /// whose buffered deltas did not yet cover the new flow's cutoff stays
    /// in `deltas_only` mode; every newly-arrived sequence message rechecks
    /// whether it now covers that cutoff, so the backlog is applied the
    /// moment it is safe rather than only at the instant the switch barriers
    /// complete.
    fn finish_pending_deltas_only(&mut self, node_id: &Id) {
        let Some(byid) = self.migrators.get(node_id) else { return };
        let ready_cutoffs: Vec<HashMap<Id, u64>> =
            byid.values().filter(|migrator| !migrator.is_deltas_only()).map(|migrator| migrator.new_flow_cutoff().clone()).collect();
        let Some(NodeKind::Data(node)) = self.nodes.get_mut(node_id) else { return };
        if !node.is_deltas_only() {
            return;
        }
        for cutoff in ready_cutoffs {
            if node.deltas_cover(&cutoff) {
                node.finish_deltas_only(&cutoff);
                break;
            }
        }
    }

    fn deliver_migration(&mut self, node_id: Id, sending_node_id: Id, message: MigrationMessage) -> Result<(), DistZeroError> {
        // A migration coordinator's hosting id doubles as its migration id
        // (see `spawn_migration_with_handles`), so this dispatch is unambiguous
        // even for the several `MigrationMessage` variants that omit an
        // explicit `migration_id` field (`SumTotalSet`, `SyncerIsSynced`, ...).
        if let Some(mut coordinator) = self.migration_nodes.remove(&node_id) {
            let actions = coordinator.receive(sending_node_id, &message);
            self.migration_nodes.insert(node_id.clone(), coordinator);
            self.enact_migration_actions(node_id, actions?);
            return Ok(());
        }

        match message {
            MigrationMessage::AttachMigrator { migration_id, migration, config } => {
                let expected_kids = self.node_children(&node_id);
                let mut migrator = Migrator::new(migration_id.clone(), node_id.clone(), config, migration, expected_kids);
                let actions = migrator.initialize();
                self.migrators.entry(node_id.clone()).or_default().insert(migration_id, migrator);
                self.enact_migration_actions(node_id, actions);
                Ok(())
            }
            MigrationMessage::ConfigureNewFlowLeft { left_configurations, .. } => {
                if let Some(NodeKind::Link(link)) = self.nodes.get_mut(&node_id) {
                    let mut actions = Vec::new();
                    for configuration in left_configurations {
                        actions.extend(link.receive_left_configuration(configuration)?);
                    }
                    self.enact_link_actions(node_id, actions);
                }
                Ok(())
            }
            MigrationMessage::ConfigureNewFlowRight { right_configurations, .. } => {
                if let Some(NodeKind::Link(link)) = self.nodes.get_mut(&node_id) {
                    let mut actions = Vec::new();
                    for configuration in right_configurations {
                        actions.extend(link.receive_right_configuration(configuration)?);
                    }
                    self.enact_link_actions(node_id, actions);
                }
                Ok(())
            }
            MigrationMessage::UpdateLeftConfiguration { parent_id, new_kids, .. } => {
                if let Some(NodeKind::Link(link)) = self.nodes.get_mut(&node_id) {
                    let mut actions = Vec::new();
                    for kid in new_kids {
                        actions.extend(link.add_left_kid(&parent_id, kid)?);
                    }
                    self.enact_link_actions(node_id, actions);
                }
                Ok(())
            }
            MigrationMessage::UpdateRightConfiguration { parent_id, new_kids, .. } => {
                if let Some(NodeKind::Link(link)) = self.nodes.get_mut(&node_id) {
                    let mut actions = Vec::new();
                    for kid in new_kids {
                        actions.extend(link.add_right_kid(&parent_id, kid)?);
                    }
                    self.enact_link_actions(node_id, actions);
                }
                Ok(())
            }
            MigrationMessage::ConnectNode { node, .. } => {
                if let Some(NodeKind::Data(data_node)) = self.nodes.get_mut(&node_id) {
                    data_node.set_adjacent(node);
                }
                Ok(())
            }
            MigrationMessage::StartSyncing { migration_id, receivers } => {
                let total = self.node_state(&node_id).unwrap_or(0);
                if let Some(migrator) = self.migrators.get_mut(&node_id).and_then(|byid| byid.get_mut(&migration_id)) {
                    let actions = migrator.start_syncing(total, &receivers)?;
                    self.enact_migration_actions(node_id, actions);
                }
                Ok(())
            }
            MigrationMessage::SwitchFlows { migration_id } => {
                let first_live_sequence_number = self.node_next_sequence_number(&node_id).unwrap_or(0);
                if let Some(migrator) = self.migrators.get_mut(&node_id).and_then(|byid| byid.get_mut(&migration_id)) {
                    let actions = migrator.switch_flows(first_live_sequence_number)?;
                    self.enact_migration_actions(node_id, actions);
                }
                Ok(())
            }
            MigrationMessage::Sequence { value } => self.deliver_sequence(node_id, sending_node_id, value),
            MigrationMessage::BumpedHeight { .. } | MigrationMessage::FinishedAddingSender { .. } => Ok(()),
            // Installs a mirror exporter on the hosting data node's linker,
            // so every subsequent export also fans out to the node under
            // construction without the importer on the other end knowing a
            // migration is underway.
            MigrationMessage::StartDuplicating { old_receiver_id: _, receiver } => {
                if let Some(NodeKind::Data(node)) = self.nodes.get_mut(&node_id) {
                    node.start_duplicating(vec![receiver]);
                }
                Ok(())
            }
            MigrationMessage::FinishDuplicating { receiver_id } => {
                if let Some(NodeKind::Data(node)) = self.nodes.get_mut(&node_id) {
                    node.finish_duplicating(&receiver_id);
                }
                self.queue_local(sending_node_id.clone(), node_id, NetworkMessage::Migration(MigrationMessage::FinishedDuplicating));
                Ok(())
            }
            MigrationMessage::FinishedDuplicating => Ok(()),
            other => {
                if let Some(migration_id) = self.explicit_migration_id(&other).or_else(|| self.single_migrator_id(&node_id)) {
                    if let Some(migrator) = self.migrators.get_mut(&node_id).and_then(|byid| byid.get_mut(&migration_id)) {
                        let actions = migrator.receive(&sending_node_id, &other)?;
                        self.enact_migration_actions(node_id.clone(), actions);
                        self.sync_deltas_only(&node_id, &migration_id);
                        return Ok(());
                    }
                }
                Err(DistZeroError::internal(format!("node {node_id} has no migrator to receive {other:?}")))
            }
        }
    }

    /// Mirrors a migrator's `deltas_only` state onto the `DataNode` it hosts.
    ///
    /// Entering `deltas_only` happens unconditionally the moment the
    /// migrator does (at `prepare_for_switch`). Leaving it is gated on
    /// `Deltas::covers` through `DataNode::deltas_cover`: the migrator's own
    /// switch barriers completing only means every swap marker arrived, not
    /// that the new flow's deltas have actually caught up to the recorded
    /// cutoff, so a node that is not yet covered stays in `deltas_only`
    /// until `finish_pending_deltas_only` sees that it is.
    fn sync_deltas_only(&mut self, node_id: &Id, migration_id: &Id) {
        let Some(migrator) = self.migrators.get(node_id).and_then(|byid| byid.get(migration_id)) else { return };
        let deltas_only = migrator.is_deltas_only();
        let cutoff = migrator.new_flow_cutoff().clone();
        let Some(NodeKind::Data(node)) = self.nodes.get_mut(node_id) else { return };
        // Only an output leaf accumulates deltas at all (`DataNode::set_adjacent`
        // only registers a `Deltas` sender for `Variant::Output`); an input leaf
        // or an interior tree node has nothing for `deltas_only` to gate.
        if node.variant() != Variant::Output || !node.is_leaf() {
            return;
        }
        if deltas_only {
            node.set_deltas_only(true);
        } else if node.is_deltas_only() && node.deltas_cover(&cutoff) {
            node.finish_deltas_only(&cutoff);
        }
    }

    fn explicit_migration_id(&self, message: &MigrationMessage) -> Option<Id> {
        match message {
            MigrationMessage::AttachedMigrator { migration_id }
            | MigrationMessage::StartFlow { migration_id }
            | MigrationMessage::StartedFlow { migration_id }
            | MigrationMessage::ConfigureRightParent { migration_id, .. }
            | MigrationMessage::SetSourceRightParents { migration_id, .. }
            | MigrationMessage::SetNewFlowAdjacent { migration_id, .. }
            | MigrationMessage::PrepareForSwitch { migration_id }
            | MigrationMessage::PreparedForSwitch { migration_id }
            | MigrationMessage::SetSumTotal { migration_id, .. }
            | MigrationMessage::SwitchedFlows { migration_id }
            | MigrationMessage::TerminateMigrator { migration_id }
            | MigrationMessage::MigratorTerminated { migration_id } => Some(migration_id.clone()),
            _ => None,
        }
    }

    /// A node hosts at most one migration in steady-state practice; when a
    /// message carries no explicit `migration_id` (e.g. `SumTotalSet`,
    /// `SyncerIsSynced`, `SwappedFromDuplicate`/`SwappedToDuplicate`), the
    /// sole resident migrator is the only sensible recipient.
    fn single_migrator_id(&self, node_id: &Id) -> Option<Id> {
        let byid = self.migrators.get(node_id)?;
        if byid.len() == 1 {
            byid.keys().next().cloned()
        } else {
            None
        }
    }

    fn node_children(&self, node_id: &Id) -> Vec<Id> {
        match self.nodes.get(node_id) {
            Some(NodeKind::Data(node)) if !node.is_leaf() => node.kid_ids().to_vec(),
            Some(NodeKind::Link(node)) => node.left_kid_ids(),
            _ => Vec::new(),
        }
    }

    fn node_state(&self, node_id: &Id) -> Option<i64> {
        match self.nodes.get(node_id) {
            Some(NodeKind::Data(node)) => node.current_state().ok(),
            _ => None,
        }
    }

    fn node_next_sequence_number(&self, node_id: &Id) -> Option<u64> {
        match self.nodes.get(node_id) {
            Some(NodeKind::Data(node)) => Some(node.next_sequence_number()),
            _ => None,
        }
    }

    // ---- public, application-facing operations -------------------------

    /// Records one `input_action(amount)` at an input leaf and enacts the
    /// resulting export.
    pub fn input_action(&mut self, node_id: &Id, amount: i64) -> Result<(), DistZeroError> {
        let Some(NodeKind::Data(node)) = self.nodes.get_mut(node_id) else {
            return Err(DistZeroError::NoTransport(node_id.clone()));
        };
        let actions = node.input_action(amount)?;
        self.enact_data_actions(node_id.clone(), actions);
        self.drain();
        Ok(())
    }

    /// `get_output_state`: the accumulated state of an output leaf.
    pub fn get_output_state(&self, node_id: &Id) -> Result<i64, DistZeroError> {
        match self.nodes.get(node_id) {
            Some(NodeKind::Data(node)) => node.current_state(),
            _ => Err(DistZeroError::NoTransport(node_id.clone())),
        }
    }

    /// `get_capacity`: a node's advertised spare capacity.
    pub fn get_capacity(&self, node_id: &Id) -> Result<u64, DistZeroError> {
        match self.nodes.get(node_id) {
            Some(NodeKind::Data(node)) => Ok(node.availability()),
            _ => Err(DistZeroError::NoCapacity(node_id.clone())),
        }
    }

    /// `kill_node`: immediately removes a node and any migrators it hosts,
    /// simulating a process failure. The node's peers learn of this only
    /// through the ordinary transport-level symptoms (missing acks,
    /// eventually a failed handle) rather than an explicit notification.
    pub fn kill_node(&mut self, node_id: &Id) -> bool {
        self.migrators.remove(node_id);
        self.nodes.remove(node_id).is_some()
    }

    /// Advances every resident node's timers by `ms` and enacts whatever
    /// that produces. Call this on a `SystemConfig::step_length_ms` cadence.
    pub fn elapse(&mut self, ms: u64) {
        let ids: Vec<Id> = self.nodes.keys().cloned().collect();
        for node_id in ids {
            let Some(kind) = self.nodes.get_mut(&node_id) else { continue };
            if let NodeKind::Data(node) = kind {
                let actions = node.elapse(ms);
                self.enact_data_actions(node_id, actions);
            }
        }
        self.drain();
    }

    // ---- sockets ---------------------------------------------------------

    /// Drains every datagram currently queued on the UDP data-plane socket.
    ///
    /// Each recv reuses one scratch buffer; the datagram is parsed straight
    /// out of the filled portion of it rather than copied into an owned
    /// buffer first.
    pub fn drain_udp(&mut self) {
        let Some(socket) = &self.udp_socket else { return };
        let mut buffer = vec![0u8; MSG_BUFSIZE];
        loop {
            match socket.recv_from(&mut buffer) {
                Ok((n, _from)) => match serde_json::from_slice::<MachineDeliverToNode>(&buffer[..n]) {
                    Ok(envelope) => self.inbox.push_back(envelope),
                    Err(error) => eprintln!("distzero: malformed machine_deliver_to_node datagram: {error}"),
                },
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    eprintln!("distzero: udp recv error: {error}");
                    break;
                }
            }
        }
        self.drain();
    }

    /// Accepts and services every pending control-plane connection: one
    /// JSON request read, one JSON `{status, data|reason}` reply written.
    pub fn drain_tcp(&mut self) {
        let Some(listener) = &self.tcp_listener else { return };
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => self.service_control_connection(stream),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    eprintln!("distzero: tcp accept error: {error}");
                    break;
                }
            }
        }
    }

    fn service_control_connection(&mut self, mut stream: TcpStream) {
        let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
        let mut body = Vec::new();
        if stream.read_to_end(&mut body).is_err() && body.is_empty() {
            return;
        }
        let response = match serde_json::from_slice::<ControlRequest>(&body) {
            Ok(request) => self.handle_control_request(request),
            Err(error) => ControlResponse::failure(format!("malformed request: {error}")),
        };
        if let Ok(bytes) = serde_json::to_vec(&response) {
            let _ = stream.write_all(&bytes);
        }
    }

    fn handle_control_request(&mut self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::ApiCreateKidConfig { parent, variant } => {
                let config = crate::descriptors::leaf_config(self.handle_for(&parent), variant);
                ControlResponse::ok(serde_json::to_value(config).unwrap_or(serde_json::Value::Null))
            }
            ControlRequest::ApiNewTransport { node_id } | ControlRequest::ApiRouteDns { node_id } => {
                if self.contains(&node_id) {
                    ControlResponse::ok(serde_json::to_value(self.handle_for(&node_id)).unwrap_or(serde_json::Value::Null))
                } else {
                    ControlResponse::failure(DistZeroError::NoTransport(node_id).to_string())
                }
            }
            ControlRequest::ApiGetOutputState { node_id } => match self.get_output_state(&node_id) {
                Ok(state) => ControlResponse::ok(serde_json::json!(state)),
                Err(error) => ControlResponse::failure(error.to_string()),
            },
            ControlRequest::ApiGetCapacity { node_id } => match self.get_capacity(&node_id) {
                Ok(capacity) => ControlResponse::ok(serde_json::json!(capacity)),
                Err(error) => ControlResponse::failure(error.to_string()),
            },
            ControlRequest::ApiSpawnNewSenders { node_id, n } => self.api_spawn_new_senders(&node_id, n),
            ControlRequest::ApiKillNode { node_id } => {
                if self.kill_node(&node_id) {
                    ControlResponse::ok(serde_json::Value::Null)
                } else {
                    ControlResponse::failure(DistZeroError::NoTransport(node_id).to_string())
                }
            }
        }
    }

    fn api_spawn_new_senders(&mut self, node_id: &Id, n: u32) -> ControlResponse {
        let Some(NodeKind::Data(node)) = self.nodes.get(node_id) else {
            return ControlResponse::failure(DistZeroError::NoCapacity(node_id.clone()).to_string());
        };
        if node.is_leaf() {
            return ControlResponse::failure(format!("{node_id} is a leaf; it cannot spawn new senders"));
        }
        let height = node.height() - 1;
        let variant = node.variant();
        let spawned: Vec<Id> = (0..n)
            .map(|_| {
                let kid_id = Id::new("DataNode_kid");
                self.spawn_kid_of(node_id, kid_id.clone(), height, variant);
                kid_id
            })
            .collect();
        self.drain();
        ControlResponse::ok(serde_json::json!(spawned.iter().map(Id::to_string).collect::<Vec<_>>()))
    }
}

/// The control-plane request family, keyed by the JSON `request`
/// discriminator.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "request")]
enum ControlRequest {
    #[serde(rename = "api_create_kid_config")]
    ApiCreateKidConfig { parent: Id, variant: Variant },
    #[serde(rename = "api_new_transport")]
    ApiNewTransport { node_id: Id },
    #[serde(rename = "api_get_output_state")]
    ApiGetOutputState { node_id: Id },
    #[serde(rename = "api_route_dns")]
    ApiRouteDns { node_id: Id },
    #[serde(rename = "api_get_capacity")]
    ApiGetCapacity { node_id: Id },
    #[serde(rename = "api_spawn_new_senders")]
    ApiSpawnNewSenders { node_id: Id, n: u32 },
    #[serde(rename = "api_kill_node")]
    ApiKillNode { node_id: Id },
}

/// The control-plane's `{status: "ok"|"failure", data | reason}` reply envelope.
#[derive(Debug, Serialize)]
struct ControlResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl ControlResponse {
    fn ok(data: serde_json::Value) -> Self {
        ControlResponse { status: "ok", data: Some(data), reason: None }
    }

    fn failure(reason: impl Into<String>) -> Self {
        ControlResponse { status: "failure", data: None, reason: Some(reason.into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{dataset_root_config, leaf_config};

    #[test]
    fn a_leaf_greets_its_parent_through_the_machine() {
        let mut machine = Machine::new(SystemConfig::default());
        let root_id = machine.spawn_data_node(DataNodeConfig { node_id: Id::new("root"), parent: None, variant: Variant::Output, height: 0 });
        let leaf_id = machine.spawn_leaf(leaf_config(machine.handle_for(&root_id), Variant::Output));

        let Some(NodeKind::Data(root)) = machine.nodes.get(&root_id) else { panic!("root missing") };
        assert_eq!(root.kid_count(), 1);
        assert!(root.kid_ids().contains(&leaf_id));
    }

    #[test]
    fn a_full_root_bumps_height_and_the_proxy_adopts_its_kids() {
        let config = SystemConfig { data_node_kids_limit: 2, total_kid_capacity_trigger: 1_000_000, ..SystemConfig::default() };
        let mut machine = Machine::new(config);
        let root_id = machine.spawn_data_node(dataset_root_config(Variant::Output));

        // Drive two kid-summary reports so `check_for_low_capacity` sees the
        // root as full, forcing a height bump on the next `elapse`.
        let kid_ids: Vec<Id> = {
            let Some(NodeKind::Data(root)) = machine.nodes.get(&root_id) else { panic!("root missing") };
            root.kid_ids().to_vec()
        };
        assert_eq!(kid_ids.len(), 1);
        for extra in 0..1 {
            let _ = extra;
            let leaf_id = machine.spawn_data_node(DataNodeConfig {
                node_id: Id::new("extra_kid"),
                parent: Some(machine.handle_for(&root_id)),
                variant: Variant::Output,
                height: 0,
            });
            let _ = leaf_id;
        }
        for kid_id in machine.nodes_snapshot_kid_ids(&root_id) {
            machine.deliver_kid_summary_for_test(&root_id, &kid_id, 1_000_000, 0, 0);
        }
        machine.elapse(1);

        let Some(NodeKind::Data(root)) = machine.nodes.get(&root_id) else { panic!("root missing") };
        assert_eq!(root.height(), 2);
        assert_eq!(root.kid_count(), 1);
    }

    #[test]
    fn control_plane_reports_capacity_and_output_state() {
        let mut machine = Machine::new(SystemConfig::default());
        let output_leaf = machine.spawn_data_node(DataNodeConfig { node_id: Id::new("leaf"), parent: None, variant: Variant::Output, height: -1 });

        assert_eq!(machine.handle_control_request(ControlRequest::ApiGetOutputState { node_id: output_leaf.clone() }).status, "ok");
        assert_eq!(machine.handle_control_request(ControlRequest::ApiGetCapacity { node_id: output_leaf.clone() }).status, "ok");
        assert_eq!(machine.handle_control_request(ControlRequest::ApiKillNode { node_id: output_leaf.clone() }).status, "ok");
        assert_eq!(machine.handle_control_request(ControlRequest::ApiGetOutputState { node_id: output_leaf }).status, "failure");
    }

    impl Machine {
        fn nodes_snapshot_kid_ids(&self, node_id: &Id) -> Vec<Id> {
            match self.nodes.get(node_id) {
                Some(NodeKind::Data(node)) => node.kid_ids().to_vec(),
                _ => Vec::new(),
            }
        }

        fn deliver_kid_summary_for_test(&mut self, parent_id: &Id, kid_id: &Id, size: u64, n_kids: u32, availability: u64) {
            if let Some(NodeKind::Data(parent)) = self.nodes.get_mut(parent_id) {
                parent.receive_kid_summary(kid_id.clone(), crate::node::data::KidSummary { size, n_kids, availability });
            }
        }
    }
}
