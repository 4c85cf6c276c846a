//! The link node: bridges a "left" dataset/link layer to a "right" one,
//! instantiating a [`Connector`] once both sides' shapes are known and
//! incrementally extending it as either side grows.

use std::collections::HashMap;

use distzero_logging::Logger;
use distzero_transport::{Handle, Id, KidConnection, LeftConfiguration, MigrationMessage, RightConfiguration};

use crate::config::SystemConfig;
use crate::connector::{AllToAllConnector, AllToOneAvailableConnector, Connector};
use crate::errors::DistZeroError;
use crate::events::LinkNodeEvent;

/// Which bipartite-graph strategy a [`LinkNode`] uses once configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectorKind {
    /// Every left kid's contribution must reach every right kid, e.g. a sum aggregation.
    AllToAll,
    /// Each left kid is assigned to exactly one right kid, e.g. sharding/forwarding.
    AllToOneAvailable,
}

/// A side effect a [`LinkNode`] wants the hosting machine to perform.
#[derive(Clone, Debug)]
pub enum LinkNodeAction {
    /// Send `message` to `to`.
    Send {
        /// The destination handle.
        to: Handle,
        /// The message to deliver.
        message: MigrationMessage,
    },
    /// Ask the machine to spawn a new interior node, pre-wired with its senders and receivers.
    SpawnInterior {
        /// The id the new interior node should use.
        node_id: Id,
        /// The ids of the nodes that should send to it.
        senders: Vec<Id>,
        /// The ids of the nodes it should send to.
        receivers: Vec<Id>,
    },
}

/// A link node: the interior of a dataset-to-dataset (or dataset-to-link)
/// connection. Waits for its expected left and right configurations to
/// arrive, instantiates a [`Connector`] over the declared shapes, and grows
/// that connector incrementally as new kids are announced on either side.
pub struct LinkNode {
    id: Id,
    kind: ConnectorKind,
    config: SystemConfig,
    logger: Option<Logger<LinkNodeEvent>>,

    expected_left_parents: usize,
    expected_right_parents: usize,
    left_configurations: HashMap<Id, LeftConfiguration>,
    right_configurations: HashMap<Id, RightConfiguration>,

    connector: Option<Connector>,
}

impl LinkNode {
    /// Constructs a not-yet-configured link node expecting configurations
    /// from `expected_left_parents` left parents and `expected_right_parents`
    /// right parents.
    pub fn new(id: Id, kind: ConnectorKind, expected_left_parents: usize, expected_right_parents: usize, config: SystemConfig) -> Self {
        LinkNode {
            id,
            kind,
            config,
            logger: None,
            expected_left_parents,
            expected_right_parents,
            left_configurations: HashMap::new(),
            right_configurations: HashMap::new(),
            connector: None,
        }
    }

    /// Binds a logger for this node's [`LinkNodeEvent`]s.
    pub fn set_logger(&mut self, logger: Logger<LinkNodeEvent>) {
        self.logger = Some(logger);
    }

    /// This node's id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// True once enough configurations have arrived to instantiate a connector.
    pub fn is_configured(&self) -> bool {
        self.connector.is_some()
    }

    /// Records a left parent's declared shape, configuring the connector once
    /// every expected parent (on both sides) has reported in.
    pub fn receive_left_configuration(&mut self, configuration: LeftConfiguration) -> Result<Vec<LinkNodeAction>, DistZeroError> {
        self.left_configurations.insert(configuration.node.node_id.clone(), configuration);
        self.maybe_configure()
    }

    /// Symmetric to [`receive_left_configuration`](Self::receive_left_configuration).
    pub fn receive_right_configuration(&mut self, configuration: RightConfiguration) -> Result<Vec<LinkNodeAction>, DistZeroError> {
        self.right_configurations.insert(configuration.parent_handle.node_id.clone(), configuration);
        self.maybe_configure()
    }

    fn maybe_configure(&mut self) -> Result<Vec<LinkNodeAction>, DistZeroError> {
        if self.connector.is_some() {
            return Ok(Vec::new());
        }
        if self.left_configurations.len() < self.expected_left_parents || self.right_configurations.len() < self.expected_right_parents {
            return Ok(Vec::new());
        }
        self.configure()
    }

    /// Every left kid known from a received left configuration, used by the
    /// hosting machine to seed a migrator's expected-attach set.
    pub fn left_kid_ids(&self) -> Vec<Id> {
        self.left_configurations.values().flat_map(|c| c.kids.iter().map(|k| k.handle.node_id.clone())).collect()
    }

    fn right_weights(&self) -> HashMap<Id, u32> {
        self.right_configurations.iter().map(|(id, c)| (id.clone(), c.connection_limit)).collect()
    }

    fn configure(&mut self) -> Result<Vec<LinkNodeAction>, DistZeroError> {
        let left_kids = self.left_kid_ids();
        let right_ids: Vec<Id> = self.right_configurations.keys().cloned().collect();
        let mut actions = Vec::new();

        match self.kind {
            ConnectorKind::AllToAll => {
                let connector = AllToAllConnector::new(
                    left_kids,
                    right_ids,
                    self.config.sum_node_receiver_limit as usize,
                    self.config.sum_node_sender_limit as usize,
                    format!("{}_interior", self.id.as_str()),
                );
                let layers = connector.layers();
                if layers.len() > 2 {
                    for layer in &layers[1..layers.len() - 1] {
                        for node in layer {
                            actions.push(LinkNodeAction::SpawnInterior {
                                node_id: node.clone(),
                                senders: connector.senders_of(node),
                                receivers: connector.receivers_of(node),
                            });
                        }
                    }
                }
                let n_layers = layers.len();
                self.connector = Some(Connector::AllToAll(connector));
                if let Some(logger) = &self.logger {
                    logger.log(LinkNodeEvent::Configured { node_id: self.id.clone(), n_layers });
                }
            }
            ConnectorKind::AllToOneAvailable => {
                let weights = self.right_weights();
                let connector = AllToOneAvailableConnector::new(&left_kids, &right_ids, &weights)?;
                for kid in &left_kids {
                    if let (Some(forwarder), Some(right_parent)) = (connector.forwarder_for(kid), connector.right_parent_for(kid)) {
                        actions.push(LinkNodeAction::SpawnInterior {
                            node_id: forwarder.clone(),
                            senders: vec![kid.clone()],
                            receivers: vec![right_parent.clone()],
                        });
                    }
                }
                self.connector = Some(Connector::AllToOneAvailable(connector));
                if let Some(logger) = &self.logger {
                    logger.log(LinkNodeEvent::Configured { node_id: self.id.clone(), n_layers: 1 });
                }
            }
        }

        Ok(actions)
    }

    /// Adds a newly-spawned kid to a left parent's configuration, growing the
    /// connector if one is already instantiated.
    pub fn add_left_kid(&mut self, parent_id: &Id, kid: KidConnection) -> Result<Vec<LinkNodeAction>, DistZeroError> {
        if let Some(configuration) = self.left_configurations.get_mut(parent_id) {
            configuration.kids.push(kid.clone());
        }
        let kid_id = kid.handle.node_id.clone();

        let Some(connector) = self.connector.as_mut() else { return Ok(Vec::new()) };
        let mut actions = Vec::new();

        match connector {
            Connector::AllToAll(connector) => {
                let (plan, hourglass) = connector.add_kid_to_left_configuration(kid_id.clone());
                for layer in plan {
                    for row in layer {
                        actions.push(LinkNodeAction::SpawnInterior { node_id: row.node_id, senders: row.senders, receivers: row.receivers });
                    }
                }
                if !hourglass.is_empty() {
                    let hourglass_node_ids: Vec<Id> = hourglass.iter().map(|row| row.node_id.clone()).collect();
                    for row in hourglass {
                        actions.push(LinkNodeAction::SpawnInterior { node_id: row.node_id, senders: row.senders, receivers: row.receivers });
                    }
                    if let Some(logger) = &self.logger {
                        logger.log(LinkNodeEvent::InsertedHourglass { node_id: self.id.clone(), hourglass_node_ids });
                    }
                }
            }
            Connector::AllToOneAvailable(connector) => {
                let right_ids: Vec<Id> = self.right_configurations.keys().cloned().collect();
                let weights = self.right_configurations.iter().map(|(id, c)| (id.clone(), c.connection_limit)).collect();
                let forwarder = connector.add_left_kid(kid_id.clone(), &right_ids, &weights)?;
                let right_parent = connector.right_parent_for(&kid_id).cloned().expect("add_left_kid just assigned this kid");
                actions.push(LinkNodeAction::SpawnInterior { node_id: forwarder, senders: vec![kid_id.clone()], receivers: vec![right_parent] });
            }
        }

        if let Some(logger) = &self.logger {
            logger.log(LinkNodeEvent::AppendedLeft { node_id: self.id.clone(), kid_id });
        }
        Ok(actions)
    }

    /// Adds a newly-spawned kid to a right parent's configuration, growing the
    /// connector if it is an [`AllToAll`](ConnectorKind::AllToAll) connector.
    ///
    /// An `AllToOneAvailable` connector's assignment only changes the next
    /// time a left kid is placed, so a right-side addition there is recorded
    /// for future placements but does not itself spawn anything.
    pub fn add_right_kid(&mut self, parent_id: &Id, kid: Handle) -> Result<Vec<LinkNodeAction>, DistZeroError> {
        let _ = parent_id;
        let kid_id = kid.node_id.clone();
        let mut actions = Vec::new();

        if let Some(Connector::AllToAll(connector)) = self.connector.as_mut() {
            let (plan, hourglass) = connector.add_kid_to_right_configuration(kid_id.clone());
            for layer in plan {
                for row in layer {
                    actions.push(LinkNodeAction::SpawnInterior { node_id: row.node_id, senders: row.senders, receivers: row.receivers });
                }
            }
            if !hourglass.is_empty() {
                let hourglass_node_ids: Vec<Id> = hourglass.iter().map(|row| row.node_id.clone()).collect();
                for row in hourglass {
                    actions.push(LinkNodeAction::SpawnInterior { node_id: row.node_id, senders: row.senders, receivers: row.receivers });
                }
                if let Some(logger) = &self.logger {
                    logger.log(LinkNodeEvent::InsertedHourglass { node_id: self.id.clone(), hourglass_node_ids });
                }
            }
        }

        if let Some(logger) = &self.logger {
            logger.log(LinkNodeEvent::AppendedRight { node_id: self.id.clone(), kid_id });
        }
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distzero_transport::Transport;

    fn kid(prefix: &str) -> KidConnection {
        KidConnection { handle: Handle::new(Id::new(prefix), Transport::Local), connection_limit: 8 }
    }

    fn left_config(n_kids: usize) -> LeftConfiguration {
        LeftConfiguration {
            height: -1,
            is_data: true,
            node: Handle::new(Id::new("LeftParent"), Transport::Local),
            kids: (0..n_kids).map(|i| kid(&format!("left_kid{i}"))).collect(),
        }
    }

    fn right_config() -> RightConfiguration {
        RightConfiguration {
            n_kids: Some(0),
            parent_handle: Handle::new(Id::new("RightParent"), Transport::Local),
            height: -1,
            is_data: true,
            availability: 1000,
            connection_limit: 8,
        }
    }

    #[test]
    fn configures_once_every_expected_side_has_reported() {
        let mut node = LinkNode::new(Id::new("Link"), ConnectorKind::AllToAll, 1, 1, SystemConfig::default());
        let actions = node.receive_left_configuration(left_config(4)).unwrap();
        assert!(actions.is_empty());
        assert!(!node.is_configured());

        let actions = node.receive_right_configuration(right_config()).unwrap();
        assert!(node.is_configured());
        assert!(!actions.is_empty());
    }

    #[test]
    fn all_to_one_available_assigns_each_left_kid_a_forwarder() {
        let mut node = LinkNode::new(Id::new("Link"), ConnectorKind::AllToOneAvailable, 1, 1, SystemConfig::default());
        node.receive_left_configuration(left_config(3)).unwrap();
        let actions = node.receive_right_configuration(right_config()).unwrap();
        assert_eq!(actions.len(), 3);
        assert!(actions.iter().all(|a| matches!(a, LinkNodeAction::SpawnInterior { .. })));
    }

    #[test]
    fn adding_a_left_kid_after_configuration_spawns_more_interior() {
        let mut node = LinkNode::new(Id::new("Link"), ConnectorKind::AllToAll, 1, 1, SystemConfig::default());
        node.receive_left_configuration(left_config(2)).unwrap();
        node.receive_right_configuration(right_config()).unwrap();

        let actions = node.add_left_kid(&Id::new("ignored"), kid("left_kid_new")).unwrap();
        assert!(actions.iter().all(|a| matches!(a, LinkNodeAction::SpawnInterior { .. })));
    }
}
