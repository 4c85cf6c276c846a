//! The "every left kid may contribute to every right kid" connector, built
//! on a pair of balanced [`TopologyPicker`] trees.

use std::collections::{HashMap, HashSet};

use distzero_transport::Id;

use super::topology_picker::TopologyPicker;

/// A newly-created interior node, with its senders and receivers already resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnedRow {
    /// The id assigned to the new interior node.
    pub node_id: Id,
    /// The ids of the nodes that should send to it.
    pub senders: Vec<Id>,
    /// The ids of the nodes it should send to.
    pub receivers: Vec<Id>,
}

/// A list of interior layers, each a list of [`SpawnedRow`]s to bring up together.
pub type LayerPlan = Vec<Vec<SpawnedRow>>;

/// A complete bipartite interior connecting a left dataset/link layer to a
/// right one, one node per cell of a balanced cartesian-product tree.
#[derive(Clone, Debug)]
pub struct AllToAllConnector {
    picker: TopologyPicker,
}

impl AllToAllConnector {
    /// Builds the interior for an already-known left and right kid set.
    pub fn new(left_kids: Vec<Id>, right_kids: Vec<Id>, max_outputs: usize, max_inputs: usize, name_prefix: impl Into<String>) -> Self {
        AllToAllConnector { picker: TopologyPicker::new(left_kids, right_kids, max_outputs, max_inputs, name_prefix) }
    }

    /// All interior layers, left-base-first, right-base-last.
    pub fn layers(&self) -> &[Vec<Id>] {
        self.picker.layers()
    }

    /// The senders of `node`: empty for a left-base node.
    pub fn senders_of(&self, node: &Id) -> Vec<Id> {
        self.picker.incoming_nodes(node)
    }

    /// The receivers of `node`: empty for a right-base node.
    pub fn receivers_of(&self, node: &Id) -> Vec<Id> {
        self.picker.outgoing_nodes(node)
    }

    /// Adds a new left kid, returning the new interior layers to spawn (if
    /// any) and any hourglass substitutions the addition forced.
    pub fn add_kid_to_left_configuration(&mut self, kid: Id) -> (LayerPlan, Vec<SpawnedRow>) {
        let (created, hourglass) = self.picker.append_left(kid);
        let plan = self.plan_for(&created);
        let hourglass_rows = hourglass
            .into_iter()
            .map(|node_id| {
                let senders = self.picker.incoming_nodes(&node_id);
                let receivers = self.picker.outgoing_nodes(&node_id);
                SpawnedRow { node_id, senders, receivers }
            })
            .collect();
        (plan, hourglass_rows)
    }

    /// Symmetric to [`add_kid_to_left_configuration`](Self::add_kid_to_left_configuration).
    pub fn add_kid_to_right_configuration(&mut self, kid: Id) -> (LayerPlan, Vec<SpawnedRow>) {
        let (created, hourglass) = self.picker.append_right(kid);
        let plan = self.plan_for(&created);
        let hourglass_rows = hourglass
            .into_iter()
            .map(|node_id| {
                let senders = self.picker.incoming_nodes(&node_id);
                let receivers = self.picker.outgoing_nodes(&node_id);
                SpawnedRow { node_id, senders, receivers }
            })
            .collect();
        (plan, hourglass_rows)
    }

    /// Convenience for adding several left configurations at once; the
    /// assignment of multiple new right parents under a single new left kid
    /// is left to the caller, per Open Question 1.
    pub fn add_left_configurations(&mut self, kids: Vec<Id>) -> Vec<(LayerPlan, Vec<SpawnedRow>)> {
        kids.into_iter().map(|kid| self.add_kid_to_left_configuration(kid)).collect()
    }

    fn plan_for(&self, created: &[Id]) -> LayerPlan {
        let created_set: HashSet<Id> = created.iter().cloned().collect();
        let mut plan: LayerPlan = Vec::new();
        for layer in self.picker.layers() {
            let rows: Vec<SpawnedRow> = layer
                .iter()
                .filter(|node| created_set.contains(*node))
                .map(|node| SpawnedRow {
                    node_id: node.clone(),
                    senders: self.picker.incoming_nodes(node),
                    receivers: self.picker.outgoing_nodes(node),
                })
                .collect();
            if !rows.is_empty() {
                plan.push(rows);
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;

    fn ids(prefix: &str, n: usize) -> Vec<Id> {
        (0..n).map(|i| Id::from_raw(format!("{prefix}{i}"))).collect()
    }

    /// `SystemConfig::default().sum_node_sender_limit` (15) is the most
    /// senders a single aggregating interior node may take directly. Fifteen
    /// left kids fit under one first-layer interior node; a sixteenth exceeds
    /// that node's capacity and forces the tree to split the first layer into
    /// two interior nodes so neither takes more senders than the limit
    /// allows.
    #[test]
    fn fan_in_past_the_sender_limit_splits_the_first_interior_layer() {
        let limit = SystemConfig::default().sum_node_sender_limit as usize;

        let at_limit = AllToAllConnector::new(ids("left", limit), ids("right", 1), 1, limit, "mid");
        assert_eq!(at_limit.layers()[0].len(), limit);
        assert_eq!(at_limit.layers()[1].len(), 1, "15 senders fit a single first-layer interior node");

        let over_limit = AllToAllConnector::new(ids("left", limit + 1), ids("right", 1), 1, limit, "mid");
        assert_eq!(over_limit.layers()[0].len(), limit + 1);
        assert_eq!(over_limit.layers()[1].len(), 2, "a 16th sender must split across a second first-layer interior node");
    }

    #[test]
    fn every_left_leaf_reaches_every_right_leaf_via_the_interior() {
        let connector = AllToAllConnector::new(ids("left", 4), ids("right", 4), 2, 2, "mid");
        let left_layer = &connector.layers()[0];
        let right_layer: HashSet<Id> = connector.layers().last().unwrap().iter().cloned().collect();

        for left in left_layer {
            let mut frontier = vec![left.clone()];
            for _ in 1..connector.layers().len() {
                frontier = frontier.into_iter().flat_map(|n| connector.receivers_of(&n)).collect();
            }
            for right in &right_layer {
                assert!(frontier.contains(right));
            }
        }
    }

    #[test]
    fn adding_a_left_kid_keeps_the_graph_connected() {
        let mut connector = AllToAllConnector::new(ids("left", 2), ids("right", 2), 2, 2, "mid");
        let new_left = Id::from_raw("left_new");
        let (plan, _hourglass) = connector.add_kid_to_left_configuration(new_left.clone());
        assert!(!plan.is_empty() || connector.layers()[0].contains(&new_left));

        let right_layer: HashSet<Id> = connector.layers().last().unwrap().iter().cloned().collect();
        let mut frontier = vec![new_left];
        for _ in 1..connector.layers().len() {
            frontier = frontier.into_iter().flat_map(|n| connector.receivers_of(&n)).collect();
        }
        for right in &right_layer {
            assert!(frontier.contains(right));
        }
    }
}
