//! Balanced interior trees for the [`AllToAllConnector`](super::all_to_all::AllToAllConnector).
//!
//! A [`NodeTree`] groups a flat list of base nodes (left kids, or right kids)
//! into a balanced tree bounded by `max_kids` per parent; a [`TopologyPicker`]
//! pairs a left tree with a right tree and exposes the cartesian-product
//! interior the two trees imply, plus incremental `append_left`/`append_right`
//! and hourglass-insertion operations.

use std::collections::HashMap;

use distzero_transport::Id;

/// A balanced tree over a flat set of base nodes, each parent bounded by `max_kids`.
#[derive(Clone, Debug)]
pub struct NodeTree {
    max_kids: usize,
    name_prefix: String,
    layers: Vec<Vec<Id>>,
    parent: HashMap<Id, Option<Id>>,
    kids: HashMap<Id, Vec<Id>>,
}

impl NodeTree {
    /// Builds a tree over `base_nodes`, the lowest layer, bounding fan-in/out by `max_kids`.
    pub fn new(base_nodes: Vec<Id>, max_kids: usize, name_prefix: impl Into<String>) -> Self {
        assert!(max_kids > 1, "a NodeTree must allow at least 2 kids per parent");
        let mut tree = NodeTree {
            max_kids,
            name_prefix: name_prefix.into(),
            layers: Vec::new(),
            parent: HashMap::new(),
            kids: HashMap::new(),
        };
        tree.fill_in_tree(base_nodes);
        tree
    }

    /// The number of layers, including the base layer and the singleton root layer.
    pub fn height(&self) -> usize {
        self.layers.len()
    }

    /// The id of this tree's unique root.
    pub fn root(&self) -> &Id {
        let last = self.layers.last().expect("a NodeTree always has at least one layer");
        assert_eq!(last.len(), 1, "the topmost layer of a NodeTree must be a single root");
        &last[0]
    }

    /// All layers, base-first, root-last.
    pub fn layers(&self) -> &[Vec<Id>] {
        &self.layers
    }

    /// The immediate kids of `node`, in attachment order.
    pub fn kids_of(&self, node: &Id) -> &[Id] {
        self.kids.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The parent of `node`, if any (the root has none).
    pub fn parent_of(&self, node: &Id) -> Option<&Id> {
        self.parent.get(node).and_then(Option::as_ref)
    }

    fn new_node(&mut self) -> Id {
        let node = Id::new(&self.name_prefix);
        self.parent.insert(node.clone(), None);
        node
    }

    fn set_parent(&mut self, node: Id, parent: Id) {
        self.parent.insert(node.clone(), Some(parent.clone()));
        self.kids.entry(parent).or_default().push(node);
    }

    fn fill_in_tree(&mut self, base_nodes: Vec<Id>) {
        self.layers.push(Vec::new());
        for node in &base_nodes {
            self.parent.insert(node.clone(), None);
        }
        self.layers[0] = base_nodes;

        if self.layers[0].is_empty() {
            let next = self.new_node();
            self.layers.push(vec![next]);
        }

        while self.layers.last().expect("non-empty").len() > 1 {
            let previous = self.layers.last().expect("non-empty").clone();
            let mut next_layer = Vec::new();
            for chunk in previous.chunks(self.max_kids) {
                let next = self.new_node();
                for kid in chunk {
                    self.set_parent(kid.clone(), next.clone());
                }
                next_layer.push(next);
            }
            self.layers.push(next_layer);
        }

        if self.kids_of(self.root()).len() == self.max_kids {
            self.bump_height();
        }
    }

    /// Adds a new singleton root above the current one, demoting it to a kid.
    pub fn bump_height(&mut self) {
        let new_root = self.new_node();
        let old_root = self.root().clone();
        self.set_parent(old_root, new_root.clone());
        self.layers.push(vec![new_root]);
    }

    /// Adds `node` to the base layer, threading new interior parents upward as
    /// needed. Returns the ids of every *new* interior node created (the base
    /// node itself is not included, since the caller already has it).
    ///
    /// May leave the tree momentarily over [`is_full`](Self::is_full); callers
    /// must check that and repair it (see [`TopologyPicker`]'s hourglass
    /// insertion) before appending again.
    pub fn append_base(&mut self, node: Id) -> Vec<Id> {
        assert!(!self.layers.is_empty(), "must have at least one layer before appending");
        self.layers[0].push(node.clone());
        self.parent.insert(node.clone(), None);

        let mut created = Vec::new();
        let mut current = node;
        let mut layer_index = 0usize;
        loop {
            layer_index += 1;
            let mut candidates: Vec<Id> = self.layers[layer_index].clone();
            candidates.sort_by_key(|candidate| self.kids_of(candidate).len());
            let best = candidates.first().cloned();

            match best {
                Some(best) if self.kids_of(&best).len() < self.max_kids => {
                    self.set_parent(current, best);
                    break;
                }
                _ => {
                    assert!(layer_index + 1 != self.layers.len(), "the root must never be at max capacity");
                    let new_parent = self.new_node();
                    self.set_parent(current.clone(), new_parent.clone());
                    created.push(new_parent.clone());
                    self.layers[layer_index].push(new_parent.clone());
                    current = new_parent;
                }
            }
        }
        created
    }

    /// True iff the tree has no more room for additional base nodes without
    /// growing taller than `max_kids.pow(height - 1)`.
    pub fn is_full(&self) -> bool {
        self.layers[0].len() >= self.max_kids.pow((self.height() - 1) as u32)
    }

    /// Inserts a duplicated copy of `layers[layer_index]` immediately below
    /// it: every kid of a node in that layer is re-parented onto the
    /// duplicate, and the duplicate becomes the node's sole kid. Returns the
    /// new layer, in the same order as `layers[layer_index]`.
    pub fn insert_duplicate_layer_before(&mut self, layer_index: usize) -> Vec<Id> {
        let layer = self.layers[layer_index].clone();
        let mut new_layer = Vec::with_capacity(layer.len());
        for node in &layer {
            let new_node = self.new_node();
            let old_kids = self.kids.insert(node.clone(), Vec::new()).unwrap_or_default();
            for kid in old_kids {
                self.set_parent(kid, new_node.clone());
            }
            self.set_parent(new_node.clone(), node.clone());
            new_layer.push(new_node);
        }
        self.layers.insert(layer_index, new_layer.clone());
        new_layer
    }
}

/// Pairs a left [`NodeTree`] and a right [`NodeTree`] of equal height and
/// exposes the cartesian-product interior they imply, with incremental
/// append and hourglass-insertion support.
///
/// Coordinates are `(left_tree_node, right_tree_node)` pairs; the interior
/// node at layer `i` sits between `left_tree.layers[i]` and
/// `right_tree.layers[reverse(i)]`.
#[derive(Clone, Debug)]
pub struct TopologyPicker {
    left_tree: NodeTree,
    right_tree: NodeTree,
    name_prefix: String,
    layers: Vec<Vec<Id>>,
    node_by_coords: HashMap<(Id, Id), Id>,
    coords_by_node: HashMap<Id, (Id, Id)>,
}

impl TopologyPicker {
    /// Builds interior trees over `lefts` and `rights`, equalized to the same
    /// height (at least 3, so the picker always spawns at least one interior
    /// node), then lays down the full cartesian-product interior.
    pub fn new(lefts: Vec<Id>, rights: Vec<Id>, max_outputs: usize, max_inputs: usize, name_prefix: impl Into<String>) -> Self {
        let name_prefix = name_prefix.into();
        let mut left_tree = NodeTree::new(lefts, max_inputs, format!("{name_prefix}_left"));
        let mut right_tree = NodeTree::new(rights, max_outputs, format!("{name_prefix}_right"));

        while left_tree.height() < right_tree.height() || left_tree.height() < 3 {
            left_tree.bump_height();
        }
        while right_tree.height() < left_tree.height() {
            right_tree.bump_height();
        }

        let mut picker =
            TopologyPicker { left_tree, right_tree, name_prefix, layers: Vec::new(), node_by_coords: HashMap::new(), coords_by_node: HashMap::new() };
        picker.lay_down_interior();
        picker
    }

    fn set_coords(&mut self, node: Id, coords: (Id, Id)) {
        self.node_by_coords.insert(coords.clone(), node.clone());
        self.coords_by_node.insert(node, coords);
    }

    fn node_at(&mut self, coords: (Id, Id)) -> Id {
        if let Some(existing) = self.node_by_coords.get(&coords) {
            return existing.clone();
        }
        let node = Id::new(&self.name_prefix);
        self.set_coords(node.clone(), coords);
        node
    }

    fn lay_down_interior(&mut self) {
        let left_layers = self.left_tree.layers().to_vec();
        let right_layers_rev: Vec<Vec<Id>> = self.right_tree.layers().iter().rev().cloned().collect();

        for (left_layer, right_layer) in left_layers.iter().zip(right_layers_rev.iter()) {
            let mut layer = Vec::new();
            for left_index in left_layer {
                for right_index in right_layer {
                    let node = self.node_at((left_index.clone(), right_index.clone()));
                    layer.push(node);
                }
            }
            self.layers.push(layer);
        }
    }

    /// The interior layers, left-base-first, right-base-last: `layers()[0]`
    /// corresponds to the left base nodes and `layers()[n-1]` to the right
    /// base nodes, each entry the interior node occupying that position.
    pub fn layers(&self) -> &[Vec<Id>] {
        &self.layers
    }

    /// The interior node(s) that `src` sends to, by construction of the
    /// cartesian interior: `src`'s left coordinate's parent, crossed with
    /// every kid of `src`'s right coordinate.
    pub fn outgoing_nodes(&self, src: &Id) -> Vec<Id> {
        let Some((left, right)) = self.coords_by_node.get(src) else { return Vec::new() };
        let Some(target_left) = self.left_tree.parent_of(left) else { return Vec::new() };
        self.right_tree
            .kids_of(right)
            .iter()
            .filter_map(|target_right| self.node_by_coords.get(&(target_left.clone(), target_right.clone())).cloned())
            .collect()
    }

    /// The interior node(s) that send to `tgt`, the dual of [`outgoing_nodes`](Self::outgoing_nodes).
    pub fn incoming_nodes(&self, tgt: &Id) -> Vec<Id> {
        let Some((left, right)) = self.coords_by_node.get(tgt) else { return Vec::new() };
        let Some(source_right) = self.right_tree.parent_of(right) else { return Vec::new() };
        self.left_tree
            .kids_of(left)
            .iter()
            .filter_map(|source_left| self.node_by_coords.get(&(source_left.clone(), source_right.clone())).cloned())
            .collect()
    }

    /// Appends a new right base node, threading new interior parents as
    /// needed. Returns `(new_interior_layers, hourglass_triplets)`: the first
    /// is one entry per newly-created interior node (paired with its
    /// senders/receivers, computed by the caller via
    /// [`incoming_nodes`](Self::incoming_nodes)/[`outgoing_nodes`](Self::outgoing_nodes)
    /// once the node has been recorded); the second is non-empty only when
    /// the right tree was full and an hourglass layer had to be inserted.
    pub fn append_right(&mut self, node: Id) -> (Vec<Id>, Vec<Id>) {
        let was_full = self.right_tree.is_full();
        self.right_tree.append_base(node);
        let hourglass = if self.right_tree.is_full() && !was_full { self.insert_hourglass_layer_left() } else { Vec::new() };
        let created = self.relay_out_interior();
        (created, hourglass)
    }

    /// Symmetric to [`append_right`](Self::append_right).
    pub fn append_left(&mut self, node: Id) -> (Vec<Id>, Vec<Id>) {
        let was_full = self.left_tree.is_full();
        self.left_tree.append_base(node);
        let hourglass = if self.left_tree.is_full() && !was_full { self.insert_hourglass_layer_right() } else { Vec::new() };
        let created = self.relay_out_interior();
        (created, hourglass)
    }

    /// Recomputes the interior layers from the current left/right trees and
    /// returns the ids of any interior nodes that did not already exist.
    ///
    /// `node_at` is memoized by tree coordinates, so nodes already present
    /// keep their id; only the genuinely new coordinates introduced by the
    /// tree growth above produce fresh ids.
    fn relay_out_interior(&mut self) -> Vec<Id> {
        let before: std::collections::HashSet<Id> = self.node_by_coords.values().cloned().collect();
        self.layers.clear();
        self.lay_down_interior();
        self.node_by_coords.values().filter(|node| !before.contains(*node)).cloned().collect()
    }

    /// Collapses the complete bipartite graph one hop in from the left edge
    /// into a single-point bottleneck, inserting a duplicated layer at the
    /// opposite (right) end of the right tree and at index 1 of the left
    /// tree. Returns the new bottleneck node ids, one per left-tree duplicate.
    fn insert_hourglass_layer_left(&mut self) -> Vec<Id> {
        // The complete graph being replaced is never materialized as edges —
        // outgoing/incoming nodes are derived live from tree coordinates —
        // so inserting the duplicate layer below is sufficient to retire it.
        let new_right = self.right_tree.insert_duplicate_layer_before(self.right_tree.height() - 1);
        let right_index = new_right.into_iter().next().expect("exactly one duplicated root-adjacent node");
        let left_indices = self.left_tree.insert_duplicate_layer_before(1);

        let mut hourglass_layer = Vec::new();
        for left_index in left_indices {
            let node = self.node_at((left_index, right_index.clone()));
            hourglass_layer.push(node);
        }
        self.layers.insert(1, hourglass_layer.clone());
        hourglass_layer
    }

    /// Symmetric to [`insert_hourglass_layer_left`](Self::insert_hourglass_layer_left).
    fn insert_hourglass_layer_right(&mut self) -> Vec<Id> {
        let left_index = {
            let new_left = self.left_tree.insert_duplicate_layer_before(self.left_tree.height() - 1);
            new_left.into_iter().next().expect("exactly one duplicated root-adjacent node")
        };
        let right_indices = self.right_tree.insert_duplicate_layer_before(1);

        let mut hourglass_layer = Vec::new();
        for right_index in right_indices {
            let node = self.node_at((left_index.clone(), right_index));
            hourglass_layer.push(node);
        }
        let insert_at = self.layers.len() - 1;
        self.layers.insert(insert_at, hourglass_layer.clone());
        hourglass_layer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(prefix: &str, n: usize) -> Vec<Id> {
        (0..n).map(|i| Id::from_raw(format!("{prefix}{i}"))).collect()
    }

    #[test]
    fn node_tree_fills_in_a_balanced_tree() {
        let tree = NodeTree::new(ids("leaf", 5), 2, "interior");
        assert_eq!(tree.layers()[0].len(), 5);
        assert_eq!(tree.kids_of(tree.root()).len().clamp(1, 2), tree.kids_of(tree.root()).len());
        assert!(tree.height() >= 3);
    }

    #[test]
    fn node_tree_append_base_grows_incrementally() {
        let mut tree = NodeTree::new(ids("leaf", 2), 2, "interior");
        let height_before = tree.height();
        tree.append_base(Id::from_raw("leaf2"));
        assert!(tree.height() >= height_before);
        assert_eq!(tree.layers()[0].len(), 3);
    }

    #[test]
    fn topology_picker_builds_an_interior_of_height_at_least_three() {
        let picker = TopologyPicker::new(ids("left", 4), ids("right", 4), 2, 2, "mid");
        assert!(picker.layers().len() >= 3);
        assert_eq!(picker.layers()[0].len(), 4);
        assert_eq!(picker.layers().last().unwrap().len(), 4);
    }

    #[test]
    fn every_left_leaf_reaches_every_right_leaf() {
        let picker = TopologyPicker::new(ids("left", 3), ids("right", 3), 2, 2, "mid");
        for left in &picker.layers()[0] {
            let mut frontier = vec![left.clone()];
            for _ in 1..picker.layers().len() {
                let mut next = Vec::new();
                for node in &frontier {
                    next.extend(picker.outgoing_nodes(node));
                }
                frontier = next;
            }
            for right in picker.layers().last().unwrap() {
                assert!(frontier.contains(right), "left {left:?} should reach right {right:?}");
            }
        }
    }
}
