//! The "every left kid has one receiver, chosen by weighted round-robin"
//! connector, used for link nodes whose right side does not need every left
//! kid's data to reach every right kid (e.g. plain forwarding/sharding
//! rather than an aggregation that must see every input).

use std::collections::HashMap;

use distzero_transport::{Handle, Id};

use crate::errors::DistZeroError;

/// Assigns each of `kids` to exactly one of `parents`, honoring
/// `weights[parent]` as the maximum number of kids that parent may receive.
///
/// Parents are cycled in order, skipping any that have already reached their
/// weight, until every kid is placed or no parent has remaining capacity.
pub fn weighted_round_robin(
    kids: &[Id],
    parents: &[Id],
    weights: &HashMap<Id, u32>,
) -> Result<HashMap<Id, Id>, DistZeroError> {
    let mut remaining: HashMap<Id, u32> = parents.iter().map(|p| (p.clone(), weights.get(p).copied().unwrap_or(0))).collect();
    let mut assignment = HashMap::new();

    if parents.is_empty() {
        if kids.is_empty() {
            return Ok(assignment);
        }
        return Err(DistZeroError::NoRemainingAvailability { total: kids.len(), remaining: kids.len() });
    }

    let mut next_parent_index = 0usize;
    for (placed, kid) in kids.iter().enumerate() {
        let mut attempts = 0;
        let parent = loop {
            if attempts == parents.len() {
                return Err(DistZeroError::NoRemainingAvailability { total: kids.len(), remaining: kids.len() - placed });
            }
            let candidate = &parents[next_parent_index % parents.len()];
            next_parent_index += 1;
            attempts += 1;
            if let Some(slot) = remaining.get_mut(candidate) {
                if *slot > 0 {
                    *slot -= 1;
                    break candidate.clone();
                }
            }
        };
        assignment.insert(kid.clone(), parent);
    }

    Ok(assignment)
}

/// A single-hop connector: every left kid is assigned exactly one right
/// parent via [`weighted_round_robin`], and one forwarder interior node
/// bridges that (left kid, right parent) pair.
#[derive(Clone, Debug, Default)]
pub struct AllToOneAvailableConnector {
    forwarders: HashMap<Id, Id>,
    assignment: HashMap<Id, Id>,
}

impl AllToOneAvailableConnector {
    /// Builds the connector by running weighted round-robin over the
    /// declared availability of each right parent, then minting one
    /// forwarder id per assigned `(left_kid, right_parent)` pair.
    pub fn new(left_kids: &[Id], right_parents: &[Id], weights: &HashMap<Id, u32>) -> Result<Self, DistZeroError> {
        let assignment = weighted_round_robin(left_kids, right_parents, weights)?;
        let forwarders = assignment.iter().map(|(kid, _)| (kid.clone(), Id::new("Forwarder"))).collect();
        Ok(AllToOneAvailableConnector { forwarders, assignment })
    }

    /// The forwarder interior node assigned to `left_kid`, if any.
    pub fn forwarder_for(&self, left_kid: &Id) -> Option<&Id> {
        self.forwarders.get(left_kid)
    }

    /// The right parent `left_kid` was assigned to, if any.
    pub fn right_parent_for(&self, left_kid: &Id) -> Option<&Id> {
        self.assignment.get(left_kid)
    }

    /// Adds a newly-spawned left kid to the connector's assignment, updating
    /// `remaining_weights` to reflect that allocation.
    pub fn add_left_kid(&mut self, left_kid: Id, right_parents: &[Id], weights: &HashMap<Id, u32>) -> Result<Id, DistZeroError> {
        let assignment = weighted_round_robin(&[left_kid.clone()], right_parents, weights)?;
        let right_parent = assignment.get(&left_kid).expect("weighted_round_robin placed the single kid").clone();
        let forwarder = Id::new("Forwarder");
        self.forwarders.insert(left_kid.clone(), forwarder.clone());
        self.assignment.insert(left_kid, right_parent);
        Ok(forwarder)
    }

    /// One `(left_kid, forwarder, right_parent_handle)` row per assignment,
    /// for the caller to wire up senders/receivers.
    pub fn rows<'a>(&'a self, right_parent_handles: &'a HashMap<Id, Handle>) -> Vec<(Id, Id, Handle)> {
        self.forwarders
            .iter()
            .filter_map(|(left_kid, forwarder)| {
                let right_parent = self.assignment.get(left_kid)?;
                let handle = right_parent_handles.get(right_parent)?;
                Some((left_kid.clone(), forwarder.clone(), handle.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(prefix: &str, n: usize) -> Vec<Id> {
        (0..n).map(|i| Id::from_raw(format!("{prefix}{i}"))).collect()
    }

    #[test]
    fn weighted_rr_respects_per_parent_weights() {
        let kids = ids("kid", 5);
        let parents = ids("parent", 2);
        let mut weights = HashMap::new();
        weights.insert(parents[0].clone(), 2);
        weights.insert(parents[1].clone(), 3);

        let assignment = weighted_round_robin(&kids, &parents, &weights).unwrap();
        assert_eq!(assignment.len(), 5);

        let mut counts: HashMap<Id, u32> = HashMap::new();
        for parent in assignment.values() {
            *counts.entry(parent.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts[&parents[0]], 2);
        assert_eq!(counts[&parents[1]], 3);
    }

    #[test]
    fn weighted_rr_fails_when_demand_exceeds_capacity() {
        let kids = ids("kid", 5);
        let parents = ids("parent", 1);
        let mut weights = HashMap::new();
        weights.insert(parents[0].clone(), 2);

        let err = weighted_round_robin(&kids, &parents, &weights).unwrap_err();
        assert!(matches!(err, DistZeroError::NoRemainingAvailability { total: 5, remaining: 3 }));
    }
}
