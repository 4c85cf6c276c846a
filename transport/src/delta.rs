//! Accumulates numbered deltas from many senders between ticks.
//!
//! [`Deltas`] is the piece of a node that turns a stream of per-sender
//! numbered [`DeltaMessage`] values into one combined increment, applied at
//! most once per tick.

use std::collections::{BTreeMap, HashMap};

use crate::errors::TransportError;
use crate::ids::Id;
use crate::message::DeltaMessage;

#[derive(Debug, Default)]
struct SenderDeltas {
    /// Messages received but not yet popped, keyed by sequence number so a
    /// message that arrives ahead of a gap (reordered, or delivered while an
    /// earlier one is still in flight/being retransmitted) is buffered
    /// rather than discarded.
    pending: BTreeMap<u64, DeltaMessage>,
    /// The least sequence number from this sender not yet popped.
    first_unpopped: u64,
}

/// Buffers numbered deltas per sender until they are folded into a node's state.
#[derive(Debug, Default)]
pub struct Deltas {
    senders: HashMap<Id, SenderDeltas>,
}

impl Deltas {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Deltas { senders: HashMap::new() }
    }

    /// Starts tracking deltas for a new sender.
    pub fn add_sender(&mut self, sender_id: Id) -> Result<(), TransportError> {
        if self.senders.contains_key(&sender_id) {
            return Err(TransportError::SenderAlreadyAdded(sender_id));
        }
        self.senders.insert(sender_id, SenderDeltas::default());
        Ok(())
    }

    /// Stops tracking deltas for a sender, discarding anything still pending.
    pub fn remove_sender(&mut self, sender_id: &Id) {
        self.senders.remove(sender_id);
    }

    /// The least sequence number from `sender_id` not yet contiguously seen:
    /// every message below it has arrived (though not necessarily popped),
    /// and nothing at or above it can be assumed present.
    pub fn first_unseen_sequence_number(&self, sender_id: &Id) -> u64 {
        let state = &self.senders[sender_id];
        let mut boundary = state.first_unpopped;
        while state.pending.contains_key(&boundary) {
            boundary += 1;
        }
        boundary
    }

    /// Stores a message for later combination.
    ///
    /// `sender_id` must already be registered via [`add_sender`](Self::add_sender).
    /// A message at or beyond [`first_unseen_sequence_number`](Self::first_unseen_sequence_number)
    /// is buffered even if it arrives ahead of a gap; one already seen
    /// (a duplicate, typically from retransmission) is silently ignored.
    pub fn add_message(&mut self, sender_id: &Id, sequence_number: u64, message: DeltaMessage) -> Result<(), TransportError> {
        let state = self.senders.get_mut(sender_id).ok_or_else(|| TransportError::UnknownPeer { kind: "delta sender", peer: sender_id.clone() })?;
        if sequence_number < state.first_unpopped {
            return Ok(());
        }
        state.pending.entry(sequence_number).or_insert(message);
        Ok(())
    }

    /// True iff any sender has at least one pending message.
    pub fn has_data(&self) -> bool {
        self.senders.values().any(|s| !s.pending.is_empty())
    }

    /// True iff every sequence number named in `before` has already arrived.
    ///
    /// `before` maps sender id to a sequence number; a sender absent from
    /// `before` imposes no requirement. A sender named in `before` but never
    /// registered via [`add_sender`](Self::add_sender) counts as not covered,
    /// rather than panicking: this accumulator has no record of it, so it
    /// cannot possibly have seen any of its messages yet.
    pub fn covers(&self, before: &HashMap<Id, u64>) -> bool {
        before
            .iter()
            .all(|(sender_id, sequence_number)| self.senders.contains_key(sender_id) && self.first_unseen_sequence_number(sender_id) >= *sequence_number)
    }

    /// Removes accumulated deltas, combines them, and folds them into `state`.
    ///
    /// Only the contiguous run starting at each sender's `first_unpopped` is
    /// popped; a gap (a message still missing, awaiting retransmission)
    /// stops that sender's run even if later sequence numbers are already
    /// buffered. When `before` is given, a sender's run additionally stops
    /// before `before[sender_id]`; senders absent from `before`, or with no
    /// cap, have no such limit. Returns the new state, the increment
    /// applied, and whether anything changed.
    pub fn pop_deltas(&mut self, state: i64, before: Option<&HashMap<Id, u64>>) -> (i64, i64, bool) {
        let mut increment = 0i64;
        let mut updated = false;

        for (sender_id, sender) in self.senders.iter_mut() {
            let cap = before.and_then(|b| b.get(sender_id)).copied();
            loop {
                if cap.is_some_and(|cap| sender.first_unpopped >= cap) {
                    break;
                }
                match sender.pending.remove(&sender.first_unpopped) {
                    Some(delta_message) => {
                        updated = true;
                        increment += delta_message.amount();
                        sender.first_unpopped += 1;
                    }
                    None => break,
                }
            }
        }

        if updated {
            (state + increment, increment, updated)
        } else {
            (state, increment, updated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn increment(amount: i64) -> DeltaMessage {
        DeltaMessage::Increment { amount }
    }

    #[test]
    fn combines_messages_from_multiple_senders() {
        let mut deltas = Deltas::new();
        let a = Id::new("a");
        let b = Id::new("b");
        deltas.add_sender(a.clone()).unwrap();
        deltas.add_sender(b.clone()).unwrap();

        deltas.add_message(&a, 0, increment(3)).unwrap();
        deltas.add_message(&a, 1, increment(4)).unwrap();
        deltas.add_message(&b, 0, increment(10)).unwrap();

        let (new_state, increment_amount, updated) = deltas.pop_deltas(100, None);
        assert!(updated);
        assert_eq!(increment_amount, 17);
        assert_eq!(new_state, 117);
        assert!(!deltas.has_data());
    }

    #[test]
    fn buffers_out_of_order_messages_until_the_gap_is_filled() {
        let mut deltas = Deltas::new();
        let a = Id::new("a");
        deltas.add_sender(a.clone()).unwrap();

        // sequence number 1 arrives before 0 (reordered, or 0 is still in
        // flight and will show up via retransmission).
        deltas.add_message(&a, 1, increment(5)).unwrap();
        assert_eq!(deltas.first_unseen_sequence_number(&a), 0);

        let (state, increment_amount, updated) = deltas.pop_deltas(0, None);
        assert!(!updated);
        assert_eq!(increment_amount, 0);
        assert_eq!(state, 0);

        deltas.add_message(&a, 0, increment(3)).unwrap();
        assert_eq!(deltas.first_unseen_sequence_number(&a), 2);

        let (state, increment_amount, updated) = deltas.pop_deltas(0, None);
        assert!(updated);
        assert_eq!(increment_amount, 8);
        assert_eq!(state, 8);
    }

    #[test]
    fn duplicate_messages_are_ignored() {
        let mut deltas = Deltas::new();
        let a = Id::new("a");
        deltas.add_sender(a.clone()).unwrap();
        deltas.add_message(&a, 0, increment(3)).unwrap();
        deltas.pop_deltas(0, None);

        // A retransmitted copy of a message already popped must not be
        // re-applied.
        deltas.add_message(&a, 0, increment(3)).unwrap();
        let (state, increment_amount, updated) = deltas.pop_deltas(0, None);
        assert!(!updated);
        assert_eq!(increment_amount, 0);
        assert_eq!(state, 0);
    }

    #[test]
    fn pop_deltas_is_a_noop_with_nothing_pending() {
        let mut deltas = Deltas::new();
        let a = Id::new("a");
        deltas.add_sender(a).unwrap();
        let (new_state, increment_amount, updated) = deltas.pop_deltas(42, None);
        assert!(!updated);
        assert_eq!(increment_amount, 0);
        assert_eq!(new_state, 42);
    }

    #[test]
    fn before_cap_defers_later_messages() {
        let mut deltas = Deltas::new();
        let a = Id::new("a");
        deltas.add_sender(a.clone()).unwrap();
        deltas.add_message(&a, 0, increment(1)).unwrap();
        deltas.add_message(&a, 1, increment(2)).unwrap();

        let mut before = HashMap::new();
        before.insert(a.clone(), 1);

        let (state, increment_amount, updated) = deltas.pop_deltas(0, Some(&before));
        assert!(updated);
        assert_eq!(increment_amount, 1);
        assert_eq!(state, 1);
        assert!(deltas.has_data());
    }
}
