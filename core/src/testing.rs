//! An in-process test harness: builds nodes directly, delivers
//! [`distzero_transport::NetworkMessage`]s without touching a socket, and
//! advances time by calling `elapse(ms)` in a loop.
//!
//! [`SumAggregator`] is a test-only stand-in for the numeric operators a
//! running dataflow program applies, which this crate treats as opaque and
//! out of scope: it folds every sender's increments into one combined delta
//! per tick and forwards that delta downstream over an ordinary
//! reliable-sequenced pairing, giving one interior position in a link fabric
//! real behavior without inventing semantics for `Plus`, `Project`, or
//! `Inject`. It is wired up by hand here rather than through
//! [`crate::machine::Machine`], whose `Interior` node kind intentionally
//! carries none.

use std::collections::HashMap;

use distzero_transport::{DeltaMessage, Deltas, Handle, Id, Linker, SequenceMessage, Transport};

/// A test-only aggregator: accumulates increments from many senders and
/// forwards their combined sum downstream once per [`elapse`](Self::elapse).
pub struct SumAggregator {
    id: Id,
    linker: Linker,
    deltas: Deltas,
    senders: HashMap<Id, Handle>,
    downstream: Handle,
    next_sequence_number: u64,
}

impl SumAggregator {
    /// Builds an aggregator forwarding combined increments to `downstream`.
    pub fn new(id: Id, downstream: Handle) -> Self {
        let mut linker = Linker::new();
        linker.new_exporter(downstream.clone(), true);
        SumAggregator { id, linker, deltas: Deltas::new(), senders: HashMap::new(), downstream, next_sequence_number: 0 }
    }

    /// This node's id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// A handle usable by a sender to reach this aggregator.
    pub fn handle(&self) -> Handle {
        Handle::new(self.id.clone(), Transport::Local)
    }

    /// Registers a new upstream sender.
    pub fn add_sender(&mut self, sender: Handle) {
        let sender_id = sender.node_id.clone();
        self.linker.new_importer(sender.clone());
        let _ = self.deltas.add_sender(sender_id.clone());
        self.senders.insert(sender_id, sender);
    }

    /// Receives one [`SequenceMessage`] from `sender_id`, buffering any new
    /// delta (in order or not) for the next tick's combination.
    pub fn receive_sequence(&mut self, sender_id: Id, message: SequenceMessage) {
        let _ = self.linker.receive_sequence_message(&sender_id, message.clone());
        if let SequenceMessage::Receive { sequence_number, message: delta } = message {
            let _ = self.deltas.add_message(&sender_id, sequence_number, delta);
        }
    }

    /// Advances this aggregator's clock by `ms`, combining any pending
    /// deltas into one forwarded increment and running the linker's
    /// acknowledgement/retransmission cadence.
    ///
    /// Returns every `(destination, message)` pair the caller must deliver.
    pub fn elapse(&mut self, ms: u64) -> Vec<(Handle, SequenceMessage)> {
        let mut outbound = Vec::new();

        let (_, increment, updated) = self.deltas.pop_deltas(0, None);
        if updated && increment != 0 {
            let sequence_number = self.next_sequence_number;
            self.next_sequence_number += 1;
            let message = SequenceMessage::Receive { sequence_number, message: DeltaMessage::Increment { amount: increment } };
            let exported = self
                .linker
                .exporter_mut(&self.downstream.node_id)
                .expect("downstream exporter registered in new()")
                .export(sequence_number, message);
            outbound.push((self.downstream.clone(), exported));
        }

        let linker_actions = self.linker.elapse(ms);
        for (receiver_id, message) in linker_actions.acknowledgements {
            let handle = self.senders.get(&receiver_id).cloned().unwrap_or_else(|| Handle::new(receiver_id, Transport::Local));
            outbound.push((handle, message));
        }
        for (_receiver_id, message) in linker_actions.retransmissions {
            outbound.push((self.downstream.clone(), message));
        }

        outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::node::data::DataNode;
    use distzero_transport::Variant;

    /// Wires an input leaf -> one [`SumAggregator`] -> an output leaf by
    /// hand, then drains the resulting message traffic to a fixed point on
    /// each `elapse`, mirroring a single link layer between two dataset
    /// leaves.
    struct SinglePipeline {
        input: DataNode,
        sum: SumAggregator,
        output: DataNode,
    }

    impl SinglePipeline {
        fn new() -> Self {
            let config = SystemConfig::default();
            let sum_id = Id::from_raw("Sum");
            let input_id = Id::from_raw("InputLeaf");
            let output_id = Id::from_raw("OutputLeaf");

            let mut input = DataNode::new(input_id.clone(), None, Variant::Input, -1, config);
            let mut output = DataNode::new(output_id.clone(), None, Variant::Output, -1, config);

            let sum_handle = Handle::new(sum_id.clone(), Transport::Local);
            let output_handle = Handle::new(output_id.clone(), Transport::Local);
            let input_handle = Handle::new(input_id.clone(), Transport::Local);

            input.set_adjacent(sum_handle.clone());
            output.set_adjacent(sum_handle);

            let mut sum = SumAggregator::new(sum_id, output_handle);
            sum.add_sender(input_handle);

            SinglePipeline { input, sum, output }
        }

        fn input_action(&mut self, amount: i64) {
            let actions = self.input.input_action(amount).expect("input leaf accepts input_action");
            for action in actions {
                if let crate::node::data::DataNodeAction::SendSequence { message, .. } = action {
                    self.sum.receive_sequence(Id::from_raw("InputLeaf"), message);
                }
            }
        }

        fn flush(&mut self, ms: u64) {
            for (to, message) in self.sum.elapse(ms) {
                if to.node_id == Id::from_raw("OutputLeaf") {
                    self.output.receive_sequence(Id::from_raw("Sum"), message).expect("output leaf receives sequence messages");
                }
            }
            self.input.elapse(ms);
            self.output.elapse(ms);
        }

        fn output_state(&self) -> i64 {
            self.output.current_state().expect("output leaf maintains state")
        }
    }

    #[test]
    fn single_leaf_sum_matches_the_sum_of_every_input_action() {
        let mut pipeline = SinglePipeline::new();
        pipeline.input_action(3);
        pipeline.input_action(-1);
        pipeline.input_action(7);
        pipeline.flush(1);

        assert_eq!(pipeline.output_state(), 9);
    }

    #[test]
    fn a_sum_aggregator_combines_several_senders_into_one_forwarded_increment() {
        let downstream_id = Id::new("Downstream");
        let mut sum = SumAggregator::new(Id::new("Sum"), Handle::new(downstream_id, Transport::Local));
        let a = Handle::new(Id::new("A"), Transport::Local);
        let b = Handle::new(Id::new("B"), Transport::Local);
        sum.add_sender(a.clone());
        sum.add_sender(b.clone());

        sum.receive_sequence(a.node_id.clone(), SequenceMessage::Receive { sequence_number: 0, message: DeltaMessage::InputAction { number: 5 } });
        sum.receive_sequence(b.node_id.clone(), SequenceMessage::Receive { sequence_number: 0, message: DeltaMessage::InputAction { number: 2 } });

        let outbound = sum.elapse(1);
        let forwarded: i64 = outbound
            .into_iter()
            .filter_map(|(_, message)| match message {
                SequenceMessage::Receive { message: DeltaMessage::Increment { amount }, .. } => Some(amount),
                _ => None,
            })
            .sum();
        assert_eq!(forwarded, 7);
    }

    /// A sink applies every contiguous, in-order delta exactly once, which is
    /// what lets a migration swap buffer new-flow deltas in `deltas_only`
    /// mode and pop them afterward without double-counting or dropping any.
    /// See [`crate::migration`]'s `single_source_single_sink_migration_runs_to_completion`
    /// for the full phased protocol this invariant backs.
    #[test]
    fn an_output_leaf_applies_contiguous_deltas_exactly_once_each() {
        let config = SystemConfig::default();
        let output_id = Id::new("OutputLeaf");
        let sender_id = Id::new("Sum");
        let mut output = DataNode::new(output_id, None, Variant::Output, -1, config);
        output.set_adjacent(Handle::new(sender_id.clone(), Transport::Local));

        output.receive_sequence(sender_id.clone(), SequenceMessage::Receive { sequence_number: 0, message: DeltaMessage::Increment { amount: 10 } }).unwrap();
        assert_eq!(output.current_state().unwrap(), 10);

        // Migration installs a new flow; buffered deltas continue to arrive
        // on the *old* sequence while the sink has not yet been told to
        // switch over (here, simply more old-flow increments).
        output.receive_sequence(sender_id.clone(), SequenceMessage::Receive { sequence_number: 1, message: DeltaMessage::Increment { amount: 5 } }).unwrap();
        output.receive_sequence(sender_id, SequenceMessage::Receive { sequence_number: 2, message: DeltaMessage::Increment { amount: 2 } }).unwrap();

        assert_eq!(output.current_state().unwrap(), 17);
    }

    /// A delta that outruns a gap left by a lost or delayed message is
    /// buffered rather than discarded, and is folded into state only once
    /// retransmission fills the gap behind it — no permanent loss, nothing
    /// applied twice.
    #[test]
    fn an_output_leaf_buffers_a_delta_that_arrives_ahead_of_a_gap() {
        let config = SystemConfig::default();
        let output_id = Id::new("OutputLeaf");
        let sender_id = Id::new("Sum");
        let mut output = DataNode::new(output_id, None, Variant::Output, -1, config);
        output.set_adjacent(Handle::new(sender_id.clone(), Transport::Local));

        // sequence number 0 is lost in transit; 1 arrives first.
        output.receive_sequence(sender_id.clone(), SequenceMessage::Receive { sequence_number: 1, message: DeltaMessage::Increment { amount: 5 } }).unwrap();
        assert_eq!(output.current_state().unwrap(), 0);

        // Retransmission fills the gap; both increments now apply, in order,
        // exactly once.
        output.receive_sequence(sender_id.clone(), SequenceMessage::Receive { sequence_number: 0, message: DeltaMessage::Increment { amount: 10 } }).unwrap();
        assert_eq!(output.current_state().unwrap(), 15);

        // A retransmitted duplicate of sequence number 0 must not be applied
        // again.
        output.receive_sequence(sender_id, SequenceMessage::Receive { sequence_number: 0, message: DeltaMessage::Increment { amount: 10 } }).unwrap();
        assert_eq!(output.current_state().unwrap(), 15);
    }

    /// Ties `start_duplicating`/`deltas_only`/`finish_deltas_only`/
    /// `finish_duplicating` together the way a Source migrator's switch phase
    /// does: an input leaf duplicates its exports to a new output leaf while
    /// the old output leaf keeps applying directly, the new leaf withholds
    /// every duplicated delta until the cutover, and the cutover folds them
    /// all in at once. Both leaves must end up with the identical total.
    #[test]
    fn migration_swap_preserves_the_accumulated_sum() {
        let config = SystemConfig::default();
        let input_id = Id::from_raw("InputLeaf");
        let old_output_id = Id::from_raw("OldOutputLeaf");
        let new_output_id = Id::from_raw("NewOutputLeaf");

        let mut input = DataNode::new(input_id.clone(), None, Variant::Input, -1, config);
        let mut old_output = DataNode::new(old_output_id.clone(), None, Variant::Output, -1, config);
        let mut new_output = DataNode::new(new_output_id.clone(), None, Variant::Output, -1, config);

        let input_handle = Handle::new(input_id.clone(), Transport::Local);
        let old_output_handle = Handle::new(old_output_id.clone(), Transport::Local);
        let new_output_handle = Handle::new(new_output_id.clone(), Transport::Local);

        input.set_adjacent(old_output_handle);
        old_output.set_adjacent(input_handle.clone());
        new_output.set_adjacent(input_handle);

        // The switch phase begins: the new leaf must not apply anything
        // until the cutover, even though it is already receiving duplicated
        // traffic.
        new_output.set_deltas_only(true);
        input.start_duplicating(vec![new_output_handle]);

        let mut expected_total = 0i64;
        for amount in [3, 5, 2] {
            expected_total += amount;
            for action in input.input_action(amount).expect("input leaf accepts input_action") {
                if let crate::node::data::DataNodeAction::SendSequence { to, message } = action {
                    if to.node_id == old_output_id {
                        old_output.receive_sequence(input_id.clone(), message).unwrap();
                    } else if to.node_id == new_output_id {
                        new_output.receive_sequence(input_id.clone(), message).unwrap();
                    }
                }
            }
        }

        // The old flow applied every increment directly; the new flow has
        // buffered the same three deltas without folding any of them in.
        assert_eq!(old_output.current_state().unwrap(), expected_total);
        assert_eq!(new_output.current_state().unwrap(), 0);

        let mut cutoff = HashMap::new();
        cutoff.insert(input_id.clone(), 3);
        assert!(new_output.deltas_cover(&cutoff), "every pre-cutover delta has already arrived");

        // Cutover: the old receiver stops getting traffic, and the new one
        // folds in everything it buffered during the switch.
        let removed = input.finish_duplicating(&old_output_id);
        assert!(removed.is_some());
        new_output.finish_deltas_only(&cutoff);

        assert_eq!(new_output.current_state().unwrap(), expected_total);
        assert_eq!(new_output.current_state().unwrap(), old_output.current_state().unwrap());
    }
}
