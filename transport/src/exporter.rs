//! Tracks one destination of sequenced output messages from a node, including
//! retransmission of unacknowledged messages and message duplication during
//! migrations.

use crate::handle::Handle;
use crate::ids::Id;
use crate::message::SequenceMessage;

/// One message this node has sent but not yet seen acknowledged.
#[derive(Clone, Debug)]
struct Pending {
    sequence_number: u64,
    message: SequenceMessage,
}

/// Represents a peer this node is sending numbered messages to.
///
/// Remembers every message sent since the last acknowledgement so that it
/// can retransmit, and can be put into a duplicating state during a
/// migration so that every export also fans out to a set of sibling
/// exporters under construction.
#[derive(Clone, Debug)]
pub struct Exporter {
    receiver: Handle,
    retransmit: bool,
    least_unacknowledged_sequence_number: u64,
    pending: Vec<Pending>,
    /// `Some` while duplicating; holds the receiver ids being duplicated to.
    duplicating_to: Option<Vec<Id>>,
}

impl Exporter {
    /// Creates an exporter to `receiver`, starting at `least_unacknowledged_sequence_number`.
    pub fn new(receiver: Handle, retransmit: bool, least_unacknowledged_sequence_number: u64) -> Self {
        Exporter {
            receiver,
            retransmit,
            least_unacknowledged_sequence_number,
            pending: Vec::new(),
            duplicating_to: None,
        }
    }

    /// A handle to the node this exporter sends to.
    pub fn receiver(&self) -> &Handle {
        &self.receiver
    }

    /// The id of the node this exporter sends to.
    pub fn receiver_id(&self) -> &Id {
        &self.receiver.node_id
    }

    /// The least sequence number this exporter has not yet seen acknowledged.
    pub fn least_unacknowledged_sequence_number(&self) -> u64 {
        self.least_unacknowledged_sequence_number
    }

    /// True iff there is at least one message sent but not yet acknowledged.
    pub fn has_pending_messages(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Records an acknowledgement, dropping every message it now covers.
    ///
    /// Acknowledging twice with a non-increasing sequence number is a no-op,
    /// matching the receiver-side invariant that acknowledgements commute
    /// under `max`.
    pub fn acknowledge(&mut self, sequence_number: u64) {
        self.least_unacknowledged_sequence_number = self.least_unacknowledged_sequence_number.max(sequence_number);
        let floor = self.least_unacknowledged_sequence_number;
        self.pending.retain(|msg| msg.sequence_number < floor);
    }

    /// Records `message` as sent and returns it so the caller can deliver it.
    ///
    /// When duplicating, the caller is responsible for also delivering the
    /// message to every duplicate receiver (this exporter only tracks which
    /// receivers those are).
    pub fn export(&mut self, sequence_number: u64, message: SequenceMessage) -> SequenceMessage {
        self.pending.push(Pending { sequence_number, message: message.clone() });
        message
    }

    /// Returns every pending message that should be retransmitted right now.
    ///
    /// Returns nothing unless this exporter was constructed with
    /// `retransmit = true` (only exporters responsible for at-least-once
    /// delivery retransmit; the original reserves this for exporters on the
    /// live flow, not ones mid-migration-setup).
    pub fn pending_for_retransmission(&self) -> impl Iterator<Item = &SequenceMessage> {
        self.retransmit.then(|| self.pending.iter().map(|p| &p.message)).into_iter().flatten()
    }

    /// Begins duplicating every future export to the given receivers.
    ///
    /// Only one duplication phase may be active at a time.
    pub fn start_duplicating(&mut self, receiver_ids: Vec<Id>) {
        assert!(self.duplicating_to.is_none(), "exporter is already duplicating");
        self.duplicating_to = Some(receiver_ids);
    }

    /// Ends the current duplication phase, returning the receivers that were
    /// being duplicated to.
    pub fn finish_duplicating(&mut self) -> Vec<Id> {
        self.duplicating_to.take().unwrap_or_default()
    }

    /// The receivers currently being duplicated to, if any.
    pub fn duplicating_to(&self) -> Option<&[Id]> {
        self.duplicating_to.as_deref()
    }
}
