//! Links a node's [`Importer`]s to its [`Exporter`]s: periodic
//! acknowledgement, retransmission, and dispatch of incoming sequence
//! messages.

use std::collections::{HashMap, VecDeque};

use crate::errors::TransportError;
use crate::exporter::Exporter;
use crate::handle::Handle;
use crate::ids::Id;
use crate::importer::Importer;
use crate::message::SequenceMessage;
use crate::ticker::Ticker;

/// The default period between acknowledgement sweeps.
pub const TIME_BETWEEN_ACKNOWLEDGEMENTS_MS: u64 = 30;
/// The default period between retransmission sweeps.
pub const TIME_BETWEEN_RETRANSMISSION_CHECKS_MS: u64 = 20;

/// A pairing of a node's importers and exporters, driven by a tick loop.
///
/// `Linker` owns no application state; it exists purely to batch the
/// housekeeping (acknowledgements, retransmission) that every node with
/// sequenced peers needs, one instance per node.
#[derive(Debug)]
pub struct Linker {
    importers: HashMap<Id, Importer>,
    exporters: HashMap<Id, Exporter>,

    acknowledgement_ticker: Ticker,
    retransmission_ticker: Ticker,

    /// A log of `(local_sn_at_which_sent, importer_snapshot)` pairs, one per
    /// downstream export, recorded by [`Self::record_branching`].
    ///
    /// A node that both imports and exports ties what it acknowledges
    /// upstream to what has actually been consumed (exported and
    /// acknowledged) downstream: an entry is only eligible to drive
    /// acknowledgements once every exporter's least-unacknowledged sequence
    /// number has passed its `local_sn`. A node with no exporters has
    /// nothing downstream to wait on, so [`Self::elapse`] falls back to
    /// acknowledging from each importer's own progress directly.
    branching: VecDeque<(u64, Vec<(Id, u64)>)>,

    /// Number of times this linker has retransmitted a message.
    pub n_retransmissions: u64,
    /// Number of times this linker has received an out-of-order message.
    pub n_reorders: u64,
    /// Number of times this linker has received a message it already had.
    pub n_duplicates: u64,
}

/// What a caller of [`Linker::elapse`] must do as a result of ticking.
#[derive(Debug, Default)]
pub struct LinkerActions {
    /// `(receiver_id, message)` pairs to send as acknowledgements.
    pub acknowledgements: Vec<(Id, SequenceMessage)>,
    /// `(receiver_id, message)` pairs to retransmit.
    pub retransmissions: Vec<(Id, SequenceMessage)>,
}

impl Linker {
    /// Creates an empty linker.
    pub fn new() -> Self {
        Linker {
            importers: HashMap::new(),
            exporters: HashMap::new(),
            acknowledgement_ticker: Ticker::new(TIME_BETWEEN_ACKNOWLEDGEMENTS_MS),
            retransmission_ticker: Ticker::new(TIME_BETWEEN_RETRANSMISSION_CHECKS_MS),
            branching: VecDeque::new(),
            n_retransmissions: 0,
            n_reorders: 0,
            n_duplicates: 0,
        }
    }

    /// Registers a new importer for `sender`.
    pub fn new_importer(&mut self, sender: Handle) -> Id {
        let sender_id = sender.node_id.clone();
        self.importers.insert(sender_id.clone(), Importer::new(sender));
        sender_id
    }

    /// Registers a new exporter to `receiver`.
    pub fn new_exporter(&mut self, receiver: Handle, retransmit: bool) -> Id {
        let receiver_id = receiver.node_id.clone();
        self.exporters.insert(receiver_id.clone(), Exporter::new(receiver, retransmit, 0));
        receiver_id
    }

    /// Removes a set of importers entirely.
    pub fn remove_importers(&mut self, sender_ids: &[Id]) {
        for sender_id in sender_ids {
            self.importers.remove(sender_id);
        }
    }

    /// Removes a set of exporters entirely.
    pub fn remove_exporters(&mut self, receiver_ids: &[Id]) {
        for receiver_id in receiver_ids {
            self.exporters.remove(receiver_id);
        }
    }

    /// Borrows the importer registered for `sender_id`, if any.
    pub fn importer(&self, sender_id: &Id) -> Option<&Importer> {
        self.importers.get(sender_id)
    }

    /// Borrows the exporter registered for `receiver_id`, if any.
    pub fn exporter(&self, receiver_id: &Id) -> Option<&Exporter> {
        self.exporters.get(receiver_id)
    }

    /// Mutably borrows the exporter registered for `receiver_id`, if any.
    pub fn exporter_mut(&mut self, receiver_id: &Id) -> Option<&mut Exporter> {
        self.exporters.get_mut(receiver_id)
    }

    /// Dispatches an incoming [`SequenceMessage`] to the importer or exporter
    /// it concerns, keyed by the id of the node that sent it.
    pub fn receive_sequence_message(
        &mut self,
        sender_id: &Id,
        message: SequenceMessage,
    ) -> Result<(), TransportError> {
        match message {
            SequenceMessage::Acknowledge { sequence_number } => {
                let exporter = self
                    .exporters
                    .get_mut(sender_id)
                    .ok_or_else(|| TransportError::UnknownPeer { kind: "exporter", peer: sender_id.clone() })?;
                exporter.acknowledge(sequence_number);
                Ok(())
            }
            SequenceMessage::Receive { sequence_number, .. } => {
                let importer = self
                    .importers
                    .get_mut(sender_id)
                    .ok_or_else(|| TransportError::UnknownPeer { kind: "importer", peer: sender_id.clone() })?;
                match importer.receive(sequence_number) {
                    crate::importer::ReceiptKind::InOrder => {}
                    crate::importer::ReceiptKind::Reorder => self.n_reorders += 1,
                    crate::importer::ReceiptKind::Duplicate => self.n_duplicates += 1,
                }
                Ok(())
            }
        }
    }

    /// The least sequence number that has not been acknowledged by every
    /// exporter responsible for it.
    pub fn least_unacknowledged_sequence_number(&self, least_unused_sequence_number: u64) -> u64 {
        self.exporters
            .values()
            .filter(|e| e.has_pending_messages())
            .map(Exporter::least_unacknowledged_sequence_number)
            .fold(least_unused_sequence_number, u64::min)
    }

    /// Records, at the moment this node exports `local_sn` downstream, what
    /// each importer has seen so far.
    ///
    /// A no-op when this linker has no exporters: with nothing downstream to
    /// gate on, there is no branching to track.
    pub fn record_branching(&mut self, local_sn: u64) {
        if self.exporters.is_empty() {
            return;
        }
        let snapshot = self
            .importers
            .iter()
            .map(|(sender_id, importer)| (sender_id.clone(), importer.least_unseen_remote_sequence_number()))
            .collect();
        self.branching.push_back((local_sn, snapshot));
    }

    /// The least local sequence number every exporter still has pending,
    /// i.e. has not yet seen acknowledged by its receiver. `u64::MAX` when no
    /// exporter has anything pending, so every recorded branching entry
    /// counts as covered.
    fn exporter_ack_floor(&self) -> u64 {
        self.least_unacknowledged_sequence_number(u64::MAX)
    }

    /// Drops every branching entry downstream has now consumed, returning
    /// the importer snapshot recorded at the last one dropped, if any.
    fn branching_snapshot_for_ack(&mut self) -> Option<Vec<(Id, u64)>> {
        if self.branching.is_empty() {
            return None;
        }
        let floor = self.exporter_ack_floor();
        let mut covered = None;
        while let Some((local_sn, _)) = self.branching.front() {
            if *local_sn >= floor {
                break;
            }
            covered = self.branching.pop_front().map(|(_, snapshot)| snapshot);
        }
        covered
    }

    /// Elapses `ms` milliseconds, returning what the caller must send as a
    /// result (acknowledgements and/or retransmissions).
    pub fn elapse(&mut self, ms: u64) -> LinkerActions {
        let mut actions = LinkerActions::default();

        if self.acknowledgement_ticker.elapse(ms) > 0 {
            // Gated on whether any branching was ever recorded, not merely on
            // whether an exporter is registered: a linker with an exporter
            // that never calls `record_branching` would otherwise withhold
            // every acknowledgement forever instead of falling back to the
            // immediate-importer-floor behavior below.
            if self.branching.is_empty() {
                for (sender_id, importer) in self.importers.iter() {
                    let sequence_number = importer.least_unseen_remote_sequence_number();
                    if sequence_number == 0 {
                        continue;
                    }
                    actions
                        .acknowledgements
                        .push((sender_id.clone(), SequenceMessage::Acknowledge { sequence_number }));
                }
            } else if let Some(snapshot) = self.branching_snapshot_for_ack() {
                for (sender_id, sequence_number) in snapshot {
                    if sequence_number == 0 {
                        continue;
                    }
                    actions.acknowledgements.push((sender_id, SequenceMessage::Acknowledge { sequence_number }));
                }
            }
        }

        if self.retransmission_ticker.elapse(ms) > 0 {
            for (receiver_id, exporter) in self.exporters.iter() {
                for message in exporter.pending_for_retransmission() {
                    actions.retransmissions.push((receiver_id.clone(), message.clone()));
                    self.n_retransmissions += 1;
                }
            }
        }

        actions
    }
}

impl Default for Linker {
    fn default() -> Self {
        Linker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Transport;

    fn handle(prefix: &str) -> Handle {
        Handle::new(Id::new(prefix), Transport::Local)
    }

    #[test]
    fn acknowledgements_are_batched_until_the_tick_boundary() {
        let mut linker = Linker::new();
        let sender_id = linker.new_importer(handle("sender"));
        linker
            .receive_sequence_message(&sender_id, SequenceMessage::Receive {
                sequence_number: 0,
                message: crate::message::DeltaMessage::Increment { amount: 1 },
            })
            .unwrap();

        let actions = linker.elapse(TIME_BETWEEN_ACKNOWLEDGEMENTS_MS - 1);
        assert!(actions.acknowledgements.is_empty());

        let actions = linker.elapse(2);
        assert_eq!(actions.acknowledgements.len(), 1);
        assert_eq!(actions.acknowledgements[0].0, sender_id);
    }

    #[test]
    fn a_gap_withholds_acknowledgement_until_it_is_filled() {
        let mut linker = Linker::new();
        let sender_id = linker.new_importer(handle("sender"));

        // sequence number 1 arrives before 0: nothing has been contiguously
        // seen yet, so no acknowledgement should be sent even once the tick
        // boundary passes.
        linker
            .receive_sequence_message(&sender_id, SequenceMessage::Receive {
                sequence_number: 1,
                message: crate::message::DeltaMessage::Increment { amount: 1 },
            })
            .unwrap();
        assert_eq!(linker.n_reorders, 1);

        let actions = linker.elapse(TIME_BETWEEN_ACKNOWLEDGEMENTS_MS);
        assert!(actions.acknowledgements.is_empty());

        linker
            .receive_sequence_message(&sender_id, SequenceMessage::Receive {
                sequence_number: 0,
                message: crate::message::DeltaMessage::Increment { amount: 1 },
            })
            .unwrap();

        let actions = linker.elapse(TIME_BETWEEN_ACKNOWLEDGEMENTS_MS);
        assert_eq!(actions.acknowledgements.len(), 1);
        assert_eq!(actions.acknowledgements[0].1, SequenceMessage::Acknowledge { sequence_number: 2 });
    }

    #[test]
    fn branching_withholds_acknowledgement_until_downstream_consumes_it() {
        let mut linker = Linker::new();
        let sender_id = linker.new_importer(handle("sender"));
        let receiver_id = linker.new_exporter(handle("receiver"), true);

        linker
            .receive_sequence_message(&sender_id, SequenceMessage::Receive {
                sequence_number: 0,
                message: crate::message::DeltaMessage::Increment { amount: 1 },
            })
            .unwrap();

        // Export downstream, recording what had been seen from `sender` at
        // this moment.
        linker.record_branching(0);
        linker
            .exporter_mut(&receiver_id)
            .unwrap()
            .export(0, SequenceMessage::Receive { sequence_number: 0, message: crate::message::DeltaMessage::Increment { amount: 1 } });

        // Downstream has not acknowledged anything yet: even past the tick
        // boundary, `sender` must not be acknowledged, unlike the naive
        // importer-floor behavior this would otherwise trigger.
        let actions = linker.elapse(TIME_BETWEEN_ACKNOWLEDGEMENTS_MS);
        assert!(actions.acknowledgements.is_empty());

        // Downstream acknowledges the export; the branching entry recorded
        // at export time is now covered, and its snapshot drives the
        // acknowledgement to `sender`.
        linker.receive_sequence_message(&receiver_id, SequenceMessage::Acknowledge { sequence_number: 1 }).unwrap();

        let actions = linker.elapse(TIME_BETWEEN_ACKNOWLEDGEMENTS_MS);
        assert_eq!(actions.acknowledgements.len(), 1);
        assert_eq!(actions.acknowledgements[0], (sender_id, SequenceMessage::Acknowledge { sequence_number: 1 }));
    }

    #[test]
    fn branching_releases_the_latest_covered_snapshot_once_multiple_entries_clear() {
        let mut linker = Linker::new();
        let sender_id = linker.new_importer(handle("sender"));
        let receiver_id = linker.new_exporter(handle("receiver"), true);

        for sn in 0..3 {
            linker
                .receive_sequence_message(&sender_id, SequenceMessage::Receive {
                    sequence_number: sn,
                    message: crate::message::DeltaMessage::Increment { amount: 1 },
                })
                .unwrap();
            linker.record_branching(sn);
            linker
                .exporter_mut(&receiver_id)
                .unwrap()
                .export(sn, SequenceMessage::Receive { sequence_number: sn, message: crate::message::DeltaMessage::Increment { amount: 1 } });
        }

        // Acknowledging everything downstream in one shot covers all three
        // branching entries; only the newest (most caught-up) snapshot
        // should drive the upstream acknowledgement.
        linker.receive_sequence_message(&receiver_id, SequenceMessage::Acknowledge { sequence_number: 3 }).unwrap();

        let actions = linker.elapse(TIME_BETWEEN_ACKNOWLEDGEMENTS_MS);
        assert_eq!(actions.acknowledgements.len(), 1);
        assert_eq!(actions.acknowledgements[0], (sender_id, SequenceMessage::Acknowledge { sequence_number: 3 }));
    }

    #[test]
    fn unknown_peer_is_reported() {
        let mut linker = Linker::new();
        let err = linker
            .receive_sequence_message(&Id::new("ghost"), SequenceMessage::Acknowledge { sequence_number: 1 })
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer { .. }));
    }
}
