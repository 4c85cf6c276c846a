//! Error types for the transport layer.

use thiserror::Error;

use crate::ids::Id;

/// Errors that can occur while accumulating, sending or acknowledging
/// messages over a reliable sequenced pairing.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A sender was registered twice with the same [`Deltas`](crate::delta::Deltas) accumulator.
    #[error("sender {0} was already registered with this accumulator")]
    SenderAlreadyAdded(Id),

    /// An operation referenced an importer or exporter that is not registered.
    #[error("no {kind} is registered for peer {peer}")]
    UnknownPeer {
        /// Whether the missing peer was expected as an importer or exporter.
        kind: &'static str,
        /// The id of the missing peer.
        peer: Id,
    },
}
