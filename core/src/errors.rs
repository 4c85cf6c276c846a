//! Error types surfaced by node kinds and the machine run-loop.

use thiserror::Error;

use distzero_transport::Id;

/// Errors a node, connector, or the machine run-loop can raise.
#[derive(Error, Debug)]
pub enum DistZeroError {
    /// An impossible state was reached; fatal to the affected node.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// Weighted round-robin assignment could not place all demand.
    #[error("no remaining availability to assign {remaining} of {total} kids")]
    NoRemainingAvailability {
        /// Total kids that needed assignment.
        total: usize,
        /// Kids left unassigned when availability ran out.
        remaining: usize,
    },

    /// A `get_capacity` request could not be satisfied.
    #[error("no capacity available to place a new leaf under {0}")]
    NoCapacity(Id),

    /// A `send` was attempted without an established transport; logged and
    /// dropped at the machine layer rather than propagated to node logic.
    #[error("no transport established to node {0}")]
    NoTransport(Id),
}

impl DistZeroError {
    /// Shorthand for an [`DistZeroError::Internal`] built from a `format!`-style message.
    pub fn internal(message: impl Into<String>) -> Self {
        DistZeroError::Internal(message.into())
    }
}
