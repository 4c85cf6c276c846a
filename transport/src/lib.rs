//! Reliable sequenced transport, delta accumulation, and the wire message
//! model shared by every node in a running computation.
//!
//! This crate has no notion of "dataset" or "link" node — it provides the
//! plumbing those node kinds are built from: [`ids`] for naming nodes,
//! [`handle`] for addressing them, [`message`] for what can be said to them,
//! [`delta`] for combining numbered increments, and [`importer`]/[`exporter`]/
//! [`linker`] for keeping a sequenced pairing alive and retransmitting when
//! needed.

pub mod delta;
pub mod errors;
pub mod exporter;
pub mod handle;
pub mod ids;
pub mod importer;
pub mod linker;
pub mod message;
pub mod ticker;

pub use delta::Deltas;
pub use errors::TransportError;
pub use exporter::Exporter;
pub use handle::{Handle, Transport};
pub use ids::Id;
pub use importer::Importer;
pub use linker::Linker;
pub use message::{
    AddedSender, DeltaMessage, Direction, IoMessage, KidConnection, LeftConfiguration, MachineDeliverToNode,
    MigrationMessage, MigratorRoleConfig, NetworkMessage, RightConfiguration, SequenceMessage, Variant,
};
pub use ticker::Ticker;
