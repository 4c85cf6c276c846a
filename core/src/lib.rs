//! The runtime proper: dataset trees, link fabrics, the migration protocol,
//! and the `Machine` that hosts them all.
//!
//! This crate builds node kinds ([`node::data::DataNode`],
//! [`node::link::LinkNode`]) and the protocol state machines
//! ([`migration::Migrator`], [`migration::MigrationNode`]) on top of
//! `distzero_transport`'s reliable sequenced pairing, wires them together
//! with [`connector`] and [`link_graph`], and drives the whole thing with a
//! single-threaded cooperative [`machine::Machine`] — one run-loop tick
//! elapses every node, then drains whatever arrived on the data and control
//! planes.

pub mod config;
pub mod connector;
pub mod descriptors;
pub mod errors;
pub mod events;
pub mod link_graph;
pub mod machine;
pub mod migration;
pub mod node;
pub mod testing;

pub use config::SystemConfig;
pub use errors::DistZeroError;
pub use machine::Machine;
