//! Unique, collision-free identifiers for nodes and machines.
//!
//! `Node` and `MachineController` instances (among other things) are referred
//! to by id throughout the runtime. This module centralizes id generation as
//! a human-readable prefix followed by a fresh randomness tail.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque, collision-free identifier.
///
/// Ids are plain strings so that they can be logged, used as JSON map keys,
/// and sent across the wire without a custom (de)serializer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Generates a fresh id carrying `prefix` for readability.
    ///
    /// Example: `new_id("DataNode_kid")` might produce
    /// `"DataNode_kid_3fae2f1e-9c39-4a9e-9f6b-ab9a6a9f9a9a"`.
    pub fn new(prefix: &str) -> Self {
        Id(format!("{}_{}", prefix, uuid::Uuid::new_v4()))
    }

    /// Wraps an existing string as an `Id` without generating a new one.
    ///
    /// Used when deserializing ids received over the wire.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Id(raw.into())
    }

    /// Borrows the id's string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Id> for String {
    fn from(id: Id) -> String {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        let id = Id::new("DataNode_kid");
        assert!(id.as_str().starts_with("DataNode_kid_"));
    }

    #[test]
    fn ids_are_unlikely_to_collide() {
        let a = Id::new("x");
        let b = Id::new("x");
        assert_ne!(a, b);
    }
}
