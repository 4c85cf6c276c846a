//! The two node kinds a `Machine` hosts: dataset tree nodes and link nodes.

pub mod data;
pub mod link;
