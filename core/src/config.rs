//! Process-wide runtime-tunable constants.
//!
//! Passed around by value rather than imported as mutable module state:
//! every node-kind constructor and `Machine` takes a `SystemConfig` (`Copy`,
//! so cheap to hand to each one) instead of reaching for a global.

/// Runtime-tunable constants governing dataset trees, link fan-in/out, and
/// transport cadences.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SystemConfig {
    /// Maximum number of kids a non-leaf `DataNode` may hold (B).
    pub data_node_kids_limit: u32,
    /// Total remaining kid capacity below which a `DataNode` spawns a kid or bumps height.
    pub total_kid_capacity_trigger: u64,
    /// Milliseconds between a kid's `kid_summary` reports to its parent.
    pub kid_summary_interval_ms: u64,
    /// Upper bound on senders into one sum-aggregating link node before it splits.
    pub sum_node_sender_limit: u32,
    /// Lower bound below which sum-aggregating link nodes become merge candidates.
    pub sum_node_sender_lower_limit: u32,
    /// Number of replica nodes created when a saturated sum node splits.
    pub sum_node_split_n_new_nodes: u32,
    /// Upper bound on receivers a sum-aggregating link node may forward to.
    pub sum_node_receiver_limit: u32,
    /// Milliseconds between acknowledgement sweeps (`Linker`).
    pub time_between_acknowledgements_ms: u64,
    /// Milliseconds between retransmission sweeps (`Linker`).
    pub time_between_retransmission_checks_ms: u64,
    /// Milliseconds a root with a single kid must dwell before consuming its proxy.
    pub time_to_wait_before_consume_proxy_ms: u64,
    /// Milliseconds two mergeable kids must dwell before a merge is triggered.
    pub time_to_wait_before_kid_merge_ms: u64,
    /// Target cooperative-scheduling tick length for a `Machine`'s run-loop.
    pub step_length_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            data_node_kids_limit: 8,
            total_kid_capacity_trigger: 4,
            kid_summary_interval_ms: 1000,
            sum_node_sender_limit: 15,
            sum_node_sender_lower_limit: 5,
            sum_node_split_n_new_nodes: 2,
            sum_node_receiver_limit: 15,
            time_between_acknowledgements_ms: 30,
            time_between_retransmission_checks_ms: 20,
            time_to_wait_before_consume_proxy_ms: 4_000,
            time_to_wait_before_kid_merge_ms: 2_000,
            step_length_ms: 5,
        }
    }
}

/// The default TCP port for the control-plane `MachineController` API.
pub const MACHINE_CONTROLLER_DEFAULT_TCP_PORT: u16 = 55170;
/// The default UDP port for the data-plane `machine_deliver_to_node` datagrams.
pub const MACHINE_CONTROLLER_DEFAULT_UDP_PORT: u16 = 55171;
/// Minimum datagram buffer size for the data-plane socket.
pub const MSG_BUFSIZE: usize = 2048;
