/// Integer rank, stable for the process lifetime.
pub type NodeT = i64;

/// Sentinel for "no destination set yet". Sending to it is a usage error
/// (4.4, 4.1) — envelopes are not self-healing.
pub const UNINITIALIZED_DESTINATION: NodeT = -1;

/// `default_group` (4.1): the group containing every rank in the world
/// communicator.
pub const DEFAULT_GROUP: u64 = 0;
