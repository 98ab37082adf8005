//! Time units used across the client.

/// The unit of time given to a leader for encoding a block, an
/// ever-increasing ordinal assigned by the outer consensus protocol.
pub type Slot = u64;

/// The unit of time a given leader schedule is honored, some number of
/// slots.
pub type Epoch = u64;

/// An approximate measure of real-world time, expressed as seconds since
/// the UNIX epoch.
pub type UnixTimestamp = i64;
