//! Tunable operational defaults for nbdloop.
//!
//! Wire-format constants stay in [`crate::constants`]; this module
//! centralizes the knobs a host application might want to revisit.

/// How many data-poll passes the multiplexer makes between config polls.
/// With the demo's ~100 us poll cadence this lands near once per 50 ms,
/// and the engine's own once-per-second gate does the rest.
pub const CONFIG_POLL_RATIO: u32 = 500;

/// Sleep between settle checks while quiescing an engine (milliseconds).
pub const SETTLE_SLEEP_MS: u64 = 1;

/// Upper bound on the `/sys/class/block/nbd*` device scan.
pub const DEVICE_SCAN_MAX: u32 = 10_000;

/// Smallest accepted device block size.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest accepted device block size.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Default block size for the ramdisk demo.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default ramdisk capacity in MiB.
pub const DEFAULT_RAMDISK_MB: u64 = 100;

/// Demo poll-thread cadence (microseconds).
pub const POLL_INTERVAL_US: u64 = 100;
