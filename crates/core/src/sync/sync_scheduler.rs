//! Scheduler constants for the profile sync loops.

/// Cursor name for the live pointer-changes feed.
pub const POINTER_CHANGES_CURSOR: &str = "pointer_changes";

/// Cursor name for snapshot catch-up.
pub const SNAPSHOTS_CURSOR: &str = "snapshots";

/// Pointer-changes poll cadence in seconds.
pub const POINTER_CHANGES_INTERVAL_SECS: u64 = 10;

/// Snapshot listing cadence in seconds once bootstrapped.
pub const SNAPSHOT_INTERVAL_SECS: u64 = 60;

/// Failed-fetch resweep cadence in seconds.
pub const FAILED_FETCH_RETRY_INTERVAL_SECS: u64 = 300;

/// Upper bound on snapshot passes during bootstrap.
pub const MAX_BOOTSTRAP_SNAPSHOT_PASSES: usize = 16;
