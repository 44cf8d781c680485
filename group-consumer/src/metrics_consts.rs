// ==== Dispatch metrics ====
/// Counter for messages handed to user handlers
pub const MESSAGES_HANDLED: &str = "group_consumer_messages_handled_total";

/// Counter for batches handed to user handlers (per-batch mode) or iterated (per-message mode)
pub const BATCHES_DISPATCHED: &str = "group_consumer_batches_dispatched_total";

/// Histogram for handler invocation duration
pub const HANDLER_DURATION_MS: &str = "group_consumer_handler_duration_ms";

/// Counter for handler failures
pub const HANDLER_ERRORS: &str = "group_consumer_handler_errors_total";

/// Counter for in-flight batches abandoned because of a seek or revocation
pub const STALE_BATCHES_DISCARDED: &str = "group_consumer_stale_batches_discarded_total";

/// Counter for offset resolutions rejected as stale
pub const STALE_RESOLUTIONS_REJECTED: &str = "group_consumer_stale_resolutions_rejected_total";

// ==== Offset metrics ====
/// Counter for commit attempts, labelled by outcome and trigger
pub const OFFSET_COMMITS: &str = "group_consumer_offset_commits_total";

/// Gauge for the last committed position per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "group_consumer_partition_last_committed_offset";

/// Counter for resolutions that did not advance the tracked position
pub const OFFSET_TRACKER_STALE_RESOLUTION: &str = "group_consumer_offset_tracker_stale_resolution_total";

// ==== Group metrics ====
/// Gauge for partitions currently assigned to this member
pub const ASSIGNED_PARTITIONS: &str = "group_consumer_assigned_partitions";

/// Gauge for running dispatch lanes
pub const ACTIVE_LANES: &str = "group_consumer_active_lanes";

/// Counter for completed rebalances
pub const REBALANCES: &str = "group_consumer_rebalances_total";

/// Counter for crashes, labelled by whether the run restarts
pub const CRASHES: &str = "group_consumer_crashes_total";

/// Counter for heartbeat failures other than a rebalance notice
pub const HEARTBEAT_ERRORS: &str = "group_consumer_heartbeat_errors_total";
