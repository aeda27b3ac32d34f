/// Service name that marks a node as the coordinator
pub const MONITOR_SERVICE: &str = "monitor";

/// Queue the coordinator listens on
pub const MONITOR_QUEUE: &str = "monitor";

/// Marker lines delimiting the region of an external file owned by discovery
pub const MARKER_BEGIN: &str = "## BEGIN ec2-discovery ##";
pub const MARKER_END: &str = "## END ec2-discovery ##";

/// Maximum number of messages pulled from a queue per poll
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Hostname suffixes are two digits, so at most this many addresses per service
pub const MAX_HOSTS_PER_SERVICE: usize = 99;

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// True if `line` is a begin marker, ignoring leading whitespace
pub fn is_begin_marker(line: &str) -> bool {
    line.trim_start().starts_with(MARKER_BEGIN)
}

/// True if `line` is an end marker, ignoring leading whitespace
pub fn is_end_marker(line: &str) -> bool {
    line.trim_start().starts_with(MARKER_END)
}
