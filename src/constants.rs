use std::time::Duration;

/// Prefix written in front of every payload line of the event stream.
pub const DATA_PREFIX: &str = "data: ";
/// Field name a reader matches on; one optional space may follow it.
pub const DATA_FIELD: &str = "data:";

/// Transport-level session header, lowest precedence when resolving a session id.
pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub const ANSWER_ROUTE: &str = "/api/answer";

/// Upper bound for a single decoded line (1MB), mirrors the upstream proxy limit.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Deadline for the real-backend path.
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for the locally simulated path, which never waits on the network.
pub const DEFAULT_FALLBACK_DEADLINE: Duration = Duration::from_secs(10);

/// Per-word delay when re-chunking a real upstream answer.
pub const REAL_WORD_DELAY_MS: u64 = 30;
/// Per-word delay for the synthetic fallback answer.
pub const FALLBACK_WORD_DELAY_MS: u64 = 50;

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub const EVENT_CHANNEL_CAPACITY: usize = 100;

pub const UPSTREAM_RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504, 520];

/// Canned answer used when the upstream cannot produce one.
pub const FALLBACK_ANSWER_TEXT: &str = "The evidence base for this question is still being retrieved. \
Current clinical guidance recommends reviewing the most recent systematic reviews [1] \
and checking the relevant prescribing information before acting on any single study [2].";

pub const FALLBACK_SHORT_SUMMARY: &str =
    "Live results are unavailable; showing a general evidence summary.";
