/// Backend routes, relative to `<base_url>/api`.
pub const API_PREFIX: &str = "/api";
pub const HISTORY_GENERATE: &str = "/chat/history/generate";
pub const HISTORY_UPDATE: &str = "/chat/history/update";
pub const HISTORY_READ: &str = "/chat/history/read";
pub const HISTORY_LIST: &str = "/chat/history/list";
pub const HISTORY_DELETE: &str = "/chat/history/delete";
pub const HISTORY_DELETE_ALL: &str = "/chat/history/delete_all";
pub const HISTORY_CLEAR: &str = "/chat/history/clear";
pub const HISTORY_RENAME: &str = "/chat/history/rename";
pub const HISTORY_ENSURE: &str = "/chat/history/ensure";
pub const CITATION: &str = "/chat/citation";
pub const AUTH_REFRESH_TOKEN: &str = "/auth/refresh-token";

/// Auth signalling
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
pub const TOKEN_EXPIRED_PAYLOAD: &str = "Token Expired";
pub const EXPIRED_REFRESH_MESSAGE: &str = "ExpiredRefreshError";

/// Stream framing
pub const KEEP_ALIVE_SENTINEL: &str = "{}";
pub const MAX_STREAM_FRAGMENTS: usize = 100_000;
/// Longest line, and largest unparsed JSON tail, accepted from the stream.
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// User-facing error texts
pub const NO_CONTENT_ERROR: &str = "No content in messages object.";
pub const RETRY_HINT: &str =
    "Please try again. If the problem persists, please contact the site administrator.";
pub const SAVE_FAILED_ERROR: &str = "An error occurred. Answers can't be saved at this time. If the problem persists, please contact the site administrator.";
pub const GENERATE_FAILED_PREFIX: &str =
    "There was an error generating a response. Chat history can't be saved at this time.";

/// Prefix the backend puts in front of contract workspace names, e.g. `UCW_1234_`.
pub const WORKSPACE_PREFIX_PATTERN: &str = r"^UCW_\d+_";
