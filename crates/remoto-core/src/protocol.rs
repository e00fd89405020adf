//! Wire protocol vocabulary
//!
//! Request names, option keys and broadcast names understood by the
//! server. Kept in one place so queries and the connection layer agree.


/// Top-level frame keys.
pub mod frame {
    pub const NAME: &str = "name";
    pub const ID: &str = "id";
    pub const TYPE: &str = "type";
    pub const OPTIONS: &str = "options";
}


/// Request names.
pub mod request {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const PING: &str = "ping";
    pub const PAUSE_OR_RESUME: &str = "pause_or_resume";
    pub const QUERY_TRACKS: &str = "query_tracks";
    pub const QUERY_TRACKS_BY_CATEGORY: &str = "query_tracks_by_category";
    pub const QUERY_PLAY_QUEUE_TRACKS: &str = "query_play_queue_tracks";
    pub const QUERY_CATEGORY: &str = "query_category";
    pub const SNAPSHOT_PLAY_QUEUE: &str = "snapshot_play_queue";
    pub const INVALIDATE_PLAY_QUEUE_SNAPSHOT: &str = "invalidate_play_queue_snapshot";
}


/// Broadcast names.
pub mod broadcast {
    pub const PLAY_QUEUE_CHANGED: &str = "play_queue_changed";
}


/// Option keys.
pub mod key {
    pub const ERROR: &str = "error";
    pub const PASSWORD: &str = "password";
    pub const ENVIRONMENT: &str = "environment";
    pub const API_VERSION: &str = "api_version";
    pub const COUNT: &str = "count";
    pub const COUNT_ONLY: &str = "count_only";
    pub const DATA: &str = "data";
    pub const OFFSET: &str = "offset";
    pub const LIMIT: &str = "limit";
    pub const FILTER: &str = "filter";
    pub const CATEGORY: &str = "category";
    pub const CATEGORY_ID: &str = "category_id";
    pub const TYPE: &str = "type";
    pub const ID: &str = "id";
    pub const VALUE: &str = "value";
}


/// Option values.
pub mod value {
    pub const SNAPSHOT: &str = "snapshot";
    pub const LIVE: &str = "live";
}


/// WebSocket close code the server uses to reject credentials.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Oldest server api version this client fully understands.
pub const MINIMUM_SUPPORTED_API_VERSION: i64 = 15;
