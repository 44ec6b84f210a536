pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";

/// Inter-peer endpoint: `POST /_cache/{group}` with the key as the body.
pub const PEER_PATH_PREFIX: &str = "/_cache/";
pub const STATUS_PATH_PREFIX: &str = "/_status/";

pub const DEFAULT_GROUP_NAME: &str = "http";
pub const DEFAULT_ADDR: &str = "0.0.0.0:4000";
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
