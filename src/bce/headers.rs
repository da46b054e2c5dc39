//! Header names used on the wire
//!
//! All names are lower-case: the transport lower-cases caller headers before
//! merging, so lookups against these constants are exact.

pub const AUTHORIZATION: &str = "authorization";
pub const CONNECTION: &str = "connection";
pub const CONTENT_LENGTH: &str = "content-length";
pub const CONTENT_MD5: &str = "content-md5";
pub const CONTENT_TYPE: &str = "content-type";
pub const ETAG: &str = "etag";
pub const HOST: &str = "host";
pub const USER_AGENT: &str = "user-agent";

pub const X_BCE_DATE: &str = "x-bce-date";
pub const X_BCE_REQUEST_ID: &str = "x-bce-request-id";
pub const X_BCE_SECURITY_TOKEN: &str = "x-bce-security-token";

/// Prefix of service-specific headers; always signed.
pub const X_BCE_PREFIX: &str = "x-bce-";
/// Prefix of user metadata headers.
pub const X_BCE_META_PREFIX: &str = "x-bce-meta-";

pub const DEFAULT_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
pub const OCTET_STREAM: &str = "application/octet-stream";
