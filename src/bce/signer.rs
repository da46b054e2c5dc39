//! BCE authorization (`bce-auth-v1`) signer
//!
//! The signature is a two-step HMAC-SHA256:
//! - a session key derived from the secret key and
//!   `bce-auth-v1/<ak>/<timestamp>/<expiration>`
//! - the signature over `method\nuri\nquery\nheaders`, keyed by the hex session key
//!
//! Canonical forms must match the service byte for byte, so every sort here
//! is a plain byte-wise string sort.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use hyper::Method;
use sha2::Sha256;
use std::collections::BTreeSet;

use crate::bce::client::{BceError, Result};
use crate::bce::headers::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_MD5, CONTENT_TYPE, HOST, X_BCE_PREFIX};
use crate::bce::types::{Credentials, Headers, Params};

type HmacSha256 = Hmac<Sha256>;

/// Hex lookup table for zero-allocation percent encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Auth protocol version prefix
pub const AUTH_VERSION: &str = "bce-auth-v1";

/// Default signature lifetime
pub const DEFAULT_EXPIRATION_SECS: u64 = 1800;

/// Headers signed when the caller names none
pub const DEFAULT_HEADERS_TO_SIGN: [&str; 4] = [HOST, CONTENT_MD5, CONTENT_LENGTH, CONTENT_TYPE];

/// Anything that can produce an `Authorization` value for a request.
///
/// The transport calls this once per exchange with the fully merged headers.
pub trait Signable: Send + Sync {
    fn sign(
        &self,
        credentials: &Credentials,
        method: &Method,
        resource: &str,
        params: &Params,
        headers: &Headers,
    ) -> Result<String>;
}

/// Per-call signing options
#[derive(Debug, Clone)]
pub struct SignOptions {
    /// Signing time; `None` means now
    pub timestamp: Option<DateTime<Utc>>,
    pub expiration_secs: u64,
    /// Lower-case header names to sign besides `x-bce-*`; empty means the defaults
    pub headers_to_sign: Vec<String>,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            timestamp: None,
            expiration_secs: DEFAULT_EXPIRATION_SECS,
            headers_to_sign: Vec::new(),
        }
    }
}

impl SignOptions {
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Signing time given as seconds since the Unix epoch
    pub fn with_epoch_seconds(mut self, secs: i64) -> Result<Self> {
        let ts = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| BceError::Signing(format!("Invalid epoch timestamp: {}", secs)))?;
        self.timestamp = Some(ts);
        Ok(self)
    }

    pub fn with_expiration(mut self, secs: u64) -> Self {
        self.expiration_secs = secs;
        self
    }

    pub fn with_headers_to_sign<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.headers_to_sign = names
            .into_iter()
            .map(|s| s.as_ref().to_ascii_lowercase())
            .collect();
        self
    }
}

/// Format a timestamp the way the service expects: ISO-8601, whole seconds, `Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// BCE request signer
#[derive(Debug, Clone, Default)]
pub struct BceSigner {
    options: SignOptions,
}

impl BceSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signer that applies `options` on every `Signable::sign` call
    pub fn with_options(options: SignOptions) -> Self {
        Self { options }
    }

    /// Produce the full authorization string for a request.
    pub fn generate_authorization(
        &self,
        credentials: &Credentials,
        method: &str,
        resource: &str,
        params: &Params,
        headers: &Headers,
        options: &SignOptions,
    ) -> Result<String> {
        if !credentials.is_valid() {
            return Err(BceError::Signing(
                "access key and secret key must not be empty".to_string(),
            ));
        }

        let now = options.timestamp.unwrap_or_else(Utc::now);
        let raw_session_key = format!(
            "{}/{}/{}/{}",
            AUTH_VERSION,
            credentials.access_key,
            format_timestamp(&now),
            options.expiration_secs
        );
        let session_key = hex::encode(Self::hmac_sha256(
            credentials.secret_key.as_bytes(),
            raw_session_key.as_bytes(),
        ));

        let canonical_uri = Self::canonical_uri(resource);
        let canonical_query = Self::canonical_query_string(params);
        let (canonical_headers, signed_headers) =
            Self::canonical_headers(headers, &options.headers_to_sign);

        let raw_signature = format!(
            "{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_query, canonical_headers
        );
        tracing::trace!(
            raw_session_key = %raw_session_key,
            raw_signature = ?raw_signature,
            "bce_sign"
        );

        let signature = hex::encode(Self::hmac_sha256(
            session_key.as_bytes(),
            raw_signature.as_bytes(),
        ));

        if signed_headers.is_empty() {
            Ok(format!("{}//{}", raw_session_key, signature))
        } else {
            Ok(format!(
                "{}/{}/{}",
                raw_session_key,
                signed_headers.join(";"),
                signature
            ))
        }
    }

    /// The resource path is normalized upstream and used verbatim
    fn canonical_uri(resource: &str) -> &str {
        resource
    }

    /// `key=normalize(value)` tokens, `authorization` dropped, sorted, `&`-joined
    pub fn canonical_query_string(params: &Params) -> String {
        let mut tokens: Vec<String> = params
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case(AUTHORIZATION))
            .map(|(k, v)| {
                let mut token = String::with_capacity(k.len() + 1 + v.len());
                token.push_str(k);
                token.push('=');
                token.push_str(&normalize(v, true));
                token
            })
            .collect();

        tokens.sort_unstable();
        tokens.join("&")
    }

    /// Returns the newline-joined canonical headers and the signed header names.
    pub fn canonical_headers(headers: &Headers, headers_to_sign: &[String]) -> (String, Vec<String>) {
        let wanted: BTreeSet<String> = if headers_to_sign.is_empty() {
            DEFAULT_HEADERS_TO_SIGN.iter().map(|s| s.to_string()).collect()
        } else {
            headers_to_sign.iter().map(|s| s.to_ascii_lowercase()).collect()
        };

        let mut entries: Vec<(String, String)> = Vec::with_capacity(headers.len());
        for (key, value) in headers {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let key = key.to_ascii_lowercase();
            if key.starts_with(X_BCE_PREFIX) || wanted.contains(&key) {
                entries.push((normalize(&key, true), normalize(value, true)));
            }
        }

        // Sort the joined `name:value` form, not the name alone
        let mut tokens: Vec<(String, String)> = entries
            .into_iter()
            .map(|(k, v)| (format!("{}:{}", k, v), k))
            .collect();
        tokens.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut canonical = String::with_capacity(tokens.len() * 48);
        let mut signed = Vec::with_capacity(tokens.len());
        for (i, (token, name)) in tokens.into_iter().enumerate() {
            if i > 0 {
                canonical.push('\n');
            }
            canonical.push_str(&token);
            signed.push(name);
        }
        (canonical, signed)
    }

    /// HMAC-SHA256 returning fixed-size array (no heap allocation)
    fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(msg);
        let result = mac.finalize().into_bytes();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }
}

impl Signable for BceSigner {
    fn sign(
        &self,
        credentials: &Credentials,
        method: &Method,
        resource: &str,
        params: &Params,
        headers: &Headers,
    ) -> Result<String> {
        self.generate_authorization(
            credentials,
            method.as_str(),
            resource,
            params,
            headers,
            &self.options,
        )
    }
}

/// RFC 3986 percent-encoding: everything but `A-Za-z0-9-_.~` is escaped,
/// and `/` too unless `encode_slash` is false.
pub fn normalize(s: &str, encode_slash: bool) -> String {
    let mut result = String::with_capacity(s.len() + 16);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            b'/' if !encode_slash => {
                result.push('/');
            }
            _ => {
                result.push('%');
                result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
    result
}
