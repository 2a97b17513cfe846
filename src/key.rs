//! Object key generation and validation.
//!
//! Keys are 20-byte identifiers rendered as 40 uppercase hex characters.
//! Eleven bytes are random; the remaining nine are derived from the routing
//! parameters so the backend can place and locate the object without a
//! catalog. The byte layout is parsed server-side and must not change:
//!
//! | bytes  | content                                  |
//! |--------|------------------------------------------|
//! | 0..8   | random                                   |
//! | 8      | `md5(namespace)[0]`                      |
//! | 9      | `md5(namespace)[1] ^ md5(owner)[0]`      |
//! | 10     | `md5(owner)[1]`                          |
//! | 11     | `md5(owner)[2] ^ md5(bucket)[0]`         |
//! | 12..15 | `md5(bucket)[1..4]`                      |
//! | 15     | service id (`0x59`)                      |
//! | 16..19 | random                                   |
//! | 19     | class-of-service byte                    |
//!
//! # Examples
//!
//! ```rust
//! use sproxyd_client::RoutingParams;
//!
//! let params = RoutingParams {
//!     bucket_name: "photos".to_string(),
//!     namespace: "tenant-a".to_string(),
//!     owner: "alice".to_string(),
//! };
//! ```

use std::fmt::Write as _;

use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::Error;

/// Service id byte embedded at position 15 of every generated key.
pub const SERVICE_ID: u8 = 0x59;

/// Class-of-service byte used when the configuration does not override it.
pub const DEFAULT_COS: u8 = 0x02;

/// Length of a rendered key in hex characters.
pub const KEY_LENGTH: usize = 40;

/// Routing parameters mixed into generated keys.
///
/// All three fields must be non-empty when a key is generated; they are not
/// consulted for any other operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingParams {
    /// Bucket the object logically belongs to.
    pub bucket_name: String,
    /// Namespace of the owning tenant.
    pub namespace: String,
    /// Canonical owner identifier.
    pub owner: String,
}

/// Generates a fresh object key for the given routing parameters.
///
/// The only failure modes are empty routing parameters and a failing
/// system random source (surfaced as [`Error::Internal`]).
pub(crate) fn generate_key(params: &RoutingParams, cos: u8) -> Result<String, Error> {
    if params.bucket_name.is_empty() || params.namespace.is_empty() || params.owner.is_empty() {
        return Err(Error::InvalidArgument(
            "bucket name, namespace and owner must be non-empty".to_string(),
        ));
    }

    let namespace = md5::compute(params.namespace.as_bytes());
    let owner = md5::compute(params.owner.as_bytes());
    let bucket = md5::compute(params.bucket_name.as_bytes());

    let mut random = [0u8; 11];
    OsRng
        .try_fill_bytes(&mut random)
        .map_err(|e| Error::Internal(format!("random source failure: {e}")))?;

    let mut raw = [0u8; 20];
    raw[..8].copy_from_slice(&random[..8]);
    raw[8] = namespace[0];
    raw[9] = namespace[1] ^ owner[0];
    raw[10] = owner[1];
    raw[11] = owner[2] ^ bucket[0];
    raw[12..15].copy_from_slice(&bucket[1..4]);
    raw[15] = SERVICE_ID;
    raw[16..19].copy_from_slice(&random[8..11]);
    raw[19] = cos;

    Ok(hex_upper(&raw))
}

/// Validates a caller-supplied key.
///
/// The check counts characters, not bytes: the key alphabet is plain hex so
/// the two coincide for valid keys, but a multi-byte string must not slip
/// through on byte length alone.
pub(crate) fn validate_key(key: &str) -> Result<(), Error> {
    if key.chars().count() != KEY_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "key must be exactly {KEY_LENGTH} characters, got {:?}",
            key
        )));
    }
    Ok(())
}

pub(crate) fn hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02X}");
    }
    out
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
