//! Client configuration.
//!
//! `SproxydConfig` mirrors the configuration block that dependent services
//! feed the client, so it deserializes straight out of their JSON config
//! files (camelCase field names included). Unknown options are ignored by
//! serde; the recognized set is deliberately small.
//!
//! # Examples
//!
//! ```rust
//! use sproxyd_client::SproxydConfig;
//!
//! let config: SproxydConfig = serde_json::from_str(
//!     r#"{
//!         "bootstrap": ["storage-1:8181", "storage-2:8181"],
//!         "immutable": true
//!     }"#,
//! ).unwrap();
//! assert_eq!(config.base_path(), "/proxy/arc/");
//! ```

use serde::Deserialize;

use crate::error::Error;
use crate::key::DEFAULT_COS;
use crate::pool::Endpoint;

/// Base path used when no class-of-service override is configured.
pub const DEFAULT_PATH: &str = "/proxy/arc/";

/// Base path selected by a `chordCos` override.
pub const CHORD_PATH: &str = "/proxy/chord/";

/// Configuration for [`SproxydClient`](crate::SproxydClient).
///
/// # Examples
///
/// ```rust
/// use sproxyd_client::SproxydConfig;
///
/// let config = SproxydConfig {
///     bootstrap: vec!["localhost:8181".to_string()],
///     ..SproxydConfig::default()
/// };
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SproxydConfig {
    /// Seed list of `"host:port"` endpoints. Must be non-empty.
    pub bootstrap: Vec<String>,
    /// URL base path override. When unset, `/proxy/arc/` is used, or
    /// `/proxy/chord/` if `chord_cos` is set.
    pub path: Option<String>,
    /// Class-of-service byte override. Selects the chord base path.
    pub chord_cos: Option<u8>,
    /// Mark every stored object as an immutable replica by sending
    /// `X-Scal-Replica-Policy: immutable` on every request.
    pub immutable: bool,
}

impl SproxydConfig {
    /// Resolved URL base path, always ending in `/`.
    pub fn base_path(&self) -> String {
        match (&self.path, self.chord_cos) {
            (Some(path), _) => {
                if path.ends_with('/') {
                    path.clone()
                } else {
                    format!("{path}/")
                }
            }
            (None, Some(_)) => CHORD_PATH.to_string(),
            (None, None) => DEFAULT_PATH.to_string(),
        }
    }

    /// Class-of-service byte embedded in generated keys.
    pub fn cos(&self) -> u8 {
        self.chord_cos.unwrap_or(DEFAULT_COS)
    }

    /// Parses and validates the bootstrap list.
    pub(crate) fn parse_bootstrap(&self) -> Result<Vec<Endpoint>, Error> {
        if self.bootstrap.is_empty() {
            return Err(Error::InvalidArgument(
                "bootstrap list must not be empty".to_string(),
            ));
        }
        self.bootstrap.iter().map(|s| Endpoint::parse(s)).collect()
    }
}
