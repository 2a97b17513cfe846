//! A streaming client for sproxyd key-addressed object storage endpoints.
//!
//! The client stores, retrieves, and deletes opaque object payloads against
//! a pool of HTTP/1.1 storage endpoints. A write hands in a readable byte
//! stream plus routing parameters and returns an opaque 40-hex-character
//! key whose layout encodes placement hints; every other verb presents a
//! key the caller already holds.
//!
//! # High-level features
//! - Key generation with a byte-exact routing layout (service id and
//!   class-of-service bytes at fixed positions)
//! - Endpoint failover over a shuffled bootstrap pool, with a retry budget
//!   equal to the pool size and rotation that is safe under concurrent
//!   failures
//! - Keep-alive connection pooling with Nagle disabled, idle socket expiry,
//!   and a per-attempt total timeout
//! - Uploads that stay replayable until the first body byte hits a socket,
//!   so connect-level failures retry transparently
//! - Streaming downloads: GET hands the response body to the caller without
//!   buffering
//! - Batched deletes with bounded fan-out (1000 keys per batch, at most
//!   five in flight)
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP: `hyper` 1.x
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use futures_util::stream;
//! use http_body_util::BodyExt;
//! use sproxyd_client::{RoutingParams, SproxydClient, SproxydConfig};
//!
//! # async fn example() -> Result<(), sproxyd_client::Error> {
//! let client = SproxydClient::new(SproxydConfig {
//!     bootstrap: vec!["localhost:8181".to_string()],
//!     ..SproxydConfig::default()
//! })?;
//!
//! let params = RoutingParams {
//!     bucket_name: "photos".to_string(),
//!     namespace: "tenant-a".to_string(),
//!     owner: "alice".to_string(),
//! };
//!
//! let payload = Bytes::from_static(b"hello object store");
//! let body = stream::iter(vec![Ok::<_, std::io::Error>(payload.clone())]);
//! let key = client
//!     .put(body, payload.len() as u64, &params, Some("req-1"))
//!     .await?;
//!
//! let response = client.get(&key, None, Some("req-2")).await?;
//! let bytes = response.into_body().collect().await.unwrap().to_bytes();
//! assert_eq!(bytes, payload);
//! # Ok(())
//! # }
//! ```
//!
//! # Key concepts
//! - [client::SproxydClient] exposes the verbs: `put`, `put_empty_object`,
//!   `get`, `get_head`, `delete`, `batch_delete`, `healthcheck`, `destroy`.
//! - [config::SproxydConfig] names the bootstrap endpoints and the small
//!   set of recognized options.
//! - [error::Error] classifies outcomes; `is_retryable` and `is_expected`
//!   drive failover and log severity.
//! - [body::ObjectBody] streams a retrieved payload and recycles its
//!   connection when fully consumed.

/// Request and response body plumbing.
pub mod body;

/// The public client surface.
pub mod client;

/// Client configuration.
pub mod config;

/// Error taxonomy shared by every operation.
pub mod error;

/// Retry loop over the endpoint pool.
mod failover;

/// Object key generation and validation.
pub mod key;

/// Per-attempt request construction and outcome classification.
mod pipeline;

/// Bootstrap endpoint pool with rotate-on-failure semantics.
pub mod pool;

/// Keep-alive HTTP/1.1 transport.
mod transport;

pub use body::{ObjectBody, ObjectResponse};
pub use client::{PutOptions, SproxydClient};
pub use config::{CHORD_PATH, DEFAULT_PATH, SproxydConfig};
pub use error::{BoxError, Error};
pub use key::{DEFAULT_COS, KEY_LENGTH, RoutingParams, SERVICE_ID};
pub use pool::Endpoint;

pub use bytes::Bytes;
pub use http::StatusCode;
pub use http_body_util::BodyExt;
