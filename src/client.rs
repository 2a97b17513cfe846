//! The public client surface for storing, retrieving, and deleting objects.
//!
//! `SproxydClient` presents the key-addressed object verbs over a shuffled
//! pool of bootstrap endpoints. Writes hand in a byte stream and get back a
//! 40-hex-character key; every other verb takes a key the caller already
//! holds. All verbs fail over across the pool as long as no request body
//! byte has been written.
//!
//! # Examples
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use futures_util::stream;
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
//! let payload = Bytes::from_static(b"object bytes");
//! let body = stream::iter(vec![Ok::<_, std::io::Error>(payload.clone())]);
//!
//! let key = client
//!     .put(body, payload.len() as u64, &params, Some("req-1"))
//!     .await?;
//! client.delete(&key, Some("req-2")).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use http::Method;
use http_body_util::BodyExt;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::body::{ObjectResponse, UploadSource, UploadState};
use crate::config::SproxydConfig;
use crate::error::{BoxError, Error};
use crate::key::{self, RoutingParams, hex_lower};
use crate::pipeline::{
    BATCH_DELETE_KEY, HEADER_USERMD, HEALTHCHECK_KEY, Payload, Pipeline, RequestSpec,
};
use crate::pool::EndpointPool;
use crate::transport::Transport;
use crate::{failover, pool};

const CONTENT_TYPE_OBJECT: &str = "application/octet-stream";
const CONTENT_TYPE_JSON: &str = "application/json";

/// Maximum number of keys carried by one batch delete sub-request.
const BATCH_DELETE_MAX_KEYS: usize = 1000;

/// Maximum number of batch delete sub-requests in flight at once.
const BATCH_DELETE_CONCURRENCY: usize = 5;

/// Optional knobs for [`SproxydClient::put_with_options`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Store under this caller-supplied key instead of generating one.
    pub key: Option<String>,
    /// Hex MD5 the payload is expected to hash to. On mismatch the stored
    /// object is deleted best-effort and the put fails with
    /// [`Error::InvalidDigest`].
    pub content_md5: Option<String>,
}

/// Client for a pool of key-addressed object storage endpoints.
///
/// The client is cheap to clone; clones share the endpoint pool and the
/// keep-alive connection pool.
#[derive(Clone)]
pub struct SproxydClient {
    pool: Arc<EndpointPool>,
    pipeline: Arc<Pipeline>,
    cos: u8,
}

impl std::fmt::Debug for SproxydClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SproxydClient").finish_non_exhaustive()
    }
}

impl SproxydClient {
    /// Creates a client from `config`, shuffling the bootstrap list once to
    /// spread initial load across the fleet.
    pub fn new(config: SproxydConfig) -> Result<Self, Error> {
        Self::new_with_rng(config, &mut rand::thread_rng())
    }

    /// Like [`new`](Self::new) but with a caller-supplied RNG for the
    /// bootstrap shuffle, so tests can pin the initial endpoint order.
    pub fn new_with_rng<R: Rng>(config: SproxydConfig, rng: &mut R) -> Result<Self, Error> {
        let mut endpoints = config.parse_bootstrap()?;
        pool::shuffle_endpoints(&mut endpoints, rng);

        debug!(
            endpoints = endpoints.len(),
            base_path = %config.base_path(),
            immutable = config.immutable,
            cos = config.cos(),
            "client created",
        );

        Ok(SproxydClient {
            pool: Arc::new(EndpointPool::new(endpoints)),
            pipeline: Arc::new(Pipeline::new(
                Transport::new(),
                config.base_path(),
                config.immutable,
            )),
            cos: config.cos(),
        })
    }

    /// Stores a payload streamed from `body` and returns its generated key.
    ///
    /// `size` must be the exact byte count of the stream; the request
    /// declares it as `content-length` and never falls back to chunked
    /// transfer. The stream is not consumed until a connection is writable,
    /// so connect-level failures retry on the next endpoint. Once a byte
    /// has been written, failures are terminal.
    ///
    /// The caller aborts an upload by yielding an error from `body`.
    pub async fn put<S, E>(
        &self,
        body: S,
        size: u64,
        params: &RoutingParams,
        req_uid: Option<&str>,
    ) -> Result<String, Error>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.put_with_options(body, size, params, req_uid, PutOptions::default())
            .await
    }

    /// [`put`](Self::put) with a caller-supplied key and/or digest
    /// verification.
    pub async fn put_with_options<S, E>(
        &self,
        body: S,
        size: u64,
        params: &RoutingParams,
        req_uid: Option<&str>,
        options: PutOptions,
    ) -> Result<String, Error>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let key = match options.key {
            Some(key) => {
                key::validate_key(&key)?;
                key
            }
            None => key::generate_key(params, self.cos)?,
        };

        let state = UploadState::new(options.content_md5.is_some());
        let spec = RequestSpec {
            content_type: Some(CONTENT_TYPE_OBJECT),
            payload: Payload::Stream {
                source: UploadSource::new(body),
                size,
                state: Arc::clone(&state),
            },
            ..RequestSpec::new(Method::PUT, key.clone())
        };

        let response = failover::execute(&self.pipeline, &self.pool, &spec, req_uid).await?;
        drain(response).await;

        if state.bytes_sent() != size {
            // The endpoint acknowledged a body it cannot have fully read.
            error!(
                key = %key,
                sent = state.bytes_sent(),
                declared = size,
                "store succeeded with a short body",
            );
        }

        if let Some(expected) = options.content_md5 {
            let computed = state
                .finish_digest()
                .map(|digest| hex_lower(&*digest))
                .unwrap_or_default();
            if !computed.eq_ignore_ascii_case(&expected) {
                warn!(key = %key, "digest mismatch, deleting stored object");
                if let Err(err) = self.delete(&key, req_uid).await {
                    warn!(key = %key, error = %err, "cleanup delete failed");
                }
                return Err(Error::InvalidDigest { expected, computed });
            }
        }

        Ok(key)
    }

    /// Stores an empty object under `key`, attaching `usermd` (an opaque
    /// hex string) as its user metadata.
    pub async fn put_empty_object(
        &self,
        key: &str,
        usermd: &str,
        req_uid: Option<&str>,
    ) -> Result<(), Error> {
        key::validate_key(key)?;
        let spec = RequestSpec {
            content_type: Some(CONTENT_TYPE_OBJECT),
            usermd: Some(usermd.to_string()),
            ..RequestSpec::new(Method::PUT, key)
        };
        let response = failover::execute(&self.pipeline, &self.pool, &spec, req_uid).await?;
        drain(response).await;
        Ok(())
    }

    /// Retrieves the object stored under `key`, streaming its payload.
    ///
    /// `range` asks for an inclusive byte range, answered with 206. The
    /// caller owns the response body: consuming it to the end returns the
    /// connection to the keep-alive pool, dropping it early closes it.
    pub async fn get(
        &self,
        key: &str,
        range: Option<(u64, u64)>,
        req_uid: Option<&str>,
    ) -> Result<ObjectResponse, Error> {
        key::validate_key(key)?;
        let spec = RequestSpec {
            range,
            ..RequestSpec::new(Method::GET, key)
        };
        failover::execute(&self.pipeline, &self.pool, &spec, req_uid).await
    }

    /// Probes the object stored under `key` and returns its user metadata
    /// hex string, or an empty string when none was attached.
    pub async fn get_head(&self, key: &str, req_uid: Option<&str>) -> Result<String, Error> {
        key::validate_key(key)?;
        let spec = RequestSpec::new(Method::HEAD, key);
        let response = failover::execute(&self.pipeline, &self.pool, &spec, req_uid).await?;
        let usermd = response
            .headers()
            .get(HEADER_USERMD)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        drain(response).await;
        Ok(usermd)
    }

    /// Deletes the object stored under `key`.
    ///
    /// A 423 answer counts as success: the key names an immutable replica
    /// that the backend is already reclaiming.
    pub async fn delete(&self, key: &str, req_uid: Option<&str>) -> Result<(), Error> {
        key::validate_key(key)?;
        let spec = RequestSpec::new(Method::DELETE, key);
        let response = failover::execute(&self.pipeline, &self.pool, &spec, req_uid).await?;
        drain(response).await;
        Ok(())
    }

    /// Deletes a set of keys in server-side batches.
    ///
    /// Keys are split into sub-requests of at most 1000 and dispatched in
    /// order with at most five in flight. The call resolves once every
    /// sub-request has completed, reporting the first error if any.
    pub async fn batch_delete(&self, keys: &[String], req_uid: Option<&str>) -> Result<(), Error> {
        for key in keys {
            key::validate_key(key)?;
        }

        let mut batches = stream::iter(keys.chunks(BATCH_DELETE_MAX_KEYS))
            .map(|chunk| self.delete_batch(chunk, req_uid))
            .buffer_unordered(BATCH_DELETE_CONCURRENCY);

        let mut first_error = None;
        while let Some(result) = batches.next().await {
            if let Err(err) = result
                && first_error.is_none()
            {
                first_error = Some(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_batch(&self, keys: &[String], req_uid: Option<&str>) -> Result<(), Error> {
        #[derive(Serialize)]
        struct BatchDeleteBody<'a> {
            keys: &'a [String],
        }

        let body = serde_json::to_vec(&BatchDeleteBody { keys })
            .map_err(|e| Error::Internal(format!("failed to encode batch delete body: {e}")))?;
        let spec = RequestSpec {
            content_type: Some(CONTENT_TYPE_JSON),
            payload: Payload::Buffered(Bytes::from(body)),
            ..RequestSpec::new(Method::POST, BATCH_DELETE_KEY)
        };

        let response = failover::execute(&self.pipeline, &self.pool, &spec, req_uid).await?;
        drain(response).await;
        debug!(keys = keys.len(), "batch deleted");
        Ok(())
    }

    /// Fetches the configuration document the current endpoint serves,
    /// as a liveness probe. The full response is handed to the caller.
    pub async fn healthcheck(&self, req_uid: Option<&str>) -> Result<ObjectResponse, Error> {
        let spec = RequestSpec::new(Method::GET, HEALTHCHECK_KEY);
        failover::execute(&self.pipeline, &self.pool, &spec, req_uid).await
    }

    /// Closes every idle connection. In-flight operations are not
    /// interrupted; they fail or complete through their normal paths, and
    /// any later operation on this client fails.
    pub fn destroy(&self) {
        self.pipeline.transport().destroy();
    }
}

async fn drain(response: ObjectResponse) {
    let _ = response.into_body().collect().await;
}
