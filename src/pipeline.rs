//! Per-attempt request construction and outcome classification.
//!
//! One [`RequestSpec`] describes a logical operation; each failover attempt
//! turns it into a fresh `hyper` request against one endpoint. The pipeline
//! owns the ordering that makes uploads safely retryable: a connection is
//! checked out (and proven writable) before the request carrying the
//! caller's stream is handed to the transport, so any failure up to that
//! point leaves the payload untouched. Once the response header arrives,
//! statuses are classified into the success set of the verb, expected
//! errors, and unexpected ones.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderName};
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use tracing::{debug, trace};

use crate::body::{ObjectBody, ObjectResponse, RequestBody, UploadSource, UploadState};
use crate::error::Error;
use crate::pool::Endpoint;
use crate::transport::Transport;

pub(crate) const HEADER_REQUEST_UIDS: HeaderName = HeaderName::from_static("x-scal-request-uids");
pub(crate) const HEADER_TRACE_IDS: HeaderName = HeaderName::from_static("x-scal-trace-ids");
pub(crate) const HEADER_REPLICA_POLICY: HeaderName =
    HeaderName::from_static("x-scal-replica-policy");
pub(crate) const HEADER_USERMD: HeaderName = HeaderName::from_static("x-scal-usermd");

/// Key used by the batch delete endpoint in place of an object key.
pub(crate) const BATCH_DELETE_KEY: &str = ".batch_delete";

/// Key probed by health checks.
pub(crate) const HEALTHCHECK_KEY: &str = ".conf";

/// Body of one logical request.
pub(crate) enum Payload {
    None,
    Buffered(Bytes),
    Stream {
        source: UploadSource,
        size: u64,
        state: Arc<UploadState>,
    },
}

impl Payload {
    pub(crate) fn content_length(&self) -> u64 {
        match self {
            Payload::None => 0,
            Payload::Buffered(bytes) => bytes.len() as u64,
            Payload::Stream { size, .. } => *size,
        }
    }

    /// Whether any byte of this payload has been written to a socket.
    /// Buffered payloads are always replayable, so they never count.
    pub(crate) fn streaming_started(&self) -> bool {
        match self {
            Payload::Stream { state, .. } => state.streaming_started(),
            _ => false,
        }
    }

    fn upload_state(&self) -> Option<&Arc<UploadState>> {
        match self {
            Payload::Stream { state, .. } => Some(state),
            _ => None,
        }
    }

    fn to_body(&self) -> RequestBody {
        match self {
            Payload::None => RequestBody::Empty,
            Payload::Buffered(bytes) => RequestBody::buffered(bytes.clone()),
            Payload::Stream { source, size, state } => {
                RequestBody::Upload(source.body(*size, Arc::clone(state)))
            }
        }
    }
}

/// Description of one logical operation, reused across failover attempts.
pub(crate) struct RequestSpec {
    pub(crate) method: Method,
    /// Object key or one of the literal service keys.
    pub(crate) key: String,
    pub(crate) content_type: Option<&'static str>,
    pub(crate) usermd: Option<String>,
    pub(crate) range: Option<(u64, u64)>,
    pub(crate) payload: Payload,
}

impl RequestSpec {
    pub(crate) fn new(method: Method, key: impl Into<String>) -> Self {
        RequestSpec {
            method,
            key: key.into(),
            content_type: None,
            usermd: None,
            range: None,
            payload: Payload::None,
        }
    }

    /// Statuses that complete this verb successfully: 200 for everything,
    /// 206 for ranged GETs, and 423 for DELETE (a locked immutable replica
    /// is already being reclaimed, which is the outcome the caller wanted).
    fn accepts(&self, status: StatusCode) -> bool {
        if status == StatusCode::OK {
            true
        } else if status == StatusCode::LOCKED {
            self.method == Method::DELETE
        } else if status == StatusCode::PARTIAL_CONTENT {
            self.method == Method::GET && self.range.is_some()
        } else {
            false
        }
    }
}

/// Builds and sends requests for one client instance.
pub(crate) struct Pipeline {
    transport: Transport,
    base_path: String,
    immutable: bool,
}

impl Pipeline {
    pub(crate) fn new(transport: Transport, base_path: String, immutable: bool) -> Self {
        Pipeline {
            transport,
            base_path,
            immutable,
        }
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Runs one attempt of `spec` against `endpoint`.
    ///
    /// On success the returned response streams its body; consuming it to
    /// the end recycles the connection.
    pub(crate) async fn attempt(
        &self,
        endpoint: &Endpoint,
        spec: &RequestSpec,
        req_uid: Option<&str>,
    ) -> Result<ObjectResponse, Error> {
        let mut conn = self.transport.checkout(endpoint).await?;
        let request = self.build_request(endpoint, spec, req_uid)?;
        trace!(endpoint = %endpoint, reused = conn.is_reused(), key = %spec.key, "sending request");

        let response = match conn.send(request).await {
            Ok(response) => response,
            Err(err) => return Err(classify_send_error(err, endpoint, spec.payload.upload_state())),
        };

        let status = response.status();
        trace!(endpoint = %endpoint, status = status.as_u16(), key = %spec.key, "response received");

        let (parts, incoming) = response.into_parts();
        let body = ObjectBody::new(incoming, conn);
        if spec.accepts(status) {
            Ok(http::Response::from_parts(parts, body))
        } else {
            // Error bodies are tiny; drain so the socket can be reused.
            let _ = body.collect().await;
            let err = classify_status(status);
            debug!(endpoint = %endpoint, status = status.as_u16(), key = %spec.key,
                expected = err.is_expected(), "request failed");
            Err(err)
        }
    }

    fn build_request(
        &self,
        endpoint: &Endpoint,
        spec: &RequestSpec,
        req_uid: Option<&str>,
    ) -> Result<Request<RequestBody>, Error> {
        let mut builder = Request::builder()
            .method(spec.method.clone())
            .uri(format!("{}{}", self.base_path, spec.key))
            .header(header::HOST, endpoint.to_string())
            .header(header::CONTENT_LENGTH, spec.payload.content_length());

        if let Some(content_type) = spec.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        if let Some(chain) = req_uid {
            let first = first_uid(chain);
            builder = builder
                .header(HEADER_REQUEST_UIDS, first)
                .header(HEADER_TRACE_IDS, first);
        }
        if self.immutable {
            builder = builder.header(HEADER_REPLICA_POLICY, "immutable");
        }
        if let Some((start, end)) = spec.range {
            builder = builder.header(header::RANGE, format!("bytes={start}-{end}"));
        }
        if let Some(usermd) = &spec.usermd {
            builder = builder.header(HEADER_USERMD, usermd.as_str());
        }

        builder
            .body(spec.payload.to_body())
            .map_err(|e| Error::InvalidArgument(format!("malformed request parameter: {e}")))
    }
}

/// The first UID of a colon-joined request UID chain.
fn first_uid(chain: &str) -> &str {
    chain.split(':').next().unwrap_or(chain)
}

fn classify_status(status: StatusCode) -> Error {
    if status.is_client_error() {
        Error::Expected {
            status: status.as_u16(),
        }
    } else {
        Error::UnexpectedStatus {
            status: status.as_u16(),
        }
    }
}

/// Maps a `hyper` send error onto the retryability taxonomy using the
/// upload progress flags.
fn classify_send_error(
    err: hyper::Error,
    endpoint: &Endpoint,
    state: Option<&Arc<UploadState>>,
) -> Error {
    if let Some(state) = state {
        if state.aborted() {
            return Error::VoluntaryAbort;
        }
        if state.streaming_started() {
            return Error::mid_stream(endpoint, err);
        }
    }
    Error::transport(endpoint, err)
}
