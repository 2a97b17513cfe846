//! Retry loop over the endpoint pool.
//!
//! Each logical operation snapshots the pool head, runs one pipeline attempt
//! against it, and on a retryable failure rotates that snapshot past the
//! head before trying again. The retry budget equals the pool length. The
//! operation future completes exactly once; anything the connection does
//! after that is observed only by the transport's background task and
//! logged, never delivered.

use std::io;

use tokio::time::timeout;
use tracing::{Instrument, debug_span, error, warn};

use crate::body::ObjectResponse;
use crate::error::Error;
use crate::pipeline::{Pipeline, RequestSpec};
use crate::pool::{Endpoint, EndpointPool};

/// Runs `spec` with failover and a per-attempt total timeout.
pub(crate) async fn execute(
    pipeline: &Pipeline,
    pool: &EndpointPool,
    spec: &RequestSpec,
    req_uid: Option<&str>,
) -> Result<ObjectResponse, Error> {
    let span = debug_span!(
        "request",
        method = %spec.method,
        key = %spec.key,
        req_uid = req_uid.unwrap_or_default(),
    );
    run(pipeline, pool, spec, req_uid).instrument(span).await
}

async fn run(
    pipeline: &Pipeline,
    pool: &EndpointPool,
    spec: &RequestSpec,
    req_uid: Option<&str>,
) -> Result<ObjectResponse, Error> {
    let budget = pool.len();
    let mut retries = 0usize;

    loop {
        let started = pool.current();
        let attempt = pipeline.attempt(&started, spec, req_uid);
        let outcome = match timeout(pipeline.transport().request_timeout(), attempt).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(spec, &started)),
        };

        let err = match outcome {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        // A payload that already hit the wire cannot be replayed, whatever
        // the error kind says about retryability.
        if !err.is_retryable() || spec.payload.streaming_started() {
            return Err(err);
        }
        if retries >= budget {
            error!(attempts = retries + 1, error = %err, "endpoint pool exhausted");
            return Err(err);
        }

        warn!(
            endpoint = %started,
            attempt = retries + 1,
            error = %err,
            "attempt failed, rotating to the next endpoint",
        );
        pool.rotate_past(&started);
        retries += 1;
    }
}

fn timeout_error(spec: &RequestSpec, endpoint: &Endpoint) -> Error {
    let source = io::Error::new(io::ErrorKind::TimedOut, "request timed out");
    if spec.payload.streaming_started() {
        Error::mid_stream(endpoint, source)
    } else {
        Error::transport(endpoint, source)
    }
}
