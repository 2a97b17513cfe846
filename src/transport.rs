//! Keep-alive HTTP/1.1 transport with a per-endpoint connection pool.
//!
//! Connections are raw `hyper` HTTP/1.1 handshakes over `TcpStream` with
//! Nagle disabled; each one is driven by a background task. After a request
//! fully completes, its sender is parked in an idle list keyed by endpoint.
//! Checkout prefers the most recently parked sender (a reused socket) and
//! falls back to a fresh connect. A parked sender that the server has idle-
//! closed, or that outlived the idle timeout, is discarded at checkout; the
//! race where the server closes the socket between checkout and the request
//! being written surfaces as a pre-stream transport error and is handled by
//! the failover layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::body::RequestBody;
use crate::error::Error;
use crate::pool::Endpoint;

/// How long a parked socket may sit idle before it is discarded.
const IDLE_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a single request attempt, connect included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

struct IdleConn {
  sender: SendRequest<RequestBody>,
  parked_at: Instant,
}

struct TransportInner {
  idle: Mutex<HashMap<Endpoint, Vec<IdleConn>>>,
  idle_timeout: Duration,
  destroyed: AtomicBool,
}

impl TransportInner {
  fn checkin(&self, endpoint: Endpoint, sender: SendRequest<RequestBody>) {
    if self.destroyed.load(Ordering::Acquire) {
      return;
    }
    trace!(endpoint = %endpoint, "parking idle connection");
    self.idle.lock().entry(endpoint).or_default().push(IdleConn {
      sender,
      parked_at: Instant::now(),
    });
  }
}

/// Shared HTTP transport. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Transport {
  inner: Arc<TransportInner>,
  request_timeout: Duration,
}

impl Transport {
  pub(crate) fn new() -> Self {
    Self::with_timeouts(IDLE_SOCKET_TIMEOUT, REQUEST_TIMEOUT)
  }

  pub(crate) fn with_timeouts(idle_timeout: Duration, request_timeout: Duration) -> Self {
    Transport {
      inner: Arc::new(TransportInner {
        idle: Mutex::new(HashMap::new()),
        idle_timeout,
        destroyed: AtomicBool::new(false),
      }),
      request_timeout,
    }
  }

  pub(crate) fn request_timeout(&self) -> Duration {
    self.request_timeout
  }

  /// Acquires a writable connection to `endpoint`, reusing a pooled socket
  /// when one is still usable.
  pub(crate) async fn checkout(&self, endpoint: &Endpoint) -> Result<PooledConn, Error> {
    if self.inner.destroyed.load(Ordering::Acquire) {
      return Err(Error::Internal("transport has been destroyed".to_string()));
    }

    while let Some(idle) = self.pop_idle(endpoint) {
      if idle.parked_at.elapsed() >= self.inner.idle_timeout {
        trace!(endpoint = %endpoint, "dropping idle connection past its idle timeout");
        continue;
      }
      if idle.sender.is_closed() || !idle.sender.is_ready() {
        trace!(endpoint = %endpoint, "dropping stale pooled connection");
        continue;
      }
      debug!(endpoint = %endpoint, reused = true, "connection checked out");
      return Ok(PooledConn {
        sender: idle.sender,
        endpoint: endpoint.clone(),
        inner: Arc::clone(&self.inner),
        reused: true,
      });
    }

    let sender = self.connect(endpoint).await?;
    debug!(endpoint = %endpoint, reused = false, "connection checked out");
    Ok(PooledConn {
      sender,
      endpoint: endpoint.clone(),
      inner: Arc::clone(&self.inner),
      reused: false,
    })
  }

  /// Closes every idle socket. In-flight requests keep their connections
  /// and fail or complete through their normal paths.
  pub(crate) fn destroy(&self) {
    self.inner.destroyed.store(true, Ordering::Release);
    let drained: usize = {
      let mut idle = self.inner.idle.lock();
      let count = idle.values().map(Vec::len).sum();
      idle.clear();
      count
    };
    debug!(connections = drained, "transport destroyed");
  }

  fn pop_idle(&self, endpoint: &Endpoint) -> Option<IdleConn> {
    self.inner.idle.lock().get_mut(endpoint)?.pop()
  }

  async fn connect(&self, endpoint: &Endpoint) -> Result<SendRequest<RequestBody>, Error> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
      .await
      .map_err(|e| Error::transport(endpoint, e))?;
    // Latency beats coalescing for these small requests.
    stream
      .set_nodelay(true)
      .map_err(|e| Error::transport(endpoint, e))?;

    let io = TokioIo::new(stream);
    let (sender, conn) = http1::handshake::<_, RequestBody>(io)
      .await
      .map_err(|e| Error::transport(endpoint, e))?;

    let peer = endpoint.clone();
    tokio::spawn(async move {
      if let Err(err) = conn.await {
        trace!(endpoint = %peer, error = %err, "connection task ended with error");
      }
    });

    Ok(sender)
  }
}

/// A connection checked out for one request attempt.
///
/// Dropping it closes the connection; `recycle` parks it for reuse instead.
pub(crate) struct PooledConn {
  sender: SendRequest<RequestBody>,
  endpoint: Endpoint,
  inner: Arc<TransportInner>,
  reused: bool,
}

impl std::fmt::Debug for PooledConn {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PooledConn")
      .field("endpoint", &self.endpoint)
      .field("reused", &self.reused)
      .finish_non_exhaustive()
  }
}

impl PooledConn {
  /// Whether this connection was taken from the idle pool rather than
  /// freshly established.
  pub(crate) fn is_reused(&self) -> bool {
    self.reused
  }

  pub(crate) async fn send(
    &mut self,
    req: Request<RequestBody>,
  ) -> Result<Response<Incoming>, hyper::Error> {
    self.sender.send_request(req).await
  }

  /// Parks the connection for the next request against the same endpoint.
  /// Only called once the response body has been fully consumed.
  pub(crate) fn recycle(self) {
    if self.sender.is_closed() {
      return;
    }
    self.inner.checkin(self.endpoint, self.sender);
  }
}
