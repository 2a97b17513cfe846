//! Request and response body plumbing.
//!
//! Outbound bodies are represented by `RequestBody`, which is either empty,
//! a buffered JSON document, or a caller-supplied byte stream. Streamed
//! uploads are instrumented through a shared [`UploadState`]: the first data
//! frame latches `streaming_started`, which is what the failover layer
//! consults to decide whether a failed attempt may be replayed on another
//! endpoint. A stream error from the caller latches `aborted` instead.
//!
//! Inbound bodies are wrapped in [`ObjectBody`], which streams the payload
//! to the caller without buffering and hands the underlying connection back
//! to the keep-alive pool once the body reaches a clean end of stream.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http_body_util::Full;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use parking_lot::Mutex;

use crate::error::BoxError;
use crate::transport::PooledConn;

/// HTTP response with a streaming [`ObjectBody`].
pub type ObjectResponse = http::Response<ObjectBody>;

pub(crate) type PayloadStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Shared per-operation upload progress, observed by the failover layer.
pub(crate) struct UploadState {
    started: AtomicBool,
    aborted: AtomicBool,
    sent: AtomicU64,
    digest: Mutex<Option<md5::Context>>,
}

impl UploadState {
    /// `verify_digest` arms an MD5 context that is fed every streamed chunk.
    pub(crate) fn new(verify_digest: bool) -> Arc<Self> {
        Arc::new(UploadState {
            started: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            digest: Mutex::new(verify_digest.then(md5::Context::new)),
        })
    }

    /// Whether at least one body byte has been handed to the transport.
    pub(crate) fn streaming_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the caller's stream reported an error.
    pub(crate) fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    /// Consumes the armed digest context, if any.
    pub(crate) fn finish_digest(&self) -> Option<md5::Digest> {
        self.digest.lock().take().map(|ctx| ctx.compute())
    }

    fn observe(&self, chunk: &Bytes) {
        self.started.store(true, Ordering::Release);
        self.sent.fetch_add(chunk.len() as u64, Ordering::AcqRel);
        if let Some(ctx) = self.digest.lock().as_mut() {
            ctx.consume(chunk);
        }
    }

    fn observe_abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// Holder for the caller's payload stream, shared across retry attempts.
///
/// The stream is moved into the request body lazily, on the first poll of an
/// attempt that got as far as writing its body. An attempt that failed
/// without pulling a single chunk puts the stream back, so the next attempt
/// can replay it from the start.
pub(crate) struct UploadSource {
    slot: Arc<Mutex<Option<PayloadStream>>>,
}

impl UploadSource {
    pub(crate) fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let boxed: PayloadStream = Box::pin(stream.map_err(Into::into));
        UploadSource {
            slot: Arc::new(Mutex::new(Some(boxed))),
        }
    }

    pub(crate) fn body(&self, size: u64, state: Arc<UploadState>) -> UploadBody {
        UploadBody {
            slot: Arc::clone(&self.slot),
            stream: None,
            state,
            size,
        }
    }
}

/// Streaming upload body for a single request attempt.
pub(crate) struct UploadBody {
    slot: Arc<Mutex<Option<PayloadStream>>>,
    stream: Option<PayloadStream>,
    state: Arc<UploadState>,
    size: u64,
}

impl Body for UploadBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.stream.is_none() {
            this.stream = this.slot.lock().take();
        }
        let Some(stream) = this.stream.as_mut() else {
            // A previous attempt consumed the stream; the failover layer
            // never replays in that situation, so reaching this is a bug.
            return Poll::Ready(Some(Err("upload stream already consumed".into())));
        };

        match stream.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.state.observe(&chunk);
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Poll::Ready(Some(Err(err))) => {
                this.state.observe_abort();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.size.saturating_sub(self.state.bytes_sent()))
    }
}

impl Drop for UploadBody {
    fn drop(&mut self) {
        // Hand an untouched stream back for the next attempt.
        if let Some(stream) = self.stream.take()
            && !self.state.streaming_started()
        {
            self.slot.lock().replace(stream);
        }
    }
}

/// Outbound request body.
pub(crate) enum RequestBody {
    Empty,
    Buffered(Full<Bytes>),
    Upload(UploadBody),
}

impl RequestBody {
    pub(crate) fn buffered(bytes: Bytes) -> Self {
        RequestBody::Buffered(Full::new(bytes))
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            RequestBody::Empty => Poll::Ready(None),
            RequestBody::Buffered(full) => match Pin::new(full).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
                Poll::Ready(Some(Err(never))) => match never {},
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            RequestBody::Upload(upload) => Pin::new(upload).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Buffered(full) => full.is_end_stream(),
            RequestBody::Upload(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            RequestBody::Empty => SizeHint::with_exact(0),
            RequestBody::Buffered(full) => full.size_hint(),
            RequestBody::Upload(upload) => upload.size_hint(),
        }
    }
}

/// Streaming response body handed to callers.
///
/// The payload is never buffered by the client. When the body ends cleanly
/// the underlying keep-alive connection is returned to the pool; dropping
/// the body early simply closes the connection.
///
/// # Examples
///
/// ```rust,no_run
/// use http_body_util::BodyExt;
/// # async fn example(response: sproxyd_client::ObjectResponse) {
/// let payload = response.into_body().collect().await.unwrap().to_bytes();
/// # }
/// ```
pub struct ObjectBody {
    inner: Incoming,
    conn: Option<PooledConn>,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody").finish_non_exhaustive()
    }
}

impl ObjectBody {
    pub(crate) fn new(inner: Incoming, conn: PooledConn) -> Self {
        ObjectBody {
            inner,
            conn: Some(conn),
        }
    }
}

impl Body for ObjectBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                if let Some(conn) = this.conn.take() {
                    conn.recycle();
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                // The connection is poisoned; drop it instead of pooling it.
                this.conn.take();
                Poll::Ready(Some(Err(err.into())))
            }
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
