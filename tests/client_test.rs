//! End-to-end tests against in-process HTTP/1.1 storage endpoints.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use futures_util::{Stream, stream};
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rand::RngCore;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use sproxyd_client::{
    BoxError, Error, ObjectResponse, PutOptions, RoutingParams, SproxydClient, SproxydConfig,
};

// --- In-process storage endpoint -----------------------------------------

#[derive(Clone)]
struct StoredObject {
    payload: Bytes,
    usermd: Option<String>,
}

#[derive(Default)]
struct StoreState {
    objects: Mutex<HashMap<String, StoredObject>>,
    accepts: AtomicUsize,
    requests: AtomicUsize,
    paths: Mutex<Vec<String>>,
    request_uids: Mutex<Vec<String>>,
    immutable_flags: Mutex<Vec<bool>>,
    deleted: Mutex<Vec<String>>,
    delete_locked: AtomicBool,
    batch_sizes: Mutex<Vec<usize>>,
    batch_content_types: Mutex<Vec<String>>,
    batch_in_flight: AtomicUsize,
    batch_max_in_flight: AtomicUsize,
}

fn with_status(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn with_body(bytes: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(bytes))
        .unwrap()
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn handle(
    state: Arc<StoreState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    state.requests.fetch_add(1, Ordering::SeqCst);
    state
        .paths
        .lock()
        .push(req.uri().path().to_string());
    state
        .immutable_flags
        .lock()
        .push(req.headers().contains_key("x-scal-replica-policy"));
    if let Some(uid) = req.headers().get("x-scal-request-uids") {
        state
            .request_uids
            .lock()
            .push(uid.to_str().unwrap_or_default().to_string());
    }

    let method = req.method().clone();
    let key = req
        .uri()
        .path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();

    let response = if method == Method::POST && key == ".batch_delete" {
        handle_batch_delete(&state, req).await
    } else if method == Method::GET && key == ".conf" {
        with_body(Bytes::from_static(b"{\"version\":1}"))
    } else if method == Method::PUT {
        let usermd = req
            .headers()
            .get("x-scal-usermd")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let payload = req.into_body().collect().await.unwrap().to_bytes();
        state
            .objects
            .lock()
            .insert(key, StoredObject { payload, usermd });
        with_body(Bytes::new())
    } else if method == Method::GET {
        let object = state.objects.lock().get(&key).cloned();
        match object {
            Some(object) => {
                let range = req
                    .headers()
                    .get(header::RANGE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_range);
                match range {
                    Some((start, end)) if end < object.payload.len() => Response::builder()
                        .status(StatusCode::PARTIAL_CONTENT)
                        .header(
                            header::CONTENT_RANGE,
                            format!("bytes {start}-{end}/{}", object.payload.len()),
                        )
                        .body(Full::new(object.payload.slice(start..=end)))
                        .unwrap(),
                    Some(_) => with_status(StatusCode::RANGE_NOT_SATISFIABLE),
                    None => with_body(object.payload),
                }
            }
            None => with_status(StatusCode::NOT_FOUND),
        }
    } else if method == Method::HEAD {
        let object = state.objects.lock().get(&key).cloned();
        match object {
            Some(object) => {
                let mut builder = Response::builder().status(StatusCode::OK);
                if let Some(usermd) = object.usermd {
                    builder = builder.header("x-scal-usermd", usermd);
                }
                builder.body(Full::new(Bytes::new())).unwrap()
            }
            None => with_status(StatusCode::NOT_FOUND),
        }
    } else if method == Method::DELETE {
        state.deleted.lock().push(key.clone());
        if state.delete_locked.load(Ordering::SeqCst) {
            with_status(StatusCode::LOCKED)
        } else if state.objects.lock().remove(&key).is_some() {
            with_body(Bytes::new())
        } else {
            with_status(StatusCode::NOT_FOUND)
        }
    } else {
        with_status(StatusCode::METHOD_NOT_ALLOWED)
    };

    Ok(response)
}

async fn handle_batch_delete(
    state: &Arc<StoreState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    #[derive(Deserialize)]
    struct BatchBody {
        keys: Vec<String>,
    }

    state.batch_content_types.lock().push(
        req.headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    );

    let in_flight = state.batch_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state
        .batch_max_in_flight
        .fetch_max(in_flight, Ordering::SeqCst);
    // Hold the slot long enough for concurrent batches to overlap.
    tokio::time::sleep(Duration::from_millis(25)).await;

    let body = req.into_body().collect().await.unwrap().to_bytes();
    let parsed: BatchBody = serde_json::from_slice(&body).unwrap();
    state.batch_sizes.lock().push(parsed.keys.len());
    for key in &parsed.keys {
        state.objects.lock().remove(key);
        state.deleted.lock().push(key.clone());
    }

    state.batch_in_flight.fetch_sub(1, Ordering::SeqCst);
    with_body(Bytes::from_static(b"{}"))
}

fn serve_connection(stream: TcpStream, state: Arc<StoreState>) {
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let svc = service_fn(move |req| handle(state.clone(), req));
        let _ = http1::Builder::new()
            .keep_alive(true)
            .serve_connection(io, svc)
            .await;
    });
}

/// Healthy storage endpoint; kills the first `kill_first` connections right
/// after accepting them, before any response is written.
async fn spawn_store_killing_first(
    state: Arc<StoreState>,
    kill_first: usize,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let accepted = state.accepts.fetch_add(1, Ordering::SeqCst) + 1;
            if accepted <= kill_first {
                drop(stream);
                continue;
            }
            serve_connection(stream, state.clone());
        }
    });
    Ok(addr)
}

async fn spawn_store(state: Arc<StoreState>) -> Result<SocketAddr> {
    spawn_store_killing_first(state, 0).await
}

/// Endpoint that accepts, reads roughly 100 KiB of the request, then drops
/// the socket mid-upload.
async fn spawn_midstream_killer(accepts: Arc<AtomicUsize>) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            accepts.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut total = 0usize;
                while total < 100 * 1024 {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => total += n,
                    }
                }
                // Dropping with unread data pending resets the connection.
            });
        }
    });
    Ok(addr)
}

// --- Helpers --------------------------------------------------------------

fn client_for(addrs: &[SocketAddr], immutable: bool) -> Result<SproxydClient> {
    let config = SproxydConfig {
        bootstrap: addrs.iter().map(|addr| addr.to_string()).collect(),
        immutable,
        ..SproxydConfig::default()
    };
    Ok(SproxydClient::new(config)?)
}

fn params() -> RoutingParams {
    RoutingParams {
        bucket_name: "vogosphere".to_string(),
        namespace: "poem".to_string(),
        owner: "jeltz".to_string(),
    }
}

fn random_payload(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

fn chunked(
    payload: Bytes,
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static {
    let chunks: Vec<Result<Bytes, BoxError>> = payload
        .chunks(chunk_size)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    stream::iter(chunks)
}

/// Single-chunk body that yields only after a short delay, so a connection
/// failure happening right after checkout stays ahead of the first byte.
fn delayed(payload: Bytes) -> impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static {
    stream::once(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(payload)
    })
}

fn fixed_key(i: u64) -> String {
    format!("{i:040X}")
}

async fn read_body(response: ObjectResponse) -> Result<Bytes> {
    let collected = response
        .into_body()
        .collect()
        .await
        .map_err(|err| anyhow!("failed to collect response body: {err}"))?;
    Ok(collected.to_bytes())
}

// --- Scenarios ------------------------------------------------------------

#[tokio::test]
async fn put_get_delete_round_trip() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let payload = random_payload(9000);
    let key = client
        .put(
            chunked(payload.clone(), 1024),
            payload.len() as u64,
            &params(),
            Some("req-1:req-0"),
        )
        .await?;

    assert_eq!(key.len(), 40);
    assert!(key.ends_with("02"), "default cos must close the key: {key}");
    assert_eq!(&key[30..32], "59");

    let stored = state
        .objects
        .lock()
        .get(&key)
        .cloned()
        .expect("object stored");
    assert_eq!(stored.payload.len(), 9000);
    assert_eq!(stored.payload, payload);
    assert!(
        state.paths.lock()[0].starts_with("/proxy/arc/"),
        "default base path must be used"
    );
    assert_eq!(state.request_uids.lock()[0], "req-1");

    let response = client.get(&key, None, Some("req-2")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await?, payload);

    client.delete(&key, Some("req-3")).await?;

    let err = client.get(&key, None, Some("req-4")).await.unwrap_err();
    assert!(matches!(err, Error::Expected { status: 404 }));
    assert!(err.is_expected());
    Ok(())
}

#[tokio::test]
async fn large_payload_streams_under_a_single_key() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let payload = random_payload(3 * 4 * 1024 * 1024);
    let key = client
        .put(
            chunked(payload.clone(), 64 * 1024),
            payload.len() as u64,
            &params(),
            None,
        )
        .await?;

    let response = client.get(&key, None, None).await?;
    assert_eq!(read_body(response).await?, payload);
    Ok(())
}

#[tokio::test]
async fn ranged_get_returns_partial_content() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let payload = random_payload(100);
    let key = client
        .put(chunked(payload.clone(), 100), 100, &params(), None)
        .await?;

    let response = client.get(&key, Some((10, 19)), None).await?;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(read_body(response).await?, payload.slice(10..=19));
    Ok(())
}

#[tokio::test]
async fn connection_drop_before_streaming_fails_over() -> Result<()> {
    let state = Arc::new(StoreState::default());
    // The first connection dies before a response; both bootstrap entries
    // point at the same endpoint, so the retry is deterministic whatever
    // the initial shuffle did.
    let addr = spawn_store_killing_first(state.clone(), 1).await?;
    let client = client_for(&[addr, addr], false)?;

    let payload = random_payload(9000);
    let key = client
        .put(delayed(payload.clone()), 9000, &params(), None)
        .await?;

    assert!(state.accepts.load(Ordering::SeqCst) >= 2, "retry must reconnect");
    let stored = state
        .objects
        .lock()
        .get(&key)
        .cloned()
        .expect("object stored");
    assert_eq!(stored.payload, payload);
    Ok(())
}

#[tokio::test]
async fn failed_endpoint_rotates_out_of_the_head() -> Result<()> {
    // This endpoint drops every connection before responding.
    let broken_state = Arc::new(StoreState::default());
    let broken_addr = spawn_store_killing_first(broken_state.clone(), usize::MAX).await?;
    let state = Arc::new(StoreState::default());
    let healthy_addr = spawn_store(state.clone()).await?;

    let client = client_for(&[broken_addr, healthy_addr], false)?;

    // Whatever order the shuffle picked, this settles the head on the
    // healthy endpoint.
    let key = fixed_key(7);
    client.put_empty_object(&key, "cafe", None).await?;

    let contacted = broken_state.accepts.load(Ordering::SeqCst);
    for _ in 0..3 {
        client.get_head(&key, None).await?;
    }
    assert_eq!(
        broken_state.accepts.load(Ordering::SeqCst),
        contacted,
        "once rotated out, the failed endpoint must not be preferred again"
    );
    Ok(())
}

#[tokio::test]
async fn midstream_drop_is_not_retried() -> Result<()> {
    let accepts = Arc::new(AtomicUsize::new(0));
    let addr = spawn_midstream_killer(accepts.clone()).await?;
    let client = client_for(&[addr], false)?;

    let payload = random_payload(4 * 1024 * 1024);
    let err = client
        .put(chunked(payload, 64 * 1024), 4 * 1024 * 1024, &params(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MidStream { .. }), "got {err:?}");
    assert!(!err.is_retryable());
    assert_eq!(
        accepts.load(Ordering::SeqCst),
        1,
        "a mid-stream failure must not open a second connection"
    );
    Ok(())
}

#[tokio::test]
async fn caller_abort_surfaces_voluntary_abort() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let body = stream::iter(vec![
        Ok(Bytes::from_static(b"partial upload")),
        Err::<Bytes, BoxError>("stream destroyed".into()),
    ]);
    let err = client.put(body, 1 << 20, &params(), None).await.unwrap_err();

    assert!(matches!(err, Error::VoluntaryAbort), "got {err:?}");
    assert!(!err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn exhausted_pool_reports_transport_error_without_touching_the_stream() -> Result<()> {
    // Reserved ports; nothing listens on either.
    let client = client_for(&["127.0.0.1:1".parse()?, "127.0.0.1:2".parse()?], false)?;

    let polled = Arc::new(AtomicBool::new(false));
    let probe = {
        let polled = polled.clone();
        stream::poll_fn(move |_| {
            polled.store(true, Ordering::SeqCst);
            std::task::Poll::Ready(None::<Result<Bytes, BoxError>>)
        })
    };

    let err = client.put(probe, 10, &params(), None).await.unwrap_err();
    assert!(matches!(err, Error::Transport { .. }), "got {err:?}");
    assert!(
        !polled.load(Ordering::SeqCst),
        "the payload must stay untouched when no connection ever became writable"
    );
    Ok(())
}

#[tokio::test]
async fn deleting_a_locked_immutable_replica_counts_as_success() -> Result<()> {
    let state = Arc::new(StoreState::default());
    state.delete_locked.store(true, Ordering::SeqCst);
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], true)?;

    client.delete(&fixed_key(1), None).await?;
    Ok(())
}

#[tokio::test]
async fn missing_object_reports_expected_not_found() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let err = client.get(&fixed_key(2), None, None).await.unwrap_err();
    assert_eq!(err.status(), Some(404));

    let err = client.get_head(&fixed_key(3), None).await.unwrap_err();
    assert_eq!(err.status(), Some(404));

    // Expected errors answer immediately; no failover happened.
    assert_eq!(state.requests.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn put_empty_object_then_head_returns_the_usermd() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let key = fixed_key(4);
    let usermd = "deadbeefdeadbeefdeadbeefdeadbeef";
    client.put_empty_object(&key, usermd, None).await?;

    let stored = state
        .objects
        .lock()
        .get(&key)
        .cloned()
        .expect("object stored");
    assert!(stored.payload.is_empty());

    assert_eq!(client.get_head(&key, None).await?, usermd);

    // An object without user metadata probes as empty.
    let bare = fixed_key(5);
    client.put_empty_object(&bare, "", None).await?;
    assert_eq!(client.get_head(&bare, None).await?, "");
    Ok(())
}

#[tokio::test]
async fn batch_delete_splits_into_bounded_batches() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let keys: Vec<String> = (0..2000).map(fixed_key).collect();
    client.batch_delete(&keys, Some("req-batch")).await?;

    let sizes = state.batch_sizes.lock().clone();
    assert_eq!(sizes.len(), 2, "2000 keys must produce two sub-requests");
    assert!(sizes.iter().all(|&len| len <= 1000));
    assert_eq!(sizes.iter().sum::<usize>(), 2000);
    assert!(
        state
            .batch_content_types
            .lock()
            .iter()
            .all(|ct| ct == "application/json")
    );
    assert_eq!(state.deleted.lock().len(), 2000);
    Ok(())
}

#[tokio::test]
async fn batch_delete_bounds_in_flight_sub_requests() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let keys: Vec<String> = (0..5200).map(fixed_key).collect();
    client.batch_delete(&keys, None).await?;

    assert_eq!(state.batch_sizes.lock().len(), 6);
    let max = state.batch_max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 5, "at most five sub-requests in flight, saw {max}");
    Ok(())
}

#[tokio::test]
async fn immutable_clients_tag_every_request() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], true)?;

    let key = fixed_key(6);
    client.put_empty_object(&key, "cafe", None).await?;
    client.get_head(&key, None).await?;
    let _ = client.get(&key, None, None).await?;
    client.batch_delete(&[key.clone()], None).await?;
    client.healthcheck(None).await?;

    let flags = state.immutable_flags.lock().clone();
    assert!(!flags.is_empty());
    assert!(flags.iter().all(|&tagged| tagged));
    Ok(())
}

#[tokio::test]
async fn plain_clients_never_send_the_replica_policy_header() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let key = fixed_key(8);
    client.put_empty_object(&key, "cafe", None).await?;
    client.delete(&key, None).await?;

    let flags = state.immutable_flags.lock().clone();
    assert!(flags.iter().all(|&tagged| !tagged));
    Ok(())
}

#[tokio::test]
async fn healthcheck_probes_the_conf_document() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let response = client.healthcheck(Some("req-hc")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        read_body(response).await?,
        Bytes::from_static(b"{\"version\":1}")
    );
    assert!(state.paths.lock()[0].ends_with("/.conf"));
    Ok(())
}

#[tokio::test]
async fn destroyed_client_refuses_new_operations() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let key = fixed_key(9);
    client.put_empty_object(&key, "cafe", None).await?;

    client.destroy();
    let err = client.get_head(&key, None).await.unwrap_err();
    assert!(matches!(err, Error::Internal(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn digest_mismatch_deletes_the_object_and_fails() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let payload = random_payload(2048);
    let options = PutOptions {
        content_md5: Some("0".repeat(32)),
        ..PutOptions::default()
    };
    let err = client
        .put_with_options(chunked(payload, 512), 2048, &params(), None, options)
        .await
        .unwrap_err();

    let Error::InvalidDigest { computed, .. } = err else {
        panic!("expected a digest mismatch");
    };
    assert_eq!(computed.len(), 32);

    let deleted = state.deleted.lock().clone();
    assert_eq!(deleted.len(), 1, "the stored key must be cleaned up");
    assert!(state.objects.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn matching_digest_keeps_the_object() -> Result<()> {
    let state = Arc::new(StoreState::default());
    let addr = spawn_store(state.clone()).await?;
    let client = client_for(&[addr], false)?;

    let payload = random_payload(2048);
    let options = PutOptions {
        content_md5: Some(format!("{:x}", md5::compute(&payload))),
        ..PutOptions::default()
    };
    let key = client
        .put_with_options(chunked(payload.clone(), 512), 2048, &params(), None, options)
        .await?;

    assert!(state.deleted.lock().is_empty());
    let stored = state
        .objects
        .lock()
        .get(&key)
        .cloned()
        .expect("object stored");
    assert_eq!(stored.payload, payload);
    Ok(())
}
