use std::future::Future;
use std::io::IoSlice;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::api::handler::{self, AppState, Route, MAX_BODY_BYTES};
use crate::error::{AppError, AppResult};
use crate::transport::{BoxedStream, Listener};
use crate::wire::codec::{self, HEADER_TERMINATOR};
use crate::wire::io::{fill_buf, write_all_vectored};

/// What to do with the connection after a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    KeepAlive,
    Close,
}

impl Flow {
    fn from_keep_alive(keep_alive: bool) -> Self {
        if keep_alive {
            Flow::KeepAlive
        } else {
            Flow::Close
        }
    }
}

/// Accept connections until `shutdown` resolves, then remove the socket file
pub async fn run_server<F>(listener: Listener, state: AppState, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()>,
{
    info!("🌐 Server listening on: {}", listener.local_endpoint()?);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("🛑 Shutdown requested, closing listener");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let state = state.clone();
                    tokio::spawn(serve_connection(stream, state));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
        }
    }

    if let Some(path) = listener.socket_path() {
        match std::fs::remove_file(path) {
            Ok(()) => info!("🧹 Removed socket {}", path.display()),
            Err(e) => warn!("Could not remove socket {}: {}", path.display(), e),
        }
    }
    Ok(())
}

/// Serve requests on one connection until it closes or a request fails
async fn serve_connection(mut stream: BoxedStream, state: AppState) {
    let mut buf = state.header_buffers.checkout();
    buf.clear();

    loop {
        let outcome = catch_panic(handle_request(&mut stream, &mut buf, &state)).await;
        if settle(&mut stream, outcome).await == Flow::Close {
            break;
        }
    }

    let _ = stream.shutdown().await;
}

/// A panicking request becomes an internal error instead of killing the task
async fn catch_panic<F>(request: F) -> AppResult<Flow>
where
    F: Future<Output = AppResult<Flow>>,
{
    AssertUnwindSafe(request)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(AppError::Internal("request handler panicked".into())))
}

/// Answer a failed request with its status (best effort) and close
async fn settle(stream: &mut BoxedStream, outcome: AppResult<Flow>) -> Flow {
    match outcome {
        Ok(flow) => flow,
        Err(e) if e.is_disconnect() => {
            debug!("Connection dropped: {}", e);
            Flow::Close
        }
        Err(e) => {
            warn!("❌ Request failed: {}", e);
            let _ = write_response(stream, e.status_code(), false, None, b"").await;
            Flow::Close
        }
    }
}

/// Read, route and answer one request. Bytes past its end stay in `buf`.
async fn handle_request(
    stream: &mut BoxedStream,
    buf: &mut Vec<u8>,
    state: &AppState,
) -> AppResult<Flow> {
    let cap = state.header_buffers.buffer_size();

    let header_end = loop {
        if let Some(end) = codec::find_header_end(buf) {
            break end;
        }
        match fill_buf(stream, buf, cap).await {
            // Client went away between requests (or mid-head)
            Ok(0) => return Ok(Flow::Close),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(AppError::BadRequest(format!(
                    "request head exceeds {} bytes",
                    cap
                )));
            }
            Err(e) => return Err(e.into()),
        }
    };
    let body_start = header_end + HEADER_TERMINATOR.len();

    let head = codec::parse_request_head(&buf[..header_end])
        .ok_or_else(|| AppError::BadRequest("malformed request head".into()))?;
    let keep_alive = !head.close;

    let (flow, consumed) = match handler::route(&head) {
        Route::Ingest => {
            let length = head
                .content_length
                .ok_or_else(|| AppError::BadRequest("missing or malformed Content-Length".into()))?;
            if length > MAX_BODY_BYTES {
                return Err(AppError::BadRequest(format!("body of {} bytes is too large", length)));
            }

            let mut body = state.body_buffers.checkout();
            let buffered = (buf.len() - body_start).min(length);
            body.extend_from_slice(&buf[body_start..body_start + buffered]);
            read_body(stream, &mut body, length, state.body_buffers.buffer_size()).await?;

            handler::ingest_payment(state, &body);
            write_response(stream, StatusCode::OK, keep_alive, None, b"").await?;
            (Flow::from_keep_alive(keep_alive), body_start + buffered)
        }
        Route::Summary { route, query } => {
            let json = handler::payments_summary(state, route, query).await?;
            write_response(stream, StatusCode::OK, keep_alive, Some("application/json"), &json).await?;
            (Flow::from_keep_alive(keep_alive), body_start)
        }
        Route::NotFound => {
            // An undrained body would be parsed as the next request
            let has_body = head.content_length.is_some_and(|n| n > 0);
            let keep_alive = keep_alive && !has_body;
            write_response(stream, StatusCode::NOT_FOUND, keep_alive, None, b"").await?;
            (Flow::from_keep_alive(keep_alive), body_start)
        }
    };

    buf.drain(..consumed);
    Ok(flow)
}

/// Read the rest of a body in chunks until `length` bytes are in `body`
async fn read_body(
    stream: &mut BoxedStream,
    body: &mut Vec<u8>,
    length: usize,
    chunk: usize,
) -> AppResult<()> {
    while body.len() < length {
        let start = body.len();
        let want = (length - start).min(chunk);
        body.reserve(want);
        let n = (&mut **stream).take(want as u64).read_buf(body).await?;
        if n == 0 {
            return Err(AppError::BadRequest(format!(
                "body ended after {} of {} bytes",
                start, length
            )));
        }
    }
    Ok(())
}

async fn write_response(
    stream: &mut BoxedStream,
    status: StatusCode,
    keep_alive: bool,
    content_type: Option<&str>,
    body: &[u8],
) -> std::io::Result<()> {
    let mut head = Vec::with_capacity(160);
    codec::encode_response_head(&mut head, status, keep_alive, content_type, body.len());
    let mut slices = [IoSlice::new(&head), IoSlice::new(body)];
    write_all_vectored(stream, &mut slices).await
}
