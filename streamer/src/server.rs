use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use camlink_common::config::ServerConfig;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::context::{StatusReport, StreamingContext};
use crate::encoder::{ChannelSink, StreamEncoder};
use crate::session;
use crate::source::FrameSource;

const INDEX_HTML: &str = "<!DOCTYPE html>\
<html>\
<head>\
<title>CamLink</title>\
<meta name='viewport' content='width=device-width, initial-scale=1'>\
<style>\
body{font-family:sans-serif;text-align:center;background:#222;color:#eee;margin:0;padding:10px;}\
img{max-width:100%;height:auto;border:1px solid #444;}\
</style>\
</head>\
<body>\
<h1>CamLink</h1>\
<img src='/stream' alt='Live stream'>\
</body>\
</html>";

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Bind the HTTP listener with TCP keepalive, so a client that vanishes
/// without closing is detected as a disconnect.
///
/// Accepted connections inherit the keepalive settings of the listener.
pub async fn bind_listener(config: &ServerConfig) -> std::io::Result<TcpListener> {
    let addr = tokio::net::lookup_host((config.bind_addr.as_str(), config.port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{} resolves to no address", config.bind_addr),
            )
        })?;

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(config.keep_alive_idle_secs))
        .with_interval(Duration::from_secs(config.keep_alive_interval_secs))
        .with_retries(config.keep_alive_retries);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket.set_tcp_keepalive(&keepalive)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

pub fn router<S: FrameSource>(ctx: Arc<StreamingContext<S>>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream::<S>))
        .route("/status", get(status::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// GET /: viewer page
async fn index() -> impl IntoResponse {
    ([(header::CACHE_CONTROL, "max-age=300")], Html(INDEX_HTML))
}

/// GET /stream: multipart JPEG stream, one client at a time
async fn stream<S: FrameSource>(State(ctx): State<Arc<StreamingContext<S>>>) -> Response {
    let lease = match session::open(&ctx) {
        Ok(lease) => lease,
        Err(e) => {
            warn!(error = %e, "rejecting stream request");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let stream_config = &ctx.config().stream;
    let server = &ctx.config().server;
    let content_type = StreamEncoder::from_config(stream_config).content_type();
    let keep_alive = format!(
        "timeout={}, max={}",
        server.keep_alive_idle_secs, server.keep_alive_count
    );

    let (sink, rx) = ChannelSink::channel(stream_config.chunk_buffer, stream_config.send_timeout());
    let id = lease.id();
    debug!(session = id, "spawning stream session");
    let served = session::serve(Arc::clone(&ctx), lease, sink);
    tokio::spawn(async move {
        let report = served.await;
        let stats = report.stats;
        info!(
            session = id,
            end = ?report.end,
            frames_sent = stats.frames_sent,
            bytes_sent = stats.bytes_sent,
            keepalives = stats.keepalives,
            skipped = stats.skipped,
            oversized = stats.oversized,
            unavailable = stats.unavailable,
            transient_errors = stats.transient_errors,
            cooldowns = stats.cooldowns,
            "stream session ended"
        );
    });

    // The body ends when the session drops its sink; dropping the body closes
    // the channel, which the session sees as a disconnect.
    let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });

    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::CONNECTION, "keep-alive".to_string()),
            (KEEP_ALIVE, keep_alive),
        ],
        Body::from_stream(chunks),
    )
        .into_response()
}

/// GET /status: pipeline state and capture counters
async fn status<S: FrameSource>(State(ctx): State<Arc<StreamingContext<S>>>) -> Json<StatusReport> {
    Json(ctx.status())
}
