//! HTTP sink handler and listener composition
//!
//! Every inbound request, whatever its method or path, is answered with an
//! empty 200. When a record channel is installed the handler encodes the
//! request and sends it to the writer pool first; a full channel blocks the
//! handler, which is the system's back-pressure.
//!
//! One listening socket is created per configured `serve` URL. An `https`
//! scheme wraps accepted connections in a rustls handshake; both variants
//! then serve the same router.

use crate::error::{Result, SinkholeError};
use crate::record::MarshalledRequest;
use crate::server::shutdown::ShutdownCoordinator;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Shared handler state.
///
/// `record_tx` is absent in no-save mode; the handler then answers 200 and
/// drops the request. `request_seq` feeds the synthesized request ids.
#[derive(Clone)]
pub struct SinkState {
    record_tx: Option<flume::Sender<MarshalledRequest>>,
    request_seq: Arc<AtomicU64>,
}

impl SinkState {
    pub fn new(record_tx: Option<flume::Sender<MarshalledRequest>>) -> Self {
        Self {
            record_tx,
            request_seq: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Build the router: a single fallback handler catches every method and
/// path.
pub fn build_router(state: SinkState) -> Router {
    Router::new().fallback(sink_handler).with_state(state)
}

async fn sink_handler(
    State(state): State<SinkState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(tx) = &state.record_tx {
        let connection_id = state.request_seq.fetch_add(1, Ordering::Relaxed);
        match MarshalledRequest::from_http_parts(&method, &uri, &headers, body, connection_id) {
            Ok(record) => {
                // Blocks while the channel is full; consumers draining is
                // the only way forward. There is no drop policy.
                if tx.send_async(record).await.is_err() {
                    debug!("record channel closed, dropping request during shutdown");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode request record"),
        }
    }
    StatusCode::OK
}

/// One listening socket derived from a `serve` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub url: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse the configured `serve` URLs into listener specs. `https` entries
/// require TLS configuration to be available.
pub fn parse_serve_urls(serve: &[String], tls_available: bool) -> Result<Vec<ListenerSpec>> {
    let mut specs = Vec::with_capacity(serve.len());
    for (index, url) in serve.iter().enumerate() {
        let (scheme, rest) = url.split_once("://").ok_or_else(|| {
            SinkholeError::Config(format!(
                "error parsing url #{index} under `serve`: {url} \
                 (expected the form http://host:port or https://host:port)"
            ))
        })?;

        let tls = match scheme.to_ascii_lowercase().as_str() {
            "http" => false,
            "https" => true,
            other => {
                return Err(SinkholeError::Config(format!(
                    "unsupported scheme '{other}' in url #{index} under `serve`: {url}"
                )))
            }
        };
        if tls && !tls_available {
            return Err(SinkholeError::Config(format!(
                "no TLS configuration available for url #{index} under `serve`: {url}"
            )));
        }

        let mut port = if tls { 443 } else { 80 };
        let host_port = rest.split('/').next().unwrap_or(rest);
        if let Some((_, port_str)) = host_port.rsplit_once(':') {
            if !port_str.is_empty() {
                port = port_str.parse::<u16>().map_err(|e| {
                    SinkholeError::Config(format!(
                        "error parsing port from url #{index} under `serve`: {url}: {e}"
                    ))
                })?;
            }
        }

        specs.push(ListenerSpec {
            url: url.clone(),
            port,
            tls,
        });
    }
    Ok(specs)
}

/// Accept connections on one listener until shutdown, serving each through
/// the shared router. Returns after every accepted connection has drained.
pub async fn run_listener(
    spec: ListenerSpec,
    router: Router,
    acceptor: Option<TlsAcceptor>,
    shutdown: Arc<ShutdownCoordinator>,
) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, spec.port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        SinkholeError::Server(format!("unable to listen on {addr} for {}: {e}", spec.url))
    })?;
    info!(%addr, url = %spec.url, tls = spec.tls, "listening");

    let mut notified = shutdown.subscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = notified.recv() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, url = %spec.url, "accept failed");
                        continue;
                    }
                };
                if shutdown.is_shutting_down() {
                    debug!(%peer, "rejecting connection, server is shutting down");
                    continue;
                }
                let router = router.clone();
                let acceptor = acceptor.clone();
                let shutdown = shutdown.clone();
                connections.spawn(async move {
                    serve_connection(stream, peer, router, acceptor, shutdown).await;
                });
            }
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    info!(url = %spec.url, "listener stopped");
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    acceptor: Option<TlsAcceptor>,
    shutdown: Arc<ShutdownCoordinator>,
) {
    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                debug!(%peer, "TLS handshake completed");
                drive_http(tls_stream, peer, router, shutdown).await;
            }
            Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
        },
        None => drive_http(stream, peer, router, shutdown).await,
    }
}

/// Serve HTTP on one accepted stream, honoring graceful shutdown: on the
/// shutdown signal the connection stops accepting new requests but lets
/// in-flight handlers return.
async fn drive_http<I>(
    io: I,
    peer: SocketAddr,
    router: Router,
    shutdown: Arc<ShutdownCoordinator>,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router);
    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    // Subscribe before checking the flag: initiate() sets the flag and then
    // notifies, so either the check sees it or the receiver does.
    let mut notified = shutdown.subscribe();
    if shutdown.is_shutting_down() {
        connection.as_mut().graceful_shutdown();
        if let Err(e) = connection.as_mut().await {
            debug!(%peer, error = %e, "connection ended with error");
        }
        return;
    }
    let result = tokio::select! {
        res = connection.as_mut() => res,
        _ = notified.recv() => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };

    if let Err(e) = result {
        debug!(%peer, error = %e, "connection ended with error");
    }
}
