use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::http::{self, ParsedRequest};
use crate::pump;
use crate::tunnel::{Endpoint, EndpointError, TunnelFactory};

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\n\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\nConnection: close\n\n";
const FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\nConnection: close\n\n";
const AUTH_REQUIRED: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\nProxy-Authenticate: Basic realm=\"proxy\"\n\n";
const PROXY_FAILURE: &[u8] = b"HTTP/1.1 500 Proxy Failure\nConnection: close\n\n";

/// Drive one inbound connection end-to-end: parse the request head, check
/// proxy authentication, open the outbound tunnel, forward what the client
/// already sent, then pump until both directions finish.
///
/// All failures are answered on the inbound side and logged here; nothing
/// propagates to the accept loop. Cancellation before the tunnel is up
/// unwinds without emitting a status line.
pub async fn run<S, F>(
    mut inbound: S,
    factory: Arc<F>,
    basic_token: Option<Arc<str>>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: TunnelFactory,
{
    let parsed = tokio::select! {
        _ = cancel.cancelled() => return,
        parsed = http::read_request(&mut inbound) => match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                debug!(%error, "rejecting unparseable request");
                respond(&mut inbound, BAD_REQUEST).await;
                return;
            }
        }
    };

    if let Some(expected) = basic_token.as_deref() {
        match parsed.proxy_authorization.as_deref() {
            None => {
                respond(&mut inbound, AUTH_REQUIRED).await;
                return;
            }
            Some(presented) if !credential_matches(expected, presented) => {
                warn!("client presented a bad proxy credential");
                respond(&mut inbound, FORBIDDEN).await;
                return;
            }
            Some(_) => {}
        }
    }

    let route = match Route::of(&parsed) {
        Ok(route) => route,
        Err(error) => {
            debug!(%error, method = %parsed.method, url = %parsed.url, "rejecting destination");
            respond(&mut inbound, BAD_REQUEST).await;
            return;
        }
    };

    let mut outbound = tokio::select! {
        _ = cancel.cancelled() => return,
        created = factory.create(route.destination()) => match created {
            Ok(outbound) => outbound,
            Err(error) => {
                warn!(%error, destination = %route.destination(), "tunnel failed");
                respond(&mut inbound, PROXY_FAILURE).await;
                return;
            }
        }
    };

    let preamble = match &route {
        Route::Tunnel { .. } => {
            if let Err(error) = write_all_flush(&mut inbound, CONNECTION_ESTABLISHED).await {
                debug!(%error, "client went away before the tunnel reply");
                return;
            }
            None
        }
        Route::Forward { head, .. } => Some(head.as_slice()),
    };

    if let Some(head) = preamble {
        if let Err(error) = outbound.write_all(head).await {
            debug!(%error, "tunnel went away before the forwarded request");
            return;
        }
    }
    if !parsed.remaining.is_empty() {
        if let Err(error) = outbound.write_all(&parsed.remaining).await {
            debug!(%error, "tunnel went away before the forwarded payload");
            return;
        }
    }
    if let Err(error) = outbound.flush().await {
        debug!(%error, "tunnel flush failed");
        return;
    }

    let summary = pump::run(inbound, outbound, cancel).await;
    debug!(
        sent = summary.client_to_upstream,
        received = summary.upstream_to_client,
        "session complete"
    );
}

/// Live-session count shared between the accept loop and shutdown.
///
/// Every session task holds a [`SessionPermit`] from accept until it
/// finishes; shutdown sleeps on the idle notification instead of polling
/// the counter.
#[derive(Clone, Default)]
pub struct SessionTracker {
    shared: Arc<TrackerShared>,
}

#[derive(Default)]
struct TrackerShared {
    active: AtomicUsize,
    idle: Notify,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Account for one session until the returned permit is dropped.
    pub fn begin(&self) -> SessionPermit {
        self.shared.active.fetch_add(1, Ordering::Relaxed);
        SessionPermit {
            shared: self.shared.clone(),
        }
    }

    /// Wait until every session has finished or `limit` elapses; returns the
    /// number still running.
    pub async fn drain(&self, limit: Duration) -> usize {
        let deadline = Instant::now() + limit;
        loop {
            // Register before re-reading the count so the last permit's
            // wakeup cannot slip between the check and the await
            let woken = self.shared.idle.notified();
            if self.active() == 0 {
                return 0;
            }
            if timeout_at(deadline, woken).await.is_err() {
                return self.active();
            }
        }
    }
}

/// Held by a session task for its whole lifetime.
pub struct SessionPermit {
    shared: Arc<TrackerShared>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        if self.shared.active.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.shared.idle.notify_waiters();
        }
    }
}

enum Route {
    Tunnel { destination: Endpoint },
    Forward { destination: Endpoint, head: Vec<u8> },
}

/// Error type for destination resolution
#[derive(Debug, thiserror::Error)]
enum RouteError {
    #[error("CONNECT target must be host:port")]
    BadConnectTarget,

    #[error("request URL is not an absolute http URI")]
    BadAbsoluteUrl,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

impl Route {
    fn of(parsed: &ParsedRequest) -> Result<Self, RouteError> {
        if parsed.method == "CONNECT" {
            Ok(Route::Tunnel {
                destination: connect_destination(&parsed.url)?,
            })
        } else {
            let (destination, head) = forward_parts(parsed)?;
            Ok(Route::Forward { destination, head })
        }
    }

    fn destination(&self) -> &Endpoint {
        match self {
            Route::Tunnel { destination } | Route::Forward { destination, .. } => destination,
        }
    }
}

/// Split an authority-form `host:port` CONNECT target at the last colon.
fn connect_destination(target: &str) -> Result<Endpoint, RouteError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or(RouteError::BadConnectTarget)?;
    let port: u16 = port.parse().map_err(|_| RouteError::BadConnectTarget)?;
    Ok(Endpoint::resolve(host, port)?)
}

/// Resolve an absolute-form URL and synthesize the origin-form request head
/// sent upstream.
fn forward_parts(parsed: &ParsedRequest) -> Result<(Endpoint, Vec<u8>), RouteError> {
    let url = Url::parse(&parsed.url).map_err(|_| RouteError::BadAbsoluteUrl)?;
    if url.scheme() != "http" {
        return Err(RouteError::BadAbsoluteUrl);
    }

    let port = url.port().unwrap_or(80);
    let destination = match url.host().ok_or(RouteError::BadAbsoluteUrl)? {
        url::Host::Ipv4(addr) => Endpoint::V4(addr, port),
        url::Host::Ipv6(addr) => Endpoint::V6(addr, port),
        url::Host::Domain(domain) => {
            if domain.len() > 255 {
                return Err(EndpointError::HostTooLong.into());
            }
            Endpoint::Dns(domain.to_string(), port)
        }
    };

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(parsed.method.as_bytes());
    head.push(b' ');
    head.extend_from_slice(url.path().as_bytes());
    if let Some(query) = url.query() {
        head.push(b'?');
        head.extend_from_slice(query.as_bytes());
    }
    head.extend_from_slice(b" HTTP/1.1\n");
    for (name, value) in &parsed.headers {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.push(b'\n');
    }
    head.push(b'\n');

    Ok((destination, head))
}

/// `Basic` scheme match is case-insensitive; the token match is exact.
fn credential_matches(expected: &str, presented: &str) -> bool {
    match presented.trim().split_once(' ') {
        Some((scheme, token)) => scheme.eq_ignore_ascii_case("Basic") && token.trim() == expected,
        None => false,
    }
}

async fn write_all_flush<S>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}

/// Best-effort status write; the client may already be gone.
async fn respond<S>(inbound: &mut S, status: &[u8])
where
    S: AsyncWrite + Unpin,
{
    if let Err(error) = write_all_flush(inbound, status).await {
        debug!(%error, "status write failed");
    }
}
