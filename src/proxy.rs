// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local HTTPS reverse proxy to one managed cluster's API server.
//!
//! Every inbound TCP connection gets its own upstream: a fresh tunnel, TLS to the API server and
//! an HTTP/1.1 client connection, opened on the first request and reopened if it closes.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::config::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use crate::hyper_util::{BoxBody, empty, http1_client, plaintext_response};
use crate::tls::{self, ALPN_HTTP1, ClientTls};
use crate::tunnel::{self, API_SERVER_PORT, TunnelDialer};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("binding {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),
    #[error(transparent)]
    Tunnel(#[from] tunnel::Error),
    #[error("tls: {0}")]
    Tls(#[from] tls::Error),
    #[error("tls handshake with {0}: {1}")]
    UpstreamHandshake(String, #[source] io::Error),
    #[error("upstream: {0}")]
    Upstream(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("invalid header value: {0}")]
    Header(#[from] hyper::header::InvalidHeaderValue),
}

struct Target {
    cluster: String,
    dialer: Arc<dyn TunnelDialer>,
    tls: ClientTls,
}

pub struct ReverseProxy {
    listener: TcpListener,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    target: Arc<Target>,
    idle_timeout: Duration,
    drain_timeout: Duration,
}

impl ReverseProxy {
    /// bind listens on `addr` and serves `server_tls`. Requests are forwarded to the API server of
    /// the managed cluster `target`.
    pub async fn bind(
        addr: SocketAddr,
        server_tls: Arc<ServerConfig>,
        target: String,
        dialer: Arc<dyn TunnelDialer>,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Bind(addr, e))?;
        let addr = listener.local_addr().map_err(|e| Error::Bind(addr, e))?;
        let tls = tls::insecure_client_config(&target, &[ALPN_HTTP1])?;
        Ok(ReverseProxy {
            listener,
            addr,
            acceptor: TlsAcceptor::from(server_tls),
            target: Arc::new(Target {
                cluster: target,
                dialer,
                tls,
            }),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    /// Connections without an in-flight request for this long are closed.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// How long shutdown waits for open connections to finish.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// run accepts connections until `cancel` fires, then drains them.
    pub async fn run(self, cancel: CancellationToken) {
        let ReverseProxy {
            listener,
            addr,
            acceptor,
            target,
            idle_timeout,
            drain_timeout,
        } = self;
        info!(address = %addr, cluster = target.cluster, "reverse proxy listening");
        let tracker = TaskTracker::new();
        let force = CancellationToken::new();
        loop {
            let (stream, peer) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };
            if let Err(e) = stream.set_nodelay(true) {
                trace!(%peer, "set nodelay failed: {e}");
            }
            let conn = Connection {
                acceptor: acceptor.clone(),
                target: target.clone(),
                peer,
                idle_timeout,
                cancel: cancel.clone(),
                force: force.clone(),
                tracker: tracker.clone(),
            };
            tracker.spawn(
                conn.serve(stream)
                    .instrument(info_span!("inbound", %peer)),
            );
        }
        drop(listener);
        tracker.close();
        debug!(pending = tracker.len(), "draining connections, waiting {drain_timeout:?}");
        if tokio::time::timeout(drain_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                pending = tracker.len(),
                "drain duration expired with pending connections, forcefully closing them"
            );
            force.cancel();
        }
        info!(address = %addr, "reverse proxy shut down");
    }
}

struct Connection {
    acceptor: TlsAcceptor,
    target: Arc<Target>,
    peer: SocketAddr,
    idle_timeout: Duration,
    cancel: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
}

impl Connection {
    async fn serve(self, stream: TcpStream) {
        let tls = match self.acceptor.accept(stream).await {
            Ok(tls) => tls,
            Err(e) => {
                debug!("tls handshake failed: {e}");
                return;
            }
        };
        let upstream = Arc::new(Upstream {
            target: self.target.clone(),
            cancel: self.force.child_token(),
            sender: tokio::sync::Mutex::new(None),
        });
        let activity = Arc::new(Activity::new());

        let svc = {
            let activity = activity.clone();
            let upstream = upstream.clone();
            let tracker = self.tracker.clone();
            let peer = self.peer;
            service_fn(move |req| {
                let guard = activity.begin();
                let upstream = upstream.clone();
                let tracker = tracker.clone();
                async move {
                    let resp = upstream.forward(req, peer, &tracker).await;
                    Ok::<_, Infallible>(resp.map(|body| {
                        GuardedBody {
                            inner: body,
                            _guard: guard,
                        }
                        .boxed()
                    }))
                }
            })
        };
        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .serve_connection(TokioIo::new(tls), svc)
            .with_upgrades();
        tokio::pin!(conn);

        let mut closing = false;
        loop {
            let idle_check = activity.idle_remaining(self.idle_timeout);
            tokio::select! {
                res = conn.as_mut() => {
                    match res {
                        Ok(()) => trace!("connection closed"),
                        Err(e) => debug!("connection ended: {e}"),
                    }
                    break;
                }
                _ = self.cancel.cancelled(), if !closing => {
                    debug!("shutting down connection");
                    conn.as_mut().graceful_shutdown();
                    closing = true;
                }
                _ = tokio::time::sleep(idle_check), if !closing => {
                    if activity.is_idle(self.idle_timeout) {
                        debug!(idle_timeout = ?self.idle_timeout, "closing idle connection");
                        conn.as_mut().graceful_shutdown();
                        closing = true;
                    }
                }
                _ = self.force.cancelled() => break,
            }
        }
    }
}

/// Upstream is the lazily opened connection to the cluster for one inbound connection.
struct Upstream {
    target: Arc<Target>,
    cancel: CancellationToken,
    sender: tokio::sync::Mutex<Option<SendRequest<Incoming>>>,
}

impl Upstream {
    async fn forward(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        tracker: &TaskTracker,
    ) -> Response<BoxBody> {
        match self.try_forward(req, peer, tracker).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(cluster = self.target.cluster, "proxying request failed: {e}");
                plaintext_response(StatusCode::BAD_GATEWAY, format!("{e}\n"))
            }
        }
    }

    async fn try_forward(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        tracker: &TaskTracker,
    ) -> Result<Response<BoxBody>, Error> {
        let upgrade = is_upgrade(req.headers());
        let downstream = upgrade.then(|| hyper::upgrade::on(&mut req));
        rewrite_request(&mut req, &self.target.cluster, peer, upgrade)?;
        debug!(
            method = %req.method(),
            url = format!("https://{}{}", self.target.cluster, req.uri()),
            "forwarding request"
        );

        let mut resp = self.send(req).await?;
        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(downstream) = downstream {
                let upstream = hyper::upgrade::on(&mut resp);
                // The upstream connection now belongs to the upgraded stream.
                self.sender.lock().await.take();
                tracker.spawn(splice(downstream, upstream, self.cancel.clone()).in_current_span());
            }
            return Ok(resp.map(|_| empty()));
        }
        strip_hop_by_hop(resp.headers_mut());
        Ok(resp.map(|body| body.boxed()))
    }

    async fn send(&self, req: Request<Incoming>) -> Result<Response<Incoming>, Error> {
        let mut slot = self.sender.lock().await;
        let reusable = match slot.take() {
            Some(mut sender) => sender.ready().await.is_ok().then_some(sender),
            None => None,
        };
        let mut sender = match reusable {
            Some(sender) => sender,
            None => self.connect().await?,
        };
        let resp = sender.send_request(req).await;
        *slot = Some(sender);
        Ok(resp?)
    }

    async fn connect(&self) -> Result<SendRequest<Incoming>, Error> {
        let cluster = &self.target.cluster;
        debug!(cluster, "opening tunnel");
        let tunnel = self.target.dialer.open(self.cancel.child_token()).await?;
        let conn = tunnel
            .dial("tcp", &format!("{cluster}:{API_SERVER_PORT}"))
            .await?;
        let tls = self
            .target
            .tls
            .connect(conn)
            .await
            .map_err(|e| Error::UpstreamHandshake(cluster.clone(), e))?;
        Ok(http1_client(tls, tunnel, cluster.clone()).await?)
    }
}

async fn splice(downstream: OnUpgrade, upstream: OnUpgrade, cancel: CancellationToken) {
    let (downstream, upstream) = match tokio::try_join!(downstream, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("upgrade failed: {e}");
            return;
        }
    };
    let mut downstream = TokioIo::new(downstream);
    let mut upstream = TokioIo::new(upstream);
    tokio::select! {
        res = tokio::io::copy_bidirectional(&mut downstream, &mut upstream) => match res {
            Ok((sent, received)) => debug!(sent, received, "upgraded stream closed"),
            Err(e) => debug!("upgraded stream failed: {e}"),
        },
        _ = cancel.cancelled() => debug!("upgraded stream cancelled"),
    }
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// rewrite_request points `req` at the cluster: origin-form URI, `Host` set to the cluster name,
/// hop-by-hop headers dropped unless upgrading, and the peer appended to `X-Forwarded-For`.
fn rewrite_request<B>(
    req: &mut Request<B>,
    cluster: &str,
    peer: SocketAddr,
    upgrade: bool,
) -> Result<(), Error> {
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    *req.uri_mut() = Uri::builder().path_and_query(path).build()?;

    let headers = req.headers_mut();
    if !upgrade {
        strip_hop_by_hop(headers);
    }
    headers.insert(HOST, HeaderValue::from_str(cluster)?);
    let forwarded = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{prior}, {}", peer.ip()),
        None => peer.ip().to_string(),
    };
    headers.insert(X_FORWARDED_FOR.clone(), HeaderValue::from_str(&forwarded)?);
    Ok(())
}

struct Activity {
    in_flight: AtomicUsize,
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Activity {
            in_flight: AtomicUsize::new(0),
            last: Mutex::new(Instant::now()),
        }
    }

    fn begin(self: &Arc<Self>) -> ActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ActivityGuard(self.clone())
    }

    fn idle_for(&self) -> Duration {
        self.last.lock().map(|l| l.elapsed()).unwrap_or_default()
    }

    fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 && self.idle_for() >= idle_timeout
    }

    /// Time until the connection could be idle for `idle_timeout`.
    fn idle_remaining(&self, idle_timeout: Duration) -> Duration {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            idle_timeout
        } else {
            idle_timeout.saturating_sub(self.idle_for())
        }
    }
}

/// ActivityGuard marks a request in flight until its response body is done.
struct ActivityGuard(Arc<Activity>);

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if let Ok(mut last) = self.0.last.lock() {
            *last = Instant::now();
        }
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct GuardedBody {
    inner: BoxBody,
    _guard: ActivityGuard,
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::test_helpers::apiserver::ApiServerStub;
    use crate::test_helpers::tunnel::FakeDialer;
    use crate::test_helpers::{self, Backends};

    struct Harness {
        addr: SocketAddr,
        dialer: FakeDialer,
        cancel: CancellationToken,
        done: tokio::task::JoinHandle<()>,
    }

    async fn start(backends: Backends, idle_timeout: Duration) -> Harness {
        test_helpers::initialize_telemetry();
        let dialer = FakeDialer::new(backends);
        let proxy = ReverseProxy::bind(
            "127.0.0.1:0".parse().unwrap(),
            tls::self_signed_server_config(&[ALPN_HTTP1]).unwrap(),
            "cluster-a".to_string(),
            Arc::new(dialer.clone()),
        )
        .await
        .unwrap()
        .with_idle_timeout(idle_timeout)
        .with_drain_timeout(Duration::from_secs(1));
        let addr = proxy.local_addr();
        let cancel = CancellationToken::new();
        let done = tokio::spawn(proxy.run(cancel.clone()));
        Harness {
            addr,
            dialer,
            cancel,
            done,
        }
    }

    async fn client(addr: SocketAddr) -> SendRequest<BoxBody> {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let tls = tls::insecure_client_config("localhost", &[ALPN_HTTP1])
            .unwrap()
            .connect(tcp)
            .await
            .unwrap();
        http1_client(tls, (), "test".to_string()).await.unwrap()
    }

    async fn get(sender: &mut SendRequest<BoxBody>, path: &str) -> (StatusCode, String) {
        let req = Request::get(path)
            .header(HOST, "localhost")
            .header("proxy-authorization", "Basic Zm9v")
            .header(CONNECTION, "keep-alive")
            .body(empty())
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn forwards_path_and_host() {
        let stub = ApiServerStub::new();
        let backends = Backends::default();
        backends.serve("cluster-a:443", stub.clone());
        let h = start(backends, Duration::from_secs(90)).await;

        let mut sender = client(h.addr).await;
        assert_eq!(
            get(&mut sender, "/foo?x=1").await,
            (StatusCode::OK, "/foo?x=1".to_string())
        );
        assert_eq!(
            get(&mut sender, "/api/v1/namespaces").await,
            (StatusCode::OK, "/api/v1/namespaces".to_string())
        );
        // Keep-alive requests share one tunnel.
        assert_eq!(h.dialer.opened(), 1);
        assert_eq!(h.dialer.dials(), vec!["cluster-a:443"]);

        let seen = stub.requests();
        assert_eq!(seen[0].host.as_deref(), Some("cluster-a"));
        assert_eq!(seen[0].path, "/foo?x=1");
        assert_eq!(seen[0].forwarded_for.as_deref(), Some("127.0.0.1"));
        assert_eq!(seen[0].connection, None);

        // A second inbound connection gets its own tunnel.
        let mut other = client(h.addr).await;
        get(&mut other, "/healthz").await;
        assert_eq!(h.dialer.opened(), 2);
    }

    #[tokio::test]
    async fn dial_errors_are_bad_gateway() {
        let backends = Backends::default();
        backends.fail("cluster-a:443", "connection refused");
        let h = start(backends, Duration::from_secs(90)).await;

        for _ in 0..2 {
            let mut sender = client(h.addr).await;
            let (status, body) = get(&mut sender, "/version").await;
            assert_eq!(status, StatusCode::BAD_GATEWAY);
            assert!(body.contains("connection refused"), "{body}");
        }
    }

    #[tokio::test]
    async fn upgrades_are_spliced() {
        let backends = Backends::default();
        backends.serve("cluster-a:443", ApiServerStub::new());
        let h = start(backends, Duration::from_secs(90)).await;

        let mut sender = client(h.addr).await;
        let req = Request::post("/api/v1/namespaces/default/pods/p/exec?command=sh")
            .header(HOST, "localhost")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "SPDY/3.1")
            .body(empty())
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(resp.headers().get(UPGRADE).unwrap(), "SPDY/3.1");

        let upgraded = hyper::upgrade::on(resp).await.unwrap();
        let mut io = TokioIo::new(upgraded);
        io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn idle_connections_are_closed() {
        let backends = Backends::default();
        backends.serve("cluster-a:443", ApiServerStub::new());
        let h = start(backends, Duration::from_millis(200)).await;

        let mut sender = client(h.addr).await;
        get(&mut sender, "/healthz").await;
        let mut closed = false;
        for _ in 0..100 {
            if sender.is_closed() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(closed, "idle connection was not closed");
    }

    #[tokio::test]
    async fn shutdown_drains() {
        let backends = Backends::default();
        backends.serve("cluster-a:443", ApiServerStub::new());
        let h = start(backends, Duration::from_secs(90)).await;

        let mut sender = client(h.addr).await;
        get(&mut sender, "/healthz").await;
        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.done)
            .await
            .expect("proxy did not shut down")
            .unwrap();
        assert!(TcpStream::connect(h.addr).await.is_err());
    }

    #[test]
    fn hop_by_hop_headers() {
        let mut req = Request::get("https://localhost:8443/api?watch=1")
            .header(CONNECTION, "keep-alive, x-trace")
            .header("x-trace", "1")
            .header("te", "trailers")
            .header("x-forwarded-for", "10.0.0.1")
            .header("authorization", "Bearer t")
            .body(())
            .unwrap();
        rewrite_request(&mut req, "cluster-a", "127.0.0.1:5000".parse().unwrap(), false).unwrap();
        assert_eq!(req.uri(), "/api?watch=1");
        let h = req.headers();
        assert_eq!(h.get(HOST).unwrap(), "cluster-a");
        assert_eq!(h.get("x-forwarded-for").unwrap(), "10.0.0.1, 127.0.0.1");
        assert_eq!(h.get("authorization").unwrap(), "Bearer t");
        assert!(h.get(CONNECTION).is_none());
        assert!(h.get("x-trace").is_none());
        assert!(h.get("te").is_none());
    }

    #[test]
    fn upgrade_keeps_connection_headers() {
        let mut req = Request::get("/exec")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade(req.headers()));
        rewrite_request(&mut req, "cluster-a", "127.0.0.1:5000".parse().unwrap(), true).unwrap();
        assert_eq!(req.headers().get(UPGRADE).unwrap(), "websocket");
        assert_eq!(req.headers().get(CONNECTION).unwrap(), "Upgrade");
    }
}
