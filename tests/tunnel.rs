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

use std::time::Duration;

use http_body_util::BodyExt;
use hyper::header::HOST;
use hyper::{Request, StatusCode};
use tokio_util::sync::CancellationToken;

use clusterproxy::hyper_util::{empty, http1_client};
use clusterproxy::test_helpers::apiserver::ApiServerStub;
use clusterproxy::test_helpers::konnectivity::FakeProxyServer;
use clusterproxy::test_helpers::{self, Backends, TestPki};
use clusterproxy::tls::{self, ALPN_HTTP1};
use clusterproxy::tunnel::{self, KonnectivityDialer, ProxyEndpoint, TunnelDialer};

#[ctor::ctor]
fn install_crypto_provider() {
    tls::install_default_provider();
}

struct Setup {
    pki: TestPki,
    server: FakeProxyServer,
    dialer: KonnectivityDialer,
}

async fn setup(backends: Backends, dial_timeout: Duration) -> Setup {
    test_helpers::initialize_telemetry();
    let pki = TestPki::generate(&["127.0.0.1"]);
    let server = FakeProxyServer::spawn(&pki, backends).await;
    let endpoint = server.endpoint();
    let tls = pki.bundle().tunnel_tls(&endpoint).unwrap();
    let dialer = KonnectivityDialer::new(endpoint, tls, dial_timeout);
    Setup {
        pki,
        server,
        dialer,
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn https_request_through_tunnel() {
    let stub = ApiServerStub::new();
    let backends = Backends::default();
    backends.serve("cluster-a:443", stub.clone());
    let s = setup(backends, Duration::from_secs(5)).await;

    let tunnel = s.dialer.open(CancellationToken::new()).await.unwrap();
    let conn = tunnel.dial("tcp", "cluster-a:443").await.unwrap();
    let tls = tls::insecure_client_config("cluster-a", &[ALPN_HTTP1])
        .unwrap()
        .connect(conn)
        .await
        .unwrap();
    let mut sender = http1_client(tls, tunnel, "cluster-a".to_string())
        .await
        .unwrap();

    for path in ["/healthz", "/api?limit=1"] {
        let req = Request::get(path)
            .header(HOST, "cluster-a")
            .body(empty())
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let expected = if path == "/healthz" { "ok" } else { path };
        assert_eq!(body, expected.as_bytes());
    }

    assert_eq!(s.server.dials(), vec!["cluster-a:443"]);
    assert_eq!(s.server.streams(), 1);
    assert_eq!(
        stub.requests()
            .iter()
            .map(|r| r.path.as_str())
            .collect::<Vec<_>>(),
        vec!["/healthz", "/api?limit=1"]
    );
}

#[tokio::test]
async fn tunnel_is_single_use() {
    let backends = Backends::default();
    backends.serve("cluster-a:443", ApiServerStub::new());
    let s = setup(backends, Duration::from_secs(5)).await;

    let tunnel = s.dialer.open(CancellationToken::new()).await.unwrap();
    let _conn = tunnel.dial("tcp", "cluster-a:443").await.unwrap();
    assert!(matches!(
        tunnel.dial("tcp", "cluster-a:443").await,
        Err(tunnel::Error::AlreadyUsed)
    ));

    let other = s.dialer.open(CancellationToken::new()).await.unwrap();
    assert!(matches!(
        other.dial("udp", "cluster-a:443").await,
        Err(tunnel::Error::UnsupportedNetwork(_))
    ));
}

#[tokio::test]
async fn dial_error_from_proxy_server() {
    let backends = Backends::default();
    backends.fail("cluster-b:443", "connection refused");
    let s = setup(backends, Duration::from_secs(5)).await;

    let tunnel = s.dialer.open(CancellationToken::new()).await.unwrap();
    let err = match tunnel.dial("tcp", "cluster-b:443").await {
        Ok(_) => panic!("dial should fail"),
        Err(e) => e,
    };
    assert!(
        matches!(&err, tunnel::Error::DialFailed { address, reason }
            if address == "cluster-b:443" && reason == "connection refused"),
        "{err}"
    );
}

#[tokio::test]
async fn dial_timeout_sends_dial_close() {
    let backends = Backends::default();
    backends.unresponsive("cluster-c:443");
    let s = setup(backends, Duration::from_millis(200)).await;

    let tunnel = s.dialer.open(CancellationToken::new()).await.unwrap();
    let err = match tunnel.dial("tcp", "cluster-c:443").await {
        Ok(_) => panic!("dial should time out"),
        Err(e) => e,
    };
    assert!(err.to_string().contains("dial timeout"), "{err}");
    assert!(wait_for(|| s.server.dial_closes().len() == 1).await);
}

#[tokio::test]
async fn cancelled_tunnel_fails_dials() {
    let backends = Backends::default();
    backends.unresponsive("cluster-c:443");
    let s = setup(backends, Duration::from_secs(30)).await;

    let cancel = CancellationToken::new();
    let tunnel = s.dialer.open(cancel.clone()).await.unwrap();
    let dial = tokio::spawn(async move { tunnel.dial("tcp", "cluster-c:443").await.err() });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let err = tokio::time::timeout(Duration::from_secs(5), dial)
        .await
        .expect("dial did not return after cancellation")
        .unwrap();
    assert!(matches!(err, Some(tunnel::Error::Cancelled)), "{err:?}");
}

#[tokio::test]
async fn client_certificate_is_required() {
    let backends = Backends::default();
    backends.serve("cluster-a:443", ApiServerStub::new());
    let s = setup(backends, Duration::from_secs(5)).await;

    // The proxy server only accepts client certificates issued by its CA.
    let stranger = TestPki::generate(&["127.0.0.1"]);
    let mut bundle = s.pki.bundle();
    bundle.client_cert = stranger.client_cert.into_bytes();
    bundle.client_key = stranger.client_key.into_bytes();
    let endpoint = s.server.endpoint();
    let tls = bundle.tunnel_tls(&endpoint).unwrap();
    let dialer = KonnectivityDialer::new(endpoint, tls, Duration::from_secs(5));
    let res = match dialer.open(CancellationToken::new()).await {
        Ok(tunnel) => tunnel.dial("tcp", "cluster-a:443").await.map(|_| ()),
        Err(e) => Err(e),
    };
    assert!(res.is_err());
    assert!(s.server.dials().is_empty());
}

#[tokio::test]
async fn cancellation_interrupts_open() {
    test_helpers::initialize_telemetry();
    let pki = TestPki::generate(&["127.0.0.1"]);
    // Accepts TCP but never answers the TLS handshake.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let held = tokio::spawn(async move {
        let mut conns = Vec::new();
        while let Ok((conn, _)) = listener.accept().await {
            conns.push(conn);
        }
    });
    let endpoint = ProxyEndpoint {
        host: addr.ip().to_string(),
        port: addr.port(),
        server_name: addr.ip().to_string(),
        insecure_skip_verify: false,
    };
    let tls = pki.bundle().tunnel_tls(&endpoint).unwrap();
    let dialer = KonnectivityDialer::new(endpoint, tls, Duration::from_secs(5));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let res = tokio::time::timeout(Duration::from_secs(2), dialer.open(cancel))
        .await
        .expect("open ignored an already cancelled token");
    assert!(matches!(res, Err(tunnel::Error::Cancelled)));

    let cancel = CancellationToken::new();
    let stalled = {
        let cancel = cancel.clone();
        tokio::spawn(async move { dialer.open(cancel).await.err() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let err = tokio::time::timeout(Duration::from_secs(2), stalled)
        .await
        .expect("open did not return after cancellation")
        .unwrap();
    assert!(matches!(err, Some(tunnel::Error::Cancelled)), "{err:?}");
    held.abort();
}
