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

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONNECTION, HOST, HeaderName, HeaderValue, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::hyper_util::{BoxBody, empty_response, plaintext_response};
use crate::tls::{self, ALPN_HTTP1};

/// RecordedRequest is what the stub saw of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub host: Option<String>,
    /// Path and query as received.
    pub path: String,
    pub forwarded_for: Option<String>,
    pub authorization: Option<String>,
    pub connection: Option<String>,
}

/// ApiServerStub mimics a managed cluster API server behind TLS: `/healthz` answers with the
/// configured status and body, upgrade requests are switched and echoed back, and anything else
/// answers 200 with its own path and query.
#[derive(Clone)]
pub struct ApiServerStub {
    healthz: (StatusCode, String),
    tls: Arc<ServerConfig>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl Default for ApiServerStub {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiServerStub {
    pub fn new() -> Self {
        Self::with_healthz(StatusCode::OK, "ok")
    }

    pub fn with_healthz(status: StatusCode, body: &str) -> Self {
        ApiServerStub {
            healthz: (status, body.to_string()),
            tls: tls::self_signed_server_config(&[ALPN_HTTP1]).unwrap(),
            requests: Default::default(),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// serve handles one connection on a background task.
    pub fn serve<IO>(&self, io: IO)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stub = self.clone();
        tokio::spawn(async move {
            let acceptor = tokio_rustls::TlsAcceptor::from(stub.tls.clone());
            let tls = match acceptor.accept(io).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!("stub api server handshake failed: {e}");
                    return;
                }
            };
            let svc = service_fn(move |req| {
                let stub = stub.clone();
                async move { Ok::<_, Infallible>(stub.handle(req)) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), svc)
                .with_upgrades()
                .await
            {
                debug!("stub api server connection ended: {e}");
            }
        });
    }

    fn handle(&self, mut req: Request<Incoming>) -> Response<BoxBody> {
        let header = |name: HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let recorded = RecordedRequest {
            method: req.method().to_string(),
            host: header(HOST),
            path: req
                .uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_default(),
            forwarded_for: header(HeaderName::from_static("x-forwarded-for")),
            authorization: header(AUTHORIZATION),
            connection: header(CONNECTION),
        };
        self.requests.lock().unwrap().push(recorded.clone());

        if let Some(protocol) = req.headers().get(UPGRADE).cloned() {
            let upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                if let Ok(upgraded) = upgrade.await {
                    let (mut r, mut w) = tokio::io::split(TokioIo::new(upgraded));
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                }
            });
            let mut resp = empty_response(StatusCode::SWITCHING_PROTOCOLS);
            resp.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
            resp.headers_mut().insert(UPGRADE, protocol);
            return resp;
        }

        match recorded.path.as_str() {
            "/healthz" => plaintext_response(self.healthz.0, self.healthz.1.clone()),
            path => plaintext_response(StatusCode::OK, path.to_string()),
        }
    }
}
