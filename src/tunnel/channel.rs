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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::body::Incoming;
use hyper::client::conn::http2;
use http::uri::{Authority, Scheme};
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::tls::ClientTls;
use crate::tunnel::{Error, ProxyEndpoint};

/// GrpcChannel is a single mTLS HTTP/2 connection to the proxy server, usable as a tonic
/// transport. Each tunnel owns one; the connection task stops when `cancel` fires.
#[derive(Clone, Debug)]
pub(super) struct GrpcChannel {
    authority: Authority,
    sender: http2::SendRequest<tonic::body::Body>,
}

impl GrpcChannel {
    pub async fn connect(
        endpoint: &ProxyEndpoint,
        tls: &ClientTls,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let addr = endpoint.authority();
        let authority: Authority = addr
            .parse()
            .map_err(|_| Error::InvalidAddress(addr.clone()))?;

        let handshake = async {
            let tcp = TcpStream::connect(&addr)
                .await
                .map_err(|e| Error::Connect(addr.clone(), e))?;
            tcp.set_nodelay(true)
                .map_err(|e| Error::Connect(addr.clone(), e))?;
            let tls = tls
                .connect(tcp)
                .await
                .map_err(|e| Error::Connect(addr.clone(), e))?;
            trace!(%addr, "tls established with proxy server");

            let conn = http2::Builder::new(TokioExecutor::new())
                .timer(TokioTimer::new())
                .keep_alive_interval(Duration::from_secs(30))
                .keep_alive_timeout(Duration::from_secs(10))
                .handshake(TokioIo::new(tls))
                .await?;
            Ok::<_, Error>(conn)
        };
        let (sender, conn) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = handshake => res?,
        };
        tokio::spawn(async move {
            tokio::select! {
                res = conn => {
                    if let Err(e) = res {
                        debug!(%addr, "proxy server connection ended: {e}");
                    }
                }
                _ = cancel.cancelled() => trace!(%addr, "proxy server connection cancelled"),
            }
        });
        Ok(GrpcChannel { authority, sender })
    }
}

impl tower::Service<Request<tonic::body::Body>> for GrpcChannel {
    type Response = Response<Incoming>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.sender.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<tonic::body::Body>) -> Self::Future {
        // tonic only fills in the path; h2 needs the full target.
        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(Scheme::HTTPS);
        parts.authority = Some(self.authority.clone());
        if let Ok(uri) = Uri::from_parts(parts) {
            *req.uri_mut() = uri;
        }
        let fut = self.sender.send_request(req);
        Box::pin(fut)
    }
}
