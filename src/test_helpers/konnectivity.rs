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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use hyper::server::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error};

use crate::test_helpers::{Backend, Backends, TestPki};
use crate::tls::ALPN_H2;
use crate::tunnel::ProxyEndpoint;
use crate::tunnel::proto::proxy_service_server::{ProxyService, ProxyServiceServer};
use crate::tunnel::proto::{
    CloseResponse, Data, DialResponse, Packet, PacketType, packet::Payload,
};

#[derive(Clone, Default)]
struct Record {
    dials: Arc<Mutex<Vec<String>>>,
    dial_closes: Arc<Mutex<Vec<i64>>>,
    streams: Arc<Mutex<usize>>,
}

/// FakeProxyServer is an in-process konnectivity proxy server: mTLS with client certificates
/// required, HTTP/2, and the `ProxyService/Proxy` stream routing dials to [`Backends`].
pub struct FakeProxyServer {
    addr: SocketAddr,
    record: Record,
    cancel: CancellationToken,
}

impl FakeProxyServer {
    /// Serves on a loopback port with the server leaf of `pki`, which must be valid for
    /// `127.0.0.1`.
    pub async fn spawn(pki: &TestPki, backends: Backends) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(pki.mtls_server_config(&[ALPN_H2]));
        let record = Record::default();
        let svc = ProxyServiceServer::new(Session {
            backends,
            record: record.clone(),
        });
        let cancel = CancellationToken::new();

        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    res = listener.accept() => match res {
                        Ok((socket, _)) => socket,
                        Err(e) => {
                            error!("fake proxy server accept failed: {e}");
                            continue;
                        }
                    },
                    _ = stop.cancelled() => return,
                };
                let acceptor = acceptor.clone();
                let svc = svc.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    let tls = match acceptor.accept(socket).await {
                        Ok(tls) => tls,
                        Err(e) => {
                            debug!("fake proxy server rejected connection: {e}");
                            return;
                        }
                    };
                    let conn = http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls), TowerToHyperService::new(svc));
                    tokio::select! {
                        res = conn => {
                            if let Err(e) = res {
                                debug!("fake proxy server connection ended: {e}");
                            }
                        }
                        _ = stop.cancelled() => {}
                    }
                });
            }
        });

        FakeProxyServer {
            addr,
            record,
            cancel,
        }
    }

    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            server_name: self.addr.ip().to_string(),
            insecure_skip_verify: false,
        }
    }

    /// Addresses of every DIAL_REQ received.
    pub fn dials(&self) -> Vec<String> {
        self.record.dials.lock().unwrap().clone()
    }

    /// `random` of every DIAL_CLS received.
    pub fn dial_closes(&self) -> Vec<i64> {
        self.record.dial_closes.lock().unwrap().clone()
    }

    /// Number of Proxy streams opened.
    pub fn streams(&self) -> usize {
        *self.record.streams.lock().unwrap()
    }
}

impl Drop for FakeProxyServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
struct Session {
    backends: Backends,
    record: Record,
}

#[tonic::async_trait]
impl ProxyService for Session {
    type ProxyStream = ReceiverStream<Result<Packet, Status>>;

    async fn proxy(
        &self,
        request: Request<Streaming<Packet>>,
    ) -> Result<Response<Self::ProxyStream>, Status> {
        *self.record.streams.lock().unwrap() += 1;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(self.clone().run(request.into_inner(), tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

type Outbound = mpsc::Sender<Result<Packet, Status>>;

impl Session {
    async fn run(self, mut inbound: Streaming<Packet>, tx: Outbound) {
        let mut conns: HashMap<i64, WriteHalf<DuplexStream>> = HashMap::new();
        let mut next_id = 0;
        while let Ok(Some(pkt)) = inbound.message().await {
            match pkt.payload {
                Some(Payload::DialRequest(req)) => {
                    self.record.dials.lock().unwrap().push(req.address.clone());
                    match self.backends.get(&req.address) {
                        Backend::Serve(stub) => {
                            next_id += 1;
                            let (client, server) = tokio::io::duplex(64 * 1024);
                            stub.serve(server);
                            let (rd, wr) = tokio::io::split(client);
                            conns.insert(next_id, wr);
                            let _ = tx.send(Ok(dial_response(req.random, next_id, ""))).await;
                            tokio::spawn(pump(next_id, rd, tx.clone()));
                        }
                        Backend::Fail(reason) => {
                            let _ = tx.send(Ok(dial_response(req.random, 0, &reason))).await;
                        }
                        Backend::Unresponsive => {}
                    }
                }
                Some(Payload::Data(data)) => {
                    if let Some(conn) = conns.get_mut(&data.connect_id) {
                        if conn.write_all(&data.data).await.is_err() {
                            conns.remove(&data.connect_id);
                        }
                    }
                }
                Some(Payload::CloseRequest(req)) => {
                    if let Some(mut conn) = conns.remove(&req.connect_id) {
                        let _ = conn.shutdown().await;
                    }
                    let _ = tx.send(Ok(close_response(req.connect_id))).await;
                }
                Some(Payload::CloseDial(cls)) => {
                    self.record.dial_closes.lock().unwrap().push(cls.random);
                }
                _ => {}
            }
        }
    }
}

// Copies backend bytes into DATA packets until the backend closes.
async fn pump(connect_id: i64, mut rd: ReadHalf<DuplexStream>, tx: Outbound) {
    let mut buf = vec![0; 16 * 1024];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let pkt = Packet {
                    r#type: PacketType::Data as i32,
                    payload: Some(Payload::Data(Data {
                        connect_id,
                        error: String::new(),
                        data: Bytes::copy_from_slice(&buf[..n]),
                    })),
                };
                if tx.send(Ok(pkt)).await.is_err() {
                    return;
                }
            }
        }
    }
    let _ = tx.send(Ok(close_response(connect_id))).await;
}

fn dial_response(random: i64, connect_id: i64, error: &str) -> Packet {
    Packet {
        r#type: PacketType::DialRsp as i32,
        payload: Some(Payload::DialResponse(DialResponse {
            error: error.to_string(),
            connect_id,
            random,
        })),
    }
}

fn close_response(connect_id: i64) -> Packet {
    Packet {
        r#type: PacketType::CloseRsp as i32,
        payload: Some(Payload::CloseResponse(CloseResponse {
            error: String::new(),
            connect_id,
        })),
    }
}
