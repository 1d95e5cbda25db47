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

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::tls::ClientTls;
use crate::tunnel::channel::GrpcChannel;
use crate::tunnel::proto::proxy_service_client::ProxyServiceClient;
use crate::tunnel::proto::{
    CloseDial, CloseRequest, Data, DialRequest, Packet, PacketType, packet,
};
use crate::tunnel::stream::TunnelStream;
use crate::tunnel::{BoxedConn, Error, ProxyEndpoint, Tunnel, TunnelDialer};

// Packets queued towards the proxy server before writers see backpressure.
const OUTBOUND_BUFFER: usize = 16;
// Data packets from the proxy server buffered ahead of the reader.
const INBOUND_BUFFER: usize = 16;

/// KonnectivityDialer opens one mTLS gRPC connection per tunnel to a proxy server.
#[derive(Clone, Debug)]
pub struct KonnectivityDialer {
    endpoint: ProxyEndpoint,
    tls: ClientTls,
    dial_timeout: Duration,
}

impl KonnectivityDialer {
    pub fn new(endpoint: ProxyEndpoint, tls: ClientTls, dial_timeout: Duration) -> Self {
        KonnectivityDialer {
            endpoint,
            tls,
            dial_timeout,
        }
    }
}

#[async_trait::async_trait]
impl TunnelDialer for KonnectivityDialer {
    async fn open(&self, cancel: CancellationToken) -> Result<Box<dyn Tunnel>, Error> {
        let tunnel =
            GrpcTunnel::connect(&self.endpoint, &self.tls, self.dial_timeout, cancel).await?;
        Ok(Box::new(tunnel))
    }
}

struct PendingDial {
    random: i64,
    result: oneshot::Sender<Result<i64, Error>>,
    data: mpsc::Sender<Bytes>,
}

struct ActiveConn {
    connect_id: i64,
    data: mpsc::Sender<Bytes>,
}

#[derive(Default)]
struct State {
    used: bool,
    pending: Option<PendingDial>,
    active: Option<ActiveConn>,
}

pub(super) struct Inner {
    state: Arc<Mutex<State>>,
    outbound: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    dial_timeout: Duration,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// GrpcTunnel is one `ProxyService/Proxy` stream. It carries a single dialed connection; the
/// stream is closed when the tunnel and its connection are both dropped, or `close` is called,
/// or the creation token is cancelled.
pub struct GrpcTunnel {
    inner: Arc<Inner>,
}

impl GrpcTunnel {
    pub async fn connect(
        endpoint: &ProxyEndpoint,
        tls: &ClientTls,
        dial_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<GrpcTunnel, Error> {
        let cancel = cancel.child_token();
        let channel = GrpcChannel::connect(endpoint, tls, cancel.clone()).await?;
        let (outbound, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let state = Arc::new(Mutex::new(State::default()));

        let reader = Reader {
            state: state.clone(),
            outbound: outbound.clone(),
        };
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut client = ProxyServiceClient::new(channel);
            let res = tokio::select! {
                res = async {
                    // Proxy servers may hold response headers until the first dial arrives,
                    // so the stream is opened here rather than in `connect`.
                    let inbound = client.proxy(ReceiverStream::new(rx)).await?.into_inner();
                    reader.run(inbound).await
                } => res,
                _ = task_cancel.cancelled() => Err(Error::Cancelled),
            };
            match &res {
                Ok(()) | Err(Error::Cancelled) => trace!("tunnel stream finished"),
                Err(e) => debug!("tunnel stream failed: {e}"),
            }
            reader.shutdown(res.err().unwrap_or(Error::Closed));
            task_cancel.cancel();
        });

        Ok(GrpcTunnel {
            inner: Arc::new(Inner {
                state,
                outbound,
                cancel,
                dial_timeout,
            }),
        })
    }
}

#[async_trait::async_trait]
impl Tunnel for GrpcTunnel {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedConn, Error> {
        if network != "tcp" {
            return Err(Error::UnsupportedNetwork(network.to_string()));
        }
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let random: i64 = rand::random();
        let (result, rx) = oneshot::channel();
        let (data, data_rx) = mpsc::channel(INBOUND_BUFFER);
        {
            let mut state = inner.state.lock().map_err(|_| Error::Closed)?;
            if state.used {
                return Err(Error::AlreadyUsed);
            }
            state.used = true;
            state.pending = Some(PendingDial {
                random,
                result,
                data,
            });
        }

        debug!(%address, random, "dialing through tunnel");
        let req = Packet {
            r#type: PacketType::DialReq as i32,
            payload: Some(packet::Payload::DialRequest(DialRequest {
                protocol: network.to_string(),
                address: address.to_string(),
                random,
            })),
        };
        if inner.outbound.send(req).await.is_err() {
            return Err(Error::Closed);
        }

        let connect_id = tokio::select! {
            res = rx => res.unwrap_or(Err(Error::Closed)).map_err(|e| match e {
                Error::DialFailed { reason, .. } => Error::DialFailed {
                    address: address.to_string(),
                    reason,
                },
                e => e,
            })?,
            _ = tokio::time::sleep(inner.dial_timeout) => {
                if let Ok(mut state) = inner.state.lock() {
                    state.pending = None;
                }
                let cls = Packet {
                    r#type: PacketType::DialCls as i32,
                    payload: Some(packet::Payload::CloseDial(CloseDial { random })),
                };
                let _ = inner.outbound.try_send(cls);
                debug!(%address, timeout = ?inner.dial_timeout, "dial timed out");
                return Err(Error::DialTimeout(address.to_string()));
            }
            _ = inner.cancel.cancelled() => return Err(Error::Cancelled),
        };
        debug!(%address, connect_id, "tunnel connection established");

        Ok(Box::new(TunnelStream::new(
            connect_id,
            data_rx,
            inner.outbound.clone(),
            self.inner.clone(),
        )))
    }

    fn close(&self) {
        self.inner.cancel.cancel();
    }
}

/// Reader demultiplexes packets from the proxy server onto the pending dial and the active
/// connection.
struct Reader {
    state: Arc<Mutex<State>>,
    outbound: mpsc::Sender<Packet>,
}

impl Reader {
    async fn run(&self, mut inbound: tonic::Streaming<Packet>) -> Result<(), Error> {
        while let Some(pkt) = inbound.message().await? {
            match pkt.payload {
                Some(packet::Payload::DialResponse(rsp)) => self.on_dial_response(rsp).await,
                Some(packet::Payload::Data(data)) => self.on_data(data).await,
                Some(packet::Payload::CloseResponse(rsp)) => {
                    trace!(connect_id = rsp.connect_id, "close response");
                    self.end_conn(rsp.connect_id);
                }
                Some(packet::Payload::CloseDial(cls)) => {
                    let pending = self.take_pending(cls.random);
                    if let Some(p) = pending {
                        let _ = p.result.send(Err(Error::DialFailed {
                            address: String::new(),
                            reason: "dial closed by proxy server".to_string(),
                        }));
                    }
                }
                Some(packet::Payload::Drain(_)) => debug!("proxy server is draining"),
                Some(packet::Payload::DialRequest(_)) | Some(packet::Payload::CloseRequest(_)) => {
                    warn!(packet_type = pkt.r#type, "unexpected packet from proxy server")
                }
                None => trace!(packet_type = pkt.r#type, "packet without payload"),
            }
        }
        Ok(())
    }

    fn take_pending(&self, random: i64) -> Option<PendingDial> {
        let mut state = self.state.lock().ok()?;
        if state.pending.as_ref().map(|p| p.random) == Some(random) {
            state.pending.take()
        } else {
            None
        }
    }

    async fn on_dial_response(&self, rsp: crate::tunnel::proto::DialResponse) {
        let Some(pending) = self.take_pending(rsp.random) else {
            // The dial gave up already; release the connection the server opened for it.
            if rsp.error.is_empty() {
                debug!(connect_id = rsp.connect_id, "closing connection of abandoned dial");
                let _ = self.outbound.send(close_request(rsp.connect_id)).await;
            }
            return;
        };
        if !rsp.error.is_empty() {
            let _ = pending.result.send(Err(Error::DialFailed {
                address: String::new(),
                reason: rsp.error,
            }));
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.active = Some(ActiveConn {
                connect_id: rsp.connect_id,
                data: pending.data,
            });
        }
        if pending.result.send(Ok(rsp.connect_id)).is_err() {
            // Dial was cancelled between the response and now.
            self.end_conn(rsp.connect_id);
            let _ = self.outbound.send(close_request(rsp.connect_id)).await;
        }
    }

    async fn on_data(&self, data: Data) {
        let sender = {
            let Ok(state) = self.state.lock() else { return };
            match &state.active {
                Some(a) if a.connect_id == data.connect_id => a.data.clone(),
                _ => {
                    trace!(connect_id = data.connect_id, "data for unknown connection");
                    return;
                }
            }
        };
        if !data.error.is_empty() {
            debug!(
                connect_id = data.connect_id,
                error = %data.error,
                "connection error from proxy server"
            );
            self.end_conn(data.connect_id);
            return;
        }
        if sender.send(data.data).await.is_err() {
            trace!(connect_id = data.connect_id, "reader dropped, discarding data");
        }
    }

    fn end_conn(&self, connect_id: i64) {
        if let Ok(mut state) = self.state.lock() {
            if state.active.as_ref().map(|a| a.connect_id) == Some(connect_id) {
                state.active = None;
            }
        }
    }

    /// Fails the pending dial and ends the active connection's read side.
    fn shutdown(&self, err: Error) {
        if let Ok(mut state) = self.state.lock() {
            state.active = None;
            if let Some(p) = state.pending.take() {
                let _ = p.result.send(Err(err));
            }
        }
    }
}

pub(super) fn close_request(connect_id: i64) -> Packet {
    Packet {
        r#type: PacketType::CloseReq as i32,
        payload: Some(packet::Payload::CloseRequest(CloseRequest { connect_id })),
    }
}

pub(super) fn data_packet(connect_id: i64, data: Bytes) -> Packet {
    Packet {
        r#type: PacketType::Data as i32,
        payload: Some(packet::Payload::Data(Data {
            connect_id,
            error: String::new(),
            data,
        })),
    }
}
