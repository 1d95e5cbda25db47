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

//! Client side of the konnectivity protocol. A [`Tunnel`] is a single gRPC stream to the
//! cluster-proxy server that carries exactly one TCP connection into a managed cluster.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

mod channel;
mod grpc;
mod stream;

pub use grpc::{GrpcTunnel, KonnectivityDialer};
pub use stream::TunnelStream;

#[allow(clippy::all)]
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/_.rs"));
}

/// Port of managed cluster API servers as addressed through the tunnel.
pub const API_SERVER_PORT: u16 = 443;

/// ProxyEndpoint is where the proxy server's gRPC entry point is reached.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    /// Name verified against the proxy server certificate and sent as SNI.
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

impl ProxyEndpoint {
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

/// Tunnel carries one logical connection. Implementations accept a single `dial`; the
/// connection it returns keeps the tunnel alive until both are dropped.
#[async_trait::async_trait]
pub trait Tunnel: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedConn, Error>;

    /// Closes the underlying stream. Connections dialed through the tunnel fail afterwards.
    fn close(&self);
}

/// TunnelDialer opens fresh tunnels. The tunnel is torn down when `cancel` fires.
#[async_trait::async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn open(&self, cancel: CancellationToken) -> Result<Box<dyn Tunnel>, Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid proxy server address {0:?}")]
    InvalidAddress(String),
    #[error("connecting to proxy server {0}: {1}")]
    Connect(String, #[source] io::Error),
    #[error("http2 handshake with proxy server: {0}")]
    Handshake(#[from] hyper::Error),
    #[error("proxy stream: {0}")]
    Stream(#[from] tonic::Status),
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),
    #[error("dial {address}: {reason}")]
    DialFailed { address: String, reason: String },
    #[error("dial {0}: dial timeout")]
    DialTimeout(String),
    #[error("tunnel already used, tunnels carry a single connection")]
    AlreadyUsed,
    #[error("tunnel cancelled")]
    Cancelled,
    #[error("tunnel closed")]
    Closed,
}
