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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::hub::{self, Hub};

pub const PROXY_SERVER_SELECTOR: &str =
    "proxy.open-cluster-management.io/component-name=proxy-server";
/// Port of the gRPC entry point inside proxy-server pods.
pub const PROXY_SERVER_POD_PORT: u16 = 8090;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no proxy-server pods found in namespace {0}")]
    NoPods(String),
    #[error("binding {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),
    #[error(transparent)]
    Hub(#[from] hub::Error),
}

/// Provisioner exposes the proxy-server pods of the add-on on a local port.
pub struct Provisioner {
    hub: Arc<dyn Hub>,
    namespace: String,
    pod_port: u16,
}

/// EntryPoint is a listening port-forward. Dropping it, or calling `close`, stops accepting and
/// tears down forwarded connections.
pub struct EntryPoint {
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl EntryPoint {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn close(self) {
        drop(self)
    }
}

impl Drop for EntryPoint {
    fn drop(&mut self) {
        debug!(address = %self.addr, "closing entry point");
        self.cancel.cancel();
    }
}

struct RoundRobin {
    hub: Arc<dyn Hub>,
    namespace: String,
    next: AtomicUsize,
    last_good: Mutex<Vec<String>>,
}

impl RoundRobin {
    async fn pods(&self) -> Result<Vec<String>, Error> {
        let mut pods = self
            .hub
            .pods(&self.namespace, PROXY_SERVER_SELECTOR)
            .await?;
        pods.sort();
        Ok(pods)
    }

    /// Next pod in turn, from a fresh listing when the hub answers and the last good listing
    /// otherwise.
    async fn next_pod(&self) -> Result<String, Error> {
        let pods = match self.pods().await {
            Ok(pods) if !pods.is_empty() => {
                if let Ok(mut last) = self.last_good.lock() {
                    *last = pods.clone();
                }
                pods
            }
            res => {
                if let Err(e) = res {
                    warn!(namespace = self.namespace, "listing proxy-server pods failed: {e}");
                }
                self.last_good
                    .lock()
                    .map(|l| l.clone())
                    .unwrap_or_default()
            }
        };
        if pods.is_empty() {
            return Err(Error::NoPods(self.namespace.clone()));
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(pods[i % pods.len()].clone())
    }
}

impl Provisioner {
    pub fn new(hub: Arc<dyn Hub>, namespace: String) -> Self {
        Provisioner {
            hub,
            namespace,
            pod_port: PROXY_SERVER_POD_PORT,
        }
    }

    /// listen binds `addr` and forwards every accepted connection to the next proxy-server pod.
    /// Fails fast when the add-on has no running proxy-server pod.
    pub async fn listen(&self, addr: SocketAddr) -> Result<EntryPoint, Error> {
        let rr = Arc::new(RoundRobin {
            hub: self.hub.clone(),
            namespace: self.namespace.clone(),
            next: AtomicUsize::new(0),
            last_good: Mutex::new(Vec::new()),
        });
        let pods = rr.pods().await?;
        if pods.is_empty() {
            return Err(Error::NoPods(self.namespace.clone()));
        }
        if let Ok(mut last) = rr.last_good.lock() {
            *last = pods;
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Bind(addr, e))?;
        let addr = listener.local_addr().map_err(|e| Error::Bind(addr, e))?;
        let cancel = CancellationToken::new();
        info!(address = %addr, namespace = self.namespace, "port-forwarding to proxy-server pods");

        let accept_cancel = cancel.clone();
        let pod_port = self.pod_port;
        tokio::spawn(async move {
            loop {
                let (conn, peer) = tokio::select! {
                    res = listener.accept() => match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("entry point accept failed: {e}");
                            continue;
                        }
                    },
                    _ = accept_cancel.cancelled() => break,
                };
                let rr = rr.clone();
                let cancel = accept_cancel.clone();
                tokio::spawn(
                    async move {
                        tokio::select! {
                            _ = forward(conn, &rr, pod_port) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                    .instrument(info_span!("entrypoint", %peer)),
                );
            }
            debug!(address = %addr, "entry point stopped");
        });

        Ok(EntryPoint { addr, cancel })
    }
}

async fn forward(mut conn: TcpStream, rr: &RoundRobin, port: u16) {
    let pod = match rr.next_pod().await {
        Ok(pod) => pod,
        Err(e) => {
            warn!("no proxy-server pod to forward to: {e}");
            return;
        }
    };
    let mut upstream = match rr.hub.port_forward(&rr.namespace, &pod, port).await {
        Ok(s) => s,
        Err(e) => {
            warn!(pod, "port-forward failed: {e}");
            return;
        }
    };
    debug!(pod, "forwarding connection");
    match tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
        Ok((sent, received)) => debug!(pod, sent, received, "forwarded connection closed"),
        Err(e) => debug!(pod, "forwarded connection failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::test_helpers::hub::FakeHub;

    async fn read_banner(addr: SocketAddr) -> String {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let mut banner = String::new();
        conn.read_to_string(&mut banner).await.unwrap();
        banner
    }

    #[tokio::test]
    async fn round_robin_across_pods() {
        let hub = Arc::new(FakeHub::default());
        hub.set_pods("proxy-ns", &["proxy-server-b", "proxy-server-a"]);
        let ep = Provisioner::new(hub.clone(), "proxy-ns".to_string())
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(read_banner(ep.addr()).await);
        }
        assert_eq!(
            seen,
            vec!["proxy-server-a:8090", "proxy-server-b:8090", "proxy-server-a:8090"]
        );
    }

    #[tokio::test]
    async fn falls_back_to_last_listing() {
        let hub = Arc::new(FakeHub::default());
        hub.set_pods("proxy-ns", &["proxy-server-a"]);
        let ep = Provisioner::new(hub.clone(), "proxy-ns".to_string())
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        hub.fail_all("hub unreachable");
        assert_eq!(read_banner(ep.addr()).await, "proxy-server-a:8090");
    }

    #[tokio::test]
    async fn no_pods_fails_fast() {
        let hub = Arc::new(FakeHub::default());
        let err = Provisioner::new(hub, "proxy-ns".to_string())
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "no proxy-server pods found in namespace proxy-ns");
    }

    #[tokio::test]
    async fn close_stops_listening() {
        let hub = Arc::new(FakeHub::default());
        hub.set_pods("proxy-ns", &["proxy-server-a"]);
        let ep = Provisioner::new(hub, "proxy-ns".to_string())
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = ep.addr();
        ep.close();
        // The listener is dropped by the accept task once it observes cancellation.
        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(refused);
    }
}
