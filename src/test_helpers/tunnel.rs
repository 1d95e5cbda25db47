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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

use crate::test_helpers::{Backend, Backends};
use crate::tunnel::{BoxedConn, Error, Tunnel, TunnelDialer};

/// FakeDialer hands out in-memory tunnels routed by [`Backends`]. An unresponsive backend
/// fails the dial with a dial timeout right away.
#[derive(Clone, Default)]
pub struct FakeDialer {
    backends: Backends,
    opened: Arc<AtomicUsize>,
    dials: Arc<std::sync::Mutex<Vec<String>>>,
}

impl FakeDialer {
    pub fn new(backends: Backends) -> Self {
        FakeDialer {
            backends,
            ..Default::default()
        }
    }

    /// Number of tunnels opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Addresses dialed so far, in order.
    pub fn dials(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TunnelDialer for FakeDialer {
    async fn open(&self, cancel: CancellationToken) -> Result<Box<dyn Tunnel>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTunnel {
            dialer: self.clone(),
            used: AtomicBool::new(false),
            cancel,
        }))
    }
}

struct FakeTunnel {
    dialer: FakeDialer,
    used: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl Tunnel for FakeTunnel {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedConn, Error> {
        if network != "tcp" {
            return Err(Error::UnsupportedNetwork(network.to_string()));
        }
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyUsed);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.dialer.dials.lock().unwrap().push(address.to_string());
        match self.dialer.backends.get(address) {
            Backend::Serve(stub) => {
                let (client, server) = tokio::io::duplex(64 * 1024);
                stub.serve(server);
                Ok(Box::new(client))
            }
            Backend::Fail(reason) => Err(Error::DialFailed {
                address: address.to_string(),
                reason,
            }),
            Backend::Unresponsive => Err(Error::DialTimeout(address.to_string())),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
