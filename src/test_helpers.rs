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
use std::sync::{Arc, Mutex};

use crate::telemetry;

pub mod apiserver;
pub mod hub;
pub mod konnectivity;
pub mod tunnel;

pub use crate::tls::mock::TestPki;

pub fn initialize_telemetry() {
    telemetry::testing::setup_test_logging();
}

/// Backend decides what a dial to one address runs into.
#[derive(Clone)]
pub enum Backend {
    /// The dial succeeds and the connection is served by the stub.
    Serve(apiserver::ApiServerStub),
    /// The proxy server answers the dial with this error.
    Fail(String),
    /// The proxy server never answers the dial.
    Unresponsive,
}

/// Backends maps dial addresses (`<cluster>:443`) to what sits behind them. Unknown addresses
/// fail like an unresolvable host would.
#[derive(Clone, Default)]
pub struct Backends(Arc<Mutex<HashMap<String, Backend>>>);

impl Backends {
    pub fn serve(&self, address: &str, stub: apiserver::ApiServerStub) -> &Self {
        self.insert(address, Backend::Serve(stub))
    }

    pub fn fail(&self, address: &str, reason: &str) -> &Self {
        self.insert(address, Backend::Fail(reason.to_string()))
    }

    pub fn unresponsive(&self, address: &str) -> &Self {
        self.insert(address, Backend::Unresponsive)
    }

    pub fn get(&self, address: &str) -> Backend {
        self.0
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_else(|| Backend::Fail(format!("dial tcp: lookup {address}: no such host")))
    }

    fn insert(&self, address: &str, backend: Backend) -> &Self {
        self.0
            .lock()
            .unwrap()
            .insert(address.to_string(), backend);
        self
    }
}
