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

use rustls::crypto::CryptoProvider;
use tracing::debug;

/// Both ends we talk to (the konnectivity proxy server and managed cluster API servers) are Go
/// servers that negotiate TLS 1.3 where possible; 1.2 stays enabled as the floor.
pub(super) static TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

// All crypto MUST be done via the below providers.

#[cfg(feature = "tls-ring")]
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// install_default_provider registers our provider as the process default. The kube client builds
/// its own rustls configuration and relies on the default being unambiguous.
pub fn install_default_provider() {
    if Arc::unwrap_or_clone(provider()).install_default().is_err() {
        debug!("crypto provider already installed");
    }
}
