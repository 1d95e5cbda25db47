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

mod certificate;
mod control;
mod lib;
#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use crate::tls::certificate::*;
pub use crate::tls::control::*;
pub use crate::tls::lib::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid root certificate: {0}")]
    InvalidRootCert(String),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate: {0}")]
    CertificateParseError(String),

    #[error("private key does not match certificate")]
    KeyMismatch,

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),
}
