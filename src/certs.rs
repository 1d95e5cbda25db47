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

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::ServerConfig;
use tracing::{debug, info};

use crate::config::CertFiles;
use crate::hub::{self, Hub};
use crate::tls::{self, ALPN_H2, ALPN_HTTP1, ClientTls};
use crate::tunnel::ProxyEndpoint;

pub const CA_SECRET: &str = "proxy-server-ca";
pub const SERVER_SECRET: &str = "proxy-server";
pub const CLIENT_SECRET: &str = "proxy-client";

const CA_KEY: &str = "ca.crt";
const CERT_KEY: &str = "tls.crt";
const PRIVATE_KEY: &str = "tls.key";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("getting secret {namespace}/{name}: {source}")]
    SecretGet {
        namespace: String,
        name: String,
        #[source]
        source: hub::Error,
    },
    #[error("secret {namespace}/{name} not found; is the cluster-proxy add-on installed?")]
    SecretNotFound { namespace: String, name: String },
    #[error("secret {namespace}/{name} has no {key:?} entry")]
    MissingKey {
        namespace: String,
        name: String,
        key: &'static str,
    },
    #[error("building tls config: {0}")]
    Tls(#[from] tls::Error),
}

/// CertSource says where the proxy credentials come from. Local files take precedence and
/// never touch the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertSource {
    Files(CertFiles),
    Secrets { namespace: String },
}

/// CertificateBundle holds raw PEM material for one invocation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CertificateBundle {
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
    pub server_cert: Option<Vec<u8>>,
    pub server_key: Option<Vec<u8>>,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("ca", &self.ca.len())
            .field("client_cert", &self.client_cert.len())
            .field("server_cert", &self.server_cert.as_ref().map(|c| c.len()))
            .finish_non_exhaustive()
    }
}

impl CertSource {
    pub async fn resolve(&self, hub: &dyn Hub) -> Result<CertificateBundle, Error> {
        match self {
            CertSource::Files(files) => {
                debug!(ca = %files.ca.display(), cert = %files.cert.display(), "loading proxy certificates from files");
                Ok(CertificateBundle {
                    ca: read(&files.ca).await?,
                    client_cert: read(&files.cert).await?,
                    client_key: read(&files.key).await?,
                    server_cert: None,
                    server_key: None,
                })
            }
            CertSource::Secrets { namespace } => {
                info!(%namespace, "loading proxy certificates from secrets");
                let ca = SecretData::get(hub, namespace, CA_SECRET).await?;
                let server = SecretData::get(hub, namespace, SERVER_SECRET).await?;
                let client = SecretData::get(hub, namespace, CLIENT_SECRET).await?;
                Ok(CertificateBundle {
                    ca: ca.take(CA_KEY)?,
                    client_cert: client.take(CERT_KEY)?,
                    client_key: client.take(PRIVATE_KEY)?,
                    server_cert: Some(server.take(CERT_KEY)?),
                    server_key: Some(server.take(PRIVATE_KEY)?),
                })
            }
        }
    }
}

async fn read(path: &PathBuf) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path).await.map_err(|source| Error::Read {
        path: path.clone(),
        source,
    })
}

struct SecretData {
    namespace: String,
    name: &'static str,
    data: std::collections::BTreeMap<String, k8s_openapi::ByteString>,
}

impl SecretData {
    async fn get(hub: &dyn Hub, namespace: &str, name: &'static str) -> Result<Self, Error> {
        let secret = hub
            .secret(namespace, name)
            .await
            .map_err(|source| Error::SecretGet {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| Error::SecretNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        Ok(SecretData {
            namespace: namespace.to_string(),
            name,
            data: secret.data.unwrap_or_default(),
        })
    }

    fn take(&self, key: &'static str) -> Result<Vec<u8>, Error> {
        self.data
            .get(key)
            .filter(|v| !v.0.is_empty())
            .map(|v| v.0.clone())
            .ok_or_else(|| Error::MissingKey {
                namespace: self.namespace.clone(),
                name: self.name.to_string(),
                key,
            })
    }
}

impl CertificateBundle {
    /// Client configuration for the gRPC connection to the proxy server.
    pub fn tunnel_tls(&self, endpoint: &ProxyEndpoint) -> Result<ClientTls, tls::Error> {
        if endpoint.insecure_skip_verify {
            tls::insecure_mtls_client_config(
                &self.client_cert,
                &self.client_key,
                &endpoint.server_name,
                &[ALPN_H2],
            )
        } else {
            tls::client_config(
                &self.ca,
                &self.client_cert,
                &self.client_key,
                &endpoint.server_name,
                &[ALPN_H2],
            )
        }
    }

    /// Server configuration for the local HTTPS listener. Without a server pair the listener
    /// gets a throwaway self-signed identity.
    pub fn listener_tls(&self) -> Result<Arc<ServerConfig>, tls::Error> {
        match (&self.server_cert, &self.server_key) {
            (Some(cert), Some(key)) => tls::server_config(cert, key, &[ALPN_HTTP1]),
            _ => {
                debug!("no server certificate available, generating a self-signed one");
                tls::self_signed_server_config(&[ALPN_HTTP1])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::Secret;

    use super::*;
    use crate::test_helpers::hub::FakeHub;
    use crate::tls::mock::TestPki;

    fn secret(pairs: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn hub_with_secrets(pki: &TestPki) -> FakeHub {
        let hub = FakeHub::default();
        hub.add_secret("proxy-ns", CA_SECRET, secret(&[(CA_KEY, &pki.ca_cert)]));
        hub.add_secret(
            "proxy-ns",
            SERVER_SECRET,
            secret(&[(CERT_KEY, &pki.server_cert), (PRIVATE_KEY, &pki.server_key)]),
        );
        hub.add_secret(
            "proxy-ns",
            CLIENT_SECRET,
            secret(&[(CERT_KEY, &pki.client_cert), (PRIVATE_KEY, &pki.client_key)]),
        );
        hub
    }

    #[tokio::test]
    async fn secrets_source() {
        let pki = TestPki::generate(&["127.0.0.1"]);
        let hub = hub_with_secrets(&pki);
        let bundle = CertSource::Secrets {
            namespace: "proxy-ns".to_string(),
        }
        .resolve(&hub)
        .await
        .unwrap();
        assert_eq!(bundle, pki.bundle());
    }

    #[tokio::test]
    async fn missing_secret_is_named() {
        let pki = TestPki::generate(&["127.0.0.1"]);
        let hub = hub_with_secrets(&pki);
        hub.remove_secret("proxy-ns", CLIENT_SECRET);
        let err = CertSource::Secrets {
            namespace: "proxy-ns".to_string(),
        }
        .resolve(&hub)
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SecretNotFound { .. }));
        assert!(err.to_string().contains("proxy-ns/proxy-client"), "{err}");
    }

    #[tokio::test]
    async fn missing_key_is_named() {
        let pki = TestPki::generate(&["127.0.0.1"]);
        let hub = hub_with_secrets(&pki);
        hub.add_secret(
            "proxy-ns",
            SERVER_SECRET,
            secret(&[(CERT_KEY, &pki.server_cert)]),
        );
        let err = CertSource::Secrets {
            namespace: "proxy-ns".to_string(),
        }
        .resolve(&hub)
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "secret proxy-ns/proxy-server has no \"tls.key\" entry"
        );
    }

    #[tokio::test]
    async fn files_take_precedence() {
        let pki = TestPki::generate(&["127.0.0.1"]);
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| {
            let p = dir.path().join(name);
            std::fs::write(&p, body).unwrap();
            p
        };
        let files = CertFiles {
            ca: write("ca.crt", &pki.ca_cert),
            cert: write("tls.crt", &pki.client_cert),
            key: write("tls.key", &pki.client_key),
        };
        // The hub would fail every call; files must not consult it.
        let hub = FakeHub::default();
        hub.fail_all("hub unreachable");
        let bundle = CertSource::Files(files).resolve(&hub).await.unwrap();
        assert_eq!(bundle.ca, pki.ca_cert.as_bytes());
        assert_eq!(bundle.server_cert, None);
        assert_eq!(hub.calls(), 0);

        // No server pair: the listener still gets an identity.
        assert!(bundle.listener_tls().is_ok());
        let endpoint = ProxyEndpoint {
            host: "127.0.0.1".to_string(),
            port: 8090,
            server_name: "127.0.0.1".to_string(),
            insecure_skip_verify: false,
        };
        assert!(bundle.tunnel_tls(&endpoint).is_ok());
    }

    #[tokio::test]
    async fn missing_file() {
        let err = CertSource::Files(CertFiles {
            ca: "/nonexistent/ca.crt".into(),
            cert: "/nonexistent/tls.crt".into(),
            key: "/nonexistent/tls.key".into(),
        })
        .resolve(&FakeHub::default())
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }
}
