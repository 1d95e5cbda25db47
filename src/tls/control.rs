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
use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client;
use tracing::trace;

use crate::tls::Error;
use crate::tls::certificate::{parse_certs, parse_key, root_store, verify_key_pair};
use crate::tls::lib::{TLS_VERSIONS, provider};

/// ClientTls is a validated client configuration paired with the name it verifies against.
#[derive(Clone)]
pub struct ClientTls {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .field("alpn", &self.config.alpn_protocols)
            .finish()
    }
}

impl ClientTls {
    pub async fn connect<IO>(&self, stream: IO) -> io::Result<client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        tokio_rustls::TlsConnector::from(self.config.clone())
            .connect(self.server_name.clone(), stream)
            .await
    }
}

pub fn server_name(name: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(name.to_string()).map_err(|_| Error::InvalidServerName(name.to_string()))
}

/// client_config builds the mTLS configuration used to reach the proxy server: `ca` is the only
/// trust root, `cert`/`key` authenticate us, and `server_name` is both SNI and the verified name.
pub fn client_config(
    ca: &[u8],
    cert: &[u8],
    key: &[u8],
    server_name: &str,
    alpn: &[&[u8]],
) -> Result<ClientTls, Error> {
    let roots = root_store(ca)?;
    let chain = parse_certs(cert)?;
    let key = parse_key(key)?;
    verify_key_pair(&chain[0], &key)?;
    let server_name = self::server_name(server_name)?;

    let mut cc = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(TLS_VERSIONS)?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)?;
    cc.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(ClientTls {
        config: Arc::new(cc),
        server_name,
    })
}

/// server_config builds the identity served on the local HTTPS listener. No client
/// certificates are requested; callers authenticate to the managed cluster with bearer tokens.
pub fn server_config(cert: &[u8], key: &[u8], alpn: &[&[u8]]) -> Result<Arc<ServerConfig>, Error> {
    let chain = parse_certs(cert)?;
    let key = parse_key(key)?;
    verify_key_pair(&chain[0], &key)?;
    single_cert_server(chain, key, alpn)
}

/// self_signed_server_config generates a throwaway identity for the local listener, used when
/// the certificate material carries no server pair.
pub fn self_signed_server_config(alpn: &[&[u8]]) -> Result<Arc<ServerConfig>, Error> {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    single_cert_server(vec![cert.der().clone()], key, alpn)
}

fn single_cert_server(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>, Error> {
    let mut sc = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(TLS_VERSIONS)?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    sc.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(sc))
}

/// insecure_client_config is used on the tunnel to managed cluster leg. The tunnel routes by
/// the cluster's logical name, which managed API server certificates do not carry in their SANs,
/// so neither the chain nor the hostname can be checked. See [`InsecureVerifier`].
pub fn insecure_client_config(server_name: &str, alpn: &[&[u8]]) -> Result<ClientTls, Error> {
    let server_name = self::server_name(server_name)?;
    let mut cc = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(TLS_VERSIONS)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth();
    cc.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(ClientTls {
        config: Arc::new(cc),
        server_name,
    })
}

/// insecure_mtls_client_config authenticates with `cert`/`key` but accepts any server
/// certificate. Used when the proxy server is reached under a name its certificate lacks.
pub fn insecure_mtls_client_config(
    cert: &[u8],
    key: &[u8],
    server_name: &str,
    alpn: &[&[u8]],
) -> Result<ClientTls, Error> {
    let chain = parse_certs(cert)?;
    let key = parse_key(key)?;
    verify_key_pair(&chain[0], &key)?;
    let server_name = self::server_name(server_name)?;
    let mut cc = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(TLS_VERSIONS)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_client_auth_cert(chain, key)?;
    cc.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(ClientTls {
        config: Arc::new(cc),
        server_name,
    })
}

/// InsecureVerifier accepts any server certificate. Handshake signatures are still verified, so
/// the peer must hold the key for the certificate it presents.
///
/// This is a known trust reduction of name-routed tunnels: the managed cluster is trusted because
/// the authenticated proxy server routed us to it, not because its certificate names it.
#[derive(Debug)]
pub struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        trace!(?server_name, "skipping server certificate verification");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
