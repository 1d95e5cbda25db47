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

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::ServerConfig;
use rustls::server::WebPkiClientVerifier;

use crate::certs::CertificateBundle;
use crate::tls::lib::{TLS_VERSIONS, provider};
use crate::tls::{ClientTls, client_config, parse_certs, parse_key, root_store};

/// TestPki is a freshly generated CA with one server and one client leaf, all PEM encoded, shaped
/// like the material the cluster-proxy add-on stores in its secrets.
#[derive(Clone, Debug)]
pub struct TestPki {
    pub ca_cert: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
    server_names: Vec<String>,
}

impl TestPki {
    /// Generates a CA plus a server leaf valid for `server_names` and a client leaf.
    pub fn generate(server_names: &[&str]) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "open-cluster-management:cluster-proxy");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_names: Vec<String> = server_names.iter().map(|s| s.to_string()).collect();
        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(server_names.clone()).unwrap();
        server_params
            .distinguished_name
            .push(DnType::CommonName, "proxy-server");
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        client_params
            .distinguished_name
            .push(DnType::CommonName, "proxy-client");
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        TestPki {
            ca_cert: ca.pem(),
            server_cert: server.pem(),
            server_key: server_key.serialize_pem(),
            client_cert: client.pem(),
            client_key: client_key.serialize_pem(),
            server_names,
        }
    }

    pub fn bundle(&self) -> CertificateBundle {
        CertificateBundle {
            ca: self.ca_cert.clone().into_bytes(),
            client_cert: self.client_cert.clone().into_bytes(),
            client_key: self.client_key.clone().into_bytes(),
            server_cert: Some(self.server_cert.clone().into_bytes()),
            server_key: Some(self.server_key.clone().into_bytes()),
        }
    }

    /// The proxy-server side: presents the server leaf and requires a client certificate
    /// issued by the CA.
    pub fn mtls_server_config(&self, alpn: &[&[u8]]) -> Arc<ServerConfig> {
        let roots = root_store(self.ca_cert.as_bytes()).unwrap();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
            .build()
            .unwrap();
        let mut sc = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(TLS_VERSIONS)
            .expect("server config must be valid")
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                parse_certs(self.server_cert.as_bytes()).unwrap(),
                parse_key(self.server_key.as_bytes()).unwrap(),
            )
            .unwrap();
        sc.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(sc)
    }

    /// A client configuration verifying the first server name.
    pub fn client_tls(&self, alpn: &[&[u8]]) -> ClientTls {
        client_config(
            self.ca_cert.as_bytes(),
            self.client_cert.as_bytes(),
            self.client_key.as_bytes(),
            &self.server_names[0],
            alpn,
        )
        .unwrap()
    }
}
