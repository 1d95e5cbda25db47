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

use std::io::Cursor;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::warn;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::tls::Error;
use crate::tls::lib::provider;

/// parse_certs reads every certificate out of a PEM blob. Non-certificate sections are skipped;
/// a blob with no certificate at all is an error.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::CertificateParseError(e.to_string()))?;
    if certs.is_empty() {
        return Err(Error::CertificateParseError("no certificate".to_string()));
    }
    for der in &certs {
        x509_parser::parse_x509_certificate(der)
            .map_err(|e| Error::CertificateParseError(e.to_string()))?;
    }
    Ok(certs)
}

/// parse_key reads the first private key out of a PEM blob. PKCS#8, PKCS#1 (RSA) and SEC1 (EC)
/// encodings are accepted; Kubernetes secrets carry all three in the wild.
pub fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(pem));
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::CertificateParseError(e.to_string()))?
        .ok_or_else(|| Error::CertificateParseError("no key".to_string()))
}

pub fn root_store(ca: &[u8]) -> Result<RootCertStore, Error> {
    let certs = parse_certs(ca).map_err(|e| Error::InvalidRootCert(e.to_string()))?;
    let mut roots = RootCertStore::empty();
    let (valid, invalid) = roots.add_parsable_certificates(certs);
    if invalid > 0 {
        warn!("warning: found {invalid} invalid root certs");
    }
    if valid == 0 {
        return Err(Error::InvalidRootCert(
            "no usable root certificate present".to_string(),
        ));
    }
    Ok(roots)
}

/// verify_key_pair checks the private key belongs to the leaf certificate, so a mismatched
/// secret fails when the config is built rather than at handshake time on the remote end.
pub(super) fn verify_key_pair(
    leaf: &CertificateDer<'_>,
    key: &PrivateKeyDer<'_>,
) -> Result<(), Error> {
    let signing_key = provider()
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| Error::CertificateParseError(format!("unsupported key: {e}")))?;
    let Some(spki) = signing_key.public_key() else {
        // The provider cannot tell us; rustls will still fail the handshake.
        return Ok(());
    };
    let (_, key_spki) = SubjectPublicKeyInfo::from_der(spki.as_ref())
        .map_err(|e| Error::CertificateParseError(e.to_string()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf)
        .map_err(|e| Error::CertificateParseError(e.to_string()))?;
    if cert.public_key().subject_public_key.data != key_spki.subject_public_key.data {
        return Err(Error::KeyMismatch);
    }
    Ok(())
}
