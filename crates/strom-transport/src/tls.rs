// TLS channel modes: common-name pinning or explicit trust-all.
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};

/// How to validate the server when the channel is encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Accept the presented certificate iff its subject common name matches.
    /// Intended for self-signed node certificates.
    CommonName(String),
    /// Accept any certificate. WARNING: dangerous, test environments only.
    TrustAll,
}

pub(crate) fn client_config(mode: &TlsMode) -> rustls::ClientConfig {
    let verifier: Arc<dyn ServerCertVerifier> = match mode {
        TlsMode::CommonName(name) => Arc::new(CommonNameVerifier {
            expected: name.clone(),
        }),
        TlsMode::TrustAll => Arc::new(TrustAllVerifier),
    };
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth()
}

// Dangerous: certificate verifier that accepts any certificate.
#[derive(Debug)]
struct TrustAllVerifier;

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

// Pins the subject common name of the presented certificate. Chain building
// is intentionally skipped: nodes present self-signed certificates.
#[derive(Debug)]
struct CommonNameVerifier {
    expected: String,
}

impl ServerCertVerifier for CommonNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match find_common_name(end_entity.as_ref()) {
            Some(name) if name == self.expected => Ok(ServerCertVerified::assertion()),
            _ => Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Extract the subject CN (OID 2.5.4.3) from certificate DER.
///
/// Scans for the encoded attribute OID and reads the string value that
/// follows; short-form lengths only, which covers every CN a node presents.
/// The issuer CN appears before the subject CN in the TBS structure, so the
/// last occurrence wins.
fn find_common_name(der: &[u8]) -> Option<String> {
    const CN_OID: [u8; 5] = [0x06, 0x03, 0x55, 0x04, 0x03];
    let mut found = None;
    let mut index = 0;
    while index + CN_OID.len() + 2 <= der.len() {
        if der[index..index + CN_OID.len()] != CN_OID {
            index += 1;
            continue;
        }
        let tag = der[index + CN_OID.len()];
        let len = der[index + CN_OID.len() + 1] as usize;
        let start = index + CN_OID.len() + 2;
        // UTF8String, PrintableString, IA5String; reject long-form lengths.
        if matches!(tag, 0x0C | 0x13 | 0x16) && len < 0x80 && start + len <= der.len() {
            if let Ok(value) = std::str::from_utf8(&der[start..start + len]) {
                found = Some(value.to_string());
            }
        }
        index += CN_OID.len();
    }
    found
}
