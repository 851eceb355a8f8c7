// Self-signed TLS plumbing for the harness node.
use std::sync::Arc;

use anyhow::Result;
use rustls::pki_types::PrivatePkcs8KeyDer;
use tokio_rustls::TlsAcceptor;

/// TLS acceptor backed by a fresh self-signed certificate carrying the given
/// subject common name. WARNING: test certificates only.
pub fn acceptor(common_name: &str) -> Result<TlsAcceptor> {
    let key = rcgen::KeyPair::generate()?;
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let cert = params.self_signed(&key)?;
    let key_der = PrivatePkcs8KeyDer::from(key.serialize_der());
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key_der.into())?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
