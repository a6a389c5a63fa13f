use exaconn_core::error::{ExaError, Result};
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

fn tls_error(context: &str, err: impl std::fmt::Display) -> ExaError {
    ExaError::transport(format!("{context}: {err}"))
}

/// Server-side TLS for one tunnel, backed by a throwaway self-signed
/// certificate. The database does not validate it; it only needs encryption.
pub fn self_signed_acceptor() -> Result<TlsAcceptor> {
    let mut params = CertificateParams::new(vec!["exaconn-tunnel".to_string()])
        .map_err(|e| tls_error("invalid certificate parameters", e))?;
    params
        .distinguished_name
        .push(DnType::CommonName, "exaconn-tunnel");
    let key_pair = KeyPair::generate().map_err(|e| tls_error("key generation failed", e))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| tls_error("certificate generation failed", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| tls_error("private key serialization failed", e))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("tls protocol setup failed", e))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| tls_error("tls certificate setup failed", e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
