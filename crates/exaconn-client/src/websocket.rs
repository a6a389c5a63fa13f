use exaconn_core::error::{ExaError, Result};
use exaconn_core::host::{Fingerprint, Host};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ws_error(err: impl std::fmt::Display) -> ExaError {
    ExaError::WebSocket(err.to_string())
}

/// Upper-case hex SHA-256 of a DER certificate.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}

/// Accepts a server certificate by digest instead of by chain, or accepts
/// anything when no digest is expected. Handshake signatures are still checked.
#[derive(Debug)]
struct PinnedVerifier {
    expected: Option<String>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let Some(expected) = &self.expected else {
            return Ok(ServerCertVerified::assertion());
        };
        let actual = certificate_fingerprint(end_entity.as_ref());
        if &actual == expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {expected}, got {actual}"
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn client_config(fingerprint: Option<&Fingerprint>) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(ws_error)?;
    let config = match fingerprint {
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        Some(fingerprint) => {
            let expected = match fingerprint {
                Fingerprint::Sha256(digest) => Some(digest.clone()),
                Fingerprint::NoCertCheck => None,
            };
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedVerifier { expected, provider }))
                .with_no_client_auth()
        }
    };
    Ok(config)
}

/// Opens the control connection to one resolved host.
///
/// TCP goes to the resolved address; the URL carries the display name so TLS
/// server name checks see the name the user wrote.
pub async fn connect(host: &Host, encryption: bool) -> Result<WsStream> {
    let scheme = if encryption { "wss" } else { "ws" };
    let url = format!("{scheme}://{}:{}", host.display_name, host.port);
    let request = url.as_str().into_client_request().map_err(ws_error)?;

    let stream = TcpStream::connect(host.socket_addr()).await?;
    stream.set_nodelay(true)?;
    let connector = if encryption {
        Some(Connector::Rustls(Arc::new(client_config(host.fingerprint.as_ref())?)))
    } else {
        None
    };
    let (ws, _) = client_async_tls_with_config(request, stream, None, connector)
        .await
        .map_err(ws_error)?;
    debug!(host = %host, encryption, "websocket connected");
    Ok(ws)
}
