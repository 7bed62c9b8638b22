// TLS streams whose server name differs from the socket address
//
// Used when the certificate name is overridden or when the socket goes to a
// local SSH tunnel port instead of the Redis host.

use crate::connection::dial::map_io_error;
use crate::errors::RawConnectionError;
use crate::models::{Endpoint, TlsSettings};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Build a rustls client configuration from the profile's TLS material
pub fn client_config(tls: &TlsSettings) -> Result<ClientConfig, RawConnectionError> {
    let mut roots = RootCertStore::empty();
    match tls.ca_certificate.as_deref() {
        Some(pem) => {
            for cert in read_certificates(pem, "CA certificate")? {
                roots
                    .add(cert)
                    .map_err(|e| RawConnectionError::Tls(format!("invalid CA certificate: {}", e)))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs().map_err(|e| {
                RawConnectionError::Tls(format!("failed to load system root certificates: {}", e))
            })?;
            roots.add_parsable_certificates(native);
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match tls.client_certificate.as_ref() {
        Some(client) => {
            let chain = read_certificates(&client.certificate, "client certificate")?;
            let mut reader = client.key.as_bytes();
            let key = rustls_pemfile::private_key(&mut reader)
                .map_err(|e| RawConnectionError::Tls(format!("unreadable client key: {}", e)))?
                .ok_or_else(|| {
                    RawConnectionError::Tls("client key PEM contains no private key".to_string())
                })?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| RawConnectionError::Tls(format!("invalid client certificate: {}", e)))?
        }
        None => builder.with_no_client_auth(),
    };

    if !tls.verify_server_cert {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert::new()));
    }
    Ok(config)
}

/// Open a TCP connection to `target` and run the TLS handshake presenting
/// `server_name`
pub async fn connect(
    tls: &TlsSettings,
    target: &Endpoint,
    server_name: &str,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, RawConnectionError> {
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
        RawConnectionError::Tls(format!("invalid TLS server name {}: {}", server_name, e))
    })?;
    let connector = TlsConnector::from(Arc::new(client_config(tls)?));

    let address = target.address();
    let socket = TcpStream::connect(address.as_str())
        .await
        .map_err(|e| map_io_error(&address, &e, timeout.as_millis() as u64))?;

    debug!(address = %address, server_name = %server_name, "TLS handshake");
    connector.connect(name, socket).await.map_err(|e| {
        RawConnectionError::Tls(format!(
            "TLS handshake with {} as {} failed: {}",
            address, server_name, e
        ))
    })
}

fn read_certificates(
    pem: &str,
    what: &str,
) -> Result<Vec<CertificateDer<'static>>, RawConnectionError> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RawConnectionError::Tls(format!("unreadable {}: {}", what, e)))?;
    if certs.is_empty() {
        return Err(RawConnectionError::Tls(format!("{} PEM contains no certificate", what)));
    }
    Ok(certs)
}

/// Verifier for profiles that opted out of certificate checks
#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
