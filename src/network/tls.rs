use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::CommError;

/// Encrypted session with a peer, from either side of the dial.
pub type SecureStream = tokio_rustls::TlsStream<TcpStream>;

/// SNI sent by dialers. Peers are authenticated by the gossip handshake, not by name.
const SERVER_NAME: &str = "gossip.local";

/// TLS configuration for peer-to-peer sessions. Both sides present
/// certificates so each can bind the gossip handshake to the session.
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
    pub server_config: Arc<rustls::ServerConfig>,
    cert_hash: Vec<u8>,
    presents_client_cert: bool,
}

impl TlsConfig {
    /// Fresh self-signed certificate, presented on both inbound and outbound sessions.
    pub fn new_self_signed() -> Result<Self, CommError> {
        let (certs, key) = generate_self_signed()?;
        Self::from_parts(certs, key, true)
    }

    /// Self-signed server certificate, but dial without a client certificate.
    /// Peers that require the TLS binding will refuse such sessions.
    pub fn new_self_signed_anonymous() -> Result<Self, CommError> {
        let (certs, key) = generate_self_signed()?;
        Self::from_parts(certs, key, false)
    }

    /// Load TLS configuration from PEM files
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, CommError> {
        let cert_file = std::fs::File::open(cert_path)?;
        let key_file = std::fs::File::open(key_path)?;

        let mut cert_reader = io::BufReader::new(cert_file);
        let mut key_reader = io::BufReader::new(key_file);

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(CommError::Config(format!(
                "no certificate found in {}",
                cert_path.display()
            )));
        }

        let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
            CommError::Config(format!("no private key found in {}", key_path.display()))
        })?;

        Self::from_parts(certs, key, true)
    }

    fn from_parts(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        presents_client_cert: bool,
    ) -> Result<Self, CommError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let cert_hash = cert_hash(&certs[0]);

        let server_config = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(AnyPeerCertVerifier::new(provider.clone())))
            .with_single_cert(certs.clone(), key.clone_key())?;

        // Self-signed peers: the gossip handshake authenticates, TLS only proves key possession
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnyPeerCertVerifier::new(provider)));
        let mut client_config = if presents_client_cert {
            builder.with_client_auth_cert(certs, key)?
        } else {
            builder.with_no_client_auth()
        };
        client_config.resumption = rustls::client::Resumption::disabled();

        Ok(Self {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
            cert_hash,
            presents_client_cert,
        })
    }

    /// Hash of the certificate this node presents when dialing, if it presents one.
    pub fn self_cert_hash(&self) -> Option<&[u8]> {
        if self.presents_client_cert {
            Some(&self.cert_hash)
        } else {
            None
        }
    }

    /// Hash of the certificate presented to inbound peers.
    pub fn server_cert_hash(&self) -> &[u8] {
        &self.cert_hash
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }

    /// Wrap a TCP stream with TLS as a client
    pub async fn connect_client(&self, stream: TcpStream) -> Result<SecureStream, CommError> {
        let domain = ServerName::try_from(SERVER_NAME)
            .map_err(|e| CommError::Config(e.to_string()))?
            .to_owned();
        let stream = self.connector().connect(domain, stream).await?;
        Ok(tokio_rustls::TlsStream::Client(stream))
    }

    /// Wrap a TCP stream with TLS as a server
    pub async fn accept_server(&self, stream: TcpStream) -> Result<SecureStream, CommError> {
        let stream = self.acceptor().accept(stream).await?;
        Ok(tokio_rustls::TlsStream::Server(stream))
    }
}

fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CommError>
{
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .map_err(|e| CommError::Config(format!("certificate generation failed: {}", e)))?;

    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    Ok((vec![cert_der], key_der))
}

pub fn cert_hash(cert: &CertificateDer<'_>) -> Vec<u8> {
    Sha256::digest(cert.as_ref()).to_vec()
}

/// SHA-256 of the certificate the remote side presented on this session.
pub fn peer_cert_hash(stream: &SecureStream) -> Option<Vec<u8>> {
    let certs = match stream {
        tokio_rustls::TlsStream::Client(s) => s.get_ref().1.peer_certificates(),
        tokio_rustls::TlsStream::Server(s) => s.get_ref().1.peer_certificates(),
    }?;
    certs.first().map(cert_hash)
}

/// Accepts any certificate but still checks the handshake signatures, so a
/// peer can only present a certificate whose private key it holds.
#[derive(Debug)]
struct AnyPeerCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl AnyPeerCertVerifier {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl rustls::client::danger::ServerCertVerifier for AnyPeerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl rustls::server::danger::ClientCertVerifier for AnyPeerCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    // Anonymous dialers get a session; the gossip handshake decides whether to trust them
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
