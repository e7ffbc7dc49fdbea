use std::{fs, io, path::Path, sync::Arc};

use anyhow::Context;
use rustls::{
    RootCertStore,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::backhaul::stream::BoxedStream;

/// Where the private service lives and how to talk to it.
#[derive(Debug, Clone, Default)]
pub struct LocalOptions {
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
    pub allow_invalid_cert: bool,
}

impl LocalOptions {
    pub fn host_or_default(&self) -> &str {
        let h = self.host.trim();
        if h.is_empty() { "localhost" } else { h }
    }
}

/// Opens connections to the local service.
///
/// Certificate material is read once when the connector is built, not per connection.
#[derive(Clone)]
pub struct LocalConnector {
    host: String,
    port: u16,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl std::fmt::Debug for LocalConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl LocalConnector {
    pub fn new(opts: &LocalOptions) -> anyhow::Result<Self> {
        let host = opts.host_or_default().to_string();
        let tls = if opts.https {
            let cfg = client_tls_config(opts)?;
            let name = ServerName::try_from(host.clone())
                .with_context(|| format!("local: invalid tls server name {host:?}"))?;
            Some((TlsConnector::from(Arc::new(cfg)), name))
        } else {
            None
        };
        Ok(Self {
            host,
            port: opts.port,
            tls,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect (and complete the TLS handshake when configured).
    ///
    /// Errors keep their `io::ErrorKind` so callers can tell a refused connect from
    /// a certificate problem.
    pub async fn connect(&self) -> io::Result<BoxedStream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        match &self.tls {
            None => Ok(Box::new(tcp)),
            Some((connector, name)) => {
                let st = connector.connect(name.clone(), tcp).await?;
                Ok(Box::new(st))
            }
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn client_tls_config(opts: &LocalOptions) -> anyhow::Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("local: tls protocol versions")?;

    if opts.allow_invalid_cert {
        tracing::warn!("local: allowing invalid certificates");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth());
    }

    let builder = builder.with_root_certificates(root_store(opts.ca_file.as_deref())?);

    let cert = opts.cert_file.as_deref().filter(|s| !s.trim().is_empty());
    let key = opts.key_file.as_deref().filter(|s| !s.trim().is_empty());
    match (cert, key) {
        (Some(cert), Some(key)) => {
            let chain = load_certs(Path::new(cert))?;
            let key = load_key(Path::new(key))?;
            builder
                .with_client_auth_cert(chain, key)
                .context("local: client certificate")
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => anyhow::bail!("local: https requires both cert and key (or neither)"),
    }
}

/// Trust anchors for the local service: the given CA bundle, or the Mozilla roots.
fn root_store(ca_file: Option<&str>) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_file.filter(|s| !s.trim().is_empty()) {
        Some(ca) => {
            for cert in load_certs(Path::new(ca))? {
                roots
                    .add(cert)
                    .with_context(|| format!("local: add ca cert from {ca}"))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("local: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("local: parse certs {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("local: no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("local: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let Some(key) = rustls_pemfile::private_key(&mut rd)? else {
        anyhow::bail!("local: no private key found in {}", path.display());
    };
    Ok(key)
}

/// Certificate verifier that treats any certificate as valid.
///
/// NOTE: vulnerable to MITM. Only used when the operator asked for it.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
