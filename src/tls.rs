//! Transport Security
//!
//! TLS for the relay link. The server presents a certificate obtained from a
//! [`CertificateProvider`]; by default a self-signed one that is issued once
//! and cached on disk so restarts keep the same identity.
//!
//! Clients choose a trust policy explicitly. [`ClientTrust::AcceptAnyServerCertificate`]
//! only protects against passive observers on the network: it does not
//! authenticate the relay. Peer authenticity is carried end to end by the
//! key exchange instead.

use chrono::{Datelike, Duration, Utc};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    RootCertStore,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificates found in {0}")]
    NoCertificates(String),
    #[error("No private key found in {0}")]
    NoPrivateKey(String),
    #[error("Certificate issuance failed: {0}")]
    Certificate(String),
    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Certificate chain plus the matching private key
pub struct CertifiedKey {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Source of the relay's TLS identity
pub trait CertificateProvider: Send + Sync {
    fn certified_key(&self) -> Result<CertifiedKey, TlsError>;
}

/// Operator-supplied PEM files
pub struct PemFileProvider {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

impl PemFileProvider {
    pub fn new(certfile: impl Into<PathBuf>, keyfile: impl Into<PathBuf>) -> Self {
        Self {
            certfile: certfile.into(),
            keyfile: keyfile.into(),
        }
    }
}

impl CertificateProvider for PemFileProvider {
    fn certified_key(&self) -> Result<CertifiedKey, TlsError> {
        Ok(CertifiedKey {
            cert_chain: load_certs(&self.certfile)?,
            key: load_key(&self.keyfile)?,
        })
    }
}

/// Self-signed `CN=<service name>` certificate, cached as PEM on disk
pub struct SelfSignedProvider {
    service_name: String,
    validity_days: u32,
    certfile: PathBuf,
    keyfile: PathBuf,
}

impl SelfSignedProvider {
    pub fn new(
        service_name: impl Into<String>,
        validity_days: u32,
        certfile: impl Into<PathBuf>,
        keyfile: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            validity_days,
            certfile: certfile.into(),
            keyfile: keyfile.into(),
        }
    }
}

impl CertificateProvider for SelfSignedProvider {
    fn certified_key(&self) -> Result<CertifiedKey, TlsError> {
        if self.certfile.exists() && self.keyfile.exists() {
            log::debug!("Reusing cached certificate {}", self.certfile.display());
            return PemFileProvider::new(&self.certfile, &self.keyfile).certified_key();
        }

        log::info!(
            "Issuing self-signed certificate CN={} valid for {} days",
            self.service_name,
            self.validity_days
        );
        let issued = issue_self_signed(&self.service_name, self.validity_days)?;
        write_pem(&self.certfile, &issued.cert_pem, false)?;
        write_pem(&self.keyfile, &issued.key_pem, true)?;

        Ok(CertifiedKey {
            cert_chain: read_certs(&mut issued.cert_pem.as_bytes(), "issued certificate")?,
            key: read_key(&mut issued.key_pem.as_bytes(), "issued key")?,
        })
    }
}

/// PEM output of [`issue_self_signed`]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Issue a self-signed certificate for `CN=<subject>` valid from today for
/// `validity_days`.
pub fn issue_self_signed(subject: &str, validity_days: u32) -> Result<IssuedCertificate, TlsError> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()]);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    params.distinguished_name = dn;

    let now = Utc::now();
    let until = now + Duration::days(i64::from(validity_days));
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    params.not_after = rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);

    let cert =
        Certificate::from_params(params).map_err(|e| TlsError::Certificate(e.to_string()))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| TlsError::Certificate(e.to_string()))?;

    Ok(IssuedCertificate {
        cert_pem,
        key_pem: cert.serialize_private_key_pem(),
    })
}

fn write_pem(path: &Path, pem: &str, private: bool) -> Result<(), TlsError> {
    let io_err = |source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, pem).map_err(io_err)?;
    if private {
        owner_only(path).map_err(io_err)?;
    }
    Ok(())
}

#[cfg(unix)]
fn owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Load a PEM certificate chain
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = std::fs::File::open(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_certs(&mut std::io::BufReader::new(file), &path.display().to_string())
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1)
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = std::fs::File::open(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_key(&mut std::io::BufReader::new(file), &path.display().to_string())
}

fn read_certs(
    reader: &mut dyn BufRead,
    origin: &str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: PathBuf::from(origin),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(origin.to_string()));
    }
    Ok(certs)
}

fn read_key(reader: &mut dyn BufRead, origin: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(reader)
        .map_err(|source| TlsError::Io {
            path: PathBuf::from(origin),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(origin.to_string()))
}

/// Server-side TLS context from a provider's key material
pub fn server_acceptor(provider: &dyn CertificateProvider) -> Result<TlsAcceptor, TlsError> {
    let CertifiedKey { cert_chain, key } = provider.certified_key()?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// How a client decides whether to trust the relay's certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTrust {
    /// Accept any certificate, including self-signed ones. Confidentiality
    /// against passive observers only.
    AcceptAnyServerCertificate,
    /// Verify against the Mozilla root set
    WebPkiRoots,
}

/// Client-side TLS context for the chosen trust policy
pub fn client_connector(trust: ClientTrust) -> TlsConnector {
    let config = match trust {
        ClientTrust::AcceptAnyServerCertificate => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth(),
        ClientTrust::WebPkiRoots => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    TlsConnector::from(Arc::new(config))
}

/// SNI name for a host string; IP literals become IP server names
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| TlsError::Certificate(format!("invalid server name {:?}: {}", host, e)))
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            ED25519,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_self_signed() {
        let issued = issue_self_signed("GhostCat", 30).unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));

        let certs = read_certs(&mut issued.cert_pem.as_bytes(), "test").unwrap();
        assert_eq!(certs.len(), 1);
        assert!(read_key(&mut issued.key_pem.as_bytes(), "test").is_ok());
    }

    #[test]
    fn test_self_signed_provider_caches_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let certfile = dir.path().join("cert.pem");
        let keyfile = dir.path().join("key.pem");
        let provider = SelfSignedProvider::new("GhostCat", 365, &certfile, &keyfile);

        let first = provider.certified_key().unwrap();
        assert!(certfile.exists() && keyfile.exists());

        let second = provider.certified_key().unwrap();
        assert_eq!(first.cert_chain, second.cert_chain);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&keyfile).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_pem_provider_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let provider = PemFileProvider::new(dir.path().join("nope.pem"), dir.path().join("nope.key"));
        assert!(matches!(provider.certified_key(), Err(TlsError::Io { .. })));
    }

    #[test]
    fn test_empty_pem_has_no_certificates() {
        assert!(matches!(
            read_certs(&mut &b""[..], "empty"),
            Err(TlsError::NoCertificates(_))
        ));
        assert!(matches!(
            read_key(&mut &b""[..], "empty"),
            Err(TlsError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn test_server_acceptor_from_self_signed() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SelfSignedProvider::new(
            "GhostCat",
            365,
            dir.path().join("c.pem"),
            dir.path().join("k.pem"),
        );
        assert!(server_acceptor(&provider).is_ok());
    }

    #[test]
    fn test_client_connectors_build() {
        let _ = client_connector(ClientTrust::AcceptAnyServerCertificate);
        let _ = client_connector(ClientTrust::WebPkiRoots);
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("relay.local").is_ok());
        assert!(server_name("").is_err());
    }
}
