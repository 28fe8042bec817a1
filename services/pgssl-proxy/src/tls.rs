//! Client-facing TLS policy.
//!
//! The policy is built once at startup and shared read-only by every
//! session. It carries the server identity and a verifier that requires a
//! client certificate chaining to one of the configured trusted roots.

use std::io;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::ConfigError;

/// Server identity plus the trusted client CA pool.
#[derive(Clone)]
pub struct TlsPolicy {
    acceptor: TlsAcceptor,
    trusted_roots: usize,
}

impl TlsPolicy {
    /// Build a policy from parsed parts.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        roots: RootCertStore,
    ) -> Result<Self, ConfigError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let trusted_roots = roots.len();

        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            trusted_roots,
        })
    }

    /// Build a policy from in-memory PEM.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<Self, ConfigError> {
        Self::from_labelled_pem(
            (cert_pem, "server certificate"),
            (key_pem, "server key"),
            (ca_pem, "CA bundle"),
        )
    }

    /// Read the server chain, server key and CA bundle from PEM files.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        ca_path: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let ca_path = ca_path.as_ref();

        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;
        let ca_pem = read_file(ca_path)?;

        Self::from_labelled_pem(
            (cert_pem.as_slice(), cert_path.display().to_string().as_str()),
            (key_pem.as_slice(), key_path.display().to_string().as_str()),
            (ca_pem.as_slice(), ca_path.display().to_string().as_str()),
        )
    }

    fn from_labelled_pem(
        (cert_pem, cert_label): (&[u8], &str),
        (key_pem, key_label): (&[u8], &str),
        (ca_pem, ca_label): (&[u8], &str),
    ) -> Result<Self, ConfigError> {
        let chain = parse_certs(cert_pem, cert_label)?;
        if chain.is_empty() {
            return Err(ConfigError::NoCertificates(cert_label.to_string()));
        }

        let key = rustls_pemfile::private_key(&mut io::Cursor::new(key_pem))
            .map_err(|source| ConfigError::Pem {
                what: key_label.to_string(),
                source,
            })?
            .ok_or_else(|| ConfigError::NoPrivateKey(key_label.to_string()))?;

        let roots = root_store(ca_pem, ca_label)?;

        Self::new(chain, key, roots)
    }

    /// Number of trusted client roots.
    pub fn trusted_roots(&self) -> usize {
        self.trusted_roots
    }

    /// Run the server handshake, requiring a verified client certificate.
    pub async fn accept<IO>(&self, stream: IO) -> io::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.acceptor.accept(stream).await
    }
}

impl std::fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsPolicy")
            .field("trusted_roots", &self.trusted_roots)
            .finish_non_exhaustive()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(pem: &[u8], label: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    rustls_pemfile::certs(&mut io::Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Pem {
            what: label.to_string(),
            source,
        })
}

fn root_store(ca_pem: &[u8], label: &str) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(parse_certs(ca_pem, label)?);
    if added == 0 {
        return Err(ConfigError::NoTrustedRoots(label.to_string()));
    }
    debug!(added, ignored, bundle = %label, "Loaded trusted client roots");
    Ok(roots)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::TlsPolicy;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    /// Throwaway CA plus a `localhost` server identity signed by it.
    pub(crate) struct TestPki {
        pub cert_pem: String,
        pub key_pem: String,
        pub ca_pem: String,
    }

    impl TestPki {
        pub(crate) fn generate() -> Self {
            let ca_key = KeyPair::generate().unwrap();
            let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
            ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let ca = ca_params.self_signed(&ca_key).unwrap();

            let key = KeyPair::generate().unwrap();
            let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            let cert = params.signed_by(&key, &ca, &ca_key).unwrap();

            Self {
                cert_pem: cert.pem(),
                key_pem: key.serialize_pem(),
                ca_pem: ca.pem(),
            }
        }

        pub(crate) fn policy(&self) -> TlsPolicy {
            TlsPolicy::from_pem(
                self.cert_pem.as_bytes(),
                self.key_pem.as_bytes(),
                self.ca_pem.as_bytes(),
            )
            .unwrap()
        }
    }
}
