//! TLS server context for STARTTLS and implicit TLS.

use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use super::connection::{BoxedIo, TlsUpgrader};
use super::error::ComponentError;
use crate::config::TlsConfig;

/// Initialize rustls crypto provider (must be called once at startup)
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, ComponentError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ComponentError::config(format!("cannot open TLS {} '{}': {}", what, path.display(), e))
    })
}

fn load_certs(path: &Path, what: &str) -> Result<Vec<CertificateDer<'static>>, ComponentError> {
    let mut reader = open(path, what)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ComponentError::config(format!("invalid PEM in '{}': {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(ComponentError::config(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ComponentError> {
    let mut reader = open(path, "key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ComponentError::config(format!("invalid PEM in '{}': {}", path.display(), e)))?
        .ok_or_else(|| ComponentError::config(format!("no private key found in '{}'", path.display())))
}

/// Build the acceptor from configured certificate material.
///
/// Peers are required to present a certificate only when a CA bundle is
/// configured; otherwise any peer is accepted without client authentication.
pub fn build_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, ComponentError> {
    init_crypto_provider();

    let cert_path = tls
        .cert_path
        .as_deref()
        .ok_or_else(|| ComponentError::config("TLS enabled but tls.cert_path is not set"))?;
    let key_path = tls
        .key_path
        .as_deref()
        .ok_or_else(|| ComponentError::config("TLS enabled but tls.key_path is not set"))?;

    let certs = load_certs(cert_path, "certificate")?;
    let key = load_key(key_path)?;

    let builder = ServerConfig::builder();
    let builder = match tls.ca_path.as_deref() {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path, "CA bundle")? {
                roots
                    .add(cert)
                    .map_err(|e| ComponentError::config(format!("failed to add CA cert: {}", e)))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| ComponentError::config(format!("invalid client verifier: {}", e)))?;
            info!(ca = %ca_path.display(), "TLS peers must present a certificate");
            builder.with_client_cert_verifier(verifier)
        }
        None => {
            warn!("No tls.ca_path configured, TLS peers are not verified");
            builder.with_no_client_auth()
        }
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| ComponentError::config(format!("invalid certificate/key pair: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Server-side rustls upgrade for accepted transports.
#[derive(Clone)]
pub struct RustlsUpgrader {
    acceptor: TlsAcceptor,
}

impl RustlsUpgrader {
    pub fn new(acceptor: TlsAcceptor) -> Self {
        Self { acceptor }
    }
}

impl TlsUpgrader for RustlsUpgrader {
    fn upgrade(&self, io: BoxedIo) -> impl Future<Output = std::io::Result<BoxedIo>> + Send {
        let accept = self.acceptor.accept(io);
        async move {
            let stream = accept.await?;
            Ok(Box::new(stream) as BoxedIo)
        }
    }
}
