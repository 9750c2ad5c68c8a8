//! TLS configuration loading for `https` listeners

use crate::config::TlsSection;
use crate::error::{Result, SinkholeError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig as RustlsServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Load the configured certificate chain and private key and build a
/// `TlsAcceptor` shared by every `https` listener.
pub fn load_tls_acceptor(tls: &TlsSection) -> Result<TlsAcceptor> {
    let certs = load_certs(&tls.cert)?;
    info!(
        cert_path = %tls.cert.display(),
        cert_count = certs.len(),
        "loaded TLS certificates"
    );

    let key = load_private_key(&tls.privkey)?;
    info!(key_path = %tls.privkey.display(), "loaded TLS private key");

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SinkholeError::Config(format!("invalid TLS configuration: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        SinkholeError::Config(format!(
            "failed to open certificate file {}: {e}",
            path.display()
        ))
    })?;

    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SinkholeError::Config(format!("failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(SinkholeError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load a private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        SinkholeError::Config(format!(
            "failed to open private key file {}: {e}",
            path.display()
        ))
    })?;

    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| SinkholeError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| {
            SinkholeError::Config(format!("no private key found in {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_certs_empty_file() {
        let cert_file = NamedTempFile::new().unwrap();
        assert!(load_certs(cert_file.path()).is_err());
    }

    #[test]
    fn test_load_private_key_empty_file() {
        let key_file = NamedTempFile::new().unwrap();
        assert!(load_private_key(key_file.path()).is_err());
    }

    #[test]
    fn test_missing_files_are_config_errors() {
        let missing = Path::new("/does/not/exist.pem");
        assert!(matches!(
            load_certs(missing),
            Err(SinkholeError::Config(_))
        ));
        assert!(matches!(
            load_private_key(missing),
            Err(SinkholeError::Config(_))
        ));
    }
}
