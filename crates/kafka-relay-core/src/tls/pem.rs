//! PEM loading shared by the client and server sides.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use tracing::{debug, warn};

use crate::error::{TlsError, TlsResult};

/// Install the ring provider once per process. Later calls are no-ops.
pub(crate) fn ensure_crypto_provider() {
    let _ = CryptoProvider::install_default(default_provider());
}

/// Load every certificate in a PEM file.
///
/// Unparseable blocks are skipped with a warning; a file with no usable
/// certificate is an error.
pub fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .filter_map(|result| {
            result
                .map_err(|e| warn!(path = %path.display(), error = %e, "skipping invalid certificate"))
                .ok()
        })
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }

    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let key_error = |message: String| TlsError::PrivateKeyLoad {
        path: path.display().to_string(),
        message,
    };

    let file = File::open(path).map_err(|e| key_error(e.to_string()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| key_error(e.to_string()))?
        .ok_or_else(|| TlsError::NoPrivateKeys(path.display().to_string()))
}

/// Build a trust store from a CA bundle.
pub fn load_root_store(ca_path: &Path) -> TlsResult<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(load_certificates(ca_path)?);
    debug!(added, ignored, path = %ca_path.display(), "loaded CA certificates");

    if added == 0 {
        return Err(TlsError::NoCertificates(ca_path.display().to_string()));
    }
    Ok(root_store)
}
