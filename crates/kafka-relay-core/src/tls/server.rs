//! TLS acceptor for client-facing listeners.
//!
//! Supports plain server TLS, optional client certificates (CA configured but
//! not required) and mandatory mTLS.

use std::path::Path;
use std::sync::Arc;

use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::config::ClientTlsConfig;
use crate::error::{TlsError, TlsResult};

use super::pem::{ensure_crypto_provider, load_certificates, load_private_key, load_root_store};

/// Terminates client TLS. Cheap to clone; all listeners share one config.
#[derive(Clone)]
pub struct TlsServerAcceptor {
    inner: TlsAcceptor,
}

impl TlsServerAcceptor {
    /// Build an acceptor from the `client_tls` section.
    ///
    /// # Errors
    ///
    /// Returns an error if certificates or keys cannot be loaded, or mTLS is
    /// requested without a CA.
    pub fn new(config: &ClientTlsConfig) -> TlsResult<Self> {
        ensure_crypto_provider();
        let server_config = build_server_config(config)?;
        Ok(Self {
            inner: TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Run the server side of the handshake.
    pub async fn accept(&self, stream: TcpStream) -> TlsResult<TlsStream<TcpStream>> {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

fn build_server_config(config: &ClientTlsConfig) -> TlsResult<ServerConfig> {
    let certs = load_certificates(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;
    let builder = ServerConfig::builder();

    let builder = match (&config.ca_cert_path, config.require_client_cert) {
        (Some(ca_path), require) => {
            debug!(
                ca_path = %ca_path.display(),
                require_client_cert = require,
                "configuring client certificate verification"
            );
            builder.with_client_cert_verifier(client_verifier(ca_path, require)?)
        }
        (None, true) => {
            return Err(TlsError::Config(
                "ca_cert_path is required when require_client_cert is true".to_string(),
            ))
        }
        (None, false) => builder.with_no_client_auth(),
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("failed to configure server certificate: {e}")))
}

fn client_verifier(ca_path: &Path, required: bool) -> TlsResult<Arc<dyn ClientCertVerifier>> {
    let builder = WebPkiClientVerifier::builder(Arc::new(load_root_store(ca_path)?));
    let builder = if required {
        builder
    } else {
        builder.allow_unauthenticated()
    };
    builder
        .build()
        .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))
}
