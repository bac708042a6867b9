//! Broker client certificates minted per client.
//!
//! When brokers authorize by certificate subject, a relay presenting one
//! fixed certificate would collapse every client into a single principal.
//! Instead the relay holds a CA the brokers trust and, for each client,
//! signs a fresh certificate carrying the client's subject, alternative names
//! and validity window. Brokers then see the same identity the client
//! proved to the relay.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use rcgen::{
    Certificate, CertificateParams, CertifiedKey, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info};

use crate::config::ClientCertAuthorityConfig;
use crate::error::{TlsError, TlsResult};

use super::client::BrokerTrust;
use super::pem::load_certificates;

/// Signs broker-leg certificates that mirror client certificates.
pub struct ClientCertAuthority {
    issuer: Certificate,
    issuer_key: KeyPair,
    /// The CA as loaded, sent after each minted leaf.
    issuer_der: CertificateDer<'static>,
    trust: BrokerTrust,
    minted: Mutex<MintedConnectors>,
}

impl ClientCertAuthority {
    /// Load the CA certificate and key.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read or parsed.
    pub(crate) fn load(config: &ClientCertAuthorityConfig, trust: BrokerTrust) -> TlsResult<Self> {
        let ca_path = config.ca_cert_path.display().to_string();
        let key_path = config.ca_key_path.display().to_string();

        let issuer_der = load_certificates(&config.ca_cert_path)?
            .into_iter()
            .next()
            .ok_or_else(|| TlsError::NoCertificates(ca_path.clone()))?;

        let key_pem = std::fs::read_to_string(&config.ca_key_path).map_err(|e| {
            TlsError::PrivateKeyLoad {
                path: key_path.clone(),
                message: e.to_string(),
            }
        })?;
        let issuer_key = KeyPair::from_pem(&key_pem).map_err(|e| TlsError::PrivateKeyLoad {
            path: key_path,
            message: e.to_string(),
        })?;

        // rcgen signs with an issuer `Certificate`; rebuilding it from the
        // loaded CA keeps its subject and key identifier.
        let issuer = CertificateParams::from_ca_cert_der(&issuer_der)
            .and_then(|params| params.self_signed(&issuer_key))
            .map_err(|e| TlsError::CertificateLoad {
                path: ca_path,
                message: e.to_string(),
            })?;

        Ok(Self {
            issuer,
            issuer_key,
            issuer_der,
            trust,
            minted: Mutex::new(MintedConnectors::new(config.cache_size)),
        })
    }

    /// Sign a new certificate with the subject, alternative names and
    /// validity of `client_cert`, under a fresh key.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Mint`] if the client certificate cannot be parsed
    /// or signing fails.
    pub fn mint(&self, client_cert: &CertificateDer<'_>) -> TlsResult<CertifiedKey> {
        let mut params = CertificateParams::from_ca_cert_der(client_cert)
            .map_err(|e| TlsError::Mint(format!("unreadable client certificate: {e}")))?;
        params.is_ca = IsCa::NoCa;
        params.serial_number = None;
        params.key_identifier_method = KeyIdMethod::Sha256;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.name_constraints = None;
        params.use_authority_key_identifier_extension = true;

        let key_pair = KeyPair::generate().map_err(|e| TlsError::Mint(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer, &self.issuer_key)
            .map_err(|e| TlsError::Mint(e.to_string()))?;
        Ok(CertifiedKey { cert, key_pair })
    }

    /// A connector presenting a certificate minted for `client_cert`.
    ///
    /// Connectors are cached per client certificate, so a client reconnecting
    /// does not pay for key generation again.
    ///
    /// # Errors
    ///
    /// See [`mint`](Self::mint).
    pub fn connector_for(
        &self,
        client_cert: &CertificateDer<'_>,
    ) -> TlsResult<tokio_rustls::TlsConnector> {
        if let Some(connector) = self.cache().get(client_cert.as_ref()) {
            return Ok(connector);
        }

        let minted = self.mint(client_cert)?;
        let chain = vec![minted.cert.der().clone(), self.issuer_der.clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(minted.key_pair.serialize_der()));
        let config = self
            .trust
            .builder()?
            .with_client_auth_cert(chain, key)
            .map_err(|e| TlsError::Config(format!("failed to configure client auth: {e}")))?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        info!("minted broker client certificate for a new client identity");
        self.cache()
            .insert(client_cert.as_ref().to_vec(), connector.clone());
        Ok(connector)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, MintedConnectors> {
        self.minted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connectors keyed by client certificate DER, oldest evicted first.
struct MintedConnectors {
    entries: HashMap<Vec<u8>, tokio_rustls::TlsConnector>,
    order: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl MintedConnectors {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, client_cert: &[u8]) -> Option<tokio_rustls::TlsConnector> {
        self.entries.get(client_cert).cloned()
    }

    fn insert(&mut self, client_cert: Vec<u8>, connector: tokio_rustls::TlsConnector) {
        if self.entries.contains_key(&client_cert) {
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            debug!("evicting minted broker client certificate");
            self.entries.remove(&oldest);
        }
        self.order.push_back(client_cert.clone());
        self.entries.insert(client_cert, connector);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
