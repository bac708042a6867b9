//! Client-facing listeners, one per proxied broker.
//!
//! Each listener accepts clients for exactly one broker. Accepted sockets get
//! `TCP_NODELAY`, an optional TLS handshake, and then a [`ConnectionProxy`]
//! in a task of their own. All tasks live in one [`TaskTracker`] so shutdown
//! can wait for them to drain.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{BrokerConnector, BrokerRegistry, SharedRegistry};
use crate::config::{RelayConfig, ResolvedMapping};
use crate::error::{ConfigError, ConfigResult, ProxyError, Result};
use crate::metrics::prometheus::side;
use crate::metrics::ProxyMetrics;
use crate::rewrite::RewriteSet;
use crate::tls::TlsServerAcceptor;

use super::connection::{ConnectionProxy, RelayDeps};
use super::context::ConnectionContext;
use super::stream::{ClientStream, Leg};

/// Pause after a failed `accept`, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Owns the listeners and every pair spawned from them.
pub struct ListenerManager {
    deps: Arc<RelayDeps>,
    acceptor: Option<TlsServerAcceptor>,
    mappings: Vec<ResolvedMapping>,
    /// Broker ids are proxied only when listed; otherwise every broker is.
    proxy_all: bool,
    max_connections: usize,
    listeners: Mutex<Vec<(i32, TcpListener)>>,
    active: Arc<AtomicUsize>,
    next_connection_id: Arc<AtomicU64>,
    tracker: TaskTracker,
}

impl ListenerManager {
    /// Prepare listeners for the proxied mappings of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or TLS material cannot
    /// be loaded. Nothing is bound yet.
    pub fn new(
        config: &RelayConfig,
        registry: SharedRegistry,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let acceptor = config
            .client_tls
            .as_ref()
            .map(TlsServerAcceptor::new)
            .transpose()?;
        let connector = BrokerConnector::new(
            config.broker_tls.as_ref(),
            &config.relay,
            Arc::clone(&metrics),
        )?;

        let deps = RelayDeps {
            registry,
            connector,
            rewrites: Arc::new(RewriteSet::standard()),
            metrics,
            tuning: config.relay.clone(),
            shutdown: CancellationToken::new(),
        };

        Ok(Self {
            deps: Arc::new(deps),
            acceptor,
            mappings: config.proxied_mappings()?,
            proxy_all: config.proxied_brokers.is_empty(),
            max_connections: config.listen.max_connections,
            listeners: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            tracker: TaskTracker::new(),
        })
    }

    /// Bind one listener per proxied mapping.
    ///
    /// Returns the bound address of each broker's listener, which differs from
    /// the configured one when port 0 was requested.
    ///
    /// # Errors
    ///
    /// Returns the first bind failure; listeners bound so far are released.
    pub async fn bind(&self) -> Result<Vec<(i32, SocketAddr)>> {
        let mut bound = Vec::with_capacity(self.mappings.len());
        let mut addresses = Vec::with_capacity(self.mappings.len());

        for resolved in &self.mappings {
            let broker_id = resolved.mapping.broker_id;
            let listener = TcpListener::bind(&resolved.bind).await.map_err(|e| {
                error!(broker_id, bind = %resolved.bind, error = %e, "failed to bind listener");
                ProxyError::Transport(e)
            })?;
            let local = listener.local_addr()?;
            info!(
                broker_id,
                address = %local,
                advertised = %resolved.mapping.advertised,
                broker = %resolved.mapping.real,
                "listening"
            );
            addresses.push((broker_id, local));
            bound.push((broker_id, listener));
        }

        *self.listeners.lock().unwrap_or_else(PoisonError::into_inner) = bound;
        Ok(addresses)
    }

    /// Accept clients until shutdown, then wait up to `shutdown_grace` for
    /// pairs to finish. Binds first if [`bind`](Self::bind) was not called.
    ///
    /// # Errors
    ///
    /// Returns an error only if binding fails.
    pub async fn run(&self) -> Result<()> {
        let mut listeners = self.take_listeners();
        if listeners.is_empty() {
            self.bind().await?;
            listeners = self.take_listeners();
        }

        for (broker_id, listener) in listeners {
            let accept_loop = AcceptLoop {
                broker_id,
                listener,
                deps: Arc::clone(&self.deps),
                acceptor: self.acceptor.clone(),
                max_connections: self.max_connections,
                active: Arc::clone(&self.active),
                next_connection_id: Arc::clone(&self.next_connection_id),
                tracker: self.tracker.clone(),
            };
            self.tracker
                .spawn(accept_loop.run().instrument(info_span!("listener", broker_id)));
        }

        self.deps.shutdown.cancelled().await;
        self.tracker.close();

        let grace = self.deps.tuning.shutdown_grace();
        info!(active = self.active_pairs(), ?grace, "shutting down, draining pairs");
        if timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.active_pairs(),
                "shutdown grace elapsed with pairs still open"
            );
        } else {
            info!("all pairs closed");
        }
        Ok(())
    }

    fn take_listeners(&self) -> Vec<(i32, TcpListener)> {
        std::mem::take(&mut *self.listeners.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Token that stops every listener and pair when cancelled.
    #[must_use]
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.deps.shutdown.clone()
    }

    /// Client connections currently holding a slot, including those still
    /// handshaking.
    #[must_use]
    pub fn active_pairs(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.deps.metrics
    }

    /// Swap in a new registry. New pairs and new rewrites use it at once;
    /// pairs already connected keep their broker leg.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ListenerSetChanged`] if the new registry would
    /// need a listener to be added or removed.
    pub fn reload_registry(&self, registry: BrokerRegistry) -> ConfigResult<()> {
        let current: BTreeSet<i32> = self.mappings.iter().map(|m| m.mapping.broker_id).collect();

        let missing: Vec<i32> = current
            .iter()
            .copied()
            .filter(|id| registry.get(*id).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::ListenerSetChanged(format!(
                "brokers {missing:?} have listeners but are missing from the new registry"
            )));
        }

        if self.proxy_all {
            let added: Vec<i32> = registry
                .mappings()
                .iter()
                .map(|m| m.broker_id)
                .filter(|id| !current.contains(id))
                .collect();
            if !added.is_empty() {
                return Err(ConfigError::ListenerSetChanged(format!(
                    "brokers {added:?} would need new listeners"
                )));
            }
        }

        info!(brokers = registry.len(), "broker registry reloaded");
        self.deps.registry.replace(registry);
        Ok(())
    }

    /// Reload from a full configuration, as on SIGHUP.
    ///
    /// # Errors
    ///
    /// Fails if the new configuration is invalid, changes the proxied broker
    /// set or any listener's bind address.
    pub fn reload(&self, config: &RelayConfig) -> ConfigResult<()> {
        config.validate()?;
        let proxied = config.proxied_mappings()?;

        let before: BTreeSet<(i32, &str)> = self
            .mappings
            .iter()
            .map(|m| (m.mapping.broker_id, m.bind.as_str()))
            .collect();
        let after: BTreeSet<(i32, &str)> = proxied
            .iter()
            .map(|m| (m.mapping.broker_id, m.bind.as_str()))
            .collect();
        if before != after {
            return Err(ConfigError::ListenerSetChanged(
                "proxied brokers or bind addresses differ; restart to apply".to_string(),
            ));
        }

        self.reload_registry(config.build_registry()?)
    }
}

/// Accept loop of a single broker listener.
struct AcceptLoop {
    broker_id: i32,
    listener: TcpListener,
    deps: Arc<RelayDeps>,
    acceptor: Option<TlsServerAcceptor>,
    max_connections: usize,
    active: Arc<AtomicUsize>,
    next_connection_id: Arc<AtomicU64>,
    tracker: TaskTracker,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                () = self.deps.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => self.admit(socket, peer),
                Err(e) => {
                    warn!(error = %e, "accept failed, backing off");
                    sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!("listener stopped");
    }

    /// Take a connection slot and hand the socket to its own task.
    fn admit(&self, socket: TcpStream, peer: SocketAddr) {
        let Some(slot) = Slot::acquire(&self.active, self.max_connections) else {
            warn!(%peer, max = self.max_connections, "connection rejected: limit reached");
            self.deps.metrics.record_reject("max_connections");
            return;
        };
        self.deps.metrics.record_accept(self.broker_id);

        if let Err(e) = socket.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let pair = Pair {
            connection_id,
            broker_id: self.broker_id,
            peer,
            deps: Arc::clone(&self.deps),
            acceptor: self.acceptor.clone(),
        };
        self.tracker.spawn(
            async move {
                let _slot = slot;
                pair.serve(socket).await;
            }
            .instrument(info_span!("pair", connection_id, %peer)),
        );
    }
}

/// A held connection slot, released on drop.
struct Slot(Arc<AtomicUsize>);

impl Slot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let previous = active.fetch_add(1, Ordering::AcqRel);
        if previous >= max {
            active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self(Arc::clone(active)))
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An accepted client on its way to becoming a relaying pair.
struct Pair {
    connection_id: u64,
    broker_id: i32,
    peer: SocketAddr,
    deps: Arc<RelayDeps>,
    acceptor: Option<TlsServerAcceptor>,
}

impl Pair {
    async fn serve(self, socket: TcpStream) {
        let Some(client) = self.handshake(socket).await else {
            return;
        };

        let ctx = ConnectionContext::new(self.connection_id, self.broker_id, self.peer, client.is_tls());
        debug!(pair = %ctx, "client connected");

        match ConnectionProxy::establish(ctx, client, self.deps).await {
            Ok(proxy) => {
                proxy.run().await;
            }
            Err(ProxyError::Shutdown) => {
                debug!("shutdown before broker connection completed");
            }
            Err(e) => {
                warn!(broker_id = self.broker_id, error = %e, "could not open broker connection");
            }
        }
    }

    /// TLS handshake with the client, if configured. Failures drop the socket.
    async fn handshake(&self, socket: TcpStream) -> Option<ClientStream> {
        let Some(acceptor) = &self.acceptor else {
            return Some(Leg::Plain(socket));
        };

        let handshake_timeout = self.deps.tuning.tls_handshake_timeout();
        let result = tokio::select! {
            () = self.deps.shutdown.cancelled() => return None,
            result = timeout(handshake_timeout, acceptor.accept(socket)) => result,
        };

        match result {
            Ok(Ok(stream)) => Some(Leg::Tls(stream)),
            Ok(Err(e)) => {
                self.deps.metrics.record_tls_failure(side::CLIENT);
                warn!(error = %e, "client TLS handshake failed");
                None
            }
            Err(_) => {
                self.deps.metrics.record_tls_failure(side::CLIENT);
                warn!(timeout = ?handshake_timeout, "client TLS handshake timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerMapping, Endpoint};

    const CONFIG: &str = r"
listen:
  bind_host: '127.0.0.1'
brokers:
  - broker_id: 1
    address: '127.0.0.1:1'
    advertised: 'proxy.test:19092'
    bind: '127.0.0.1:0'
  - broker_id: 2
    address: '127.0.0.1:2'
    advertised: 'proxy.test:19093'
    bind: '127.0.0.1:0'
metrics:
  enabled: false
";

    fn manager(yaml: &str) -> ListenerManager {
        let config = RelayConfig::from_str(yaml).unwrap();
        let registry = SharedRegistry::new(config.build_registry().unwrap());
        ListenerManager::new(&config, registry, Arc::new(ProxyMetrics::new())).unwrap()
    }

    fn registry(ids: &[i32]) -> BrokerRegistry {
        BrokerRegistry::new(
            ids.iter()
                .map(|id| {
                    BrokerMapping::new(
                        *id,
                        Endpoint::new("127.0.0.1", 9000 + *id as u16),
                        Endpoint::new("proxy.test", 19091 + *id as u16),
                    )
                })
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_bind_one_listener_per_mapping() {
        let manager = manager(CONFIG);
        let bound = manager.bind().await.unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].0, 1);
        assert_eq!(bound[1].0, 2);
        assert_ne!(bound[0].1.port(), 0);
        assert_ne!(bound[0].1, bound[1].1);
    }

    #[tokio::test]
    async fn test_proxied_subset() {
        let yaml = format!("{CONFIG}proxied_brokers: [2]\n");
        let manager = manager(&yaml);
        let bound = manager.bind().await.unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].0, 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let manager = Arc::new(manager(CONFIG));
        manager.bind().await.unwrap();
        let shutdown = manager.shutdown_handle();

        let running = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.run().await }
        });
        shutdown.cancel();

        let result = timeout(Duration::from_secs(2), running).await;
        assert!(result.unwrap().unwrap().is_ok());
        assert_eq!(manager.active_pairs(), 0);
    }

    #[test]
    fn test_reload_same_brokers() {
        let manager = manager(CONFIG);
        manager.reload_registry(registry(&[1, 2])).unwrap();
    }

    #[test]
    fn test_reload_rejects_removed_listener() {
        let manager = manager(CONFIG);
        let result = manager.reload_registry(registry(&[1]));
        assert!(matches!(result, Err(ConfigError::ListenerSetChanged(_))));
    }

    #[test]
    fn test_reload_rejects_new_broker_when_proxying_all() {
        let manager = manager(CONFIG);
        let result = manager.reload_registry(registry(&[1, 2, 3]));
        assert!(matches!(result, Err(ConfigError::ListenerSetChanged(_))));
    }

    #[test]
    fn test_reload_allows_extra_broker_outside_subset() {
        let yaml = format!("{CONFIG}proxied_brokers: [1, 2]\n");
        let manager = manager(&yaml);
        manager.reload_registry(registry(&[1, 2, 3])).unwrap();
    }

    #[test]
    fn test_reload_config_rejects_bind_change() {
        let manager = manager(CONFIG);
        let changed = CONFIG.replace("bind: '127.0.0.1:0'\n  - broker_id: 2", "bind: '127.0.0.1:7777'\n  - broker_id: 2");
        let config = RelayConfig::from_str(&changed).unwrap();
        assert!(matches!(
            manager.reload(&config),
            Err(ConfigError::ListenerSetChanged(_))
        ));
    }

    #[test]
    fn test_slot_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = Slot::acquire(&active, 2).unwrap();
        let _second = Slot::acquire(&active, 2).unwrap();
        assert!(Slot::acquire(&active, 2).is_none());
        assert_eq!(active.load(Ordering::Acquire), 2);

        drop(first);
        assert!(Slot::acquire(&active, 2).is_some());
    }
}
