//! Test harness for integration testing of the relay.
//!
//! Provides a complete test environment with:
//! - One [`MockBroker`] per broker id
//! - A running [`ListenerManager`] with one listener per broker, bound to an
//!   ephemeral port
//! - A [`TestClient`] for speaking length-prefixed frames through the relay

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::broker::{Endpoint, SharedRegistry};
use crate::config::{
    BrokerMappingConfig, BrokerTlsConfig, ClientTlsConfig, ListenConfig, LoggingConfig, MetricsConfig, RelayConfig,
    RelayTuning,
};
use crate::error::Result;
use crate::metrics::ProxyMetrics;
use crate::network::ListenerManager;

use super::mock_broker::responses::BrokerAddress;
use super::mock_broker::{BrokerCall, MockBroker, ResponseGenerator};

/// Advertised endpoint given to broker `id` in harness configurations.
#[must_use]
pub fn advertised_for(broker_id: i32) -> Endpoint {
    Endpoint::new(format!("proxy-{broker_id}.test"), 19090 + broker_id as u16)
}

/// A running relay in front of mock brokers.
pub struct RelayTestHarness {
    brokers: BTreeMap<i32, MockBroker>,
    listeners: BTreeMap<i32, SocketAddr>,
    /// The running listener manager.
    pub manager: Arc<ListenerManager>,
    /// The configuration the relay was started with.
    pub config: RelayConfig,
    run: Option<JoinHandle<Result<()>>>,
}

impl RelayTestHarness {
    /// Two brokers (ids 1 and 2) with default tuning.
    pub async fn new() -> Self {
        TestHarnessBuilder::new().build().await
    }

    /// The mock behind `broker_id`.
    ///
    /// # Panics
    ///
    /// Panics if the harness has no such broker.
    #[must_use]
    pub fn broker(&self, broker_id: i32) -> &MockBroker {
        &self.brokers[&broker_id]
    }

    /// Real addresses of all mock brokers, as a cluster would report them.
    #[must_use]
    pub fn broker_addresses(&self) -> Vec<BrokerAddress> {
        self.brokers
            .iter()
            .map(|(id, broker)| {
                let address: SocketAddr = broker
                    .address()
                    .parse()
                    .expect("mock broker address");
                (*id, address.ip().to_string(), address.port())
            })
            .collect()
    }

    /// Where the relay listens for clients of `broker_id`.
    ///
    /// # Panics
    ///
    /// Panics if `broker_id` has no listener.
    #[must_use]
    pub fn listener_addr(&self, broker_id: i32) -> SocketAddr {
        self.listeners[&broker_id]
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        self.manager.metrics()
    }

    /// Register a response handler on one mock broker.
    pub async fn register_handler(&self, broker_id: i32, api_key: i16, handler: ResponseGenerator) {
        self.broker(broker_id).register_handler(api_key, handler).await;
    }

    /// Register a response handler on every mock broker.
    pub async fn register_handler_all(&self, api_key: i16, handler: ResponseGenerator) {
        for broker in self.brokers.values() {
            broker.register_handler(api_key, Arc::clone(&handler)).await;
        }
    }

    /// Calls recorded by one mock broker.
    pub async fn broker_calls(&self, broker_id: i32) -> Vec<BrokerCall> {
        self.broker(broker_id).get_calls().await
    }

    /// Open a plain TCP client to the listener of `broker_id`.
    ///
    /// # Panics
    ///
    /// Panics if the connection cannot be made.
    pub async fn connect(&self, broker_id: i32) -> TestClient<TcpStream> {
        let stream = TcpStream::connect(self.listener_addr(broker_id))
            .await
            .expect("connect to relay listener");
        stream.set_nodelay(true).expect("set nodelay");
        TestClient::new(stream)
    }

    /// Cancel the relay and wait for it to drain.
    pub async fn shutdown(&mut self) {
        self.manager.shutdown_handle().cancel();
        if let Some(run) = self.run.take() {
            let _ = run.await;
        }
    }
}

impl Drop for RelayTestHarness {
    fn drop(&mut self) {
        self.manager.shutdown_handle().cancel();
    }
}

/// Builder for creating a test harness with specific configuration.
pub struct TestHarnessBuilder {
    broker_ids: Vec<i32>,
    proxied_brokers: Vec<i32>,
    tuning: RelayTuning,
    max_connections: usize,
    client_tls: Option<ClientTlsConfig>,
    broker_tls: Option<BrokerTlsConfig>,
    broker_server_tls: Option<Arc<rustls::ServerConfig>>,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        let tuning = RelayTuning {
            shutdown_grace_ms: 2_000,
            connect_timeout_ms: 2_000,
            ..RelayTuning::default()
        };
        Self {
            broker_ids: vec![1, 2],
            proxied_brokers: Vec::new(),
            tuning,
            max_connections: 1_000,
            client_tls: None,
            broker_tls: None,
            broker_server_tls: None,
        }
    }

    /// Broker ids to start mocks for.
    #[must_use]
    pub fn brokers(mut self, ids: &[i32]) -> Self {
        self.broker_ids = ids.to_vec();
        self
    }

    /// Restrict listeners to a subset of brokers.
    #[must_use]
    pub fn proxied_brokers(mut self, ids: &[i32]) -> Self {
        self.proxied_brokers = ids.to_vec();
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.tuning.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.tuning.max_in_flight = max;
        self
    }

    #[must_use]
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.tuning.max_frame_size = max;
        self
    }

    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Terminate TLS from clients with this material.
    #[must_use]
    pub fn client_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.client_tls = Some(tls);
        self
    }

    /// Dial the mock brokers over TLS with this material.
    #[must_use]
    pub fn broker_tls(mut self, tls: BrokerTlsConfig) -> Self {
        self.broker_tls = Some(tls);
        self
    }

    /// Make every mock broker a TLS server.
    #[must_use]
    pub fn broker_server_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.broker_server_tls = Some(config);
        self
    }

    /// Start the mock brokers and the relay.
    ///
    /// # Panics
    ///
    /// Panics if any mock broker or listener fails to start.
    pub async fn build(self) -> RelayTestHarness {
        let mut brokers = BTreeMap::new();
        let mut mappings = Vec::with_capacity(self.broker_ids.len());
        for id in &self.broker_ids {
            let mut broker = MockBroker::new("127.0.0.1:0");
            if let Some(tls) = &self.broker_server_tls {
                broker = broker.with_tls(Arc::clone(tls));
            }
            let address = broker.start().await.expect("start mock broker");
            mappings.push(BrokerMappingConfig {
                broker_id: *id,
                address,
                advertised: advertised_for(*id).to_string(),
                bind: Some("127.0.0.1:0".to_string()),
            });
            brokers.insert(*id, broker);
        }

        let config = RelayConfig {
            listen: ListenConfig {
                bind_host: "127.0.0.1".to_string(),
                max_connections: self.max_connections,
            },
            brokers: mappings,
            proxied_brokers: self.proxied_brokers,
            client_tls: self.client_tls,
            broker_tls: self.broker_tls,
            relay: self.tuning,
            metrics: MetricsConfig {
                enabled: false,
                ..MetricsConfig::default()
            },
            logging: LoggingConfig::default(),
        };

        let registry = SharedRegistry::new(config.build_registry().expect("valid registry"));
        let manager = Arc::new(
            ListenerManager::new(&config, registry, Arc::new(ProxyMetrics::new()))
                .expect("valid relay configuration"),
        );
        let listeners = manager
            .bind()
            .await
            .expect("bind relay listeners")
            .into_iter()
            .collect();

        let run = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.run().await }
        });

        RelayTestHarness {
            brokers,
            listeners,
            manager,
            config,
            run: Some(run),
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client end of a relay connection, plain or TLS.
pub struct TestClient<S> {
    stream: S,
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Write one frame with its length prefix.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub async fn send(&mut self, body: &[u8]) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(body);
        self.send_raw(&buf).await
    }

    /// Write bytes as-is, e.g. a deliberately broken prefix.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Read one frame; `None` once the relay closed the connection.
    ///
    /// # Errors
    ///
    /// Returns the socket error; a connection reset counts as closed.
    pub async fn recv(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        Ok(Some(Bytes::from(buf)))
    }

    /// [`recv`](Self::recv) bounded by `limit`; `Err` on timeout.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` if nothing arrived in time.
    pub async fn recv_within(&mut self, limit: Duration) -> std::io::Result<Option<Bytes>> {
        tokio::time::timeout(limit, self.recv())
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
    }

    /// Close the write half.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
