//! Mock Kafka broker for integration testing.
//!
//! Accepts plain TCP or TLS, frames traffic with the relay's own
//! [`KafkaCodec`], records every request and answers with a configurable
//! [`Reply`].
//!
//! Requests without a registered handler are echoed: the response carries the
//! request's correlation id followed by the full request bytes, so tests can
//! check that payloads crossed the relay intact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::protocol::{FrameHeader, KafkaCodec};

/// API keys used by the tests.
pub mod api_keys {
    pub const PRODUCE: i16 = 0;
    pub const FETCH: i16 = 1;
    pub const METADATA: i16 = 3;
    pub const FIND_COORDINATOR: i16 = 10;
    pub const API_VERSIONS: i16 = 18;
    pub const DESCRIBE_CLUSTER: i16 = 60;
}

/// One request as the broker received it.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    /// Frame body, length prefix stripped.
    pub request_bytes: Bytes,
}

impl BrokerCall {
    fn from_frame(frame: Bytes) -> Option<Self> {
        let header = FrameHeader::parse(&frame).ok()?;
        Some(Self {
            api_key: header.api_key,
            api_version: header.api_version,
            correlation_id: header.correlation_id,
            request_bytes: frame,
        })
    }
}

/// What the mock broker does with a request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Send this response body (a length prefix is added).
    Frame(Bytes),
    /// Send this response body after a pause, holding up later requests on
    /// the same connection the way a parked `JoinGroup` does.
    Delayed(Duration, Bytes),
    /// Send nothing, as a broker does for `acks = 0`.
    Silent,
    /// Close the connection without answering.
    Close,
}

/// Response generator function type.
pub type ResponseGenerator = Arc<dyn Fn(&BrokerCall) -> Reply + Send + Sync>;

#[derive(Default)]
struct BrokerState {
    calls: Mutex<Vec<BrokerCall>>,
    handlers: RwLock<HashMap<i16, ResponseGenerator>>,
    connections: AtomicUsize,
    /// Leaf certificate of each TLS client that completed a handshake.
    peer_certificates: Mutex<Vec<Option<CertificateDer<'static>>>>,
    handshake_failures: AtomicUsize,
}

impl BrokerState {
    async fn reply_to(&self, call: &BrokerCall) -> Reply {
        self.calls.lock().await.push(call.clone());
        match self.handlers.read().await.get(&call.api_key) {
            Some(handler) => handler(call),
            None => Reply::Frame(echo_body(call)),
        }
    }
}

/// Mock Kafka broker for testing.
pub struct MockBroker {
    address: String,
    state: Arc<BrokerState>,
    stopped: CancellationToken,
    tls: Option<TlsAcceptor>,
}

impl MockBroker {
    /// Create a broker that will bind to `address` when started.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Arc::new(BrokerState::default()),
            stopped: CancellationToken::new(),
            tls: None,
        }
    }

    /// Terminate TLS on accepted connections with `config`.
    #[must_use]
    pub fn with_tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(TlsAcceptor::from(config));
        self
    }

    /// Bind and start serving. Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        self.address = listener.local_addr()?.to_string();

        let state = Arc::clone(&self.state);
        let stopped = self.stopped.clone();
        let tls = self.tls.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    () = stopped.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                };
                state.connections.fetch_add(1, Ordering::AcqRel);
                let state = Arc::clone(&state);
                let stopped = stopped.clone();
                match &tls {
                    None => {
                        tokio::spawn(serve(stream, state, stopped));
                    }
                    Some(acceptor) => {
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let Ok(tls) = acceptor.accept(stream).await else {
                                state.handshake_failures.fetch_add(1, Ordering::AcqRel);
                                return;
                            };
                            let leaf = tls
                                .get_ref()
                                .1
                                .peer_certificates()
                                .and_then(|chain| chain.first())
                                .map(|cert| cert.clone().into_owned());
                            state.peer_certificates.lock().await.push(leaf);
                            serve(tls, state, stopped).await;
                        });
                    }
                }
            }
        });

        Ok(self.address.clone())
    }

    /// Stop accepting and drop every open connection.
    pub fn stop(&mut self) {
        self.stopped.cancel();
    }

    /// Answer requests for `api_key` with `handler` from now on.
    pub async fn register_handler(&self, api_key: i16, handler: ResponseGenerator) {
        self.state.handlers.write().await.insert(api_key, handler);
    }

    pub async fn get_calls(&self) -> Vec<BrokerCall> {
        self.state.calls.lock().await.clone()
    }

    pub async fn get_calls_for_api(&self, api_key: i16) -> Vec<BrokerCall> {
        let calls = self.state.calls.lock().await;
        calls.iter().filter(|c| c.api_key == api_key).cloned().collect()
    }

    pub async fn clear_calls(&self) {
        self.state.calls.lock().await.clear();
    }

    /// Client certificates seen on TLS connections, in handshake order;
    /// `None` for a client that presented none.
    pub async fn peer_certificates(&self) -> Vec<Option<CertificateDer<'static>>> {
        self.state.peer_certificates.lock().await.clone()
    }

    /// TLS handshakes that failed.
    #[must_use]
    pub fn handshake_failures(&self) -> usize {
        self.state.handshake_failures.load(Ordering::Acquire)
    }

    /// Connections accepted since start.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::Acquire)
    }

    /// The broker address; the bound one once started.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve<S>(stream: S, state: Arc<BrokerState>, stopped: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, KafkaCodec::new());
    loop {
        let frame = tokio::select! {
            () = stopped.cancelled() => return,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => frame.freeze(),
                _ => return,
            },
        };
        // Headerless junk gets no answer.
        let Some(call) = BrokerCall::from_frame(frame) else {
            continue;
        };
        match state.reply_to(&call).await {
            Reply::Frame(body) => {
                if framed.send(body).await.is_err() {
                    return;
                }
            }
            Reply::Delayed(delay, body) => {
                tokio::select! {
                    () = stopped.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if framed.send(body).await.is_err() {
                    return;
                }
            }
            Reply::Silent => {}
            Reply::Close => return,
        }
    }
}

/// Correlation id followed by the whole request.
fn echo_body(call: &BrokerCall) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + call.request_bytes.len());
    buf.put_i32(call.correlation_id);
    buf.extend_from_slice(&call.request_bytes);
    buf.freeze()
}

/// Response generators and request builders for common API types.
///
/// Responses are built with `kafka-protocol` and encoded at the version the
/// request asked for.
pub mod responses {
    use super::*;

    use kafka_protocol::messages::api_versions_response::ApiVersion;
    use kafka_protocol::messages::describe_cluster_response::DescribeClusterBroker;
    use kafka_protocol::messages::find_coordinator_response::Coordinator;
    use kafka_protocol::messages::metadata_response::MetadataResponseBroker;
    use kafka_protocol::messages::{
        ApiVersionsResponse, BrokerId, DescribeClusterResponse, FindCoordinatorResponse,
        MetadataResponse, RequestHeader, ResponseHeader,
    };
    use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, Request, StrBytes};

    /// A broker as the real cluster reports it: id, host, port.
    pub type BrokerAddress = (i32, String, u16);

    /// Encode a response header and body at `version` (no length prefix).
    ///
    /// # Panics
    ///
    /// Panics if `body` cannot be encoded at `version`.
    pub fn encode<T: Encodable + HeaderVersion>(correlation_id: i32, body: &T, version: i16) -> Bytes {
        let mut header = ResponseHeader::default();
        header.correlation_id = correlation_id;
        crate::rewrite::encode_response(&header, body, version).expect("response should encode")
    }

    /// Decode a response body (length prefix removed).
    ///
    /// # Panics
    ///
    /// Panics if the frame does not decode at `version`.
    pub fn decode<T: Decodable + HeaderVersion>(frame: &[u8], version: i16) -> (ResponseHeader, T) {
        crate::rewrite::decode_response(frame, version).expect("response should decode")
    }

    /// Encode a request with a v1+ header (no length prefix).
    ///
    /// # Panics
    ///
    /// Panics if `body` cannot be encoded at `version`.
    pub fn request<T: Request>(correlation_id: i32, body: &T, version: i16) -> Bytes {
        let mut header = RequestHeader::default();
        header.request_api_key = T::KEY;
        header.request_api_version = version;
        header.correlation_id = correlation_id;
        header.client_id = Some(StrBytes::from_static_str("relay-test"));

        let mut buf = BytesMut::new();
        header
            .encode(&mut buf, T::header_version(version))
            .expect("request header should encode");
        body.encode(&mut buf, version)
            .expect("request body should encode");
        buf.freeze()
    }

    /// A request frame with the fixed header and an arbitrary payload.
    #[must_use]
    pub fn raw_request(api_key: i16, api_version: i16, correlation_id: i32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_i16(api_key);
        buf.put_i16(api_version);
        buf.put_i32(correlation_id);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    /// Echo the request back (the default for unregistered APIs).
    #[must_use]
    pub fn echo() -> ResponseGenerator {
        Arc::new(|call: &BrokerCall| Reply::Frame(echo_body(call)))
    }

    /// Echo the request back after `delay`.
    #[must_use]
    pub fn delayed(delay: Duration) -> ResponseGenerator {
        after(delay, echo())
    }

    /// Hold back every frame `inner` answers with by `delay`.
    #[must_use]
    pub fn after(delay: Duration, inner: ResponseGenerator) -> ResponseGenerator {
        Arc::new(move |call: &BrokerCall| match inner(call) {
            Reply::Frame(body) => Reply::Delayed(delay, body),
            other => other,
        })
    }

    /// Never answer.
    #[must_use]
    pub fn silent() -> ResponseGenerator {
        Arc::new(|_: &BrokerCall| Reply::Silent)
    }

    /// Hang up on the client.
    #[must_use]
    pub fn close() -> ResponseGenerator {
        Arc::new(|_: &BrokerCall| Reply::Close)
    }

    /// Answer with a correlation id the client never sent.
    #[must_use]
    pub fn wrong_correlation(offset: i32) -> ResponseGenerator {
        Arc::new(move |call: &BrokerCall| {
            let mut buf = BytesMut::with_capacity(8);
            buf.put_i32(call.correlation_id.wrapping_add(offset));
            buf.put_i32(0);
            Reply::Frame(buf.freeze())
        })
    }

    /// Metadata response listing `brokers`, controller set to the first one.
    #[must_use]
    pub fn metadata(brokers: Vec<BrokerAddress>) -> ResponseGenerator {
        Arc::new(move |call: &BrokerCall| {
            let mut response = MetadataResponse::default();
            for (id, host, port) in &brokers {
                let mut broker = MetadataResponseBroker::default();
                broker.node_id = BrokerId(*id);
                broker.host = StrBytes::from_string(host.clone());
                broker.port = i32::from(*port);
                response.brokers.push(broker);
            }
            if call.api_version >= 1 {
                response.controller_id = BrokerId(brokers.first().map_or(-1, |b| b.0));
            }
            Reply::Frame(encode(call.correlation_id, &response, call.api_version))
        })
    }

    /// FindCoordinator response naming one coordinator.
    #[must_use]
    pub fn find_coordinator(coordinator: BrokerAddress) -> ResponseGenerator {
        Arc::new(move |call: &BrokerCall| {
            let (id, host, port) = &coordinator;
            let mut response = FindCoordinatorResponse::default();
            if call.api_version < 4 {
                response.node_id = BrokerId(*id);
                response.host = StrBytes::from_string(host.clone());
                response.port = i32::from(*port);
            } else {
                let mut entry = Coordinator::default();
                entry.key = StrBytes::from_static_str("test-group");
                entry.node_id = BrokerId(*id);
                entry.host = StrBytes::from_string(host.clone());
                entry.port = i32::from(*port);
                response.coordinators.push(entry);
            }
            Reply::Frame(encode(call.correlation_id, &response, call.api_version))
        })
    }

    /// ApiVersions response advertising `(api_key, min, max)` per entry.
    #[must_use]
    pub fn api_versions(apis: Vec<(i16, i16, i16)>) -> ResponseGenerator {
        Arc::new(move |call: &BrokerCall| {
            let mut response = ApiVersionsResponse::default();
            for (api_key, min, max) in &apis {
                let mut api = ApiVersion::default();
                api.api_key = *api_key;
                api.min_version = *min;
                api.max_version = *max;
                response.api_keys.push(api);
            }
            Reply::Frame(encode(call.correlation_id, &response, call.api_version))
        })
    }

    /// DescribeCluster response listing `brokers`.
    #[must_use]
    pub fn describe_cluster(brokers: Vec<BrokerAddress>) -> ResponseGenerator {
        Arc::new(move |call: &BrokerCall| {
            let mut response = DescribeClusterResponse::default();
            for (id, host, port) in &brokers {
                let mut broker = DescribeClusterBroker::default();
                broker.broker_id = BrokerId(*id);
                broker.host = StrBytes::from_string(host.clone());
                broker.port = i32::from(*port);
                response.brokers.push(broker);
            }
            Reply::Frame(encode(call.correlation_id, &response, call.api_version))
        })
    }
}
