//! The relay for one client/broker connection pair.
//!
//! Each pair runs two independent loops in a single task:
//!
//! - **client -> broker**: decode a request frame, remember its API and
//!   version under its correlation id, forward the bytes unchanged.
//! - **broker -> client**: decode a response frame, look up the request it
//!   answers, rewrite broker addresses if the API is in the rewrite set,
//!   forward.
//!
//! Frames are never reordered within a direction. Each loop batches whatever
//! is already buffered before flushing, and the write side applies
//! backpressure once `relay.buffer_size` bytes are queued.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnector, SharedRegistry};
use crate::config::RelayTuning;
use crate::error::{ProxyError, Result};
use crate::metrics::prometheus::direction;
use crate::metrics::ProxyMetrics;
use crate::protocol::{
    expects_response, response_correlation_id, FrameHeader, KafkaCodec, PendingRequestTable,
};
use crate::rewrite::RewriteSet;

use super::context::ConnectionContext;
use super::lifecycle::{CloseReason, PairLifecycle};
use super::stream::{BrokerStream, ClientStream};

/// Upper bound on flushing and shutting down a writer during teardown.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Fastest the pending table is swept for expired requests.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Length prefix added back to each frame for byte accounting.
const PREFIX_LEN: u64 = 4;

/// Everything a pair needs that outlives it. Shared by all pairs.
#[derive(Clone)]
pub struct RelayDeps {
    pub registry: SharedRegistry,
    pub connector: BrokerConnector,
    pub rewrites: Arc<RewriteSet>,
    pub metrics: Arc<ProxyMetrics>,
    pub tuning: RelayTuning,
    pub shutdown: CancellationToken,
}

/// A client leg paired with its broker leg.
pub struct ConnectionProxy {
    ctx: ConnectionContext,
    client: ClientStream,
    broker: BrokerStream,
    deps: Arc<RelayDeps>,
    lifecycle: PairLifecycle,
    pending: Mutex<PendingRequestTable>,
}

impl ConnectionProxy {
    /// Open the broker leg for an accepted client.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnknownBroker`] if the listener's broker left the
    /// registry, [`ProxyError::BrokerUnavailable`] or [`ProxyError::Tls`] if
    /// the broker cannot be reached, and [`ProxyError::Shutdown`] if shutdown
    /// starts first. No proxy exists afterwards; the client socket is dropped.
    pub async fn establish(
        ctx: ConnectionContext,
        client: ClientStream,
        deps: Arc<RelayDeps>,
    ) -> Result<Self> {
        let lifecycle = PairLifecycle::new(&deps.shutdown, Arc::clone(&deps.metrics));
        let pending = Mutex::new(PendingRequestTable::new(deps.tuning.max_in_flight));

        let endpoint = deps.registry.snapshot().resolve(ctx.broker_id()).cloned();
        let connected = match endpoint {
            Some(endpoint) => {
                tokio::select! {
                    result = deps.connector.connect(
                        ctx.broker_id(),
                        &endpoint,
                        client.peer_certificate(),
                    ) => result,
                    () = lifecycle.token().cancelled() => Err(ProxyError::Shutdown),
                }
            }
            None => Err(ProxyError::UnknownBroker {
                broker_id: ctx.broker_id(),
            }),
        };

        match connected {
            Ok(broker) => Ok(Self {
                ctx,
                client,
                broker,
                deps,
                lifecycle,
                pending,
            }),
            Err(e) => {
                let reason = match &e {
                    ProxyError::Shutdown => CloseReason::Shutdown,
                    other => CloseReason::Fault(other.kind()),
                };
                lifecycle.close(reason);
                lifecycle.finish(&pending);
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Relay until either side closes, a fault occurs, or shutdown.
    ///
    /// Never fails: faults end the pair and are reported through the returned
    /// reason, metrics and logs.
    pub async fn run(self) -> CloseReason {
        let Self {
            ctx,
            client,
            broker,
            deps,
            lifecycle,
            pending,
        } = self;

        lifecycle.mark_relaying();
        debug!(pair = %ctx, "relaying");

        let tuning = &deps.tuning;
        let codec = KafkaCodec::with_max_frame_size(tuning.max_frame_size);
        let (client_read, client_write) = tokio::io::split(client);
        let (broker_read, broker_write) = tokio::io::split(broker);

        let requests = FramedRead::with_capacity(client_read, codec.clone(), tuning.buffer_size);
        let responses = FramedRead::with_capacity(broker_read, codec.clone(), tuning.buffer_size);
        let mut to_broker = FramedWrite::new(broker_write, codec.clone());
        to_broker.set_backpressure_boundary(tuning.buffer_size);
        let mut to_client = FramedWrite::new(client_write, codec);
        to_client.set_backpressure_boundary(tuning.buffer_size);

        let relay = Relay {
            ctx: &ctx,
            deps: &deps,
            lifecycle: &lifecycle,
            pending: &pending,
        };
        tokio::join!(
            relay.client_to_broker(requests, to_broker),
            relay.broker_to_client(responses, to_client),
        );

        lifecycle.finish(&pending);
        let reason = lifecycle.close_reason().unwrap_or(CloseReason::Shutdown);
        info!(pair = %ctx, %reason, "pair closed");
        reason
    }
}

/// Pair state borrowed by both directions.
#[derive(Clone, Copy)]
struct Relay<'a> {
    ctx: &'a ConnectionContext,
    deps: &'a RelayDeps,
    lifecycle: &'a PairLifecycle,
    pending: &'a Mutex<PendingRequestTable>,
}

impl Relay<'_> {
    async fn client_to_broker<R, W>(
        self,
        mut source: FramedRead<R, KafkaCodec>,
        mut sink: FramedWrite<W, KafkaCodec>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let outcome = tokio::select! {
            biased;
            () = self.lifecycle.token().cancelled() => None,
            result = self.forward_requests(&mut source, &mut sink) => Some(result),
        };
        self.wind_down(direction::CLIENT_TO_BROKER, CloseReason::ClientEof, outcome, &mut sink)
            .await;
    }

    async fn broker_to_client<R, W>(
        self,
        mut source: FramedRead<R, KafkaCodec>,
        mut sink: FramedWrite<W, KafkaCodec>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let outcome = tokio::select! {
            biased;
            () = self.lifecycle.token().cancelled() => None,
            result = self.forward_responses(&mut source, &mut sink) => Some(result),
        };
        self.wind_down(direction::BROKER_TO_CLIENT, CloseReason::BrokerEof, outcome, &mut sink)
            .await;
    }

    /// Record how the direction ended, then flush and shut down its writer.
    async fn wind_down<W>(
        &self,
        name: &'static str,
        eof: CloseReason,
        outcome: Option<Result<()>>,
        sink: &mut FramedWrite<W, KafkaCodec>,
    ) where
        W: AsyncWrite + Unpin,
    {
        match outcome {
            Some(Ok(())) => {
                debug!(pair = %self.ctx, direction = name, "end of stream");
                self.lifecycle.close(eof);
            }
            Some(Err(e)) => {
                log_fault(self.ctx, name, &e);
                self.lifecycle.close(CloseReason::Fault(e.kind()));
            }
            None => {
                self.lifecycle.close(CloseReason::Shutdown);
            }
        }

        match timeout(WRITER_SHUTDOWN_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(pair = %self.ctx, direction = name, error = %e, "writer shutdown failed"),
            Err(_) => debug!(pair = %self.ctx, direction = name, "writer shutdown timed out"),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingRequestTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn forward_requests<R, W>(
        &self,
        source: &mut FramedRead<R, KafkaCodec>,
        sink: &mut FramedWrite<W, KafkaCodec>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = source.next().await {
            let mut batch = Batch::default();
            sink.feed(self.admit_request(frame?, &mut batch)?).await?;

            // Take whatever else is already decoded before paying for a flush.
            let mut eof = false;
            while let Some(next) = source.next().now_or_never() {
                match next {
                    Some(frame) => sink.feed(self.admit_request(frame?, &mut batch)?).await?,
                    None => {
                        eof = true;
                        break;
                    }
                }
            }

            sink.flush().await?;
            batch.record(&self.deps.metrics, direction::CLIENT_TO_BROKER);
            if eof {
                break;
            }
        }
        Ok(())
    }

    /// Parse a request header and register it before it leaves the relay.
    fn admit_request(&self, frame: BytesMut, batch: &mut Batch) -> Result<Bytes> {
        let header = FrameHeader::parse(&frame)?;
        if expects_response(&header, &frame)? {
            self.pending().record(&header)?;
        } else {
            debug!(pair = %self.ctx, request = %header, "request expects no response");
        }
        batch.add(frame.len());
        Ok(frame.freeze())
    }

    async fn forward_responses<R, W>(
        &self,
        source: &mut FramedRead<R, KafkaCodec>,
        sink: &mut FramedWrite<W, KafkaCodec>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let request_timeout = self.deps.tuning.request_timeout();
        let mut sweep = interval((request_timeout / 2).max(MIN_SWEEP_INTERVAL));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                next = source.next() => {
                    let Some(frame) = next else {
                        return Ok(());
                    };
                    let mut batch = Batch::default();
                    sink.feed(self.match_response(frame?, &mut batch)?).await?;

                    let mut eof = false;
                    while let Some(next) = source.next().now_or_never() {
                        match next {
                            Some(frame) => sink.feed(self.match_response(frame?, &mut batch)?).await?,
                            None => {
                                eof = true;
                                break;
                            }
                        }
                    }

                    sink.flush().await?;
                    batch.record(&self.deps.metrics, direction::BROKER_TO_CLIENT);
                    if eof {
                        return Ok(());
                    }
                }
                _ = sweep.tick() => self.evict_expired(request_timeout),
            }
        }
    }

    /// Pair a response with its request and rewrite it if needed.
    ///
    /// A response to a request that already timed out is still matched
    /// against the expired entries and delivered.
    fn match_response(&self, frame: BytesMut, batch: &mut Batch) -> Result<Bytes> {
        let correlation_id = response_correlation_id(&frame)?;
        let request = {
            let mut pending = self.pending();
            match pending.complete(correlation_id) {
                Some(request) => request,
                None => {
                    let request = pending
                        .take_expired(correlation_id)
                        .ok_or(ProxyError::UnmatchedCorrelation { correlation_id })?;
                    info!(
                        pair = %self.ctx,
                        correlation_id,
                        api_key = request.api_key,
                        elapsed = ?request.sent_at.elapsed(),
                        "response arrived after the request timeout"
                    );
                    self.deps.metrics.record_late_response();
                    request
                }
            }
        };

        let registry = self.deps.registry.snapshot();
        let outgoing = match self.deps.rewrites.apply(&request, &frame, &registry)? {
            Some((api, outcome)) => {
                let misses = outcome.misses as u64;
                match outcome.frame {
                    Some(rewritten) => {
                        debug!(
                            pair = %self.ctx,
                            api,
                            correlation_id,
                            rewritten = outcome.rewritten,
                            "rewrote response"
                        );
                        self.deps.metrics.record_rewrite(api, misses);
                        rewritten
                    }
                    None => {
                        self.deps.metrics.record_rewrite_misses(api, misses);
                        frame.freeze()
                    }
                }
            }
            None => frame.freeze(),
        };

        batch.add(outgoing.len());
        Ok(outgoing)
    }

    fn evict_expired(&self, request_timeout: Duration) {
        let (evicted, remaining) = {
            let mut pending = self.pending();
            (pending.evict_expired(request_timeout), pending.len())
        };
        if evicted > 0 {
            warn!(
                pair = %self.ctx,
                evicted,
                remaining,
                timeout = ?request_timeout,
                "requests passed the request timeout without a response"
            );
            self.deps.metrics.record_pending_timeouts(evicted as u64);
        }
    }
}

/// Frames and bytes handed to the writer between two flushes.
#[derive(Debug, Default)]
struct Batch {
    frames: u64,
    bytes: u64,
}

impl Batch {
    fn add(&mut self, body_len: usize) {
        self.frames += 1;
        self.bytes += body_len as u64 + PREFIX_LEN;
    }

    fn record(&self, metrics: &ProxyMetrics, direction: &str) {
        metrics.record_frames(direction, self.frames, self.bytes);
    }
}

fn log_fault(ctx: &ConnectionContext, direction: &'static str, error: &ProxyError) {
    match error {
        ProxyError::Transport(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            debug!(pair = %ctx, direction, error = %error, "peer went away");
        }
        _ => {
            warn!(pair = %ctx, direction, kind = error.kind(), error = %error, "closing pair");
        }
    }
}
