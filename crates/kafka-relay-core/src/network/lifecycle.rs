//! Teardown bookkeeping for one connection pair.
//!
//! Both relay directions share a [`PairLifecycle`]. Whichever one stops first
//! calls [`close`](PairLifecycle::close), which cancels the other. Only that
//! first call is recorded; later calls only cancel again, which is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::metrics::ProxyMetrics;
use crate::protocol::PendingRequestTable;

/// Where a pair is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PairState {
    /// Client accepted, broker leg being opened.
    Connecting = 0,
    /// Both legs open, frames flowing.
    Relaying = 1,
    /// Teardown started; directions are winding down.
    Closing = 2,
    /// Both legs released.
    Closed = 3,
}

impl PairState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Relaying,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a pair was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientEof,
    BrokerEof,
    /// A relay error; carries [`ProxyError::kind`](crate::error::ProxyError::kind).
    Fault(&'static str),
    Shutdown,
}

impl CloseReason {
    /// Label for `connection_pairs_closed_total`.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::ClientEof => "client_eof",
            Self::BrokerEof => "broker_eof",
            Self::Fault(_) => "fault",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(kind) => write!(f, "fault ({kind})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Shared state machine of one pair.
pub struct PairLifecycle {
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
    finished: AtomicBool,
    token: CancellationToken,
    metrics: Arc<ProxyMetrics>,
}

impl PairLifecycle {
    /// Start a pair in `Connecting`. The pair token is a child of `shutdown`.
    #[must_use]
    pub fn new(shutdown: &CancellationToken, metrics: Arc<ProxyMetrics>) -> Self {
        metrics.pair_opened();
        Self {
            state: AtomicU8::new(PairState::Connecting as u8),
            reason: OnceLock::new(),
            finished: AtomicBool::new(false),
            token: shutdown.child_token(),
            metrics,
        }
    }

    #[must_use]
    pub fn state(&self) -> PairState {
        PairState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Cancelled once the pair starts closing, or on global shutdown.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// `Connecting -> Relaying`. Returns false if the pair already started
    /// closing.
    pub fn mark_relaying(&self) -> bool {
        self.state
            .compare_exchange(
                PairState::Connecting as u8,
                PairState::Relaying as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Begin teardown. Returns true for the call that actually moved the pair
    /// into `Closing`; only that call's reason is kept and counted.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        let won = loop {
            if current >= PairState::Closing as u8 {
                break false;
            }
            match self.state.compare_exchange_weak(
                current,
                PairState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break true,
                Err(actual) => current = actual,
            }
        };

        if won {
            let _ = self.reason.set(reason);
            self.metrics.record_close(reason.label());
            if let CloseReason::Fault(kind) = reason {
                self.metrics.record_fault(kind);
            }
        }
        self.token.cancel();
        won
    }

    /// Release the pair: `Closed`, pending table emptied, gauge decremented.
    ///
    /// Runs once; later calls return false. A pair that was never closed is
    /// closed with [`CloseReason::Shutdown`] first.
    pub fn finish(&self, pending: &Mutex<PendingRequestTable>) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close(CloseReason::Shutdown);
        pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.state.store(PairState::Closed as u8, Ordering::Release);
        self.metrics.pair_closed();
        true
    }
}

impl Drop for PairLifecycle {
    fn drop(&mut self) {
        // Task aborted before finish(): still release the gauge.
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.close(CloseReason::Shutdown);
            self.state.store(PairState::Closed as u8, Ordering::Release);
            self.metrics.pair_closed();
        }
    }
}

impl fmt::Debug for PairLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairLifecycle")
            .field("state", &self.state())
            .field("reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}
