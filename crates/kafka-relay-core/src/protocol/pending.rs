//! Per-pair table of requests awaiting a response.
//!
//! Responses carry only a correlation id; the table remembers which API and
//! version each in-flight id belongs to so the response can be classified
//! (and rewritten) correctly.
//!
//! Entries older than the request timeout are moved to a bounded set of
//! expired entries rather than forgotten, so a slow but legitimate response
//! (a `JoinGroup` parked for the rebalance timeout, say) is still classified.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::{ProxyError, Result};

use super::header::FrameHeader;

/// What the relay remembers about a forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub api_key: i16,
    pub api_version: i16,
    pub sent_at: Instant,
}

/// In-flight requests of one connection pair, keyed by correlation id.
#[derive(Debug)]
pub struct PendingRequestTable {
    entries: HashMap<i32, PendingRequest>,
    max_in_flight: usize,
    /// Evicted entries, still claimable by a late response.
    expired: HashMap<i32, PendingRequest>,
    /// Eviction order of `expired`, oldest first. May hold ids already taken.
    expired_order: VecDeque<i32>,
}

impl PendingRequestTable {
    /// A table holding up to `max_in_flight` live entries and as many
    /// expired ones.
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_in_flight,
            expired: HashMap::new(),
            expired_order: VecDeque::new(),
        }
    }

    /// Record a request about to be forwarded.
    ///
    /// # Errors
    ///
    /// Fails if the correlation id is already in flight or the table is full.
    /// Either way the pair can no longer match responses reliably.
    pub fn record(&mut self, header: &FrameHeader) -> Result<()> {
        self.record_at(header, Instant::now())
    }

    fn record_at(&mut self, header: &FrameHeader, sent_at: Instant) -> Result<()> {
        if self.entries.contains_key(&header.correlation_id) {
            return Err(ProxyError::DuplicateCorrelation {
                correlation_id: header.correlation_id,
            });
        }
        if self.entries.len() >= self.max_in_flight {
            return Err(ProxyError::TooManyInFlight {
                limit: self.max_in_flight,
            });
        }
        // A reused id belongs to the new request from now on.
        self.expired.remove(&header.correlation_id);
        self.entries.insert(
            header.correlation_id,
            PendingRequest {
                api_key: header.api_key,
                api_version: header.api_version,
                sent_at,
            },
        );
        Ok(())
    }

    /// Remove and return the entry for a response.
    pub fn complete(&mut self, correlation_id: i32) -> Option<PendingRequest> {
        self.entries.remove(&correlation_id)
    }

    /// Claim an entry evicted by [`evict_expired`](Self::evict_expired) for a
    /// response that arrived after the timeout.
    pub fn take_expired(&mut self, correlation_id: i32) -> Option<PendingRequest> {
        self.expired.remove(&correlation_id)
    }

    /// Move entries older than `timeout` out of the live set. Returns how many
    /// were moved.
    ///
    /// Expired entries stay claimable through
    /// [`take_expired`](Self::take_expired); beyond `max_in_flight` of them
    /// the oldest are forgotten.
    pub fn evict_expired(&mut self, timeout: Duration) -> usize {
        self.evict_expired_at(timeout, Instant::now())
    }

    fn evict_expired_at(&mut self, timeout: Duration, now: Instant) -> usize {
        let stale: Vec<i32> = self
            .entries
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(pending) = self.entries.remove(id) {
                self.expired.insert(*id, pending);
                self.expired_order.push_back(*id);
            }
        }

        while self.expired.len() > self.max_in_flight {
            let Some(oldest) = self.expired_order.pop_front() else {
                break;
            };
            self.expired.remove(&oldest);
        }
        // Ids taken or reused since they expired leave stale order entries.
        if self.expired_order.len() > self.max_in_flight.saturating_mul(2) {
            let expired = &self.expired;
            self.expired_order.retain(|id| expired.contains_key(id));
        }

        stale.len()
    }

    /// Expired entries still waiting for a late response.
    #[must_use]
    pub fn expired_len(&self) -> usize {
        self.expired.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything; called when the pair closes.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.expired.clear();
        self.expired_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(correlation_id: i32) -> FrameHeader {
        FrameHeader {
            api_key: 3,
            api_version: 12,
            correlation_id,
        }
    }

    #[test]
    fn test_record_then_complete() {
        let mut table = PendingRequestTable::new(16);
        table.record(&header(1)).unwrap();
        table.record(&header(2)).unwrap();
        assert_eq!(table.len(), 2);

        let pending = table.complete(1).unwrap();
        assert_eq!(pending.api_key, 3);
        assert_eq!(pending.api_version, 12);
        assert_eq!(table.len(), 1);

        // Consumed entries do not match twice.
        assert!(table.complete(1).is_none());
    }

    #[test]
    fn test_duplicate_in_flight_rejected() {
        let mut table = PendingRequestTable::new(16);
        table.record(&header(5)).unwrap();
        assert!(matches!(
            table.record(&header(5)),
            Err(ProxyError::DuplicateCorrelation { correlation_id: 5 })
        ));

        // Reuse after completion is fine.
        table.complete(5);
        table.record(&header(5)).unwrap();
    }

    #[test]
    fn test_capacity_limit() {
        let mut table = PendingRequestTable::new(2);
        table.record(&header(1)).unwrap();
        table.record(&header(2)).unwrap();
        assert!(matches!(
            table.record(&header(3)),
            Err(ProxyError::TooManyInFlight { limit: 2 })
        ));
    }

    #[test]
    fn test_evict_expired() {
        let mut table = PendingRequestTable::new(16);
        let start = Instant::now();
        table.record_at(&header(1), start).unwrap();
        table
            .record_at(&header(2), start + Duration::from_secs(20))
            .unwrap();

        let evicted = table.evict_expired_at(Duration::from_secs(30), start + Duration::from_secs(35));
        assert_eq!(evicted, 1);
        assert_eq!(table.len(), 1);
        assert!(table.complete(1).is_none());
        assert!(table.complete(2).is_some());
    }

    #[test]
    fn test_late_response_claims_expired_entry() {
        let mut table = PendingRequestTable::new(16);
        let start = Instant::now();
        table.record_at(&header(7), start).unwrap();
        table.evict_expired_at(Duration::from_secs(1), start + Duration::from_secs(2));

        assert!(table.is_empty());
        assert_eq!(table.expired_len(), 1);

        let late = table.take_expired(7).unwrap();
        assert_eq!(late.api_key, 3);
        assert_eq!(late.api_version, 12);
        // Claimed once only.
        assert!(table.take_expired(7).is_none());
    }

    #[test]
    fn test_expired_entries_bounded() {
        let mut table = PendingRequestTable::new(2);
        let start = Instant::now();
        for round in 0..3i32 {
            let sent = start + Duration::from_secs(u64::try_from(round).unwrap() * 10);
            table.record_at(&header(round * 2), sent).unwrap();
            table.record_at(&header(round * 2 + 1), sent).unwrap();
            table.evict_expired_at(Duration::from_secs(1), sent + Duration::from_secs(5));
        }

        assert_eq!(table.expired_len(), 2);
        // The oldest rounds were forgotten.
        assert!(table.take_expired(0).is_none());
        assert!(table.take_expired(3).is_none());
        assert!(table.take_expired(4).is_some());
        assert!(table.take_expired(5).is_some());
    }

    #[test]
    fn test_reused_id_replaces_expired_entry() {
        let mut table = PendingRequestTable::new(16);
        let start = Instant::now();
        table.record_at(&header(9), start).unwrap();
        table.evict_expired_at(Duration::from_secs(1), start + Duration::from_secs(2));

        table.record(&header(9)).unwrap();
        assert!(table.take_expired(9).is_none());
        assert!(table.complete(9).is_some());
    }

    #[test]
    fn test_size_tracks_sent_minus_received() {
        let mut table = PendingRequestTable::new(1024);
        for id in 0..100 {
            table.record(&header(id)).unwrap();
        }
        for id in (0..100).step_by(2) {
            assert!(table.complete(id).is_some());
        }
        assert_eq!(table.len(), 50);

        table.evict_expired_at(Duration::ZERO, Instant::now() + Duration::from_secs(1));
        assert_eq!(table.expired_len(), 50);

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.expired_len(), 0);
    }
}
