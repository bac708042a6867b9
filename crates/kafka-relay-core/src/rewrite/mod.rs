//! Broker address rewriting for discovery responses.
//!
//! Clients learn where brokers live from a handful of responses. Each such
//! response is decoded with `kafka-protocol`, its broker host/port fields are
//! replaced with the advertised endpoints from the [`BrokerRegistry`], and
//! the message is re-encoded. The codec writes a fresh length prefix, so no
//! byte offsets are ever patched by hand.
//!
//! ApiVersions responses are adjusted too: the versions advertised for the
//! rewritten APIs are capped at what the rewriters can decode, so a client
//! never asks for a response the relay would have to forward unread.
//!
//! Every other response flows through untouched.

mod api_versions;
mod describe_cluster;
mod find_coordinator;
mod metadata;

pub use api_versions::ApiVersionsRewriter;
pub use describe_cluster::DescribeClusterRewriter;
pub use find_coordinator::FindCoordinatorRewriter;
pub use metadata::MetadataRewriter;

use bytes::{Buf, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, StrBytes, VersionRange};
use tracing::{debug, warn};

use crate::broker::BrokerRegistry;
use crate::error::{ProxyError, Result};
use crate::protocol::PendingRequest;

/// Result of running a rewriter over one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// Re-encoded response body, or `None` to forward the original bytes.
    pub frame: Option<Bytes>,
    /// Broker entries that now carry an advertised endpoint.
    pub rewritten: usize,
    /// Broker entries with no registry match, left as the broker sent them.
    pub misses: usize,
}

impl RewriteOutcome {
    /// Forward the original bytes.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }
}

/// Rewrites broker addresses in one response type.
pub trait ResponseRewriter: Send + Sync {
    /// API whose responses this rewriter handles.
    fn api_key(&self) -> ApiKey;

    /// Metric and log label for the API.
    fn name(&self) -> &'static str;

    /// Response versions the rewriter can decode.
    fn versions(&self) -> VersionRange;

    /// Rewrite a response body (length prefix removed).
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnsupportedVersion`] for a version outside
    /// [`versions`](Self::versions), [`ProxyError::ProtocolDecode`] if the body
    /// fails to decode or leaves trailing bytes, and
    /// [`ProxyError::ProtocolEncode`] if re-encoding fails.
    fn rewrite(&self, version: i16, frame: &[u8], registry: &BrokerRegistry)
        -> Result<RewriteOutcome>;
}

/// The set of rewriters applied to broker responses.
pub struct RewriteSet {
    rewriters: Vec<Box<dyn ResponseRewriter>>,
}

impl RewriteSet {
    /// Metadata, FindCoordinator and DescribeCluster, plus an ApiVersions
    /// rewriter capping those three at the versions they decode.
    #[must_use]
    pub fn standard() -> Self {
        let mut rewriters: Vec<Box<dyn ResponseRewriter>> = vec![
            Box::new(MetadataRewriter),
            Box::new(FindCoordinatorRewriter),
            Box::new(DescribeClusterRewriter),
        ];
        let caps = ApiVersionsRewriter::new(rewriters.iter().map(|r| (r.api_key(), r.versions())));
        rewriters.push(Box::new(caps));
        Self { rewriters }
    }

    /// A set with no rewriters; every response passes through.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rewriters: Vec::new(),
        }
    }

    #[must_use]
    pub fn handles(&self, api_key: i16) -> bool {
        self.find(api_key).is_some()
    }

    fn find(&self, api_key: i16) -> Option<&dyn ResponseRewriter> {
        self.rewriters
            .iter()
            .find(|r| r.api_key() as i16 == api_key)
            .map(|r| &**r)
    }

    /// Rewrite `frame` if its request's API is in the set.
    ///
    /// Returns the rewriter's label with its outcome, or `Ok(None)` for
    /// responses outside the set.
    ///
    /// # Errors
    ///
    /// Propagates version, decode and encode failures from the matching
    /// rewriter.
    pub fn apply(
        &self,
        pending: &PendingRequest,
        frame: &[u8],
        registry: &BrokerRegistry,
    ) -> Result<Option<(&'static str, RewriteOutcome)>> {
        let Some(rewriter) = self.find(pending.api_key) else {
            return Ok(None);
        };
        let outcome = rewriter.rewrite(pending.api_version, frame, registry)?;
        Ok(Some((rewriter.name(), outcome)))
    }
}

impl Default for RewriteSet {
    fn default() -> Self {
        Self::standard()
    }
}

/// What happened to a single host/port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Substitution {
    Rewritten,
    Unchanged,
    Miss,
}

/// Running totals for one response.
#[derive(Debug, Default)]
struct Tally {
    rewritten: usize,
    misses: usize,
}

impl Tally {
    fn add(&mut self, substitution: Substitution) {
        match substitution {
            Substitution::Rewritten => self.rewritten += 1,
            Substitution::Miss => self.misses += 1,
            Substitution::Unchanged => {}
        }
    }

    /// Build the outcome, re-encoding only if something changed.
    fn finish<T>(self, header: &ResponseHeader, body: &T, version: i16) -> Result<RewriteOutcome>
    where
        T: Encodable + HeaderVersion,
    {
        let frame = if self.rewritten > 0 {
            Some(encode_response(header, body, version)?)
        } else {
            None
        };
        Ok(RewriteOutcome {
            frame,
            rewritten: self.rewritten,
            misses: self.misses,
        })
    }
}

/// Point one broker address at its advertised endpoint.
///
/// The broker id is tried first; an address matching a known real endpoint is
/// accepted as a fallback (some brokers report placeholder ids in coordinator
/// responses).
fn substitute(
    registry: &BrokerRegistry,
    api: ApiKey,
    broker_id: i32,
    host: &mut StrBytes,
    port: &mut i32,
) -> Substitution {
    let current_host = host.to_string();
    let advertised = registry
        .advertised_of(broker_id)
        .or_else(|| {
            registry
                .by_real_endpoint(&current_host, *port)
                .map(|mapping| &mapping.advertised)
        });

    let Some(advertised) = advertised else {
        warn!(
            api = ?api,
            broker_id,
            host = %current_host,
            port = *port,
            "no advertised endpoint for broker, forwarding address unmodified"
        );
        return Substitution::Miss;
    };

    let advertised_port = i32::from(advertised.port);
    if current_host == advertised.host && *port == advertised_port {
        return Substitution::Unchanged;
    }

    debug!(
        api = ?api,
        broker_id,
        original = %format!("{current_host}:{port}"),
        rewritten = %advertised,
        "rewrote broker address"
    );
    *host = StrBytes::from_string(advertised.host.clone());
    *port = advertised_port;
    Substitution::Rewritten
}

/// Refuse a response version the rewriter cannot decode.
///
/// Forwarding it unread would leak real broker addresses, so it is a fault.
fn require_version(rewriter: &dyn ResponseRewriter, version: i16) -> Result<()> {
    let range = rewriter.versions();
    if version < range.min || version > range.max {
        warn!(
            api = rewriter.name(),
            version,
            min = range.min,
            max = range.max,
            "response version cannot be rewritten"
        );
        return Err(ProxyError::UnsupportedVersion {
            api: rewriter.name(),
            version,
            min: range.min,
            max: range.max,
        });
    }
    Ok(())
}

/// Decode a response header and body, rejecting trailing bytes.
pub(crate) fn decode_response<T>(frame: &[u8], version: i16) -> Result<(ResponseHeader, T)>
where
    T: Decodable + HeaderVersion,
{
    let mut buf = Bytes::copy_from_slice(frame);
    let header = ResponseHeader::decode(&mut buf, T::header_version(version))
        .map_err(|e| ProxyError::decode(e.to_string()))?;
    let body = T::decode(&mut buf, version).map_err(|e| ProxyError::decode(e.to_string()))?;
    if buf.has_remaining() {
        return Err(ProxyError::decode(format!(
            "{} trailing bytes after response body",
            buf.remaining()
        )));
    }
    Ok((header, body))
}

/// Encode a response header and body (no length prefix).
pub(crate) fn encode_response<T>(header: &ResponseHeader, body: &T, version: i16) -> Result<Bytes>
where
    T: Encodable + HeaderVersion,
{
    let mut buf = BytesMut::new();
    header
        .encode(&mut buf, T::header_version(version))
        .map_err(|e| ProxyError::encode(e.to_string()))?;
    body.encode(&mut buf, version)
        .map_err(|e| ProxyError::encode(e.to_string()))?;
    Ok(buf.freeze())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use kafka_protocol::messages::metadata_response::MetadataResponseBroker;
    use kafka_protocol::messages::{BrokerId, MetadataResponse};
    use std::time::Instant;

    fn pending(api_key: i16, api_version: i16) -> PendingRequest {
        PendingRequest {
            api_key,
            api_version,
            sent_at: Instant::now(),
        }
    }

    fn metadata_frame(version: i16) -> Bytes {
        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(1);
        broker.host = StrBytes::from_static_str("broker-a");
        broker.port = 9092;
        let mut response = MetadataResponse::default();
        response.brokers.push(broker);
        encode(7, &response, version)
    }

    #[test]
    fn test_standard_set_membership() {
        let set = RewriteSet::standard();
        assert!(set.handles(3));
        assert!(set.handles(10));
        assert!(set.handles(60));
        assert!(set.handles(18));
        assert!(!set.handles(0));
        assert!(!set.handles(1));
    }

    #[test]
    fn test_apply_outside_set_is_none() {
        let set = RewriteSet::standard();
        let frame = [0u8, 0, 0, 7, 1, 2, 3];
        let result = set.apply(&pending(1, 12), &frame, &registry()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_apply_dispatches_by_api_key() {
        let set = RewriteSet::standard();
        let frame = metadata_frame(9);
        let (api, outcome) = set
            .apply(&pending(3, 9), &frame, &registry())
            .unwrap()
            .unwrap();
        assert_eq!(api, "Metadata");
        assert_eq!(outcome.rewritten, 1);
        assert!(outcome.frame.is_some());
    }

    #[test]
    fn test_empty_set_passes_everything() {
        let set = RewriteSet::empty();
        let frame = metadata_frame(9);
        assert!(set.apply(&pending(3, 9), &frame, &registry()).unwrap().is_none());
    }

    #[test]
    fn test_trailing_bytes_are_decode_error() {
        let mut frame = BytesMut::from(&metadata_frame(9)[..]);
        frame.extend_from_slice(&[0xde, 0xad]);
        let result = MetadataRewriter.rewrite(9, &frame, &registry());
        assert!(matches!(result, Err(ProxyError::ProtocolDecode { .. })));
    }

    #[test]
    fn test_truncated_body_is_decode_error() {
        let frame = metadata_frame(9);
        let result = MetadataRewriter.rewrite(9, &frame[..frame.len() - 3], &registry());
        assert!(matches!(result, Err(ProxyError::ProtocolDecode { .. })));
    }

    #[test]
    fn test_unsupported_version_is_fault() {
        let frame = metadata_frame(9);
        let result = MetadataRewriter.rewrite(i16::MAX, &frame, &registry());
        let Err(err) = result else {
            panic!("expected an error, got {result:?}");
        };
        assert_eq!(err.kind(), "unsupported_version");
        assert!(matches!(
            err,
            ProxyError::UnsupportedVersion {
                api: "Metadata",
                version: i16::MAX,
                ..
            }
        ));
    }

    #[test]
    fn test_labels_are_static_names() {
        let set = RewriteSet::standard();
        let names: Vec<&str> = set.rewriters.iter().map(|r| r.name()).collect();
        assert_eq!(
            names,
            ["Metadata", "FindCoordinator", "DescribeCluster", "ApiVersions"]
        );
    }

    #[test]
    fn test_substitute_fallback_by_real_endpoint() {
        let registry = registry();
        let mut host = StrBytes::from_static_str("broker-b");
        let mut port = 9092;
        let result = substitute(&registry, ApiKey::FindCoordinator, -1, &mut host, &mut port);
        assert_eq!(result, Substitution::Rewritten);
        assert_eq!(host.to_string(), "proxyB");
        assert_eq!(port, 9193);
    }

    #[test]
    fn test_substitute_miss_leaves_fields() {
        let registry = registry();
        let mut host = StrBytes::from_static_str("broker-z");
        let mut port = 9092;
        let result = substitute(&registry, ApiKey::Metadata, 99, &mut host, &mut port);
        assert_eq!(result, Substitution::Miss);
        assert_eq!(host.to_string(), "broker-z");
        assert_eq!(port, 9092);
    }

    #[test]
    fn test_substitute_already_advertised() {
        let registry = registry();
        let mut host = StrBytes::from_static_str("proxyA");
        let mut port = 9192;
        let result = substitute(&registry, ApiKey::Metadata, 1, &mut host, &mut port);
        assert_eq!(result, Substitution::Unchanged);
    }
}
