//! DescribeCluster response rewriting.

use kafka_protocol::messages::{ApiKey, DescribeClusterResponse};
use kafka_protocol::protocol::{Message, VersionRange};

use crate::broker::BrokerRegistry;
use crate::error::Result;

use super::{
    decode_response, require_version, substitute, ResponseRewriter, RewriteOutcome, Tally,
};

/// Rewrites the `brokers` list of DescribeCluster responses (admin clients).
#[derive(Debug, Clone, Copy, Default)]
pub struct DescribeClusterRewriter;

impl ResponseRewriter for DescribeClusterRewriter {
    fn api_key(&self) -> ApiKey {
        ApiKey::DescribeCluster
    }

    fn name(&self) -> &'static str {
        "DescribeCluster"
    }

    fn versions(&self) -> VersionRange {
        DescribeClusterResponse::VERSIONS
    }

    fn rewrite(
        &self,
        version: i16,
        frame: &[u8],
        registry: &BrokerRegistry,
    ) -> Result<RewriteOutcome> {
        require_version(self, version)?;

        let (header, mut response) = decode_response::<DescribeClusterResponse>(frame, version)?;
        let mut tally = Tally::default();
        for broker in &mut response.brokers {
            tally.add(substitute(
                registry,
                ApiKey::DescribeCluster,
                broker.broker_id.0,
                &mut broker.host,
                &mut broker.port,
            ));
        }
        tally.finish(&header, &response, version)
    }
}
