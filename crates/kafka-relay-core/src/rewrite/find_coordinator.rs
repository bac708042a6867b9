//! FindCoordinator response rewriting.
//!
//! Versions 0-3 carry a single coordinator in top-level fields; version 4
//! batches lookups into a `coordinators` list. Entries that report an error
//! have no usable address and are left alone.

use kafka_protocol::messages::{ApiKey, FindCoordinatorResponse};
use kafka_protocol::protocol::{Message, VersionRange};

use crate::broker::BrokerRegistry;
use crate::error::Result;

use super::{
    decode_response, require_version, substitute, ResponseRewriter, RewriteOutcome, Tally,
};

/// First version that returns a list of coordinators.
const BATCHED_VERSION: i16 = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct FindCoordinatorRewriter;

impl ResponseRewriter for FindCoordinatorRewriter {
    fn api_key(&self) -> ApiKey {
        ApiKey::FindCoordinator
    }

    fn name(&self) -> &'static str {
        "FindCoordinator"
    }

    fn versions(&self) -> VersionRange {
        FindCoordinatorResponse::VERSIONS
    }

    fn rewrite(
        &self,
        version: i16,
        frame: &[u8],
        registry: &BrokerRegistry,
    ) -> Result<RewriteOutcome> {
        require_version(self, version)?;

        let (header, mut response) = decode_response::<FindCoordinatorResponse>(frame, version)?;
        let mut tally = Tally::default();

        if version < BATCHED_VERSION {
            if response.error_code == 0 && !response.host.is_empty() {
                tally.add(substitute(
                    registry,
                    ApiKey::FindCoordinator,
                    response.node_id.0,
                    &mut response.host,
                    &mut response.port,
                ));
            }
        } else {
            for coordinator in &mut response.coordinators {
                if coordinator.error_code != 0 || coordinator.host.is_empty() {
                    continue;
                }
                tally.add(substitute(
                    registry,
                    ApiKey::FindCoordinator,
                    coordinator.node_id.0,
                    &mut coordinator.host,
                    &mut coordinator.port,
                ));
            }
        }

        tally.finish(&header, &response, version)
    }
}
