//! Metadata response rewriting.

use kafka_protocol::messages::{ApiKey, MetadataResponse};
use kafka_protocol::protocol::{Message, VersionRange};

use crate::broker::BrokerRegistry;
use crate::error::Result;

use super::{
    decode_response, require_version, substitute, ResponseRewriter, RewriteOutcome, Tally,
};

/// Rewrites the `brokers` list of Metadata responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataRewriter;

impl ResponseRewriter for MetadataRewriter {
    fn api_key(&self) -> ApiKey {
        ApiKey::Metadata
    }

    fn name(&self) -> &'static str {
        "Metadata"
    }

    fn versions(&self) -> VersionRange {
        MetadataResponse::VERSIONS
    }

    fn rewrite(
        &self,
        version: i16,
        frame: &[u8],
        registry: &BrokerRegistry,
    ) -> Result<RewriteOutcome> {
        require_version(self, version)?;

        let (header, mut response) = decode_response::<MetadataResponse>(frame, version)?;
        let mut tally = Tally::default();
        for broker in &mut response.brokers {
            tally.add(substitute(
                registry,
                ApiKey::Metadata,
                broker.node_id.0,
                &mut broker.host,
                &mut broker.port,
            ));
        }
        tally.finish(&header, &response, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::test_support::{decode, encode, registry};
    use kafka_protocol::messages::metadata_response::{
        MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
    };
    use kafka_protocol::messages::{BrokerId, TopicName};
    use kafka_protocol::protocol::StrBytes;

    fn broker(id: i32, host: &'static str, port: i32) -> MetadataResponseBroker {
        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(id);
        broker.host = StrBytes::from_static_str(host);
        broker.port = port;
        broker
    }

    fn response() -> MetadataResponse {
        let mut partition = MetadataResponsePartition::default();
        partition.partition_index = 0;
        partition.leader_id = BrokerId(1);
        partition.replica_nodes = vec![BrokerId(1), BrokerId(2)];

        let mut topic = MetadataResponseTopic::default();
        topic.name = Some(TopicName(StrBytes::from_static_str("orders")));
        topic.partitions.push(partition);

        let mut response = MetadataResponse::default();
        response.cluster_id = Some(StrBytes::from_static_str("cluster-1"));
        response.controller_id = BrokerId(1);
        response.brokers = vec![broker(1, "broker-a", 9092), broker(2, "broker-b", 9092)];
        response.topics.push(topic);
        response
    }

    #[test]
    fn test_rewrites_known_brokers() {
        for version in [2, 4, 9, 12] {
            let frame = encode(11, &response(), version);
            let outcome = MetadataRewriter
                .rewrite(version, &frame, &registry())
                .unwrap();
            assert_eq!(outcome.rewritten, 2, "v{version}");
            assert_eq!(outcome.misses, 0);

            let rewritten = outcome.frame.unwrap();
            let (header, decoded) = decode::<MetadataResponse>(&rewritten, version);
            assert_eq!(header.correlation_id, 11);
            assert_eq!(decoded.brokers[0].node_id, BrokerId(1));
            assert_eq!(decoded.brokers[0].host.to_string(), "proxyA");
            assert_eq!(decoded.brokers[0].port, 9192);
            assert_eq!(decoded.brokers[1].host.to_string(), "proxyB");
            assert_eq!(decoded.brokers[1].port, 9193);
        }
    }

    #[test]
    fn test_everything_else_unchanged() {
        let version = 9;
        let frame = encode(11, &response(), version);
        let rewritten = MetadataRewriter
            .rewrite(version, &frame, &registry())
            .unwrap()
            .frame
            .unwrap();
        let (_, decoded) = decode::<MetadataResponse>(&rewritten, version);

        let mut expected = response();
        expected.brokers = decoded.brokers.clone();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_partial_miss_still_rewrites_others() {
        let mut response = response();
        response.brokers.push(broker(7, "broker-g", 9092));
        let frame = encode(3, &response, 9);

        let outcome = MetadataRewriter.rewrite(9, &frame, &registry()).unwrap();
        assert_eq!(outcome.rewritten, 2);
        assert_eq!(outcome.misses, 1);

        let (_, decoded) = decode::<MetadataResponse>(&outcome.frame.unwrap(), 9);
        assert_eq!(decoded.brokers[2].host.to_string(), "broker-g");
        assert_eq!(decoded.brokers[2].port, 9092);
    }

    #[test]
    fn test_all_miss_forwards_original() {
        let mut response = response();
        response.brokers = vec![broker(8, "broker-h", 9092)];
        let frame = encode(3, &response, 9);

        let outcome = MetadataRewriter.rewrite(9, &frame, &registry()).unwrap();
        assert!(outcome.frame.is_none());
        assert_eq!(outcome.misses, 1);
    }

    #[test]
    fn test_empty_broker_list() {
        let mut response = response();
        response.brokers.clear();
        let frame = encode(3, &response, 9);

        let outcome = MetadataRewriter.rewrite(9, &frame, &registry()).unwrap();
        assert_eq!(outcome, RewriteOutcome::passthrough());
    }
}
