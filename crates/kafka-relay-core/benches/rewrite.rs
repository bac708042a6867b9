//! Performance benchmarks for the response path.
//!
//! Measures frame decoding, correlation bookkeeping and broker address
//! rewriting, the work done per response on top of copying bytes.

use std::time::Instant;

use bytes::{BufMut, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kafka_protocol::messages::metadata_response::MetadataResponseBroker;
use kafka_protocol::messages::{BrokerId, MetadataResponse};
use kafka_protocol::protocol::StrBytes;
use tokio_util::codec::Decoder;

use kafka_relay_core::broker::{BrokerMapping, BrokerRegistry, Endpoint};
use kafka_relay_core::protocol::{FrameHeader, KafkaCodec, PendingRequest, PendingRequestTable};
use kafka_relay_core::rewrite::RewriteSet;
use kafka_relay_core::testing::responses;

/// Registry with `count` brokers, ids 1..=count.
fn create_registry(count: i32) -> BrokerRegistry {
    BrokerRegistry::new(
        (1..=count)
            .map(|id| {
                BrokerMapping::new(
                    id,
                    Endpoint::new(format!("kafka-{id}.internal"), 9092),
                    Endpoint::new("proxy.example.com", 19_000 + id as u16),
                )
            })
            .collect(),
    )
    .unwrap()
}

fn metadata_frame(count: i32, version: i16) -> bytes::Bytes {
    let mut response = MetadataResponse::default();
    for id in 1..=count {
        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(id);
        broker.host = StrBytes::from_string(format!("kafka-{id}.internal"));
        broker.port = 9092;
        response.brokers.push(broker);
    }
    responses::encode(1, &response, version)
}

/// Benchmark Metadata rewriting by cluster size.
fn bench_metadata_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("metadata_rewrite");
    let rewrites = RewriteSet::standard();

    for brokers in [3, 30, 300] {
        let registry = create_registry(brokers);
        let frame = metadata_frame(brokers, 12);
        let pending = PendingRequest {
            api_key: 3,
            api_version: 12,
            sent_at: Instant::now(),
        };

        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::new("brokers", brokers), &frame, |b, frame| {
            b.iter(|| {
                black_box(rewrites.apply(&pending, frame, &registry).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark a response outside the rewrite set, the common case.
fn bench_passthrough_dispatch(c: &mut Criterion) {
    let rewrites = RewriteSet::standard();
    let registry = create_registry(3);
    let frame = vec![0u8; 1024];
    let pending = PendingRequest {
        api_key: 1,
        api_version: 12,
        sent_at: Instant::now(),
    };

    c.bench_function("passthrough_dispatch", |b| {
        b.iter(|| {
            black_box(rewrites.apply(&pending, &frame, &registry).unwrap());
        });
    });
}

/// Benchmark decoding pipelined frames out of one read buffer.
fn bench_codec_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_decode");

    for size in [64usize, 4096, 65536] {
        let mut wire = BytesMut::new();
        for _ in 0..64 {
            wire.put_u32(size as u32);
            wire.extend_from_slice(&vec![7u8; size]);
        }

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::new("frame_size", size), &wire, |b, wire| {
            b.iter(|| {
                let mut codec = KafkaCodec::new();
                let mut buf = wire.clone();
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    black_box(frame);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark recording and completing in-flight requests.
fn bench_pending_table(c: &mut Criterion) {
    c.bench_function("pending_record_complete", |b| {
        let mut table = PendingRequestTable::new(10_000);
        b.iter(|| {
            for correlation_id in 0..100 {
                let header = FrameHeader {
                    api_key: 1,
                    api_version: 12,
                    correlation_id,
                };
                table.record(&header).unwrap();
            }
            for correlation_id in 0..100 {
                black_box(table.complete(correlation_id));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_metadata_rewrite,
    bench_passthrough_dispatch,
    bench_codec_decode,
    bench_pending_table
);
criterion_main!(benches);
