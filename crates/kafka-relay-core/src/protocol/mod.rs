//! Kafka wire framing and the request bookkeeping needed to interpret
//! responses.

pub mod codec;
pub mod header;
pub mod pending;

pub use codec::KafkaCodec;
pub use header::{expects_response, response_correlation_id, FrameHeader};
pub use pending::{PendingRequest, PendingRequestTable};
