//! Outbound boundary: sinks, batches and the guarded publisher.

mod batch;
mod publisher;
mod sink;

pub use batch::RateBatch;
pub use publisher::{Publisher, PUBLISH_BREAKER_NAME};
pub use sink::{ChannelSink, MockRateSink, NoOpRateSink, RateSink, SinkMessage};
