//! Ingestion pipeline: shared-subscription consumer → bounded
//! backpressure queue → batch accumulator → parallel bulk writers.

pub mod batcher;
pub mod pipeline;
pub mod subscriber;
pub mod writer;
