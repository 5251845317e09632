//! Shared wire protocol for the pulso event delivery pipeline.
//!
//! Everything producers, the event router, and the SSE gateway must
//! agree on lives here: the event envelope, the sharding function,
//! the key-naming scheme, and the idempotent producer API.

pub mod envelope;
pub mod error;
pub mod keys;
pub mod producer;
pub mod sharding;

pub use envelope::{Envelope, Stage, Status};
pub use error::ProtocolError;
pub use sharding::{shard_for_job, stream_key};
