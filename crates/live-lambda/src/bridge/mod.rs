//! Bridge plumbing between this process and the remote worker.
//!
//! # Architecture
//!
//! - **protocol**: Message, Properties and Fragment wire types
//! - **codec**: message <-> fragment splitting and reassembly
//! - **correlation**: matching replies to pending invocations
//! - **transport**: the pub/sub port and an in-memory implementation

pub mod codec;
pub mod correlation;
pub mod protocol;
pub mod transport;
