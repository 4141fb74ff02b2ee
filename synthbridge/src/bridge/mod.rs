//! Wire format for talking to the worker process.
//!
//! - **protocol**: the JSON object message and well-known commands
//! - **codec**: length-prefixed framing over the worker's stdin/stdout

pub mod codec;
pub mod protocol;
