//! Wire layer shared by the stdio host and the socket channel.
//!
//! # Architecture
//!
//! - **protocol**: Inbound classification and outbound message types
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
