//! Wire layer between the child process and transport clients.
//!
//! # Architecture
//!
//! - **protocol**: Message types (ProtocolMessage, RawRecord)
//! - **framing**: Newline framer turning arbitrary stdout chunks into records
//! - **codec**: JSON decode/encode of single records

pub mod codec;
pub mod framing;
pub mod protocol;

pub use codec::{DecodeError, EncodeError, decode, encode};
pub use framing::LineFramer;
pub use protocol::{ProtocolMessage, RawRecord};
