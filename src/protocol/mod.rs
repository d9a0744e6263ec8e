//! RFB-TV wire protocol: message container, typed messages and the codec.

pub mod codec;
pub mod messages;
pub mod wire;

pub use codec::RfbtvCodec;
pub use messages::{ProtocolVersion, ServerMessage};
pub use wire::WireBuffer;

use std::error::Error;
use std::fmt;

/// Codec-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Not enough data to process the message; rewind and wait for more.
    NeedMoreData,
    /// The message could not be parsed; fatal to the session.
    ParsingMessage,
    /// Invalid version received from the server.
    InvalidServerVersion,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::NeedMoreData => write!(f, "Not enough data to process the message"),
            CodecError::ParsingMessage => write!(f, "The message could not be parsed"),
            CodecError::InvalidServerVersion => {
                write!(f, "Invalid version received from the server")
            }
        }
    }
}

impl Error for CodecError {}
