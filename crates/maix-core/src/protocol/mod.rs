//! Protocol module containing the command table and the binary frame codec.

pub mod codec;
pub mod messages;

pub use codec::{checksum, decode_frame, encode_frame, ProtocolError};
pub use messages::*;
