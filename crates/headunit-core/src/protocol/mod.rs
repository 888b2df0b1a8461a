//! Protocol module containing control message types and the frame codec.

pub mod codec;
pub mod messages;

pub use codec::{decode_frame, encode_frame, ProtocolError, FRAME_HEADER_SIZE};
pub use messages::*;
