//! # headunit-core
//!
//! Shared library for the head-unit client containing the control-channel
//! message types, the control-frame codec, and the session domain values.
//!
//! This crate has no threads, no OS access, and no I/O.  Everything that
//! touches USB, sockets, or the display lives in `headunit-client`.
//!
//! # Architecture overview (for beginners)
//!
//! A head unit is the screen in a car's dashboard.  When a phone is plugged
//! in over USB, the head unit negotiates a projection session with it: the
//! phone renders its UI as a video stream and both sides exchange small
//! *control messages* (service discovery, audio focus, pings, shutdown).
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – How control messages look as Rust types and how they are
//!   framed as bytes on the decrypted control stream.
//!
//! - **`domain`** – Plain values shared by every layer: the identity of an
//!   attached device, the session lifecycle states, and video frames.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `headunit_core::DeviceIdentity` instead of the full module path.
pub use domain::device::DeviceIdentity;
pub use domain::frame::{FrameSource, PixelFormat, SurfaceFormat, VideoFrame};
pub use domain::session::SessionState;
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError};
pub use protocol::messages::{ControlMessage, MessageKind};
