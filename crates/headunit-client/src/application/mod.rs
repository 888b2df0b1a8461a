//! Application layer of the head unit.
//!
//! # What use cases does the head unit have?
//!
//! - **`session_manager`** – The session state machine.  Reacts to device
//!   attach/detach, runs the bring-up pipeline, and tears everything down on
//!   detach, channel failure, or a shutdown exchange.  Decides which frame
//!   source feeds the screen.
//!
//! - **`protocol_handler`** – Answers the phone's control messages (service
//!   discovery, audio and navigation focus, ping, shutdown) and keeps exactly
//!   one receive armed on the control channel.
//!
//! - **`bring_up`** – Ports for the concrete device work: probe, transport,
//!   secure channel, control channel, and the errors each stage can raise.
//!
//! - **`frame_gate`** – The frame sink port and the gate that admits frames
//!   from one source at a time.
//!
//! - **`executor`** – The background runtime and the strand that serializes
//!   every callback touching session state.

pub mod bring_up;
pub mod executor;
pub mod frame_gate;
pub mod protocol_handler;
pub mod session_manager;
