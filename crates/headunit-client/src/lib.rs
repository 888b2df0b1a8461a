//! headunit-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does the head unit do? (for beginners)
//!
//! A car head unit shows a phone's projected UI on the dashboard screen.
//! The phone is plugged in over USB; the head unit then:
//!
//! 1. Notices the device (`device_watcher`).
//! 2. Claims it, starts a transport over it, and runs a secure handshake
//!    (`session_manager` driving a `SessionBackend`).
//! 3. Answers the phone's control messages until one side ends the session
//!    (`protocol_handler`).
//! 4. Shows live video while connected and a "waiting for connection"
//!    screen otherwise (`fallback_renderer` behind the `frame_gate`).
//!
//! Unplugging the phone, a channel failure, or a shutdown exchange returns
//! the head unit to the waiting screen, ready for the next device.

/// Application layer: session use cases and ports.
pub mod application;

/// Composition root wiring every component together.
pub mod head_unit;

/// Infrastructure layer: device detection, backends, rendering, config.
pub mod infrastructure;

pub use head_unit::{HeadUnit, HeadUnitError};
