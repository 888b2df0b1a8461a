//! Domain values shared by the watcher, the session manager, and the renderer.
//!
//! - **`device`** – [`device::DeviceIdentity`], the value-compared key that
//!   correlates attach and detach events with a session.
//! - **`session`** – [`session::SessionState`], the lifecycle states of one
//!   session.
//! - **`frame`** – video frames, pixel formats, and the [`frame::FrameSource`]
//!   selector.

pub mod device;
pub mod frame;
pub mod session;
