//! Infrastructure layer of the head unit.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `headunit_core`, but MUST NOT be imported by them.
//!
//! # Sub-modules
//!
//! - **`device_watcher`** – USB detection thread with hot-plug and polling
//!   modes, a scripted bus for tests, and a sysfs enumerator for Linux.
//!
//! - **`backend`** – Implementations of the bring-up ports: a simulated phone
//!   and a scripted backend for tests.
//!
//! - **`messenger`** – `ControlChannel` over any async byte stream, using the
//!   control frame codec.
//!
//! - **`fallback_renderer`** – Produces the "waiting for connection" frames
//!   while no phone is connected.
//!
//! - **`video_surface`** – In-memory `FrameSink` with format negotiation.
//!
//! - **`config`** – TOML configuration file.
//!
//! - **`ui_bridge`** – Status and detection commands for a controlling UI.

pub mod backend;
pub mod config;
pub mod device_watcher;
pub mod fallback_renderer;
pub mod messenger;
pub mod ui_bridge;
pub mod video_surface;
