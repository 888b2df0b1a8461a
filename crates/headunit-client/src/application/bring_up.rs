//! Ports for bringing a session up and tearing it down.
//!
//! A session is built in three stages, each producing a resource the session
//! owns until teardown:
//!
//! ```text
//! DeviceIdentity ──probe──> DeviceLink ──start_transport──> Transport
//!                ──start_secure──> SecureChannel ──control_channel──> ControlChannel
//! ```
//!
//! The concrete USB, transport and TLS work lives behind [`SessionBackend`];
//! the session manager only sequences the stages and owns the results.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use headunit_core::{ControlMessage, DeviceIdentity, ProtocolError};
use thiserror::Error;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Stage of the bring-up pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BringUpStage {
    Probe,
    Transport,
    SecureHandshake,
    /// Opening the control channel and starting the protocol handler.
    Attach,
}

impl fmt::Display for BringUpStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BringUpStage::Probe => "probe",
            BringUpStage::Transport => "transport",
            BringUpStage::SecureHandshake => "secure handshake",
            BringUpStage::Attach => "attach",
        })
    }
}

/// A bring-up stage failed (or panicked); the attach is abandoned.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{stage} failed: {message}")]
pub struct BringUpError {
    pub stage: BringUpStage,
    pub message: String,
}

impl BringUpError {
    pub fn new(stage: BringUpStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Failure on an established control channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer or the local side closed the channel.
    #[error("control channel closed")]
    Closed,

    /// A receive failed for a reason reported by the channel.
    #[error("receive failed: {0}")]
    Receive(String),

    /// A send failed for a reason reported by the channel.
    #[error("send failed: {0}")]
    Send(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// I/O error on the underlying stream.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A resource that the session owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ProtocolHandler,
    SecureChannel,
    Transport,
    UsbHandle,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::ProtocolHandler => "protocol-handler",
            ResourceKind::SecureChannel => "secure",
            ResourceKind::Transport => "transport",
            ResourceKind::UsbHandle => "usb",
        })
    }
}

/// Releasing one owned resource failed.  Logged, never escalated.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("releasing {kind} failed: {message}")]
pub struct TeardownError {
    pub kind: ResourceKind,
    pub message: String,
}

impl TeardownError {
    pub fn new(kind: ResourceKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ── Owned resources ───────────────────────────────────────────────────────────

/// Common contract of every resource a session owns.
pub trait OwnedResource: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Releases the resource.  Called at most once, during teardown.
    fn release(&self) -> Result<(), TeardownError>;
}

/// Claimed USB device handle returned by a successful probe.
pub trait DeviceLink: OwnedResource {
    fn identity(&self) -> &DeviceIdentity;
}

/// Transport running over a device link.
pub trait Transport: OwnedResource {}

/// Authenticated channel running over a transport.
pub trait SecureChannel: OwnedResource {
    /// The message-level control channel carried by this secure channel.
    fn control_channel(&self) -> Arc<dyn ControlChannel>;
}

/// Typed control-message stream.
///
/// At most one `receive` is outstanding at a time; the protocol handler
/// guarantees this.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn receive(&self) -> Result<ControlMessage, ChannelError>;

    async fn send(&self, message: ControlMessage) -> Result<(), ChannelError>;
}

/// Performs the three bring-up stages.
///
/// Each call is attempted once per attach; the session manager never retries.
/// Implementations may panic: the caller catches the panic and reports it as
/// a [`BringUpError`] for the stage.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn probe(&self, identity: &DeviceIdentity) -> Result<Arc<dyn DeviceLink>, BringUpError>;

    async fn start_transport(&self, link: Arc<dyn DeviceLink>) -> Result<Arc<dyn Transport>, BringUpError>;

    async fn start_secure(&self, transport: Arc<dyn Transport>) -> Result<Arc<dyn SecureChannel>, BringUpError>;
}
