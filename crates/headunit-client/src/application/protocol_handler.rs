//! Control-channel request/response state machine.
//!
//! The handler owns the receive loop of one session's control channel.  Each
//! received message is answered according to a fixed table ([`respond`]) and
//! exactly one new receive is armed afterwards, except after the terminal
//! shutdown exchanges.
//!
//! # Execution model
//!
//! Channel I/O runs as spawned tasks on the executor; every completion is
//! posted back to the session strand before it touches handler state.  A
//! completion that arrives after [`ProtocolHandler::stop`] is dropped, so a
//! torn-down session can never be revived by a late receive.
//!
//! The handler reports back to its owner through a [`ChannelObserver`] held
//! by weak reference: a handler outliving its session reports to no one.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use headunit_core::protocol::messages::{
    AudioFocusResponse, AudioFocusState, ChannelDescriptor, ChannelId, NavigationFocusResponse,
    NavigationFocusType, ServiceDiscoveryResponse,
};
use headunit_core::{ControlMessage, MessageKind};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::application::bring_up::{ChannelError, ControlChannel, OwnedResource, ResourceKind, TeardownError};
use crate::application::executor::Strand;

// ── Settings ──────────────────────────────────────────────────────────────────

/// Which audio capture channel the head unit advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolRevision {
    /// Advertises a dedicated audio-input channel.
    Rev1,
    /// Advertises the combined av-input channel.
    #[default]
    Rev2,
}

/// When the next receive is armed after a reply is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RearmPolicy {
    /// Arm once the reply send has completed successfully.
    #[default]
    AfterSend,
    /// Arm in the same step that dispatches the send.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtocolSettings {
    #[serde(default)]
    pub protocol_revision: ProtocolRevision,
    #[serde(default)]
    pub rearm_policy: RearmPolicy,
}

// ── Response table ────────────────────────────────────────────────────────────

/// Channels advertised in the service discovery response, in order.
pub fn service_channels(revision: ProtocolRevision) -> Vec<ChannelId> {
    let audio_capture = match revision {
        ProtocolRevision::Rev1 => ChannelId::AudioInput,
        ProtocolRevision::Rev2 => ChannelId::AvInput,
    };
    vec![
        ChannelId::Video,
        ChannelId::Sensor,
        audio_capture,
        ChannelId::Input,
        ChannelId::Navigation,
    ]
}

/// What the handler does with one received message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Send the reply, then re-arm.
    Reply(ControlMessage),
    /// Send the reply, then end the session once the send has completed.
    ReplyThenShutdown(ControlMessage),
    /// End the session now without replying.
    Shutdown,
    /// Nothing to send; re-arm.
    Rearm,
}

/// Maps a received message to the handler's reaction.
pub fn respond(message: &ControlMessage, settings: &ProtocolSettings) -> Reaction {
    match message {
        ControlMessage::ServiceDiscoveryRequest(req) => {
            info!(device_name = %req.device_name, device_brand = %req.device_brand, "service discovery requested");
            let channels = service_channels(settings.protocol_revision)
                .into_iter()
                .map(|channel_id| ChannelDescriptor { channel_id })
                .collect();
            Reaction::Reply(ControlMessage::ServiceDiscoveryResponse(ServiceDiscoveryResponse { channels }))
        }
        ControlMessage::AudioFocusRequest(req) => {
            debug!(focus_type = ?req.focus_type, "audio focus requested");
            Reaction::Reply(ControlMessage::AudioFocusResponse(AudioFocusResponse {
                state: AudioFocusState::Gain,
            }))
        }
        ControlMessage::NavigationFocusRequest(req) => {
            debug!(focus_type = ?req.focus_type, "navigation focus requested");
            Reaction::Reply(ControlMessage::NavigationFocusResponse(NavigationFocusResponse {
                focus_type: NavigationFocusType::Projected,
            }))
        }
        ControlMessage::PingRequest(ping) => Reaction::Reply(ControlMessage::PingResponse(*ping)),
        ControlMessage::ShutdownRequest(req) => {
            info!(reason = ?req.reason, "shutdown requested by peer");
            Reaction::ReplyThenShutdown(ControlMessage::ShutdownResponse)
        }
        ControlMessage::ShutdownResponse => Reaction::Shutdown,
        ControlMessage::NavigationFocusResponse(_) | ControlMessage::PingResponse(_) => Reaction::Rearm,
        other => {
            warn!(kind = ?other.kind(), "unexpected control message ignored");
            Reaction::Rearm
        }
    }
}

// ── Observer ──────────────────────────────────────────────────────────────────

/// How a session ended through the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The peer sent a shutdown request and our response was delivered.
    PeerRequested,
    /// The peer answered a shutdown request.
    PeerConfirmed,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownCause::PeerRequested => "shutdown requested by peer",
            ShutdownCause::PeerConfirmed => "shutdown confirmed by peer",
        })
    }
}

/// Receives the handler's terminal events.  Invoked on the strand.
pub trait ChannelObserver: Send + Sync {
    fn on_shutdown(&self, generation: u64, cause: ShutdownCause);

    fn on_channel_error(&self, generation: u64, error: ChannelError);
}

// ── Handler ───────────────────────────────────────────────────────────────────

/// What to do once a reply send has completed.
#[derive(Debug, Clone, Copy)]
enum AfterSend {
    Rearm,
    Shutdown(ShutdownCause),
}

/// Drives the control channel of one session.
pub struct ProtocolHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    channel: Arc<dyn ControlChannel>,
    settings: ProtocolSettings,
    generation: u64,
    strand: Strand,
    runtime: Handle,
    observer: Weak<dyn ChannelObserver>,
    stopped: AtomicBool,
    outstanding_receives: AtomicUsize,
    in_flight: Mutex<Vec<AbortHandle>>,
}

impl ProtocolHandler {
    pub fn new(
        channel: Arc<dyn ControlChannel>,
        settings: ProtocolSettings,
        generation: u64,
        strand: Strand,
        runtime: Handle,
        observer: Weak<dyn ChannelObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                channel,
                settings,
                generation,
                strand,
                runtime,
                observer,
                stopped: AtomicBool::new(false),
                outstanding_receives: AtomicUsize::new(0),
                in_flight: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Arms the first receive.
    pub fn start(&self) {
        debug!(generation = self.inner.generation, "protocol handler started");
        self.inner.arm_receive();
    }

    /// Stops the handler: aborts in-flight channel I/O and ignores any
    /// completion that still arrives.  Idempotent.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!(generation = self.inner.generation, "protocol handler stopped");
        }
        self.inner.abort_in_flight();
        self.inner.outstanding_receives.store(0, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Number of receives currently armed.
    pub fn outstanding_receives(&self) -> usize {
        self.inner.outstanding_receives.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }
}

impl OwnedResource for ProtocolHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ProtocolHandler
    }

    fn release(&self) -> Result<(), TeardownError> {
        self.stop();
        Ok(())
    }
}

impl HandlerInner {
    fn arm_receive(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.outstanding_receives.fetch_add(1, Ordering::AcqRel);

        let this = Arc::clone(self);
        self.spawn(async move {
            let result = this.channel.receive().await;
            let _ = this
                .outstanding_receives
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            let strand = this.strand.clone();
            strand.post(move || this.on_received(result));
        });
    }

    fn on_received(self: &Arc<Self>, result: Result<ControlMessage, ChannelError>) {
        if self.stopped.load(Ordering::Acquire) {
            trace!(generation = self.generation, "receive completion after stop ignored");
            return;
        }

        let message = match result {
            Ok(message) => message,
            Err(e) => return self.fail(e),
        };
        trace!(generation = self.generation, kind = ?message.kind(), "control message received");

        match respond(&message, &self.settings) {
            Reaction::Reply(reply) => self.send(reply, AfterSend::Rearm),
            Reaction::ReplyThenShutdown(reply) => {
                self.send(reply, AfterSend::Shutdown(ShutdownCause::PeerRequested))
            }
            Reaction::Shutdown => self.finish(ShutdownCause::PeerConfirmed),
            Reaction::Rearm => self.arm_receive(),
        }
    }

    fn send(self: &Arc<Self>, reply: ControlMessage, after: AfterSend) {
        let rearm_now = matches!(after, AfterSend::Rearm) && self.settings.rearm_policy == RearmPolicy::Immediate;
        let kind: MessageKind = reply.kind();

        let this = Arc::clone(self);
        self.spawn(async move {
            let result = this.channel.send(reply).await;
            let strand = this.strand.clone();
            strand.post(move || this.on_sent(kind, result, after));
        });

        if rearm_now {
            self.arm_receive();
        }
    }

    fn on_sent(self: &Arc<Self>, kind: MessageKind, result: Result<(), ChannelError>, after: AfterSend) {
        if self.stopped.load(Ordering::Acquire) {
            trace!(generation = self.generation, ?kind, "send completion after stop ignored");
            return;
        }
        if let Err(e) = result {
            return self.fail(e);
        }
        trace!(generation = self.generation, ?kind, "reply sent");

        match after {
            AfterSend::Rearm if self.settings.rearm_policy == RearmPolicy::AfterSend => self.arm_receive(),
            AfterSend::Rearm => {}
            AfterSend::Shutdown(cause) => self.finish(cause),
        }
    }

    fn fail(&self, error: ChannelError) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(generation = self.generation, %error, "control channel failed");
        self.abort_in_flight();
        match self.observer.upgrade() {
            Some(observer) => observer.on_channel_error(self.generation, error),
            None => debug!(generation = self.generation, "channel error with no observer"),
        }
    }

    fn finish(&self, cause: ShutdownCause) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(generation = self.generation, %cause, "control channel shut down");
        self.abort_in_flight();
        if let Some(observer) = self.observer.upgrade() {
            observer.on_shutdown(self.generation, cause);
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.spawn(future).abort_handle();
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.retain(|h| !h.is_finished());
            in_flight.push(handle);
        }
    }

    fn abort_in_flight(&self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            for handle in in_flight.drain(..) {
                handle.abort();
            }
        }
    }
}
