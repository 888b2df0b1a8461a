//! Session lifecycle state machine.
//!
//! The session manager reacts to device attach/detach events, drives the
//! bring-up pipeline (`probe → transport → secure handshake → protocol
//! handler`), and tears the session down on detach, channel failure, or a
//! shutdown exchange.  At most one session exists at a time.
//!
//! # Threading
//!
//! Public entry points may be called from any thread.  They post a job to the
//! session strand and return immediately; every state change happens inside a
//! strand job while holding the session mutex.  Bring-up stages are spawned
//! onto the executor (never awaited under the lock) and post their results
//! back to the strand.  Each result carries the generation of the session that
//! started it; a result for any other generation is stale and only has its
//! resource released.
//!
//! # State diagram
//!
//! ```text
//!            attached                ok                  ok                    ok
//!   Idle ─────────────> Probing ─────────> Transport ─────────> Secure ─────────> Active
//!    ^                     │ err           Starting │ err      Handshake │ err       │ detach /
//!    │                     v                        v                    v           │ error /
//!    └──────────────── (teardown) <─────────────────┴────────────────────┴───────────┘ shutdown
//!                      ShuttingDown
//! ```
//!
//! The attach step (control channel plus protocol handler) runs inline in
//! the `Secure` completion; a failure there tears down like any other stage.
//!
//! The fallback renderer feeds the frame sink whenever the state is not
//! `Active`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use headunit_core::{DeviceIdentity, FrameSource, SessionState};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::application::bring_up::{
    BringUpError, BringUpStage, ChannelError, DeviceLink, OwnedResource, ResourceKind, SecureChannel,
    SessionBackend, TeardownError, Transport,
};
use crate::application::executor::{panic_message, Strand};
use crate::application::frame_gate::FrameGate;
use crate::application::protocol_handler::{ChannelObserver, ProtocolHandler, ProtocolSettings, ShutdownCause};

/// Notification published by the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// The session entered (`true`) or left (`false`) the `Active` state.
    ConnectedChanged(bool),
    /// A bring-up stage, the control channel, or the device watcher failed.
    SessionError(String),
    StateChanged(SessionState),
}

/// Owns the (at most one) session and its state machine.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct SessionManager {
    core: Arc<SessionCore>,
}

struct SessionCore {
    weak_self: Weak<SessionCore>,
    backend: Arc<dyn SessionBackend>,
    strand: Strand,
    runtime: Handle,
    gate: Arc<FrameGate>,
    settings: ProtocolSettings,
    slot: Mutex<SessionSlot>,
    connected: AtomicBool,
    last_generation: AtomicU64,
    subscribers: Mutex<Vec<mpsc::Sender<SessionSignal>>>,
}

struct SessionSlot {
    state: SessionState,
    session: Option<Session>,
}

/// Resources and bookkeeping of one live session.
struct Session {
    generation: u64,
    identity: DeviceIdentity,
    usb: Option<Arc<dyn DeviceLink>>,
    transport: Option<Arc<dyn Transport>>,
    secure: Option<Arc<dyn SecureChannel>>,
    handler: Option<ProtocolHandler>,
    bring_up: Option<AbortHandle>,
    connected: bool,
}

impl Session {
    fn new(generation: u64, identity: DeviceIdentity) -> Self {
        Self {
            generation,
            identity,
            usb: None,
            transport: None,
            secure: None,
            handler: None,
            bring_up: None,
            connected: false,
        }
    }

    fn owns_resources(&self) -> bool {
        self.usb.is_some() || self.transport.is_some() || self.secure.is_some() || self.handler.is_some()
    }
}

impl SessionManager {
    /// Creates an idle manager and selects the simulated frame source.
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        strand: Strand,
        runtime: Handle,
        gate: Arc<FrameGate>,
        settings: ProtocolSettings,
    ) -> Self {
        gate.select(FrameSource::Simulated);
        let core = Arc::new_cyclic(|weak_self| SessionCore {
            weak_self: weak_self.clone(),
            backend,
            strand,
            runtime,
            gate,
            settings,
            slot: Mutex::new(SessionSlot {
                state: SessionState::Idle,
                session: None,
            }),
            connected: AtomicBool::new(false),
            last_generation: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        });
        Self { core }
    }

    /// A candidate device was attached.  Callable from any thread.
    pub fn on_device_attached(&self, identity: DeviceIdentity) {
        let core = Arc::clone(&self.core);
        self.core.strand.post(move || core.handle_attached(identity));
    }

    /// A device was detached.  Callable from any thread.
    pub fn on_device_detached(&self, identity: DeviceIdentity) {
        let core = Arc::clone(&self.core);
        self.core.strand.post(move || core.handle_detached(identity));
    }

    /// Surfaces a device-watcher failure as a [`SessionSignal::SessionError`].
    pub fn report_watcher_error(&self, message: String) {
        let core = Arc::clone(&self.core);
        self.core.strand.post(move || {
            warn!(%message, "device watcher failed");
            core.emit(SessionSignal::SessionError(format!("device watcher: {message}")));
        });
    }

    /// Tears down any session and waits up to `timeout` for it to finish.
    ///
    /// Must not be called from a strand job.  Returns `false` if the teardown
    /// could not be confirmed in time (or the executor is already stopped).
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = mpsc::channel();
        let core = Arc::clone(&self.core);
        let posted = self.core.strand.post(move || {
            let mut slot = core.lock_slot();
            core.teardown(&mut slot, "head unit shutting down");
            let _ = done_tx.send(());
        });
        posted && done_rx.recv_timeout(timeout).is_ok()
    }

    /// Lock-free read of the `Active` flag.
    pub fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        self.core.lock_slot().state
    }

    /// Identity of the device the current session belongs to, if any.
    pub fn current_device(&self) -> Option<DeviceIdentity> {
        self.core.lock_slot().session.as_ref().map(|s| s.identity.clone())
    }

    /// `true` while the fallback renderer owns the frame sink.
    pub fn is_simulating(&self) -> bool {
        self.frame_source() == FrameSource::Simulated
    }

    pub fn frame_source(&self) -> FrameSource {
        self.core.gate.selected()
    }

    /// Returns a receiver for every signal published from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<SessionSignal> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.core.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }
}

impl SessionCore {
    fn lock_slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, signal: SessionSignal) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(signal.clone()).is_ok());
        }
    }

    fn set_state(&self, slot: &mut SessionSlot, state: SessionState) {
        if slot.state == state {
            return;
        }
        debug!(from = %slot.state, to = %state, "session state changed");
        slot.state = state;
        self.emit(SessionSignal::StateChanged(state));
    }

    /// Returns the live session if it belongs to `generation` and is in `state`.
    fn current<'a>(slot: &'a mut SessionSlot, generation: u64, state: SessionState) -> Option<&'a mut Session> {
        if slot.state != state {
            return None;
        }
        slot.session.as_mut().filter(|s| s.generation == generation)
    }

    // ── Watcher events ────────────────────────────────────────────────────────

    fn handle_attached(&self, identity: DeviceIdentity) {
        let mut slot = self.lock_slot();

        if slot.state != SessionState::Idle {
            info!(device = %identity, "attach while a session exists; tearing it down first");
            self.teardown(&mut slot, "superseded by a new attach");
        }

        let generation = self.last_generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(device = %identity, generation, "device attached; probing");
        let mut session = Session::new(generation, identity.clone());

        let backend = Arc::clone(&self.backend);
        session.bring_up = Some(self.dispatch(
            generation,
            BringUpStage::Probe,
            async move { backend.probe(&identity).await },
            SessionCore::on_probed,
        ));
        slot.session = Some(session);
        self.set_state(&mut slot, SessionState::Probing);
    }

    fn handle_detached(&self, identity: DeviceIdentity) {
        let mut slot = self.lock_slot();

        let current = slot.session.as_ref().map(|s| s.identity.clone());
        match current {
            None => debug!(device = %identity, "detach with no session ignored"),
            Some(current) if current != identity => {
                debug!(device = %identity, %current, "detach for another device ignored")
            }
            Some(_) => {
                info!(device = %identity, "device detached");
                self.teardown(&mut slot, "device detached");
            }
        }
    }

    // ── Bring-up pipeline ─────────────────────────────────────────────────────

    /// Spawns one bring-up stage.  Its result, or its panic converted into a
    /// [`BringUpError`], is delivered to `on_done` on the strand.
    fn dispatch<T, F>(
        &self,
        generation: u64,
        stage: BringUpStage,
        future: F,
        on_done: fn(&SessionCore, u64, Result<T, BringUpError>),
    ) -> AbortHandle
    where
        T: Send + 'static,
        F: Future<Output = Result<T, BringUpError>> + Send + 'static,
    {
        let weak = self.weak_self.clone();
        let strand = self.strand.clone();

        self.runtime
            .spawn(async move {
                let result = match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(BringUpError::new(
                        stage,
                        format!("panicked: {}", panic_message(payload.as_ref())),
                    )),
                };
                strand.post(move || match weak.upgrade() {
                    Some(core) => on_done(core.as_ref(), generation, result),
                    None => debug!(generation, %stage, "bring-up result after session manager dropped"),
                });
            })
            .abort_handle()
    }

    fn on_probed(&self, generation: u64, result: Result<Arc<dyn DeviceLink>, BringUpError>) {
        let mut slot = self.lock_slot();
        let Some(session) = Self::current(&mut slot, generation, SessionState::Probing) else {
            if let Ok(link) = result {
                release_stale(generation, link.as_ref());
            }
            return;
        };

        let link = match result {
            Ok(link) => link,
            Err(e) => return self.fail_bring_up(&mut slot, e),
        };
        debug!(generation, device = %link.identity(), "probe succeeded");
        session.usb = Some(Arc::clone(&link));

        let backend = Arc::clone(&self.backend);
        session.bring_up = Some(self.dispatch(
            generation,
            BringUpStage::Transport,
            async move { backend.start_transport(link).await },
            SessionCore::on_transport_started,
        ));
        self.set_state(&mut slot, SessionState::TransportStarting);
    }

    fn on_transport_started(&self, generation: u64, result: Result<Arc<dyn Transport>, BringUpError>) {
        let mut slot = self.lock_slot();
        let Some(session) = Self::current(&mut slot, generation, SessionState::TransportStarting) else {
            if let Ok(transport) = result {
                release_stale(generation, transport.as_ref());
            }
            return;
        };

        let transport = match result {
            Ok(transport) => transport,
            Err(e) => return self.fail_bring_up(&mut slot, e),
        };
        debug!(generation, "transport started");
        session.transport = Some(Arc::clone(&transport));

        let backend = Arc::clone(&self.backend);
        session.bring_up = Some(self.dispatch(
            generation,
            BringUpStage::SecureHandshake,
            async move { backend.start_secure(transport).await },
            SessionCore::on_secure_started,
        ));
        self.set_state(&mut slot, SessionState::SecureHandshake);
    }

    fn on_secure_started(&self, generation: u64, result: Result<Arc<dyn SecureChannel>, BringUpError>) {
        let mut slot = self.lock_slot();
        let Some(session) = Self::current(&mut slot, generation, SessionState::SecureHandshake) else {
            if let Ok(secure) = result {
                release_stale(generation, secure.as_ref());
            }
            return;
        };

        let secure = match result {
            Ok(secure) => secure,
            Err(e) => return self.fail_bring_up(&mut slot, e),
        };

        session.secure = Some(Arc::clone(&secure));
        session.bring_up = None;

        // The attach step runs inline on the strand, so its panics are
        // caught here rather than by the dispatched future.
        let observer: Weak<dyn ChannelObserver> = self.weak_self.clone();
        let attached = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let handler = ProtocolHandler::new(
                secure.control_channel(),
                self.settings,
                generation,
                self.strand.clone(),
                self.runtime.clone(),
                observer,
            );
            handler.start();
            handler
        }));
        let handler = match attached {
            Ok(handler) => handler,
            Err(payload) => {
                let error = BringUpError::new(
                    BringUpStage::Attach,
                    format!("panicked: {}", panic_message(payload.as_ref())),
                );
                return self.fail_bring_up(&mut slot, error);
            }
        };

        session.handler = Some(handler);
        session.connected = true;
        info!(generation, device = %session.identity, "session active");

        self.set_state(&mut slot, SessionState::Active);
        self.connected.store(true, Ordering::Release);
        self.gate.select(FrameSource::Live);
        self.emit(SessionSignal::ConnectedChanged(true));
    }

    fn fail_bring_up(&self, slot: &mut SessionSlot, error: BringUpError) {
        warn!(%error, "session bring-up failed");
        self.emit(SessionSignal::SessionError(error.to_string()));
        self.teardown(slot, "bring-up failed");
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Releases every resource of the current session in the fixed order
    /// protocol handler → secure channel → transport → USB handle, then
    /// returns to `Idle`.  Each release failure is logged and skipped.
    fn teardown(&self, slot: &mut SessionSlot, reason: &str) {
        let Some(mut session) = slot.session.take() else {
            self.set_state(slot, SessionState::Idle);
            return;
        };
        let generation = session.generation;
        info!(generation, device = %session.identity, reason, "tearing down session");

        if let Some(bring_up) = session.bring_up.take() {
            bring_up.abort();
        }
        if session.owns_resources() {
            self.set_state(slot, SessionState::ShuttingDown);
        }
        if session.connected {
            self.connected.store(false, Ordering::Release);
            self.gate.select(FrameSource::Simulated);
            self.emit(SessionSignal::ConnectedChanged(false));
        }

        if let Some(handler) = session.handler.take() {
            release(generation, &handler);
        }
        if let Some(secure) = session.secure.take() {
            release(generation, secure.as_ref());
        }
        if let Some(transport) = session.transport.take() {
            release(generation, transport.as_ref());
        }
        if let Some(usb) = session.usb.take() {
            release(generation, usb.as_ref());
        }

        self.set_state(slot, SessionState::Idle);
    }
}

impl ChannelObserver for SessionCore {
    fn on_shutdown(&self, generation: u64, cause: ShutdownCause) {
        let mut slot = self.lock_slot();
        if Self::current(&mut slot, generation, SessionState::Active).is_none() {
            debug!(generation, %cause, "shutdown for a stale session ignored");
            return;
        }
        self.teardown(&mut slot, &cause.to_string());
    }

    fn on_channel_error(&self, generation: u64, error: ChannelError) {
        let mut slot = self.lock_slot();
        if Self::current(&mut slot, generation, SessionState::Active).is_none() {
            debug!(generation, %error, "channel error for a stale session ignored");
            return;
        }
        self.emit(SessionSignal::SessionError(format!("control channel: {error}")));
        self.teardown(&mut slot, "control channel failed");
    }
}

/// Releases one resource.  Errors and panics are logged as [`TeardownError`]s.
fn release<R: OwnedResource + ?Sized>(generation: u64, resource: &R) {
    let kind: ResourceKind = resource.kind();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| resource.release()));
    let error = match outcome {
        Ok(Ok(())) => {
            debug!(generation, %kind, "resource released");
            return;
        }
        Ok(Err(e)) => e,
        Err(payload) => TeardownError::new(kind, format!("panicked: {}", panic_message(payload.as_ref()))),
    };
    warn!(generation, %error, "teardown step failed; continuing");
}

fn release_stale<R: OwnedResource + ?Sized>(generation: u64, resource: &R) {
    debug!(generation, kind = %resource.kind(), "stale bring-up result; releasing");
    release(generation, resource);
}
