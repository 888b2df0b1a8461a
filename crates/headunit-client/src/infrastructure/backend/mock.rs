//! Scripted session backend for tests.
//!
//! # Event log
//!
//! Every stage and every release appends one entry to a shared log, so a
//! test can assert the exact order in which resources were created and
//! released:
//!
//! ```text
//! probe:a1  transport:a1  secure:a1  send:PingResponse:a1
//! release:secure:a1  release:transport:a1  release:usb:a1  probe:a2 ...
//! ```
//!
//! # Scripting failures
//!
//! - [`ScriptedBackend::fail_stage`] makes a stage return an error or panic.
//!   An [`BringUpStage::Attach`] fault makes `control_channel` panic.
//! - [`ScriptedBackend::fail_release`] does the same for one resource kind.
//! - [`ScriptedBackend::hold_probes`] parks every probe until
//!   [`ScriptedBackend::release_probes`] is called.
//!
//! Each successful secure handshake creates a [`MockControlChannel`]; tests
//! feed it messages with [`MockControlChannel::push`] and read replies with
//! [`MockControlChannel::wait_for_sent`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headunit_core::{ControlMessage, DeviceIdentity};
use tokio::sync::{mpsc, watch};

use crate::application::bring_up::{
    BringUpError, BringUpStage, ChannelError, ControlChannel, DeviceLink, OwnedResource, ResourceKind,
    SecureChannel, SessionBackend, TeardownError, Transport,
};

/// How a scripted step misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Return an error.
    Fail,
    /// Panic inside the call.
    Panic,
}

// ── ScriptedBackend ───────────────────────────────────────────────────────────

/// Backend whose behaviour is set by the test.  Cloning shares the script.
#[derive(Clone)]
pub struct ScriptedBackend {
    state: Arc<ScriptState>,
}

struct ScriptState {
    log: Arc<Mutex<Vec<String>>>,
    stage_faults: Mutex<HashMap<BringUpStage, Fault>>,
    release_faults: Mutex<HashMap<ResourceKind, Fault>>,
    probe_hold: watch::Sender<bool>,
    channels: Mutex<Vec<(DeviceIdentity, Arc<MockControlChannel>)>>,
    transports: Mutex<Vec<(usize, DeviceIdentity)>>,
}

impl ScriptState {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        let (probe_hold, _) = watch::channel(false);
        Self {
            state: Arc::new(ScriptState {
                log: Arc::new(Mutex::new(Vec::new())),
                stage_faults: Mutex::new(HashMap::new()),
                release_faults: Mutex::new(HashMap::new()),
                probe_hold,
                channels: Mutex::new(Vec::new()),
                transports: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn fail_stage(&self, stage: BringUpStage, fault: Fault) {
        self.state.stage_faults.lock().unwrap().insert(stage, fault);
    }

    pub fn fail_release(&self, kind: ResourceKind, fault: Fault) {
        self.state.release_faults.lock().unwrap().insert(kind, fault);
    }

    /// Removes every scripted fault.
    pub fn clear_faults(&self) {
        self.state.stage_faults.lock().unwrap().clear();
        self.state.release_faults.lock().unwrap().clear();
    }

    pub fn hold_probes(&self) {
        self.state.probe_hold.send_replace(true);
    }

    pub fn release_probes(&self) {
        self.state.probe_hold.send_replace(false);
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    /// Position of the first log entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.events().iter().position(|e| e == entry)
    }

    /// Control channel of the most recent secure handshake for `identity`.
    pub fn channel_for(&self, identity: &DeviceIdentity) -> Option<Arc<MockControlChannel>> {
        self.state
            .channels
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == identity)
            .map(|(_, channel)| Arc::clone(channel))
    }

    /// Polls until `entry` appears in the log or `timeout` expires.
    pub fn wait_for_event(&self, entry: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.position(entry).is_some() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.position(entry).is_some()
    }

    fn run_stage(&self, stage: BringUpStage) -> Result<(), BringUpError> {
        let fault = self.state.stage_faults.lock().unwrap().get(&stage).copied();
        match fault {
            Some(Fault::Fail) => Err(BringUpError::new(stage, "scripted failure")),
            Some(Fault::Panic) => panic!("scripted {stage} panic"),
            None => Ok(()),
        }
    }

    fn resource(&self, kind: ResourceKind, identity: &DeviceIdentity) -> ScriptedResource {
        ScriptedResource {
            kind,
            identity: identity.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn probe(&self, identity: &DeviceIdentity) -> Result<Arc<dyn DeviceLink>, BringUpError> {
        self.state.record(format!("probe:{identity}"));
        let mut hold = self.state.probe_hold.subscribe();
        let _ = hold.wait_for(|held| !*held).await;
        self.run_stage(BringUpStage::Probe)?;
        Ok(Arc::new(self.resource(ResourceKind::UsbHandle, identity)))
    }

    async fn start_transport(&self, link: Arc<dyn DeviceLink>) -> Result<Arc<dyn Transport>, BringUpError> {
        let identity = link.identity().clone();
        self.state.record(format!("transport:{identity}"));
        self.run_stage(BringUpStage::Transport)?;
        let transport: Arc<dyn Transport> = Arc::new(self.resource(ResourceKind::Transport, &identity));
        let key = Arc::as_ptr(&transport) as *const () as usize;
        self.state.transports.lock().unwrap().push((key, identity));
        Ok(transport)
    }

    async fn start_secure(&self, transport: Arc<dyn Transport>) -> Result<Arc<dyn SecureChannel>, BringUpError> {
        let identity = self.transport_identity(&transport);
        self.state.record(format!("secure:{identity}"));
        self.run_stage(BringUpStage::SecureHandshake)?;

        let channel = Arc::new(MockControlChannel::new(identity.clone(), Arc::clone(&self.state.log)));
        self.state
            .channels
            .lock()
            .unwrap()
            .push((identity.clone(), Arc::clone(&channel)));
        Ok(Arc::new(ScriptedSecure {
            resource: self.resource(ResourceKind::SecureChannel, &identity),
            channel,
        }))
    }
}

impl ScriptedBackend {
    /// Identity recorded for `transport` by `start_transport`.
    fn transport_identity(&self, transport: &Arc<dyn Transport>) -> DeviceIdentity {
        let key = Arc::as_ptr(transport) as *const () as usize;
        self.state
            .transports
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, id)| id.clone())
            .unwrap_or_else(DeviceIdentity::generic)
    }
}

// ── Resources ─────────────────────────────────────────────────────────────────

struct ScriptedResource {
    kind: ResourceKind,
    identity: DeviceIdentity,
    state: Arc<ScriptState>,
}

impl OwnedResource for ScriptedResource {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn release(&self) -> Result<(), TeardownError> {
        self.state.record(format!("release:{}:{}", self.kind, self.identity));
        let fault = self.state.release_faults.lock().unwrap().get(&self.kind).copied();
        match fault {
            Some(Fault::Fail) => Err(TeardownError::new(self.kind, "scripted release failure")),
            Some(Fault::Panic) => panic!("scripted {} release panic", self.kind),
            None => Ok(()),
        }
    }
}

impl DeviceLink for ScriptedResource {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

impl Transport for ScriptedResource {}

struct ScriptedSecure {
    resource: ScriptedResource,
    channel: Arc<MockControlChannel>,
}

impl OwnedResource for ScriptedSecure {
    fn kind(&self) -> ResourceKind {
        self.resource.kind()
    }

    fn release(&self) -> Result<(), TeardownError> {
        self.resource.release()
    }
}

impl SecureChannel for ScriptedSecure {
    /// Panics for either [`Fault`] scripted on [`BringUpStage::Attach`]; the
    /// port has no error path.
    fn control_channel(&self) -> Arc<dyn ControlChannel> {
        let fault = self.resource.state.stage_faults.lock().unwrap().get(&BringUpStage::Attach).copied();
        if fault.is_some() {
            panic!("scripted attach panic");
        }
        self.channel.clone()
    }
}

// ── MockControlChannel ────────────────────────────────────────────────────────

enum Incoming {
    Message(ControlMessage),
    Error(String),
    Closed,
}

/// In-memory control channel driven by the test.
///
/// Tracks how many receives are pending at once, so tests can check that the
/// protocol handler never arms more than one.
pub struct MockControlChannel {
    identity: DeviceIdentity,
    log: Arc<Mutex<Vec<String>>>,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    pending: AtomicUsize,
    max_pending: AtomicUsize,
    sent: Mutex<Vec<ControlMessage>>,
    sent_changed: Condvar,
    fail_sends: AtomicBool,
}

impl MockControlChannel {
    pub fn new(identity: DeviceIdentity, log: Arc<Mutex<Vec<String>>>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            log,
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            pending: AtomicUsize::new(0),
            max_pending: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            sent_changed: Condvar::new(),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Queues a message for the next receive.
    pub fn push(&self, message: ControlMessage) {
        let _ = self.incoming_tx.send(Incoming::Message(message));
    }

    /// Makes the next receive fail with `reason`.
    pub fn fail_receive(&self, reason: &str) {
        let _ = self.incoming_tx.send(Incoming::Error(reason.to_string()));
    }

    /// Makes the next receive report a closed channel.
    pub fn close(&self) {
        let _ = self.incoming_tx.send(Incoming::Closed);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    /// Receives currently waiting for a message.
    pub fn pending_receives(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Highest number of receives ever pending at the same time.
    pub fn max_concurrent_receives(&self) -> usize {
        self.max_pending.load(Ordering::Acquire)
    }

    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Blocks until at least `count` messages were sent or `timeout` expires,
    /// then returns everything sent so far.
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> Vec<ControlMessage> {
        let sent = self.sent.lock().unwrap();
        let (sent, _) = self
            .sent_changed
            .wait_timeout_while(sent, timeout, |sent| sent.len() < count)
            .unwrap();
        sent.clone()
    }
}

/// Counts one pending receive for as long as it lives, including when the
/// receiving task is aborted.
struct PendingReceive<'a>(&'a MockControlChannel);

impl<'a> PendingReceive<'a> {
    fn new(channel: &'a MockControlChannel) -> Self {
        let now = channel.pending.fetch_add(1, Ordering::AcqRel) + 1;
        channel.max_pending.fetch_max(now, Ordering::AcqRel);
        Self(channel)
    }
}

impl Drop for PendingReceive<'_> {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl ControlChannel for MockControlChannel {
    async fn receive(&self) -> Result<ControlMessage, ChannelError> {
        let _pending = PendingReceive::new(self);
        let mut incoming = self.incoming_rx.lock().await;
        match incoming.recv().await {
            Some(Incoming::Message(message)) => Ok(message),
            Some(Incoming::Error(reason)) => Err(ChannelError::Receive(reason)),
            Some(Incoming::Closed) | None => Err(ChannelError::Closed),
        }
    }

    async fn send(&self, message: ControlMessage) -> Result<(), ChannelError> {
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(ChannelError::Send("scripted send failure".into()));
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("send:{:?}:{}", message.kind(), self.identity));
        self.sent.lock().unwrap().push(message);
        self.sent_changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headunit_core::protocol::messages::PingMessage;

    #[tokio::test]
    async fn test_stages_are_logged_in_order() {
        // Arrange
        let backend = ScriptedBackend::new();
        let id = DeviceIdentity::new("a1");

        // Act
        let link = backend.probe(&id).await.unwrap();
        let transport = backend.start_transport(link.clone()).await.unwrap();
        let secure = backend.start_secure(transport.clone()).await.unwrap();
        secure.release().unwrap();
        transport.release().unwrap();
        link.release().unwrap();

        // Assert
        assert_eq!(
            backend.events(),
            vec![
                "probe:a1",
                "transport:a1",
                "secure:a1",
                "release:secure:a1",
                "release:transport:a1",
                "release:usb:a1"
            ]
        );
        assert!(backend.channel_for(&id).is_some());
    }

    #[tokio::test]
    async fn test_scripted_stage_failure_is_returned() {
        let backend = ScriptedBackend::new();
        backend.fail_stage(BringUpStage::Probe, Fault::Fail);

        let result = backend.probe(&DeviceIdentity::new("a1")).await;

        assert_eq!(result.err().map(|e| e.stage), Some(BringUpStage::Probe));
    }

    #[tokio::test]
    async fn test_scripted_release_failure_is_returned() {
        let backend = ScriptedBackend::new();
        backend.fail_release(ResourceKind::UsbHandle, Fault::Fail);
        let link = backend.probe(&DeviceIdentity::new("a1")).await.unwrap();

        assert!(link.release().is_err());
        assert_eq!(backend.position("release:usb:a1"), Some(1));
    }

    #[tokio::test]
    async fn test_mock_channel_delivers_pushed_messages_and_records_sends() {
        // Arrange
        let channel = MockControlChannel::new(DeviceIdentity::new("a1"), Arc::new(Mutex::new(Vec::new())));
        let ping = ControlMessage::PingRequest(PingMessage { timestamp: 1 });
        channel.push(ping.clone());

        // Act
        let received = channel.receive().await.unwrap();
        channel.send(ControlMessage::ShutdownResponse).await.unwrap();

        // Assert
        assert_eq!(received, ping);
        assert_eq!(channel.sent(), vec![ControlMessage::ShutdownResponse]);
        assert_eq!(channel.max_concurrent_receives(), 1);
        assert_eq!(channel.pending_receives(), 0);
    }

    #[tokio::test]
    async fn test_mock_channel_scripted_errors() {
        let channel = MockControlChannel::new(DeviceIdentity::new("a1"), Arc::new(Mutex::new(Vec::new())));
        channel.fail_receive("link reset");
        channel.close();
        channel.set_fail_sends(true);

        assert!(matches!(channel.receive().await, Err(ChannelError::Receive(r)) if r == "link reset"));
        assert!(matches!(channel.receive().await, Err(ChannelError::Closed)));
        assert!(matches!(
            channel.send(ControlMessage::ShutdownResponse).await,
            Err(ChannelError::Send(_))
        ));
    }
}
