//! In-process phone simulator.
//!
//! Every bring-up stage succeeds after `stage_delay`.  The secure stage opens
//! an in-memory duplex pipe: the head unit's end becomes a
//! [`StreamControlChannel`], and a spawned task plays the phone on the other
//! end using the real frame codec:
//!
//! ```text
//! phone                                   head unit
//!   ── ServiceDiscoveryRequest ──────────>
//!   <───────────────── ServiceDiscoveryResponse ──
//!   ── AudioFocusRequest ────────────────>
//!   <─────────────────────── AudioFocusResponse ──
//!   ── NavigationFocusRequest ───────────>
//!   <────────────────── NavigationFocusResponse ──
//!   ── PingRequest ──────────────────────>   (every ping_interval)
//!   <────────────────────────────── PingResponse ──
//!   ── ShutdownRequest ──────────────────>   (after pings_before_shutdown)
//!   <────────────────────────── ShutdownResponse ──
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headunit_core::protocol::messages::{
    AudioFocusRequest, AudioFocusType, NavigationFocusRequest, NavigationFocusType, PingMessage,
    ServiceDiscoveryRequest, ShutdownReason, ShutdownRequest,
};
use headunit_core::{ControlMessage, DeviceIdentity};
use tokio::io::{split, AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::application::bring_up::{
    BringUpError, BringUpStage, ChannelError, ControlChannel, DeviceLink, OwnedResource, ResourceKind,
    SecureChannel, SessionBackend, TeardownError, Transport,
};
use crate::infrastructure::messenger::{read_message, write_message, StreamControlChannel};

const PIPE_CAPACITY: usize = 16 * 1024;

/// Behaviour of the simulated phone.
#[derive(Debug, Clone, PartialEq)]
pub struct PhoneScript {
    pub device_name: String,
    pub device_brand: String,
    /// Time each bring-up stage takes.
    pub stage_delay: Duration,
    pub ping_interval: Duration,
    /// Pings before the phone asks to end the session.  `None` pings forever.
    pub pings_before_shutdown: Option<u32>,
}

impl Default for PhoneScript {
    fn default() -> Self {
        Self {
            device_name: "Simulated Phone".to_string(),
            device_brand: "headunit".to_string(),
            stage_delay: Duration::from_millis(200),
            ping_interval: Duration::from_secs(1),
            pings_before_shutdown: None,
        }
    }
}

pub struct SimulatedBackend {
    script: PhoneScript,
}

impl SimulatedBackend {
    pub fn new(script: PhoneScript) -> Self {
        Self { script }
    }
}

#[async_trait]
impl SessionBackend for SimulatedBackend {
    async fn probe(&self, identity: &DeviceIdentity) -> Result<Arc<dyn DeviceLink>, BringUpError> {
        tokio::time::sleep(self.script.stage_delay).await;
        debug!(device = %identity, "simulated device claimed");
        Ok(Arc::new(SimulatedResource {
            kind: ResourceKind::UsbHandle,
            identity: identity.clone(),
        }))
    }

    async fn start_transport(&self, link: Arc<dyn DeviceLink>) -> Result<Arc<dyn Transport>, BringUpError> {
        tokio::time::sleep(self.script.stage_delay).await;
        Ok(Arc::new(SimulatedResource {
            kind: ResourceKind::Transport,
            identity: link.identity().clone(),
        }))
    }

    async fn start_secure(&self, _transport: Arc<dyn Transport>) -> Result<Arc<dyn SecureChannel>, BringUpError> {
        tokio::time::sleep(self.script.stage_delay).await;
        if self.script.device_name.is_empty() {
            return Err(BringUpError::new(BringUpStage::SecureHandshake, "phone sent no identity"));
        }

        let (head_end, phone_end) = tokio::io::duplex(PIPE_CAPACITY);
        let script = self.script.clone();
        let phone = tokio::spawn(async move {
            match run_phone(phone_end, script).await {
                Ok(()) => debug!("simulated phone finished"),
                Err(ChannelError::Closed) => debug!("simulated phone: head unit closed the channel"),
                Err(e) => warn!(error = %e, "simulated phone failed"),
            }
        });

        Ok(Arc::new(SimulatedSecure {
            channel: Arc::new(StreamControlChannel::new(head_end)),
            phone: phone.abort_handle(),
        }))
    }
}

struct SimulatedResource {
    kind: ResourceKind,
    identity: DeviceIdentity,
}

impl OwnedResource for SimulatedResource {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn release(&self) -> Result<(), TeardownError> {
        debug!(kind = %self.kind, device = %self.identity, "simulated resource released");
        Ok(())
    }
}

impl DeviceLink for SimulatedResource {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

impl Transport for SimulatedResource {}

struct SimulatedSecure {
    channel: Arc<StreamControlChannel<DuplexStream>>,
    phone: AbortHandle,
}

impl OwnedResource for SimulatedSecure {
    fn kind(&self) -> ResourceKind {
        ResourceKind::SecureChannel
    }

    fn release(&self) -> Result<(), TeardownError> {
        self.phone.abort();
        Ok(())
    }
}

impl SecureChannel for SimulatedSecure {
    fn control_channel(&self) -> Arc<dyn ControlChannel> {
        self.channel.clone()
    }
}

/// Plays the phone's side of the control protocol on `stream`.
///
/// # Errors
///
/// Returns the first channel error, including [`ChannelError::Closed`] when
/// the head unit goes away.
pub async fn run_phone<S>(stream: S, script: PhoneScript) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = split(stream);

    let opening = [
        ControlMessage::ServiceDiscoveryRequest(ServiceDiscoveryRequest {
            device_name: script.device_name.clone(),
            device_brand: script.device_brand.clone(),
        }),
        ControlMessage::AudioFocusRequest(AudioFocusRequest {
            focus_type: AudioFocusType::Gain,
        }),
        ControlMessage::NavigationFocusRequest(NavigationFocusRequest {
            focus_type: NavigationFocusType::Projected,
        }),
    ];
    for request in &opening {
        write_message(&mut writer, request).await?;
        let reply = read_message(&mut reader).await?;
        match &reply {
            ControlMessage::ServiceDiscoveryResponse(resp) => {
                info!(channels = ?resp.channel_ids(), "simulated phone: services discovered")
            }
            other => debug!(kind = ?other.kind(), "simulated phone: reply received"),
        }
    }

    let mut pings: u32 = 0;
    loop {
        if script.pings_before_shutdown.is_some_and(|limit| pings >= limit) {
            write_message(
                &mut writer,
                &ControlMessage::ShutdownRequest(ShutdownRequest {
                    reason: ShutdownReason::Quit,
                }),
            )
            .await?;
            let reply = read_message(&mut reader).await?;
            info!(kind = ?reply.kind(), "simulated phone: shutdown acknowledged");
            return Ok(());
        }

        tokio::time::sleep(script.ping_interval).await;
        let timestamp = chrono::Utc::now().timestamp_millis();
        write_message(&mut writer, &ControlMessage::PingRequest(PingMessage { timestamp })).await?;
        match read_message(&mut reader).await? {
            ControlMessage::PingResponse(pong) if pong.timestamp == timestamp => {}
            other => warn!(kind = ?other.kind(), "simulated phone: unexpected ping reply"),
        }
        pings += 1;
    }
}
