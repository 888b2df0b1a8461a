//! Control-channel message types.
//!
//! Only the session-management exchanges are modelled: service discovery,
//! audio focus, navigation focus, ping, and shutdown.  Every message is a
//! plain value; the codec in [`crate::protocol::codec`] turns it into bytes.

use serde::{Deserialize, Serialize};

// ── Channel identifiers ───────────────────────────────────────────────────────

/// Logical channels multiplexed over one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelId {
    Control = 0,
    Input = 1,
    Sensor = 2,
    Video = 3,
    MediaAudio = 4,
    SpeechAudio = 5,
    SystemAudio = 6,
    AvInput = 7,
    Bluetooth = 8,
    Navigation = 9,
    AudioInput = 10,
}

impl TryFrom<u8> for ChannelId {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelId::Control),
            1 => Ok(ChannelId::Input),
            2 => Ok(ChannelId::Sensor),
            3 => Ok(ChannelId::Video),
            4 => Ok(ChannelId::MediaAudio),
            5 => Ok(ChannelId::SpeechAudio),
            6 => Ok(ChannelId::SystemAudio),
            7 => Ok(ChannelId::AvInput),
            8 => Ok(ChannelId::Bluetooth),
            9 => Ok(ChannelId::Navigation),
            10 => Ok(ChannelId::AudioInput),
            _ => Err(()),
        }
    }
}

// ── Message identifiers ───────────────────────────────────────────────────────

/// Wire identifiers of the control messages, carried in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageId {
    ServiceDiscoveryRequest = 0x0005,
    ServiceDiscoveryResponse = 0x0006,
    PingRequest = 0x000B,
    PingResponse = 0x000C,
    NavigationFocusRequest = 0x000D,
    NavigationFocusResponse = 0x000E,
    ShutdownRequest = 0x000F,
    ShutdownResponse = 0x0010,
    AudioFocusRequest = 0x0012,
    AudioFocusResponse = 0x0013,
}

impl TryFrom<u16> for MessageId {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0005 => Ok(MessageId::ServiceDiscoveryRequest),
            0x0006 => Ok(MessageId::ServiceDiscoveryResponse),
            0x000B => Ok(MessageId::PingRequest),
            0x000C => Ok(MessageId::PingResponse),
            0x000D => Ok(MessageId::NavigationFocusRequest),
            0x000E => Ok(MessageId::NavigationFocusResponse),
            0x000F => Ok(MessageId::ShutdownRequest),
            0x0010 => Ok(MessageId::ShutdownResponse),
            0x0012 => Ok(MessageId::AudioFocusRequest),
            0x0013 => Ok(MessageId::AudioFocusResponse),
            _ => Err(()),
        }
    }
}

// ── Enumerated payload fields ─────────────────────────────────────────────────

/// Kind of audio focus the phone asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AudioFocusType {
    Gain = 1,
    GainTransient = 2,
    GainNavigation = 3,
    Release = 4,
}

impl TryFrom<u8> for AudioFocusType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AudioFocusType::Gain),
            2 => Ok(AudioFocusType::GainTransient),
            3 => Ok(AudioFocusType::GainNavigation),
            4 => Ok(AudioFocusType::Release),
            _ => Err(()),
        }
    }
}

/// Audio focus state granted by the head unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AudioFocusState {
    Gain = 1,
    GainTransient = 2,
    Loss = 3,
    LossTransientCanDuck = 4,
    LossTransient = 5,
}

impl TryFrom<u8> for AudioFocusState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AudioFocusState::Gain),
            2 => Ok(AudioFocusState::GainTransient),
            3 => Ok(AudioFocusState::Loss),
            4 => Ok(AudioFocusState::LossTransientCanDuck),
            5 => Ok(AudioFocusState::LossTransient),
            _ => Err(()),
        }
    }
}

/// Which navigation renderer owns guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NavigationFocusType {
    /// The phone's projected navigation has focus.
    Projected = 1,
    /// The head unit's built-in navigation has focus.
    Native = 2,
}

impl TryFrom<u8> for NavigationFocusType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NavigationFocusType::Projected),
            2 => Ok(NavigationFocusType::Native),
            _ => Err(()),
        }
    }
}

/// Reason given by the side requesting shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShutdownReason {
    None = 0,
    Quit = 1,
}

impl TryFrom<u8> for ShutdownReason {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ShutdownReason::None),
            1 => Ok(ShutdownReason::Quit),
            _ => Err(()),
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// Sent by the phone to learn which services the head unit offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDiscoveryRequest {
    pub device_name: String,
    pub device_brand: String,
}

/// One advertised service channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub channel_id: ChannelId,
}

/// Head-unit capability list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDiscoveryResponse {
    pub channels: Vec<ChannelDescriptor>,
}

impl ServiceDiscoveryResponse {
    /// Channel ids in advertisement order.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|c| c.channel_id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFocusRequest {
    pub focus_type: AudioFocusType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFocusResponse {
    pub state: AudioFocusState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationFocusRequest {
    pub focus_type: NavigationFocusType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationFocusResponse {
    pub focus_type: NavigationFocusType,
}

/// Keep-alive probe; the timestamp is echoed back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    /// Microseconds since the sender's epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub reason: ShutdownReason,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// A decoded control-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    ServiceDiscoveryRequest(ServiceDiscoveryRequest),
    ServiceDiscoveryResponse(ServiceDiscoveryResponse),
    AudioFocusRequest(AudioFocusRequest),
    AudioFocusResponse(AudioFocusResponse),
    NavigationFocusRequest(NavigationFocusRequest),
    NavigationFocusResponse(NavigationFocusResponse),
    PingRequest(PingMessage),
    PingResponse(PingMessage),
    ShutdownRequest(ShutdownRequest),
    ShutdownResponse,
}

/// Payload-free tag of a [`ControlMessage`], used for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    ServiceDiscoveryRequest,
    ServiceDiscoveryResponse,
    AudioFocusRequest,
    AudioFocusResponse,
    NavigationFocusRequest,
    NavigationFocusResponse,
    PingRequest,
    PingResponse,
    ShutdownRequest,
    ShutdownResponse,
}

impl MessageKind {
    /// Returns `true` for messages that expect a reply.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageKind::ServiceDiscoveryRequest
                | MessageKind::AudioFocusRequest
                | MessageKind::NavigationFocusRequest
                | MessageKind::PingRequest
                | MessageKind::ShutdownRequest
        )
    }
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::ServiceDiscoveryRequest(_) => MessageKind::ServiceDiscoveryRequest,
            ControlMessage::ServiceDiscoveryResponse(_) => MessageKind::ServiceDiscoveryResponse,
            ControlMessage::AudioFocusRequest(_) => MessageKind::AudioFocusRequest,
            ControlMessage::AudioFocusResponse(_) => MessageKind::AudioFocusResponse,
            ControlMessage::NavigationFocusRequest(_) => MessageKind::NavigationFocusRequest,
            ControlMessage::NavigationFocusResponse(_) => MessageKind::NavigationFocusResponse,
            ControlMessage::PingRequest(_) => MessageKind::PingRequest,
            ControlMessage::PingResponse(_) => MessageKind::PingResponse,
            ControlMessage::ShutdownRequest(_) => MessageKind::ShutdownRequest,
            ControlMessage::ShutdownResponse => MessageKind::ShutdownResponse,
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self.kind() {
            MessageKind::ServiceDiscoveryRequest => MessageId::ServiceDiscoveryRequest,
            MessageKind::ServiceDiscoveryResponse => MessageId::ServiceDiscoveryResponse,
            MessageKind::AudioFocusRequest => MessageId::AudioFocusRequest,
            MessageKind::AudioFocusResponse => MessageId::AudioFocusResponse,
            MessageKind::NavigationFocusRequest => MessageId::NavigationFocusRequest,
            MessageKind::NavigationFocusResponse => MessageId::NavigationFocusResponse,
            MessageKind::PingRequest => MessageId::PingRequest,
            MessageKind::PingResponse => MessageId::PingResponse,
            MessageKind::ShutdownRequest => MessageId::ShutdownRequest,
            MessageKind::ShutdownResponse => MessageId::ShutdownResponse,
        }
    }
}
