//! Integration tests for the control-channel exchange of an active session.
//!
//! A session is brought up through the scripted backend, then the test plays
//! the phone by pushing messages into the mock control channel and reading
//! what the head unit sent back.

mod common;

use std::time::Duration;

use common::{wait_until, Harness, TIMEOUT};
use headunit_client::application::protocol_handler::{ProtocolRevision, ProtocolSettings, RearmPolicy};
use headunit_client::application::session_manager::SessionSignal;
use headunit_core::protocol::messages::{
    AudioFocusRequest, AudioFocusResponse, AudioFocusState, AudioFocusType, ChannelId, NavigationFocusRequest,
    NavigationFocusResponse, NavigationFocusType, PingMessage, ServiceDiscoveryRequest,
};
use headunit_core::{ControlMessage, SessionState};

fn discovery_request() -> ControlMessage {
    ControlMessage::ServiceDiscoveryRequest(ServiceDiscoveryRequest {
        device_name: "Pixel".into(),
        device_brand: "Google".into(),
    })
}

fn advertised_channels(message: &ControlMessage) -> Vec<ChannelId> {
    match message {
        ControlMessage::ServiceDiscoveryResponse(response) => response.channel_ids(),
        other => panic!("expected a service discovery response, got {other:?}"),
    }
}

#[test]
fn test_ping_is_echoed_and_one_receive_rearmed() {
    // Arrange
    let h = Harness::new();
    let channel = h.connect("a1");

    // Act
    channel.push(ControlMessage::PingRequest(PingMessage { timestamp: 42 }));

    // Assert
    let sent = channel.wait_for_sent(1, TIMEOUT);
    assert_eq!(sent, vec![ControlMessage::PingResponse(PingMessage { timestamp: 42 })]);
    assert!(wait_until(TIMEOUT, || channel.pending_receives() == 1));
    assert_eq!(channel.max_concurrent_receives(), 1);
    assert_eq!(h.session().state(), SessionState::Active);
}

#[test]
fn test_handshake_sequence_is_answered_in_order() {
    // Arrange
    let h = Harness::new();
    let channel = h.connect("a1");

    // Act
    channel.push(discovery_request());
    channel.push(ControlMessage::AudioFocusRequest(AudioFocusRequest {
        focus_type: AudioFocusType::Gain,
    }));
    channel.push(ControlMessage::NavigationFocusRequest(NavigationFocusRequest {
        focus_type: NavigationFocusType::Projected,
    }));

    // Assert
    let sent = channel.wait_for_sent(3, TIMEOUT);
    assert_eq!(sent.len(), 3, "sent: {sent:?}");
    assert_eq!(
        advertised_channels(&sent[0]),
        vec![
            ChannelId::Video,
            ChannelId::Sensor,
            ChannelId::AvInput,
            ChannelId::Input,
            ChannelId::Navigation
        ]
    );
    assert_eq!(
        sent[1],
        ControlMessage::AudioFocusResponse(AudioFocusResponse {
            state: AudioFocusState::Gain
        })
    );
    assert_eq!(
        sent[2],
        ControlMessage::NavigationFocusResponse(NavigationFocusResponse {
            focus_type: NavigationFocusType::Projected
        })
    );
    assert_eq!(channel.max_concurrent_receives(), 1);
}

#[test]
fn test_rev1_advertises_dedicated_audio_input() {
    let h = Harness::with_settings(ProtocolSettings {
        protocol_revision: ProtocolRevision::Rev1,
        ..ProtocolSettings::default()
    });
    let channel = h.connect("a1");

    channel.push(discovery_request());

    let sent = channel.wait_for_sent(1, TIMEOUT);
    let channels = advertised_channels(&sent[0]);
    assert!(channels.contains(&ChannelId::AudioInput));
    assert!(!channels.contains(&ChannelId::AvInput));
}

#[test]
fn test_immediate_rearm_still_keeps_one_receive() {
    // Arrange
    let h = Harness::with_settings(ProtocolSettings {
        rearm_policy: RearmPolicy::Immediate,
        ..ProtocolSettings::default()
    });
    let channel = h.connect("a1");

    // Act
    for timestamp in 0..5 {
        channel.push(ControlMessage::PingRequest(PingMessage { timestamp }));
    }

    // Assert
    let sent = channel.wait_for_sent(5, TIMEOUT);
    assert_eq!(sent.len(), 5);
    assert!(wait_until(TIMEOUT, || channel.pending_receives() == 1));
    assert_eq!(channel.max_concurrent_receives(), 1);
}

#[test]
fn test_responses_from_the_phone_are_not_answered() {
    // Arrange
    let h = Harness::new();
    let channel = h.connect("a1");

    // Act
    channel.push(ControlMessage::PingResponse(PingMessage { timestamp: 1 }));
    channel.push(ControlMessage::NavigationFocusResponse(NavigationFocusResponse {
        focus_type: NavigationFocusType::Native,
    }));
    channel.push(ControlMessage::PingRequest(PingMessage { timestamp: 2 }));

    // Assert – only the ping request produced a reply
    let sent = channel.wait_for_sent(1, TIMEOUT);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sent, vec![ControlMessage::PingResponse(PingMessage { timestamp: 2 })]);
    assert_eq!(channel.sent().len(), 1);
    assert!(h.session().is_connected());
}

#[test]
fn test_unexpected_message_is_ignored_and_rearmed() {
    let h = Harness::new();
    let channel = h.connect("a1");

    channel.push(ControlMessage::AudioFocusResponse(AudioFocusResponse {
        state: AudioFocusState::Loss,
    }));
    channel.push(ControlMessage::PingRequest(PingMessage { timestamp: 9 }));

    let sent = channel.wait_for_sent(1, TIMEOUT);
    assert_eq!(sent, vec![ControlMessage::PingResponse(PingMessage { timestamp: 9 })]);
    assert_eq!(h.session().state(), SessionState::Active);
}

#[test]
fn test_send_failure_ends_the_session() {
    // Arrange
    let h = Harness::new();
    let channel = h.connect("a1");
    channel.set_fail_sends(true);

    // Act
    channel.push(ControlMessage::PingRequest(PingMessage { timestamp: 3 }));

    // Assert
    let Some(SessionSignal::SessionError(message)) =
        h.wait_for_signal(|s| matches!(s, SessionSignal::SessionError(_)))
    else {
        panic!("expected a session error");
    };
    assert!(message.contains("send failed"), "{message}");
    assert!(h.wait_for_state(SessionState::Idle));
    assert!(h.session().is_simulating());
}

#[test]
fn test_many_pings_never_overlap_receives() {
    // Arrange
    let h = Harness::new();
    let channel = h.connect("a1");

    // Act
    for timestamp in 0..20 {
        channel.push(ControlMessage::PingRequest(PingMessage { timestamp }));
    }

    // Assert
    let sent = channel.wait_for_sent(20, TIMEOUT);
    let echoed: Vec<i64> = sent
        .iter()
        .map(|m| match m {
            ControlMessage::PingResponse(ping) => ping.timestamp,
            other => panic!("unexpected reply {other:?}"),
        })
        .collect();
    assert_eq!(echoed, (0..20).collect::<Vec<_>>());
    assert_eq!(channel.max_concurrent_receives(), 1);
}

#[test]
fn test_messages_after_teardown_are_not_answered() {
    let h = Harness::new();
    let channel = h.connect("a1");
    h.detach("a1");
    assert!(h.wait_for_state(SessionState::Idle));

    channel.push(ControlMessage::PingRequest(PingMessage { timestamp: 4 }));
    std::thread::sleep(Duration::from_millis(100));

    assert!(channel.sent().is_empty());
    assert_eq!(channel.pending_receives(), 0);
}
