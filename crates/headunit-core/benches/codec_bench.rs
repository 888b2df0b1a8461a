//! Criterion benchmarks for the control-channel codec.
//!
//! Run with:
//! ```bash
//! cargo bench --package headunit-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use headunit_core::protocol::codec::{decode_frame, encode_frame};
use headunit_core::protocol::messages::{
    AudioFocusRequest, AudioFocusType, ChannelDescriptor, ChannelId, ControlMessage,
    NavigationFocusRequest, NavigationFocusType, PingMessage, ServiceDiscoveryRequest,
    ServiceDiscoveryResponse, ShutdownReason, ShutdownRequest,
};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn make_ping() -> ControlMessage {
    ControlMessage::PingRequest(PingMessage { timestamp: 1_700_000_000_000 })
}

fn make_discovery_request() -> ControlMessage {
    ControlMessage::ServiceDiscoveryRequest(ServiceDiscoveryRequest {
        device_name: "bench-phone".to_string(),
        device_brand: "bench-brand".to_string(),
    })
}

fn make_discovery_response() -> ControlMessage {
    ControlMessage::ServiceDiscoveryResponse(ServiceDiscoveryResponse {
        channels: [
            ChannelId::Video,
            ChannelId::Sensor,
            ChannelId::AvInput,
            ChannelId::Input,
            ChannelId::Navigation,
        ]
        .into_iter()
        .map(|channel_id| ChannelDescriptor { channel_id })
        .collect(),
    })
}

fn make_audio_focus() -> ControlMessage {
    ControlMessage::AudioFocusRequest(AudioFocusRequest {
        focus_type: AudioFocusType::GainTransient,
    })
}

fn make_navigation_focus() -> ControlMessage {
    ControlMessage::NavigationFocusRequest(NavigationFocusRequest {
        focus_type: NavigationFocusType::Projected,
    })
}

fn make_shutdown() -> ControlMessage {
    ControlMessage::ShutdownRequest(ShutdownRequest { reason: ShutdownReason::Quit })
}

fn fixtures() -> Vec<(&'static str, ControlMessage)> {
    vec![
        ("PingRequest", make_ping()),
        ("ServiceDiscoveryRequest", make_discovery_request()),
        ("ServiceDiscoveryResponse", make_discovery_response()),
        ("AudioFocusRequest", make_audio_focus()),
        ("NavigationFocusRequest", make_navigation_focus()),
        ("ShutdownRequest", make_shutdown()),
        ("ShutdownResponse", ControlMessage::ShutdownResponse),
    ]
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    for (name, msg) in fixtures() {
        group.bench_with_input(BenchmarkId::new("msg", name), &msg, |b, msg| {
            b.iter(|| encode_frame(black_box(msg)).expect("encode must succeed"))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");
    for (name, msg) in fixtures() {
        let bytes = encode_frame(&msg).expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("msg", name), &bytes, |b, bytes| {
            b.iter(|| decode_frame(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
