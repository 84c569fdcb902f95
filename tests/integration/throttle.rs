use std::time::{Duration, Instant};

use bytes::Bytes;

use meridian_core::config::{ThrottleConfig, TransferConfig};
use meridian_core::wire::{PacketType, ThrottleCategory, HEADER_LEN, PACKED_THROTTLE_LEN};
use meridian_services::{OutboundThrottle, OutgoingPacket};

use crate::*;

const BODY: usize = 500 - HEADER_LEN;

fn packet(category: ThrottleCategory) -> OutgoingPacket {
    OutgoingPacket::new(PacketType::TransferPacket, Bytes::from(vec![0u8; BODY]), category)
}

fn rates(texture: u32, texture_burst: u32, asset: u32, asset_burst: u32, max: u32) -> ThrottleConfig {
    ThrottleConfig {
        texture_default: texture,
        texture_limit: texture_burst,
        asset_default: asset,
        asset_limit: asset_burst,
        client_throttle_max_bps: max,
        ..ThrottleConfig::default()
    }
}

/// Run the throttle for `seconds` in 20ms steps with both queues kept full.
/// Returns bytes released per category.
fn saturate(throttle: &mut OutboundThrottle, start: Instant, seconds: u64) -> (usize, usize) {
    let (mut texture, mut asset) = (0, 0);
    let steps = seconds * 50;
    for step in 1..=steps {
        while throttle.queued_len(ThrottleCategory::Texture) < 50 {
            throttle.enqueue(packet(ThrottleCategory::Texture));
        }
        while throttle.queued_len(ThrottleCategory::Asset) < 50 {
            throttle.enqueue(packet(ThrottleCategory::Asset));
        }
        let now = start + Duration::from_millis(step * 20);
        for p in throttle.dequeue_ready(now) {
            match p.category {
                ThrottleCategory::Texture => texture += p.wire_len(),
                ThrottleCategory::Asset => asset += p.wire_len(),
                other => panic!("unexpected category {other:?}"),
            }
        }
    }
    (texture, asset)
}

#[test]
fn categories_never_exceed_rate_plus_burst() {
    let start = Instant::now();
    let mut throttle = OutboundThrottle::starting_at(&rates(4000, 2000, 10_000, 5000, 0), start);
    let (texture, asset) = saturate(&mut throttle, start, 5);

    assert!(texture <= 4000 * 5 + 2000, "texture released {texture}");
    assert!(asset <= 10_000 * 5 + 5000, "asset released {asset}");
    // a saturated category keeps up with its rate, less one packet of slack
    assert!(texture >= 4000 * 5 - 500, "texture released {texture}");
    assert!(asset >= 10_000 * 5 - 500, "asset released {asset}");
}

#[test]
fn parent_cap_bounds_the_total() {
    let start = Instant::now();
    let mut throttle = OutboundThrottle::starting_at(&rates(8000, 8000, 8000, 8000, 6000), start);
    let (texture, asset) = saturate(&mut throttle, start, 5);

    assert!(texture + asset <= 6000 * 5 + 6000, "total released {}", texture + asset);
    assert!(texture + asset >= 6000 * 5 - 1000, "total released {}", texture + asset);
}

#[test]
fn client_throttle_request_is_floored_and_reported() {
    let conn = connection_with(
        &ThrottleConfig::default(),
        TransferConfig::default(),
    );
    // bits per second; resend 80 kbit, everything else tiny
    let mut packed = Vec::with_capacity(PACKED_THROTTLE_LEN);
    for (i, _) in ThrottleCategory::PACKED.iter().enumerate() {
        let bits: f32 = if i == 0 { 80_000.0 } else { 800.0 };
        packed.extend_from_slice(&bits.to_le_bytes());
    }
    assert!(conn.with_throttle(|t| t.set_throttles(&packed)));

    conn.with_throttle(|t| {
        assert_eq!(t.rate(ThrottleCategory::Resend), 10_000);
        assert_eq!(t.rate(ThrottleCategory::Texture), 1400);
        assert_eq!(t.rate(ThrottleCategory::State), t.rate(ThrottleCategory::Task));

        let reported = t.get_throttles_packed(1.0);
        let resend = f32::from_le_bytes([reported[0], reported[1], reported[2], reported[3]]);
        assert_eq!(resend, 80_000.0);
    });

    // wrong length leaves everything alone
    assert!(!conn.with_throttle(|t| t.set_throttles(&packed[..20])));
    assert_eq!(conn.with_throttle(|t| t.rate(ThrottleCategory::Resend)), 10_000);
}

#[test]
fn resent_packets_move_to_resend() {
    let conn = connection();
    let mut p = packet(ThrottleCategory::Texture);
    p.reliable = true;
    conn.resend(p);

    conn.with_throttle(|t| {
        assert_eq!(t.queued_len(ThrottleCategory::Resend), 1);
        assert_eq!(t.queued_len(ThrottleCategory::Texture), 0);
    });
    let out = sent(&conn);
    assert!(out[0].resent);
    assert_eq!(out[0].header_flags() & meridian_core::wire::FLAG_RESENT, meridian_core::wire::FLAG_RESENT);
}
