//! QoS: token buckets and the per-connection outbound throttle.
//!
//! Every throttle category has one bucket and one FIFO queue. A queued
//! packet is released only when its category bucket, and the parent bucket
//! if an aggregate cap is configured, both hold enough tokens for its wire
//! length. Tokens are bytes; buckets refill at their drip rate up to their
//! burst limit.
//!
//! A category with a drip rate of 0 is unthrottled on its own but still
//! draws from the parent.

use std::collections::VecDeque;
use std::time::Instant;

use meridian_core::config::ThrottleConfig;
use meridian_core::wire::{ThrottleCategory, PACKED_THROTTLE_LEN};

use crate::packet_types::OutgoingPacket;

/// Client-requested rates are never applied below this many bytes/sec.
pub const MIN_CLIENT_RATE: u32 = 1400;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    drip_rate: f64,
    last_drip: Instant,
}

impl TokenBucket {
    /// A full bucket. A burst of 0 means one second worth of drip.
    pub fn new(drip_rate: u32, burst: u32) -> Self {
        Self::starting_at(drip_rate, burst, Instant::now())
    }

    pub fn starting_at(drip_rate: u32, burst: u32, now: Instant) -> Self {
        let burst = effective_burst(drip_rate, burst);
        Self {
            tokens: burst,
            burst,
            drip_rate: drip_rate as f64,
            last_drip: now,
        }
    }

    /// Add tokens for the time elapsed since the last drip.
    pub fn drip(&mut self, now: Instant) {
        if now <= self.last_drip {
            return;
        }
        let elapsed = now.duration_since(self.last_drip).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.drip_rate).min(self.burst);
        self.last_drip = now;
    }

    pub fn is_unlimited(&self) -> bool {
        self.drip_rate <= 0.0
    }

    /// Packets bigger than the burst are charged the whole burst, so they
    /// go out once the bucket is full instead of never.
    fn charge(&self, bytes: usize) -> f64 {
        (bytes as f64).min(self.burst)
    }

    pub fn has_tokens(&self, bytes: usize) -> bool {
        self.is_unlimited() || self.tokens >= self.charge(bytes)
    }

    pub fn remove_tokens(&mut self, bytes: usize) {
        if self.is_unlimited() {
            return;
        }
        self.tokens = (self.tokens - self.charge(bytes)).max(0.0);
    }

    /// Drip, then take tokens for `bytes` if there are enough.
    pub fn try_remove(&mut self, bytes: usize, now: Instant) -> bool {
        self.drip(now);
        if !self.has_tokens(bytes) {
            return false;
        }
        self.remove_tokens(bytes);
        true
    }

    pub fn allow(&mut self, bytes: usize) -> bool {
        self.try_remove(bytes, Instant::now())
    }

    pub fn set_drip_rate(&mut self, drip_rate: u32) {
        self.drip_rate = drip_rate as f64;
    }

    pub fn set_burst(&mut self, burst: u32) {
        self.burst = effective_burst(self.drip_rate as u32, burst);
        self.tokens = self.tokens.min(self.burst);
    }

    pub fn drip_rate(&self) -> u32 {
        self.drip_rate as u32
    }

    pub fn burst(&self) -> u32 {
        self.burst as u32
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

fn effective_burst(drip_rate: u32, burst: u32) -> f64 {
    if burst == 0 {
        drip_rate as f64
    } else {
        burst as f64
    }
}

// ── Outbound Throttle ────────────────────────────────────────────────────────

pub struct OutboundThrottle {
    buckets: [TokenBucket; ThrottleCategory::COUNT],
    parent: Option<TokenBucket>,
    queues: [VecDeque<OutgoingPacket>; ThrottleCategory::COUNT],
}

impl OutboundThrottle {
    pub fn new(rates: &ThrottleConfig) -> Self {
        Self::starting_at(rates, Instant::now())
    }

    pub fn starting_at(rates: &ThrottleConfig, now: Instant) -> Self {
        let buckets = std::array::from_fn(|i| {
            let cat = ThrottleCategory::ALL[i];
            TokenBucket::starting_at(rates.rate(cat), rates.limit(cat), now)
        });
        Self {
            buckets,
            parent: parent_bucket(rates.client_throttle_max_bps, now),
            queues: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    /// Apply new per-category rates and burst limits. Queued packets stay.
    pub fn configure(&mut self, rates: &ThrottleConfig) {
        for cat in ThrottleCategory::ALL {
            let bucket = &mut self.buckets[cat.index()];
            bucket.set_drip_rate(rates.rate(cat));
            bucket.set_burst(rates.limit(cat));
        }
        let max = rates.client_throttle_max_bps;
        if max == 0 {
            self.parent = None;
        } else if let Some(parent) = self.parent.as_mut() {
            parent.set_drip_rate(max);
            parent.set_burst(max);
        } else {
            self.parent = parent_bucket(max, Instant::now());
        }
    }

    pub fn rate(&self, category: ThrottleCategory) -> u32 {
        self.buckets[category.index()].drip_rate()
    }

    pub fn limit(&self, category: ThrottleCategory) -> u32 {
        self.buckets[category.index()].burst()
    }

    pub fn bucket(&self, category: ThrottleCategory) -> &TokenBucket {
        &self.buckets[category.index()]
    }

    pub fn parent(&self) -> Option<&TokenBucket> {
        self.parent.as_ref()
    }

    pub fn enqueue(&mut self, packet: OutgoingPacket) {
        self.queues[packet.category.index()].push_back(packet);
    }

    /// Put a packet back for retransmission on the Resend category.
    pub fn resend(&mut self, mut packet: OutgoingPacket) {
        packet.mark_resent();
        self.enqueue(packet);
    }

    /// Release every packet whose buckets allow it, category by category in
    /// enumeration order. Within a category the queue head blocks the rest.
    pub fn dequeue_ready(&mut self, now: Instant) -> Vec<OutgoingPacket> {
        let Self {
            buckets,
            parent,
            queues,
        } = self;

        if let Some(parent) = parent.as_mut() {
            parent.drip(now);
        }

        let mut released = Vec::new();
        for (bucket, queue) in buckets.iter_mut().zip(queues.iter_mut()) {
            bucket.drip(now);
            while let Some(front) = queue.front() {
                let len = front.wire_len();
                let parent_ok = parent.as_ref().map_or(true, |p| p.has_tokens(len));
                if !parent_ok || !bucket.has_tokens(len) {
                    break;
                }
                bucket.remove_tokens(len);
                if let Some(parent) = parent.as_mut() {
                    parent.remove_tokens(len);
                }
                if let Some(packet) = queue.pop_front() {
                    released.push(packet);
                }
            }
        }
        released
    }

    /// Everything still queued, ignoring tokens. Used for the final flush of
    /// a closing connection and by tests.
    pub fn drain_all(&mut self) -> Vec<OutgoingPacket> {
        self.queues.iter_mut().flat_map(|q| q.drain(..)).collect()
    }

    pub fn queued_len(&self, category: ThrottleCategory) -> usize {
        self.queues[category.index()].len()
    }

    pub fn total_queued(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn clear(&mut self) {
        for q in self.queues.iter_mut() {
            q.clear();
        }
    }

    /// Apply a client AgentThrottle array: seven little-endian f32 in bits
    /// per second. Arrays of any other length are ignored.
    pub fn set_throttles(&mut self, packed: &[u8]) -> bool {
        if packed.len() != PACKED_THROTTLE_LEN {
            return false;
        }

        let mut rates = [0u32; ThrottleCategory::PACKED.len()];
        for (rate, chunk) in rates.iter_mut().zip(packed.chunks_exact(4)) {
            let bits = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let bytes = bits * 0.125;
            *rate = if bytes.is_finite() && bytes > 0.0 {
                bytes as u32
            } else {
                0
            };
        }

        // scale the request down to the aggregate cap
        if let Some(parent) = &self.parent {
            let cap = parent.drip_rate() as u64;
            let total: u64 = rates.iter().map(|r| *r as u64).sum();
            if cap > 0 && total > cap {
                for rate in rates.iter_mut() {
                    *rate = (*rate as u64 * cap / total) as u32;
                }
            }
        }

        for (cat, rate) in ThrottleCategory::PACKED.iter().zip(rates) {
            self.buckets[cat.index()].set_drip_rate(rate.max(MIN_CLIENT_RATE));
        }
        let task = self.rate(ThrottleCategory::Task);
        self.buckets[ThrottleCategory::State.index()].set_drip_rate(task);
        self.buckets[ThrottleCategory::AvatarInfo.index()].set_drip_rate(task);
        true
    }

    /// Current drip rates in the AgentThrottle layout, in bits per second
    /// scaled by `multiplier`.
    pub fn get_throttles_packed(&self, multiplier: f32) -> [u8; PACKED_THROTTLE_LEN] {
        let mut out = [0u8; PACKED_THROTTLE_LEN];
        for (chunk, cat) in out.chunks_exact_mut(4).zip(ThrottleCategory::PACKED) {
            let bits = self.rate(cat) as f32 * 8.0 * multiplier;
            chunk.copy_from_slice(&bits.to_le_bytes());
        }
        out
    }
}

fn parent_bucket(max_bps: u32, now: Instant) -> Option<TokenBucket> {
    (max_bps > 0).then(|| TokenBucket::starting_at(max_bps, max_bps, now))
}
