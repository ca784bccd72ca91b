//! Ping accounting and the periodic liveness tick.
//!
//! One 10-second tick drives both channels: the reliable ping carries the
//! running statistics plus the cipher's good/late/lost counters, and the
//! datagram probe keeps the transport-selection state machine fed.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::debug;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::control::ControlStack;
use crate::messages::MessageType;
use crate::mumble_proto;
use crate::voice::VoiceStack;

pub const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Demote the voice channel after this long without a valid datagram pong.
pub const UDP_DEMOTE_AFTER: Duration = Duration::from_secs(15);
/// Drop the session after this long without a reliable pong.
pub const TCP_TIMEOUT: Duration = Duration::from_secs(60);

/// Running statistics for one channel's pings.
#[derive(Debug, Default, Clone)]
pub struct PingStats {
    /// Pings sent.
    pub number: u32,
    /// Responses received.
    pub received: u32,
    /// Responses that never arrived or no longer matched.
    pub lost: u32,
    pub average: f64,
    average_square: f64,
    pub variance: f64,
    pub last_sent: Option<Instant>,
    pub last_received: Option<Instant>,
    first_sent: Option<Instant>,
}

impl PingStats {
    pub fn mark_sent(&mut self) {
        let now = Instant::now();
        self.number += 1;
        self.last_sent = Some(now);
        self.first_sent.get_or_insert(now);
    }

    /// Record a response with a known round-trip time in milliseconds.
    pub fn record(&mut self, ping_ms: f64) {
        self.last_received = Some(Instant::now());
        let n = f64::from(self.received);
        self.average = (self.average * n + ping_ms) / (n + 1.0);
        self.average_square = (self.average_square * n + ping_ms * ping_ms) / (n + 1.0);
        self.variance = (self.average_square - self.average * self.average).max(0.0).sqrt();
        self.received += 1;
    }

    /// Record a response, deriving the round-trip time from the last send.
    pub fn record_elapsed(&mut self) {
        let ms = self
            .last_sent
            .map(|sent| sent.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or_default();
        self.record(ms);
    }

    /// True when no response has arrived within `timeout` of the last one
    /// (or of the first send, if none ever arrived).
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_received.or(self.first_sent) {
            Some(reference) => now.duration_since(reference) > timeout,
            None => false,
        }
    }

    pub fn reset(&mut self) {
        *self = PingStats::default();
    }
}

/// Statistics for both channels, shared between the stacks under one mutex.
#[derive(Debug, Default)]
pub struct PingTracker {
    pub tcp: PingStats,
    pub udp: PingStats,
}

impl PingTracker {
    pub fn reset(&mut self) {
        self.tcp.reset();
        self.udp.reset();
    }
}

/// The periodic tick. Runs for the lifetime of the client and is a no-op
/// while the control channel is down.
pub async fn run(
    control: Arc<ControlStack>,
    voice: Arc<VoiceStack>,
    tracker: Arc<Mutex<PingTracker>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick; pinging starts one interval in.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if !control.is_connected() {
            continue;
        }

        let packet = {
            let tracker = tracker.lock();
            let (good, late, lost) = voice.crypt_stats();
            mumble_proto::Ping {
                timestamp: Some(unix_timestamp()),
                good: Some(good),
                late: Some(late),
                lost: Some(lost),
                udp_packets: Some(tracker.udp.number),
                tcp_packets: Some(tracker.tcp.number),
                udp_ping_avg: Some(tracker.udp.average as f32),
                udp_ping_var: Some(tracker.udp.variance as f32),
                tcp_ping_avg: Some(tracker.tcp.average as f32),
                tcp_ping_var: Some(tracker.tcp.variance as f32),
                ..Default::default()
            }
        };
        tracker.lock().tcp.mark_sent();
        control.send_packet(MessageType::Ping, &packet).await;

        // Keep probing the datagram path even while tunnelled; a response
        // promotes it back.
        if voice.probing() {
            voice.probe().await;

            if voice.is_active() && voice.last_good_elapsed() > UDP_DEMOTE_AFTER {
                debug!("no UDP ping response for {UDP_DEMOTE_AFTER:?}, falling back to TCP");
                voice.demote();
            }
        }

        let timed_out = tracker.lock().tcp.timed_out(Instant::now(), TCP_TIMEOUT);
        if timed_out {
            control.timeout();
        }
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_and_variance_follow_the_samples() {
        let mut stats = PingStats::default();
        for ms in [10.0, 20.0, 30.0] {
            stats.record(ms);
        }
        assert_eq!(stats.received, 3);
        assert!((stats.average - 20.0).abs() < 1e-9);
        // Population std-dev of {10, 20, 30}.
        assert!((stats.variance - (200.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn constant_samples_have_zero_variance() {
        let mut stats = PingStats::default();
        for _ in 0..10 {
            stats.record(42.0);
        }
        assert!((stats.average - 42.0).abs() < 1e-9);
        assert!(stats.variance.abs() < 1e-6);
    }

    #[test]
    fn sent_and_lost_are_tracked_separately_from_received() {
        let mut stats = PingStats::default();
        stats.mark_sent();
        stats.mark_sent();
        stats.lost += 1;
        stats.record(15.0);
        assert_eq!(stats.number, 2);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.received, 1);
    }

    #[test]
    fn timeout_counts_from_first_send_when_nothing_arrived() {
        let mut stats = PingStats::default();
        let now = Instant::now();
        assert!(!stats.timed_out(now, TCP_TIMEOUT));

        stats.mark_sent();
        assert!(!stats.timed_out(now, TCP_TIMEOUT));
        assert!(stats.timed_out(now + TCP_TIMEOUT + Duration::from_secs(1), TCP_TIMEOUT));

        stats.record(5.0);
        assert!(!stats.timed_out(now + TCP_TIMEOUT + Duration::from_secs(1), TCP_TIMEOUT));
    }

    #[test]
    fn reset_clears_the_connection_scoped_state() {
        let mut stats = PingStats::default();
        stats.mark_sent();
        stats.record(10.0);
        stats.reset();
        assert_eq!(stats.number, 0);
        assert_eq!(stats.received, 0);
        assert!(stats.last_sent.is_none());
        assert!(!stats.timed_out(Instant::now() + TCP_TIMEOUT * 2, TCP_TIMEOUT));
    }
}
