//! The datagram-channel session: OCB2 state, the promotion probe, the
//! receive loop, and wire-variant selection.
//!
//! The stack opens a UDP socket to the control host. After the server sync
//! it probes with an encrypted ping; a valid response promotes voice to the
//! datagram path, and silence demotes it back to tunnelling through the
//! reliable channel. Probing continues either way, every ping interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::control::ControlStack;
use crate::crypto::CryptStateOcb2;
use crate::error::Error;
use crate::messages::MessageType;
use crate::mumble_proto::CryptSetup;
use crate::ping::PingTracker;
use crate::udp::{InboundPing, PingData, UdpData};

/// How long the promotion probe waits for a decryptable response.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const RECV_BUFFER_SIZE: usize = 2048;

pub struct VoiceStack {
    socket: UdpSocket,
    ocb: Mutex<CryptStateOcb2>,
    active: watch::Sender<bool>,
    control: Arc<ControlStack>,
    tracker: Arc<Mutex<PingTracker>>,
    server_version: watch::Receiver<(u16, u16, u16)>,
    last_ping_nonce: Mutex<Option<u64>>,
    last_good_ping: Mutex<Instant>,
    /// Set once the first probe concludes; enables the periodic probes.
    probing: AtomicBool,
    probe_in_flight: AtomicBool,
    extended_info: AtomicBool,
    inbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl VoiceStack {
    /// Bind a socket towards the control host and start in tunnelled mode.
    pub async fn new(
        host: &str,
        port: u16,
        control: Arc<ControlStack>,
        tracker: Arc<Mutex<PingTracker>>,
        inbound: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<Arc<VoiceStack>, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, port)).await?;

        let (active, _) = watch::channel(false);
        Ok(Arc::new(VoiceStack {
            socket,
            ocb: Mutex::new(CryptStateOcb2::generate()),
            active,
            server_version: control.subscribe_server_version(),
            control,
            tracker,
            last_ping_nonce: Mutex::new(None),
            last_good_ping: Mutex::new(Instant::now()),
            probing: AtomicBool::new(false),
            probe_in_flight: AtomicBool::new(false),
            extended_info: AtomicBool::new(false),
            inbound,
            cancel,
        }))
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Watch promotion/demotion; the audio pipeline recomputes its overhead
    /// budget on every change.
    pub fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    pub fn probing(&self) -> bool {
        self.probing.load(Ordering::Acquire)
    }

    fn legacy(&self) -> bool {
        *self.server_version.borrow() < (1, 5, 0)
    }

    /// Apply a `CryptSetup` from the server.
    pub async fn crypt_setup(&self, packet: &CryptSetup) {
        debug!("setting up crypto");
        let reply = {
            let mut ocb = self.ocb.lock();
            apply_crypt_setup(&mut ocb, packet)
        };
        if let Some(reply) = reply {
            self.control
                .send_packet(MessageType::CryptSetup, &reply)
                .await;
        }
    }

    /// Cipher counters as reported in the reliable ping.
    pub fn crypt_stats(&self) -> (u32, u32, u32) {
        let ocb = self.ocb.lock();
        (ocb.good, ocb.late, ocb.lost_count())
    }

    /// Initial promotion probe, spawned on server sync.
    pub fn sync(self: &Arc<Self>) {
        let stack = self.clone();
        tokio::spawn(async move {
            stack.probe().await;
            stack.probing.store(true, Ordering::Release);
        });
    }

    /// Send a datagram ping and, while demoted, wait briefly for a
    /// response; a decryptable one promotes the channel.
    pub async fn probe(self: &Arc<Self>) {
        self.send_ping(true).await;
        if self.is_active() {
            // The receive loop is reading; nothing more to do here.
            return;
        }
        if self.probe_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }

        let stack = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            let received = tokio::time::timeout(PROBE_TIMEOUT, stack.socket.recv(&mut buf)).await;
            stack.probe_in_flight.store(false, Ordering::Release);
            match received {
                Ok(Ok(n)) => stack.handle_datagram(&buf[..n]).await,
                Ok(Err(e)) => warn!("udp receive failed during probe: {e}"),
                Err(_) => {
                    debug!("no UDP ping response, staying on TCP");
                    stack.tracker.lock().udp.lost += 1;
                    if stack.active.send_replace(false) {
                        info!("voice demoted to tunnelled transport");
                    }
                }
            }
        });
    }

    /// Send a datagram ping with a fresh nanosecond nonce.
    pub async fn send_ping(&self, enforce: bool) {
        let nonce = now_nanos();
        *self.last_ping_nonce.lock() = Some(nonce);
        self.tracker.lock().udp.mark_sent();
        let ping = UdpData::Ping(PingData {
            timestamp: nonce,
            request_extended_information: !self.extended_info.load(Ordering::Relaxed),
        });
        self.send_packet(&ping, enforce).await;
    }

    /// Encrypt and send over the datagram socket while promoted (or when
    /// enforced); otherwise audio falls back into the reliable channel and
    /// pings ride the reliable ping schedule.
    pub async fn send_packet(&self, data: &UdpData, enforce: bool) {
        let legacy = self.legacy();
        if self.is_active() || enforce {
            let payload = data.datagram(legacy);
            let encrypted = self.ocb.lock().encrypt(&payload);
            if let Err(e) = self.socket.send(&encrypted).await {
                warn!("failed to send voice datagram: {e}");
            }
        } else if !data.is_ping() {
            let (ty, payload) = data.tunnel_frame(legacy);
            self.control.tunnel_audio(ty, payload);
        }
    }

    /// A datagram ping response. Promotes the channel when demoted, feeds
    /// the statistics, and surfaces a bandwidth update when the server sent
    /// extended info.
    pub fn handle_ping_response(self: &Arc<Self>, ping: &InboundPing) -> Option<u32> {
        if ping.max_bandwidth_per_user.is_some() {
            self.extended_info.store(true, Ordering::Relaxed);
        }

        if *self.last_ping_nonce.lock() != Some(ping.timestamp) {
            debug!("stale UDP ping response");
            self.tracker.lock().udp.lost += 1;
            return ping.max_bandwidth_per_user;
        }

        *self.last_good_ping.lock() = Instant::now();
        let rtt_ns = now_nanos().saturating_sub(ping.timestamp);
        self.tracker.lock().udp.record(rtt_ns as f64 / 1e6);

        if !self.is_active() {
            self.enable_udp();
        }
        ping.max_bandwidth_per_user
    }

    pub fn last_good_elapsed(&self) -> Duration {
        self.last_good_ping.lock().elapsed()
    }

    /// Demote voice back to the tunnelled path; the receive loop winds down
    /// and listeners adjust their overhead accounting.
    pub fn demote(&self) {
        if self.active.send_replace(false) {
            info!("voice demoted to tunnelled transport");
        }
    }

    fn enable_udp(self: &Arc<Self>) {
        let was_active = self.active.send_replace(true);
        if !was_active {
            info!("voice promoted to datagram transport");
            let stack = self.clone();
            tokio::spawn(async move {
                stack.listen().await;
            });
        }
    }

    /// The datagram receive loop; runs only while promoted.
    async fn listen(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut active_rx = self.active.subscribe();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = active_rx.changed() => {
                    if changed.is_err() || !*active_rx.borrow_and_update() {
                        break;
                    }
                }
                received = self.socket.recv(&mut buf) => match received {
                    Ok(n) => self.handle_datagram(&buf[..n]).await,
                    Err(e) => {
                        warn!("udp receive failed: {e}");
                        break;
                    }
                }
            }
        }
        debug!("voice receive loop exiting");
    }

    /// Decrypt one datagram and push it to the dispatcher. Failures are
    /// absorbed by the cipher's late/lost accounting.
    async fn handle_datagram(&self, datagram: &[u8]) {
        let decrypted = self.ocb.lock().decrypt(datagram);
        match decrypted {
            Ok(payload) => {
                let _ = self.inbound.send(payload).await;
            }
            Err(e) => debug!("dropping undecryptable datagram: {e}"),
        }
    }
}

/// The three `CryptSetup` shapes: full rekey, server-initiated decrypt-IV
/// resync, and a request for our current encrypt IV (returned as the reply
/// to send).
fn apply_crypt_setup(ocb: &mut CryptStateOcb2, packet: &CryptSetup) -> Option<CryptSetup> {
    match (&packet.key, &packet.client_nonce, &packet.server_nonce) {
        (Some(key), Some(client_nonce), Some(server_nonce)) => {
            if ocb.set_key(key, client_nonce, server_nonce).is_err() {
                warn!("ignoring CryptSetup with malformed key material");
            }
            None
        }
        (None, _, Some(server_nonce)) => {
            debug!("updating decrypt IV");
            if ocb.set_decrypt_iv(server_nonce).is_err() {
                warn!("ignoring CryptSetup with malformed server nonce");
            }
            None
        }
        _ => Some(CryptSetup {
            client_nonce: Some(ocb.encrypt_iv().to_vec()),
            ..Default::default()
        }),
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::udp::{self, InboundVoice};
    use crate::varint;

    #[tokio::test(flavor = "multi_thread")]
    async fn probe_timeout_counts_lost_and_a_later_pong_promotes() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let tracker = Arc::new(Mutex::new(PingTracker::default()));
        let cancel = CancellationToken::new();
        let mut config = Config::new("127.0.0.1", "bot");
        config.port = port;
        let control = ControlStack::new(config, tracker.clone(), cancel.clone());
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let voice = VoiceStack::new(
            "127.0.0.1",
            port,
            control,
            tracker.clone(),
            inbound_tx,
            cancel.clone(),
        )
        .await
        .unwrap();

        let key = [9u8; 16];
        let client_nonce = [1u8; 16];
        let server_nonce = [2u8; 16];
        voice
            .ocb
            .lock()
            .set_key(&key, &client_nonce, &server_nonce)
            .unwrap();
        let mut server_crypt = CryptStateOcb2::new(&key, &server_nonce, &client_nonce).unwrap();

        // First ping: the server stays silent and the probe times out.
        voice.probe().await;
        let mut buf = [0u8; 256];
        server.recv_from(&mut buf).await.unwrap();

        let deadline = Instant::now() + PROBE_TIMEOUT + Duration::from_secs(2);
        while tracker.lock().udp.lost == 0 {
            assert!(
                Instant::now() < deadline,
                "probe timeout never counted the ping as lost"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!voice.is_active());
        {
            let tracker = tracker.lock();
            assert_eq!(tracker.udp.number, 1);
            assert_eq!(tracker.udp.lost, 1);
        }

        // Second ping: answered within the window, which promotes the
        // channel.
        voice.probe().await;
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        let request = server_crypt.decrypt(&buf[..n]).unwrap();
        // Legacy extended-info ping: four zero bytes, then the varint nonce.
        assert_eq!(&request[..4], &[0, 0, 0, 0]);
        let (nonce, _) = varint::decode(&request[4..]).unwrap();

        let mut pong = vec![1u8 << 5];
        pong.extend_from_slice(&varint::encode(nonce));
        server
            .send_to(&server_crypt.encrypt(&pong), peer)
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), inbound_rx.recv())
            .await
            .expect("pong was forwarded")
            .unwrap();
        match udp::parse(&payload, true).unwrap() {
            InboundVoice::Ping(ping) => {
                voice.handle_ping_response(&ping);
            }
            other => panic!("expected ping, got {other:?}"),
        }

        assert!(voice.is_active());
        {
            let tracker = tracker.lock();
            assert_eq!(tracker.udp.number, 2);
            assert_eq!(tracker.udp.lost, 1);
            assert_eq!(tracker.udp.received, 1);
        }
        cancel.cancel();
    }

    #[test]
    fn full_crypt_setup_replaces_all_state() {
        let mut ocb = CryptStateOcb2::generate();
        let packet = CryptSetup {
            key: Some(vec![7u8; 16]),
            client_nonce: Some(vec![1u8; 16]),
            server_nonce: Some(vec![2u8; 16]),
        };
        assert!(apply_crypt_setup(&mut ocb, &packet).is_none());
        assert_eq!(ocb.encrypt_iv(), &[1u8; 16]);
    }

    #[test]
    fn server_nonce_alone_resyncs_without_replying() {
        let mut ocb = CryptStateOcb2::new(&[7u8; 16], &[1u8; 16], &[2u8; 16]).unwrap();
        let packet = CryptSetup {
            server_nonce: Some(vec![9u8; 16]),
            ..Default::default()
        };
        assert!(apply_crypt_setup(&mut ocb, &packet).is_none());
        // The encrypt side is untouched.
        assert_eq!(ocb.encrypt_iv(), &[1u8; 16]);
    }

    #[test]
    fn empty_setup_requests_our_nonce_back() {
        let mut ocb = CryptStateOcb2::new(&[7u8; 16], &[1u8; 16], &[2u8; 16]).unwrap();
        let reply = apply_crypt_setup(&mut ocb, &CryptSetup::default()).unwrap();
        assert_eq!(reply.client_nonce, Some(vec![1u8; 16]));
        assert_eq!(reply.key, None);
        assert_eq!(reply.server_nonce, None);
    }

    #[test]
    fn malformed_key_material_is_ignored() {
        let mut ocb = CryptStateOcb2::new(&[7u8; 16], &[1u8; 16], &[2u8; 16]).unwrap();
        let packet = CryptSetup {
            key: Some(vec![7u8; 8]),
            client_nonce: Some(vec![1u8; 8]),
            server_nonce: Some(vec![2u8; 8]),
        };
        assert!(apply_crypt_setup(&mut ocb, &packet).is_none());
        assert_eq!(ocb.encrypt_iv(), &[1u8; 16]);
    }
}
