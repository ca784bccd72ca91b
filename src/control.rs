//! The reliable-channel session: TLS connect, version exchange and
//! authentication, then a read-and-dispatch loop and a command pump, watched
//! over by a reconnect supervisor with exponential backoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::commands::Command;
use crate::config::Config;
use crate::error::Error;
use crate::framing::{encode_frame, FrameReader};
use crate::messages::MessageType;
use crate::mumble_proto;
use crate::ping::PingTracker;

pub type WriteStream = WriteHalf<TlsStream<TcpStream>>;
pub type ReadStream = ReadHalf<TlsStream<TcpStream>>;

/// Version reported in the handshake.
pub const PROTOCOL_VERSION: (u16, u16, u16) = (1, 5, 0);

pub const CONNECTION_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const OUTBOUND_QUEUE_DEPTH: usize = 20;
const READ_BUFFER_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    NotConnected,
    Authenticating,
    Connected,
    Failed,
}

/// What the reliable channel hands to the dispatcher.
#[derive(Debug)]
pub enum ControlEvent {
    Message(u16, Bytes),
    Disconnected,
}

enum Outbound {
    /// A queued command; re-enqueued at the head on a failed write.
    Command(Command),
    /// A fire-and-forget control packet (pings, crypt nonces).
    Packet(MessageType, Bytes),
    /// Tunnelled audio; time-valued, never re-enqueued.
    Tunnel(MessageType, Bytes),
}

pub struct ControlStack {
    config: Config,
    status: watch::Sender<Status>,
    server_version: watch::Sender<(u16, u16, u16)>,
    outbound: mpsc::Sender<Outbound>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Outbound>>,
    /// Commands that failed mid-write, replayed before the queue.
    resend: Mutex<VecDeque<Outbound>>,
    tracker: Arc<Mutex<PingTracker>>,
    command_limit: AtomicU32,
    rejected: Mutex<Option<String>>,
    version_string: Mutex<String>,
    os_version: String,
    cancel: CancellationToken,
}

impl ControlStack {
    pub fn new(
        config: Config,
        tracker: Arc<Mutex<PingTracker>>,
        cancel: CancellationToken,
    ) -> Arc<ControlStack> {
        let (status, _) = watch::channel(Status::NotConnected);
        let (server_version, _) = watch::channel((0, 0, 0));
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let command_limit = AtomicU32::new(config.command_limit);
        Arc::new(ControlStack {
            config,
            status,
            server_version,
            outbound,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            resend: Mutex::new(VecDeque::new()),
            tracker,
            command_limit,
            rejected: Mutex::new(None),
            version_string: Mutex::new(format!(
                "{} {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
            os_version: os_version_string(),
            cancel,
        })
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.status(), Status::Authenticating | Status::Connected)
    }

    pub fn set_status(&self, status: Status) {
        self.status.send_replace(status);
    }

    /// Record the server version from its `Version` packet.
    pub fn set_server_version(&self, packet: &mumble_proto::Version) {
        let version = if let Some(v2) = packet.version_v2 {
            (
                (v2 >> 48 & 0xFFFF) as u16,
                (v2 >> 32 & 0xFFFF) as u16,
                (v2 >> 16 & 0xFFFF) as u16,
            )
        } else {
            let v1 = packet.version_v1.unwrap_or(0);
            (
                (v1 >> 16 & 0xFF) as u16,
                (v1 >> 8 & 0xFF) as u16,
                (v1 & 0xFF) as u16,
            )
        };
        debug!("server version {version:?}");
        self.server_version.send_replace(version);
    }

    pub fn server_version(&self) -> (u16, u16, u16) {
        *self.server_version.borrow()
    }

    pub fn subscribe_server_version(&self) -> watch::Receiver<(u16, u16, u16)> {
        self.server_version.subscribe()
    }

    pub fn set_application_string(&self, version_string: impl Into<String>) {
        *self.version_string.lock() = version_string.into();
    }

    /// Raised to the user count once the server sync lands.
    pub fn set_command_limit(&self, limit: u32) {
        if limit == 0 {
            error!("command limit cannot be zero");
            return;
        }
        self.command_limit.store(limit, Ordering::Relaxed);
    }

    pub fn set_rejected(&self, reason: impl Into<String>) {
        *self.rejected.lock() = Some(reason.into());
        self.set_status(Status::Failed);
    }

    pub fn rejected(&self) -> Option<String> {
        self.rejected.lock().clone()
    }

    /// Called by the liveness tick when no pong arrived in the window.
    pub fn timeout(&self) {
        warn!("no ping response from server, dropping the connection");
        self.set_status(Status::Failed);
    }

    pub async fn send_command(&self, command: Command) {
        if self.outbound.send(Outbound::Command(command)).await.is_err() {
            error!("outbound queue is gone, dropping command");
        }
    }

    pub async fn send_packet<M: Message>(&self, ty: MessageType, message: &M) {
        let item = Outbound::Packet(ty, message.encode_to_vec().into());
        if self.outbound.send(item).await.is_err() {
            error!("outbound queue is gone, dropping {ty:?}");
        }
    }

    /// Non-blocking enqueue of a tunnelled audio frame; dropped when the
    /// queue is full rather than delivered late.
    pub fn tunnel_audio(&self, ty: MessageType, payload: Bytes) {
        if self.outbound.try_send(Outbound::Tunnel(ty, payload)).is_err() {
            debug!("outbound queue full, dropping tunnelled audio frame");
        }
    }

    pub async fn reauthenticate(&self, token: impl Into<String>) {
        let command = Command::reauthenticate(
            &self.config.username,
            &self.config.password,
            &self.config.tokens,
            token,
        );
        self.send_command(command).await;
    }

    /// The connection supervisor: connects, runs the read and write loops,
    /// and drives reconnection with exponential backoff until stopped,
    /// rejected, or configured not to retry.
    pub async fn run(self: Arc<Self>, events: mpsc::Sender<ControlEvent>) {
        let mut backoff = CONNECTION_RETRY_INTERVAL;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.tracker.lock().reset();

            let reached_connected = match self.connect_once(&events).await {
                Ok(reached) => reached,
                Err(e) => {
                    error!("connection attempt failed: {e}");
                    false
                }
            };
            if reached_connected {
                backoff = CONNECTION_RETRY_INTERVAL;
            }

            if !self.cancel.is_cancelled() {
                self.set_status(Status::Failed);
            }
            let _ = events.send(ControlEvent::Disconnected).await;

            if self.cancel.is_cancelled()
                || self.rejected().is_some()
                || !self.config.reconnect
            {
                break;
            }

            info!("connection lost, retrying in {backoff:?}");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff);
        }
        if self.cancel.is_cancelled() {
            self.set_status(Status::NotConnected);
        }
        debug!("control supervisor exiting");
    }

    /// One connection attempt: handshake, then pump until something dies.
    /// Returns whether the session reached `Connected`.
    async fn connect_once(&self, events: &mpsc::Sender<ControlEvent>) -> Result<bool, Error> {
        self.set_status(Status::NotConnected);
        let stream = self.tls_connect().await?;
        let (read, mut write) = tokio::io::split(stream);

        debug!("sending version and authenticate");
        let version = self.version_packet();
        write
            .write_all(&encode_frame(
                MessageType::Version as u16,
                &version.encode_to_vec(),
            ))
            .await?;
        let authenticate = self.authenticate_packet();
        write
            .write_all(&encode_frame(
                MessageType::Authenticate as u16,
                &authenticate.encode_to_vec(),
            ))
            .await?;
        self.set_status(Status::Authenticating);

        let mut outbound = self.outbound_rx.lock().await;
        let mut status_rx = self.status.subscribe();
        let mut reached_connected = false;

        let read_loop = read_loop(read, events.clone());
        let write_loop = self.write_loop(write, &mut outbound);
        tokio::pin!(read_loop);
        tokio::pin!(write_loop);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(reached_connected),
                result = &mut read_loop => {
                    if let Err(e) = result {
                        warn!("read loop ended: {e}");
                    }
                    return Ok(reached_connected);
                }
                result = &mut write_loop => {
                    if let Err(e) = result {
                        warn!("write loop ended: {e}");
                    }
                    return Ok(reached_connected);
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Ok(reached_connected);
                    }
                    match *status_rx.borrow_and_update() {
                        Status::Connected => reached_connected = true,
                        Status::Failed => return Ok(reached_connected),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Drain the outbound queue onto the wire, commands rate-limited and
    /// resent once on transient failure.
    async fn write_loop(
        &self,
        mut write: WriteStream,
        outbound: &mut mpsc::Receiver<Outbound>,
    ) -> Result<(), Error> {
        let mut window_start = Instant::now();
        let mut window_count = 0u32;

        loop {
            let item = {
                let queued = self.resend.lock().pop_front();
                match queued {
                    Some(item) => item,
                    None => match outbound.recv().await {
                        Some(item) => item,
                        None => return Ok(()),
                    },
                }
            };

            if matches!(item, Outbound::Command(_)) {
                let limit = self.command_limit.load(Ordering::Relaxed);
                if window_start.elapsed() >= Duration::from_secs(1) {
                    window_start = Instant::now();
                    window_count = 0;
                }
                if window_count >= limit {
                    let resume = window_start + Duration::from_secs(1);
                    tokio::time::sleep_until(resume.into()).await;
                    window_start = Instant::now();
                    window_count = 0;
                }
                window_count += 1;
            }

            let (ty, payload) = match &item {
                Outbound::Command(command) => (command.ty as u16, command.payload.clone()),
                Outbound::Packet(ty, payload) | Outbound::Tunnel(ty, payload) => {
                    (*ty as u16, payload.clone())
                }
            };

            let frame = encode_frame(ty, &payload);
            if let Err(e) = write.write_all(&frame).await {
                if let Outbound::Command(command) = item {
                    debug!("re-enqueueing {:?} after failed write", command.ty);
                    self.resend.lock().push_front(Outbound::Command(command));
                }
                return Err(e.into());
            }
        }
    }

    async fn tls_connect(&self) -> Result<TlsStream<TcpStream>, Error> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        match self.tls_handshake(false).await {
            Ok(stream) => Ok(stream),
            Err((true, e)) => {
                warn!("TLS handshake failed ({e}), retrying once with TLS 1.2 only");
                self.tls_handshake(true).await.map_err(|(_, e)| e)
            }
            Err((false, e)) => Err(e),
        }
    }

    /// One handshake attempt. The bool in the error marks failures worth a
    /// protocol-version fallback (the handshake itself, not TCP or config).
    async fn tls_handshake(&self, tls12_only: bool) -> Result<TlsStream<TcpStream>, (bool, Error)> {
        let config = self.tls_config(tls12_only).map_err(|e| (false, e))?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.config.host.clone())
            .map_err(|_| (false, Error::Config(format!("invalid host {}", self.config.host))))?;

        let tcp = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| (false, Error::Transport(e)))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| (true, Error::Transport(e)))
    }

    fn tls_config(&self, tls12_only: bool) -> Result<ClientConfig, Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let builder = if tls12_only {
            ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        } else {
            ClientConfig::builder()
        };
        let builder = builder.with_root_certificates(roots);

        let config = match (&self.config.cert_file, &self.config.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let cert_chain = vec![CertificateDer::from_pem_file(cert_file)
                    .map_err(|e| Error::Config(format!("failed to load certificate: {e}")))?];
                let key = PrivateKeyDer::from_pem_file(key_file)
                    .map_err(|e| Error::Config(format!("failed to load private key: {e}")))?;
                builder.with_client_auth_cert(cert_chain, key)?
            }
            _ => builder.with_no_client_auth(),
        };
        Ok(config)
    }

    fn version_packet(&self) -> mumble_proto::Version {
        mumble_proto::Version {
            version_v1: Some(legacy_version(PROTOCOL_VERSION)),
            version_v2: Some(new_version(PROTOCOL_VERSION)),
            release: Some(self.version_string.lock().clone()),
            os: Some(std::env::consts::OS.to_owned()),
            os_version: Some(self.os_version.clone()),
        }
    }

    fn authenticate_packet(&self) -> mumble_proto::Authenticate {
        mumble_proto::Authenticate {
            username: Some(self.config.username.clone()),
            password: Some(self.config.password.clone()),
            tokens: self.config.tokens.clone(),
            opus: Some(true),
            client_type: Some(self.config.client_type as i32),
            ..Default::default()
        }
    }
}

async fn read_loop(mut read: ReadStream, events: mpsc::Sender<ControlEvent>) -> Result<(), Error> {
    let mut reader = FrameReader::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionFailed(
                "server closed the connection".into(),
            ));
        }
        reader.extend(&buf[..n]);
        while let Some((ty, payload)) = reader.next_frame() {
            if events.send(ControlEvent::Message(ty, payload)).await.is_err() {
                return Ok(());
            }
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// The 32-bit version format only has one byte per component; an
/// overflowing patch is clamped to 255.
fn legacy_version((major, minor, patch): (u16, u16, u16)) -> u32 {
    (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch.min(255))
}

fn new_version((major, minor, patch): (u16, u16, u16)) -> u64 {
    (u64::from(major) << 48) | (u64::from(minor) << 32) | (u64::from(patch) << 16)
}

/// OS version string for the handshake: the kernel release where one is
/// readable, a placeholder elsewhere.
fn os_version_string() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
            let release = release.trim();
            if !release.is_empty() {
                return release.to_owned();
            }
        }
    }
    "unknown".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut backoff = CONNECTION_RETRY_INTERVAL;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn version_packet_encodes_both_formats() {
        let tracker = Arc::new(Mutex::new(PingTracker::default()));
        let control = ControlStack::new(
            Config::new("voip.example.org", "bot"),
            tracker,
            CancellationToken::new(),
        );
        let packet = control.version_packet();
        let (major, minor, patch) = PROTOCOL_VERSION;
        assert_eq!(
            packet.version_v1,
            Some((u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch))
        );
        assert_eq!(
            packet.version_v2,
            Some((u64::from(major) << 48) | (u64::from(minor) << 32) | (u64::from(patch) << 16))
        );
        assert!(packet.release.unwrap().contains(env!("CARGO_PKG_VERSION")));
        assert!(!packet.os_version.unwrap().is_empty());
    }

    #[test]
    fn legacy_version_clamps_an_overflowing_patch() {
        let version = (1u16, 4u16, 300u16);
        assert_eq!(legacy_version(version), 0x0001_04FF);
        // The 64-bit format carries the patch in full.
        assert_eq!(
            new_version(version),
            (1u64 << 48) | (4u64 << 32) | (300u64 << 16)
        );

        // In range, the patch passes through unclamped.
        assert_eq!(legacy_version((1, 5, 2)), 0x0001_0502);
    }

    #[test]
    fn server_version_prefers_the_v2_field() {
        let tracker = Arc::new(Mutex::new(PingTracker::default()));
        let control = ControlStack::new(
            Config::new("voip.example.org", "bot"),
            tracker,
            CancellationToken::new(),
        );

        control.set_server_version(&mumble_proto::Version {
            version_v1: Some(0x0001_0205),
            ..Default::default()
        });
        assert_eq!(control.server_version(), (1, 2, 5));

        control.set_server_version(&mumble_proto::Version {
            version_v1: Some(0x0001_0205),
            version_v2: Some(0x0001_0005_0000_0000),
            ..Default::default()
        });
        assert_eq!(control.server_version(), (1, 5, 0));
    }

    #[test]
    fn authenticate_packet_carries_credentials() {
        let tracker = Arc::new(Mutex::new(PingTracker::default()));
        let mut config = Config::new("voip.example.org", "bot");
        config.password = "hunter2".into();
        config.tokens = vec!["secret".into()];
        let control = ControlStack::new(config, tracker, CancellationToken::new());

        let packet = control.authenticate_packet();
        assert_eq!(packet.username.as_deref(), Some("bot"));
        assert_eq!(packet.password.as_deref(), Some("hunter2"));
        assert_eq!(packet.tokens, vec!["secret".to_owned()]);
        assert_eq!(packet.opus, Some(true));
        assert_eq!(packet.client_type, Some(1));
    }

    #[test]
    fn rejection_is_latched() {
        let tracker = Arc::new(Mutex::new(PingTracker::default()));
        let control = ControlStack::new(
            Config::new("voip.example.org", "bot"),
            tracker,
            CancellationToken::new(),
        );
        assert_eq!(control.rejected(), None);
        control.set_rejected("WrongServerPW");
        assert_eq!(control.rejected().as_deref(), Some("WrongServerPW"));
        assert_eq!(control.status(), Status::Failed);
    }
}
