//! The `Mumble` facade: owns every subsystem, runs the control-message
//! dispatcher, and exposes the embedder API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use num_traits::FromPrimitive;
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::decoder::DecoderPool;
use crate::audio::encoder::Encoder;
use crate::audio::output::{run_sender, AudioOutput};
use crate::audio::queue::SoundQueue;
use crate::blobs::BlobCache;
use crate::callbacks::Callbacks;
use crate::commands::{Command, ServerSettings};
use crate::config::Config;
use crate::control::{ControlEvent, ControlStack, Status};
use crate::error::Error;
use crate::messages::{MessageType, PermissionDeniedEvent, TextMessageEvent};
use crate::mumble_proto;
use crate::ping::{self, PingTracker, PING_INTERVAL};
use crate::state::Replicator;
use crate::udp::{self, InboundVoice};
use crate::voice::VoiceStack;

const EVENT_QUEUE_DEPTH: usize = 64;

/// A client session towards one Mumble server.
///
/// Construct with [`Mumble::new`], register callbacks, then [`start`]
/// (`Mumble::start`). The client owns its worker tasks; [`stop`]
/// (`Mumble::stop`) tears them down.
pub struct Mumble {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    weak: Weak<ClientInner>,
    config: Config,
    settings: Mutex<ServerSettings>,
    /// Server-advertised bandwidth ceiling; zero until known.
    server_max_bandwidth: AtomicU32,
    control: Arc<ControlStack>,
    voice: tokio::sync::OnceCell<Arc<VoiceStack>>,
    audio_out: Arc<AudioOutput>,
    audio_frames: Mutex<Option<mpsc::Receiver<Bytes>>>,
    decoder_pool: tokio::sync::OnceCell<Arc<DecoderPool>>,
    queues: Mutex<HashMap<u32, SoundQueue>>,
    state: Replicator,
    callbacks: Arc<Callbacks>,
    tracker: Arc<Mutex<PingTracker>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    sound_receive: AtomicBool,
    events_rx: Mutex<Option<mpsc::Receiver<ControlEvent>>>,
    events_tx: mpsc::Sender<ControlEvent>,
    voice_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    voice_tx: mpsc::Sender<Vec<u8>>,
}

impl Mumble {
    pub fn new(config: Config) -> Result<Mumble, Error> {
        config.validate()?;

        let blobs = Arc::new(BlobCache::open(config.blob_cache.as_deref())?);
        let callbacks = Arc::new(Callbacks::new());
        let state = Replicator::new(callbacks.clone(), blobs, config.greedy_blob_update);
        let tracker = Arc::new(Mutex::new(PingTracker::default()));
        let cancel = CancellationToken::new();
        let control = ControlStack::new(config.clone(), tracker.clone(), cancel.clone());

        let encoder = Encoder::new(
            config.codec_profile,
            config.stereo,
            Duration::from_millis(config.audio_per_packet_ms),
            config.bandwidth,
        )?;
        let (audio_out, frames_rx) = AudioOutput::new(encoder);

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (voice_tx, voice_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let inner = Arc::new_cyclic(|weak| ClientInner {
            weak: weak.clone(),
            config,
            settings: Mutex::new(ServerSettings::default()),
            server_max_bandwidth: AtomicU32::new(0),
            control,
            voice: tokio::sync::OnceCell::new(),
            audio_out,
            audio_frames: Mutex::new(Some(frames_rx)),
            decoder_pool: tokio::sync::OnceCell::new(),
            queues: Mutex::new(HashMap::new()),
            state,
            callbacks,
            tracker,
            cancel,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            sound_receive: AtomicBool::new(true),
            events_rx: Mutex::new(Some(events_rx)),
            events_tx,
            voice_rx: Mutex::new(Some(voice_rx)),
            voice_tx,
        });
        Ok(Mumble { inner })
    }

    /// Callback registration surface.
    pub fn callbacks(&self) -> &Callbacks {
        &self.inner.callbacks
    }

    /// Connect and run until the server sync opens the session or the
    /// attempt fails. With `reconnect` configured, later drops are retried
    /// in the background; a server rejection is always final.
    pub async fn start(&self) -> Result<(), Error> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Config("client already started".into()));
        }
        let inner = &self.inner;

        inner.callbacks.spawn_workers(inner.config.callback_workers);
        let _ = inner
            .decoder_pool
            .set(DecoderPool::new(inner.config.decoder_workers));

        let voice = VoiceStack::new(
            &inner.config.host,
            inner.config.port,
            inner.control.clone(),
            inner.tracker.clone(),
            inner.voice_tx.clone(),
            inner.cancel.clone(),
        )
        .await?;
        let _ = inner.voice.set(voice.clone());

        let mut status_rx = inner.control.subscribe_status();

        let mut tasks = inner.tasks.lock();
        let events_rx = inner.events_rx.lock().take().expect("fresh client");
        tasks.push(tokio::spawn(dispatch_events(
            Arc::downgrade(inner),
            events_rx,
        )));
        let voice_rx = inner.voice_rx.lock().take().expect("fresh client");
        tasks.push(tokio::spawn(dispatch_voice(
            Arc::downgrade(inner),
            voice_rx,
        )));
        tasks.push(tokio::spawn(
            inner.control.clone().run(inner.events_tx.clone()),
        ));
        tasks.push(tokio::spawn(ping::run(
            inner.control.clone(),
            voice.clone(),
            inner.tracker.clone(),
            inner.cancel.clone(),
        )));
        let frames_rx = inner.audio_frames.lock().take().expect("fresh client");
        tasks.push(tokio::spawn(run_sender(
            inner.audio_out.clone(),
            voice.clone(),
            frames_rx,
            inner.cancel.clone(),
        )));
        tasks.push(tokio::spawn(watch_transport(
            Arc::downgrade(inner),
            voice.clone(),
        )));
        drop(tasks);

        loop {
            match *status_rx.borrow_and_update() {
                Status::Connected => return Ok(()),
                Status::Failed => {
                    return Err(match inner.control.rejected() {
                        Some(reason) => Error::ConnectionRejected(reason),
                        None => Error::ConnectionFailed(
                            "could not establish a session".into(),
                        ),
                    })
                }
                _ => {}
            }
            if status_rx.changed().await.is_err() {
                return Err(Error::NotConnected);
            }
        }
    }

    /// Tear the session down. Idempotent; running callbacks complete, no
    /// new ones fire.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(PING_INTERVAL * 2, task).await.is_err() {
                warn!("worker did not stop in time, aborting it");
                abort.abort();
            }
        }
        info!("disconnected");
    }

    /// Send a command; with `blocking` the call waits for the session to be
    /// ready first.
    pub async fn execute_command(&self, command: Command, blocking: bool) -> Result<(), Error> {
        if blocking {
            self.wait_ready().await?;
        }
        self.inner.control.send_command(command).await;
        Ok(())
    }

    /// Block until `ServerSync` has opened the session.
    pub async fn wait_ready(&self) -> Result<(), Error> {
        let mut status_rx = self.inner.control.subscribe_status();
        loop {
            match *status_rx.borrow_and_update() {
                Status::Connected => return Ok(()),
                Status::Failed => return Err(Error::NotConnected),
                _ => {}
            }
            if status_rx.changed().await.is_err() {
                return Err(Error::NotConnected);
            }
        }
    }

    /// Queue 16-bit little-endian PCM for transmission.
    pub fn add_pcm(&self, pcm: &[u8]) -> Result<(), Error> {
        self.inner.audio_out.add_pcm(pcm)
    }

    /// Aim subsequent audio at a whisper target: a set of users, or (with
    /// `channel`) one channel. Target 1 is the channel shortcut, 2 the user
    /// shortcut.
    pub async fn set_whisper(&self, targets: &[u32], channel: bool) -> Result<(), Error> {
        if targets.is_empty() {
            return Err(Error::Config("whisper target list is empty".into()));
        }
        let id = if channel { 1 } else { 2 };
        let command = if channel {
            Command::whisper_channel(id, targets[0])
        } else {
            Command::whisper_users(id, targets)
        };
        self.execute_command(command, false).await?;
        self.inner.audio_out.set_target(id as u8);
        Ok(())
    }

    /// Back to normal talking.
    pub async fn remove_whisper(&self) -> Result<(), Error> {
        self.inner.audio_out.set_target(0);
        self.execute_command(Command::clear_whisper(0), false).await
    }

    /// Positional coordinates attached to outgoing audio.
    pub fn set_positional(&self, positional: Option<[f32; 3]>) {
        self.inner.audio_out.set_positional(positional);
    }

    /// Request large blobs by owner id.
    pub async fn request_blob(
        &self,
        session_textures: &[u32],
        session_comments: &[u32],
        channel_descriptions: &[u32],
    ) -> Result<(), Error> {
        self.execute_command(
            Command::request_blob(session_textures, session_comments, channel_descriptions),
            false,
        )
        .await
    }

    /// Re-authenticate with an additional access token.
    pub async fn reauthenticate(&self, token: impl Into<String>) {
        self.inner.control.reauthenticate(token).await;
    }

    /// Whether inbound audio is decoded and delivered.
    pub fn set_receive_sound(&self, enabled: bool) {
        self.inner.sound_receive.store(enabled, Ordering::Relaxed);
    }

    /// Release string reported in the version handshake.
    pub fn set_application_string(&self, application: impl Into<String>) {
        self.inner.control.set_application_string(application);
    }

    pub fn status(&self) -> Status {
        self.inner.control.status()
    }

    /// `"udp"` while promoted, `"tcp"` while tunnelled.
    pub fn voice_transport(&self) -> &'static str {
        match self.inner.voice.get() {
            Some(voice) if voice.is_active() => "udp",
            _ => "tcp",
        }
    }

    pub fn settings(&self) -> ServerSettings {
        self.inner.settings.lock().clone()
    }

    pub fn channel(&self, id: u32) -> Option<crate::state::Channel> {
        self.inner.state.channel(id)
    }

    pub fn user(&self, session: u32) -> Option<crate::state::User> {
        self.inner.state.user(session)
    }

    pub fn myself(&self) -> Option<crate::state::User> {
        self.inner.state.myself()
    }

    pub fn acl(&self, channel_id: u32) -> Option<crate::state::AclView> {
        self.inner.state.acl(channel_id)
    }
}

async fn dispatch_events(inner: Weak<ClientInner>, mut events: mpsc::Receiver<ControlEvent>) {
    loop {
        let Some(event) = events.recv().await else {
            break;
        };
        let Some(inner) = inner.upgrade() else { break };
        match event {
            ControlEvent::Message(ty, payload) => inner.handle_message(ty, payload).await,
            ControlEvent::Disconnected => {
                if let Some(voice) = inner.voice.get() {
                    voice.demote();
                }
                inner.callbacks.disconnected();
            }
        }
    }
    debug!("control dispatcher exiting");
}

async fn dispatch_voice(inner: Weak<ClientInner>, mut packets: mpsc::Receiver<Vec<u8>>) {
    loop {
        let Some(payload) = packets.recv().await else {
            break;
        };
        let Some(inner) = inner.upgrade() else { break };
        let legacy = inner.control.server_version() < (1, 5, 0);
        match udp::parse(&payload, legacy) {
            Ok(packet) => inner.route_voice(packet).await,
            Err(e) => debug!("dropping malformed voice datagram: {e}"),
        }
    }
    debug!("voice dispatcher exiting");
}

/// Mirror promotion/demotion into the encoder's overhead accounting.
async fn watch_transport(inner: Weak<ClientInner>, voice: Arc<VoiceStack>) {
    let mut active_rx = voice.subscribe_active();
    loop {
        if active_rx.changed().await.is_err() {
            break;
        }
        let datagram = *active_rx.borrow_and_update();
        let Some(inner) = inner.upgrade() else { break };
        inner.audio_out.set_transport(datagram);
    }
}

impl ClientInner {
    async fn handle_message(self: &Arc<Self>, ty: u16, payload: Bytes) {
        let Some(message_type) = MessageType::from_u16(ty) else {
            warn!("ignoring control message with unknown type {ty}");
            return;
        };
        debug!("received {message_type:?}");

        match message_type {
            MessageType::Version => {
                match mumble_proto::Version::decode(payload.as_ref()) {
                    Ok(packet) => self.control.set_server_version(&packet),
                    Err(e) => warn!("malformed Version packet: {e}"),
                }
                // A Version packet opens a new handshake; the state burst
                // that follows repopulates the tables.
                self.state.clear();
                self.queues.lock().clear();
            }
            MessageType::UdpTunnel => {
                if self.sound_receive.load(Ordering::Relaxed) {
                    self.route_tunnel(&payload).await;
                }
            }
            MessageType::Authenticate => {}
            MessageType::Ping => {
                self.tracker.lock().tcp.record_elapsed();
            }
            MessageType::Reject => {
                let reason = mumble_proto::Reject::decode(payload.as_ref())
                    .ok()
                    .and_then(|packet| packet.reason)
                    .unwrap_or_else(|| "connection rejected".into());
                warn!("server rejected the connection: {reason}");
                self.control.set_rejected(reason);
            }
            MessageType::ServerSync => {
                let Ok(packet) = mumble_proto::ServerSync::decode(payload.as_ref()) else {
                    warn!("malformed ServerSync packet");
                    return;
                };
                if let Some(session) = packet.session {
                    self.state.set_myself(session);
                }
                self.state.set_ready(true);
                if let Some(max_bandwidth) = packet.max_bandwidth {
                    self.server_max_bandwidth
                        .store(max_bandwidth, Ordering::Relaxed);
                }
                self.apply_bandwidth();
                let user_count = self.state.user_count() as u32;
                self.control
                    .set_command_limit(user_count.max(self.config.command_limit));

                if let Some(voice) = self.voice.get() {
                    voice.sync();
                }
                if self.control.status() == Status::Authenticating {
                    self.control.set_status(Status::Connected);
                    self.callbacks.commit();
                    self.callbacks.connected();
                    info!("connected to the server");
                }
            }
            MessageType::ChannelRemove => {
                if let Ok(packet) = mumble_proto::ChannelRemove::decode(payload.as_ref()) {
                    self.state.handle_channel_remove(packet.channel_id);
                }
            }
            MessageType::ChannelState => {
                if let Ok(packet) = mumble_proto::ChannelState::decode(payload.as_ref()) {
                    if let Some(request) = self.state.handle_channel_state(&packet) {
                        self.control.send_command(request).await;
                    }
                }
            }
            MessageType::UserRemove => {
                if let Ok(packet) = mumble_proto::UserRemove::decode(payload.as_ref()) {
                    self.queues.lock().remove(&packet.session);
                    self.state.handle_user_remove(&packet);
                }
            }
            MessageType::UserState => {
                if let Ok(packet) = mumble_proto::UserState::decode(payload.as_ref()) {
                    if let Some(request) = self.state.handle_user_state(&packet) {
                        self.control.send_command(request).await;
                    }
                }
            }
            MessageType::TextMessage => {
                if let Ok(packet) = mumble_proto::TextMessage::decode(payload.as_ref()) {
                    let event = TextMessageEvent {
                        author: packet.actor.and_then(|actor| self.state.user(actor)),
                        channel: packet
                            .channel_id
                            .first()
                            .and_then(|&id| self.state.channel(id)),
                        content: packet.message,
                    };
                    self.callbacks.message(event);
                }
            }
            MessageType::PermissionDenied => {
                if let Ok(packet) = mumble_proto::PermissionDenied::decode(payload.as_ref()) {
                    self.callbacks.permission_denied(PermissionDeniedEvent {
                        session: packet.session,
                        channel_id: packet.channel_id,
                        name: packet.name,
                        deny_type: packet.r#type.unwrap_or_default(),
                        reason: packet.reason,
                    });
                }
            }
            MessageType::Acl => {
                if let Ok(packet) = mumble_proto::Acl::decode(payload.as_ref()) {
                    self.state.handle_acl(&packet);
                }
            }
            MessageType::CryptSetup => {
                if let Ok(packet) = mumble_proto::CryptSetup::decode(payload.as_ref()) {
                    if let Some(voice) = self.voice.get() {
                        voice.crypt_setup(&packet).await;
                        if voice.probing() {
                            voice.probe().await;
                        }
                    }
                }
            }
            MessageType::ServerConfig => {
                if let Ok(packet) = mumble_proto::ServerConfig::decode(payload.as_ref()) {
                    let mut settings = self.settings.lock();
                    if let Some(allow_html) = packet.allow_html {
                        settings.allow_html = allow_html;
                    }
                    if let Some(message_length) = packet.message_length {
                        settings.max_message_length = message_length;
                    }
                    if let Some(image_message_length) = packet.image_message_length {
                        settings.max_image_message_length = image_message_length;
                    }
                    drop(settings);
                    if let Some(max_bandwidth) = packet.max_bandwidth {
                        self.server_max_bandwidth
                            .store(max_bandwidth, Ordering::Relaxed);
                        self.apply_bandwidth();
                    }
                }
            }
            MessageType::BanList
            | MessageType::QueryUsers
            | MessageType::ContextActionModify
            | MessageType::ContextAction
            | MessageType::UserList
            | MessageType::VoiceTarget
            | MessageType::PermissionQuery
            | MessageType::CodecVersion
            | MessageType::UserStats
            | MessageType::RequestBlob
            | MessageType::SuggestConfig
            | MessageType::PluginDataTransmission => {}
        }
    }

    /// Voice frames arriving through the reliable channel.
    async fn route_tunnel(&self, payload: &[u8]) {
        let legacy = self.control.server_version() < (1, 5, 0);
        let parsed = if legacy {
            udp::parse(payload, true)
        } else {
            match mumble_proto::UdpTunnel::decode(payload) {
                Ok(wrapper) => udp::parse(&wrapper.packet, false),
                Err(e) => {
                    debug!("malformed UDPTunnel wrapper: {e}");
                    return;
                }
            }
        };
        match parsed {
            Ok(packet) => self.route_voice(packet).await,
            Err(e) => debug!("dropping malformed tunnelled frame: {e}"),
        }
    }

    async fn route_voice(&self, packet: InboundVoice) {
        match packet {
            InboundVoice::Ping(ping) => {
                if let Some(voice) = self.voice.get() {
                    if let Some(max_bandwidth) = voice.handle_ping_response(&ping) {
                        debug!("server max bandwidth per user: {max_bandwidth}");
                        self.server_max_bandwidth
                            .store(max_bandwidth, Ordering::Relaxed);
                        self.apply_bandwidth();
                    }
                }
            }
            InboundVoice::Audio(audio) => {
                if !self.sound_receive.load(Ordering::Relaxed) {
                    return;
                }
                if self.state.user(audio.session).is_none() {
                    warn!("audio from unknown session {}", audio.session);
                    return;
                }
                let Some(pool) = self.decoder_pool.get() else {
                    return;
                };

                let mut queues = self.queues.lock();
                let queue = queues.entry(audio.session).or_insert_with(|| {
                    let session = audio.session;
                    let weak = self.weak.clone();
                    SoundQueue::new(pool.clone(), move |chunk| {
                        if let Some(inner) = weak.upgrade() {
                            if let Some(user) = inner.state.user(session) {
                                inner.callbacks.sound_received(user, chunk);
                            }
                        }
                    })
                });
                if let Err(e) = queue.add(audio.data, audio.sequence, audio.codec, audio.target) {
                    log::error!("dropping audio from session {}: {e}", audio.session);
                }
            }
        }
    }

    /// Effective ceiling is the configured bandwidth capped by the server's
    /// advertisement.
    fn apply_bandwidth(&self) {
        let server_max = self.server_max_bandwidth.load(Ordering::Relaxed);
        let effective = if server_max > 0 {
            self.config.bandwidth.min(server_max)
        } else {
            self.config.bandwidth
        };
        self.audio_out.set_bandwidth(effective);
    }
}
