use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audio::CodecProfile;
use crate::error::Error;

pub const DEFAULT_PORT: u16 = 64738;
pub const DEFAULT_BANDWIDTH: u32 = 96_000;
pub const DEFAULT_COMMAND_LIMIT: u32 = 5;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    User = 0,
    #[default]
    Bot = 1,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Access tokens sent with `Authenticate` to unlock ACL groups.
    #[serde(default)]
    pub tokens: Vec<String>,
    /// PEM client certificate and key, both or neither.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default)]
    pub stereo: bool,
    #[serde(default)]
    pub client_type: ClientType,
    #[serde(default)]
    pub codec_profile: CodecProfile,
    #[serde(default)]
    pub debug: bool,
    /// Path of the blob cache database. `None` keeps it in memory.
    #[serde(default)]
    pub blob_cache: Option<PathBuf>,
    /// When set, a changed comment/avatar/description hash triggers an
    /// immediate blob fetch instead of waiting for first use.
    #[serde(default)]
    pub greedy_blob_update: bool,
    #[serde(default = "default_callback_workers")]
    pub callback_workers: usize,
    #[serde(default = "default_decoder_workers")]
    pub decoder_workers: usize,
    /// Audio bandwidth ceiling in bits per second; the effective ceiling is
    /// the minimum of this and the server-advertised maximum.
    #[serde(default = "default_bandwidth")]
    pub bandwidth: u32,
    /// Packetization interval in milliseconds. Must be an Opus frame size.
    #[serde(default = "default_audio_per_packet_ms")]
    pub audio_per_packet_ms: u64,
    /// Outbound commands per second before the server sync raises the limit.
    #[serde(default = "default_command_limit")]
    pub command_limit: u32,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_callback_workers() -> usize {
    1
}

fn default_decoder_workers() -> usize {
    1
}

fn default_bandwidth() -> u32 {
    DEFAULT_BANDWIDTH
}

fn default_audio_per_packet_ms() -> u64 {
    20
}

fn default_command_limit() -> u32 {
    DEFAULT_COMMAND_LIMIT
}

impl Config {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Config {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: String::new(),
            tokens: Vec::new(),
            cert_file: None,
            key_file: None,
            reconnect: false,
            stereo: false,
            client_type: ClientType::default(),
            codec_profile: CodecProfile::default(),
            debug: false,
            blob_cache: None,
            greedy_blob_update: false,
            callback_workers: default_callback_workers(),
            decoder_workers: default_decoder_workers(),
            bandwidth: DEFAULT_BANDWIDTH,
            audio_per_packet_ms: default_audio_per_packet_ms(),
            command_limit: DEFAULT_COMMAND_LIMIT,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let cfg: Config = serde_json::from_reader(reader)
            .map_err(|e| Error::Config(format!("invalid config file: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn channels(&self) -> u32 {
        if self.stereo {
            2
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.username.is_empty() {
            return Err(Error::Config("username must not be empty".into()));
        }
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                for path in [cert, key] {
                    if !path.is_file() {
                        return Err(Error::Config(format!(
                            "certificate material not found: {}",
                            path.display()
                        )));
                    }
                }
            }
            (None, None) => {}
            _ => {
                return Err(Error::Config(
                    "cert_file and key_file must be provided together".into(),
                ))
            }
        }
        if self.bandwidth < 8_000 {
            return Err(Error::Config(format!(
                "bandwidth {} is below the 8 kbit/s floor",
                self.bandwidth
            )));
        }
        if !matches!(self.audio_per_packet_ms, 10 | 20 | 40 | 60) {
            return Err(Error::Config(format!(
                "audio_per_packet_ms must be an Opus frame size (10/20/40/60), got {}",
                self.audio_per_packet_ms
            )));
        }
        if self.callback_workers == 0 || self.decoder_workers == 0 {
            return Err(Error::Config("worker pool sizes must be non-zero".into()));
        }
        Ok(())
    }
}
