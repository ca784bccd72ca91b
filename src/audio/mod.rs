//! The voice pipeline: Opus encode/decode, packet pacing, and per-speaker
//! reassembly.

pub mod decoder;
pub mod encoder;
pub mod output;
pub mod queue;

use std::time::Duration;

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

pub const SAMPLE_RATE: u32 = 48_000;
/// One sequence unit on the wire.
pub const SEQUENCE_DURATION: Duration = Duration::from_millis(10);
/// Idle time after which an outbound burst restarts at sequence zero.
pub const SEQUENCE_RESET_INTERVAL: Duration = Duration::from_secs(5);

/// Audio type tag of the legacy voice header (top three bits).
#[repr(u8)]
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioType {
    CeltAlpha = 0,
    Ping = 1,
    Speex = 2,
    CeltBeta = 3,
    Opus = 4,
}

/// Opus application profile, selectable at configuration time.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodecProfile {
    #[default]
    Audio,
    Voip,
    RestrictedLowDelay,
}

impl CodecProfile {
    pub fn application(self) -> opus::Application {
        match self {
            CodecProfile::Audio => opus::Application::Audio,
            CodecProfile::Voip => opus::Application::Voip,
            CodecProfile::RestrictedLowDelay => opus::Application::LowDelay,
        }
    }
}
