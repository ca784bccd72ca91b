//! Client library for the Mumble voice-chat protocol.
//!
//! [`Mumble`] maintains an authenticated TLS control session and, when the
//! server answers encrypted UDP probes, an OCB2-AES128 voice session. Server
//! state (channels, users, ACLs) is replicated locally and surfaced through
//! registered callbacks; PCM pushed into the client is Opus-encoded and sent
//! over whichever transport is currently active.

pub mod audio;
pub mod blobs;
pub mod callbacks;
pub mod client;
pub mod commands;
pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;
pub mod ping;
pub mod state;
pub mod udp;
pub mod varint;
pub mod voice;

pub mod mumble_proto {
    include!(concat!(env!("OUT_DIR"), "/mumble_proto.rs"));
}

pub mod mumble_udp {
    include!(concat!(env!("OUT_DIR"), "/mumble_udp.rs"));
}

pub use client::Mumble;
pub use commands::Command;
pub use config::{ClientType, Config};
pub use error::Error;
