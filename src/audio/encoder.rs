//! Outbound Opus encoding and the bitrate budget.
//!
//! The Opus bitrate is whatever remains of the bandwidth ceiling after
//! per-packet transport overhead, so it is recomputed whenever the voice
//! stack switches between datagram and tunnelled transport.

use std::time::Duration;

use log::debug;
use opus::{Bitrate, Channels};

use crate::audio::{CodecProfile, SAMPLE_RATE};
use crate::error::Error;

/// Largest voice frame the protocol allows.
const MAX_FRAME_BYTES: usize = 1020;
/// Floor under the computed bitrate, matching Opus's narrowband minimum.
const MIN_BITRATE: i32 = 8_000;

pub struct Encoder {
    opus: opus::Encoder,
    channels: u32,
    audio_per_packet: Duration,
    bandwidth: u32,
    datagram: bool,
}

impl Encoder {
    pub fn new(
        profile: CodecProfile,
        stereo: bool,
        audio_per_packet: Duration,
        bandwidth: u32,
    ) -> Result<Encoder, Error> {
        let channels = if stereo { 2 } else { 1 };
        let opus = opus::Encoder::new(
            SAMPLE_RATE,
            if stereo {
                Channels::Stereo
            } else {
                Channels::Mono
            },
            profile.application(),
        )?;
        let mut encoder = Encoder {
            opus,
            channels,
            audio_per_packet,
            bandwidth,
            datagram: false,
        };
        encoder.opus.set_packet_loss_perc(15)?;
        encoder.apply_bitrate()?;
        Ok(encoder)
    }

    /// Samples per packet, all channels interleaved.
    pub fn samples_per_packet(&self) -> usize {
        (SAMPLE_RATE as usize / 1000) * self.audio_per_packet.as_millis() as usize
            * self.channels as usize
    }

    /// One packet's worth of 16-bit PCM, in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_packet() * 2
    }

    pub fn audio_per_packet(&self) -> Duration {
        self.audio_per_packet
    }

    /// Encode one frame of little-endian 16-bit PCM, zero-padding a short
    /// final frame.
    pub fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>, Error> {
        let mut samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        samples.resize(self.samples_per_packet(), 0);

        let mut frame = vec![0u8; MAX_FRAME_BYTES];
        let written = self.opus.encode(&samples, &mut frame)?;
        frame.truncate(written);
        Ok(frame)
    }

    /// New bandwidth ceiling (already min'd with the server's advertisement).
    pub fn set_bandwidth(&mut self, bandwidth: u32) {
        self.bandwidth = bandwidth;
        if let Err(e) = self.apply_bitrate() {
            log::error!("failed to apply bitrate: {e}");
        }
    }

    /// Transport switch notification from the voice stack.
    pub fn set_transport(&mut self, datagram: bool) {
        self.datagram = datagram;
        if let Err(e) = self.apply_bitrate() {
            log::error!("failed to apply bitrate: {e}");
        }
    }

    fn apply_bitrate(&mut self) -> Result<(), Error> {
        let bitrate = budget(self.bandwidth, self.audio_per_packet, self.datagram);
        debug!(
            "opus bitrate {bitrate} bit/s (ceiling {}, {})",
            self.bandwidth,
            if self.datagram { "udp" } else { "tcp" }
        );
        self.opus.set_bitrate(Bitrate::Bits(bitrate))?;
        Ok(())
    }
}

/// Bits per second left for Opus after transport overhead.
///
/// Datagram packets pay IP plus the cipher header; tunnelled packets pay IP,
/// TCP, and the tunnel framing. Both carry the per-frame header.
pub fn budget(bandwidth: u32, audio_per_packet: Duration, datagram: bool) -> i32 {
    let mut overhead_per_packet = 20 + 3;
    if datagram {
        overhead_per_packet += 12;
    } else {
        overhead_per_packet += 20 + 6;
    }
    let packets_per_second = 1.0 / audio_per_packet.as_secs_f64();
    let overhead_per_second = (overhead_per_packet * 8) as f64 * packets_per_second;
    ((bandwidth as i64 - overhead_per_second as i64) as i32).max(MIN_BITRATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWENTY_MS: Duration = Duration::from_millis(20);

    #[test]
    fn datagram_overhead_is_cheaper_than_tunnelled() {
        // 35 bytes/packet at 50 packets/s = 14 kbit/s.
        assert_eq!(budget(96_000, TWENTY_MS, true), 96_000 - 14_000);
        // 49 bytes/packet at 50 packets/s = 19.6 kbit/s.
        assert_eq!(budget(96_000, TWENTY_MS, false), 96_000 - 19_600);
    }

    #[test]
    fn longer_packets_amortize_the_overhead() {
        assert!(budget(96_000, Duration::from_millis(60), true) > budget(96_000, TWENTY_MS, true));
    }

    #[test]
    fn budget_never_collapses_below_the_floor() {
        assert_eq!(budget(10_000, Duration::from_millis(10), false), MIN_BITRATE);
    }

    #[test]
    fn frame_sizing_matches_the_configuration() {
        let encoder = Encoder::new(CodecProfile::Audio, true, TWENTY_MS, 96_000).unwrap();
        // 20 ms x 48 kHz x 2 channels.
        assert_eq!(encoder.samples_per_packet(), 1920);
        assert_eq!(encoder.frame_bytes(), 3840);

        let encoder = Encoder::new(CodecProfile::Voip, false, TWENTY_MS, 96_000).unwrap();
        assert_eq!(encoder.samples_per_packet(), 960);
    }

    #[test]
    fn encodes_a_padded_short_frame() {
        let mut encoder = Encoder::new(CodecProfile::Audio, false, TWENTY_MS, 96_000).unwrap();
        // Half a frame of silence; the encoder pads and still emits one
        // packet.
        let pcm = vec![0u8; encoder.frame_bytes() / 2];
        let frame = encoder.encode(&pcm).unwrap();
        assert!(!frame.is_empty());
        assert!(frame.len() <= MAX_FRAME_BYTES);
    }
}
