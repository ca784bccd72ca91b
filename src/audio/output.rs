//! The outbound half of the pipeline: PCM intake, sequence scheduling, and
//! the paced sender task.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::encoder::Encoder;
use crate::audio::{SEQUENCE_DURATION, SEQUENCE_RESET_INTERVAL};
use crate::error::Error;
use crate::udp::{AudioData, UdpData};
use crate::voice::VoiceStack;

/// Frames buffered between `add_pcm` and the sender before new audio is
/// dropped (one second at 20 ms per frame).
const FRAME_QUEUE_DEPTH: usize = 50;

/// The wire sequence counter, measured in 10 ms units.
///
/// A fresh burst starts at zero; a pause longer than two packets
/// fast-forwards to wall-clock so the receiver's jitter math stays anchored;
/// five idle seconds reset the burst entirely.
#[derive(Default)]
pub struct SequenceClock {
    sequence: u64,
    start: Option<Instant>,
    last: Option<Instant>,
}

impl SequenceClock {
    pub fn next(&mut self, now: Instant, audio_per_packet: Duration) -> u64 {
        match (self.start, self.last) {
            (Some(start), Some(last)) if now < last + SEQUENCE_RESET_INTERVAL => {
                if now >= last + audio_per_packet * 2 {
                    // Resuming after a short pause: derive the sequence from
                    // elapsed wall-clock.
                    self.sequence = (now.duration_since(start).as_millis()
                        / SEQUENCE_DURATION.as_millis())
                        as u64;
                } else {
                    self.sequence +=
                        (audio_per_packet.as_millis() / SEQUENCE_DURATION.as_millis()) as u64;
                }
                self.last = Some(start + SEQUENCE_DURATION * self.sequence as u32);
            }
            _ => {
                self.sequence = 0;
                self.start = Some(now);
                self.last = Some(now);
            }
        }
        self.sequence
    }

    /// When the packet just scheduled should stop occupying the wire.
    pub fn deadline(&self, audio_per_packet: Duration) -> Option<Instant> {
        self.last.map(|last| last + audio_per_packet)
    }
}

pub struct AudioOutput {
    encoder: Mutex<Encoder>,
    pending: Mutex<BytesMut>,
    frames: mpsc::Sender<Bytes>,
    frame_bytes: usize,
    audio_per_packet: Duration,
    target: AtomicU8,
    positional: Mutex<Option<[f32; 3]>>,
}

impl AudioOutput {
    pub fn new(encoder: Encoder) -> (Arc<AudioOutput>, mpsc::Receiver<Bytes>) {
        let (frames, rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let frame_bytes = encoder.frame_bytes();
        let audio_per_packet = encoder.audio_per_packet();
        let output = Arc::new(AudioOutput {
            encoder: Mutex::new(encoder),
            pending: Mutex::new(BytesMut::new()),
            frames,
            frame_bytes,
            audio_per_packet,
            target: AtomicU8::new(0),
            positional: Mutex::new(None),
        });
        (output, rx)
    }

    /// Queue 16-bit little-endian PCM at the configured rate and channel
    /// count. Data accumulates until a full frame is available; overflow
    /// beyond the queue depth is dropped, not blocked on.
    pub fn add_pcm(&self, pcm: &[u8]) -> Result<(), Error> {
        if pcm.len() % 2 != 0 {
            return Err(Error::Config("pcm data must be 16-bit".into()));
        }
        let mut pending = self.pending.lock();
        pending.extend_from_slice(pcm);
        while pending.len() >= self.frame_bytes {
            let frame = pending.split_to(self.frame_bytes).freeze();
            if self.frames.try_send(frame).is_err() {
                warn!("outbound audio queue full, dropping a frame");
            }
        }
        Ok(())
    }

    /// Current whisper target, 0 for normal talking.
    pub fn target(&self) -> u8 {
        self.target.load(Ordering::Relaxed)
    }

    pub fn set_target(&self, target: u8) {
        self.target.store(target, Ordering::Relaxed);
    }

    pub fn positional(&self) -> Option<[f32; 3]> {
        *self.positional.lock()
    }

    /// Positional coordinates attached to subsequent audio packets.
    pub fn set_positional(&self, positional: Option<[f32; 3]>) {
        *self.positional.lock() = positional;
    }

    pub fn set_bandwidth(&self, bandwidth: u32) {
        self.encoder.lock().set_bandwidth(bandwidth);
    }

    pub fn set_transport(&self, datagram: bool) {
        self.encoder.lock().set_transport(datagram);
    }
}

/// The sender: encodes one frame per packet interval and hands it to the
/// voice stack, sleeping to the frame boundary in between.
pub async fn run_sender(
    output: Arc<AudioOutput>,
    voice: Arc<VoiceStack>,
    mut frames: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let mut clock = SequenceClock::default();
    let audio_per_packet = output.audio_per_packet;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let sequence = clock.next(Instant::now(), audio_per_packet);
        let encoded = match output.encoder.lock().encode(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("opus encode failed: {e}");
                continue;
            }
        };
        if encoded.is_empty() {
            continue;
        }

        let packet = UdpData::Audio(AudioData {
            opus: encoded.into(),
            sequence,
            target: output.target(),
            positional: output.positional(),
        });
        voice.send_packet(&packet, false).await;

        if let Some(deadline) = clock.deadline(audio_per_packet) {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.into()) => {}
            }
        }
    }
    debug!("audio sender exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWENTY_MS: Duration = Duration::from_millis(20);

    #[test]
    fn continuous_frames_step_by_packet_duration() {
        let mut clock = SequenceClock::default();
        let start = Instant::now();
        let sequences: Vec<u64> = (0..100)
            .map(|i| clock.next(start + TWENTY_MS * i, TWENTY_MS))
            .collect();
        let expected: Vec<u64> = (0..100).map(|i| i as u64 * 2).collect();
        assert_eq!(sequences, expected);
    }

    #[test]
    fn a_long_gap_resets_to_zero() {
        let mut clock = SequenceClock::default();
        let start = Instant::now();
        assert_eq!(clock.next(start, TWENTY_MS), 0);
        assert_eq!(clock.next(start + TWENTY_MS, TWENTY_MS), 2);
        assert_eq!(clock.next(start + Duration::from_secs(6), TWENTY_MS), 0);
    }

    #[test]
    fn a_short_pause_fast_forwards_to_wall_clock() {
        let mut clock = SequenceClock::default();
        let start = Instant::now();
        clock.next(start, TWENTY_MS);
        clock.next(start + TWENTY_MS, TWENTY_MS);
        // 200 ms in: more than two packets late, well under the reset
        // interval.
        let seq = clock.next(start + Duration::from_millis(200), TWENTY_MS);
        assert_eq!(seq, 20);
        // The stream then continues from there.
        assert_eq!(clock.next(start + Duration::from_millis(220), TWENTY_MS), 22);
    }

    #[test]
    fn deadline_tracks_the_scheduled_frame() {
        let mut clock = SequenceClock::default();
        assert!(clock.deadline(TWENTY_MS).is_none());
        let start = Instant::now();
        clock.next(start, TWENTY_MS);
        assert_eq!(clock.deadline(TWENTY_MS), Some(start + TWENTY_MS));
    }
}
