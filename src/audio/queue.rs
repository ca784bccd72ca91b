//! Per-speaker reassembly: each user's frames are decoded off-thread and
//! stamped with a playback time reconstructed from the wire sequence.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::audio::decoder::DecoderPool;
use crate::audio::{AudioType, SAMPLE_RATE, SEQUENCE_DURATION};
use crate::error::Error;

/// One decoded chunk of a speaker's audio, delivered via
/// `on_sound_received`.
#[derive(Debug, Clone)]
pub struct SoundChunk {
    /// Interleaved stereo PCM at the server rate.
    pub pcm: Vec<i16>,
    pub sequence: u64,
    /// Reconstructed playback time of this chunk within its burst.
    pub time: SystemTime,
    pub duration: Duration,
    pub codec: AudioType,
    pub target: u8,
    /// When the chunk finished decoding.
    pub timestamp: SystemTime,
}

#[derive(Debug, Default)]
struct Timing {
    start_sequence: Option<u64>,
    start_time: Option<SystemTime>,
}

/// `calculated_time = start_time + (sequence - start_sequence) x 10 ms`,
/// with the anchor resetting whenever a sequence at or before the stored
/// start arrives (a new burst).
fn chunk_time(timing: &mut Timing, sequence: u64, now: SystemTime) -> SystemTime {
    match (timing.start_sequence, timing.start_time) {
        (Some(start_sequence), Some(start_time)) if sequence > start_sequence => {
            start_time + SEQUENCE_DURATION * (sequence - start_sequence) as u32
        }
        _ => {
            timing.start_sequence = Some(sequence);
            timing.start_time = Some(now);
            now
        }
    }
}

/// One user's receive queue.
pub struct SoundQueue {
    pool: Arc<DecoderPool>,
    timing: Arc<Mutex<Timing>>,
    deliver: Arc<dyn Fn(SoundChunk) + Send + Sync>,
}

impl SoundQueue {
    pub fn new(
        pool: Arc<DecoderPool>,
        deliver: impl Fn(SoundChunk) + Send + Sync + 'static,
    ) -> SoundQueue {
        SoundQueue {
            pool,
            timing: Arc::new(Mutex::new(Timing::default())),
            deliver: Arc::new(deliver),
        }
    }

    /// Queue one inbound frame for decode. Only Opus is decodable; other
    /// codecs are reported as unsupported and dropped.
    pub fn add(
        &self,
        data: Bytes,
        sequence: u64,
        codec: AudioType,
        target: u8,
    ) -> Result<(), Error> {
        if codec != AudioType::Opus {
            return Err(Error::CodecNotSupported(codec as u8));
        }

        let timing = self.timing.clone();
        let deliver = self.deliver.clone();
        self.pool.submit(data, move |pcm| {
            let now = SystemTime::now();
            let time = chunk_time(&mut timing.lock(), sequence, now);
            let samples_per_channel = pcm.len() / 2;
            let chunk = SoundChunk {
                duration: Duration::from_secs_f64(
                    samples_per_channel as f64 / f64::from(SAMPLE_RATE),
                ),
                pcm,
                sequence,
                time,
                codec,
                target,
                timestamp: now,
            };
            deliver(chunk);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_are_anchored_to_the_burst_start() {
        let mut timing = Timing::default();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);

        assert_eq!(chunk_time(&mut timing, 4, t0), t0);
        // Later sequences are offset from the anchor, not from `now`.
        let later = t0 + Duration::from_millis(35);
        assert_eq!(
            chunk_time(&mut timing, 6, later),
            t0 + Duration::from_millis(20)
        );
        assert_eq!(
            chunk_time(&mut timing, 10, later),
            t0 + Duration::from_millis(60)
        );
    }

    #[test]
    fn a_sequence_at_or_before_the_start_re_anchors() {
        let mut timing = Timing::default();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        chunk_time(&mut timing, 8, t0);

        let t1 = t0 + Duration::from_secs(7);
        assert_eq!(chunk_time(&mut timing, 0, t1), t1);
        assert_eq!(
            chunk_time(&mut timing, 2, t1),
            t1 + Duration::from_millis(20)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_opus_frames_are_rejected() {
        let pool = DecoderPool::new(1);
        let queue = SoundQueue::new(pool, |_| {});
        let err = queue
            .add(Bytes::from_static(b"x"), 0, AudioType::Speex, 0)
            .unwrap_err();
        assert!(matches!(err, Error::CodecNotSupported(2)));
    }
}
