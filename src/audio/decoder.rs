//! The decode worker pool. Each worker owns one Opus decoder, initialized
//! once; jobs carry their completion as a closure so callers never wait on
//! the pool.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use opus::Channels;
use tokio::sync::mpsc;

use crate::audio::SAMPLE_RATE;

/// 120 ms at 48 kHz: the longest frame Opus can produce, per channel.
const MAX_SAMPLES_PER_CHANNEL: usize = 5760;
const DECODE_CHANNELS: usize = 2;

struct DecodeJob {
    data: Bytes,
    complete: Box<dyn FnOnce(Vec<i16>) + Send>,
}

pub struct DecoderPool {
    jobs: mpsc::UnboundedSender<DecodeJob>,
}

impl DecoderPool {
    pub fn new(workers: usize) -> Arc<DecoderPool> {
        let (jobs, rx) = mpsc::unbounded_channel::<DecodeJob>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                // Decode is always stereo; mono sources come out duplicated.
                let mut decoder = match opus::Decoder::new(SAMPLE_RATE, Channels::Stereo) {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        warn!("failed to initialize opus decoder: {e}");
                        return;
                    }
                };
                let mut pcm = vec![0i16; MAX_SAMPLES_PER_CHANNEL * DECODE_CHANNELS];

                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };
                    match decoder.decode(&job.data, &mut pcm, false) {
                        Ok(samples_per_channel) => {
                            let decoded = pcm[..samples_per_channel * DECODE_CHANNELS].to_vec();
                            (job.complete)(decoded);
                        }
                        Err(e) => debug!("dropping undecodable frame: {e}"),
                    }
                }
            });
        }

        Arc::new(DecoderPool { jobs })
    }

    /// Queue one Opus frame; `complete` runs on a worker with interleaved
    /// stereo PCM.
    pub fn submit(&self, data: Bytes, complete: impl FnOnce(Vec<i16>) + Send + 'static) {
        let job = DecodeJob {
            data,
            complete: Box::new(complete),
        };
        if self.jobs.send(job).is_err() {
            warn!("decoder pool is gone, dropping frame");
        }
    }
}
