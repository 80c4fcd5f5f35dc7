//! Speaker channel registry
//!
//! Owns the set of currently-mixable speakers for one session: their
//! decode pipelines, FIFO chunk queues, and subscription lifecycles.

use crate::audio::decode::{self, DecoderFactory};
use crate::audio::PcmChunk;
use crate::config::AudioConfig;
use crate::transport::SpeakerId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Compressed frames buffered ahead of each decode pipeline
const FRAME_QUEUE_DEPTH: usize = 256;

/// One speaker's subscription, decoder and queue
struct SpeakerChannel {
    speaker: SpeakerId,
    queue: Arc<Mutex<VecDeque<PcmChunk>>>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    decode_task: JoinHandle<()>,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    last_activity: Instant,
    /// Set when the subscription has ended; the channel survives until
    /// the grace period elapses so the mixer can drain its queue
    pending_since: Option<Instant>,
}

impl SpeakerChannel {
    /// Record activity and revive a pending-removal channel
    fn touch(&self) {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        if state.pending_since.take().is_some() {
            debug!("Speaker {} resumed during grace period", self.speaker);
        }
    }
}

/// Per-session registry of speaker channels
pub struct ChannelRegistry {
    channels: DashMap<SpeakerId, Arc<SpeakerChannel>>,
    decoders: Arc<dyn DecoderFactory>,
    silence_timeout: Duration,
    grace_period: Duration,
    max_queued_chunks: usize,
}

impl ChannelRegistry {
    pub fn new(decoders: Arc<dyn DecoderFactory>, audio: &AudioConfig) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            decoders,
            silence_timeout: audio.silence_timeout,
            grace_period: audio.grace_period,
            max_queued_chunks: audio.max_queued_chunks,
        })
    }

    /// Open a subscription for a speaker. Idempotent: an existing channel
    /// is kept (and revived if it was pending removal, preserving any
    /// undrained chunks).
    pub fn subscribe(self: &Arc<Self>, speaker: SpeakerId) {
        if let Some(channel) = self.channels.get(&speaker) {
            channel.touch();
            return;
        }

        let decoder = match self.decoders.create() {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create decoder for speaker {}: {}", speaker, e);
                return;
            }
        };

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let decode_task = decode::spawn_pipeline(
            speaker,
            decoder,
            frame_rx,
            queue.clone(),
            self.max_queued_chunks,
            Arc::downgrade(self),
        );

        self.channels.insert(
            speaker,
            Arc::new(SpeakerChannel {
                speaker,
                queue,
                frame_tx,
                decode_task,
                state: Mutex::new(ChannelState {
                    last_activity: Instant::now(),
                    pending_since: None,
                }),
            }),
        );
        info!("Subscribed speaker {}", speaker);
    }

    /// Route one compressed frame to a speaker's pipeline, subscribing on
    /// first contact
    pub fn push_frame(self: &Arc<Self>, speaker: SpeakerId, frame: Vec<u8>) {
        self.subscribe(speaker);
        if let Some(channel) = self.channels.get(&speaker) {
            channel.touch();
            if channel.frame_tx.try_send(frame).is_err() {
                warn!("Frame queue full for speaker {}, dropping frame", speaker);
            }
        }
    }

    /// Mark a speaker's subscription as ended; removal happens after the
    /// grace period once the mixer has drained the queue
    pub fn end_subscription(&self, speaker: SpeakerId) {
        if let Some(channel) = self.channels.get(&speaker) {
            let mut state = channel.state.lock();
            if state.pending_since.is_none() {
                state.pending_since = Some(Instant::now());
                debug!("Subscription ended for speaker {}", speaker);
            }
        }
    }

    /// Tear down the channel of a speaker whose decode pipeline failed
    pub(crate) fn remove_failed(&self, speaker: SpeakerId) {
        if self.channels.remove(&speaker).is_some() {
            warn!("Removed speaker {} after decode failure", speaker);
        }
    }

    /// Advance subscription lifecycles. Called once per mix tick, which
    /// keeps grace-period removals from firing after the mixer stops.
    pub fn sweep(&self, now: Instant) {
        let mut expired = Vec::new();
        for entry in self.channels.iter() {
            let channel = entry.value();
            let mut state = channel.state.lock();
            match state.pending_since {
                None => {
                    if now.duration_since(state.last_activity) >= self.silence_timeout {
                        state.pending_since = Some(now);
                        debug!(
                            "Speaker {} silent for {:?}, grace period started",
                            channel.speaker, self.silence_timeout
                        );
                    }
                }
                Some(since) => {
                    if now.duration_since(since) >= self.grace_period {
                        expired.push(channel.speaker);
                    }
                }
            }
        }
        for speaker in expired {
            if let Some((_, channel)) = self.channels.remove(&speaker) {
                channel.decode_task.abort();
                info!("Removed speaker {} after grace period", speaker);
            }
        }
    }

    /// Pop exactly one chunk from each non-empty queue, oldest first.
    /// Speakers with empty queues are skipped, not silence-padded.
    pub fn collect_chunks(&self) -> Vec<PcmChunk> {
        let mut chunks = Vec::new();
        for entry in self.channels.iter() {
            if let Some(chunk) = entry.value().queue.lock().pop_front() {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Immediate teardown of every channel, grace periods notwithstanding.
    /// Used on session stop.
    pub fn unsubscribe_all(&self) {
        for entry in self.channels.iter() {
            entry.value().decode_task.abort();
        }
        self.channels.clear();
    }

    pub fn speaker_count(&self) -> usize {
        self.channels.len()
    }

    #[cfg(test)]
    fn queued_chunks(&self, speaker: SpeakerId) -> usize {
        self.channels
            .get(&speaker)
            .map(|c| c.queue.lock().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testutil::{frame_of, wait_until, PassthroughFactory};

    fn test_audio() -> AudioConfig {
        AudioConfig {
            silence_timeout: Duration::from_millis(100),
            grace_period: Duration::from_millis(100),
            max_queued_chunks: 8,
            ..AudioConfig::default()
        }
    }

    fn registry() -> Arc<ChannelRegistry> {
        ChannelRegistry::new(Arc::new(PassthroughFactory), &test_audio())
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let registry = registry();
        let speaker = SpeakerId(1);
        registry.subscribe(speaker);
        registry.subscribe(speaker);
        assert_eq!(registry.speaker_count(), 1);
    }

    #[tokio::test]
    async fn test_fifo_drain_order() {
        let registry = registry();
        let speaker = SpeakerId(1);
        for s in [1i16, 2, 3] {
            registry.push_frame(speaker, frame_of(&[s]));
        }
        wait_until(|| registry.queued_chunks(speaker) == 3).await;

        for expected in [1i16, 2, 3] {
            let chunks = registry.collect_chunks();
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].samples(), &[expected]);
        }
        assert!(registry.collect_chunks().is_empty());
    }

    #[tokio::test]
    async fn test_grace_period_drain() {
        let registry = registry();
        let speaker = SpeakerId(5);
        registry.push_frame(speaker, frame_of(&[11]));
        registry.push_frame(speaker, frame_of(&[22]));
        wait_until(|| registry.queued_chunks(speaker) == 2).await;

        // Silence elapses: subscription ends, channel enters grace
        let t0 = Instant::now() + Duration::from_millis(150);
        registry.sweep(t0);
        assert_eq!(registry.speaker_count(), 1);

        // Both undrained chunks are still mixable during grace
        assert_eq!(registry.collect_chunks()[0].samples(), &[11]);
        registry.sweep(t0 + Duration::from_millis(50));
        assert_eq!(registry.speaker_count(), 1);
        assert_eq!(registry.collect_chunks()[0].samples(), &[22]);

        // Grace elapses: channel removed
        registry.sweep(t0 + Duration::from_millis(150));
        assert_eq!(registry.speaker_count(), 0);
    }

    #[tokio::test]
    async fn test_new_frame_revives_pending_channel() {
        let registry = registry();
        let speaker = SpeakerId(6);
        registry.push_frame(speaker, frame_of(&[1]));
        wait_until(|| registry.queued_chunks(speaker) == 1).await;

        registry.end_subscription(speaker);
        registry.push_frame(speaker, frame_of(&[2]));
        wait_until(|| registry.queued_chunks(speaker) == 2).await;

        // Revived: a sweep past the old grace deadline keeps the channel
        registry.sweep(Instant::now() + Duration::from_millis(50));
        assert_eq!(registry.speaker_count(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_removes_only_that_speaker() {
        use crate::audio::decode::{DecodeError, Decoder, DecoderFactory};
        use crate::audio::testutil::{FailingDecoder, PassthroughDecoder};
        use std::sync::atomic::{AtomicUsize, Ordering};

        // First channel decodes fine, second channel always fails
        #[derive(Default)]
        struct MixedFactory {
            created: AtomicUsize,
        }
        impl DecoderFactory for MixedFactory {
            fn create(&self) -> Result<Box<dyn Decoder>, DecodeError> {
                if self.created.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Box::new(PassthroughDecoder))
                } else {
                    Ok(Box::new(FailingDecoder))
                }
            }
        }

        let registry = ChannelRegistry::new(Arc::new(MixedFactory::default()), &test_audio());
        let healthy = SpeakerId(1);
        let broken = SpeakerId(2);

        registry.push_frame(healthy, frame_of(&[5]));
        wait_until(|| registry.queued_chunks(healthy) == 1).await;

        registry.push_frame(broken, frame_of(&[9]));
        wait_until(|| registry.speaker_count() == 1).await;

        // Healthy speaker unaffected, its chunk still mixable
        assert_eq!(registry.collect_chunks()[0].samples(), &[5]);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_clears_everything() {
        let registry = registry();
        registry.push_frame(SpeakerId(1), frame_of(&[1]));
        registry.push_frame(SpeakerId(2), frame_of(&[2]));
        wait_until(|| registry.speaker_count() == 2).await;

        registry.unsubscribe_all();
        assert_eq!(registry.speaker_count(), 0);
        assert!(registry.collect_chunks().is_empty());
    }
}
