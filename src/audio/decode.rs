//! Per-speaker decode pipeline
//!
//! Converts compressed voice frames into fixed-format PCM chunks. Each
//! speaker gets an isolated pipeline task; a decode failure tears down
//! only that speaker's channel.

use crate::audio::channel::ChannelRegistry;
use crate::audio::PcmChunk;
use crate::transport::SpeakerId;
use audiopus::coder::Decoder as AudiopusDecoder;
use audiopus::{Channels, SampleRate};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Worst-case decoded frame: 120ms at 48kHz stereo
const MAX_FRAME_SAMPLES: usize = 5760 * 2;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Opus decode failed: {0}")]
    Opus(#[from] audiopus::Error),
    #[error("Empty compressed frame")]
    EmptyFrame,
}

/// Stateful transform from compressed frames to PCM chunks
pub trait Decoder: Send {
    fn feed(&mut self, frame: &[u8]) -> Result<PcmChunk, DecodeError>;
}

/// Creates one decoder per speaker channel
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Decoder>, DecodeError>;
}

/// Opus decoder configured for Discord voice (48kHz stereo)
pub struct OpusDecoder {
    inner: AudiopusDecoder,
    buf: Vec<i16>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, DecodeError> {
        Ok(Self {
            inner: AudiopusDecoder::new(SampleRate::Hz48000, Channels::Stereo)?,
            buf: vec![0i16; MAX_FRAME_SAMPLES],
        })
    }
}

impl Decoder for OpusDecoder {
    fn feed(&mut self, frame: &[u8]) -> Result<PcmChunk, DecodeError> {
        if frame.is_empty() {
            return Err(DecodeError::EmptyFrame);
        }
        let samples_per_channel = self.inner.decode(Some(frame), &mut self.buf, false)?;
        let total = samples_per_channel * 2;
        Ok(PcmChunk::new(self.buf[..total].to_vec()))
    }
}

pub struct OpusDecoderFactory;

impl DecoderFactory for OpusDecoderFactory {
    fn create(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        Ok(Box::new(OpusDecoder::new()?))
    }
}

/// Run one speaker's pipeline: pull compressed frames, decode, push PCM
/// chunks onto the speaker's FIFO queue.
///
/// A decode error ends the task and removes the speaker's channel from
/// the registry; nothing propagates to the mixer or other speakers.
pub(crate) fn spawn_pipeline(
    speaker: SpeakerId,
    mut decoder: Box<dyn Decoder>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    queue: Arc<Mutex<VecDeque<PcmChunk>>>,
    max_queued: usize,
    registry: Weak<ChannelRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if frame.is_empty() {
                continue;
            }
            match decoder.feed(&frame) {
                Ok(chunk) => {
                    let mut queue = queue.lock();
                    if queue.len() >= max_queued {
                        warn!("Speaker {} chunk queue full, dropping oldest", speaker);
                        queue.pop_front();
                    }
                    queue.push_back(chunk);
                }
                Err(e) => {
                    error!("Decode failed for speaker {}: {}", speaker, e);
                    if let Some(registry) = registry.upgrade() {
                        registry.remove_failed(speaker);
                    }
                    return;
                }
            }
        }
        debug!("Decode pipeline for speaker {} ended", speaker);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testutil::{frame_of, wait_until, PassthroughDecoder};

    #[tokio::test]
    async fn test_pipeline_pushes_decoded_chunks_in_order() {
        let (tx, rx) = mpsc::channel(16);
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let _task = spawn_pipeline(
            SpeakerId(1),
            Box::new(PassthroughDecoder),
            rx,
            queue.clone(),
            8,
            Weak::new(),
        );

        tx.send(frame_of(&[10, 20])).await.unwrap();
        tx.send(frame_of(&[30])).await.unwrap();
        wait_until(|| queue.lock().len() == 2).await;

        let mut queue = queue.lock();
        assert_eq!(queue.pop_front().unwrap().samples(), &[10, 20]);
        assert_eq!(queue.pop_front().unwrap().samples(), &[30]);
    }

    #[tokio::test]
    async fn test_pipeline_drops_oldest_when_full() {
        let (tx, rx) = mpsc::channel(16);
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let _task = spawn_pipeline(
            SpeakerId(2),
            Box::new(PassthroughDecoder),
            rx,
            queue.clone(),
            2,
            Weak::new(),
        );

        for s in [1i16, 2, 3] {
            tx.send(frame_of(&[s])).await.unwrap();
        }
        wait_until(|| {
            let q = queue.lock();
            q.len() == 2 && q.front().map(|c| c.samples()[0]) == Some(2)
        })
        .await;
    }

    #[tokio::test]
    async fn test_pipeline_skips_empty_frames() {
        let (tx, rx) = mpsc::channel(16);
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let _task = spawn_pipeline(
            SpeakerId(3),
            Box::new(PassthroughDecoder),
            rx,
            queue.clone(),
            8,
            Weak::new(),
        );

        tx.send(Vec::new()).await.unwrap();
        tx.send(frame_of(&[7])).await.unwrap();
        wait_until(|| queue.lock().len() == 1).await;
        assert_eq!(queue.lock().front().unwrap().samples(), &[7]);
    }
}
