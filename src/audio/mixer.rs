//! Fixed-cadence mixer
//!
//! Every tick drains one PCM chunk per active speaker and averages the
//! overlapping samples into a single output frame.

use crate::audio::channel::ChannelRegistry;
use crate::audio::sink::OutputSink;
use crate::audio::PcmChunk;
use crate::session::SessionError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Combine chunks into one frame the length of the longest contributor.
///
/// Each 16-bit position averages the samples of every chunk long enough to
/// contain it; shorter chunks simply stop contributing rather than padding
/// with zeros, which would bias the average toward silence. Averaging by
/// contributor count keeps a lone speaker at full volume.
pub fn mix_chunks(chunks: &[PcmChunk]) -> Vec<i16> {
    let max_len = chunks.iter().map(PcmChunk::len).max().unwrap_or(0);
    let mut mixed = vec![0i16; max_len];

    for (i, out) in mixed.iter_mut().enumerate() {
        let mut sum: i64 = 0;
        let mut count: i64 = 0;
        for chunk in chunks {
            if let Some(&sample) = chunk.samples().get(i) {
                sum += i64::from(sample);
                count += 1;
            }
        }
        if count > 0 {
            let averaged = round_div(sum, count).clamp(-32768, 32767);
            *out = averaged as i16;
        }
    }
    mixed
}

/// Integer division rounding half away from zero
fn round_div(sum: i64, count: i64) -> i64 {
    if sum >= 0 {
        (2 * sum + count) / (2 * count)
    } else {
        (2 * sum - count) / (2 * count)
    }
}

/// Serialize samples as interleaved 16-bit little-endian PCM
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Run the mix loop for the lifetime of an active session.
///
/// A tick with no queued chunks writes nothing. A sink write failure is
/// fatal: it is reported to the session controller and the loop ends.
pub fn spawn_mixer(
    registry: Arc<ChannelRegistry>,
    sink: Arc<dyn OutputSink>,
    error_tx: mpsc::Sender<SessionError>,
    tick: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut frames_written: u64 = 0;

        loop {
            interval.tick().await;
            registry.sweep(Instant::now());

            let chunks = registry.collect_chunks();
            if chunks.is_empty() {
                continue;
            }

            let mixed = mix_chunks(&chunks);
            if let Err(e) = sink.write(&samples_to_le_bytes(&mixed)) {
                error!("Sink write failed, ending mix loop: {}", e);
                let _ = error_tx.send(SessionError::Sink(e)).await;
                return;
            }

            frames_written += 1;
            if frames_written % 500 == 0 {
                debug!(
                    "Mixed {} frames ({} speakers this tick)",
                    frames_written,
                    chunks.len()
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(samples: &[i16]) -> PcmChunk {
        PcmChunk::new(samples.to_vec())
    }

    #[test]
    fn test_single_speaker_passes_through_unchanged() {
        let mixed = mix_chunks(&[chunk(&[1000, -2000, 32767, -32768])]);
        assert_eq!(mixed, vec![1000, -2000, 32767, -32768]);
    }

    #[test]
    fn test_averaging_by_contributor_count() {
        let mixed = mix_chunks(&[chunk(&[1000]), chunk(&[2000]), chunk(&[3000])]);
        assert_eq!(mixed, vec![2000]);
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        assert_eq!(mix_chunks(&[chunk(&[2]), chunk(&[3])]), vec![3]);
        assert_eq!(mix_chunks(&[chunk(&[-2]), chunk(&[-3])]), vec![-3]);
        assert_eq!(mix_chunks(&[chunk(&[1]), chunk(&[2])]), vec![2]);
    }

    #[test]
    fn test_result_clamped_to_i16_range() {
        let mixed = mix_chunks(&[chunk(&[32767, -32768]), chunk(&[32767, -32768])]);
        assert_eq!(mixed, vec![32767, -32768]);
    }

    #[test]
    fn test_short_chunk_stops_contributing_not_zero_padded() {
        // Position 1 only exists in the longer chunk; it must come through
        // at full volume, not averaged against an implicit zero.
        let mixed = mix_chunks(&[chunk(&[1000, 4000]), chunk(&[3000])]);
        assert_eq!(mixed, vec![2000, 4000]);
    }

    #[test]
    fn test_no_chunks_yields_empty_frame() {
        assert!(mix_chunks(&[]).is_empty());
    }

    #[test]
    fn test_le_serialization() {
        assert_eq!(samples_to_le_bytes(&[0x0102, -1]), vec![0x02, 0x01, 0xFF, 0xFF]);
    }
}
