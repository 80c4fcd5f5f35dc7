//! Multi-speaker capture and mixing engine
//!
//! Per-speaker decode pipelines feed FIFO chunk queues; a fixed-period
//! mixer drains them into one raw PCM stream.

pub mod channel;
pub mod decode;
pub mod mixer;
pub mod sink;

pub use channel::ChannelRegistry;
pub use decode::{Decoder, DecoderFactory, OpusDecoderFactory};
pub use sink::{FileSink, OutputSink};

/// One decoded buffer of interleaved 16-bit stereo samples at 48kHz.
///
/// Length varies per codec frame and is not aligned to the mix tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    samples: Vec<i16>,
}

impl PcmChunk {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_chunk() {
        let chunk = PcmChunk::new(vec![1, -2, 3]);
        assert_eq!(chunk.len(), 3);
        assert!(!chunk.is_empty());
        assert_eq!(chunk.samples(), &[1, -2, 3]);
    }
}
