//! Audio framing for paced transmission
//!
//! Splits a complete PCM buffer into the frame sequence the service expects:
//!
//! ```text
//! FIRST (empty, carries parameters) ─▶ MIDDLE × ceil(N / C) ─▶ LAST (empty)
//! ```
//!
//! Each middle frame carries exactly one pacing interval of audio
//! (1280 bytes = 40ms of 16kHz 16-bit mono), except the last middle frame,
//! which carries the remainder.

/// Sequence number of the FIRST frame
pub const SEQUENCE_ORIGIN: u64 = 1;

/// Position of a frame within the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePosition {
    First,
    Middle,
    Last,
}

impl FramePosition {
    /// Wire status code for this position
    pub fn status(&self) -> u8 {
        match self {
            FramePosition::First => 0,
            FramePosition::Middle => 1,
            FramePosition::Last => 2,
        }
    }
}

/// One outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Monotonically increasing, starting at [`SEQUENCE_ORIGIN`]
    pub sequence: u64,
    pub position: FramePosition,
    /// Raw PCM bytes (empty for FIRST and LAST)
    pub payload: Vec<u8>,
}

impl AudioFrame {
    pub fn is_last(&self) -> bool {
        self.position == FramePosition::Last
    }
}

/// Single-pass iterator over the frames of one buffer
///
/// Not restartable: each frame is produced once, in order.
#[derive(Debug)]
pub struct AudioFramer {
    audio: Vec<u8>,
    chunk_size: usize,
    offset: usize,
    next_sequence: u64,
    first_sent: bool,
    finished: bool,
}

impl AudioFramer {
    /// Create a framer over `audio`.
    ///
    /// Returns `None` if `chunk_size` is zero.
    pub fn new(audio: Vec<u8>, chunk_size: usize) -> Option<Self> {
        if chunk_size == 0 {
            log::warn!("Framer: chunk size must be nonzero");
            return None;
        }

        log::debug!(
            "Framer: {} bytes in {} byte chunks ({} middle frames)",
            audio.len(),
            chunk_size,
            audio.len().div_ceil(chunk_size)
        );

        Some(Self {
            audio,
            chunk_size,
            offset: 0,
            next_sequence: SEQUENCE_ORIGIN,
            first_sent: false,
            finished: false,
        })
    }

    /// Number of frames not yet produced
    pub fn remaining(&self) -> usize {
        if self.finished {
            return 0;
        }
        let middles = (self.audio.len() - self.offset).div_ceil(self.chunk_size);
        middles + 1 + usize::from(!self.first_sent)
    }

    pub fn is_exhausted(&self) -> bool {
        self.finished
    }

    fn frame(&mut self, position: FramePosition, payload: Vec<u8>) -> AudioFrame {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        AudioFrame {
            sequence,
            position,
            payload,
        }
    }
}

impl Iterator for AudioFramer {
    type Item = AudioFrame;

    fn next(&mut self) -> Option<AudioFrame> {
        if self.finished {
            return None;
        }

        if !self.first_sent {
            self.first_sent = true;
            return Some(self.frame(FramePosition::First, Vec::new()));
        }

        if self.offset < self.audio.len() {
            let end = (self.offset + self.chunk_size).min(self.audio.len());
            let payload = self.audio[self.offset..end].to_vec();
            self.offset = end;
            return Some(self.frame(FramePosition::Middle, payload));
        }

        self.finished = true;
        Some(self.frame(FramePosition::Last, Vec::new()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(len: usize, chunk: usize) -> Vec<AudioFrame> {
        let audio: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        AudioFramer::new(audio, chunk).unwrap().collect()
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(AudioFramer::new(vec![1, 2, 3], 0).is_none());
    }

    #[test]
    fn test_empty_buffer_yields_first_and_last() {
        let frames = frames(0, 1280);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].position, FramePosition::First);
        assert_eq!(frames[1].position, FramePosition::Last);
        assert!(frames.iter().all(|f| f.payload.is_empty()));
    }

    #[test]
    fn test_frame_count_and_sizes() {
        for (len, chunk) in [(1, 1280), (1280, 1280), (1281, 1280), (5000, 1280), (12, 5)] {
            let frames = frames(len, chunk);
            let middles: Vec<&AudioFrame> = frames
                .iter()
                .filter(|f| f.position == FramePosition::Middle)
                .collect();

            assert_eq!(frames.len(), 2 + len.div_ceil(chunk), "len={} chunk={}", len, chunk);
            assert_eq!(middles.len(), len.div_ceil(chunk));
            for frame in &middles[..middles.len() - 1] {
                assert_eq!(frame.payload.len(), chunk);
            }
            let total: usize = middles.iter().map(|f| f.payload.len()).sum();
            assert_eq!(total, len);
        }
    }

    #[test]
    fn test_payload_preserves_audio_order() {
        let audio: Vec<u8> = (0..10).collect();
        let joined: Vec<u8> = AudioFramer::new(audio.clone(), 3)
            .unwrap()
            .flat_map(|f| f.payload)
            .collect();
        assert_eq!(joined, audio);
    }

    #[test]
    fn test_sequence_numbers_are_monotonic_from_origin() {
        let frames = frames(4000, 1280);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence, SEQUENCE_ORIGIN + i as u64);
        }
        assert!(frames.last().unwrap().is_last());
    }

    #[test]
    fn test_not_restartable() {
        let mut framer = AudioFramer::new(vec![0; 10], 4).unwrap();
        assert_eq!(framer.remaining(), 5);
        assert_eq!(framer.by_ref().count(), 5);
        assert!(framer.is_exhausted());
        assert_eq!(framer.remaining(), 0);
        assert!(framer.next().is_none());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(FramePosition::First.status(), 0);
        assert_eq!(FramePosition::Middle.status(), 1);
        assert_eq!(FramePosition::Last.status(), 2);
    }
}
