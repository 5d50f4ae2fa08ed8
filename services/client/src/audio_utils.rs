use base64::Engine;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// The audio devices behind a session. Capture feeds the session through
/// `SessionEvent::Microphone`; playback and teardown go through this trait.
pub trait AudioIo: Send + Sync {
    /// Queues one decoded frame of assistant speech for playback.
    fn play(&self, frame: Bytes);

    /// Halts capture and playback immediately, dropping anything queued.
    fn stop(&self);
}

/// Audio I/O for headless runs: frames are counted and logged, never played.
#[derive(Debug, Default)]
pub struct LoggingAudio {
    played_bytes: AtomicUsize,
}

impl LoggingAudio {
    pub fn played_bytes(&self) -> usize {
        self.played_bytes.load(Ordering::Relaxed)
    }
}

impl AudioIo for LoggingAudio {
    fn play(&self, frame: Bytes) {
        let total = self.played_bytes.fetch_add(frame.len(), Ordering::Relaxed) + frame.len();
        debug!(frame_bytes = frame.len(), total_bytes = total, "Received assistant audio");
    }

    fn stop(&self) {
        debug!(
            total_bytes = self.played_bytes(),
            "Audio stopped"
        );
    }
}

/// Encodes an opaque audio frame for transport.
pub fn encode_frame(frame: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(frame)
}

/// Decodes a transported audio frame.
pub fn decode_frame(base64_fragment: &str) -> Result<Bytes, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD
        .decode(base64_fragment)
        .map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encoding() {
        let frame = [0x4f_u8, 0x67, 0x67, 0x53, 0x00, 0x02];
        let encoded = encode_frame(&frame);
        assert_eq!(encoded, "T2dnUwAC");
        assert_eq!(decode_frame(&encoded).unwrap(), Bytes::copy_from_slice(&frame));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_frame("not base64!").is_err());
    }

    #[test]
    fn test_logging_audio_counts_bytes() {
        let audio = LoggingAudio::default();
        audio.play(Bytes::from_static(b"abcd"));
        audio.play(Bytes::from_static(b"ef"));
        audio.stop();
        assert_eq!(audio.played_bytes(), 6);
    }
}
