use thiserror::Error;

/// Relay errors surfaced by the session, media and encoder layers
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("WebRTC stream is not ready for session {0}")]
    StreamNotReady(String),

    #[error("Session {0} is already streaming")]
    AlreadyStreaming(String),

    #[error("Session {0} is not streaming")]
    NotStreaming(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Failed to spawn encoder: {0}")]
    EncoderSpawnFailed(#[source] std::io::Error),

    #[error("Failed to write {pipe} pipe (closed: {closed}): {source}")]
    PipeWriteFailed {
        pipe: &'static str,
        closed: bool,
        #[source]
        source: std::io::Error,
    },

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

impl RelayError {
    /// Classify an I/O error raised while writing one of the encoder pipes.
    pub fn pipe_write(pipe: &'static str, source: std::io::Error) -> Self {
        let closed = matches!(
            source.kind(),
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
        );
        RelayError::PipeWriteFailed {
            pipe,
            closed,
            source,
        }
    }

    /// A write into a pipe whose reader already went away, the expected case right
    /// after the encoder exits.
    pub fn is_closed_pipe(&self) -> bool {
        matches!(self, RelayError::PipeWriteFailed { closed: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_pipe_write_classifies_broken_pipe_as_closed() {
        let error = RelayError::pipe_write("video", IoError::from(ErrorKind::BrokenPipe));
        assert!(error.is_closed_pipe());

        let error = RelayError::pipe_write("audio", IoError::other("disk on fire"));
        assert!(!error.is_closed_pipe());
        assert!(error.to_string().contains("audio"));
    }

    #[test]
    fn test_state_errors_name_the_session() {
        let error = RelayError::StreamNotReady("S2".into());
        assert_eq!(error.to_string(), "WebRTC stream is not ready for session S2");

        let error = RelayError::AlreadyStreaming("S1".into());
        assert!(error.to_string().contains("S1"));
    }
}
