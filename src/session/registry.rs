use crate::encoder::{EncoderHandle, redact_key};
use crate::media::buffer::BufferStatus;
use crate::media::frame::TrackKind;
use crate::media::sink::TrackSink;
use crate::session::peer::{PeerState, SessionEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use webrtc::peer_connection::RTCPeerConnection;

/// Everything the relay knows about one peer session.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    /// Distinguishes successive registrations under the same id.
    pub epoch: u64,
    pub peer: Option<Arc<RTCPeerConnection>>,
    pub events: Option<async_channel::Sender<SessionEvent>>,
    pub peer_state: PeerState,
    pub stream_ready: bool,
    pub video_track: Option<Arc<TrackSink>>,
    pub audio_track: Option<Arc<TrackSink>>,
    pub encoder: Option<EncoderHandle>,
    pub stream_key: Option<String>,
    pub platform: Option<String>,
    pub is_streaming: bool,
    pub created_at: SystemTime,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            epoch: 0,
            peer: None,
            events: None,
            peer_state: PeerState::Negotiating,
            stream_ready: false,
            video_track: None,
            audio_track: None,
            encoder: None,
            stream_key: None,
            platform: None,
            is_streaming: false,
            created_at: SystemTime::now(),
        }
    }

    pub fn track_slot(&mut self, kind: TrackKind) -> &mut Option<Arc<TrackSink>> {
        match kind {
            TrackKind::Video => &mut self.video_track,
            TrackKind::Audio => &mut self.audio_track,
        }
    }

    pub fn has_both_tracks(&self) -> bool {
        self.video_track.is_some() && self.audio_track.is_some()
    }

    /// Drops the output target and encoder once the encoder is gone.
    pub fn clear_streaming(&mut self) {
        self.encoder = None;
        self.stream_key = None;
        self.platform = None;
        self.is_streaming = false;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            peer_state: self.peer_state,
            stream_ready: self.stream_ready,
            has_video: self.video_track.is_some(),
            has_audio: self.audio_track.is_some(),
            is_streaming: self.is_streaming,
            stopping: self.encoder.as_ref().is_some_and(EncoderHandle::is_stopping),
            platform: self.platform.clone(),
            stream_key: self.stream_key.as_deref().map(redact_key),
            encoder_pid: self.encoder.as_ref().and_then(EncoderHandle::pid),
            buffer: self.encoder.as_ref().map(EncoderHandle::buffer_status),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .field("peer_state", &self.peer_state)
            .field("stream_ready", &self.stream_ready)
            .field("video_track", &self.video_track)
            .field("audio_track", &self.audio_track)
            .field("encoder", &self.encoder)
            .field("is_streaming", &self.is_streaming)
            .finish()
    }
}

/// Read-only view of a session for the debug endpoints.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub peer_state: PeerState,
    pub stream_ready: bool,
    pub has_video: bool,
    pub has_audio: bool,
    pub is_streaming: bool,
    pub stopping: bool,
    pub platform: Option<String>,
    pub stream_key: Option<String>,
    pub encoder_pid: Option<u32>,
    pub buffer: Option<BufferStatus>,
}

/// Process wide map of session id to session state.
///
/// Every access is a short critical section; nothing awaits while holding the lock.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fresh session, returning the one it replaced.
    pub fn create(&self, id: &str) -> Option<Session> {
        self.insert(Session::new(id))
    }

    pub fn insert(&self, session: Session) -> Option<Session> {
        self.lock().insert(session.id.clone(), session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Runs `f` against the session under the registry lock.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.lock().get_mut(id).map(f)
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.lock().remove(id)
    }

    /// Removes the session only if it still belongs to the given registration.
    pub fn remove_epoch(&self, id: &str, epoch: u64) -> Option<Session> {
        let mut sessions = self.lock();
        match sessions.get(id) {
            Some(session) if session.epoch == epoch => sessions.remove(id),
            _ => None,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.lock().keys().cloned().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the registry and hands back what it held.
    pub fn clear(&self) -> Vec<Session> {
        self.lock().drain().map(|(_, session)| session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_update_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.create("S1").is_none());
        assert!(registry.get("S1").is_some());

        let ready = registry.update("S1", |session| {
            session.stream_ready = true;
            session.stream_ready
        });
        assert_eq!(ready, Some(true));
        assert!(registry.get("S1").unwrap().stream_ready);

        assert_eq!(registry.update("missing", |_| ()), None);

        assert!(registry.remove("S1").is_some());
        assert!(registry.remove("S1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_replaces_existing() {
        let registry = SessionRegistry::new();
        registry.create("S1");
        registry.update("S1", |session| session.stream_ready = true);

        let replaced = registry.create("S1").unwrap();
        assert!(replaced.stream_ready);
        assert!(!registry.get("S1").unwrap().stream_ready);
    }

    #[test]
    fn test_remove_epoch_keeps_newer_registration() {
        let registry = SessionRegistry::new();
        let mut session = Session::new("S1");
        session.epoch = 2;
        registry.insert(session);

        assert!(registry.remove_epoch("S1", 1).is_none());
        assert!(registry.contains("S1"));
        assert!(registry.remove_epoch("S1", 2).is_some());
    }

    #[test]
    fn test_ids_and_clear() {
        let registry = SessionRegistry::new();
        for id in ["b", "a", "c"] {
            registry.create(id);
        }
        assert_eq!(registry.ids(), vec!["a", "b", "c"]);

        let cleared = registry.clear();
        assert_eq!(cleared.len(), 3);
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn test_snapshot_redacts_stream_key() {
        let mut session = Session::new("S1");
        session.stream_key = Some("abcd-efgh-ijkl".into());
        session.platform = Some("youtube".into());
        session.video_track = Some(Arc::new(TrackSink::new(TrackKind::Video, "v")));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.stream_key.as_deref(), Some("abcd****"));
        assert!(snapshot.has_video);
        assert!(!snapshot.has_audio);
        assert!(snapshot.buffer.is_none());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["sessionId"], "S1");
        assert_eq!(json["peerState"], "negotiating");
    }
}
