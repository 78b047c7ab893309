use crate::media::frame::{MediaUnit, TrackKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub type UnitCallback = Box<dyn FnMut(MediaUnit) + Send>;
pub type KeyframeRequest = Arc<dyn Fn() + Send + Sync>;

/// Adapter around one inbound media track.
///
/// The transport side pushes decoded units with [`TrackSink::deliver`]; whoever
/// consumes the track installs a callback with [`TrackSink::bind`]. Units arriving
/// while nothing is bound, or after the track ended, are discarded.
pub struct TrackSink {
    kind: TrackKind,
    id: String,
    binding: Mutex<Option<UnitCallback>>,
    ended: CancellationToken,
    keyframe_request: Option<KeyframeRequest>,
    delivered: AtomicU64,
    discarded: AtomicU64,
}

impl TrackSink {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            binding: Mutex::new(None),
            ended: CancellationToken::new(),
            keyframe_request: None,
            delivered: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Installs a hook invoked whenever a consumer binds, used by video tracks to ask
    /// the sender for a fresh key frame.
    pub fn with_keyframe_request(mut self, request: KeyframeRequest) -> Self {
        self.keyframe_request = Some(request);
        self
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bind(&self, callback: UnitCallback) {
        if self.is_ended() {
            debug!(track_id = %self.id, kind = %self.kind, "Ignoring bind on ended track");
            return;
        }

        *self.lock_binding() = Some(callback);
        info!(track_id = %self.id, kind = %self.kind, "Track sink bound");

        if let Some(request) = &self.keyframe_request {
            request();
        }
    }

    pub fn unbind(&self) {
        if self.lock_binding().take().is_some() {
            info!(track_id = %self.id, kind = %self.kind, "Track sink unbound");
        }
    }

    pub fn is_bound(&self) -> bool {
        self.lock_binding().is_some()
    }

    /// Hands one decoded unit to the bound consumer. Returns whether it was consumed.
    pub fn deliver(&self, unit: MediaUnit) -> bool {
        if self.is_ended() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut binding = self.lock_binding();
        match binding.as_mut() {
            Some(callback) => {
                callback(unit);
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                trace!(track_id = %self.id, kind = %self.kind, "No consumer bound, discarding unit");
                self.discarded.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Marks the track ended. The binding is dropped so nothing reaches the encoder
    /// pipes past this point.
    pub fn end(&self) {
        if self.ended.is_cancelled() {
            return;
        }
        self.ended.cancel();
        self.lock_binding().take();
        info!(track_id = %self.id, kind = %self.kind, "Track ended");
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Resolves once the track has ended.
    pub async fn ended(&self) {
        self.ended.cancelled().await
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    fn lock_binding(&self) -> std::sync::MutexGuard<'_, Option<UnitCallback>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TrackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackSink")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("ended", &self.is_ended())
            .finish()
    }
}
