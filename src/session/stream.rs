use crate::config::{Config, DEFAULT_PLATFORM};
use crate::encoder::{
    EncoderExit, EncoderSupervisor, ExitCallback, StopOutcome, destination_url, redact_key,
};
use crate::error::RelayError;
use crate::session::registry::SessionRegistry;
use std::sync::Arc;
use tracing::{info, warn};

/// Starts and stops the encoder pipeline of ready sessions.
#[derive(Clone)]
pub struct StreamController {
    registry: SessionRegistry,
    supervisor: EncoderSupervisor,
    config: Arc<Config>,
}

impl StreamController {
    pub fn new(registry: SessionRegistry, supervisor: EncoderSupervisor, config: Arc<Config>) -> Self {
        Self {
            registry,
            supervisor,
            config,
        }
    }

    /// Spawns the encoder for `session_id` and binds both tracks into it.
    ///
    /// Returns the platform the stream goes to. The session is reserved under the
    /// registry lock before the spawn, so two concurrent starts cannot both succeed; the
    /// process itself is launched outside the lock.
    pub fn start_streaming(
        &self,
        session_id: &str,
        stream_key: &str,
        platform: Option<&str>,
    ) -> Result<String, RelayError> {
        let platform = platform
            .map(str::trim)
            .filter(|platform| !platform.is_empty())
            .unwrap_or(DEFAULT_PLATFORM)
            .to_lowercase();

        let (epoch, video, audio, destination) = self
            .registry
            .update(session_id, |session| {
                let (Some(video), Some(audio)) =
                    (session.video_track.clone(), session.audio_track.clone())
                else {
                    return Err(RelayError::StreamNotReady(session_id.to_string()));
                };
                if !session.stream_ready {
                    return Err(RelayError::StreamNotReady(session_id.to_string()));
                }
                if session.is_streaming || session.encoder.is_some() {
                    return Err(RelayError::AlreadyStreaming(session_id.to_string()));
                }

                let destination = destination_url(&self.config, &platform, stream_key)?;
                session.is_streaming = true;
                session.stream_key = Some(stream_key.to_string());
                session.platform = Some(platform.clone());
                Ok((session.epoch, video, audio, destination))
            })
            .unwrap_or_else(|| Err(RelayError::SessionNotFound(session_id.to_string())))?;

        let encoder = match self.supervisor.start(
            session_id,
            &destination,
            video,
            audio,
            self.exit_callback(session_id),
        ) {
            Ok(encoder) => encoder,
            Err(error) => {
                self.registry.update(session_id, |session| {
                    if session.epoch == epoch && session.encoder.is_none() {
                        session.clear_streaming();
                    }
                });
                return Err(error);
            }
        };

        let committed = self.registry.update(session_id, |session| {
            if session.epoch != epoch {
                return false;
            }
            // the exit callback found no encoder to clear if it ran before this point
            if encoder.has_exited() {
                session.clear_streaming();
            } else {
                session.encoder = Some(encoder.clone());
            }
            true
        });
        if committed != Some(true) {
            info!(session_id, "Session closed while the encoder was starting, stopping it");
            encoder.stop();
            return Err(RelayError::SessionNotFound(session_id.to_string()));
        }

        info!(
            session_id,
            %platform,
            stream_key = %redact_key(stream_key),
            pid = encoder.pid(),
            "Streaming started"
        );
        Ok(platform)
    }

    /// Asks the session's encoder to stop; streaming state is cleared once it has exited.
    pub fn stop_streaming(&self, session_id: &str) -> Result<StopOutcome, RelayError> {
        let encoder = self
            .registry
            .update(session_id, |session| session.encoder.clone())
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;

        let Some(encoder) = encoder.filter(|encoder| !encoder.has_exited()) else {
            return Err(RelayError::NotStreaming(session_id.to_string()));
        };

        match encoder.stop() {
            StopOutcome::AlreadyExited => Err(RelayError::NotStreaming(session_id.to_string())),
            outcome => {
                info!(session_id, ?outcome, "Stop requested");
                Ok(outcome)
            }
        }
    }

    /// Clears streaming state when the encoder of this start goes away, unless a newer
    /// encoder already took its place.
    fn exit_callback(&self, session_id: &str) -> ExitCallback {
        let registry = self.registry.clone();
        let session_id = session_id.to_string();
        Box::new(move |exit: EncoderExit| {
            let cleared = registry.update(&session_id, |session| {
                let current = session
                    .encoder
                    .as_ref()
                    .is_some_and(|encoder| encoder.generation() == exit.generation);
                if current {
                    session.clear_streaming();
                }
                current
            });

            match cleared {
                Some(true) if exit.is_clean() => info!(%session_id, "Streaming stopped"),
                Some(true) => warn!(
                    %session_id,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    "Streaming stopped by encoder failure, start again to resume"
                ),
                _ => {}
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderSettings;
    use crate::media::frame::TrackKind;
    use crate::media::sink::TrackSink;
    use crate::session::registry::Session;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const LOOP_UNTIL_TERM: &str = "trap 'exit 0' TERM\nwhile true; do sleep 0.05; done";

    fn write_script(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn controller(ffmpeg_path: String, kill_grace_ms: u64) -> (StreamController, SessionRegistry) {
        let config = Config {
            ffmpeg_path,
            width: 4,
            height: 2,
            kill_grace_ms,
            ..Config::default()
        };
        let registry = SessionRegistry::new();
        let supervisor = EncoderSupervisor::new(EncoderSettings::from_config(&config));
        (
            StreamController::new(registry.clone(), supervisor, Arc::new(config)),
            registry,
        )
    }

    fn ready_session(registry: &SessionRegistry, id: &str) {
        let mut session = Session::new(id);
        session.video_track = Some(Arc::new(TrackSink::new(TrackKind::Video, "v")));
        session.audio_track = Some(Arc::new(TrackSink::new(TrackKind::Audio, "a")));
        session.stream_ready = true;
        registry.insert(session);
    }

    /// Retries while a freshly written script is still busy in another forked child.
    async fn start(
        controller: &StreamController,
        id: &str,
        platform: Option<&str>,
    ) -> Result<String, RelayError> {
        for _ in 0..10 {
            match controller.start_streaming(id, "abcd1234", platform) {
                Err(RelayError::EncoderSpawnFailed(error))
                    if error.raw_os_error() == Some(libc::ETXTBSY) =>
                {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                result => return result,
            }
        }
        panic!("script stayed busy");
    }

    async fn wait_not_streaming(registry: &SessionRegistry, id: &str, within: Duration) {
        tokio::time::timeout(within, async {
            while registry.get(id).is_some_and(|session| session.is_streaming) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("streaming state cleared in time");
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let dir = TempDir::new().unwrap();
        let (controller, registry) = controller(write_script(dir.path(), LOOP_UNTIL_TERM), 5000);
        ready_session(&registry, "S1");

        let platform = start(&controller, "S1", Some("YouTube")).await.unwrap();
        assert_eq!(platform, "youtube");

        let session = registry.get("S1").unwrap();
        assert!(session.is_streaming);
        assert_eq!(session.stream_key.as_deref(), Some("abcd1234"));
        assert_eq!(session.platform.as_deref(), Some("youtube"));
        assert!(session.encoder.is_some());

        assert_eq!(controller.stop_streaming("S1").unwrap(), StopOutcome::Signalled);
        assert_eq!(controller.stop_streaming("S1").unwrap(), StopOutcome::AlreadyStopping);
        wait_not_streaming(&registry, "S1", Duration::from_secs(5)).await;

        let session = registry.get("S1").unwrap();
        assert!(session.encoder.is_none());
        assert!(session.stream_key.is_none());
        // tracks survive the encoder, the session can stream again
        assert!(session.stream_ready);

        for _ in 0..2 {
            assert!(matches!(
                controller.stop_streaming("S1"),
                Err(RelayError::NotStreaming(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_start_defaults_to_youtube() {
        let dir = TempDir::new().unwrap();
        let (controller, registry) = controller(write_script(dir.path(), LOOP_UNTIL_TERM), 5000);
        ready_session(&registry, "S1");

        assert_eq!(start(&controller, "S1", None).await.unwrap(), DEFAULT_PLATFORM);
        controller.stop_streaming("S1").unwrap();
        wait_not_streaming(&registry, "S1", Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_premature_start_spawns_nothing() {
        let (controller, registry) = controller("/nonexistent/ffmpeg".into(), 5000);
        registry.insert(Session::new("S2"));

        assert!(matches!(
            controller.start_streaming("S2", "key", Some("youtube")),
            Err(RelayError::StreamNotReady(_))
        ));

        // one track is not enough
        registry.update("S2", |session| {
            session.video_track = Some(Arc::new(TrackSink::new(TrackKind::Video, "v")));
        });
        assert!(matches!(
            controller.start_streaming("S2", "key", Some("youtube")),
            Err(RelayError::StreamNotReady(_))
        ));

        let session = registry.get("S2").unwrap();
        assert!(!session.is_streaming);
        assert!(session.encoder.is_none());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (controller, _registry) = controller("/nonexistent/ffmpeg".into(), 5000);
        assert!(matches!(
            controller.start_streaming("missing", "key", None),
            Err(RelayError::SessionNotFound(_))
        ));
        assert!(matches!(
            controller.stop_streaming("missing"),
            Err(RelayError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let dir = TempDir::new().unwrap();
        let (controller, registry) = controller(write_script(dir.path(), LOOP_UNTIL_TERM), 5000);
        ready_session(&registry, "S1");

        start(&controller, "S1", Some("youtube")).await.unwrap();
        let pid = registry.get("S1").unwrap().encoder.unwrap().pid();

        assert!(matches!(
            controller.start_streaming("S1", "other", Some("twitch")),
            Err(RelayError::AlreadyStreaming(_))
        ));
        let session = registry.get("S1").unwrap();
        assert_eq!(session.encoder.unwrap().pid(), pid);
        assert_eq!(session.platform.as_deref(), Some("youtube"));

        controller.stop_streaming("S1").unwrap();
        wait_not_streaming(&registry, "S1", Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_reserved_session_rejects_start() {
        let (controller, registry) = controller("/nonexistent/ffmpeg".into(), 5000);
        ready_session(&registry, "S1");
        // a start in flight holds the reservation without an encoder yet
        registry.update("S1", |session| session.is_streaming = true);

        assert!(matches!(
            controller.start_streaming("S1", "key", Some("youtube")),
            Err(RelayError::AlreadyStreaming(_))
        ));
        assert!(matches!(
            controller.stop_streaming("S1"),
            Err(RelayError::NotStreaming(_))
        ));
        assert!(registry.get("S1").unwrap().is_streaming);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_spawn_one_encoder() {
        let dir = TempDir::new().unwrap();
        let (controller, registry) = controller(write_script(dir.path(), LOOP_UNTIL_TERM), 5000);
        ready_session(&registry, "S1");

        for _ in 0..10 {
            let attempts: Vec<_> = (0..8)
                .map(|_| {
                    let controller = controller.clone();
                    tokio::task::spawn_blocking(move || {
                        controller.start_streaming("S1", "abcd1234", Some("youtube"))
                    })
                })
                .collect();
            let mut results = Vec::new();
            for attempt in attempts {
                results.push(attempt.await.unwrap());
            }

            if results
                .iter()
                .any(|result| matches!(result, Err(RelayError::EncoderSpawnFailed(_))))
            {
                // script still busy in a forked child, nothing was spawned
                wait_not_streaming(&registry, "S1", Duration::from_secs(1)).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }

            let started = results.iter().filter(|result| result.is_ok()).count();
            let rejected = results
                .iter()
                .filter(|result| matches!(result, Err(RelayError::AlreadyStreaming(_))))
                .count();
            assert_eq!(started, 1);
            assert_eq!(rejected, 7);
            assert!(registry.get("S1").unwrap().encoder.is_some());

            controller.stop_streaming("S1").unwrap();
            wait_not_streaming(&registry, "S1", Duration::from_secs(5)).await;
            return;
        }
        panic!("script stayed busy");
    }

    #[tokio::test]
    async fn test_unsupported_platform_and_spawn_failure() {
        let (controller, registry) = controller("/nonexistent/ffmpeg".into(), 5000);
        ready_session(&registry, "S1");

        assert!(matches!(
            controller.start_streaming("S1", "key", Some("myspace")),
            Err(RelayError::UnsupportedPlatform(_))
        ));
        assert!(matches!(
            controller.start_streaming("S1", "key", Some("twitch")),
            Err(RelayError::EncoderSpawnFailed(_))
        ));

        let session = registry.get("S1").unwrap();
        assert!(!session.is_streaming);
        assert!(session.encoder.is_none());
        assert!(!session.video_track.unwrap().is_bound());
    }

    #[tokio::test]
    async fn test_encoder_crash_clears_streaming() {
        let dir = TempDir::new().unwrap();
        let (controller, registry) = controller(write_script(dir.path(), "sleep 0.1\nexit 1"), 5000);
        ready_session(&registry, "S1");

        start(&controller, "S1", None).await.unwrap();
        wait_not_streaming(&registry, "S1", Duration::from_secs(5)).await;
        assert!(matches!(
            controller.stop_streaming("S1"),
            Err(RelayError::NotStreaming(_))
        ));

        // not auto-retried, but a new start works
        start(&controller, "S1", None).await.unwrap();
        assert!(registry.get("S1").unwrap().is_streaming);
        wait_not_streaming(&registry, "S1", Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let script = "trap '' TERM\nwhile true; do sleep 0.05; done";
        let (controller, registry) = controller(write_script(dir.path(), script), 300);
        ready_session(&registry, "S1");

        start(&controller, "S1", None).await.unwrap();
        let started = tokio::time::Instant::now();
        assert_eq!(controller.stop_streaming("S1").unwrap(), StopOutcome::Signalled);

        wait_not_streaming(&registry, "S1", Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
