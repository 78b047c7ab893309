use crate::config::Config;
use crate::encoder::{EncoderSettings, EncoderSupervisor};
use crate::session::{PeerController, SessionRegistry, StreamController};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub peers: PeerController,
    pub streams: StreamController,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let registry = SessionRegistry::new();
        let supervisor = EncoderSupervisor::new(EncoderSettings::from_config(&config));

        let peers = PeerController::new(registry.clone(), &config)?;
        let streams = StreamController::new(registry.clone(), supervisor, config.clone());

        info!(
            ffmpeg = %config.ffmpeg_path,
            width = config.width,
            height = config.height,
            fps = config.fps,
            "Relay state initialized"
        );

        Ok(Self {
            config,
            registry,
            peers,
            streams,
        })
    }

    /// Closes every session and waits for their encoders to exit.
    pub async fn shutdown(&self) {
        let encoders = self
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.get(id).and_then(|session| session.encoder))
            .collect::<Vec<_>>();

        info!(
            sessions = self.registry.len(),
            encoders = encoders.len(),
            "Closing all sessions"
        );
        self.peers.close_all().await;

        let deadline = self.config.kill_grace() + Duration::from_secs(1);
        let exited = futures::future::join_all(encoders.iter().map(|encoder| encoder.wait()));
        if tokio::time::timeout(deadline, exited).await.is_err() {
            warn!("Encoders still running after shutdown grace period");
        }
    }
}
