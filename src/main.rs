use stream_relay::Config;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // webrtc-rs is chatty at info; keep it at warn unless RUST_LOG says otherwise
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,webrtc=warn,webrtc_ice=warn"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration from CLI and/or config file
    let config = Config::load()?;
    stream_relay::run(config).await
}
