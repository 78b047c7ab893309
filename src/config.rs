use clap::ArgAction::Append;
use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Built-in RTMP ingestion endpoints, keyed by platform name.
pub const BUILTIN_PLATFORMS: [(&str, &str); 2] = [
    ("youtube", "rtmps://a.rtmp.youtube.com/live2/"),
    ("twitch", "rtmp://live.twitch.tv/app/"),
];

pub const DEFAULT_PLATFORM: &str = "youtube";

/// Relay configuration, loaded from CLI arguments and optionally merged with a TOML file
///
/// Example configuration file content
/// # Stream Relay Configuration
///
/// listen_on_port = 5002
/// ffmpeg_path = "/usr/bin/ffmpeg"
///
/// # Encoder geometry, pacing rate and audio format
/// width = 1280
/// height = 720
/// fps = 30
/// sample_rate = 48000
/// channels = 1
/// video_bitrate_kbps = 2000
/// audio_bitrate_kbps = 128
///
/// # Pacing buffer
/// buffer_max_size = 8
/// buffer_min_frames = 3
///
/// # ICE servers (TURN entries are only used when both credentials are set)
/// stun_servers = ["stun:stun.l.google.com:19302"]
/// turn_username = "AC..."
/// turn_credential = "secret"
///
/// # Extra ingestion endpoints (name -> RTMP base URL, the stream key is appended)
/// [platforms]
/// custom = "rtmp://ingest.example.com/live/"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port the HTTP and signaling server listens on
    #[arg(short, long, default_value_t = 5002)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Path of the ffmpeg binary used as encoder
    #[arg(long, default_value = "ffmpeg")]
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Encoder input width; incoming video is scaled to it
    #[arg(long, default_value_t = 1280)]
    #[serde(default = "default_width")]
    pub width: u32,

    /// Encoder input height; incoming video is scaled to it
    #[arg(long, default_value_t = 720)]
    #[serde(default = "default_height")]
    pub height: u32,

    /// Frame rate shared by the pacing buffer and the encoder
    #[arg(long, default_value_t = 30)]
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// PCM sample rate fed to the encoder
    #[arg(long, default_value_t = 48000)]
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// PCM channel count fed to the encoder
    #[arg(long, default_value_t = 1)]
    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Target video bitrate in kbit/s
    #[arg(long, default_value_t = 2000)]
    #[serde(default = "default_video_bitrate_kbps")]
    pub video_bitrate_kbps: u32,

    /// Audio bitrate in kbit/s
    #[arg(long, default_value_t = 128)]
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,

    /// Maximum number of frames held by the pacing buffer
    #[arg(long, default_value_t = 8)]
    #[serde(default = "default_buffer_max_size")]
    pub buffer_max_size: usize,

    /// Frames required before the pacing buffer starts emitting
    #[arg(long, default_value_t = 3)]
    #[serde(default = "default_buffer_min_frames")]
    pub buffer_min_frames: usize,

    /// Chunks queued per encoder pipe before the oldest is dropped
    #[arg(long, default_value_t = 16)]
    #[serde(default = "default_pipe_queue_capacity")]
    pub pipe_queue_capacity: usize,

    /// Milliseconds between SIGTERM and SIGKILL when stopping the encoder
    #[arg(long, default_value_t = 5000)]
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// STUN server URL, may be given multiple times
    #[arg(long = "stun-server", action = Append, default_values_t = default_stun_servers())]
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// TURN server URL, may be given multiple times
    #[arg(long = "turn-server", action = Append, default_values_t = default_turn_servers())]
    #[serde(default = "default_turn_servers")]
    pub turn_servers: Vec<String>,

    /// TURN username
    #[arg(long, env = "TURN_USERNAME")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_username: Option<String>,

    /// TURN credential
    #[arg(long, env = "TURN_CREDENTIAL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_credential: Option<String>,

    /// Extra ingestion endpoint as name=rtmp_base_url, may be given multiple times
    #[arg(long = "platform", value_parser = parse_platform, action = Append)]
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "de_platforms")]
    pub platforms: Vec<(String, String)>,
}

/// Parse a platform entry from command line format "name=url"
fn parse_platform(s: &str) -> Result<(String, String), String> {
    let Some((name, url)) = s.split_once('=') else {
        return Err("Invalid format. Use name=rtmp_base_url".to_string());
    };

    let name = name.trim();
    if name.is_empty() {
        return Err("Platform name cannot be empty".to_string());
    }

    let url = url.trim();
    if !is_rtmp_url(url) {
        return Err(format!(
            "Invalid URL for platform '{name}': must start with rtmp:// or rtmps://"
        ));
    }

    Ok((name.to_lowercase(), url.to_string()))
}

fn de_platforms<'de, D>(de: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    let repr = Option::<HashMap<String, String>>::deserialize(de)?;
    let Some(repr) = repr else {
        return Ok(Vec::new());
    };

    let mut out = repr
        .into_iter()
        .map(|(name, url)| (name.to_lowercase(), url))
        .collect::<Vec<_>>();
    out.sort_unstable();
    out.dedup_by(|a, b| a.0 == b.0);

    Ok(out)
}

fn is_rtmp_url(url: &str) -> bool {
    url.starts_with("rtmp://") || url.starts_with("rtmps://")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            config: None,
            ffmpeg_path: default_ffmpeg_path(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            video_bitrate_kbps: default_video_bitrate_kbps(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            buffer_max_size: default_buffer_max_size(),
            buffer_min_frames: default_buffer_min_frames(),
            pipe_queue_capacity: default_pipe_queue_capacity(),
            kill_grace_ms: default_kill_grace_ms(),
            stun_servers: default_stun_servers(),
            turn_servers: default_turn_servers(),
            turn_username: None,
            turn_credential: None,
            platforms: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.ffmpeg_path == default_ffmpeg_path() {
            self.ffmpeg_path = file_config.ffmpeg_path;
        }
        if self.width == default_width() {
            self.width = file_config.width;
        }
        if self.height == default_height() {
            self.height = file_config.height;
        }
        if self.fps == default_fps() {
            self.fps = file_config.fps;
        }
        if self.sample_rate == default_sample_rate() {
            self.sample_rate = file_config.sample_rate;
        }
        if self.channels == default_channels() {
            self.channels = file_config.channels;
        }
        if self.video_bitrate_kbps == default_video_bitrate_kbps() {
            self.video_bitrate_kbps = file_config.video_bitrate_kbps;
        }
        if self.audio_bitrate_kbps == default_audio_bitrate_kbps() {
            self.audio_bitrate_kbps = file_config.audio_bitrate_kbps;
        }
        if self.buffer_max_size == default_buffer_max_size() {
            self.buffer_max_size = file_config.buffer_max_size;
        }
        if self.buffer_min_frames == default_buffer_min_frames() {
            self.buffer_min_frames = file_config.buffer_min_frames;
        }
        if self.pipe_queue_capacity == default_pipe_queue_capacity() {
            self.pipe_queue_capacity = file_config.pipe_queue_capacity;
        }
        if self.kill_grace_ms == default_kill_grace_ms() {
            self.kill_grace_ms = file_config.kill_grace_ms;
        }
        if self.stun_servers == default_stun_servers() {
            self.stun_servers = file_config.stun_servers;
        }
        if self.turn_servers == default_turn_servers() {
            self.turn_servers = file_config.turn_servers;
        }

        // For Option fields, CLI takes precedence if Some
        if self.turn_username.is_none() {
            self.turn_username = file_config.turn_username;
        }
        if self.turn_credential.is_none() {
            self.turn_credential = file_config.turn_credential;
        }
        if self.platforms.is_empty() {
            self.platforms = file_config.platforms;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow::anyhow!("Encoder geometry cannot be zero"));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(anyhow::anyhow!(
                "Encoder geometry {}x{} must be even for yuv420p",
                self.width,
                self.height
            ));
        }
        if self.fps == 0 {
            return Err(anyhow::anyhow!("Frame rate must be positive"));
        }
        if self.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be positive"));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(anyhow::anyhow!(
                "Unsupported channel count {}. Use 1 or 2",
                self.channels
            ));
        }

        if self.buffer_max_size == 0 {
            return Err(anyhow::anyhow!("Pacing buffer size must be positive"));
        }
        if self.buffer_min_frames == 0 || self.buffer_min_frames > self.buffer_max_size {
            return Err(anyhow::anyhow!(
                "buffer_min_frames must be between 1 and buffer_max_size ({})",
                self.buffer_max_size
            ));
        }
        if self.pipe_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Pipe queue capacity must be positive"));
        }

        if self.turn_username.is_some() != self.turn_credential.is_some() {
            return Err(anyhow::anyhow!(
                "TURN username and credential must be set together"
            ));
        }

        for (name, url) in &self.platforms {
            if !is_rtmp_url(url) {
                return Err(anyhow::anyhow!(
                    "Invalid URL for platform '{name}': must start with rtmp:// or rtmps://"
                ));
            }
        }

        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Base ingestion URL for a platform. Configured entries shadow the built-in ones.
    pub fn platform_base_url(&self, platform: &str) -> Option<&str> {
        let platform = platform.to_lowercase();
        self.platforms
            .iter()
            .find(|(name, _)| *name == platform)
            .map(|(_, url)| url.as_str())
            .or_else(|| {
                BUILTIN_PLATFORMS
                    .iter()
                    .find(|(name, _)| *name == platform)
                    .map(|(_, url)| *url)
            })
    }

    /// TURN servers are only usable with credentials.
    pub fn turn_credentials(&self) -> Option<(&str, &str)> {
        match (&self.turn_username, &self.turn_credential) {
            (Some(username), Some(credential)) if !self.turn_servers.is_empty() => {
                Some((username.as_str(), credential.as_str()))
            }
            _ => None,
        }
    }
}

// Default value functions
fn default_port() -> u16 {
    5002
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_channels() -> u16 {
    1
}

fn default_video_bitrate_kbps() -> u32 {
    2000
}

fn default_audio_bitrate_kbps() -> u32 {
    128
}

fn default_buffer_max_size() -> usize {
    8
}

fn default_buffer_min_frames() -> usize {
    3
}

fn default_pipe_queue_capacity() -> usize {
    16
}

fn default_kill_grace_ms() -> u64 {
    5000
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn default_turn_servers() -> Vec<String> {
    vec![
        "turn:global.turn.twilio.com:3478?transport=udp".to_string(),
        "turn:global.turn.twilio.com:3478?transport=tcp".to_string(),
        "turn:global.turn.twilio.com:443?transport=tcp".to_string(),
    ]
}
