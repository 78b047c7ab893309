use crate::config::Config;
use crate::error::RelayError;
use crate::media::buffer::BufferSettings;
use std::time::Duration;

/// File descriptor the encoder reads raw video from.
pub const VIDEO_FD: i32 = 3;
/// File descriptor the encoder reads raw PCM from.
pub const AUDIO_FD: i32 = 4;

/// Everything needed to launch and feed one encoder process.
#[derive(Clone, Debug)]
pub struct EncoderSettings {
    pub ffmpeg_path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub pipe_queue_capacity: usize,
    pub kill_grace: Duration,
    pub buffer: BufferSettings,
}

impl EncoderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            width: config.width,
            height: config.height,
            fps: config.fps,
            sample_rate: config.sample_rate,
            channels: config.channels,
            video_bitrate_kbps: config.video_bitrate_kbps,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            pipe_queue_capacity: config.pipe_queue_capacity,
            kill_grace: config.kill_grace(),
            buffer: BufferSettings::from_config(config),
        }
    }

    /// Arguments for a low latency x264/AAC encode of the two raw inputs into FLV.
    pub fn args(&self, destination: &str) -> Vec<String> {
        let fps = self.fps.to_string();
        let bitrate = self.video_bitrate_kbps;
        let x264_params = [
            "nal-hrd=cbr",
            "force-cfr=1",
            "no-scenecut=1",
            "ref=1",
            "bframes=0",
            "me=dia",
            "subme=0",
            "trellis=0",
        ]
        .join(":");

        let mut args: Vec<String> = Vec::with_capacity(64);
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        push(&["-hide_banner", "-loglevel", "warning", "-stats", "-y"]);

        // video input
        push(&["-f", "rawvideo", "-pix_fmt", "yuv420p"]);
        push(&["-s", &format!("{}x{}", self.width, self.height)]);
        push(&["-r", &fps, "-i", &format!("pipe:{VIDEO_FD}")]);

        // audio input
        push(&["-f", "s16le"]);
        push(&["-ar", &self.sample_rate.to_string()]);
        push(&["-ac", &self.channels.to_string()]);
        push(&["-i", &format!("pipe:{AUDIO_FD}")]);

        push(&["-map", "0:v:0", "-map", "1:a:0"]);

        push(&["-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency"]);
        push(&["-pix_fmt", "yuv420p", "-g", &fps, "-keyint_min", &fps]);
        push(&["-sc_threshold", "0", "-x264-params", &x264_params]);
        push(&["-b:v", &format!("{bitrate}k")]);
        push(&["-minrate", &format!("{}k", bitrate * 3 / 4)]);
        push(&["-maxrate", &format!("{}k", bitrate * 5 / 4)]);
        push(&["-bufsize", &format!("{}k", bitrate * 5 / 2)]);

        push(&["-c:a", "aac", "-b:a", &format!("{}k", self.audio_bitrate_kbps)]);
        push(&["-ar", &self.sample_rate.to_string()]);

        push(&["-f", "flv", destination]);
        args
    }
}

/// Full ingestion URL for a platform and stream key.
pub fn destination_url(config: &Config, platform: &str, stream_key: &str) -> Result<String, RelayError> {
    let base = config
        .platform_base_url(platform)
        .ok_or_else(|| RelayError::UnsupportedPlatform(platform.to_string()))?;

    if base.ends_with('/') {
        Ok(format!("{base}{stream_key}"))
    } else {
        Ok(format!("{base}/{stream_key}"))
    }
}

/// Stream keys are credentials, only a short prefix ever reaches the logs.
pub fn redact_key(stream_key: &str) -> String {
    let prefix: String = stream_key.chars().take(4).collect();
    format!("{prefix}****")
}
