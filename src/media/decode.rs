use crate::config::Config;
use crate::media::frame::{AudioSamples, Plane, RawFrame};
use anyhow::anyhow;
use bytes::Bytes;
use ffmpeg_next::format::Pixel::YUV420P;
use ffmpeg_next::format::Sample;
use ffmpeg_next::software::resampling::Context as SamplerContext;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use ffmpeg_next::{ChannelLayout, Packet, codec, frame};
use tracing::{debug, trace, warn};

const PCM_FORMAT: Sample = Sample::I16(ffmpeg_next::format::sample::Type::Packed);

/// Output geometry and PCM format every decoded unit is normalised to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeSettings {
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.width,
            height: config.height,
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }
}

/// Codecs the relay knows how to depacketize and decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaCodec {
    H264,
    Vp8,
    Vp9,
    Opus,
}

impl MediaCodec {
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        match mime_type.to_ascii_lowercase().as_str() {
            "video/h264" => Some(Self::H264),
            "video/vp8" => Some(Self::Vp8),
            "video/vp9" => Some(Self::Vp9),
            "audio/opus" => Some(Self::Opus),
            _ => None,
        }
    }

    fn codec_id(self) -> codec::Id {
        match self {
            Self::H264 => codec::Id::H264,
            Self::Vp8 => codec::Id::VP8,
            Self::Vp9 => codec::Id::VP9,
            Self::Opus => codec::Id::OPUS,
        }
    }

    pub fn is_video(self) -> bool {
        !matches!(self, Self::Opus)
    }
}

fn is_again(error: &ffmpeg_next::Error) -> bool {
    matches!(error, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}

/// Decodes reassembled video samples and scales them to the encoder geometry.
pub struct VideoDecoder {
    decoder: codec::decoder::Video,
    scaler: Option<(ScalerInput, Scaler)>,
    width: u32,
    height: u32,
    decoded: frame::Video,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct ScalerInput {
    format: ffmpeg_next::format::Pixel,
    width: u32,
    height: u32,
}

impl VideoDecoder {
    pub fn new(codec: MediaCodec, settings: DecodeSettings) -> anyhow::Result<Self> {
        if !codec.is_video() {
            return Err(anyhow!("{codec:?} is not a video codec"));
        }

        let finder = codec::decoder::find(codec.codec_id())
            .ok_or_else(|| anyhow!("Video decoder for {codec:?} not found"))?;
        let decoder = codec::Context::new_with_codec(finder)
            .decoder()
            .video()
            .map_err(|e| anyhow!("Failed to open {codec:?} decoder: {e}"))?;

        Ok(Self {
            decoder,
            scaler: None,
            width: settings.width,
            height: settings.height,
            decoded: frame::Video::empty(),
        })
    }

    /// Feeds one access unit and returns every picture the decoder released.
    pub fn decode(&mut self, payload: &[u8]) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        if payload.is_empty() {
            return frames;
        }
        let packet = Packet::copy(payload);
        if let Err(error) = self.decoder.send_packet(&packet) {
            trace!(?error, "Video decoder rejected packet");
            return frames;
        }

        loop {
            match self.decoder.receive_frame(&mut self.decoded) {
                Ok(()) => match self.scale_decoded() {
                    Ok(frame) => frames.push(frame),
                    Err(error) => warn!(?error, "Failed to scale decoded frame"),
                },
                Err(error) if is_again(&error) => break,
                Err(ffmpeg_next::Error::Eof) => break,
                Err(error) => {
                    debug!(?error, "Video decoder error");
                    break;
                }
            }
        }

        frames
    }

    fn scale_decoded(&mut self) -> Result<RawFrame, ffmpeg_next::Error> {
        let input = ScalerInput {
            format: self.decoded.format(),
            width: self.decoded.width(),
            height: self.decoded.height(),
        };

        let scaler = match &mut self.scaler {
            Some((current, scaler)) if *current == input => scaler,
            slot => {
                debug!(
                    format = ?input.format,
                    width = input.width,
                    height = input.height,
                    out_width = self.width,
                    out_height = self.height,
                    "Creating video scaler"
                );
                let scaler = Scaler::get(
                    input.format,
                    input.width,
                    input.height,
                    YUV420P,
                    self.width,
                    self.height,
                    Flags::BILINEAR,
                )?;
                &mut slot.insert((input, scaler)).1
            }
        };

        let mut scaled = frame::Video::empty();
        scaler.run(&self.decoded, &mut scaled)?;

        let planes = (0..3)
            .map(|index| Plane::new(Bytes::copy_from_slice(scaled.data(index)), scaled.stride(index)))
            .collect();

        Ok(RawFrame {
            width: scaled.width(),
            height: scaled.height(),
            planes,
        })
    }
}

/// Decodes Opus packets into interleaved s16 PCM at the encoder's rate and layout.
pub struct AudioDecoder {
    decoder: codec::decoder::Audio,
    resampler: Option<(ResamplerInput, SamplerContext)>,
    sample_rate: u32,
    channels: u16,
    decoded: frame::Audio,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct ResamplerInput {
    format: Sample,
    layout: ChannelLayout,
    rate: u32,
}

impl AudioDecoder {
    pub fn new(codec: MediaCodec, settings: DecodeSettings) -> anyhow::Result<Self> {
        if codec.is_video() {
            return Err(anyhow!("{codec:?} is not an audio codec"));
        }

        let finder = codec::decoder::find(codec.codec_id())
            .ok_or_else(|| anyhow!("Audio decoder for {codec:?} not found"))?;
        let decoder = codec::Context::new_with_codec(finder)
            .decoder()
            .audio()
            .map_err(|e| anyhow!("Failed to open {codec:?} decoder: {e}"))?;

        Ok(Self {
            decoder,
            resampler: None,
            sample_rate: settings.sample_rate,
            channels: settings.channels,
            decoded: frame::Audio::empty(),
        })
    }

    pub fn decode(&mut self, payload: &[u8]) -> Vec<AudioSamples> {
        let mut out = Vec::new();
        if payload.is_empty() {
            return out;
        }
        let packet = Packet::copy(payload);
        if let Err(error) = self.decoder.send_packet(&packet) {
            trace!(?error, "Audio decoder rejected packet");
            return out;
        }

        loop {
            match self.decoder.receive_frame(&mut self.decoded) {
                Ok(()) => match self.resample_decoded() {
                    Ok(samples) if !samples.data.is_empty() => out.push(samples),
                    Ok(_) => {}
                    Err(error) => warn!(?error, "Audio resampler error, skipping this audio data"),
                },
                Err(error) if is_again(&error) => break,
                Err(ffmpeg_next::Error::Eof) => break,
                Err(error) => {
                    debug!(?error, "Audio decoder error");
                    break;
                }
            }
        }

        out
    }

    fn resample_decoded(&mut self) -> Result<AudioSamples, ffmpeg_next::Error> {
        let channels = self.decoded.channels();
        let layout = self.decoded.channel_layout();
        let layout = if layout.is_empty() || layout.channels() != channels as i32 {
            ChannelLayout::default(channels.into())
        } else {
            layout
        };
        let input = ResamplerInput {
            format: self.decoded.format(),
            layout,
            rate: self.decoded.rate(),
        };

        let resampler = match &mut self.resampler {
            Some((current, resampler)) if *current == input => resampler,
            slot => {
                debug!(
                    format = ?input.format,
                    rate = input.rate,
                    channels,
                    out_rate = self.sample_rate,
                    out_channels = self.channels,
                    "Creating audio resampler"
                );
                let resampler = SamplerContext::get(
                    input.format,
                    input.layout,
                    input.rate,
                    PCM_FORMAT,
                    ChannelLayout::default(self.channels.into()),
                    self.sample_rate,
                )?;
                &mut slot.insert((input, resampler)).1
            }
        };

        let mut resampled = frame::Audio::empty();
        resampler.run(&self.decoded, &mut resampled)?;

        let len = resampled.samples() * self.channels as usize * 2;
        let bytes = resampled.data(0);
        let data = bytes[..len.min(bytes.len())]
            .chunks_exact(2)
            .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
            .collect();

        Ok(AudioSamples {
            sample_rate: self.sample_rate,
            channels: self.channels,
            data,
        })
    }
}
