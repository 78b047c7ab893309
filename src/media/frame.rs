use crate::error::RelayError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample plane of a decoded picture. `stride` is the distance in bytes between
/// the starts of two consecutive rows and may include padding.
#[derive(Clone, Debug)]
pub struct Plane {
    pub data: Bytes,
    pub stride: usize,
}

impl Plane {
    pub fn new(data: impl Into<Bytes>, stride: usize) -> Self {
        Self {
            data: data.into(),
            stride,
        }
    }
}

/// A decoded planar 4:2:0 video frame as handed over by the transport adapter.
///
/// Planes are ordered Y, U, V. Any extra planes (alpha) are ignored by the packer.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Plane>,
}

/// Interleaved signed 16-bit PCM as decoded from one audio packet.
#[derive(Clone, Debug, Default)]
pub struct AudioSamples {
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<i16>,
}

/// A decoded unit delivered by a track sink.
#[derive(Clone, Debug)]
pub enum MediaUnit {
    Video(RawFrame),
    Audio(AudioSamples),
}

/// Size in bytes of a tightly packed yuv420p picture.
pub const fn expected_frame_len(width: usize, height: usize) -> usize {
    width * height + 2 * ((width / 2) * (height / 2))
}

/// Packs a (possibly padded) planar frame into a contiguous yuv420p buffer: the full
/// Y plane, then the half resolution U plane, then the V plane.
pub fn pack_video_frame(frame: &RawFrame) -> Result<Bytes, RelayError> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    if width == 0 || height == 0 {
        return Err(RelayError::MalformedFrame(format!(
            "missing geometry ({width}x{height})"
        )));
    }

    let [y, u, v] = match frame.planes.as_slice() {
        [y, u, v, ..] => [y, u, v],
        planes => {
            return Err(RelayError::MalformedFrame(format!(
                "expected 3 planes, got {}",
                planes.len()
            )));
        }
    };

    let chroma_width = width / 2;
    let chroma_height = height / 2;

    let mut out = BytesMut::with_capacity(expected_frame_len(width, height));
    copy_plane(&mut out, "Y", y, width, height)?;
    copy_plane(&mut out, "U", u, chroma_width, chroma_height)?;
    copy_plane(&mut out, "V", v, chroma_width, chroma_height)?;

    debug_assert_eq!(out.len(), expected_frame_len(width, height));
    Ok(out.freeze())
}

fn copy_plane(
    out: &mut BytesMut,
    name: &str,
    plane: &Plane,
    row_width: usize,
    rows: usize,
) -> Result<(), RelayError> {
    if row_width == 0 || rows == 0 {
        return Ok(());
    }

    if plane.stride < row_width {
        return Err(RelayError::MalformedFrame(format!(
            "{name} stride {} is smaller than row width {row_width}",
            plane.stride
        )));
    }

    let required = (rows - 1) * plane.stride + row_width;
    if plane.data.len() < required {
        return Err(RelayError::MalformedFrame(format!(
            "{name} plane has {} bytes, needs {required}",
            plane.data.len()
        )));
    }

    for row in 0..rows {
        let start = row * plane.stride;
        out.put_slice(&plane.data[start..start + row_width]);
    }

    Ok(())
}

/// Flattens interleaved PCM into the s16le byte stream the encoder's audio input
/// expects.
pub fn pack_audio_samples(samples: &AudioSamples) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.data.len() * 2);
    for sample in &samples.data {
        out.put_i16_le(*sample);
    }
    out.freeze()
}
