pub mod buffer;
pub mod decode;
pub mod frame;
pub mod remote;
pub mod sink;

pub use buffer::{BufferSettings, BufferStatus, FrameBuffer};
pub use decode::{DecodeSettings, MediaCodec};
pub use frame::{
    AudioSamples, MediaUnit, Plane, RawFrame, TrackKind, expected_frame_len, pack_audio_samples,
    pack_video_frame,
};
pub use remote::spawn_remote_reader;
pub use sink::TrackSink;
