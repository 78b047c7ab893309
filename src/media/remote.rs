use crate::media::decode::{AudioDecoder, DecodeSettings, MediaCodec, VideoDecoder};
use crate::media::frame::{MediaUnit, TrackKind};
use crate::media::sink::TrackSink;
use async_channel::{Receiver, Sender};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::codecs::{h264::H264Packet, opus::OpusPacket, vp8::Vp8Packet, vp9::Vp9Packet};
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_remote::TrackRemote;

const VIDEO_MAX_LATE: u16 = 512;
const AUDIO_MAX_LATE: u16 = 64;
const DECODE_QUEUE: usize = 64;

/// Pumps RTP from a remote track into `sink`.
///
/// Packets are reassembled into codec samples here and decoded on a blocking thread.
/// Nothing is decoded while the sink has no consumer. When the track stops producing
/// packets the sink is ended and `on_end` runs once.
pub fn spawn_remote_reader<F>(
    session_id: String,
    track: Arc<TrackRemote>,
    sink: Arc<TrackSink>,
    settings: DecodeSettings,
    on_end: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let params = track.codec();
        let mime_type = params.capability.mime_type.clone();
        let clock_rate = params.capability.clock_rate;
        let codec = MediaCodec::from_mime_type(&mime_type);

        info!(
            %session_id,
            track_id = %sink.id(),
            kind = %sink.kind(),
            %mime_type,
            clock_rate,
            "Reading remote track"
        );

        match codec {
            Some(codec) => {
                let (tx, rx) = async_channel::bounded(DECODE_QUEUE);
                let decode = spawn_decoder(session_id.clone(), codec, settings, sink.clone(), rx);

                let (track, sink) = (&*track, &*sink);
                match codec {
                    MediaCodec::H264 => {
                        pump(track, sink, H264Packet::default(), VIDEO_MAX_LATE, clock_rate, &tx).await
                    }
                    MediaCodec::Vp8 => {
                        pump(track, sink, Vp8Packet::default(), VIDEO_MAX_LATE, clock_rate, &tx).await
                    }
                    MediaCodec::Vp9 => {
                        pump(track, sink, Vp9Packet::default(), VIDEO_MAX_LATE, clock_rate, &tx).await
                    }
                    MediaCodec::Opus => {
                        pump(track, sink, OpusPacket::default(), AUDIO_MAX_LATE, clock_rate, &tx).await
                    }
                }

                tx.close();
                if let Err(error) = decode.await {
                    warn!(%session_id, ?error, "Decode thread panicked");
                }
            }
            None => {
                warn!(%session_id, %mime_type, "Unsupported codec, track is drained without decoding");
                drain(&track, &sink).await;
            }
        }

        sink.end();
        on_end();
        debug!(%session_id, track_id = %sink.id(), "Remote track reader finished");
    })
}

async fn pump<D>(
    track: &TrackRemote,
    sink: &TrackSink,
    depacketizer: D,
    max_late: u16,
    clock_rate: u32,
    samples: &Sender<Bytes>,
) where
    D: Depacketizer + Send,
{
    let mut builder = SampleBuilder::new(max_late, depacketizer, clock_rate.max(1));

    loop {
        let packet = tokio::select! {
            _ = sink.ended() => break,
            read = track.read_rtp() => match read {
                Ok((packet, _attributes)) => packet,
                Err(error) => {
                    debug!(track_id = %sink.id(), %error, "Remote track read ended");
                    break;
                }
            },
        };

        if !sink.is_bound() {
            continue;
        }

        builder.push(packet);
        while let Some(sample) = builder.pop() {
            if sample.data.is_empty() {
                continue;
            }
            if samples.force_send(sample.data).is_err() {
                // decoder is gone, keep reading so the end of the track is still noticed
                drain(track, sink).await;
                return;
            }
        }
    }
}

async fn drain(track: &TrackRemote, sink: &TrackSink) {
    loop {
        tokio::select! {
            _ = sink.ended() => break,
            read = track.read_rtp() => if read.is_err() { break },
        }
    }
}

fn spawn_decoder(
    session_id: String,
    codec: MediaCodec,
    settings: DecodeSettings,
    sink: Arc<TrackSink>,
    samples: Receiver<Bytes>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let result = match sink.kind() {
            TrackKind::Video => VideoDecoder::new(codec, settings).map(|mut decoder| {
                while let Ok(sample) = samples.recv_blocking() {
                    for frame in decoder.decode(&sample) {
                        sink.deliver(MediaUnit::Video(frame));
                    }
                }
            }),
            TrackKind::Audio => AudioDecoder::new(codec, settings).map(|mut decoder| {
                while let Ok(sample) = samples.recv_blocking() {
                    for pcm in decoder.decode(&sample) {
                        sink.deliver(MediaUnit::Audio(pcm));
                    }
                }
            }),
        };

        if let Err(error) = result {
            warn!(%session_id, track_id = %sink.id(), ?error, "Failed to create decoder");
            samples.close();
        }
    })
}
