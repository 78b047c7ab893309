pub mod command;
pub mod pipe;

use crate::error::RelayError;
use crate::media::buffer::{BufferStatus, FrameBuffer};
use crate::media::frame::{MediaUnit, expected_frame_len, pack_audio_samples, pack_video_frame};
use crate::media::sink::TrackSink;
pub use command::{AUDIO_FD, EncoderSettings, VIDEO_FD, destination_url, redact_key};
use pipe::PipeWriter;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const PROGRESS_LOG_EVERY: u64 = 30;

/// How an encoder process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderExit {
    pub generation: u64,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub forced: bool,
}

impl EncoderExit {
    /// Exit code 0 is the only clean exit.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGTERM sent, SIGKILL armed.
    Signalled,
    AlreadyStopping,
    AlreadyExited,
}

pub type ExitCallback = Box<dyn FnOnce(EncoderExit) + Send>;

/// Spawns and supervises one encoder process per streaming session.
#[derive(Clone, Debug)]
pub struct EncoderSupervisor {
    settings: Arc<EncoderSettings>,
    generation: Arc<AtomicU64>,
}

impl EncoderSupervisor {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Launches the encoder and wires both sinks into its input pipes.
    ///
    /// The sinks are only bound once the process is running; on failure nothing is
    /// bound and the error is returned to the caller. `on_exit` runs exactly once after
    /// the process is gone.
    pub fn start(
        &self,
        session_id: &str,
        destination: &str,
        video_sink: Arc<TrackSink>,
        audio_sink: Arc<TrackSink>,
        on_exit: ExitCallback,
    ) -> Result<EncoderHandle, RelayError> {
        let settings = &self.settings;
        let (video_read, video_write) = std::io::pipe().map_err(RelayError::EncoderSpawnFailed)?;
        let (audio_read, audio_write) = std::io::pipe().map_err(RelayError::EncoderSpawnFailed)?;

        let mut command = Command::new(&settings.ffmpeg_path);
        command
            .args(settings.args(destination))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let video_fd = video_read.as_raw_fd();
        let audio_fd = audio_read.as_raw_fd();
        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            command.pre_exec(move || install_input_fds(video_fd, audio_fd));
        }

        let mut child = command.spawn().map_err(RelayError::EncoderSpawnFailed)?;
        // the child holds its own copies of the read ends now
        drop(video_read);
        drop(audio_read);

        let video_pipe = async_pipe(video_write).map_err(RelayError::EncoderSpawnFailed)?;
        let audio_pipe = async_pipe(audio_write).map_err(RelayError::EncoderSpawnFailed)?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let pid = child.id();
        info!(
            session_id,
            pid,
            generation,
            destination = %redact_destination(destination),
            "Encoder process started"
        );

        let capacity = settings.pipe_queue_capacity;
        let video = PipeWriter::spawn("video", session_id, video_pipe, capacity);
        let audio = PipeWriter::spawn("audio", session_id, audio_pipe, capacity);
        let buffer = FrameBuffer::new(session_id, settings.buffer, video.clone());

        let handle = EncoderHandle {
            inner: Arc::new(HandleInner {
                session_id: session_id.to_string(),
                generation,
                pid,
                video,
                audio,
                buffer,
                video_sink,
                audio_sink,
                stop: CancellationToken::new(),
                stopping: AtomicBool::new(false),
                exited: CancellationToken::new(),
            }),
        };

        handle.bind_sinks(settings.width as usize, settings.height as usize);
        handle.close_pipes_on_track_end();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(session_id.to_string(), stderr));
        }
        tokio::spawn(monitor(child, handle.clone(), settings.kill_grace, on_exit));

        Ok(handle)
    }
}

/// Moves the pipe read ends onto the encoder's fixed input descriptors.
fn install_input_fds(video_fd: i32, audio_fd: i32) -> std::io::Result<()> {
    // Relocate both ends above the target range first so neither dup2 can clobber the
    // other source descriptor.
    let video = unsafe { libc::fcntl(video_fd, libc::F_DUPFD, 10) };
    if video < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let audio = unsafe { libc::fcntl(audio_fd, libc::F_DUPFD, 10) };
    if audio < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // dup2 leaves close-on-exec cleared on the new descriptor
    if unsafe { libc::dup2(video, VIDEO_FD) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::dup2(audio, AUDIO_FD) } < 0 {
        return Err(std::io::Error::last_os_error());
    }

    unsafe {
        libc::close(video);
        libc::close(audio);
    }
    Ok(())
}

fn async_pipe(
    writer: std::io::PipeWriter,
) -> std::io::Result<tokio::net::unix::pipe::Sender> {
    tokio::net::unix::pipe::Sender::from_owned_fd(OwnedFd::from(writer))
}

/// Strips the stream key from an ingestion URL before it reaches the logs.
fn redact_destination(destination: &str) -> String {
    match destination.rsplit_once('/') {
        Some((base, key)) => format!("{base}/{}", redact_key(key)),
        None => redact_key(destination),
    }
}

/// Shared handle to a running encoder process.
#[derive(Clone)]
pub struct EncoderHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    session_id: String,
    generation: u64,
    pid: Option<u32>,
    video: PipeWriter,
    audio: PipeWriter,
    buffer: FrameBuffer,
    video_sink: Arc<TrackSink>,
    audio_sink: Arc<TrackSink>,
    stop: CancellationToken,
    stopping: AtomicBool,
    exited: CancellationToken,
}

impl EncoderHandle {
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Requests a graceful stop. The monitor sends SIGTERM and escalates to SIGKILL once
    /// the grace period elapses. Repeated calls do not re-signal.
    pub fn stop(&self) -> StopOutcome {
        if self.has_exited() {
            return StopOutcome::AlreadyExited;
        }
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return StopOutcome::AlreadyStopping;
        }

        self.inner.buffer.stop_output();
        self.inner.stop.cancel();
        StopOutcome::Signalled
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exited.is_cancelled()
    }

    /// Resolves once the process has exited and its pipes are torn down.
    pub async fn wait(&self) {
        self.inner.exited.cancelled().await
    }

    pub fn buffer_status(&self) -> BufferStatus {
        self.inner.buffer.status()
    }

    fn bind_sinks(&self, width: usize, height: usize) {
        let session_id = self.inner.session_id.clone();
        let buffer = self.inner.buffer.clone();
        let frame_len = expected_frame_len(width, height);
        self.inner.video_sink.bind(Box::new(move |unit| {
            let MediaUnit::Video(frame) = unit else {
                return;
            };
            match pack_video_frame(&frame) {
                Ok(packed) if packed.len() == frame_len => buffer.add_frame(packed),
                Ok(packed) => warn!(
                    %session_id,
                    len = packed.len(),
                    expected = frame_len,
                    width = frame.width,
                    height = frame.height,
                    "Frame size does not match encoder geometry, skipping"
                ),
                Err(error) => warn!(%session_id, ?error, "Skipping malformed frame"),
            }
        }));

        let audio = self.inner.audio.clone();
        self.inner.audio_sink.bind(Box::new(move |unit| {
            if let MediaUnit::Audio(samples) = unit {
                audio.write(pack_audio_samples(&samples));
            }
        }));
    }

    fn unbind_sinks(&self) {
        self.inner.video_sink.unbind();
        self.inner.audio_sink.unbind();
    }

    /// Ending a track closes the matching input pipe; the encoder sees end of input.
    fn close_pipes_on_track_end(&self) {
        for (sink, pipe) in [
            (self.inner.video_sink.clone(), self.inner.video.clone()),
            (self.inner.audio_sink.clone(), self.inner.audio.clone()),
        ] {
            let exited = self.inner.exited.clone();
            let session_id = self.inner.session_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sink.ended() => {
                        info!(%session_id, kind = %sink.kind(), "Track ended while streaming, closing encoder input");
                        pipe.close();
                    }
                    _ = exited.cancelled() => {}
                }
            });
        }
    }
}

impl std::fmt::Debug for EncoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderHandle")
            .field("session_id", &self.inner.session_id)
            .field("generation", &self.inner.generation)
            .field("pid", &self.inner.pid)
            .field("stopping", &self.is_stopping())
            .field("exited", &self.has_exited())
            .finish()
    }
}

async fn monitor(mut child: Child, handle: EncoderHandle, grace: Duration, on_exit: ExitCallback) {
    let session_id = handle.session_id().to_string();
    let mut kill_at: Option<Instant> = None;
    let mut forced = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = handle.inner.stop.cancelled(), if kill_at.is_none() => {
                match child.id() {
                    Some(pid) => {
                        info!(%session_id, pid, grace_ms = grace.as_millis() as u64, "Sending SIGTERM to encoder");
                        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
                            let error = std::io::Error::last_os_error();
                            warn!(%session_id, pid, ?error, "Failed to send SIGTERM");
                        }
                    }
                    None => debug!(%session_id, "Encoder already reaped"),
                }
                kill_at = Some(Instant::now() + grace);
            }
            _ = sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() && !forced => {
                warn!(%session_id, "Encoder ignored SIGTERM, sending SIGKILL");
                if let Err(error) = child.start_kill() {
                    warn!(%session_id, ?error, "Failed to kill encoder");
                }
                forced = true;
            }
        }
    };

    handle.inner.buffer.notify_encoder_exit();
    handle.unbind_sinks();
    handle.inner.video.close();
    handle.inner.audio.close();

    let exit = match status {
        Ok(status) => exit_of(handle.generation(), status, forced),
        Err(error) => {
            error!(%session_id, ?error, "Failed to wait for encoder");
            EncoderExit {
                generation: handle.generation(),
                code: None,
                signal: None,
                forced,
            }
        }
    };

    if exit.is_clean() {
        info!(%session_id, generation = exit.generation, "Encoder exited cleanly");
    } else {
        warn!(
            %session_id,
            generation = exit.generation,
            code = ?exit.code,
            signal = ?exit.signal,
            forced,
            "Encoder terminated abnormally"
        );
    }

    handle.inner.exited.cancel();
    on_exit(exit);
}

fn exit_of(generation: u64, status: ExitStatus, forced: bool) -> EncoderExit {
    use std::os::unix::process::ExitStatusExt;
    EncoderExit {
        generation,
        code: status.code(),
        signal: status.signal(),
        forced,
    }
}

async fn forward_stderr(session_id: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    let mut progress = 0u64;

    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(error) => {
                debug!(%session_id, ?error, "Encoder stderr closed");
                break;
            }
        };

        let consumed = chunk.len();
        // progress lines end in '\r', log lines in '\n'
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                log_stderr_line(&session_id, &line, &mut progress);
                line.clear();
            } else {
                line.push(byte);
            }
        }
        reader.consume(consumed);
    }

    log_stderr_line(&session_id, &line, &mut progress);
}

fn log_stderr_line(session_id: &str, line: &[u8], progress: &mut u64) {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    if line.starts_with("frame=") || line.starts_with("size=") {
        *progress += 1;
        if *progress % PROGRESS_LOG_EVERY == 1 {
            debug!(session_id, progress = %line, "Encoder progress");
        }
    } else if line.to_ascii_lowercase().contains("error") {
        warn!(session_id, output = %line, "Encoder reported an error");
    } else {
        trace!(session_id, output = %line, "Encoder output");
    }
}
