use crate::config::Config;
use crate::encoder::pipe::PipeWriter;
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DRIFT_RESET: Duration = Duration::from_millis(50);
const DRIFT_WARN: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug)]
pub struct BufferSettings {
    pub max_size: usize,
    pub min_frames: usize,
    pub interval: Duration,
}

impl BufferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_size: config.buffer_max_size,
            min_frames: config.buffer_min_frames,
            interval: config.frame_interval(),
        }
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_size: 8,
            min_frames: 3,
            interval: Duration::from_secs(1) / 30,
        }
    }
}

/// Snapshot of the pacing buffer counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStatus {
    pub level: usize,
    pub max_size: usize,
    pub utilization: f64,
    pub input_fps: f64,
    pub output_fps: f64,
    pub drop_rate: f64,
    pub input_count: u64,
    pub output_count: u64,
    pub dropped_count: u64,
    pub duplicated_count: u64,
    pub outputting: bool,
}

/// Bounded FIFO of packed video frames with a constant rate output clock.
///
/// Frames arrive at whatever rate the sender produces them; the output task emits one
/// frame per interval into the encoder's video pipe, duplicating the last frame on
/// underrun and evicting the oldest frame on overflow.
#[derive(Clone)]
pub struct FrameBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    session_id: String,
    settings: BufferSettings,
    output: PipeWriter,
    runtime: Handle,
    state: Mutex<State>,
}

struct State {
    frames: VecDeque<Bytes>,
    last_frame: Option<Bytes>,
    ticker: Option<CancellationToken>,
    /// Set by `stop_output`; the clock is not restarted afterwards.
    stopped: bool,
    encoder_exited: bool,
    started_at: Instant,
    input_count: u64,
    output_count: u64,
    dropped_count: u64,
    duplicated_count: u64,
}

impl FrameBuffer {
    /// Must be called from within a tokio runtime; the output task is spawned on it.
    pub fn new(session_id: impl Into<String>, settings: BufferSettings, output: PipeWriter) -> Self {
        let max_size = settings.max_size.max(1);
        let settings = BufferSettings {
            max_size,
            min_frames: settings.min_frames.clamp(1, max_size),
            interval: settings.interval,
        };

        Self {
            inner: Arc::new(Inner {
                session_id: session_id.into(),
                settings,
                output,
                runtime: Handle::current(),
                state: Mutex::new(State {
                    frames: VecDeque::with_capacity(max_size),
                    last_frame: None,
                    ticker: None,
                    stopped: false,
                    encoder_exited: false,
                    started_at: Instant::now(),
                    input_count: 0,
                    output_count: 0,
                    dropped_count: 0,
                    duplicated_count: 0,
                }),
            }),
        }
    }

    pub fn add_frame(&self, frame: Bytes) {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        if state.stopped || state.encoder_exited {
            return;
        }

        if state.frames.len() >= inner.settings.max_size {
            state.frames.pop_front();
            state.dropped_count += 1;
            warn!(
                session_id = %inner.session_id,
                level = state.frames.len(),
                max_size = inner.settings.max_size,
                "Frame buffer overflow, dropped oldest frame"
            );
        }

        state.frames.push_back(frame);
        state.input_count += 1;

        if state.ticker.is_none() && state.frames.len() >= inner.settings.min_frames {
            let token = CancellationToken::new();
            state.ticker = Some(token.clone());
            info!(
                session_id = %inner.session_id,
                interval_ms = inner.settings.interval.as_secs_f64() * 1000.0,
                "Starting paced output"
            );
            inner.runtime.spawn(run_output(inner.clone(), token));
        }
    }

    /// Cancels the output clock for good. Queued frames are kept, later frames are
    /// ignored.
    pub fn stop_output(&self) {
        let mut state = self.inner.lock_state();
        state.stopped = true;
        if let Some(token) = state.ticker.take() {
            token.cancel();
            info!(session_id = %self.inner.session_id, "Paced output stopped");
        }
    }

    /// Stops the output clock for good and drops queued frames.
    pub fn notify_encoder_exit(&self) {
        let mut state = self.inner.lock_state();
        state.encoder_exited = true;
        state.frames.clear();
        if let Some(token) = state.ticker.take() {
            token.cancel();
        }
        debug!(session_id = %self.inner.session_id, "Frame buffer detached from encoder");
    }

    pub fn is_outputting(&self) -> bool {
        self.inner.lock_state().ticker.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock_state().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> BufferStatus {
        let state = self.inner.lock_state();
        let runtime = state.started_at.elapsed().as_secs_f64();
        let per_second = |count: u64| {
            if runtime > 0.0 {
                count as f64 / runtime
            } else {
                0.0
            }
        };

        BufferStatus {
            level: state.frames.len(),
            max_size: self.inner.settings.max_size,
            utilization: state.frames.len() as f64 / self.inner.settings.max_size as f64,
            input_fps: per_second(state.input_count),
            output_fps: per_second(state.output_count),
            drop_rate: if state.input_count > 0 {
                state.dropped_count as f64 / state.input_count as f64
            } else {
                0.0
            },
            input_count: state.input_count,
            output_count: state.output_count,
            dropped_count: state.dropped_count,
            duplicated_count: state.duplicated_count,
            outputting: state.ticker.is_some(),
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emits one frame: the queue head, or a copy of the last frame on underrun.
    fn tick(&self) {
        let frame = {
            let mut state = self.lock_state();
            match state.frames.pop_front() {
                Some(frame) => {
                    state.last_frame = Some(frame.clone());
                    state.output_count += 1;
                    Some(frame)
                }
                None => match state.last_frame.clone() {
                    Some(frame) => {
                        state.duplicated_count += 1;
                        state.output_count += 1;
                        debug!(session_id = %self.session_id, "Frame buffer underrun, duplicating last frame");
                        Some(frame)
                    }
                    None => None,
                },
            }
        };

        if let Some(frame) = frame {
            self.output.write(frame);
        }
    }
}

async fn run_output(inner: Arc<Inner>, token: CancellationToken) {
    let interval = inner.settings.interval;
    let mut deadline = Instant::now() + interval;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep_until(deadline) => {}
        }

        inner.tick();

        let now = Instant::now();
        let drift = now.saturating_duration_since(deadline);
        if drift > DRIFT_RESET {
            warn!(
                session_id = %inner.session_id,
                drift_ms = drift.as_millis() as u64,
                "Large output drift, re-anchoring clock"
            );
            deadline = now + interval;
        } else {
            if drift > DRIFT_WARN {
                debug!(session_id = %inner.session_id, drift_ms = drift.as_millis() as u64, "Output drift");
            }
            deadline += interval;
        }
    }

    debug!(session_id = %inner.session_id, "Output task finished");
}
