//! Capture session state machine.
//!
//! A session waits for the planned window, captures frames from a
//! [`DriverAdapter`] into fixed-size stacks and hands full stacks to a
//! [`StackWriter`]. The camera is released on every way out of a session.

pub use stack::*;

use crate::camera::{DriverAdapter, DriverError, RawFrame};
use crate::config::{Config, EndPolicy};
use crate::twilight::CapturePlan;
use crate::util::{AbortResult, AbortSignal};
use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

mod stack;

/// Directory name used for every test mode run
const TEST_DIRECTORY: &str = "acquire_test";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WindowWait,
    Capturing,
    Draining,
    Faulted,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::WindowWait => "WindowWait",
            SessionState::Capturing => "Capturing",
            SessionState::Draining => "Draining",
            SessionState::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },
    Device(DriverError),
    TooManyFailures {
        consecutive: u32,
        last: String,
    },
    Writer(String),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { from, action } => {
                write!(f, "Can't {} a session that is {}", action, from)
            }
            Self::Device(e) => write!(f, "{}", e),
            Self::TooManyFailures { consecutive, last } => write!(
                f,
                "Gave up after {} consecutive lost frames, last: {}",
                consecutive, last
            ),
            Self::Writer(msg) => write!(f, "Stack writer: {}", msg),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Device(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DriverError> for SessionError {
    fn from(e: DriverError) -> Self {
        SessionError::Device(e)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub frames_captured: u64,
    pub frames_lost: u64,
    pub stacks_written: usize,
}

/// Report of a session that either ran to its end or was aborted
pub type SessionOutcome = AbortResult<SessionReport, SessionReport>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Completion {
    Finished,
    Aborted,
}

/// `<observations>/<YYYYMMDD>_<device>/<HHMMSS>`, or a fixed directory in test mode
pub fn observation_dir(config: &Config, now: DateTime<Utc>, testing: bool) -> PathBuf {
    if testing {
        return config.paths.observations.join(TEST_DIRECTORY);
    }

    config
        .paths
        .observations
        .join(format!(
            "{}_{}",
            now.format("%Y%m%d"),
            config.camera.device_id()
        ))
        .join(now.format("%H%M%S").to_string())
}

fn until(time: DateTime<Utc>) -> Duration {
    (time - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

pub struct CaptureSessionController {
    config: Arc<Config>,
    output_dir: PathBuf,
    state: watch::Sender<SessionState>,
}

impl CaptureSessionController {
    pub fn new(config: Arc<Config>, output_dir: impl Into<PathBuf>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        CaptureSessionController {
            config,
            output_dir: output_dir.into(),
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        debug!("Session {} -> {}", previous, next);
    }

    /// Prepares a new session. A faulted session may be armed again.
    pub fn arm(&self) -> SessionResult<()> {
        match self.state() {
            SessionState::Idle | SessionState::Faulted => {
                self.transition(SessionState::WindowWait);
                Ok(())
            }
            from => Err(SessionError::InvalidTransition {
                from,
                action: "arm",
            }),
        }
    }

    /// Runs an armed session to completion. Returns once the camera is released
    /// and every finished stack has been written.
    pub async fn run(
        &self,
        plan: CapturePlan,
        mut driver: DriverAdapter,
        abort: AbortSignal,
    ) -> SessionResult<SessionOutcome> {
        let state = self.state();
        if state != SessionState::WindowWait {
            return Err(SessionError::InvalidTransition {
                from: state,
                action: "run",
            });
        }

        let wait = until(plan.start);
        if !wait.is_zero() {
            info!("Waiting {:.0} seconds for the observation window.", wait.as_secs_f64());
        }
        tokio::select! {
            biased;
            _ = abort.clone() => {
                info!("Aborted before the observation window opened");
                self.transition(SessionState::Idle);
                return Ok(AbortResult::Aborted(SessionReport::default()));
            }
            _ = time::sleep(wait) => {}
        }

        info!("Starting data acquisition.");
        info!("Acquisition will end at {}", plan.end);
        self.transition(SessionState::Capturing);

        let writer = StackWriter::spawn(
            self.output_dir.clone(),
            StationInfo::from(&self.config.observer),
        );
        let mut report = SessionReport::default();
        let mut stack = Vec::new();

        let result = self
            .capture(&plan, &mut driver, &abort, &writer, &mut report, &mut stack)
            .await;

        if let Err(e) = driver.close().await {
            warn!("Failed to release camera {}: {}", driver.device_id(), e);
        }
        info!("Exiting capture");

        match result {
            Ok(completion) => {
                self.transition(SessionState::Draining);
                match self.drain(writer, stack).await {
                    Ok(written) => report.stacks_written = written,
                    Err(e) => {
                        error!("{}", e);
                        self.transition(SessionState::Faulted);
                        return Err(e);
                    }
                }

                info!(
                    "{} frames captured, {} lost, {} stacks written",
                    report.frames_captured, report.frames_lost, report.stacks_written
                );
                self.transition(SessionState::Idle);
                Ok(match completion {
                    Completion::Finished => AbortResult::Completed(report),
                    Completion::Aborted => AbortResult::Aborted(report),
                })
            }
            Err(e) => {
                error!("Capture session faulted: {}", e);
                if let Err(we) = writer.finish().await {
                    warn!("{}", we);
                }
                self.transition(SessionState::Faulted);
                Err(e)
            }
        }
    }

    async fn capture(
        &self,
        plan: &CapturePlan,
        driver: &mut DriverAdapter,
        abort: &AbortSignal,
        writer: &StackWriter,
        report: &mut SessionReport,
        stack: &mut Vec<RawFrame>,
    ) -> SessionResult<Completion> {
        driver.open().await?;
        driver.configure(&self.config.camera).await?;

        let control = &self.config.control;
        let nframes = self.config.camera.nframes() as usize;
        let end = Instant::now() + until(plan.end);
        let mut next_frame = Instant::now();
        let mut consecutive_failures = 0;

        loop {
            let frame = tokio::select! {
                biased;
                _ = abort.clone() => {
                    info!("Acquisition aborted");
                    return Ok(Completion::Aborted);
                }
                _ = time::sleep_until(end) => {
                    info!("Observation window closed");
                    return Ok(Completion::Finished);
                }
                frame = driver.capture_frame() => frame,
            };

            match frame {
                Ok(frame) => {
                    consecutive_failures = 0;
                    report.frames_captured += 1;
                    stack.push(frame);

                    if stack.len() >= nframes {
                        writer.submit(mem::take(stack)).await?;
                        if control.end_policy == EndPolicy::Quota {
                            info!("Frame quota of {} reached", nframes);
                            return Ok(Completion::Finished);
                        }
                    }
                }
                Err(DriverError::FrameCapture(msg)) => {
                    consecutive_failures += 1;
                    report.frames_lost += 1;
                    warn!("{} ({} in a row)", msg, consecutive_failures);

                    if consecutive_failures >= control.max_consecutive_failures {
                        return Err(SessionError::TooManyFailures {
                            consecutive: consecutive_failures,
                            last: msg,
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if !control.frame_interval.is_zero() {
                next_frame += control.frame_interval;
                tokio::select! {
                    biased;
                    _ = abort.clone() => {
                        info!("Acquisition aborted");
                        return Ok(Completion::Aborted);
                    }
                    _ = time::sleep_until(next_frame) => {}
                }
            }
        }
    }

    /// Flushes a partial stack and waits for the writer
    async fn drain(&self, writer: StackWriter, stack: Vec<RawFrame>) -> SessionResult<usize> {
        if stack.len() >= MIN_STACK_FRAMES {
            info!("Writing partial stack of {} frames", stack.len());
            writer.submit(stack).await?;
        } else if !stack.is_empty() {
            info!("Discarding {} frames of an incomplete stack", stack.len());
        }
        writer.finish().await
    }
}
