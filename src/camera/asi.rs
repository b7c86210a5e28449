use super::{mid_time, DriverError, DriverResult, RawFrame};
use crate::config::AsiProfile;
use async_trait::async_trait;
use chrono::Utc;
use num_enum::TryFromPrimitive;
use retry::delay::Exponential;
use std::fmt::{self, Display, Formatter};
use std::iter::Take;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Retries for a command the camera rejects as busy, on top of the first attempt
const BUSY_RETRIES: usize = 5;
/// Back-off doubles from 2ms and is scaled by this factor
const BUSY_BACKOFF_SCALE: u32 = 5;
/// Upper bound on gain adjustments while waiting for autogain to settle
const MAX_AUTOGAIN_STEPS: u32 = 50;

const WHITE_BALANCE_BLUE: i64 = 99;
const WHITE_BALANCE_RED: i64 = 75;
const GAMMA: i64 = 50;

/// Status codes returned by the ASI camera SDK
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum AsiErrorCode {
    InvalidIndex = 1,
    InvalidId = 2,
    InvalidControlType = 3,
    CameraClosed = 4,
    CameraRemoved = 5,
    InvalidPath = 6,
    InvalidFileFormat = 7,
    InvalidSize = 8,
    InvalidImageType = 9,
    OutOfBoundary = 10,
    Timeout = 11,
    InvalidSequence = 12,
    BufferTooSmall = 13,
    VideoModeActive = 14,
    ExposureInProgress = 15,
    GeneralError = 16,
    InvalidMode = 17,
}

impl AsiErrorCode {
    /// Decodes an SDK status. Success is `None`, unknown codes are general errors.
    pub fn from_status(status: i32) -> Option<Self> {
        if status == 0 {
            return None;
        }
        Some(Self::try_from(status).unwrap_or(Self::GeneralError))
    }

    /// The camera is busy and the command may succeed if repeated
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Timeout | Self::ExposureInProgress)
    }

    /// The camera is gone for the rest of the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidIndex | Self::InvalidId | Self::CameraClosed | Self::CameraRemoved
        )
    }
}

impl Display for AsiErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

pub type AsiResult<T> = Result<T, AsiErrorCode>;

/// SDK control types
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AsiControl {
    Gain = 0,
    Exposure = 1,
    Gamma = 2,
    WbR = 3,
    WbB = 4,
    Offset = 5,
    BandwidthOverload = 6,
    Temperature = 8,
    Flip = 9,
    AutoMaxGain = 10,
    HardwareBin = 13,
    HighSpeedMode = 14,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsiCameraInfo {
    pub name: String,
    pub max_width: u32,
    pub max_height: u32,
}

/// ASI camera reached through the vendor SDK. Frames are RAW8.
#[async_trait]
pub trait AsiDevice: Send {
    fn device_id(&self) -> u32;

    async fn open(&mut self) -> AsiResult<AsiCameraInfo>;

    fn supports(&self, control: AsiControl) -> bool;

    async fn set_control_value(&mut self, control: AsiControl, value: i64, auto: bool)
        -> AsiResult<()>;

    async fn get_control_value(&mut self, control: AsiControl) -> AsiResult<i64>;

    async fn set_roi(&mut self, width: u32, height: u32, bins: u32) -> AsiResult<()>;

    async fn start_video_capture(&mut self) -> AsiResult<()>;

    async fn capture_video_frame(&mut self) -> AsiResult<Vec<u8>>;

    async fn stop_video_capture(&mut self) -> AsiResult<()>;

    async fn close(&mut self) -> AsiResult<()>;
}

/// Back-off schedule for one command
struct BusyBackoff {
    device_id: u32,
    delays: Take<Exponential>,
}

impl BusyBackoff {
    fn new(device_id: u32) -> Self {
        BusyBackoff {
            device_id,
            delays: Exponential::from_millis(2).take(BUSY_RETRIES),
        }
    }

    /// Waits before the next attempt, or gives up once the schedule runs out
    async fn retry_after(&mut self, command: &str, code: AsiErrorCode) -> DriverResult<()> {
        match self.delays.next() {
            Some(delay) => {
                let delay = delay * BUSY_BACKOFF_SCALE;
                warn!(
                    "ASI camera {} busy during {}: {} -- Retrying in {:?}",
                    self.device_id, command, code, delay
                );
                time::sleep(delay).await;
                Ok(())
            }
            None => {
                error!(
                    "ASI camera {} still busy during {} after {} retries",
                    self.device_id, command, BUSY_RETRIES
                );
                Err(DriverError::DeviceUnavailable {
                    device_id: self.device_id,
                    status: code.to_string(),
                })
            }
        }
    }
}

/// Repeats a device call while the camera reports itself busy
macro_rules! retry_busy {
    ($adapter:expr, $command:expr, $call:expr) => {{
        let mut backoff = BusyBackoff::new($adapter.device_id());
        loop {
            match $call.await {
                Ok(value) => break Ok(value),
                Err(code) if code.is_busy() => backoff.retry_after($command, code).await?,
                Err(code) => break Err($adapter.unavailable(code)),
            }
        }
    }};
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AutogainOutcome {
    pub gain: u32,
    pub adjustments: u32,
}

pub struct AsiAdapter {
    device: Box<dyn AsiDevice>,
    open: bool,
    capturing: bool,
    width: u32,
    height: u32,
    nframes: u32,
    frames_in_stack: u32,
    autogain: bool,
    autogain_outcome: Option<AutogainOutcome>,
}

impl AsiAdapter {
    pub fn new(device: Box<dyn AsiDevice>) -> Self {
        AsiAdapter {
            device,
            open: false,
            capturing: false,
            width: 0,
            height: 0,
            nframes: 0,
            frames_in_stack: 0,
            autogain: false,
            autogain_outcome: None,
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device.device_id()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Where autogain settled during the last configure
    pub fn autogain_outcome(&self) -> Option<AutogainOutcome> {
        self.autogain_outcome
    }

    fn unavailable(&self, code: AsiErrorCode) -> DriverError {
        DriverError::DeviceUnavailable {
            device_id: self.device_id(),
            status: code.to_string(),
        }
    }

    pub async fn open(&mut self) -> DriverResult<()> {
        if self.open {
            return Ok(());
        }

        let info = retry_busy!(self, "open", self.device.open())?;
        info!("ASI camera {} info: {:?}", self.device_id(), info);
        self.open = true;
        Ok(())
    }

    async fn set(&mut self, control: AsiControl, value: i64, auto: bool) -> DriverResult<()> {
        retry_busy!(
            self,
            "control update",
            self.device.set_control_value(control, value, auto)
        )?;
        debug!("ASI camera {} {:?} = {} (auto: {})", self.device_id(), control, value, auto);
        Ok(())
    }

    async fn get(&mut self, control: AsiControl) -> DriverResult<i64> {
        retry_busy!(self, "control readout", self.device.get_control_value(control))
    }

    pub async fn configure(&mut self, profile: &AsiProfile) -> DriverResult<()> {
        if !self.open {
            return Err(DriverError::NotOpen);
        }

        self.set(AsiControl::BandwidthOverload, profile.bandwidth as i64, false)
            .await?;
        self.set(AsiControl::Gain, profile.gain as i64, profile.autogain)
            .await?;
        self.set(AsiControl::Exposure, profile.exposure_us as i64, false)
            .await?;
        self.set(AsiControl::AutoMaxGain, profile.max_gain as i64, false)
            .await?;
        self.set(AsiControl::WbB, WHITE_BALANCE_BLUE, false).await?;
        self.set(AsiControl::WbR, WHITE_BALANCE_RED, false).await?;
        self.set(AsiControl::Gamma, GAMMA, false).await?;
        self.set(AsiControl::Offset, profile.brightness as i64, false)
            .await?;
        self.set(AsiControl::Flip, 0, false).await?;
        self.set(AsiControl::HighSpeedMode, profile.high_speed as i64, false)
            .await?;

        let width = profile.width / profile.binning;
        let height = profile.height / profile.binning;
        retry_busy!(
            self,
            "region of interest",
            self.device.set_roi(width, height, profile.binning)
        )?;
        if self.device.supports(AsiControl::HardwareBin) {
            self.set(AsiControl::HardwareBin, 1, false).await?;
        }

        retry_busy!(self, "start video", self.device.start_video_capture())?;
        self.capturing = true;

        self.width = width;
        self.height = height;
        self.nframes = profile.nframes;
        self.frames_in_stack = 0;
        self.autogain = profile.autogain;
        self.autogain_outcome = if profile.autogain {
            Some(self.converge_gain(profile).await?)
        } else {
            None
        };

        info!(
            "ASI camera {} capturing {}x{} (bin {}) at {} us",
            self.device_id(),
            width,
            height,
            profile.binning,
            profile.exposure_us
        );
        Ok(())
    }

    /// Lets the camera's autogain run until the gain stops moving or reaches the maximum
    async fn converge_gain(&mut self, profile: &AsiProfile) -> DriverResult<AutogainOutcome> {
        let max_gain = profile.max_gain as i64;
        let mut gain = profile.gain as i64;
        let mut adjustments = 0;

        while gain < max_gain && adjustments < MAX_AUTOGAIN_STEPS {
            retry_busy!(self, "autogain frame", self.device.capture_video_frame())?;
            let reported = self.get(AsiControl::Gain).await?;
            if reported == gain {
                break;
            }

            gain = reported.min(max_gain);
            self.set(AsiControl::Gain, gain, true).await?;
            adjustments += 1;
        }

        info!(
            "ASI camera {} autogain settled at {} after {} adjustments",
            self.device_id(),
            gain,
            adjustments
        );
        Ok(AutogainOutcome {
            gain: gain.max(0) as u32,
            adjustments,
        })
    }

    /// Logged once per stack. Autogain restarts from the gain it last reported.
    async fn report_sensor(&mut self) {
        match self.get(AsiControl::Gain).await {
            Ok(gain) => {
                info!("Gain: {}", gain);
                if self.autogain {
                    if let Err(e) = self.set(AsiControl::Gain, gain, true).await {
                        warn!("Failed to re-apply gain: {}", e);
                    }
                }
            }
            Err(e) => warn!("Failed to read gain: {}", e),
        }

        match self.get(AsiControl::Temperature).await {
            Ok(temp) => info!("Temperature: {:.1} C", temp as f64 / 10.),
            Err(e) => warn!("Failed to read temperature: {}", e),
        }
    }

    pub async fn capture_frame(&mut self) -> DriverResult<RawFrame> {
        if !self.open || !self.capturing {
            return Err(DriverError::NotOpen);
        }

        if self.frames_in_stack == 0 {
            self.report_sensor().await;
        }

        let start = Utc::now();
        let result = self.device.capture_video_frame().await;
        let timestamp = mid_time(start, Utc::now());

        let pixels = match result {
            Ok(pixels) => pixels,
            Err(code) if code.is_fatal() => return Err(self.unavailable(code)),
            Err(code) => {
                return Err(DriverError::FrameCapture(format!(
                    "ASI camera {}: {}",
                    self.device_id(),
                    code
                )))
            }
        };

        if pixels.len() != self.width as usize * self.height as usize {
            return Err(DriverError::FrameCapture(format!(
                "ASI camera {} delivered {} bytes, expected {}x{}",
                self.device_id(),
                pixels.len(),
                self.width,
                self.height
            )));
        }

        self.frames_in_stack = (self.frames_in_stack + 1) % self.nframes.max(1);
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            pixels,
            timestamp,
        })
    }

    pub async fn close(&mut self) -> DriverResult<()> {
        if !self.open {
            return Ok(());
        }

        if self.capturing {
            if let Err(code) = self.device.stop_video_capture().await {
                warn!("ASI camera {} failed to stop video: {}", self.device_id(), code);
            }
            self.capturing = false;
        }

        self.open = false;
        match self.device.close().await {
            Ok(()) => {
                info!("Closed ASI camera {}", self.device_id());
                Ok(())
            }
            Err(code) => Err(self.unavailable(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SimulatedAsiCamera;

    fn profile() -> AsiProfile {
        AsiProfile {
            device_id: 0,
            width: 32,
            height: 16,
            nframes: 3,
            gain: 300,
            max_gain: 300,
            autogain: true,
            exposure_us: 1000,
            binning: 1,
            brightness: 10,
            bandwidth: 90,
            high_speed: false,
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AsiErrorCode::from_status(0), None);
        assert_eq!(AsiErrorCode::from_status(11), Some(AsiErrorCode::Timeout));
        assert_eq!(AsiErrorCode::from_status(99), Some(AsiErrorCode::GeneralError));
        assert!(AsiErrorCode::Timeout.is_busy());
        assert!(AsiErrorCode::ExposureInProgress.is_busy());
        assert!(!AsiErrorCode::CameraRemoved.is_busy());
        assert!(AsiErrorCode::CameraRemoved.is_fatal());
        assert_eq!(AsiErrorCode::Timeout.to_string(), "Timeout (11)");
    }

    #[tokio::test]
    async fn test_autogain_at_max_gain_makes_no_adjustments() {
        let sim = SimulatedAsiCamera::new(0, 32, 16).with_auto_gain_target(400, 50);
        let probe = sim.probe();
        let mut adapter = AsiAdapter::new(Box::new(sim));

        adapter.open().await.unwrap();
        adapter.configure(&profile()).await.unwrap();

        assert_eq!(
            adapter.autogain_outcome(),
            Some(AutogainOutcome {
                gain: 300,
                adjustments: 0
            })
        );
        // only the configured gain was written
        assert_eq!(probe.gain_writes(), 1);
        assert_eq!(probe.frames_delivered(), 0);
    }

    #[tokio::test]
    async fn test_autogain_settles() {
        let sim = SimulatedAsiCamera::new(0, 32, 16).with_auto_gain_target(250, 50);
        let mut adapter = AsiAdapter::new(Box::new(sim));
        let profile = AsiProfile {
            gain: 100,
            ..profile()
        };

        adapter.open().await.unwrap();
        adapter.configure(&profile).await.unwrap();

        assert_eq!(
            adapter.autogain_outcome(),
            Some(AutogainOutcome {
                gain: 250,
                adjustments: 3
            })
        );
    }

    #[tokio::test]
    async fn test_autogain_clamped_to_max_gain() {
        let sim = SimulatedAsiCamera::new(0, 32, 16).with_auto_gain_target(500, 50);
        let mut adapter = AsiAdapter::new(Box::new(sim));
        let profile = AsiProfile {
            gain: 200,
            ..profile()
        };

        adapter.open().await.unwrap();
        adapter.configure(&profile).await.unwrap();

        assert_eq!(
            adapter.autogain_outcome(),
            Some(AutogainOutcome {
                gain: 300,
                adjustments: 2
            })
        );
    }

    #[tokio::test]
    async fn test_no_autogain() {
        let mut adapter = AsiAdapter::new(Box::new(SimulatedAsiCamera::new(0, 32, 16)));
        let profile = AsiProfile {
            autogain: false,
            ..profile()
        };

        adapter.open().await.unwrap();
        adapter.configure(&profile).await.unwrap();
        assert_eq!(adapter.autogain_outcome(), None);
    }

    #[tokio::test]
    async fn test_autogain_reapplied_each_stack() {
        let sim = SimulatedAsiCamera::new(0, 32, 16);
        let probe = sim.probe();
        let mut adapter = AsiAdapter::new(Box::new(sim));

        adapter.open().await.unwrap();
        adapter.configure(&profile()).await.unwrap();
        assert_eq!(probe.gain_writes(), 1);

        // nframes is 3, so the fourth frame starts a second stack
        for _ in 0..4 {
            adapter.capture_frame().await.unwrap();
        }
        assert_eq!(probe.gain_writes(), 3);
    }

    #[tokio::test]
    async fn test_fixed_gain_not_rewritten() {
        let sim = SimulatedAsiCamera::new(0, 32, 16);
        let probe = sim.probe();
        let mut adapter = AsiAdapter::new(Box::new(sim));
        let profile = AsiProfile {
            autogain: false,
            ..profile()
        };

        adapter.open().await.unwrap();
        adapter.configure(&profile).await.unwrap();
        for _ in 0..4 {
            adapter.capture_frame().await.unwrap();
        }
        assert_eq!(probe.gain_writes(), 1);
    }

    #[tokio::test]
    async fn test_busy_open_is_retried() {
        let sim = SimulatedAsiCamera::new(0, 32, 16).with_status_script([11, 15]);
        let probe = sim.probe();
        let mut adapter = AsiAdapter::new(Box::new(sim));

        adapter.open().await.unwrap();
        assert!(adapter.is_open());
        assert_eq!(probe.open_count(), 1);
    }

    #[tokio::test]
    async fn test_busy_retries_exhausted() {
        let sim = SimulatedAsiCamera::new(4, 32, 16).with_status_script([11; BUSY_RETRIES + 1]);
        let probe = sim.probe();
        let mut adapter = AsiAdapter::new(Box::new(sim));

        assert_eq!(
            adapter.open().await,
            Err(DriverError::DeviceUnavailable {
                device_id: 4,
                status: "Timeout (11)".to_string()
            })
        );
        assert!(!adapter.is_open());
        assert_eq!(probe.open_count(), 0);
    }

    #[tokio::test]
    async fn test_binned_frame_size() {
        let mut adapter = AsiAdapter::new(Box::new(SimulatedAsiCamera::new(0, 32, 16)));
        let profile = AsiProfile {
            binning: 2,
            autogain: false,
            ..profile()
        };

        adapter.open().await.unwrap();
        adapter.configure(&profile).await.unwrap();
        let frame = adapter.capture_frame().await.unwrap();
        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(frame.pixels.len(), 16 * 8);
    }

    #[tokio::test]
    async fn test_capture_errors() {
        let profile = AsiProfile {
            autogain: false,
            ..profile()
        };

        // a frame timeout loses just that frame
        let sim = SimulatedAsiCamera::new(0, 32, 16).with_status_script([0, 11, 5]);
        let probe = sim.probe();
        let mut adapter = AsiAdapter::new(Box::new(sim));
        adapter.open().await.unwrap();
        adapter.configure(&profile).await.unwrap();
        assert!(matches!(
            adapter.capture_frame().await,
            Err(DriverError::FrameCapture(_))
        ));

        // a removed camera ends the session
        assert!(matches!(
            adapter.capture_frame().await,
            Err(DriverError::DeviceUnavailable { .. })
        ));

        adapter.close().await.unwrap();
        assert!(!probe.is_open());
        assert_eq!(probe.close_count(), 1);
    }
}
