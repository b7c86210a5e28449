//! Simulated cameras with fault injection.

use super::asi::{AsiCameraInfo, AsiControl, AsiDevice, AsiErrorCode, AsiResult};
use super::cv2::{BgrImage, CaptureProperty, VideoCaptureDevice};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{task, time};

/// Sky background range of the generated noise
const NOISE_FLOOR: u8 = 8;
const NOISE_CEILING: u8 = 24;

/// Reported sensor temperature in tenths of a degree
const SENSOR_TEMPERATURE: i64 = 215;

/// Counters shared between a simulated device and whoever watches it
#[derive(Debug, Default)]
pub struct SimProbe {
    opened: AtomicU32,
    closed: AtomicU32,
    frames: AtomicU32,
    gain_writes: AtomicU32,
    is_open: AtomicBool,
}

impl SimProbe {
    pub fn open_count(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn frames_delivered(&self) -> u32 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn gain_writes(&self) -> u32 {
        self.gain_writes.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.is_open.store(true, Ordering::SeqCst);
    }

    fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.is_open.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ReadFailures {
    None,
    Next(u32),
    Always,
}

async fn pause(period: Duration) {
    if period.is_zero() {
        task::yield_now().await;
    } else {
        time::sleep(period).await;
    }
}

fn noise(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len)
        .map(|_| rng.gen_range(NOISE_FLOOR..NOISE_CEILING))
        .collect()
}

/// Webcam stand-in producing gray noise
pub struct SimulatedVideoCapture {
    device_id: u32,
    width: u32,
    height: u32,
    opened: bool,
    available: bool,
    frame_period: Duration,
    failures: ReadFailures,
    rng: StdRng,
    probe: Arc<SimProbe>,
}

impl SimulatedVideoCapture {
    pub fn new(device_id: u32) -> Self {
        SimulatedVideoCapture {
            device_id,
            width: 640,
            height: 480,
            opened: false,
            available: true,
            frame_period: Duration::ZERO,
            failures: ReadFailures::None,
            rng: StdRng::from_entropy(),
            probe: Arc::new(SimProbe::default()),
        }
    }

    pub fn with_frame_period(mut self, period: Duration) -> Self {
        self.frame_period = period;
        self
    }

    /// The next `count` reads lose their frame
    pub fn failing_reads(mut self, count: u32) -> Self {
        self.failures = ReadFailures::Next(count);
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.failures = ReadFailures::Always;
        self
    }

    /// Opening the device fails
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn probe(&self) -> Arc<SimProbe> {
        self.probe.clone()
    }

    fn read_fails(&mut self) -> bool {
        match self.failures {
            ReadFailures::None => false,
            ReadFailures::Always => true,
            ReadFailures::Next(0) => {
                self.failures = ReadFailures::None;
                false
            }
            ReadFailures::Next(n) => {
                self.failures = ReadFailures::Next(n - 1);
                true
            }
        }
    }
}

#[async_trait]
impl VideoCaptureDevice for SimulatedVideoCapture {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    async fn open(&mut self) -> bool {
        if self.available {
            self.opened = true;
            self.probe.record_open();
        }
        self.opened
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn set(&mut self, property: CaptureProperty, value: f64) -> bool {
        if value < 1. {
            return false;
        }
        match property {
            CaptureProperty::FrameWidth => self.width = value as u32,
            CaptureProperty::FrameHeight => self.height = value as u32,
        }
        true
    }

    async fn read(&mut self) -> Option<BgrImage> {
        if !self.opened {
            return None;
        }

        pause(self.frame_period).await;
        if self.read_fails() {
            return None;
        }

        let gray = noise(&mut self.rng, self.width as usize * self.height as usize);
        self.probe.frames.fetch_add(1, Ordering::SeqCst);
        Some(BgrImage {
            width: self.width,
            height: self.height,
            data: gray.iter().flat_map(|&v| [v, v, v]).collect(),
        })
    }

    fn release(&mut self) {
        if self.opened {
            self.opened = false;
            self.probe.record_close();
        }
    }
}

/// ASI camera stand-in. Status codes can be scripted for `open` and frame reads.
pub struct SimulatedAsiCamera {
    device_id: u32,
    max_width: u32,
    max_height: u32,
    width: u32,
    height: u32,
    opened: bool,
    capturing: bool,
    exposure: Duration,
    gain: i64,
    auto_gain: bool,
    max_gain: i64,
    gain_target: Option<(i64, i64)>,
    controls: HashMap<AsiControl, i64>,
    status_script: VecDeque<i32>,
    rng: StdRng,
    probe: Arc<SimProbe>,
}

impl SimulatedAsiCamera {
    pub fn new(device_id: u32, max_width: u32, max_height: u32) -> Self {
        SimulatedAsiCamera {
            device_id,
            max_width,
            max_height,
            width: max_width,
            height: max_height,
            opened: false,
            capturing: false,
            exposure: Duration::ZERO,
            gain: 0,
            auto_gain: false,
            max_gain: i64::MAX,
            gain_target: None,
            controls: HashMap::new(),
            status_script: VecDeque::new(),
            rng: StdRng::from_entropy(),
            probe: Arc::new(SimProbe::default()),
        }
    }

    /// With autogain on, each frame moves the gain `step` closer to `target`
    pub fn with_auto_gain_target(mut self, target: i64, step: i64) -> Self {
        self.gain_target = Some((target, step));
        self
    }

    /// Statuses returned, in order, by `open` and frame reads before normal operation
    pub fn with_status_script(mut self, statuses: impl IntoIterator<Item = i32>) -> Self {
        self.status_script.extend(statuses);
        self
    }

    pub fn probe(&self) -> Arc<SimProbe> {
        self.probe.clone()
    }

    fn scripted_status(&mut self) -> AsiResult<()> {
        match self
            .status_script
            .pop_front()
            .and_then(AsiErrorCode::from_status)
        {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> AsiResult<()> {
        if self.opened {
            Ok(())
        } else {
            Err(AsiErrorCode::CameraClosed)
        }
    }

    fn drift_gain(&mut self) {
        if let (true, Some((target, step))) = (self.auto_gain, self.gain_target) {
            let next = if self.gain < target {
                (self.gain + step).min(target)
            } else {
                (self.gain - step).max(target)
            };
            self.gain = next.min(self.max_gain);
        }
    }
}

#[async_trait]
impl AsiDevice for SimulatedAsiCamera {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    async fn open(&mut self) -> AsiResult<AsiCameraInfo> {
        self.scripted_status()?;
        self.opened = true;
        self.probe.record_open();
        Ok(AsiCameraInfo {
            name: "Simulated ASI".to_string(),
            max_width: self.max_width,
            max_height: self.max_height,
        })
    }

    fn supports(&self, _control: AsiControl) -> bool {
        true
    }

    async fn set_control_value(
        &mut self,
        control: AsiControl,
        value: i64,
        auto: bool,
    ) -> AsiResult<()> {
        self.ensure_open()?;
        if value < 0 && control != AsiControl::Offset {
            return Err(AsiErrorCode::OutOfBoundary);
        }

        match control {
            AsiControl::Gain => {
                self.gain = value;
                self.auto_gain = auto;
                self.probe.gain_writes.fetch_add(1, Ordering::SeqCst);
            }
            AsiControl::Exposure => self.exposure = Duration::from_micros(value as u64),
            AsiControl::AutoMaxGain => self.max_gain = value,
            _ => {
                self.controls.insert(control, value);
            }
        }
        Ok(())
    }

    async fn get_control_value(&mut self, control: AsiControl) -> AsiResult<i64> {
        self.ensure_open()?;
        Ok(match control {
            AsiControl::Gain => self.gain,
            AsiControl::Exposure => self.exposure.as_micros() as i64,
            AsiControl::AutoMaxGain => self.max_gain,
            AsiControl::Temperature => SENSOR_TEMPERATURE,
            _ => self.controls.get(&control).copied().unwrap_or_default(),
        })
    }

    async fn set_roi(&mut self, width: u32, height: u32, bins: u32) -> AsiResult<()> {
        self.ensure_open()?;
        let fits = |size: u32, max: u32| size.checked_mul(bins).map_or(false, |s| s <= max);
        if bins == 0 || !fits(width, self.max_width) || !fits(height, self.max_height) {
            return Err(AsiErrorCode::InvalidSize);
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    async fn start_video_capture(&mut self) -> AsiResult<()> {
        self.ensure_open()?;
        self.capturing = true;
        Ok(())
    }

    async fn capture_video_frame(&mut self) -> AsiResult<Vec<u8>> {
        self.ensure_open()?;
        if !self.capturing {
            return Err(AsiErrorCode::InvalidSequence);
        }

        pause(self.exposure).await;
        self.scripted_status()?;
        self.drift_gain();
        self.probe.frames.fetch_add(1, Ordering::SeqCst);
        Ok(noise(&mut self.rng, self.width as usize * self.height as usize))
    }

    async fn stop_video_capture(&mut self) -> AsiResult<()> {
        self.capturing = false;
        Ok(())
    }

    async fn close(&mut self) -> AsiResult<()> {
        if self.opened {
            self.opened = false;
            self.capturing = false;
            self.probe.record_close();
        }
        Ok(())
    }
}
