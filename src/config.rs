use crate::astro_math::Degrees;
use ini::{Ini, ParseOption, Properties};
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{io, result};

pub const DEFAULT_CONFIG_PATH: &str = "configuration.ini";

const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Largest sensor side accepted for nx and ny
const MAX_SENSOR_DIMENSION: u32 = 16384;

pub type ConfigResult<T> = result::Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Unreadable { path: PathBuf, error: io::Error },
    Syntax(String),
    MalformedConfig {
        section: String,
        key: String,
        reason: String,
    },
}

impl ConfigError {
    fn malformed(section: &str, key: &str, reason: impl Into<String>) -> Self {
        Self::MalformedConfig {
            section: section.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable { path, error } => {
                write!(f, "Couldn't read configuration {}: {}", path.display(), error)
            }
            Self::Syntax(msg) => write!(f, "Configuration syntax error: {}", msg),
            Self::MalformedConfig {
                section,
                key,
                reason,
            } => write!(f, "Malformed configuration [{}] {}: {}", section, key, reason),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Unreadable { error, .. } => Some(error),
            _ => None,
        }
    }
}

/* Observer */
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverSite {
    pub cospar: String,
    pub name: String,
    pub latitude: Degrees,
    pub longitude: Degrees,
    pub elevation: f64,
}

/* Directories */
/// Created and removed again to prove a directory accepts new files
const WRITE_CHECK_FILE: &str = ".stvid_write_check";

#[derive(Debug, Clone, PartialEq)]
pub struct PathSet {
    pub observations: PathBuf,
    pub tle: PathBuf,
    pub results: PathBuf,
}

impl PathSet {
    /// Make sure every configured directory exists and is writable
    pub fn prepare(&self) -> ConfigResult<()> {
        let dirs = [
            ("observations_path", &self.observations),
            ("tle_path", &self.tle),
            ("results_path", &self.results),
        ];

        for (key, path) in dirs {
            let fail = |reason: String| ConfigError::malformed("Common", key, reason);

            fs::create_dir_all(path)
                .map_err(|e| fail(format!("cannot create {}: {}", path.display(), e)))?;
            let meta = fs::metadata(path)
                .map_err(|e| fail(format!("cannot inspect {}: {}", path.display(), e)))?;

            if !meta.is_dir() {
                return Err(fail(format!("{} is not a directory", path.display())));
            }

            let check = path.join(WRITE_CHECK_FILE);
            File::create(&check)
                .and_then(|_| fs::remove_file(&check))
                .map_err(|e| fail(format!("{} is not writable: {}", path.display(), e)))?;
        }

        Ok(())
    }
}

/* Catalog credentials */
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/* Scheduling */
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TwilightThresholds {
    pub sunset_altitude: Degrees,
    pub sunrise_altitude: Degrees,
}

/// When a capture session ends
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndPolicy {
    /// Keep capturing stacks until the window closes at sunrise
    Sunrise,
    /// Stop once a single stack of `nframes` has been captured
    Quota,
}

impl FromStr for EndPolicy {
    type Err = String;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sunrise" => Ok(Self::Sunrise),
            "quota" => Ok(Self::Quota),
            other => Err(format!("unknown end policy '{}'", other)),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ControlSettings {
    pub twilight: TwilightThresholds,
    pub end_policy: EndPolicy,
    /// Time between frame starts. Zero captures as fast as the device delivers.
    pub frame_interval: Duration,
    pub max_consecutive_failures: u32,
}

/* Camera */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CameraType {
    Cv2,
    Asi,
}

impl CameraType {
    pub fn section(&self) -> &'static str {
        match self {
            Self::Cv2 => "CV2",
            Self::Asi => "ASI",
        }
    }
}

impl Display for CameraType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

impl FromStr for CameraType {
    type Err = String;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s {
            "CV2" => Ok(Self::Cv2),
            "ASI" => Ok(Self::Asi),
            other => Err(format!("unknown camera type '{}', expected CV2 or ASI", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cv2Profile {
    pub device_id: u32,
    pub width: u32,
    pub height: u32,
    pub nframes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsiProfile {
    pub device_id: u32,
    pub width: u32,
    pub height: u32,
    pub nframes: u32,
    pub gain: u32,
    pub max_gain: u32,
    pub autogain: bool,
    pub exposure_us: u64,
    pub binning: u32,
    pub brightness: u32,
    /// USB bandwidth overload, percent
    pub bandwidth: u32,
    pub high_speed: bool,
}

/// Settings of the one active camera, tagged by `[Camera] camera_type`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraProfile {
    Cv2(Cv2Profile),
    Asi(AsiProfile),
}

impl CameraProfile {
    pub fn camera_type(&self) -> CameraType {
        match self {
            Self::Cv2(_) => CameraType::Cv2,
            Self::Asi(_) => CameraType::Asi,
        }
    }

    pub fn device_id(&self) -> u32 {
        match self {
            Self::Cv2(p) => p.device_id,
            Self::Asi(p) => p.device_id,
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            Self::Cv2(p) => p.width,
            Self::Asi(p) => p.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::Cv2(p) => p.height,
            Self::Asi(p) => p.height,
        }
    }

    /// Frames per stack
    pub fn nframes(&self) -> u32 {
        match self {
            Self::Cv2(p) => p.nframes,
            Self::Asi(p) => p.nframes,
        }
    }
}

/* Plate solving */
#[derive(Debug, Clone, PartialEq)]
pub struct AstrometryParams {
    pub sex_config: PathBuf,
    /// Lower bound of the image scale, arcsec per pixel
    pub low_app: f64,
    /// Upper bound of the image scale, arcsec per pixel
    pub high_app: f64,
}

/* Config */
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub observer: ObserverSite,
    pub paths: PathSet,
    pub credentials: Credentials,
    pub control: ControlSettings,
    pub camera: CameraProfile,
    pub astrometry: AstrometryParams,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|error| ConfigError::Unreadable {
            path: path.to_path_buf(),
            error,
        })?;
        Self::from_ini_str(&text)
    }

    pub fn from_ini_str(text: &str) -> ConfigResult<Self> {
        let opt = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini = Ini::load_from_str_opt(text, opt).map_err(|e| ConfigError::Syntax(e.to_string()))?;

        Ok(Config {
            observer: parse_observer(&Section::of(&ini, "Common"))?,
            paths: parse_paths(&Section::of(&ini, "Common"))?,
            credentials: parse_credentials(&Section::of(&ini, "Credentials"))?,
            control: parse_control(&Section::of(&ini, "Control"))?,
            camera: parse_camera(&ini)?,
            astrometry: parse_astrometry(&Section::of(&ini, "Astrometry"))?,
        })
    }
}

fn parse_observer(common: &Section) -> ConfigResult<ObserverSite> {
    let cospar = common.string("observer_cospar")?;
    if !cospar.chars().all(|c| c.is_ascii_digit()) {
        return Err(common.malformed(
            "observer_cospar",
            format!("expected a numeric COSPAR site number, got '{}'", cospar),
        ));
    }

    Ok(ObserverSite {
        cospar,
        name: common.string("observer_name")?,
        latitude: common.float_in("observer_lat", -90.0..=90.0)?,
        longitude: common.float_in("observer_lon", -180.0..=180.0)?,
        elevation: common.float("observer_el")?,
    })
}

fn parse_paths(common: &Section) -> ConfigResult<PathSet> {
    Ok(PathSet {
        observations: common.string("observations_path")?.into(),
        tle: common.string("tle_path")?.into(),
        results: common.string("results_path")?.into(),
    })
}

fn parse_credentials(section: &Section) -> ConfigResult<Credentials> {
    Ok(Credentials::new(
        section.string("st-username")?,
        section.string("st-password")?,
    ))
}

fn parse_control(control: &Section) -> ConfigResult<ControlSettings> {
    let twilight = TwilightThresholds {
        sunset_altitude: control.float_in("alt_sunset", -90.0..=90.0)?,
        sunrise_altitude: control.float_in("alt_sunrise", -90.0..=90.0)?,
    };

    let end_policy = match control.optional("end_policy") {
        Some(_) => control.parse("end_policy", "sunrise or quota")?,
        None => EndPolicy::Sunrise,
    };

    let frame_interval = match control.optional("frame_interval") {
        Some(_) => Duration::from_secs_f64(control.float_in("frame_interval", 0.0..=3600.0)?),
        None => Duration::ZERO,
    };

    let max_consecutive_failures = match control.optional("max_consecutive_failures") {
        Some(_) => control.int_in("max_consecutive_failures", 1..=u32::MAX)?,
        None => DEFAULT_MAX_CONSECUTIVE_FAILURES,
    };

    Ok(ControlSettings {
        twilight,
        end_policy,
        frame_interval,
        max_consecutive_failures,
    })
}

fn parse_camera(ini: &Ini) -> ConfigResult<CameraProfile> {
    let camera = Section::of(ini, "Camera");
    let camera_type: CameraType = camera.parse("camera_type", "CV2 or ASI")?;
    let section = Section::of(ini, camera_type.section());

    // Sensor geometry is common to both variants
    let device_id = section.int("device_id")?;
    let width = section.int_in("nx", 1..=MAX_SENSOR_DIMENSION)?;
    let height = section.int_in("ny", 1..=MAX_SENSOR_DIMENSION)?;
    let nframes = section.int_in("nframes", 3..=u32::MAX)?;

    match camera_type {
        CameraType::Cv2 => Ok(CameraProfile::Cv2(Cv2Profile {
            device_id,
            width,
            height,
            nframes,
        })),
        CameraType::Asi => {
            let max_gain = section.int("maxgain")?;
            let gain = section.int("gain")?;
            if gain > max_gain {
                return Err(section.malformed(
                    "gain",
                    format!("gain {} exceeds maxgain {}", gain, max_gain),
                ));
            }

            Ok(CameraProfile::Asi(AsiProfile {
                device_id,
                width,
                height,
                nframes,
                gain,
                max_gain,
                autogain: section.boolean("autogain")?,
                exposure_us: section.int_in("exposure", 1..=u64::MAX)?,
                binning: section.int_in("bin", 1..=4)?,
                brightness: section.int("brightness")?,
                bandwidth: section.int_in("bandwidth", 40..=100)?,
                high_speed: section.boolean("high_speed")?,
            }))
        }
    }
}

fn parse_astrometry(section: &Section) -> ConfigResult<AstrometryParams> {
    let low_app = section.float_in("low_app", 0.0..=f64::MAX)?;
    let high_app = section.float_in("high_app", 0.0..=f64::MAX)?;
    if low_app > high_app {
        return Err(section.malformed(
            "low_app",
            format!("low_app {} exceeds high_app {}", low_app, high_app),
        ));
    }

    Ok(AstrometryParams {
        sex_config: section.string("sex_config")?.into(),
        low_app,
        high_app,
    })
}

/// Typed access to the keys of one INI section
struct Section<'a> {
    name: &'static str,
    props: Option<&'a Properties>,
}

impl<'a> Section<'a> {
    fn of(ini: &'a Ini, name: &'static str) -> Self {
        Section {
            name,
            props: ini.section(Some(name)),
        }
    }

    fn malformed(&self, key: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::malformed(self.name, key, reason)
    }

    fn optional(&self, key: &str) -> Option<&'a str> {
        self.props
            .and_then(|p| p.get(key))
            .map(strip_inline_comment)
    }

    fn required(&self, key: &str) -> ConfigResult<&'a str> {
        match self.props {
            None => Err(self.malformed(key, format!("section [{}] is missing", self.name))),
            Some(_) => self
                .optional(key)
                .ok_or_else(|| self.malformed(key, "missing required key")),
        }
    }

    fn string(&self, key: &str) -> ConfigResult<String> {
        let value = self.required(key)?;
        if value.is_empty() {
            return Err(self.malformed(key, "value is empty"));
        }
        Ok(value.to_string())
    }

    fn parse<T>(&self, key: &str, expected: &str) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let value = self.required(key)?;
        value.parse::<T>().map_err(|e| {
            self.malformed(key, format!("expected {}, got '{}' ({})", expected, value, e))
        })
    }

    fn float(&self, key: &str) -> ConfigResult<f64> {
        let value: f64 = self.parse(key, "a number")?;
        if !value.is_finite() {
            return Err(self.malformed(key, format!("{} is not a finite number", value)));
        }
        Ok(value)
    }

    fn float_in(&self, key: &str, range: RangeInclusive<f64>) -> ConfigResult<f64> {
        let value = self.float(key)?;
        check_range(self, key, value, range)
    }

    fn int<T>(&self, key: &str) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.parse(key, "a non-negative integer")
    }

    fn int_in<T>(&self, key: &str, range: RangeInclusive<T>) -> ConfigResult<T>
    where
        T: FromStr + PartialOrd + Display,
        T::Err: Display,
    {
        let value = self.int(key)?;
        check_range(self, key, value, range)
    }

    fn boolean(&self, key: &str) -> ConfigResult<bool> {
        let value = self.required(key)?;
        match value.to_ascii_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Ok(true),
            "0" | "no" | "false" | "off" => Ok(false),
            _ => Err(self.malformed(key, format!("expected a boolean, got '{}'", value))),
        }
    }
}

fn check_range<T: PartialOrd + Display>(
    section: &Section,
    key: &str,
    value: T,
    range: RangeInclusive<T>,
) -> ConfigResult<T> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(section.malformed(
            key,
            format!(
                "{} is outside {}..={}",
                value,
                range.start(),
                range.end()
            ),
        ))
    }
}

/// Drop a trailing `# comment` or `; comment`. The marker only counts at the
/// start of the value or after whitespace.
fn strip_inline_comment(value: &str) -> &str {
    let mut prev_is_space = true;
    for (i, c) in value.char_indices() {
        if (c == '#' || c == ';') && prev_is_space {
            return value[..i].trim();
        }
        prev_is_space = c.is_whitespace();
    }
    value.trim()
}
