use crate::astro_math::{deg_to_hours, sun_altitude, Degrees};
use crate::config::{ObserverSite, TwilightThresholds};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use tracing::info;

const SCAN_STEP_MINUTES: i64 = 10;
const SCAN_SPAN_HOURS: i64 = 24;
const CROSSING_PRECISION_MILLIS: i64 = 500;

/// How many nights ahead to look before giving up on finding a window
pub const MAX_LOOKAHEAD_DAYS: i64 = 7;
/// Length of a test-mode acquisition
pub const TEST_RUN_MINUTES: i64 = 31;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NoCrossingReason {
    /// The sun stays above the sunset threshold all day
    SunNeverSets,
    /// The sun stays below the sunrise threshold
    SunNeverRises,
}

impl Display for NoCrossingReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::SunNeverSets => f.write_str("the sun never sets below the threshold"),
            Self::SunNeverRises => f.write_str("the sun never rises above the threshold"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwilightError {
    NoTwilightCrossing {
        date: NaiveDate,
        reason: NoCrossingReason,
    },
    NoWindowAhead {
        from: NaiveDate,
        days: i64,
    },
}

impl Display for TwilightError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTwilightCrossing { date, reason } => {
                write!(f, "No twilight crossing on {}: {}", date, reason)
            }
            Self::NoWindowAhead { from, days } => {
                write!(f, "No observation window within {} days of {}", days, from)
            }
        }
    }
}

impl Error for TwilightError {}

pub type TwilightResult<T> = Result<T, TwilightError>;

/// The dark part of one night: [sunset, sunrise)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObservationWindow {
    pub sunset: DateTime<Utc>,
    pub sunrise: DateTime<Utc>,
}

impl ObservationWindow {
    pub fn duration(&self) -> Duration {
        self.sunrise - self.sunset
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.sunset <= time && time < self.sunrise
    }
}

/// When the next acquisition starts and ends
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CapturePlan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CapturePlan {
    /// Start right away and stop after a fixed time, regardless of the sun
    pub fn test_run(now: DateTime<Utc>) -> Self {
        CapturePlan {
            start: now,
            end: now + Duration::minutes(TEST_RUN_MINUTES),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Crossing {
    Setting,
    Rising,
}

pub struct TwilightWindowCalculator<'a> {
    site: &'a ObserverSite,
    thresholds: TwilightThresholds,
}

impl<'a> TwilightWindowCalculator<'a> {
    pub fn new(site: &'a ObserverSite, thresholds: TwilightThresholds) -> Self {
        TwilightWindowCalculator { site, thresholds }
    }

    pub fn sun_altitude(&self, time: DateTime<Utc>) -> Degrees {
        sun_altitude(time, self.site.latitude, self.site.longitude)
    }

    /// Mean local noon of the date, in UTC
    pub fn local_noon(&self, date: NaiveDate) -> DateTime<Utc> {
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default();
        let offset_millis = (deg_to_hours(self.site.longitude) * 3_600_000.).round() as i64;
        Utc.from_utc_datetime(&date.and_time(noon)) - Duration::milliseconds(offset_millis)
    }

    /// The window starting on the evening of `date`
    pub fn window_for(&self, date: NaiveDate) -> TwilightResult<ObservationWindow> {
        let noon = self.local_noon(date);
        let span = Duration::hours(SCAN_SPAN_HOURS);

        let sunset_alt = self.thresholds.sunset_altitude;
        let sunset = match self.find_crossing(noon, noon + span, sunset_alt, Crossing::Setting) {
            Some(t) => t,
            None => {
                let reason = if self.sun_altitude(noon) >= sunset_alt {
                    NoCrossingReason::SunNeverSets
                } else {
                    NoCrossingReason::SunNeverRises
                };
                return Err(TwilightError::NoTwilightCrossing { date, reason });
            }
        };

        let sunrise_alt = self.thresholds.sunrise_altitude;
        let sunrise = self
            .find_crossing(sunset, sunset + span, sunrise_alt, Crossing::Rising)
            .ok_or(TwilightError::NoTwilightCrossing {
                date,
                reason: NoCrossingReason::SunNeverRises,
            })?;

        Ok(ObservationWindow { sunset, sunrise })
    }

    /// Pick the acquisition interval for `now`.
    ///
    /// Nights without a crossing are skipped and the following day is tried.
    pub fn plan(&self, now: DateTime<Utc>) -> TwilightResult<CapturePlan> {
        // The night in progress may have started on the previous date
        let first = now.date_naive() - Duration::days(1);

        for offset in 0..=MAX_LOOKAHEAD_DAYS {
            let date = first + Duration::days(offset);
            match self.window_for(date) {
                Ok(window) if window.sunrise <= now => continue,
                Ok(window) => {
                    if window.contains(now) {
                        info!("The sun is below the horizon.");
                    } else {
                        info!("The sun is above the horizon. Sunset at {}.", window.sunset);
                    }
                    return Ok(CapturePlan {
                        start: window.sunset.max(now),
                        end: window.sunrise,
                    });
                }
                Err(e) => info!("{}. Skipping this night.", e),
            }
        }

        Err(TwilightError::NoWindowAhead {
            from: first,
            days: MAX_LOOKAHEAD_DAYS,
        })
    }

    fn crossed(&self, altitude: Degrees, threshold: Degrees, crossing: Crossing) -> bool {
        match crossing {
            Crossing::Setting => altitude < threshold,
            Crossing::Rising => altitude >= threshold,
        }
    }

    /// First time in [from, to] where the sun crosses `threshold` in the given direction
    fn find_crossing(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        threshold: Degrees,
        crossing: Crossing,
    ) -> Option<DateTime<Utc>> {
        let step = Duration::minutes(SCAN_STEP_MINUTES);

        let mut before = from;
        let mut was_crossed = self.crossed(self.sun_altitude(before), threshold, crossing);
        while before < to {
            let after = (before + step).min(to);
            let is_crossed = self.crossed(self.sun_altitude(after), threshold, crossing);
            if !was_crossed && is_crossed {
                return Some(self.bisect(before, after, threshold, crossing));
            }
            was_crossed = is_crossed;
            before = after;
        }

        None
    }

    fn bisect(
        &self,
        mut before: DateTime<Utc>,
        mut after: DateTime<Utc>,
        threshold: Degrees,
        crossing: Crossing,
    ) -> DateTime<Utc> {
        let precision = Duration::milliseconds(CROSSING_PRECISION_MILLIS);
        while after - before > precision {
            let mid = before + (after - before) / 2;
            if self.crossed(self.sun_altitude(mid), threshold, crossing) {
                after = mid;
            } else {
                before = mid;
            }
        }
        after
    }
}
