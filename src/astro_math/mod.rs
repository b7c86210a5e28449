use chrono::{DateTime, Datelike, Timelike, Utc};
use polynomials::poly;
use std::f64::consts::{PI, TAU};

pub type Hours = f64;
pub type Degrees = f64;
pub type Radians = f64;

/// Julian Date of J2000.0
const J2000: f64 = 2451545.0;
/// Offset between Julian Date and Modified Julian Date
const MJD_OFFSET: f64 = 2400000.5;

pub fn deg_to_rad(degrees: Degrees) -> Radians {
    PI * degrees / 180.
}

pub fn rad_to_deg(rad: Radians) -> Degrees {
    180. * rad / PI
}

pub fn hours_to_rad(hours: Hours) -> Radians {
    PI * hours / 12.
}

pub fn rad_to_hours(rad: Radians) -> Hours {
    12. * rad / PI
}

pub fn deg_to_hours(deg: Degrees) -> Hours {
    deg / 15.
}

// Convert hms to hours or dms to degrees
pub fn ms_to_dec(d: u32, minutes: u32, seconds: f64) -> f64 {
    (d as f64) + (minutes as f64) / 60. + seconds / 3600.
}

/// Julian Date of an instant, including the sub-second part
/// see https://scienceworld.wolfram.com/astronomy/JulianDate.html
pub fn julian_date(time: DateTime<Utc>) -> f64 {
    let y = time.year() as f64;
    let m = time.month() as f64;
    let d = time.day() as f64;

    let mut jd = 367. * y;
    jd -= f64::floor(7. * (y + f64::floor((m + 9.) / 12.)) / 4.);
    jd -= f64::floor(3. * (f64::floor((y + (m - 9.) / 7.) / 100.) + 1.) / 4.);
    jd += f64::floor(275. * m / 9.);
    jd += d;
    jd += 1721028.5;

    let seconds = time.second() as f64 + time.nanosecond() as f64 * 1E-9;
    jd + ms_to_dec(time.hour(), time.minute(), seconds) / 24.
}

pub fn modified_julian_date(time: DateTime<Utc>) -> f64 {
    julian_date(time) - MJD_OFFSET
}

// see https://thecynster.home.blog/2019/11/04/calculating-sidereal-time/
pub fn calculate_greenwich_sidereal_time(time: DateTime<Utc>) -> Hours {
    // Off by the leap seconds introduced after 2017 on later dates
    const LEAP_SECOND_TOTAL: u32 = 27;

    let jd_utc = julian_date(time);

    let du = jd_utc - J2000;
    let theta = rad_to_hours(modulo(
        TAU * (0.779_057_273_264f64 + 1.002_737_811_911_354_5f64 * du),
        TAU,
    ));

    let poly = poly![
        0.014506,
        4612.156534,
        1.3915817,
        -0.00000044,
        -0.000029956,
        -0.0000000368,
    ];
    let jd_tt = jd_utc + ((LEAP_SECOND_TOTAL as f64 + 32.184) / 3600.) / 24.;
    let t = (jd_tt - J2000) / 36525.; // centuries

    let gmstp = deg_to_hours(modulo(poly.eval(t).unwrap_or_default() / 3600., 360.));

    modulo(theta + gmstp, 24.)
}

/// longitude in degrees
/// returns hours
pub fn calculate_local_sidereal_time(time: DateTime<Utc>, longitude: Degrees) -> Hours {
    let greenwich_sidereal_time = calculate_greenwich_sidereal_time(time);
    modulo(greenwich_sidereal_time + deg_to_hours(longitude), 24.)
}

/// longitude in degrees, ra in hours
/// returns hours
pub fn calculate_hour_angle(time: DateTime<Utc>, longitude: Degrees, ra: Hours) -> Hours {
    modulo(calculate_local_sidereal_time(time, longitude) - ra, 24.)
}

pub fn calculate_alt_from_ha_dec(ha: Hours, dec: Degrees, lat: Degrees) -> Degrees {
    let ha = hours_to_rad(ha);
    let dec = deg_to_rad(dec);
    let lat = deg_to_rad(lat);
    let sin_alt = dec.sin() * lat.sin() + dec.cos() * lat.cos() * ha.cos();
    rad_to_deg(sin_alt.clamp(-1., 1.).asin())
}

/// Apparent right ascension (hours) and declination (degrees) of the sun.
///
/// Low precision almanac model, good to about 0.01 degrees between 1950 and 2050.
pub fn sun_ra_dec(time: DateTime<Utc>) -> (Hours, Degrees) {
    let n = julian_date(time) - J2000;

    let mean_longitude = modulo(280.460 + 0.985_647_4 * n, 360.);
    let mean_anomaly = deg_to_rad(modulo(357.528 + 0.985_600_3 * n, 360.));
    let ecliptic_longitude = deg_to_rad(
        mean_longitude + 1.915 * mean_anomaly.sin() + 0.020 * (2. * mean_anomaly).sin(),
    );
    let obliquity = deg_to_rad(23.439 - 0.000_000_4 * n);

    let ra = f64::atan2(
        obliquity.cos() * ecliptic_longitude.sin(),
        ecliptic_longitude.cos(),
    );
    let dec = (obliquity.sin() * ecliptic_longitude.sin()).asin();

    (modulo(rad_to_hours(ra), 24.), rad_to_deg(dec))
}

/// Geometric altitude of the sun seen from the given site
pub fn sun_altitude(time: DateTime<Utc>, latitude: Degrees, longitude: Degrees) -> Degrees {
    let (ra, dec) = sun_ra_dec(time);
    let ha = calculate_hour_angle(time, longitude, ra);
    calculate_alt_from_ha_dec(ha, dec, latitude)
}

pub fn modulo(val: f64, base: f64) -> f64 {
    ((val % base) + base) % base
}
