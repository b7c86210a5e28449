#[cfg(test)]
#[macro_use]
extern crate assert_float_eq;

pub mod astro_math;
pub mod camera;
pub mod config;
pub mod logging;
pub mod session;
pub mod twilight;
pub mod util;
