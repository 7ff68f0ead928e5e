pub mod calibration;
pub mod config;
pub mod platform;
pub mod protocol;
