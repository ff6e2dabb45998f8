pub mod calibration;
pub mod config;
pub mod console_display;
pub mod data_sink;
pub mod device;
pub mod dsp;
pub mod error;
pub mod osc_sender;
pub mod player;
pub mod recorder;
pub mod scheduler;
pub mod simulator;
pub mod stimulus;
pub mod types;
