//! Device seam between the player and a data acquisition backend.
//!
//! A backend hands out one analog input task and one analog output task per
//! cycle setup. The input is opened first and exposes its sample clock; the
//! output must be opened against that clock so the first input sample lines
//! up with the first output sample.

use crate::error::{Result, RigError};
use std::fmt;
use std::time::Duration;

/// Terminal name of a sample clock another task can be slaved to,
/// e.g. "/PCI-6259/ai/SampleClock".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSource(pub String);

impl ClockSource {
    pub fn for_input(aichan: &str) -> Self {
        let device = aichan.split('/').next().unwrap_or(aichan);
        ClockSource(format!("/{}/ai/SampleClock", device))
    }
}

impl fmt::Display for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Finite analog input: arm, read exactly `n_samples`, stop.
pub trait AnalogInput: Send {
    fn start(&mut self) -> Result<()>;
    /// Block until `n_samples` are available or `timeout` elapses.
    fn read(&mut self, n_samples: usize, timeout: Duration) -> Result<Vec<f64>>;
    fn stop(&mut self) -> Result<()>;
    fn clock_source(&self) -> ClockSource;
}

/// Finite analog output clocked from an input task.
pub trait AnalogOutput: Send {
    fn write(&mut self, waveform: &[f64]) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// Opens synchronized task pairs on one piece of hardware.
pub trait DaqBackend: Send {
    fn open_input(&mut self, chan: &str, rate: f64, n_samples: usize) -> Result<Box<dyn AnalogInput>>;

    fn open_output(
        &mut self,
        chan: &str,
        rate: f64,
        n_samples: usize,
        clock: &ClockSource,
    ) -> Result<Box<dyn AnalogOutput>>;

    /// Program a hardware attenuator, when the rig has one.
    fn set_attenuation(&mut self, db: f64) -> Result<()> {
        Err(RigError::DeviceFault(format!(
            "no hardware attenuator to set {} dB",
            db
        )))
    }

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_source_names_input_device() {
        let clk = ClockSource::for_input("PCI-6259/ai0");
        assert_eq!(clk.to_string(), "/PCI-6259/ai/SampleClock");
    }
}
