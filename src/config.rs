//! Rig configuration: channel names, acquisition window, calibration
//! reference and output limits.
//!
//! Loaded once from a JSON file and passed explicitly into the player, the
//! stimulus expander and the schedulers. Missing fields take defaults.

use crate::error::{Result, RigError};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Analog output channel, e.g. "PCI-6259/ao0"
    pub aochan: String,
    /// Analog input channel, e.g. "PCI-6259/ai0"
    pub aichan: String,
    /// Input sample rate (Hz)
    pub aisr: f64,
    /// Acquisition window per repetition (seconds)
    pub acq_window: f64,
    /// Seconds to wait for a full input window before declaring a timeout
    pub acq_timeout: f64,
    /// Reference intensity (dB SPL) produced by `calv` volts
    pub caldb: f64,
    /// Reference output voltage at `caldb`
    pub calv: f64,
    /// Calibration reference tone frequency (Hz)
    pub calf: f64,
    /// Largest absolute output the device may be driven to (V)
    pub max_voltage: f64,
    /// Smallest peak worth boosting when a hardware attenuator is present (V)
    pub min_voltage: f64,
    /// Route attenuation to a hardware attenuator instead of scaling in software
    pub use_attenuator: bool,
    /// Slack added to the interval before a cycle counts as a missed deadline (ms)
    pub interval_tolerance_ms: f64,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            aochan: "PCI-6259/ao0".into(),
            aichan: "PCI-6259/ai0".into(),
            aisr: 50_000.0,
            acq_window: 0.2,
            acq_timeout: 10.0,
            caldb: 100.0,
            calv: 0.1,
            calf: 15_000.0,
            max_voltage: 10.0,
            min_voltage: 0.005,
            use_attenuator: false,
            interval_tolerance_ms: 10.0,
        }
    }
}

impl RigConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: RigConfig = serde_json::from_str(&data)?;
        config.validate()?;
        info!("Loaded rig config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.aisr.is_finite() && self.aisr > 0.0) {
            return Err(RigError::InvalidConfiguration(format!(
                "input sample rate must be positive, got {}",
                self.aisr
            )));
        }
        if !(self.acq_window.is_finite() && self.acq_window > 0.0) {
            return Err(RigError::InvalidConfiguration(format!(
                "acquisition window must be positive, got {}",
                self.acq_window
            )));
        }
        if self.input_samples() == 0 {
            return Err(RigError::InvalidConfiguration(
                "acquisition window holds no samples at this rate".into(),
            ));
        }
        if !(self.acq_timeout > 0.0) {
            return Err(RigError::InvalidConfiguration(format!(
                "acquisition timeout must be positive, got {}",
                self.acq_timeout
            )));
        }
        if !(self.calv > 0.0) || !(self.max_voltage > 0.0) {
            return Err(RigError::InvalidConfiguration(
                "calibration and maximum voltages must be positive".into(),
            ));
        }
        if self.min_voltage < 0.0 || self.min_voltage >= self.max_voltage {
            return Err(RigError::InvalidConfiguration(format!(
                "minimum voltage {} must lie in [0, {})",
                self.min_voltage, self.max_voltage
            )));
        }
        Ok(())
    }

    /// Samples collected per repetition.
    pub fn input_samples(&self) -> usize {
        (self.acq_window * self.aisr).round() as usize
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.acq_timeout)
    }

    pub fn interval_tolerance(&self) -> Duration {
        Duration::from_secs_f64(self.interval_tolerance_ms.max(0.0) / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = RigConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.input_samples(), 10_000);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg: RigConfig = serde_json::from_str(r#"{"aisr": 20000, "use_attenuator": true}"#).unwrap();
        assert_eq!(cfg.aisr, 20000.0);
        assert!(cfg.use_attenuator);
        assert_eq!(cfg.caldb, 100.0);
        assert_eq!(cfg.input_samples(), 4000);
    }

    #[test]
    fn test_rejects_zero_window() {
        let cfg = RigConfig {
            acq_window: 0.0,
            ..RigConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RigError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.json");
        let cfg = RigConfig {
            calf: 20_000.0,
            ..RigConfig::default()
        };
        cfg.save(&path).unwrap();
        let loaded = RigConfig::load(&path).unwrap();
        assert_eq!(loaded.calf, 20_000.0);
        assert_eq!(loaded.aochan, cfg.aochan);
    }
}
