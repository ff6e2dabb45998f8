//! Finite generate/acquire cycle on one output and one input channel.
//!
//! Lifecycle per trace: `set_stimulus` → `start` → (`run` → `reset`) × reps
//! → `stop`. Device tasks live in a [`TaskPair`] whose `Drop` stops and
//! releases them, so every exit path, including a failure halfway through
//! `start`, leaves the hardware idle.

use crate::config::RigConfig;
use crate::device::{AnalogInput, AnalogOutput, DaqBackend};
use crate::dsp::db_to_gain;
use crate::error::{Result, RigError};
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Duration;

/// Player settings taken from the rig configuration.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub aochan: String,
    pub aichan: String,
    /// Input sample rate (Hz)
    pub aisr: f64,
    /// Acquisition window (seconds)
    pub window: f64,
    pub timeout: Duration,
    pub use_attenuator: bool,
}

impl From<&RigConfig> for PlayerConfig {
    fn from(cfg: &RigConfig) -> Self {
        Self {
            aochan: cfg.aochan.clone(),
            aichan: cfg.aichan.clone(),
            aisr: cfg.aisr,
            window: cfg.acq_window,
            timeout: cfg.timeout(),
            use_attenuator: cfg.use_attenuator,
        }
    }
}

impl PlayerConfig {
    pub fn input_samples(&self) -> usize {
        (self.window * self.aisr).round() as usize
    }
}

struct StagedStimulus {
    signal: Arc<Vec<f64>>,
    samplerate: f64,
    attenuation: f64,
}

/// Open input/output tasks. Dropping the pair stops both.
struct TaskPair {
    input: Box<dyn AnalogInput>,
    output: Option<Box<dyn AnalogOutput>>,
}

impl TaskPair {
    fn halt(&mut self) -> Result<()> {
        let out = match self.output.as_mut() {
            Some(o) => o.stop(),
            None => Ok(()),
        };
        let inp = self.input.stop();
        out.and(inp)
    }

    fn output(&mut self) -> Result<&mut Box<dyn AnalogOutput>> {
        self.output
            .as_mut()
            .ok_or_else(|| RigError::DeviceFault("output task not open".into()))
    }
}

impl Drop for TaskPair {
    fn drop(&mut self) {
        if let Err(e) = self.halt() {
            warn!("Error stopping device tasks during release: {}", e);
        }
    }
}

pub struct Player {
    backend: Box<dyn DaqBackend>,
    config: PlayerConfig,
    staged: Option<StagedStimulus>,
    tasks: Option<TaskPair>,
}

impl Player {
    pub fn new(backend: Box<dyn DaqBackend>, config: PlayerConfig) -> Self {
        debug!(
            "Player on {}: {} -> {}, {} samples @ {} Hz",
            backend.name(),
            config.aochan,
            config.aichan,
            config.input_samples(),
            config.aisr
        );
        Self {
            backend,
            config,
            staged: None,
            tasks: None,
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn aisr(&self) -> f64 {
        self.config.aisr
    }

    /// Change the acquisition window. Takes effect on the next `start`.
    pub fn set_window(&mut self, window: f64) -> Result<()> {
        if !(window.is_finite() && window > 0.0) {
            return Err(RigError::InvalidConfiguration(format!(
                "acquisition window must be positive, got {}",
                window
            )));
        }
        self.config.window = window;
        Ok(())
    }

    /// Time axis of one acquired window (seconds).
    pub fn response_times(&self) -> Vec<f64> {
        (0..self.config.input_samples())
            .map(|i| i as f64 / self.config.aisr)
            .collect()
    }

    /// Stage one waveform for output.
    pub fn set_stimulus(&mut self, signal: Arc<Vec<f64>>, samplerate: f64, attenuation: f64) -> Result<()> {
        if signal.is_empty() {
            return Err(RigError::InvalidWaveform("signal has no samples".into()));
        }
        if !(samplerate.is_finite() && samplerate > 0.0) {
            return Err(RigError::InvalidWaveform(format!(
                "sample rate must be positive, got {}",
                samplerate
            )));
        }
        if !(attenuation.is_finite() && attenuation >= 0.0) {
            return Err(RigError::InvalidWaveform(format!(
                "attenuation must be a non-negative dB value, got {}",
                attenuation
            )));
        }
        self.staged = Some(StagedStimulus {
            signal,
            samplerate,
            attenuation,
        });
        Ok(())
    }

    /// Open synchronized tasks for the staged stimulus. Input first, output
    /// clocked from it; the waveform is written but nothing runs yet.
    pub fn start(&mut self) -> Result<()> {
        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| RigError::InvalidWaveform("no stimulus staged".into()))?;

        // Release anything left from a previous cycle first.
        self.tasks = None;

        let n_in = self.config.input_samples();
        let input = self.backend.open_input(&self.config.aichan, self.config.aisr, n_in)?;
        let clock = input.clock_source();
        let mut pair = TaskPair {
            input,
            output: None,
        };

        pair.output = Some(self.backend.open_output(
            &self.config.aochan,
            staged.samplerate,
            staged.signal.len(),
            &clock,
        )?);

        if self.config.use_attenuator {
            self.backend.set_attenuation(staged.attenuation)?;
            pair.output()?.write(&staged.signal)?;
        } else if staged.attenuation > 0.0 {
            let g = db_to_gain(-staged.attenuation);
            let scaled: Vec<f64> = staged.signal.iter().map(|s| s * g).collect();
            pair.output()?.write(&scaled)?;
        } else {
            pair.output()?.write(&staged.signal)?;
        }

        trace!("Player armed on clock {}", clock);
        self.tasks = Some(pair);
        Ok(())
    }

    /// Play once and block until the full input window is collected.
    pub fn run(&mut self) -> Result<Vec<f64>> {
        let n = self.config.input_samples();
        let timeout = self.config.timeout;
        let tasks = self
            .tasks
            .as_mut()
            .ok_or_else(|| RigError::DeviceFault("player not started".into()))?;
        tasks.input.start()?;
        tasks.output()?.start()?;
        let data = tasks.input.read(n, timeout)?;
        if data.len() != n {
            return Err(RigError::DeviceFault(format!(
                "expected {} samples, device returned {}",
                n,
                data.len()
            )));
        }
        Ok(data)
    }

    /// Stop both tasks, keeping them configured for the next `run`.
    pub fn reset(&mut self) -> Result<()> {
        match self.tasks.as_mut() {
            Some(t) => t.halt(),
            None => Ok(()),
        }
    }

    /// Release device tasks. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.tasks.take().is_some() {
            debug!("Player released device tasks");
        }
    }

    pub fn is_started(&self) -> bool {
        self.tasks.is_some()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}
