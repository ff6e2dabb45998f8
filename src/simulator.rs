use crate::device::{AnalogInput, AnalogOutput, ClockSource, DaqBackend};
use crate::dsp::db_to_gain;
use crate::error::{Result, RigError};
use log::{debug, info};
use parking_lot::Mutex;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Loopback rig that exercises the full generate/acquire cycle without
/// hardware: whatever the output task plays comes back on the input task,
/// passed through a speaker/microphone model, paced in real time.
///
/// The speaker model is a flat gain followed by an optional one-pole
/// low-pass, which gives calibration runs a frequency-dependent response to
/// correct for.
pub struct SimulatedRig {
    gain: f64,
    lowpass_hz: Option<f64>,
    faults: FaultPlan,
    shared: Arc<Mutex<Loopback>>,
    stats: Arc<RigStats>,
}

/// Failures to inject, for exercising the error paths of a run.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Reads never complete; every read times out.
    pub stall_reads: bool,
    /// The read with this zero-based index fails with a device fault.
    pub fail_read_at: Option<usize>,
    /// Opening an output task fails.
    pub fail_open_output: bool,
}

/// Counters observable from outside the worker thread.
#[derive(Debug, Default)]
pub struct RigStats {
    pub inputs_open: AtomicUsize,
    pub outputs_open: AtomicUsize,
    pub inputs_running: AtomicUsize,
    pub reads: AtomicUsize,
    pub attenuations: Mutex<Vec<f64>>,
}

impl RigStats {
    pub fn tasks_open(&self) -> usize {
        self.inputs_open.load(Ordering::SeqCst) + self.outputs_open.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Loopback {
    /// Output waveform after the speaker model, at the output rate
    played: Vec<f64>,
    out_rate: f64,
    attenuation_db: f64,
    triggered_at: Option<Instant>,
}

impl SimulatedRig {
    pub fn new() -> Self {
        Self {
            gain: 1.0,
            lowpass_hz: None,
            faults: FaultPlan::default(),
            shared: Arc::new(Mutex::new(Loopback::default())),
            stats: Arc::new(RigStats::default()),
        }
    }

    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_lowpass(mut self, cutoff_hz: f64) -> Self {
        self.lowpass_hz = Some(cutoff_hz);
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn stats(&self) -> Arc<RigStats> {
        self.stats.clone()
    }

    fn speaker(&self) -> SpeakerModel {
        SpeakerModel {
            gain: self.gain,
            lowpass_hz: self.lowpass_hz,
        }
    }
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqBackend for SimulatedRig {
    fn open_input(&mut self, chan: &str, rate: f64, n_samples: usize) -> Result<Box<dyn AnalogInput>> {
        self.stats.inputs_open.fetch_add(1, Ordering::SeqCst);
        debug!("sim: open input {} @ {} Hz x {}", chan, rate, n_samples);
        Ok(Box::new(SimInput {
            clock: ClockSource::for_input(chan),
            rate,
            running: false,
            stall: self.faults.stall_reads,
            fail_read_at: self.faults.fail_read_at,
            shared: self.shared.clone(),
            stats: self.stats.clone(),
        }))
    }

    fn open_output(
        &mut self,
        chan: &str,
        rate: f64,
        n_samples: usize,
        clock: &ClockSource,
    ) -> Result<Box<dyn AnalogOutput>> {
        if self.faults.fail_open_output {
            return Err(RigError::DeviceFault(format!(
                "sim: cannot route {} to {}",
                clock, chan
            )));
        }
        self.stats.outputs_open.fetch_add(1, Ordering::SeqCst);
        debug!(
            "sim: open output {} @ {} Hz x {} clocked from {}",
            chan, rate, n_samples, clock
        );
        Ok(Box::new(SimOutput {
            rate,
            speaker: self.speaker(),
            shared: self.shared.clone(),
            stats: self.stats.clone(),
        }))
    }

    fn set_attenuation(&mut self, db: f64) -> Result<()> {
        self.shared.lock().attenuation_db = db;
        self.stats.attenuations.lock().push(db);
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated loopback"
    }
}

#[derive(Clone, Copy)]
struct SpeakerModel {
    gain: f64,
    lowpass_hz: Option<f64>,
}

impl SpeakerModel {
    fn apply(&self, waveform: &[f64], rate: f64) -> Vec<f64> {
        let mut out: Vec<f64> = waveform.iter().map(|s| s * self.gain).collect();
        if let Some(fc) = self.lowpass_hz {
            let alpha = 1.0 - (-2.0 * PI * fc / rate).exp();
            let mut y = 0.0;
            for s in out.iter_mut() {
                y += alpha * (*s - y);
                *s = y;
            }
        }
        out
    }
}

struct SimOutput {
    rate: f64,
    speaker: SpeakerModel,
    shared: Arc<Mutex<Loopback>>,
    stats: Arc<RigStats>,
}

impl AnalogOutput for SimOutput {
    fn write(&mut self, waveform: &[f64]) -> Result<()> {
        let played = self.speaker.apply(waveform, self.rate);
        let mut lb = self.shared.lock();
        lb.played = played;
        lb.out_rate = self.rate;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.shared.lock().triggered_at = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.shared.lock().triggered_at = None;
        Ok(())
    }
}

impl Drop for SimOutput {
    fn drop(&mut self) {
        self.stats.outputs_open.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SimInput {
    clock: ClockSource,
    rate: f64,
    running: bool,
    stall: bool,
    fail_read_at: Option<usize>,
    shared: Arc<Mutex<Loopback>>,
    stats: Arc<RigStats>,
}

impl AnalogInput for SimInput {
    fn start(&mut self) -> Result<()> {
        if !self.running {
            self.running = true;
            self.stats.inputs_running.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn read(&mut self, n_samples: usize, timeout: Duration) -> Result<Vec<f64>> {
        let index = self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_read_at == Some(index) {
            return Err(RigError::DeviceFault(format!(
                "sim: injected fault on read {}",
                index
            )));
        }
        if !self.running {
            return Err(RigError::DeviceFault("sim: read on a stopped input task".into()));
        }
        let timed_out = RigError::AcquisitionTimeout {
            timeout,
            expected: n_samples,
        };
        if self.stall {
            thread::sleep(timeout);
            return Err(timed_out);
        }

        let (triggered_at, played, out_rate, attenuation_db) = {
            let lb = self.shared.lock();
            (lb.triggered_at, lb.played.clone(), lb.out_rate, lb.attenuation_db)
        };
        let triggered_at = triggered_at.ok_or(RigError::AcquisitionTimeout {
            timeout,
            expected: n_samples,
        })?;

        let window = Duration::from_secs_f64(n_samples as f64 / self.rate);
        if window > timeout {
            thread::sleep(timeout);
            return Err(timed_out);
        }
        let done_at = triggered_at + window;
        let now = Instant::now();
        if done_at > now {
            thread::sleep(done_at - now);
        }

        let att = db_to_gain(-attenuation_db);
        let ratio = out_rate / self.rate;
        Ok((0..n_samples)
            .map(|i| {
                let j = (i as f64 * ratio).round() as usize;
                played.get(j).copied().unwrap_or(0.0) * att
            })
            .collect())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            self.stats.inputs_running.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn clock_source(&self) -> ClockSource {
        self.clock.clone()
    }
}

impl Drop for SimInput {
    fn drop(&mut self) {
        let _ = self.stop();
        self.stats.inputs_open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Log a one-line description of the rig at startup.
pub fn announce(rig: &SimulatedRig) {
    info!(
        "Simulated rig: gain {:.3}, speaker low-pass {}",
        rig.gain,
        rig.lowpass_hz
            .map_or_else(|| "off".to_string(), |f| format!("{:.0} Hz", f))
    );
}
