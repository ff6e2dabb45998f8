//! Speaker calibration: per-frequency attenuation tables and the engine that
//! measures them.
//!
//! A calibration run plays a reference tone (`calf` at `caldb`) followed by a
//! frequency sweep. The reference response becomes the anchor `calpeak`;
//! every sweep trace at the reference intensity yields one table entry,
//! `attenuation = -20*log10(mean_peak / calpeak)`, i.e. the dB correction
//! that equalizes that frequency to the reference.

use crate::config::RigConfig;
use crate::data_sink::{Attrs, DataSink};
use crate::dsp::{calc_db, calc_spectrum, fft_peak_at, interp, rms_peak_equivalent};
use crate::error::{Result, RigError};
use crate::scheduler::{ResponseProcessor, RunContext, RunPlan};
use crate::stimulus::{ExpandedTest, Protocol, TestDef};
use crate::types::{Component, ResponseBuffer, RunEvent, TraceDoc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

pub const CALIBRATION_GROUP: &str = "calibration_test_1";

/// Marker stored in place of an FFT measurement with no matching bin.
pub const INVALID_MEASUREMENT: f64 = -1.0;

// ─── Calibration vector ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationVector {
    /// Ascending, Hz
    pub frequencies: Vec<f64>,
    /// dB correction at each frequency; NaN where the measurement failed
    pub attenuations: Vec<f64>,
    /// Range the table is valid over (Hz)
    pub frange: (f64, f64),
    /// Reference tone frequency (Hz)
    pub calf: f64,
    /// Reference tone intensity (dB SPL)
    pub caldb: f64,
    pub label: String,
}

impl CalibrationVector {
    pub fn new(
        mut points: Vec<(f64, f64)>,
        frange: (f64, f64),
        calf: f64,
        caldb: f64,
        label: impl Into<String>,
    ) -> Result<Self> {
        if points.is_empty() {
            return Err(RigError::InvalidConfiguration(
                "calibration vector needs at least one frequency".into(),
            ));
        }
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        let (frequencies, attenuations) = points.into_iter().unzip();
        Ok(Self {
            frequencies,
            attenuations,
            frange,
            calf,
            caldb,
            label: label.into(),
        })
    }

    /// Correction at `frequency`: linear interpolation over the valid
    /// entries, 0 dB outside `frange` or when nothing is valid.
    pub fn attenuation_at(&self, frequency: f64) -> f64 {
        let (lo, hi) = self.frange;
        if !(lo..=hi).contains(&frequency) {
            return 0.0;
        }
        let (xp, fp): (Vec<f64>, Vec<f64>) = self
            .frequencies
            .iter()
            .zip(&self.attenuations)
            .filter(|(_, a)| a.is_finite())
            .map(|(&f, &a)| (f, a))
            .unzip();
        if xp.is_empty() {
            return 0.0;
        }
        interp(frequency, &xp, &fp)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let vector: CalibrationVector = serde_json::from_str(&data)?;
        if vector.frequencies.len() != vector.attenuations.len() {
            return Err(RigError::InvalidConfiguration(format!(
                "{:?}: {} frequencies but {} attenuations",
                path,
                vector.frequencies.len(),
                vector.attenuations.len()
            )));
        }
        info!("Loaded calibration '{}' from {:?}", vector.label, path);
        Ok(vector)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Calibration saved to {:?}", path);
        Ok(())
    }
}

/// Session-wide holder for the active calibration. Runs take a snapshot at
/// setup; replacing the vector never disturbs a run already prepared.
#[derive(Clone, Default)]
pub struct CalibrationStore {
    current: Arc<RwLock<Option<Arc<CalibrationVector>>>>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Arc<CalibrationVector>> {
        self.current.read().clone()
    }

    pub fn replace(&self, vector: CalibrationVector) {
        info!(
            "Calibration '{}' active ({} frequencies)",
            vector.label,
            vector.frequencies.len()
        );
        *self.current.write() = Some(Arc::new(vector));
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

// ─── Calibration engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationMode {
    /// Spectral magnitude in the bin exactly at the tone frequency
    Fft,
    /// RMS scaled to a sinusoid's peak
    #[default]
    Rms,
}

/// Builds the protocol for a calibration run.
pub struct CalibrationRun;

impl CalibrationRun {
    /// Prepend a reference tone test (`calf` at `caldb`) matching the sweep's
    /// duration, rise/fall, repetition count and generation rate.
    pub fn protocol(sweep: &TestDef, config: &RigConfig) -> Result<Protocol> {
        let lead = sweep.components.first().ok_or_else(|| {
            RigError::InvalidConfiguration("calibration sweep has no components".into())
        })?;
        if lead.frequency().is_none() {
            return Err(RigError::InvalidConfiguration(format!(
                "calibration sweep must lead with a pure tone, got {}",
                lead.stim_type()
            )));
        }
        let mut reference = TestDef::new(
            vec![Component::tone(
                config.calf,
                config.caldb,
                lead.duration(),
                lead.risefall(),
            )],
            sweep.reps,
        );
        reference.samplerate = sweep.samplerate;
        reference.testtype = "Calibration Reference".into();
        Ok(Protocol::new(vec![reference, sweep.clone()]))
    }
}

/// Response processor for calibration runs.
pub struct CalibrationEngine {
    mode: CalibrationMode,
    calf: f64,
    caldb: f64,
    group: String,
    label: String,
    nreps: usize,
    calpeak: Option<f64>,
    /// Measurements of the trace in progress; None = invalid
    rep_peaks: Vec<Option<f64>>,
    /// Mean measurement per sweep trace, NaN where any rep was invalid
    sweep_means: Vec<f64>,
    sweep_index: usize,
    calibration_frequencies: Vec<f64>,
    calibration_indexes: Vec<usize>,
}

impl CalibrationEngine {
    pub fn new(config: &RigConfig, mode: CalibrationMode) -> Self {
        Self {
            mode,
            calf: config.calf,
            caldb: config.caldb,
            group: CALIBRATION_GROUP.to_string(),
            label: String::new(),
            nreps: 1,
            calpeak: None,
            rep_peaks: Vec::new(),
            sweep_means: Vec::new(),
            sweep_index: 0,
            calibration_frequencies: Vec::new(),
            calibration_indexes: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Turn the sweep into a calibration vector, then delete the provisional
    /// measurements from `sink`. Returns `(vector, label, calf)`.
    pub fn process_calibration(&mut self, sink: &mut dyn DataSink) -> Result<(CalibrationVector, String, f64)> {
        let calpeak = self.calpeak.unwrap_or(f64::NAN);
        let points: Vec<(f64, f64)> = self
            .calibration_indexes
            .iter()
            .zip(&self.calibration_frequencies)
            .map(|(&idx, &freq)| {
                let mean = self.sweep_means.get(idx).copied().unwrap_or(f64::NAN);
                let attenuation = -(calc_db(mean, self.caldb, calpeak) - self.caldb);
                (freq, attenuation)
            })
            .collect();
        info!(
            "Calibration frequencies {:?} -> attenuations {:?}",
            points.iter().map(|p| p.0).collect::<Vec<_>>(),
            points.iter().map(|p| p.1).collect::<Vec<_>>()
        );

        if sink.groups().iter().any(|g| g == &self.group) {
            sink.delete_group(&self.group)?;
        }

        let lo = points.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
        let hi = points.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
        let vector = CalibrationVector::new(points, (lo, hi), self.calf, self.caldb, self.label.clone())?;
        Ok((vector, self.label.clone(), self.calf))
    }

    fn measure(&self, response: &ResponseBuffer, frequency: f64) -> (Vec<f64>, Vec<f64>, f64, f64) {
        let (freqs, spectrum) = calc_spectrum(&response.samples, response.samplerate);
        let peak_fft = match fft_peak_at(&freqs, &spectrum, frequency) {
            Ok(v) => v,
            Err(e) => {
                warn!("{} (test {}, rep {})", e, response.test + 1, response.rep + 1);
                INVALID_MEASUREMENT
            }
        };
        let vmax = rms_peak_equivalent(&response.samples);
        (freqs, spectrum, peak_fft, vmax)
    }
}

impl ResponseProcessor for CalibrationEngine {
    fn initialize_run(&mut self, plan: &RunPlan<'_>, ctx: &mut RunContext<'_>) -> Result<()> {
        self.calpeak = None;
        self.rep_peaks.clear();
        self.sweep_means.clear();
        self.sweep_index = 0;
        self.calibration_frequencies.clear();
        self.calibration_indexes.clear();

        let traces: usize = plan.tests.iter().map(|t| t.traces.len()).sum();
        let reps = plan.tests.iter().map(|t| t.reps).max().unwrap_or(1);
        let dims = [traces.saturating_sub(1), reps];

        if ctx.sink.groups().iter().any(|g| g == &self.group) {
            warn!("Discarding stale provisional data in {}", self.group);
            ctx.sink.delete_group(&self.group)?;
        }
        ctx.sink.init_group(&self.group, "calibration")?;
        ctx.sink.init_data(&self.group, "calibration", &dims, Some("fft_peaks"))?;
        ctx.sink.init_data(&self.group, "calibration", &dims, Some("vmax"))?;
        let attrs: Attrs = json!({ "samplerate_ad": plan.aisr, "mode": format!("{:?}", self.mode) })
            .as_object()
            .cloned()
            .unwrap_or_default();
        ctx.sink.set_metadata(&self.group, &attrs, false)?;
        info!("Calibration dataset {} ({:?} mode)", self.group, self.mode);
        Ok(())
    }

    fn initialize_test(&mut self, _index: usize, test: &ExpandedTest, _ctx: &mut RunContext<'_>) -> Result<()> {
        self.nreps = test.reps;
        self.rep_peaks.clear();
        Ok(())
    }

    fn process_response(
        &mut self,
        response: &ResponseBuffer,
        doc: &TraceDoc,
        ctx: &mut RunContext<'_>,
    ) -> Result<()> {
        let Some(lead) = doc.lead_component() else {
            return Ok(());
        };
        let Some(frequency) = lead.frequency() else {
            debug!("Skipping {} trace in calibration run", lead.stim_type());
            return Ok(());
        };
        let intensity = lead.intensity();
        let is_reference = self.calpeak.is_none() && frequency == self.calf && intensity == self.caldb;

        if response.rep == 0 {
            self.rep_peaks.clear();
            if !is_reference && intensity == self.caldb {
                self.calibration_frequencies.push(frequency);
                self.calibration_indexes.push(self.sweep_index);
            }
        }

        let (freqs, spectrum, peak_fft, vmax) = self.measure(response, frequency);

        if !is_reference {
            ctx.sink.append(&self.group, &[peak_fft], Some("fft_peaks"))?;
            ctx.sink.append(&self.group, &[vmax], Some("vmax"))?;
            ctx.sink.append_trace_info(&self.group, doc)?;
        }
        ctx.events.emit(RunEvent::ResponseCollected {
            times: ctx.response_times.clone(),
            response: Arc::new(response.samples.clone()),
        });
        ctx.events.emit(RunEvent::CalibrationResponse {
            frequency,
            intensity,
            spectrum: Arc::new(spectrum),
            freqs: Arc::new(freqs),
            peak_fft,
            vmax,
        });

        self.rep_peaks.push(match self.mode {
            CalibrationMode::Fft if peak_fft == INVALID_MEASUREMENT => None,
            CalibrationMode::Fft => Some(peak_fft),
            CalibrationMode::Rms => Some(vmax),
        });

        if response.rep + 1 == self.nreps {
            let mean = trace_mean(&self.rep_peaks);
            if is_reference {
                info!("Reference {} Hz @ {} dB: peak {:.6}", frequency, intensity, mean);
                self.calpeak = Some(mean);
            } else {
                let db = calc_db(mean, self.caldb, self.calpeak.unwrap_or(f64::NAN));
                debug!("{} Hz @ {} dB -> {:.2} dB", frequency, intensity, db);
                ctx.events.emit(RunEvent::AverageResponse {
                    frequency,
                    intensity,
                    db,
                });
                self.sweep_means.push(mean);
                self.sweep_index += 1;
            }
        }
        Ok(())
    }

    fn group(&self) -> Option<&str> {
        Some(&self.group)
    }
}

/// Mean of the repetitions, or NaN if any repetition was invalid.
fn trace_mean(peaks: &[Option<f64>]) -> f64 {
    if peaks.is_empty() {
        return f64::NAN;
    }
    let mut sum = 0.0;
    for p in peaks {
        match p {
            Some(v) => sum += v.abs(),
            None => return f64::NAN,
        }
    }
    sum / peaks.len() as f64
}
