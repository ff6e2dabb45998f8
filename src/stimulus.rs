//! Protocol definitions and their expansion into playable traces.
//!
//! A test is a list of components plus optional auto-parameters. Each
//! combination of auto-parameter values becomes one trace; the first
//! parameter varies fastest unless the test asks for a random order.
//! Expansion does all waveform math up front
//! (synthesis, calibration correction, overload clipping) so the timed loop
//! only has to play buffers.

use crate::calibration::CalibrationVector;
use crate::config::RigConfig;
use crate::dsp::{apply_risefall, db_to_gain, make_tone, max_abs, DB_FACTOR};
use crate::error::{Result, RigError};
use crate::types::{Component, ComponentDoc, StimulusTrace, TraceDoc};
use hound::{SampleFormat, WavReader};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_GENRATE: f64 = 500_000.0;

fn default_reps() -> usize {
    1
}

fn default_genrate() -> f64 {
    DEFAULT_GENRATE
}

/// Steps one component parameter across a range, inclusive of `stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoParameter {
    /// "frequency", "intensity", "duration" or "risefall"
    pub parameter: String,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    /// Component indexes the parameter applies to; empty means component 0
    #[serde(default)]
    pub selection: Vec<usize>,
}

impl AutoParameter {
    pub fn values(&self) -> Result<Vec<f64>> {
        if self.start == self.stop {
            return Ok(vec![self.start]);
        }
        let span = self.stop - self.start;
        if self.step == 0.0 || !self.step.is_finite() || span.signum() != self.step.signum() {
            return Err(RigError::InvalidConfiguration(format!(
                "auto parameter '{}' cannot step from {} to {} by {}",
                self.parameter, self.start, self.stop, self.step
            )));
        }
        let n = (span / self.step + 1e-9).floor() as usize + 1;
        Ok((0..n).map(|i| self.start + i as f64 * self.step).collect())
    }

    fn targets(&self) -> Vec<usize> {
        if self.selection.is_empty() {
            vec![0]
        } else {
            self.selection.clone()
        }
    }
}

/// Playback order of a test's traces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceOrder {
    #[default]
    Ordered,
    /// Shuffled once per setup
    Random,
}

/// One test as written in a protocol file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDef {
    pub components: Vec<Component>,
    #[serde(default)]
    pub auto_parameters: Vec<AutoParameter>,
    #[serde(default = "default_reps")]
    pub reps: usize,
    /// Output generation rate (Hz)
    #[serde(default = "default_genrate")]
    pub samplerate: f64,
    #[serde(default)]
    pub user_tag: String,
    #[serde(default)]
    pub testtype: String,
    #[serde(default)]
    pub order: TraceOrder,
}

impl TestDef {
    pub fn new(components: Vec<Component>, reps: usize) -> Self {
        Self {
            components,
            auto_parameters: Vec::new(),
            reps,
            samplerate: DEFAULT_GENRATE,
            user_tag: String::new(),
            testtype: String::new(),
            order: TraceOrder::Ordered,
        }
    }

    pub fn with_order(mut self, order: TraceOrder) -> Self {
        self.order = order;
        self
    }

    /// Component lists in playback order.
    pub fn ordered_component_sets<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<Vec<Component>>> {
        let mut sets = self.component_sets()?;
        if self.order == TraceOrder::Random {
            sets.shuffle(rng);
        }
        Ok(sets)
    }

    pub fn with_auto_parameter(mut self, param: AutoParameter) -> Self {
        self.auto_parameters.push(param);
        self
    }

    pub fn trace_count(&self) -> Result<usize> {
        let mut n = 1;
        for p in &self.auto_parameters {
            n *= p.values()?.len();
        }
        Ok(n)
    }

    /// Component lists for every trace, first auto-parameter fastest.
    pub fn component_sets(&self) -> Result<Vec<Vec<Component>>> {
        let ranges = self
            .auto_parameters
            .iter()
            .map(|p| p.values())
            .collect::<Result<Vec<_>>>()?;
        let total: usize = ranges.iter().map(|r| r.len()).product();
        let mut sets = Vec::with_capacity(total);
        for itrace in 0..total {
            let mut components = self.components.clone();
            let mut prevlen = 1;
            for (param, values) in self.auto_parameters.iter().zip(&ranges) {
                let value = values[(itrace / prevlen) % values.len()];
                for idx in param.targets() {
                    let comp = components.get_mut(idx).ok_or_else(|| {
                        RigError::InvalidConfiguration(format!(
                            "auto parameter '{}' selects missing component {}",
                            param.parameter, idx
                        ))
                    })?;
                    set_parameter(comp, &param.parameter, value)?;
                }
                prevlen *= values.len();
            }
            sets.push(components);
        }
        Ok(sets)
    }
}

fn set_parameter(component: &mut Component, parameter: &str, value: f64) -> Result<()> {
    let slot = match (component, parameter) {
        (Component::PureTone { frequency, .. }, "frequency") => frequency,
        (Component::PureTone { intensity, .. }, "intensity")
        | (Component::Silence { intensity, .. }, "intensity")
        | (Component::Vocalization { intensity, .. }, "intensity") => intensity,
        (Component::PureTone { duration, .. }, "duration")
        | (Component::Silence { duration, .. }, "duration") => duration,
        (Component::PureTone { risefall, .. }, "risefall")
        | (Component::Silence { risefall, .. }, "risefall")
        | (Component::Vocalization { risefall, .. }, "risefall") => risefall,
        (c, p) => {
            return Err(RigError::InvalidConfiguration(format!(
                "{} has no adjustable parameter '{}'",
                c.stim_type(),
                p
            )))
        }
    };
    *slot = value;
    Ok(())
}

/// An ordered list of tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub tests: Vec<TestDef>,
}

impl Protocol {
    pub fn new(tests: Vec<TestDef>) -> Self {
        Self { tests }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let protocol: Protocol = serde_json::from_str(&data)?;
        info!("Loaded protocol {:?}: {} tests", path, protocol.tests.len());
        Ok(protocol)
    }
}

/// A test after expansion: every trace is ready to play.
#[derive(Debug, Clone)]
pub struct ExpandedTest {
    pub traces: Vec<StimulusTrace>,
    pub reps: usize,
    pub samplerate: f64,
    pub user_tag: String,
    pub testtype: String,
    pub caldb: f64,
    pub calv: f64,
}

impl ExpandedTest {
    /// Overload attenuation of each trace (0 where the waveform fit).
    pub fn overloads(&self) -> Vec<f64> {
        self.traces.iter().map(|t| t.overloaded_attenuation()).collect()
    }

    /// Metadata attached to the test's dataset.
    pub fn test_doc(&self) -> Map<String, Value> {
        let doc = json!({
            "user_tag": self.user_tag,
            "testtype": self.testtype,
            "reps": self.reps,
            "calv": self.calv,
            "caldb": self.caldb,
        });
        match doc {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// Turns test definitions into waveforms using the rig's reference voltage,
/// output limits and (optionally) a calibration vector.
pub struct StimulusExpander {
    caldb: f64,
    calv: f64,
    max_voltage: f64,
    min_voltage: f64,
    use_attenuator: bool,
    calibration: Option<Arc<CalibrationVector>>,
}

impl StimulusExpander {
    pub fn new(config: &RigConfig) -> Self {
        Self {
            caldb: config.caldb,
            calv: config.calv,
            max_voltage: config.max_voltage,
            min_voltage: config.min_voltage,
            use_attenuator: config.use_attenuator,
            calibration: None,
        }
    }

    pub fn with_calibration(mut self, calibration: Option<Arc<CalibrationVector>>) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn expand_protocol(&self, protocol: &Protocol) -> Result<Vec<ExpandedTest>> {
        if protocol.tests.is_empty() {
            return Err(RigError::InvalidConfiguration("protocol has no tests".into()));
        }
        protocol.tests.iter().map(|t| self.expand_test(t)).collect()
    }

    pub fn expand_test(&self, test: &TestDef) -> Result<ExpandedTest> {
        if test.reps == 0 {
            return Err(RigError::InvalidConfiguration(
                "test repetition count must be at least 1".into(),
            ));
        }
        if !(test.samplerate.is_finite() && test.samplerate > 0.0) {
            return Err(RigError::InvalidConfiguration(format!(
                "generation rate must be positive, got {}",
                test.samplerate
            )));
        }
        if test.components.is_empty() {
            return Err(RigError::InvalidConfiguration("test has no components".into()));
        }

        let traces = test
            .ordered_component_sets(&mut rand::thread_rng())?
            .into_iter()
            .map(|components| self.build_trace(components, test))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "Expanded test '{}' into {} traces ({:?})",
            test.testtype,
            traces.len(),
            test.order
        );

        Ok(ExpandedTest {
            traces,
            reps: test.reps,
            samplerate: test.samplerate,
            user_tag: test.user_tag.clone(),
            testtype: test.testtype.clone(),
            caldb: self.caldb,
            calv: self.calv,
        })
    }

    fn build_trace(&self, components: Vec<Component>, test: &TestDef) -> Result<StimulusTrace> {
        let fs = test.samplerate;
        let mut signal = Vec::new();
        let mut docs = Vec::with_capacity(components.len());

        for mut component in components {
            let start_s = signal.len() as f64 / fs;
            let chunk = self.synthesize(&mut component, fs)?;
            signal.extend_from_slice(&chunk);
            docs.push(ComponentDoc { start_s, component });
        }

        if signal.is_empty() {
            return Err(RigError::InvalidWaveform(
                "trace components produce no samples".into(),
            ));
        }

        let (overloaded_attenuation, attenuation) = self.fit_output_range(&mut signal);

        Ok(StimulusTrace {
            signal: Arc::new(signal),
            samplerate: fs,
            attenuation,
            doc: TraceDoc {
                samplerate_da: fs,
                components: docs,
                overloaded_attenuation,
                time_stamps: Vec::new(),
                testtype: test.testtype.clone(),
                user_tag: test.user_tag.clone(),
            },
        })
    }

    fn synthesize(&self, component: &mut Component, fs: f64) -> Result<Vec<f64>> {
        match component {
            Component::PureTone {
                frequency,
                intensity,
                duration,
                risefall,
            } => {
                if *frequency > fs / 2.0 {
                    warn!(
                        "Tone at {} Hz is above Nyquist for generation rate {} Hz",
                        frequency, fs
                    );
                }
                let correction = self
                    .calibration
                    .as_ref()
                    .map_or(0.0, |cal| cal.attenuation_at(*frequency));
                Ok(make_tone(
                    *frequency,
                    *intensity + correction,
                    *duration,
                    *risefall,
                    fs,
                    self.caldb,
                    self.calv,
                ))
            }
            Component::Silence { duration, .. } => {
                Ok(vec![0.0; (*duration * fs).round().max(0.0) as usize])
            }
            Component::Vocalization {
                filename,
                intensity,
                duration,
                risefall,
            } => {
                let mut wav = read_wav_mono(filename, fs)?;
                let peak = max_abs(&wav);
                if peak > 0.0 {
                    let amp = db_to_gain(*intensity - self.caldb) * self.calv;
                    wav.iter_mut().for_each(|s| *s *= amp / peak);
                }
                apply_risefall(&mut wav, *risefall, fs);
                *duration = wav.len() as f64 / fs;
                Ok(wav)
            }
        }
    }

    /// Clip-correct the waveform in place. Returns
    /// `(overloaded_attenuation, output_attenuation)`.
    fn fit_output_range(&self, signal: &mut [f64]) -> (f64, f64) {
        let peak = max_abs(signal);
        if peak > self.max_voltage {
            let over = peak / self.max_voltage;
            signal.iter_mut().for_each(|s| *s /= over);
            let overloaded = DB_FACTOR * over.log10();
            warn!(
                "Output peak {:.2} V exceeds {:.2} V; scaled down by {:.2} dB",
                peak, self.max_voltage, overloaded
            );
            return (overloaded, 0.0);
        }
        if self.use_attenuator && peak > 0.0 && peak < self.min_voltage {
            // Boost into the DAC's useful range and take the difference back
            // out on the attenuator.
            let boost = self.min_voltage / peak;
            signal.iter_mut().for_each(|s| *s *= boost);
            return (0.0, DB_FACTOR * boost.log10());
        }
        (0.0, 0.0)
    }
}

/// Read a WAV file as mono f64, linearly resampled to `target_rate`.
fn read_wav_mono(path: &Path, target_rate: f64) -> Result<Vec<f64>> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f64> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(f64::from)
            .collect(),
        SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f64;
            reader
                .into_samples::<i32>()
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .map(|s| s as f64 / max)
                .collect()
        }
    };

    let mono: Vec<f64> = if channels == 1 {
        samples
    } else {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f64>() / channels as f64)
            .collect()
    };

    let source_rate = spec.sample_rate as f64;
    if (source_rate - target_rate).abs() < f64::EPSILON || mono.len() < 2 {
        return Ok(mono);
    }
    debug!(
        "Resampling {:?} from {} Hz to {} Hz",
        path.file_name().unwrap_or_default(),
        source_rate,
        target_rate
    );
    let out_len = ((mono.len() as f64) * target_rate / source_rate).round() as usize;
    let step = source_rate / target_rate;
    Ok((0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let i0 = (pos.floor() as usize).min(mono.len() - 1);
            let i1 = (i0 + 1).min(mono.len() - 1);
            let frac = pos - i0 as f64;
            mono[i0] * (1.0 - frac) + mono[i1] * frac
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expander() -> StimulusExpander {
        StimulusExpander::new(&RigConfig::default())
    }

    #[test]
    fn test_auto_parameter_values_inclusive() {
        let p = AutoParameter {
            parameter: "duration".into(),
            start: 0.065,
            stop: 0.165,
            step: 0.010,
            selection: vec![],
        };
        let v = p.values().unwrap();
        assert_eq!(v.len(), 11);
        assert!((v[10] - 0.165).abs() < 1e-12);
    }

    #[test]
    fn test_auto_parameter_bad_step() {
        let p = AutoParameter {
            parameter: "frequency".into(),
            start: 1000.0,
            stop: 2000.0,
            step: -100.0,
            selection: vec![],
        };
        assert!(p.values().is_err());
    }

    fn frequency_sweep(order: TraceOrder) -> TestDef {
        TestDef::new(vec![Component::tone(1000.0, 60.0, 0.005, 0.0)], 1)
            .with_auto_parameter(AutoParameter {
                parameter: "frequency".into(),
                start: 1000.0,
                stop: 20_000.0,
                step: 1000.0,
                selection: vec![],
            })
            .with_order(order)
    }

    fn sorted(mut v: Vec<f64>) -> Vec<f64> {
        v.sort_by(|a, b| a.total_cmp(b));
        v
    }

    #[test]
    fn test_random_order_is_a_permutation() {
        use rand::SeedableRng;
        let ordered: Vec<f64> = frequency_sweep(TraceOrder::Ordered)
            .component_sets()
            .unwrap()
            .iter()
            .map(|c| c[0].frequency().unwrap())
            .collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let shuffled: Vec<f64> = frequency_sweep(TraceOrder::Random)
            .ordered_component_sets(&mut rng)
            .unwrap()
            .iter()
            .map(|c| c[0].frequency().unwrap())
            .collect();
        assert_eq!(shuffled.len(), 20);
        assert_ne!(shuffled, ordered);
        assert_eq!(sorted(shuffled), ordered);

        // ordered tests ignore the generator
        let same: Vec<f64> = frequency_sweep(TraceOrder::Ordered)
            .ordered_component_sets(&mut rng)
            .unwrap()
            .iter()
            .map(|c| c[0].frequency().unwrap())
            .collect();
        assert_eq!(same, ordered);
    }

    #[test]
    fn test_expand_random_order_plays_every_trace() {
        let expanded = expander().expand_test(&frequency_sweep(TraceOrder::Random)).unwrap();
        let freqs: Vec<f64> = expanded
            .traces
            .iter()
            .map(|t| t.doc.lead_component().and_then(|c| c.frequency()).unwrap())
            .collect();
        let expected: Vec<f64> = (1..=20).map(|k| k as f64 * 1000.0).collect();
        assert_eq!(sorted(freqs), expected);
    }

    #[test]
    fn test_order_parses_from_protocol_json() {
        let test: TestDef = serde_json::from_str(
            r#"{"components": [{"stim_type": "silence", "duration": 0.01}], "order": "random"}"#,
        )
        .unwrap();
        assert_eq!(test.order, TraceOrder::Random);
        let plain: TestDef = serde_json::from_str(
            r#"{"components": [{"stim_type": "silence", "duration": 0.01}]}"#,
        )
        .unwrap();
        assert_eq!(plain.order, TraceOrder::Ordered);
    }

    #[test]
    fn test_first_parameter_varies_fastest() {
        let test = TestDef::new(vec![Component::tone(1000.0, 60.0, 0.01, 0.0)], 1)
            .with_auto_parameter(AutoParameter {
                parameter: "frequency".into(),
                start: 1000.0,
                stop: 3000.0,
                step: 1000.0,
                selection: vec![],
            })
            .with_auto_parameter(AutoParameter {
                parameter: "intensity".into(),
                start: 40.0,
                stop: 60.0,
                step: 20.0,
                selection: vec![],
            });
        let sets = test.component_sets().unwrap();
        assert_eq!(sets.len(), 6);
        let pairs: Vec<(f64, f64)> = sets
            .iter()
            .map(|c| (c[0].frequency().unwrap(), c[0].intensity()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (1000.0, 40.0),
                (2000.0, 40.0),
                (3000.0, 40.0),
                (1000.0, 60.0),
                (2000.0, 60.0),
                (3000.0, 60.0)
            ]
        );
    }

    #[test]
    fn test_expand_concatenates_components() {
        let test = TestDef::new(
            vec![Component::silence(0.01), Component::tone(5000.0, 70.0, 0.02, 0.002)],
            3,
        );
        let expanded = expander().expand_test(&test).unwrap();
        assert_eq!(expanded.traces.len(), 1);
        let trace = &expanded.traces[0];
        assert_eq!(trace.signal.len(), 15_000);
        assert_eq!(trace.doc.components.len(), 2);
        assert!((trace.doc.components[1].start_s - 0.01).abs() < 1e-12);
        assert_eq!(trace.doc.overloaded_attenuation, 0.0);
        assert_eq!(trace.attenuation, 0.0);
        assert_eq!(trace.doc.samplerate_da, DEFAULT_GENRATE);
    }

    #[test]
    fn test_overload_scales_into_range() {
        // 180 dB re 100 dB @ 0.1 V is 1000 V peak
        let test = TestDef::new(vec![Component::tone(5000.0, 180.0, 0.01, 0.0)], 1);
        let expanded = expander().expand_test(&test).unwrap();
        let trace = &expanded.traces[0];
        assert!(trace.doc.overloaded_attenuation > 0.0);
        assert!((trace.doc.overloaded_attenuation - 40.0).abs() < 0.01);
        assert!(max_abs(&trace.signal) <= 10.0 + 1e-9);
        assert_eq!(expanded.overloads(), vec![trace.doc.overloaded_attenuation]);
    }

    #[test]
    fn test_calibration_corrects_tone_level() {
        let cal = CalibrationVector::new(
            vec![(4000.0, 6.0), (8000.0, -6.0)],
            (4000.0, 8000.0),
            15_000.0,
            100.0,
            "booth",
        )
        .unwrap();
        let test = TestDef::new(vec![Component::tone(4000.0, 100.0, 0.01, 0.0)], 1)
            .with_auto_parameter(AutoParameter {
                parameter: "frequency".into(),
                start: 4000.0,
                stop: 12_000.0,
                step: 4000.0,
                selection: vec![],
            });
        let expanded = expander()
            .with_calibration(Some(Arc::new(cal)))
            .expand_test(&test)
            .unwrap();
        let peaks: Vec<f64> = expanded.traces.iter().map(|t| max_abs(&t.signal)).collect();
        // 4 kHz gets +6 dB, 8 kHz -6 dB, 12 kHz is outside the table
        assert!((peaks[0] - 0.1 * db_to_gain(6.0)).abs() < 1e-3);
        assert!((peaks[1] - 0.1 * db_to_gain(-6.0)).abs() < 1e-3);
        assert!((peaks[2] - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_attenuator_boosts_quiet_signals() {
        let cfg = RigConfig {
            use_attenuator: true,
            ..RigConfig::default()
        };
        // 20 dB SPL -> 0.1 V * 1e-4 = 1e-5 V peak, far below 5 mV
        let test = TestDef::new(vec![Component::tone(5000.0, 20.0, 0.01, 0.0)], 1);
        let trace = &StimulusExpander::new(&cfg).expand_test(&test).unwrap().traces[0];
        assert!(trace.attenuation > 0.0);
        assert!((max_abs(&trace.signal) - cfg.min_voltage).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_zero_reps() {
        let test = TestDef::new(vec![Component::tone(5000.0, 60.0, 0.01, 0.0)], 0);
        assert!(matches!(
            expander().expand_test(&test),
            Err(RigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_rejects_empty_waveform() {
        let test = TestDef::new(vec![Component::silence(0.0)], 1);
        assert!(matches!(
            expander().expand_test(&test),
            Err(RigError::InvalidWaveform(_))
        ));
    }

    #[test]
    fn test_vocalization_from_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 250_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..2500 {
            let s = (i as f64 * 0.05).sin() * 0.5 * i16::MAX as f64;
            writer.write_sample(s as i16).unwrap();
        }
        writer.finalize().unwrap();

        let test = TestDef::new(
            vec![Component::Vocalization {
                filename: path,
                intensity: 100.0,
                duration: 0.0,
                risefall: 0.0,
            }],
            1,
        );
        let trace = &expander().expand_test(&test).unwrap().traces[0];
        // resampled 250k -> 500k doubles the sample count
        assert_eq!(trace.signal.len(), 5000);
        assert!((trace.doc.components[0].component.duration() - 0.01).abs() < 1e-9);
        // 100 dB is the reference intensity, so the peak lands on calv
        assert!((max_abs(&trace.signal) - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_protocol_json_roundtrip() {
        let protocol = Protocol::new(vec![TestDef::new(
            vec![Component::tone(15_000.0, 70.0, 0.02, 0.0025)],
            4,
        )]);
        let json = serde_json::to_string(&protocol).unwrap();
        let back: Protocol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, protocol);
    }
}
