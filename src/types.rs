use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

// ─── Stimulus components ────────────────────────────────────────────────────

/// One piece of a stimulus waveform. Serializes with a `stim_type` tag so the
/// persisted trace document is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stim_type")]
pub enum Component {
    #[serde(rename = "Pure Tone")]
    PureTone {
        /// Hz
        frequency: f64,
        /// dB SPL
        intensity: f64,
        /// seconds
        duration: f64,
        /// Linear ramp at each end (seconds)
        risefall: f64,
    },
    #[serde(rename = "silence")]
    Silence {
        duration: f64,
        #[serde(default)]
        intensity: f64,
        #[serde(default)]
        risefall: f64,
    },
    /// Recorded call played from a WAV file, normalized to `intensity`.
    #[serde(rename = "Vocalization")]
    Vocalization {
        filename: PathBuf,
        intensity: f64,
        /// Filled in from the file at expansion time
        #[serde(default)]
        duration: f64,
        #[serde(default)]
        risefall: f64,
    },
}

impl Component {
    pub fn tone(frequency: f64, intensity: f64, duration: f64, risefall: f64) -> Self {
        Component::PureTone {
            frequency,
            intensity,
            duration,
            risefall,
        }
    }

    pub fn silence(duration: f64) -> Self {
        Component::Silence {
            duration,
            intensity: 0.0,
            risefall: 0.0,
        }
    }

    pub fn frequency(&self) -> Option<f64> {
        match self {
            Component::PureTone { frequency, .. } => Some(*frequency),
            _ => None,
        }
    }

    pub fn intensity(&self) -> f64 {
        match self {
            Component::PureTone { intensity, .. }
            | Component::Silence { intensity, .. }
            | Component::Vocalization { intensity, .. } => *intensity,
        }
    }

    pub fn duration(&self) -> f64 {
        match self {
            Component::PureTone { duration, .. }
            | Component::Silence { duration, .. }
            | Component::Vocalization { duration, .. } => *duration,
        }
    }

    pub fn risefall(&self) -> f64 {
        match self {
            Component::PureTone { risefall, .. }
            | Component::Silence { risefall, .. }
            | Component::Vocalization { risefall, .. } => *risefall,
        }
    }

    pub fn stim_type(&self) -> &'static str {
        match self {
            Component::PureTone { .. } => "Pure Tone",
            Component::Silence { .. } => "silence",
            Component::Vocalization { .. } => "Vocalization",
        }
    }
}

/// A component as it was actually placed in a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDoc {
    /// Offset of the component within the trace (seconds)
    pub start_s: f64,
    #[serde(flatten)]
    pub component: Component,
}

// ─── Trace metadata ─────────────────────────────────────────────────────────

/// Metadata document persisted once per trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceDoc {
    pub samplerate_da: f64,
    pub components: Vec<ComponentDoc>,
    /// dB the waveform was scaled down to stay inside the output range (0 = none)
    pub overloaded_attenuation: f64,
    /// Wall-clock seconds of each repetition, filled in by the scheduler
    #[serde(default)]
    pub time_stamps: Vec<f64>,
    #[serde(default)]
    pub testtype: String,
    #[serde(default)]
    pub user_tag: String,
}

impl TraceDoc {
    /// Document for the zero-length silence window played before a test.
    pub fn silence_window(samplerate_da: f64) -> Self {
        Self {
            samplerate_da,
            components: vec![ComponentDoc {
                start_s: 0.0,
                component: Component::silence(0.0),
            }],
            overloaded_attenuation: 0.0,
            time_stamps: Vec::new(),
            testtype: String::new(),
            user_tag: String::new(),
        }
    }

    /// First component, which for calibration traces is the only one.
    pub fn lead_component(&self) -> Option<&Component> {
        self.components.first().map(|c| &c.component)
    }
}

// ─── Expanded stimulus ──────────────────────────────────────────────────────

/// One waveform condition ready to play: immutable once handed to the scheduler.
#[derive(Debug, Clone)]
pub struct StimulusTrace {
    /// Output samples in volts
    pub signal: Arc<Vec<f64>>,
    /// Output sample rate (Hz)
    pub samplerate: f64,
    /// Attenuation to apply on output (dB, >= 0)
    pub attenuation: f64,
    pub doc: TraceDoc,
}

impl StimulusTrace {
    pub fn overloaded_attenuation(&self) -> f64 {
        self.doc.overloaded_attenuation
    }
}

/// Response acquired during one repetition.
#[derive(Debug, Clone)]
pub struct ResponseBuffer {
    pub samples: Vec<f64>,
    /// Input sample rate (Hz)
    pub samplerate: f64,
    pub test: usize,
    /// None for the silence window
    pub trace: Option<usize>,
    pub rep: usize,
}

// ─── Cycle position ─────────────────────────────────────────────────────────

/// Where in a protocol a cycle sits. Displayed 1-indexed, with the silence
/// window (or "no trace started yet") reported as trace 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CyclePosition {
    pub test: usize,
    pub trace: Option<usize>,
    pub rep: usize,
}

impl fmt::Display for CyclePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "test {}, trace {}, rep {}",
            self.test + 1,
            self.trace.map_or(0, |t| t + 1),
            self.rep + 1
        )
    }
}

// ─── Run events ─────────────────────────────────────────────────────────────

/// Progress notifications emitted by a run, in cycle order.
#[derive(Debug, Clone)]
pub enum RunEvent {
    StimGenerated {
        signal: Arc<Vec<f64>>,
        samplerate: f64,
    },
    CurrentTrace {
        test: usize,
        trace: Option<usize>,
        doc: TraceDoc,
    },
    CurrentRep {
        rep: usize,
    },
    OverVoltage {
        overloaded_attenuation: f64,
    },
    /// Emitted exactly once when a run ends, whatever the outcome.
    GroupFinished {
        halted: bool,
    },
    ResponseCollected {
        times: Arc<Vec<f64>>,
        response: Arc<Vec<f64>>,
    },
    CalibrationResponse {
        frequency: f64,
        intensity: f64,
        spectrum: Arc<Vec<f64>>,
        freqs: Arc<Vec<f64>>,
        peak_fft: f64,
        vmax: f64,
    },
    AverageResponse {
        frequency: f64,
        intensity: f64,
        db: f64,
    },
    RunFailed {
        at: CyclePosition,
        message: String,
    },
}

/// Fans run events out to every subscriber. Sends never block; a subscriber
/// that hung up is skipped.
#[derive(Clone, Default)]
pub struct EventBus {
    txs: Vec<Sender<RunEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { txs: Vec::new() }
    }

    pub fn subscribe(&mut self) -> Receiver<RunEvent> {
        let (tx, rx) = unbounded();
        self.txs.push(tx);
        rx
    }

    pub fn emit(&self, event: RunEvent) {
        for tx in &self.txs {
            let _ = tx.send(event.clone());
        }
    }
}

// ─── Session clock ──────────────────────────────────────────────────────────

/// Monotonic clock anchored to wall-clock time at session start, so that
/// differences between stamps never jump with system clock adjustments.
#[derive(Clone)]
pub struct SessionClock {
    start: Instant,
    start_epoch_secs: f64,
}

impl SessionClock {
    pub fn new() -> Self {
        let start_epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            start: Instant::now(),
            start_epoch_secs,
        }
    }

    /// Seconds since the Unix epoch.
    pub fn now_secs(&self) -> f64 {
        self.start_epoch_secs + self.start.elapsed().as_secs_f64()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
