//! Timed generate/acquire loop.
//!
//! A run walks test → trace → repetition on a fixed-interval clock. Each
//! repetition plays one pre-expanded trace through the [`Player`], hands the
//! response to an injected [`ResponseProcessor`], and reports progress on the
//! [`EventBus`]. The loop runs on its own thread; the caller keeps a
//! [`RunHandle`] to halt, poll and join it.
//!
//! Halting is cooperative: the flag is checked once per repetition, after the
//! interval wait and before the next device cycle. An in-flight acquisition
//! is never interrupted, so halt latency is bounded by the acquisition
//! timeout.

use crate::calibration::CalibrationVector;
use crate::config::RigConfig;
use crate::data_sink::{Attrs, DataSink};
use crate::error::{Result, RigError};
use crate::player::Player;
use crate::stimulus::{ExpandedTest, Protocol, StimulusExpander};
use crate::types::{
    CyclePosition, EventBus, ResponseBuffer, RunEvent, SessionClock, StimulusTrace, TraceDoc,
};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ─── Response processing seam ───────────────────────────────────────────────

/// What a run is about to play, handed to the processor before the first cycle.
pub struct RunPlan<'a> {
    pub tests: &'a [ExpandedTest],
    pub silence_window: bool,
    /// Input sample rate (Hz)
    pub aisr: f64,
    pub window_samples: usize,
}

/// Collaborators a processor may use while handling a response.
pub struct RunContext<'a> {
    pub sink: &'a mut dyn DataSink,
    pub events: &'a EventBus,
    /// Time axis of one response window (seconds)
    pub response_times: &'a Arc<Vec<f64>>,
}

/// Per-run strategy: what happens to each acquired response.
pub trait ResponseProcessor: Send + 'static {
    fn initialize_run(&mut self, _plan: &RunPlan<'_>, _ctx: &mut RunContext<'_>) -> Result<()> {
        Ok(())
    }

    fn initialize_test(&mut self, _index: usize, _test: &ExpandedTest, _ctx: &mut RunContext<'_>) -> Result<()> {
        Ok(())
    }

    fn process_response(
        &mut self,
        response: &ResponseBuffer,
        doc: &TraceDoc,
        ctx: &mut RunContext<'_>,
    ) -> Result<()>;

    /// Group the run writes into; run-level annotations land here.
    fn group(&self) -> Option<&str> {
        None
    }

    /// Dataset of the current test; test docs and trace docs land here.
    fn dataset(&self) -> Option<&str> {
        None
    }
}

impl<F> ResponseProcessor for F
where
    F: FnMut(&ResponseBuffer, &TraceDoc, &mut RunContext<'_>) -> Result<()> + Send + 'static,
{
    fn process_response(
        &mut self,
        response: &ResponseBuffer,
        doc: &TraceDoc,
        ctx: &mut RunContext<'_>,
    ) -> Result<()> {
        self(response, doc, ctx)
    }
}

// ─── Run state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RunPhase {
    Idle,
    Initializing,
    Running(CyclePosition),
    Completed,
    /// Halted by the user; `marker` is the 1-indexed position reached.
    Aborted { marker: String },
    Failed { error: String },
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Completed | RunPhase::Aborted { .. } | RunPhase::Failed { .. }
        )
    }
}

/// Cooperative stop request shared between the caller and the worker.
#[derive(Clone, Default)]
pub struct HaltHandle(Arc<AtomicBool>);

impl HaltHandle {
    pub fn halt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Paces cycles at a fixed interval measured from the end of the previous
/// wait, so a slow cycle delays only itself.
pub struct IntervalClock {
    interval: Duration,
    last_tick: Option<Instant>,
}

impl IntervalClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep until `interval` after the previous wait returned, then mark a
    /// new tick. The first wait returns at once. Returns the tick-to-tick gap.
    pub fn wait(&mut self) -> Option<Duration> {
        let gap = self.last_tick.map(|last| {
            let due = last + self.interval;
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
            last.elapsed()
        });
        self.last_tick = Some(Instant::now());
        gap
    }
}

/// Deadline accounting. Diagnostic only; misses never fail a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingStats {
    pub cycles: usize,
    /// Gaps that overran `interval + tolerance`
    pub deadline_misses: usize,
    pub worst_gap: Duration,
}

impl TimingStats {
    fn record(&mut self, gap: Duration, interval: Duration, tolerance: Duration) {
        if gap > interval + tolerance {
            self.deadline_misses += 1;
            debug!(
                "Deadline missed: {:.1} ms gap for a {:.1} ms interval",
                gap.as_secs_f64() * 1000.0,
                interval.as_secs_f64() * 1000.0
            );
        }
        self.worst_gap = self.worst_gap.max(gap);
    }
}

/// Mutable loop state, owned by the worker thread.
struct RunState {
    position: CyclePosition,
    clock: IntervalClock,
    timing: TimingStats,
    session: SessionClock,
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Persist test docs, trace docs and run annotations
    pub save_data: bool,
    /// Play a 2-sample silent trace before each test's traces
    pub silence_window: bool,
    /// Slack before a cycle counts as a missed deadline
    pub interval_tolerance: Duration,
    /// Reference voltage and output limits used to expand stimuli
    pub rig: RigConfig,
}

impl SchedulerConfig {
    pub fn new(rig: &RigConfig) -> Self {
        Self {
            save_data: true,
            silence_window: false,
            interval_tolerance: rig.interval_tolerance(),
            rig: rig.clone(),
        }
    }

    pub fn with_save_data(mut self, save: bool) -> Self {
        self.save_data = save;
        self
    }

    pub fn with_silence_window(mut self, enabled: bool) -> Self {
        self.silence_window = enabled;
        self
    }
}

struct PreparedRun {
    tests: Vec<ExpandedTest>,
    interval: Duration,
    calibration_used: String,
    calibration_range: Option<(f64, f64)>,
}

pub struct RunScheduler<P: ResponseProcessor> {
    player: Player,
    processor: P,
    sink: Box<dyn DataSink>,
    events: EventBus,
    config: SchedulerConfig,
    halt: HaltHandle,
    phase: Arc<Mutex<RunPhase>>,
    prepared: Option<PreparedRun>,
}

/// Everything a finished run hands back to the caller.
pub struct RunReport<P> {
    pub player: Player,
    pub processor: P,
    pub sink: Box<dyn DataSink>,
    pub phase: RunPhase,
    pub timing: TimingStats,
}

pub struct RunHandle<P> {
    halt: HaltHandle,
    phase: Arc<Mutex<RunPhase>>,
    worker: JoinHandle<RunReport<P>>,
}

impl<P> RunHandle<P> {
    pub fn halt(&self) {
        self.halt.halt();
    }

    pub fn halt_handle(&self) -> HaltHandle {
        self.halt.clone()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker. Loop errors are already folded into the report's
    /// phase; only a lost worker comes back as `Err`.
    pub fn join(self) -> Result<RunReport<P>> {
        self.worker.join().map_err(|_| RigError::WorkerPanicked)
    }
}

impl<P: ResponseProcessor> RunScheduler<P> {
    pub fn new(
        player: Player,
        processor: P,
        sink: Box<dyn DataSink>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            player,
            processor,
            sink,
            events,
            config,
            halt: HaltHandle::default(),
            phase: Arc::new(Mutex::new(RunPhase::Idle)),
            prepared: None,
        }
    }

    pub fn halt_handle(&self) -> HaltHandle {
        self.halt.clone()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.lock().clone()
    }

    /// Validate and expand every test up front. Returns each test's overload
    /// attenuations (0 where a trace fit the output range). Replaces any
    /// previous preparation.
    pub fn setup(
        &mut self,
        protocol: &Protocol,
        calibration: Option<&CalibrationVector>,
        interval: Duration,
    ) -> Result<Vec<Vec<f64>>> {
        self.prepared = None;
        self.halt.clear();
        if interval.is_zero() {
            return Err(RigError::InvalidConfiguration(
                "repetition interval must be positive".into(),
            ));
        }
        let expander = StimulusExpander::new(&self.config.rig)
            .with_calibration(calibration.map(|c| Arc::new(c.clone())));
        let tests = expander.expand_protocol(protocol)?;

        let window = Duration::from_secs_f64(self.player.config().window);
        if window > interval {
            warn!(
                "Acquisition window {:?} is longer than the interval {:?}; every cycle will overrun",
                window, interval
            );
        }

        let overloads: Vec<Vec<f64>> = tests.iter().map(|t| t.overloads()).collect();
        let overloaded = overloads.iter().flatten().filter(|&&o| o > 0.0).count();
        if overloaded > 0 {
            warn!("{} traces exceed the output range and were scaled down", overloaded);
        }

        self.prepared = Some(PreparedRun {
            tests,
            interval,
            calibration_used: calibration.map(|c| c.label.clone()).unwrap_or_default(),
            calibration_range: calibration.map(|c| c.frange),
        });
        info!(
            "Run prepared: {} tests, {} cycles at {:?} intervals",
            protocol.tests.len(),
            self.count(),
            interval
        );
        Ok(overloads)
    }

    /// Total repetition cycles the prepared run will execute.
    pub fn count(&self) -> usize {
        let silence = usize::from(self.config.silence_window);
        self.prepared.as_ref().map_or(0, |p| {
            p.tests
                .iter()
                .map(|t| (t.traces.len() + silence) * t.reps)
                .sum()
        })
    }

    /// Start the timed loop on a worker thread.
    pub fn run(mut self) -> Result<RunHandle<P>> {
        let prepared = self.prepared.take().ok_or_else(|| {
            RigError::InvalidConfiguration("run requested before setup".into())
        })?;
        *self.phase.lock() = RunPhase::Initializing;

        let halt = self.halt.clone();
        let phase = self.phase.clone();
        let worker = thread::Builder::new()
            .name("run-scheduler".into())
            .spawn(move || self.work(prepared))?;
        Ok(RunHandle {
            halt,
            phase,
            worker,
        })
    }

    fn work(mut self, prepared: PreparedRun) -> RunReport<P> {
        let mut state = RunState {
            position: CyclePosition::default(),
            clock: IntervalClock::new(prepared.interval),
            timing: TimingStats::default(),
            session: SessionClock::new(),
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&mut state, &prepared)))
            .unwrap_or(Err(RigError::WorkerPanicked));
        self.player.stop();

        let marker = state.position.to_string();
        let halted = matches!(outcome, Err(RigError::UserAbort));
        let phase = match outcome {
            Ok(()) => {
                info!(
                    "Run completed: {} cycles, {} deadline misses",
                    state.timing.cycles, state.timing.deadline_misses
                );
                RunPhase::Completed
            }
            Err(RigError::UserAbort) => {
                info!("Run halted at {}", marker);
                self.annotate_abort(json!({ "aborted": marker }));
                RunPhase::Aborted { marker }
            }
            Err(e) => {
                error!("Run failed at {}: {}", marker, e);
                self.events.emit(RunEvent::RunFailed {
                    at: state.position,
                    message: e.to_string(),
                });
                self.annotate_abort(json!({ "aborted": marker, "error": e.to_string() }));
                RunPhase::Failed {
                    error: e.to_string(),
                }
            }
        };
        if let Err(e) = self.sink.flush() {
            warn!("Could not flush run data: {}", e);
        }
        *self.phase.lock() = phase.clone();
        self.events.emit(RunEvent::GroupFinished { halted });

        RunReport {
            player: self.player,
            processor: self.processor,
            sink: self.sink,
            phase,
            timing: state.timing,
        }
    }

    fn annotate_abort(&mut self, note: Value) {
        if !self.config.save_data {
            return;
        }
        let Some(group) = self.processor.group() else {
            return;
        };
        let attrs: Attrs = note.as_object().cloned().unwrap_or_default();
        if let Err(e) = self.sink.set_metadata(group, &attrs, false) {
            warn!("Could not record abort marker on {}: {}", group, e);
        }
    }

    fn execute(&mut self, state: &mut RunState, prepared: &PreparedRun) -> Result<()> {
        let times = Arc::new(self.player.response_times());
        let plan = RunPlan {
            tests: &prepared.tests,
            silence_window: self.config.silence_window,
            aisr: self.player.aisr(),
            window_samples: times.len(),
        };
        self.processor.initialize_run(
            &plan,
            &mut RunContext {
                sink: self.sink.as_mut(),
                events: &self.events,
                response_times: &times,
            },
        )?;

        if self.config.save_data {
            if let Some(group) = self.processor.group() {
                let range = prepared
                    .calibration_range
                    .map_or(Value::Null, |(lo, hi)| json!([lo, hi]));
                let attrs = json!({
                    "calibration_used": prepared.calibration_used,
                    "calibration_range": range,
                });
                self.sink
                    .set_metadata(group, attrs.as_object().unwrap_or(&Attrs::new()), false)?;
            }
        }

        for (itest, test) in prepared.tests.iter().enumerate() {
            state.position = CyclePosition {
                test: itest,
                trace: None,
                rep: 0,
            };
            self.processor.initialize_test(
                itest,
                test,
                &mut RunContext {
                    sink: self.sink.as_mut(),
                    events: &self.events,
                    response_times: &times,
                },
            )?;
            if self.config.save_data {
                if let Some(dataset) = self.processor.dataset() {
                    self.sink.set_metadata(dataset, &test.test_doc(), true)?;
                }
            }
            info!(
                "Test {}/{}: {} traces x {} reps ({})",
                itest + 1,
                prepared.tests.len(),
                test.traces.len(),
                test.reps,
                if test.testtype.is_empty() { "untyped" } else { &test.testtype }
            );

            if self.config.silence_window {
                let mut doc = TraceDoc::silence_window(test.samplerate);
                doc.testtype = test.testtype.clone();
                doc.user_tag = test.user_tag.clone();
                let silence = StimulusTrace {
                    signal: Arc::new(vec![0.0; 2]),
                    samplerate: test.samplerate,
                    attenuation: 0.0,
                    doc,
                };
                self.play_trace(state, prepared, &silence, None, test.reps, &times)?;
            }
            for (itrace, stim) in test.traces.iter().enumerate() {
                self.play_trace(state, prepared, stim, Some(itrace), test.reps, &times)?;
            }
        }
        Ok(())
    }

    fn play_trace(
        &mut self,
        state: &mut RunState,
        prepared: &PreparedRun,
        stim: &StimulusTrace,
        itrace: Option<usize>,
        nreps: usize,
        times: &Arc<Vec<f64>>,
    ) -> Result<()> {
        state.position.trace = itrace;
        state.position.rep = 0;
        self.player
            .set_stimulus(stim.signal.clone(), stim.samplerate, stim.attenuation)?;
        self.player.start()?;

        let mut doc = stim.doc.clone();
        let mut stamps = Vec::with_capacity(nreps.min(1024));
        let aisr = self.player.aisr();

        for irep in 0..nreps {
            state.position.rep = irep;
            let gap = state.clock.wait();
            if self.halt.is_halted() {
                return Err(RigError::UserAbort);
            }
            stamps.push(state.session.now_secs());
            if let Some(gap) = gap {
                state
                    .timing
                    .record(gap, prepared.interval, self.config.interval_tolerance);
            }
            state.timing.cycles += 1;
            *self.phase.lock() = RunPhase::Running(state.position);
            trace!("Cycle {}", state.position);

            let samples = self.player.run()?;
            self.player.reset()?;

            let response = ResponseBuffer {
                samples,
                samplerate: aisr,
                test: state.position.test,
                trace: itrace,
                rep: irep,
            };
            self.processor.process_response(
                &response,
                &doc,
                &mut RunContext {
                    sink: self.sink.as_mut(),
                    events: &self.events,
                    response_times: times,
                },
            )?;

            if irep == 0 {
                self.events.emit(RunEvent::StimGenerated {
                    signal: stim.signal.clone(),
                    samplerate: stim.samplerate,
                });
            }
            self.events.emit(RunEvent::CurrentRep { rep: irep });

            if irep + 1 == nreps {
                doc.time_stamps = std::mem::take(&mut stamps);
                self.events.emit(RunEvent::CurrentTrace {
                    test: state.position.test,
                    trace: itrace,
                    doc: doc.clone(),
                });
                self.events.emit(RunEvent::OverVoltage {
                    overloaded_attenuation: doc.overloaded_attenuation,
                });
                if self.config.save_data {
                    if let Some(dataset) = self.processor.dataset() {
                        self.sink.append_trace_info(dataset, &doc)?;
                    }
                }
            }
        }

        self.player.stop();
        Ok(())
    }
}
