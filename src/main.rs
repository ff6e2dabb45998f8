use stim_capture::calibration::{CalibrationEngine, CalibrationMode, CalibrationRun, CalibrationStore, CalibrationVector};
use stim_capture::config::RigConfig;
use stim_capture::console_display;
use stim_capture::data_sink::{DataSink, MemorySink, SessionSink};
use stim_capture::error::{Result, RigError};
use stim_capture::osc_sender;
use stim_capture::player::{Player, PlayerConfig};
use stim_capture::recorder::{ExploreMonitor, ProtocolRecorder};
use stim_capture::scheduler::{ResponseProcessor, RunPhase, RunReport, RunScheduler, SchedulerConfig};
use stim_capture::simulator::{self, SimulatedRig};
use stim_capture::stimulus::{AutoParameter, Protocol, TestDef};
use stim_capture::types::*;

use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::Receiver;
use log::{error, info, warn};
use std::io::BufRead;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "stim-capture")]
#[command(about = "Timed stimulus presentation and acquisition for auditory experiments")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Rig configuration file (JSON); missing fields take defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repetition interval (ms)
    #[arg(long, default_value_t = 300)]
    interval_ms: u64,

    /// Acquisition window override (ms); defaults to the rig configuration
    #[arg(long)]
    window_ms: Option<f64>,

    /// Output directory for recorded sessions
    #[arg(long, default_value = "./sessions")]
    output_dir: PathBuf,

    /// Keep data in memory only
    #[arg(long)]
    no_save: bool,

    /// Calibration file applied to tone stimuli
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Enable OSC progress output
    #[arg(long)]
    osc: bool,

    /// OSC target address
    #[arg(long, default_value = "127.0.0.1:9000")]
    osc_target: String,

    /// Enable console display (terminal TUI)
    #[arg(long)]
    console: bool,

    /// Simulated speaker gain
    #[arg(long, default_value_t = 1.0)]
    sim_gain: f64,

    /// Simulated speaker low-pass cutoff (Hz)
    #[arg(long)]
    sim_lowpass: Option<f64>,
}

#[derive(Subcommand)]
enum Command {
    /// Play a protocol file and record every response
    Protocol {
        file: PathBuf,
        /// Acquire a silent window before each test
        #[arg(long)]
        silence_window: bool,
    },
    /// Measure a speaker calibration with a frequency sweep
    Calibrate {
        #[arg(long, default_value_t = 5_000.0)]
        start: f64,
        #[arg(long, default_value_t = 100_000.0)]
        stop: f64,
        #[arg(long, default_value_t = 5_000.0)]
        step: f64,
        #[arg(long, default_value_t = 3)]
        reps: usize,
        /// Tone duration (s)
        #[arg(long, default_value_t = 0.2)]
        duration: f64,
        /// Rise/fall time (s)
        #[arg(long, default_value_t = 0.003)]
        risefall: f64,
        #[arg(long, value_enum, default_value_t = ModeArg::Rms)]
        mode: ModeArg,
        /// Label stored in the calibration file
        #[arg(long, default_value = "calibration")]
        label: String,
        /// Where to write the calibration
        #[arg(long, default_value = "calibration.json")]
        out: PathBuf,
    },
    /// Repeat one tone until Enter is pressed
    Explore {
        #[arg(long, default_value_t = 10_000.0)]
        frequency: f64,
        #[arg(long, default_value_t = 60.0)]
        intensity: f64,
        #[arg(long, default_value_t = 0.2)]
        duration: f64,
        /// Upper bound on repetitions
        #[arg(long, default_value_t = 100_000)]
        reps: usize,
        /// Persist responses
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Fft,
    Rms,
}

impl From<ModeArg> for CalibrationMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Fft => CalibrationMode::Fft,
            ModeArg::Rms => CalibrationMode::Rms,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match cli.config {
        Some(ref path) => RigConfig::load(path)?,
        None => RigConfig::default(),
    };
    config.validate()?;

    let store = CalibrationStore::new();
    if let Some(ref path) = cli.calibration {
        store.replace(CalibrationVector::load(path)?);
    }

    info!("═══════════════════════════════════════════════");
    info!("  STIM CAPTURE v{}", env!("CARGO_PKG_VERSION"));
    info!("  Output: {} -> Input: {} @ {} Hz", config.aochan, config.aichan, config.aisr);
    info!("  Window: {} s, interval: {} ms", config.acq_window, cli.interval_ms);
    if cli.console { info!("  UI: Console TUI"); }
    if cli.osc { info!("  OSC → {}", cli.osc_target); }
    info!("═══════════════════════════════════════════════");

    match cli.command {
        Command::Protocol {
            ref file,
            silence_window,
        } => {
            let protocol = Protocol::load(file)?;
            let sink = open_sink(&cli, !cli.no_save)?;
            let report = execute(&cli, &config, ProtocolRecorder::new(), sink, &protocol, &store, silence_window, None)?;
            if report.processor.segment().is_empty() {
                warn!("Run ended before anything was recorded");
            } else {
                info!("Recorded {}", report.processor.segment());
            }
            finish(&report.phase)
        }
        Command::Calibrate {
            start,
            stop,
            step,
            reps,
            duration,
            risefall,
            mode,
            ref label,
            ref out,
        } => {
            let sweep = TestDef::new(
                vec![Component::tone(start, config.caldb, duration, risefall)],
                reps,
            )
            .with_auto_parameter(AutoParameter {
                parameter: "frequency".into(),
                start,
                stop,
                step,
                selection: vec![],
            });
            let protocol = CalibrationRun::protocol(&sweep, &config)?;
            let engine = CalibrationEngine::new(&config, mode.into()).with_label(label.clone());
            let sink = open_sink(&cli, !cli.no_save)?;
            // Sweep is played uncorrected.
            let mut report = execute(&cli, &config, engine, sink, &protocol, &CalibrationStore::new(), false, None)?;
            finish(&report.phase)?;
            let (vector, label, calf) = report.processor.process_calibration(report.sink.as_mut())?;
            info!("Calibration '{}' anchored at {} Hz", label, calf);
            vector.save(out)?;
            store.replace(vector);
            Ok(())
        }
        Command::Explore {
            frequency,
            intensity,
            duration,
            reps,
            save,
        } => {
            let mut test = TestDef::new(vec![Component::tone(frequency, intensity, duration, 0.003)], reps);
            test.testtype = "Explore".into();
            let protocol = Protocol::new(vec![test]);
            let sink = open_sink(&cli, save && !cli.no_save)?;
            let report = execute(&cli, &config, ExploreMonitor::new(save), sink, &protocol, &store, false, Some(halt_on_enter()))?;
            finish(&report.phase)
        }
    }
}

fn open_sink(cli: &Cli, persist: bool) -> Result<Box<dyn DataSink>> {
    if persist {
        let sink = SessionSink::create(&cli.output_dir)?;
        info!("Session directory {:?}", sink.dir());
        Ok(Box::new(sink))
    } else {
        Ok(Box::new(MemorySink::new()))
    }
}

/// Receiver that fires when the operator presses Enter.
fn halt_on_enter() -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    info!("Press Enter to stop.");
    let spawned = thread::Builder::new().name("stdin-halt".into()).spawn(move || {
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).is_ok() {
            let _ = tx.send(());
        }
    });
    if let Err(e) = spawned {
        warn!("Cannot watch stdin, run will stop after its last repetition: {}", e);
    }
    rx
}

#[allow(clippy::too_many_arguments)]
fn execute<P: ResponseProcessor>(
    cli: &Cli,
    config: &RigConfig,
    processor: P,
    sink: Box<dyn DataSink>,
    protocol: &Protocol,
    store: &CalibrationStore,
    silence_window: bool,
    halt_rx: Option<Receiver<()>>,
) -> Result<RunReport<P>> {
    let mut rig = SimulatedRig::new().with_gain(cli.sim_gain);
    if let Some(fc) = cli.sim_lowpass {
        rig = rig.with_lowpass(fc);
    }
    simulator::announce(&rig);

    let mut events = EventBus::new();
    let console_rx = cli.console.then(|| events.subscribe());
    let osc_rx = cli.osc.then(|| events.subscribe());

    let mut player = Player::new(Box::new(rig), PlayerConfig::from(config));
    if let Some(ms) = cli.window_ms {
        player.set_window(ms / 1000.0)?;
        info!("Acquisition window set to {} ms", ms);
    }
    let sched_config = SchedulerConfig::new(config)
        .with_save_data(true)
        .with_silence_window(silence_window);
    let mut sched = RunScheduler::new(player, processor, sink, events, sched_config);
    let calibration = store.snapshot();
    sched.setup(protocol, calibration.as_deref(), Duration::from_millis(cli.interval_ms))?;
    let total = sched.count();
    info!("{} cycles queued", total);

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // ─── Console display ────────────────────────────────────────────
    if let Some(rx) = console_rx {
        handles.push(thread::Builder::new().name("display".into()).spawn(move || {
            console_display::ConsoleDisplay::new(rx, total).run();
        })?);
    }

    // ─── OSC sender ─────────────────────────────────────────────────
    if let Some(rx) = osc_rx {
        let target = cli.osc_target.clone();
        handles.push(thread::Builder::new().name("osc".into()).spawn(move || {
            osc_sender::OscSender::new(rx, target).run();
        })?);
    }

    let run = sched.run()?;
    if let Some(halt_rx) = halt_rx {
        let halt = run.halt_handle();
        while !run.is_finished() {
            if halt_rx.recv_timeout(Duration::from_millis(100)).is_ok() {
                info!("Halt requested");
                halt.halt();
                break;
            }
        }
    }
    let report = run.join()?;
    info!(
        "{} cycles, {} deadline misses, worst gap {:?}",
        report.timing.cycles, report.timing.deadline_misses, report.timing.worst_gap
    );

    for h in handles {
        let _ = h.join();
    }
    Ok(report)
}

fn finish(phase: &RunPhase) -> Result<()> {
    match phase {
        RunPhase::Completed => {
            info!("Run complete");
            Ok(())
        }
        RunPhase::Aborted { marker } => {
            info!("Run halted at {}", marker);
            Ok(())
        }
        RunPhase::Failed { error } => Err(RigError::DeviceFault(format!("run failed: {}", error))),
        other => Err(RigError::DeviceFault(format!("run ended in unexpected phase {:?}", other))),
    }
}
