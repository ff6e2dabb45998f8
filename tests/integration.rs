//! End-to-end tests for the stimulus/acquisition pipeline.
//!
//! Every test drives a real `RunScheduler` on its worker thread against the
//! loopback `SimulatedRig`:
//!   Protocol → expansion → Player (sim device) → processor → sink + events

use crossbeam_channel::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use stim_capture::calibration::{CalibrationEngine, CalibrationMode, CalibrationRun};
use stim_capture::config::RigConfig;
use stim_capture::data_sink::{DataSink, MemorySink, SessionReader, SessionSink};
use stim_capture::player::{Player, PlayerConfig};
use stim_capture::recorder::ProtocolRecorder;
use stim_capture::scheduler::{ResponseProcessor, RunPhase, RunScheduler, SchedulerConfig};
use stim_capture::simulator::{FaultPlan, SimulatedRig};
use stim_capture::stimulus::{AutoParameter, Protocol, TestDef};
use stim_capture::types::*;

// ─── Helpers ───────────────────────────────────────────────────────────────

fn rig_config(aisr: f64, window: f64) -> RigConfig {
    RigConfig {
        aisr,
        acq_window: window,
        acq_timeout: 2.0,
        ..RigConfig::default()
    }
}

fn tone_test(freq: f64, reps: usize, duration: f64) -> TestDef {
    let mut test = TestDef::new(vec![Component::tone(freq, 70.0, duration, 0.002)], reps);
    test.samplerate = 200_000.0;
    test
}

fn frequency_sweep(test: TestDef, start: f64, stop: f64, step: f64) -> TestDef {
    test.with_auto_parameter(AutoParameter {
        parameter: "frequency".into(),
        start,
        stop,
        step,
        selection: vec![],
    })
}

fn scheduler<P: ResponseProcessor>(
    rig: SimulatedRig,
    cfg: &RigConfig,
    processor: P,
    sink: Box<dyn DataSink>,
) -> (RunScheduler<P>, Receiver<RunEvent>) {
    let mut events = EventBus::new();
    let rx = events.subscribe();
    let player = Player::new(Box::new(rig), PlayerConfig::from(cfg));
    let sched = RunScheduler::new(player, processor, sink, events, SchedulerConfig::new(cfg));
    (sched, rx)
}

fn finished_count(events: &[RunEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RunEvent::GroupFinished { .. }))
        .count()
}

// ─── Timing ────────────────────────────────────────────────────────────────

#[test]
fn test_repetitions_follow_the_interval() {
    let cfg = rig_config(20_000.0, 0.05);
    let sink = MemorySink::new();
    let (mut sched, rx) = scheduler(SimulatedRig::new(), &cfg, ProtocolRecorder::new(), Box::new(sink.clone()));
    let interval = Duration::from_millis(250);
    sched
        .setup(&Protocol::new(vec![tone_test(2000.0, 4, 0.04)]), None, interval)
        .unwrap();
    let report = sched.run().unwrap().join().unwrap();
    assert_eq!(report.phase, RunPhase::Completed);

    let docs = sink.trace_docs("segment_1/test_1");
    assert_eq!(docs.len(), 1);
    let stamps = &docs[0].time_stamps;
    assert_eq!(stamps.len(), 4);
    for pair in stamps.windows(2) {
        let gap = pair[1] - pair[0];
        assert!((gap - 0.25).abs() < 0.010, "gap {:.4}s off the 250 ms interval", gap);
    }
    assert_eq!(report.timing.cycles, 4);

    let events: Vec<RunEvent> = rx.try_iter().collect();
    assert_eq!(finished_count(&events), 1);
    assert!(matches!(events.last(), Some(RunEvent::GroupFinished { halted: false })));
}

// ─── Halt ──────────────────────────────────────────────────────────────────

#[test]
fn test_halt_stops_before_next_cycle() {
    let cfg = rig_config(10_000.0, 0.01);
    let sink = MemorySink::new();
    let (mut sched, rx) = scheduler(SimulatedRig::new(), &cfg, ProtocolRecorder::new(), Box::new(sink.clone()));
    sched
        .setup(&Protocol::new(vec![tone_test(2000.0, 500, 0.005)]), None, Duration::from_millis(20))
        .unwrap();
    let handle = sched.run().unwrap();
    thread::sleep(Duration::from_millis(150));
    let halted_at = Instant::now();
    handle.halt();
    let report = handle.join().unwrap();
    // at most one interval plus one in-flight acquisition
    assert!(halted_at.elapsed() < Duration::from_millis(150));

    let marker = match report.phase {
        RunPhase::Aborted { ref marker } => marker.clone(),
        ref other => panic!("expected abort, got {:?}", other),
    };
    assert!(marker.starts_with("test 1, trace 1, rep "), "{}", marker);
    assert_eq!(sink.group("segment_1").unwrap().attrs["aborted"], marker.as_str());
    // last repetition never reached: no trace doc, no stamps written
    assert!(sink.trace_docs("segment_1/test_1").is_empty());

    let events: Vec<RunEvent> = rx.try_iter().collect();
    let reps = events
        .iter()
        .filter(|e| matches!(e, RunEvent::CurrentRep { .. }))
        .count();
    assert_eq!(reps, report.timing.cycles);
    assert!(reps > 0 && reps < 500);
    assert_eq!(finished_count(&events), 1);
    assert!(matches!(events.last(), Some(RunEvent::GroupFinished { halted: true })));
}

// ─── Failures ──────────────────────────────────────────────────────────────

#[test]
fn test_device_fault_fails_run_and_releases_device() {
    let rig = SimulatedRig::new().with_faults(FaultPlan {
        fail_read_at: Some(2),
        ..FaultPlan::default()
    });
    let stats = rig.stats();
    let cfg = rig_config(10_000.0, 0.01);
    let sink = MemorySink::new();
    let (mut sched, rx) = scheduler(rig, &cfg, ProtocolRecorder::new(), Box::new(sink.clone()));
    sched
        .setup(&Protocol::new(vec![tone_test(2000.0, 5, 0.005)]), None, Duration::from_millis(15))
        .unwrap();
    let report = sched.run().unwrap().join().unwrap();

    assert!(matches!(report.phase, RunPhase::Failed { .. }));
    assert_eq!(stats.tasks_open(), 0);
    let attrs = sink.group("segment_1").unwrap().attrs;
    assert_eq!(attrs["aborted"], "test 1, trace 1, rep 3");

    let events: Vec<RunEvent> = rx.try_iter().collect();
    let failed = events
        .iter()
        .position(|e| matches!(e, RunEvent::RunFailed { .. }))
        .unwrap();
    assert_eq!(failed, events.len() - 2);
    assert_eq!(finished_count(&events), 1);
}

#[test]
fn test_acquisition_timeout_fails_run() {
    let rig = SimulatedRig::new().with_faults(FaultPlan {
        stall_reads: true,
        ..FaultPlan::default()
    });
    let mut cfg = rig_config(10_000.0, 0.01);
    cfg.acq_timeout = 0.05;
    let (mut sched, rx) = scheduler(rig, &cfg, ProtocolRecorder::new(), Box::new(MemorySink::new()));
    sched
        .setup(&Protocol::new(vec![tone_test(2000.0, 3, 0.005)]), None, Duration::from_millis(10))
        .unwrap();
    let report = sched.run().unwrap().join().unwrap();
    match report.phase {
        RunPhase::Failed { ref error } => assert!(error.contains("timed out"), "{}", error),
        ref other => panic!("expected failure, got {:?}", other),
    }
    let events: Vec<RunEvent> = rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::RunFailed { at, .. } if at.rep == 0
    )));
    assert_eq!(finished_count(&events), 1);
}

#[test]
fn test_output_open_failure_releases_input() {
    let rig = SimulatedRig::new().with_faults(FaultPlan {
        fail_open_output: true,
        ..FaultPlan::default()
    });
    let stats = rig.stats();
    let cfg = rig_config(10_000.0, 0.01);
    let (mut sched, _rx) = scheduler(rig, &cfg, ProtocolRecorder::new(), Box::new(MemorySink::new()));
    sched
        .setup(&Protocol::new(vec![tone_test(2000.0, 2, 0.005)]), None, Duration::from_millis(10))
        .unwrap();
    let report = sched.run().unwrap().join().unwrap();
    assert!(matches!(report.phase, RunPhase::Failed { .. }));
    assert_eq!(stats.tasks_open(), 0);
    assert!(!report.player.is_started());
}

// ─── Persistence ───────────────────────────────────────────────────────────

#[test]
fn test_session_sink_records_a_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let session = dir.path().join("session_test");
    let cfg = rig_config(10_000.0, 0.01);
    let sink = SessionSink::open_dir(&session).unwrap();
    let (mut sched, rx) = scheduler(SimulatedRig::new(), &cfg, ProtocolRecorder::new(), Box::new(sink));
    let test = frequency_sweep(tone_test(1000.0, 2, 0.005), 1000.0, 3000.0, 1000.0);
    sched
        .setup(&Protocol::new(vec![test]), None, Duration::from_millis(15))
        .unwrap();
    let report = sched.run().unwrap().join().unwrap();
    assert_eq!(report.phase, RunPhase::Completed);
    drop(report);

    let emitted: Vec<TraceDoc> = rx
        .try_iter()
        .filter_map(|e| match e {
            RunEvent::CurrentTrace { doc, .. } => Some(doc),
            _ => None,
        })
        .collect();
    assert_eq!(emitted.len(), 3);

    let reader = SessionReader::open(&session).unwrap();
    assert_eq!(reader.groups(), vec!["segment_1".to_string()]);
    let stored = reader.trace_docs("segment_1/test_1").unwrap();
    assert_eq!(stored, emitted);
    assert_eq!(stored[2].lead_component().and_then(|c| c.frequency()), Some(3000.0));

    let header = reader.dataset_header("segment_1/test_1").unwrap();
    assert_eq!(header.dims, vec![3, 2, 100]);
    assert_eq!(reader.samples("segment_1/test_1").unwrap().len(), 600);
    assert_eq!(reader.group_attrs("segment_1").unwrap()["calibration_used"], "");
}

// ─── Calibration ───────────────────────────────────────────────────────────

fn calibrate(mode: CalibrationMode, sweep: TestDef, rig: SimulatedRig, cfg: &RigConfig) -> (stim_capture::calibration::CalibrationVector, Vec<RunEvent>) {
    let protocol = CalibrationRun::protocol(&sweep, cfg).unwrap();
    let engine = CalibrationEngine::new(cfg, mode).with_label("sim");
    let sink = MemorySink::new();
    let (mut sched, rx) = scheduler(rig, cfg, engine, Box::new(sink.clone()));
    sched.setup(&protocol, None, Duration::from_millis(40)).unwrap();
    let mut report = sched.run().unwrap().join().unwrap();
    assert_eq!(report.phase, RunPhase::Completed);
    let (vector, label, calf) = report
        .processor
        .process_calibration(report.sink.as_mut())
        .unwrap();
    assert_eq!(label, "sim");
    assert_eq!(calf, cfg.calf);
    assert!(sink.group("calibration_test_1").is_none());
    (vector, rx.try_iter().collect())
}

#[test]
fn test_calibration_anchors_reference_at_zero() {
    let mut cfg = rig_config(100_000.0, 0.03);
    cfg.calf = 15_000.0;
    let mut sweep = TestDef::new(vec![Component::tone(5_000.0, cfg.caldb, 0.02, 0.002)], 2);
    sweep.samplerate = 200_000.0;
    let sweep = frequency_sweep(sweep, 5_000.0, 25_000.0, 10_000.0);
    let rig = SimulatedRig::new().with_gain(0.5).with_lowpass(15_000.0);

    let (vector, events) = calibrate(CalibrationMode::Rms, sweep, rig, &cfg);
    assert_eq!(vector.frequencies, vec![5_000.0, 15_000.0, 25_000.0]);
    assert!(vector.attenuations[1].abs() < 1e-9, "{:?}", vector.attenuations);
    // low-pass speaker: louder below the anchor, quieter above
    assert!(vector.attenuations[0] < 0.0);
    assert!(vector.attenuations[2] > 0.0);
    assert_eq!(vector.frange, (5_000.0, 25_000.0));

    let averages: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::AverageResponse { db, .. } => Some(*db),
            _ => None,
        })
        .collect();
    assert_eq!(averages.len(), 3);
    assert!((averages[1] - cfg.caldb).abs() < 1e-9);
}

#[test]
fn test_fft_calibration_off_bin_frequency_is_nan() {
    // 3000 points at 100 kHz: 33.3 Hz bins; 15 kHz is bin 450, 5010 Hz is off-bin
    let cfg = rig_config(100_000.0, 0.03);
    let mut sweep = TestDef::new(vec![Component::tone(5_010.0, cfg.caldb, 0.02, 0.002)], 1);
    sweep.samplerate = 200_000.0;
    let sweep = frequency_sweep(sweep, 5_010.0, 15_000.0, 9_990.0);

    let (vector, events) = calibrate(CalibrationMode::Fft, sweep, SimulatedRig::new(), &cfg);
    assert_eq!(vector.frequencies, vec![5_010.0, 15_000.0]);
    assert!(vector.attenuations[0].is_nan());
    assert!(vector.attenuations[1].abs() < 1e-9);
    // NaN slot is skipped when correcting stimuli
    assert!(vector.attenuation_at(10_000.0).abs() < 1e-9);

    let invalid = events
        .iter()
        .filter(|e| matches!(e, RunEvent::CalibrationResponse { peak_fft, .. } if *peak_fft == -1.0))
        .count();
    assert_eq!(invalid, 1);
}
