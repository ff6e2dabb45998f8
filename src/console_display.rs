use crate::types::*;
use crossbeam_channel::Receiver;
use std::io::{self, Write};

/// Progress accumulated from run events.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub total_cycles: usize,
    pub cycles: usize,
    pub test: usize,
    pub trace: Option<usize>,
    pub last_stim: String,
    pub overloaded_attenuation: f64,
    pub last_average: Option<(f64, f64)>,
    pub failure: Option<String>,
    pub finished: Option<bool>,
}

impl Progress {
    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::CurrentRep { .. } => self.cycles += 1,
            RunEvent::CurrentTrace { test, trace, doc } => {
                self.test = *test;
                self.trace = *trace;
                self.last_stim = doc
                    .lead_component()
                    .map_or_else(|| "---".to_string(), describe);
            }
            RunEvent::OverVoltage {
                overloaded_attenuation,
            } => self.overloaded_attenuation = *overloaded_attenuation,
            RunEvent::AverageResponse { frequency, db, .. } => {
                self.last_average = Some((*frequency, *db));
            }
            RunEvent::RunFailed { at, message } => {
                self.failure = Some(format!("{} at {}", message, at));
            }
            RunEvent::GroupFinished { halted } => self.finished = Some(*halted),
            _ => {}
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("╔══════════════════════════════════════════════════════════╗\n");
        out.push_str("║  STIM CAPTURE — Run Monitor                              ║\n");
        out.push_str("╠══════════════════════════════════════════════════════════╣\n");
        let frac = if self.total_cycles == 0 {
            0.0
        } else {
            (self.cycles as f32 / self.total_cycles as f32).min(1.0)
        };
        out.push_str(&format!(
            "║  Cycles: {} {}/{}\n",
            make_bar(frac, 30),
            self.cycles,
            self.total_cycles
        ));
        let trace = self.trace.map_or_else(|| "silence".to_string(), |t| (t + 1).to_string());
        out.push_str(&format!("║  Test {}, trace {}: {}\n", self.test + 1, trace, self.last_stim));
        if self.overloaded_attenuation > 0.0 {
            out.push_str(&format!(
                "║  OVERLOAD: scaled down {:.1} dB\n",
                self.overloaded_attenuation
            ));
        }
        if let Some((f, db)) = self.last_average {
            out.push_str(&format!("║  Last average: {:.0} Hz -> {:.1} dB SPL\n", f, db));
        }
        if let Some(ref failure) = self.failure {
            out.push_str(&format!("║  FAILED: {}\n", failure));
        }
        match self.finished {
            Some(true) => out.push_str("║  Halted\n"),
            Some(false) => out.push_str("║  Finished\n"),
            None => {}
        }
        out.push_str("╚══════════════════════════════════════════════════════════╝\n");
        out
    }
}

/// Renders a live ASCII view of run progress.
pub struct ConsoleDisplay {
    rx: Receiver<RunEvent>,
    total_cycles: usize,
}

impl ConsoleDisplay {
    pub fn new(rx: Receiver<RunEvent>, total_cycles: usize) -> Self {
        Self { rx, total_cycles }
    }

    /// Blocks until the run finishes or the channel closes.
    pub fn run(&self) {
        let mut progress = Progress {
            total_cycles: self.total_cycles,
            ..Progress::default()
        };
        let mut stdout = io::stdout();

        for event in self.rx.iter() {
            let redraw = matches!(
                event,
                RunEvent::CurrentRep { .. }
                    | RunEvent::RunFailed { .. }
                    | RunEvent::GroupFinished { .. }
            );
            progress.apply(&event);
            if redraw {
                // Clear screen and move cursor home
                print!("\x1b[2J\x1b[H{}", progress.render());
                let _ = stdout.flush();
            }
            if progress.finished.is_some() {
                break;
            }
        }
    }
}

fn describe(c: &Component) -> String {
    match c.frequency() {
        Some(f) => format!("{} {:.0} Hz @ {:.0} dB", c.stim_type(), f, c.intensity()),
        None => c.stim_type().to_string(),
    }
}

fn make_bar(val: f32, width: usize) -> String {
    let filled = (val * width as f32).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}
