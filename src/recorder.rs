//! Pass-through response processors: record every response of a protocol
//! run, or just forward responses for live display while exploring.

use crate::data_sink::DataSink;
use crate::error::Result;
use crate::scheduler::{ResponseProcessor, RunContext, RunPlan};
use crate::stimulus::ExpandedTest;
use crate::types::{ResponseBuffer, RunEvent, TraceDoc};
use log::{debug, info};
use std::sync::Arc;

/// Next free `<prefix>_N` name, counting from 1.
fn next_group_name(sink: &dyn DataSink, prefix: &str) -> String {
    let taken = sink
        .groups()
        .iter()
        .filter(|g| {
            g.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|n| n.parse::<usize>().is_ok())
        })
        .count();
    let mut n = taken + 1;
    while sink.groups().iter().any(|g| *g == format!("{}_{}", prefix, n)) {
        n += 1;
    }
    format!("{}_{}", prefix, n)
}

fn collected(response: &ResponseBuffer, ctx: &RunContext<'_>) -> RunEvent {
    RunEvent::ResponseCollected {
        times: ctx.response_times.clone(),
        response: Arc::new(response.samples.clone()),
    }
}

// ─── Protocol recorder ──────────────────────────────────────────────────────

/// Stores every response of a protocol run: one `segment_N` group per run,
/// one `test_K` dataset per test shaped `(traces, reps, samples)`.
#[derive(Default)]
pub struct ProtocolRecorder {
    group: String,
    dataset: String,
    silence_window: bool,
    window_samples: usize,
}

impl ProtocolRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group written by the most recent run; empty before the first run.
    pub fn segment(&self) -> &str {
        &self.group
    }
}

impl ResponseProcessor for ProtocolRecorder {
    fn initialize_run(&mut self, plan: &RunPlan<'_>, ctx: &mut RunContext<'_>) -> Result<()> {
        self.group = next_group_name(&*ctx.sink, "segment");
        self.dataset.clear();
        self.silence_window = plan.silence_window;
        self.window_samples = plan.window_samples;
        ctx.sink.init_group(&self.group, "finite")?;
        info!("Recording protocol into {}", self.group);
        Ok(())
    }

    fn initialize_test(&mut self, index: usize, test: &ExpandedTest, ctx: &mut RunContext<'_>) -> Result<()> {
        let traces = test.traces.len() + usize::from(self.silence_window);
        self.dataset = format!("{}/test_{}", self.group, index + 1);
        ctx.sink
            .init_data(&self.dataset, "finite", &[traces, test.reps, self.window_samples], None)?;
        debug!(
            "{}: {} x {} x {}",
            self.dataset, traces, test.reps, self.window_samples
        );
        Ok(())
    }

    fn process_response(
        &mut self,
        response: &ResponseBuffer,
        _doc: &TraceDoc,
        ctx: &mut RunContext<'_>,
    ) -> Result<()> {
        ctx.sink.append(&self.dataset, &response.samples, None)?;
        ctx.events.emit(collected(response, ctx));
        Ok(())
    }

    fn group(&self) -> Option<&str> {
        (!self.group.is_empty()).then_some(self.group.as_str())
    }

    fn dataset(&self) -> Option<&str> {
        (!self.dataset.is_empty()).then_some(self.dataset.as_str())
    }
}

// ─── Explore monitor ────────────────────────────────────────────────────────

/// Live-display processor for open-ended search runs. Nothing is persisted
/// unless `save` is set, in which case responses accumulate in one unbounded
/// dataset under an `explore_N` group.
#[derive(Default)]
pub struct ExploreMonitor {
    save: bool,
    group: String,
    dataset: String,
}

impl ExploreMonitor {
    pub fn new(save: bool) -> Self {
        Self {
            save,
            ..Self::default()
        }
    }
}

impl ResponseProcessor for ExploreMonitor {
    fn initialize_run(&mut self, _plan: &RunPlan<'_>, ctx: &mut RunContext<'_>) -> Result<()> {
        if !self.save {
            return Ok(());
        }
        self.group = next_group_name(&*ctx.sink, "explore");
        self.dataset = format!("{}/responses", self.group);
        ctx.sink.init_group(&self.group, "open")?;
        ctx.sink.init_data(&self.dataset, "open", &[], None)?;
        info!("Saving explore responses into {}", self.group);
        Ok(())
    }

    fn process_response(
        &mut self,
        response: &ResponseBuffer,
        _doc: &TraceDoc,
        ctx: &mut RunContext<'_>,
    ) -> Result<()> {
        if self.save {
            ctx.sink.append(&self.dataset, &response.samples, None)?;
        }
        ctx.events.emit(collected(response, ctx));
        Ok(())
    }

    fn group(&self) -> Option<&str> {
        (self.save && !self.group.is_empty()).then_some(self.group.as_str())
    }

    fn dataset(&self) -> Option<&str> {
        (self.save && !self.dataset.is_empty()).then_some(self.dataset.as_str())
    }
}
