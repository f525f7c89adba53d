//! The polling step engine.
//!
//! ```text
//!   run(steps, context, abort)
//!       │
//!       ▼
//!   ┌── tick ─────────────────────────────────────────┐
//!   │  abort? ── yes ──▶ Aborted                      │
//!   │  budget spent? ── yes ──▶ Timeout               │
//!   │  for step in priority order (minus retired):    │
//!   │     Absent    → next step                       │
//!   │     NotReady  → stop, poll again                │
//!   │     Ready     → act, then Continue/Advance/     │
//!   │                 Terminate                       │
//!   └── sleep jitter ∈ [poll_min, poll_max] ──────────┘
//! ```
//!
//! Every tick starts again from the top of the list because the document may
//! have changed shape entirely between ticks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::capability::{Actuator, ElementRef, Located, Locator};
use crate::step::{Step, StepAction, Transition};
use tabpilot_core::{PilotError, Result};

/// Timing policy for one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Lower bound of the inter-tick delay.
    pub poll_min: Duration,
    /// Upper bound of the inter-tick delay.
    pub poll_max: Duration,
    /// Wall-clock budget for one run.
    pub max_duration: Duration,
    /// Tick budget for one run.
    pub max_ticks: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_min: Duration::from_millis(400),
            poll_max: Duration::from_millis(900),
            max_duration: Duration::from_secs(60),
            max_ticks: 300,
        }
    }
}

impl EngineSettings {
    /// Sample a delay uniformly from `[poll_min, poll_max]`.
    pub fn jitter(&self) -> Duration {
        let min = self.poll_min.as_millis() as u64;
        let max = (self.poll_max.as_millis() as u64).max(min);
        let span = max - min;
        let offset = if span == 0 {
            0
        } else {
            rand::random::<u64>() % (span + 1)
        };
        Duration::from_millis(min + offset)
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Success,
    Timeout,
    Failed { step: String, reason: String },
    Aborted,
}

/// What a finished run reports back.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: RunResult,
    /// Names of steps whose action ran, in order.
    pub executed: Vec<String>,
    pub ticks: u32,
    pub elapsed: Duration,
    /// Step that was being waited on or acted on last.
    pub last_step: Option<String>,
    pub last_error: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.result == RunResult::Success
    }

    /// Convert into the driver-boundary error taxonomy.
    pub fn into_result(self) -> Result<Vec<String>> {
        match self.result {
            RunResult::Success => Ok(self.executed),
            RunResult::Timeout => Err(PilotError::PreconditionTimeout {
                step: self.last_step.unwrap_or_else(|| "<none matched>".into()),
                elapsed_ms: self.elapsed.as_millis() as u64,
            }),
            RunResult::Failed { step, reason } => Err(PilotError::ActionFailed { step, reason }),
            RunResult::Aborted => Err(PilotError::Aborted(format!(
                "run aborted after {} ticks",
                self.ticks
            ))),
        }
    }
}

/// Mutable state of one run. Never shared between runs.
struct RunState {
    started: Instant,
    ticks: u32,
    current: Option<String>,
    retired: HashSet<usize>,
    executed: Vec<String>,
    last_error: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            ticks: 0,
            current: None,
            retired: HashSet::new(),
            executed: Vec::new(),
            last_error: None,
        }
    }

    fn finish(self, result: RunResult) -> RunReport {
        RunReport {
            result,
            executed: self.executed,
            ticks: self.ticks,
            elapsed: self.started.elapsed(),
            last_step: self.current,
            last_error: self.last_error,
        }
    }
}

enum TickOutcome {
    Poll,
    Terminated,
    Fatal { step: String, reason: String },
}

/// Drives a document through a step list using injected capabilities.
pub struct Engine {
    locator: Arc<dyn Locator>,
    actuator: Arc<dyn Actuator>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        locator: Arc<dyn Locator>,
        actuator: Arc<dyn Actuator>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            locator,
            actuator,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Same capabilities, different timing policy.
    pub fn with_settings(&self, settings: EngineSettings) -> Self {
        Self {
            locator: Arc::clone(&self.locator),
            actuator: Arc::clone(&self.actuator),
            settings,
        }
    }

    /// Run `steps` until one terminates, the budget runs out, a fatal step
    /// fails, or `abort` is cancelled.
    pub async fn run(
        &self,
        steps: &[Step],
        context: &Map<String, Value>,
        abort: &CancellationToken,
    ) -> RunReport {
        let mut state = RunState::new();

        if steps.is_empty() {
            return state.finish(RunResult::Failed {
                step: String::new(),
                reason: "no steps".into(),
            });
        }

        debug!(steps = steps.len(), "step run started");

        loop {
            if abort.is_cancelled() {
                info!(ticks = state.ticks, "step run aborted");
                return state.finish(RunResult::Aborted);
            }
            if state.started.elapsed() >= self.settings.max_duration
                || state.ticks >= self.settings.max_ticks
            {
                warn!(
                    ticks = state.ticks,
                    elapsed_ms = state.started.elapsed().as_millis() as u64,
                    waiting_on = ?state.current,
                    "step run timed out"
                );
                return state.finish(RunResult::Timeout);
            }

            state.ticks += 1;
            match self.tick(steps, context, &mut state).await {
                TickOutcome::Terminated => {
                    info!(
                        ticks = state.ticks,
                        executed = ?state.executed,
                        "step run completed"
                    );
                    return state.finish(RunResult::Success);
                }
                TickOutcome::Fatal { step, reason } => {
                    warn!(step = %step, reason = %reason, "fatal step failed");
                    return state.finish(RunResult::Failed { step, reason });
                }
                TickOutcome::Poll => {}
            }

            let remaining = self
                .settings
                .max_duration
                .saturating_sub(state.started.elapsed());
            let delay = self.settings.jitter().min(remaining);
            tokio::select! {
                _ = abort.cancelled() => {
                    info!(ticks = state.ticks, "step run aborted while waiting");
                    return state.finish(RunResult::Aborted);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn tick(
        &self,
        steps: &[Step],
        context: &Map<String, Value>,
        state: &mut RunState,
    ) -> TickOutcome {
        for (idx, step) in steps.iter().enumerate() {
            if state.retired.contains(&idx) {
                continue;
            }

            let located = match self.locator.locate(&step.trigger).await {
                Ok(l) => l,
                Err(e) => {
                    debug!(step = %step.name, error = %e, "locate failed, treating as absent");
                    state.last_error = Some(e.to_string());
                    continue;
                }
            };

            match located {
                Located::Absent => continue,
                Located::NotReady(el) => {
                    trace!(step = %step.name, element = %el.label, "present but not ready");
                    state.current = Some(step.name.clone());
                    return TickOutcome::Poll;
                }
                Located::Ready(el) => {
                    state.current = Some(step.name.clone());
                    return match self.perform(step, &el, context).await {
                        Ok(()) => {
                            debug!(step = %step.name, element = %el.label, "step executed");
                            state.executed.push(step.name.clone());
                            match step.then {
                                Transition::Terminate => TickOutcome::Terminated,
                                Transition::Advance => {
                                    state.retired.insert(idx);
                                    TickOutcome::Poll
                                }
                                Transition::Continue => TickOutcome::Poll,
                            }
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            state.last_error = Some(reason.clone());
                            if step.fatal {
                                TickOutcome::Fatal {
                                    step: step.name.clone(),
                                    reason,
                                }
                            } else {
                                warn!(step = %step.name, error = %reason, "step action failed, polling again");
                                TickOutcome::Poll
                            }
                        }
                    };
                }
            }
        }
        TickOutcome::Poll
    }

    async fn perform(
        &self,
        step: &Step,
        target: &ElementRef,
        context: &Map<String, Value>,
    ) -> Result<()> {
        match &step.action {
            StepAction::Click => self.actuator.click(target).await,
            StepAction::SetText(source) => {
                let value = source.resolve(context)?;
                self.actuator.set_text(target, &value).await
            }
            StepAction::Activate => self.actuator.activate(target).await,
            StepAction::PasteImage(source) => {
                let image = source.resolve(context)?;
                self.actuator.paste_image(target, &image).await
            }
            StepAction::Observe => Ok(()),
        }
    }
}
