use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::Query;
use tabpilot_core::{PilotError, Result};

/// What happens to the run after a step's action succeeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// The step stays eligible; keep polling.
    Continue,
    /// The step is done for this run and is dropped from the candidates.
    #[default]
    Advance,
    /// The run completes successfully.
    Terminate,
}

/// Where a text value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextSource {
    Literal(String),
    /// Key in the run context.
    Context(String),
}

impl TextSource {
    pub fn resolve(&self, context: &Map<String, Value>) -> Result<String> {
        match self {
            TextSource::Literal(s) => Ok(s.clone()),
            TextSource::Context(key) => match context.get(key) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Null) | None => Err(PilotError::ActionFailed {
                    step: "context".into(),
                    reason: format!("context key '{key}' is missing"),
                }),
                Some(other) => Ok(other.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Click,
    SetText(TextSource),
    Activate,
    PasteImage(TextSource),
    /// No interaction; the step only gates a transition (e.g. a success banner).
    Observe,
}

/// One predicate + action + transition unit.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub trigger: Query,
    pub action: StepAction,
    pub then: Transition,
    /// End the run with `Failed` when the action errors.
    pub fatal: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, trigger: Query) -> Self {
        Self {
            name: name.into(),
            trigger,
            action: StepAction::Observe,
            then: Transition::Advance,
            fatal: false,
        }
    }

    pub fn click(mut self) -> Self {
        self.action = StepAction::Click;
        self
    }

    pub fn set_text(mut self, source: TextSource) -> Self {
        self.action = StepAction::SetText(source);
        self
    }

    pub fn activate(mut self) -> Self {
        self.action = StepAction::Activate;
        self
    }

    pub fn paste_image(mut self, source: TextSource) -> Self {
        self.action = StepAction::PasteImage(source);
        self
    }

    pub fn then(mut self, transition: Transition) -> Self {
        self.then = transition;
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}
