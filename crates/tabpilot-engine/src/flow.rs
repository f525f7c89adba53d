//! Declarative flows: step lists described in TOML instead of code.
//!
//! ```toml
//! name = "post"
//! url_pattern = "https://www.example.com/groups/*"
//!
//! [[steps]]
//! name = "open-composer"
//! selector = "div[role='button']"
//! text = "Write something"
//! action = "click"
//!
//! [[steps]]
//! name = "fill"
//! selector = "div[role='dialog'] div[contenteditable='true']"
//! action = "set_text"
//! from = "text"
//!
//! [[steps]]
//! name = "submit"
//! selector = "div[aria-label='Post']"
//! action = "click"
//! then = "terminate"
//! fatal = true
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::Query;
use crate::engine::EngineSettings;
use crate::step::{Step, TextSource, Transition};
use tabpilot_core::{PilotError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    SetText,
    Activate,
    PasteImage,
    Observe,
}

/// One step as written in a flow file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub action: ActionKind,
    /// Literal value for `set_text` / `paste_image`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Context key for `set_text` / `paste_image`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub then: Transition,
    #[serde(default)]
    pub fatal: bool,
}

/// A named, reusable step list bound to the pages it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Glob (`*` wildcard) matched against tab URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ticks: Option<u32>,
    /// Send the tab's HTML upstream after a successful run.
    #[serde(default)]
    pub capture: bool,
    /// `docType` attached to the captured HTML.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub steps: Vec<StepSpec>,
}

impl FlowDefinition {
    /// Turn the specs into engine steps, rejecting malformed ones.
    pub fn build(&self) -> Result<Vec<Step>> {
        if self.steps.is_empty() {
            return Err(PilotError::ConfigValidation {
                field: format!("flows.{}.steps", self.name),
                reason: "flow has no steps".into(),
            });
        }

        self.steps
            .iter()
            .map(|spec| {
                let field = format!("flows.{}.steps.{}", self.name, spec.name);
                if spec.selector.trim().is_empty() {
                    return Err(PilotError::ConfigValidation {
                        field,
                        reason: "selector is empty".into(),
                    });
                }

                let mut query = Query::css(&spec.selector);
                query.text = spec.text.clone();
                query.index = spec.index;

                let step = Step::new(&spec.name, query);
                let step = match spec.action {
                    ActionKind::Click => step.click(),
                    ActionKind::Activate => step.activate(),
                    ActionKind::Observe => step,
                    ActionKind::SetText => step.set_text(text_source(spec, &field)?),
                    ActionKind::PasteImage => step.paste_image(text_source(spec, &field)?),
                };
                let step = step.then(spec.then);
                Ok(if spec.fatal { step.fatal() } else { step })
            })
            .collect()
    }

    /// Apply this flow's budget overrides on top of `base`.
    pub fn settings(&self, base: &EngineSettings) -> EngineSettings {
        let mut settings = base.clone();
        if let Some(secs) = self.max_duration_secs {
            settings.max_duration = Duration::from_secs(secs);
        }
        if let Some(ticks) = self.max_ticks {
            settings.max_ticks = ticks;
        }
        settings
    }

    /// Whether a tab URL belongs to this flow. Flows without a pattern match anything.
    pub fn matches_url(&self, url: &str) -> bool {
        match self.url_pattern {
            None => true,
            Some(ref pattern) => glob_regex(pattern)
                .map(|re| re.is_match(url))
                .unwrap_or(false),
        }
    }
}

fn text_source(spec: &StepSpec, field: &str) -> Result<TextSource> {
    match (&spec.value, &spec.from) {
        (Some(v), None) => Ok(TextSource::Literal(v.clone())),
        (None, Some(k)) => Ok(TextSource::Context(k.clone())),
        _ => Err(PilotError::ConfigValidation {
            field: field.to_string(),
            reason: "needs exactly one of `value` or `from`".into(),
        }),
    }
}

fn glob_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$")).ok()
}

/// Flows by name.
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, FlowDefinition>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow after checking it builds. A later flow with the same
    /// name replaces the earlier one.
    pub fn register(&mut self, flow: FlowDefinition) -> Result<()> {
        flow.build()?;
        if self.flows.contains_key(&flow.name) {
            warn!(flow = %flow.name, "flow redefined, replacing");
        }
        self.flows.insert(flow.name.clone(), flow);
        Ok(())
    }

    /// Load every `*.toml` file in `dir` as one flow each.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            debug!(dir = %dir.display(), "flows directory not found, skipping");
            return Ok(0);
        }
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
            .collect();
        entries.sort();

        let mut loaded = 0;
        for path in entries {
            let raw = std::fs::read_to_string(&path)?;
            let flow: FlowDefinition = toml::from_str(&raw).map_err(|e| {
                PilotError::Config(format!("failed to parse {}: {}", path.display(), e))
            })?;
            self.register(flow)?;
            loaded += 1;
        }
        info!(dir = %dir.display(), count = loaded, "loaded flows");
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.flows.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
