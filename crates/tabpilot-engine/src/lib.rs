//! # tabpilot-engine
//!
//! Drives a live document through a priority-ordered list of wait-then-act
//! steps. The engine owns control flow and timing only; finding and touching
//! elements goes through the injected [`Locator`] and [`Actuator`].

pub mod capability;
pub mod engine;
pub mod flow;
pub mod step;

pub use capability::{Actuator, ElementRef, Located, Locator, Query};
pub use engine::{Engine, EngineSettings, RunReport, RunResult};
pub use flow::{ActionKind, FlowDefinition, FlowRegistry, StepSpec};
pub use step::{Step, StepAction, TextSource, Transition};
