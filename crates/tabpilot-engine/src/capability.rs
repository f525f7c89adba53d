//! Capabilities the engine is handed instead of touching a document itself.
//!
//! A [`Locator`] answers "is this element there, and is it usable?" against
//! the live document. An [`Actuator`] interacts with an element the locator
//! returned. Both are injected, so the engine can be driven by a real tab or
//! by an in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use tabpilot_core::Result;

/// Declarative description of an element to find.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    /// CSS selector.
    pub css: String,
    /// Only match elements whose visible text contains this (case-insensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Pick the n-th match instead of the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl Query {
    pub fn css(selector: impl Into<String>) -> Self {
        Self {
            css: selector.into(),
            text: None,
            index: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn nth(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.css)?;
        if let Some(ref t) = self.text {
            write!(f, " [text~={t:?}]")?;
        }
        if let Some(i) = self.index {
            write!(f, " [#{i}]")?;
        }
        Ok(())
    }
}

/// Opaque reference to an element found by a [`Locator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef {
    /// Locator-specific handle the matching actuator understands.
    pub handle: String,
    /// Short description for logs (tag, text excerpt).
    pub label: String,
}

impl ElementRef {
    pub fn new(handle: impl Into<String>) -> Self {
        let handle = handle.into();
        Self {
            label: handle.clone(),
            handle,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Result of one locate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    /// Nothing matches right now.
    Absent,
    /// Present, but disabled / not yet interactive.
    NotReady(ElementRef),
    /// Present and usable.
    Ready(ElementRef),
}

impl Located {
    pub fn is_ready(&self) -> bool {
        matches!(self, Located::Ready(_))
    }
}

/// Finds elements in the live document. Must not mutate the document.
#[async_trait]
pub trait Locator: Send + Sync {
    async fn locate(&self, query: &Query) -> Result<Located>;
}

/// Interacts with elements. Each operation is idempotent from the engine's
/// point of view and reports success or failure.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn click(&self, target: &ElementRef) -> Result<()>;

    /// Replace the element's content with `value` as if pasted.
    async fn set_text(&self, target: &ElementRef, value: &str) -> Result<()>;

    /// Focus the element and submit it (Enter / form submit).
    async fn activate(&self, target: &ElementRef) -> Result<()>;

    /// Paste a base64-encoded image into the element.
    async fn paste_image(&self, target: &ElementRef, image_base64: &str) -> Result<()> {
        let _ = image_base64;
        Err(tabpilot_core::PilotError::Device(format!(
            "image paste not supported for {}",
            target.label
        )))
    }
}
