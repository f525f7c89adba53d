use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::Frame;

/// A command from the controller into the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Which flow to run.
    #[serde(default)]
    pub command: String,
    /// Free-form text payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Optional binary payload, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_image(mut self, image_base64: impl Into<String>) -> Self {
        self.image = Some(image_base64.into());
        self
    }

    /// Key-value bag handed to step actions: `text`, `image`, then any extra fields.
    pub fn context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        for (k, v) in &self.extra {
            if k != "type" {
                ctx.insert(k.clone(), v.clone());
            }
        }
        if let Some(ref text) = self.text {
            ctx.insert("text".into(), Value::String(text.clone()));
        }
        if let Some(ref image) = self.image {
            ctx.insert("image".into(), Value::String(image.clone()));
        }
        ctx
    }
}

/// Outcome reported back across the driver boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandResult {
    pub fn ok(command: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            detail,
        }
    }

    pub fn failed(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: false,
            detail: Some(detail.into()),
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::CommandResult {
            command: self.command,
            ok: self.ok,
            detail: self.detail,
        }
    }
}
