//! Wire frames exchanged over the relay WebSocket.
//!
//! Outbound transfer frames (`begin`, `chunk`, `end`, `ping`) are a tagged
//! serde enum. Receiver replies are not uniformly tagged on the wire (result
//! frames carry `ok` but no `type`), so they are classified by hand from a
//! `serde_json::Value`, the same way gateway payloads are picked apart.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::command::Command;
use crate::error::{PilotError, Result};

/// Encoding tag carried on every chunk frame.
pub const CHUNK_ENCODING: &str = "base64";

/// Transfer metadata carried on `begin` and `end`.
///
/// Only `docType` and `salt` participate in the transfer id; everything in
/// `extra` travels to the receiver untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferMeta {
    #[serde(rename = "docType", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TransferMeta {
    pub fn with_doc_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Frames written by the sending side of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Begin {
        id: String,
        total: usize,
        #[serde(rename = "totalBytes")]
        total_bytes: usize,
        #[serde(default)]
        url: String,
        #[serde(flatten)]
        meta: TransferMeta,
    },
    Chunk {
        id: String,
        seq: usize,
        total: usize,
        #[serde(default = "default_encoding")]
        encoding: String,
        data: String,
    },
    End {
        id: String,
        #[serde(default)]
        url: String,
        #[serde(flatten)]
        meta: TransferMeta,
    },
    Ping {
        t: i64,
    },
    /// Whole document in a single frame, without chunking.
    Parsed {
        #[serde(default)]
        url: String,
        #[serde(default)]
        html: String,
    },
    CommandResult {
        command: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

fn default_encoding() -> String {
    CHUNK_ENCODING.to_string()
}

impl Frame {
    /// Transfer id this frame belongs to, if any.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Frame::Begin { id, .. } | Frame::Chunk { id, .. } | Frame::End { id, .. } => Some(id),
            Frame::Ping { .. } | Frame::Parsed { .. } | Frame::CommandResult { .. } => None,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Replies written by the receiving side.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    BeginAck {
        id: String,
    },
    Ack {
        id: Option<String>,
        seq: Option<usize>,
    },
    Saved {
        id: String,
        saved: String,
    },
    Skipped {
        id: Option<String>,
        reason: String,
    },
    Error {
        id: Option<String>,
        error: String,
        missing: Option<usize>,
        seq: Option<usize>,
    },
}

impl Reply {
    pub fn id(&self) -> Option<&str> {
        match self {
            Reply::BeginAck { id } | Reply::Saved { id, .. } => Some(id),
            Reply::Ack { id, .. } | Reply::Skipped { id, .. } | Reply::Error { id, .. } => {
                id.as_deref()
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Reply::BeginAck { id } => json!({ "ok": true, "type": "begin_ack", "id": id }),
            Reply::Ack { id, seq } => json!({ "ok": true, "type": "ack", "id": id, "seq": seq }),
            Reply::Saved { id, saved } => json!({ "ok": true, "saved": saved, "id": id }),
            Reply::Skipped { id, reason } => {
                json!({ "ok": true, "skipped": true, "reason": reason, "id": id })
            }
            Reply::Error {
                id,
                error,
                missing,
                seq,
            } => {
                let mut v = json!({ "ok": false, "error": error, "id": id });
                if let Some(m) = missing {
                    v["missing"] = json!(m);
                }
                if let Some(s) = seq {
                    v["seq"] = json!(s);
                }
                v
            }
        }
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

/// Everything the agent side can receive from the controller/receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply(Reply),
    Command(Command),
    Ping { t: Option<i64> },
    Unknown(Value),
}

impl Inbound {
    /// Classify one inbound text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let v: Value = serde_json::from_str(text)?;
        if !v.is_object() {
            return Err(PilotError::Protocol(format!("expected JSON object, got {v}")));
        }

        let id = v["id"].as_str().map(String::from);
        let seq = v["seq"].as_u64().map(|s| s as usize);
        let kind = v["type"].as_str().unwrap_or("");

        match kind {
            "begin_ack" => {
                let id = id.ok_or_else(|| PilotError::Protocol("begin_ack without id".into()))?;
                return Ok(Inbound::Reply(Reply::BeginAck { id }));
            }
            "ack" => return Ok(Inbound::Reply(Reply::Ack { id, seq })),
            "ping" => return Ok(Inbound::Ping { t: v["t"].as_i64() }),
            _ => {}
        }

        if v.get("command").is_some() {
            let command: Command = serde_json::from_value(v)?;
            return Ok(Inbound::Command(command));
        }

        if let Some(ok) = v["ok"].as_bool() {
            let reply = if !ok {
                Reply::Error {
                    id,
                    error: v["error"].as_str().unwrap_or("unknown").to_string(),
                    missing: v["missing"].as_u64().map(|m| m as usize),
                    seq,
                }
            } else if let Some(saved) = v["saved"].as_str() {
                Reply::Saved {
                    id: id.unwrap_or_default(),
                    saved: saved.to_string(),
                }
            } else if v["skipped"].as_bool().unwrap_or(false) {
                Reply::Skipped {
                    id,
                    reason: v["reason"].as_str().unwrap_or("").to_string(),
                }
            } else {
                Reply::Ack { id, seq }
            };
            return Ok(Inbound::Reply(reply));
        }

        // Older controllers send `{"type": "send", "text": ...}`.
        if !kind.is_empty() && v.get("text").is_some() {
            let mut command: Command = serde_json::from_value(v.clone())?;
            command.command = kind.to_string();
            return Ok(Inbound::Command(command));
        }

        Ok(Inbound::Unknown(v))
    }
}
