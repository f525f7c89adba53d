use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tabpilot_engine::{EngineSettings, FlowDefinition, FlowRegistry};
use tabpilot_relay::{AssemblerSettings, RelaySettings};

/// Root configuration, mapped from `tabpilot.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TabpilotConfig {
    /// Directory of `*.toml` flow files, loaded before inline `[[flows]]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flows_dir: Option<PathBuf>,
    pub engine: EngineConfig,
    pub relay: RelayConfig,
    pub receiver: ReceiverConfig,
    pub device: DeviceConfig,
    pub logging: LoggingConfig,
    pub flows: Vec<FlowDefinition>,
}

// ── Engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lower bound of the randomized delay between ticks.
    pub poll_min_ms: u64,
    /// Upper bound of the randomized delay between ticks.
    pub poll_max_ms: u64,
    /// Wall-clock budget per run.
    pub max_duration_secs: u64,
    /// Tick budget per run.
    pub max_ticks: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_min_ms: 400,
            poll_max_ms: 900,
            max_duration_secs: 60,
            max_ticks: 300,
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            poll_min: Duration::from_millis(self.poll_min_ms),
            poll_max: Duration::from_millis(self.poll_max_ms),
            max_duration: Duration::from_secs(self.max_duration_secs),
            max_ticks: self.max_ticks,
        }
    }
}

// ── Relay (sending side) ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the relay hub.
    pub url: String,
    /// Raw bytes per chunk (before base64).
    pub chunk_size: usize,
    pub begin_ack_timeout_ms: u64,
    /// How long a saved transfer suppresses identical sends.
    pub dedup_window_secs: u64,
    /// After this long an unfinished transfer may be superseded.
    pub stale_after_secs: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub heartbeat_secs: u64,
    /// Commands buffered before the agent picks them up.
    pub command_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".into(),
            chunk_size: 60_000,
            begin_ack_timeout_ms: 3_000,
            dedup_window_secs: 300,
            stale_after_secs: 60,
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 30_000,
            heartbeat_secs: 20,
            command_buffer: 64,
        }
    }
}

impl RelayConfig {
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            url: self.url.clone(),
            chunk_size: self.chunk_size,
            begin_ack_timeout: Duration::from_millis(self.begin_ack_timeout_ms),
            dedup_window: Duration::from_secs(self.dedup_window_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            reconnect_min: Duration::from_millis(self.reconnect_min_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            command_buffer: self.command_buffer,
        }
    }
}

// ── Receiver (hub side) ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub listen: String,
    pub inbox_dir: PathBuf,
    /// Where `docType = "product"` transfers land.
    pub product_dir: PathBuf,
    /// Ack every n-th chunk; 0 disables chunk acks.
    pub ack_every: usize,
    pub assembly_timeout_secs: u64,
    /// Store single-frame `parsed` documents.
    pub accept_parsed: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8765".into(),
            inbox_dir: PathBuf::from("data/inbox"),
            product_dir: PathBuf::from("data/product"),
            ack_every: 10,
            assembly_timeout_secs: 300,
            accept_parsed: false,
        }
    }
}

impl ReceiverConfig {
    pub fn settings(&self) -> AssemblerSettings {
        AssemblerSettings {
            inbox_dir: self.inbox_dir.clone(),
            product_dir: self.product_dir.clone(),
            ack_every: self.ack_every,
            assembly_timeout: Duration::from_secs(self.assembly_timeout_secs),
            accept_parsed: self.accept_parsed,
        }
    }
}

// ── Device ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Host of Chrome's remote debugging endpoint.
    pub cdp_host: String,
    /// Port of Chrome's remote debugging endpoint (`--remote-debugging-port`).
    pub cdp_port: u16,
    /// Timeout for a single DevTools command.
    pub command_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cdp_host: "127.0.0.1".into(),
            cdp_port: 9222,
            command_timeout_secs: 15,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty", "compact" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl TabpilotConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Engine timing ───
        if self.engine.poll_min_ms > self.engine.poll_max_ms {
            warnings.push(ConfigWarning {
                field: "engine.poll_min_ms".into(),
                message: format!(
                    "poll_min_ms ({}) is greater than poll_max_ms ({})",
                    self.engine.poll_min_ms, self.engine.poll_max_ms
                ),
                severity: WarningSeverity::Error,
                hint: Some("The delay is sampled from [poll_min_ms, poll_max_ms]".into()),
            });
        } else if self.engine.poll_max_ms < 100 {
            warnings.push(ConfigWarning {
                field: "engine.poll_max_ms".into(),
                message: format!("polling every {}ms is very aggressive", self.engine.poll_max_ms),
                severity: WarningSeverity::Warning,
                hint: Some("Sites tend to throttle or flag sub-100ms polling".into()),
            });
        }

        if self.engine.max_duration_secs == 0 || self.engine.max_ticks == 0 {
            warnings.push(ConfigWarning {
                field: "engine".into(),
                message: "max_duration_secs and max_ticks must both be positive".into(),
                severity: WarningSeverity::Error,
                hint: Some("A zero budget times out every run before its first tick".into()),
            });
        }

        // ── Relay ───
        if !(self.relay.url.starts_with("ws://") || self.relay.url.starts_with("wss://")) {
            warnings.push(ConfigWarning {
                field: "relay.url".into(),
                message: format!("'{}' is not a WebSocket URL", self.relay.url),
                severity: WarningSeverity::Error,
                hint: Some("Use e.g. 'ws://127.0.0.1:8765'".into()),
            });
        }

        if self.relay.chunk_size == 0 {
            warnings.push(ConfigWarning {
                field: "relay.chunk_size".into(),
                message: "chunk_size is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 60000".into()),
            });
        }

        if self.relay.reconnect_min_ms == 0 {
            warnings.push(ConfigWarning {
                field: "relay.reconnect_min_ms".into(),
                message: "reconnect_min_ms is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Backoff doubles from this value; use at least 100".into()),
            });
        } else if self.relay.reconnect_min_ms > self.relay.reconnect_max_ms {
            warnings.push(ConfigWarning {
                field: "relay.reconnect_min_ms".into(),
                message: format!(
                    "reconnect_min_ms ({}) is greater than reconnect_max_ms ({})",
                    self.relay.reconnect_min_ms, self.relay.reconnect_max_ms
                ),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        if self.relay.heartbeat_secs == 0 {
            warnings.push(ConfigWarning {
                field: "relay.heartbeat_secs".into(),
                message: "heartbeat_secs is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 20".into()),
            });
        }

        if self.relay.begin_ack_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "relay.begin_ack_timeout_ms".into(),
                message: "chunks will be sent without waiting for begin_ack".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        if self.relay.dedup_window_secs == 0 {
            warnings.push(ConfigWarning {
                field: "relay.dedup_window_secs".into(),
                message: "deduplication of saved transfers is disabled".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Receiver ───
        if self.receiver.ack_every == 0 {
            warnings.push(ConfigWarning {
                field: "receiver.ack_every".into(),
                message: "per-chunk acks are disabled".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // ── Inline flows ───
        let mut seen = HashSet::new();
        for flow in &self.flows {
            if !seen.insert(flow.name.as_str()) {
                warnings.push(ConfigWarning {
                    field: format!("flows.{}", flow.name),
                    message: "flow is defined more than once; the last definition wins".into(),
                    severity: WarningSeverity::Warning,
                    hint: None,
                });
            }
            if let Err(e) = flow.build() {
                warnings.push(ConfigWarning {
                    field: format!("flows.{}", flow.name),
                    message: e.to_string(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
        }

        if self.flows.is_empty() && self.flows_dir.is_none() {
            warnings.push(ConfigWarning {
                field: "flows".into(),
                message: "no flows configured; every command will fail".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Add [[flows]] tables or set flows_dir".into()),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }

    /// All configured flows: `flows_dir` first, then inline `[[flows]]`.
    pub fn flow_registry(&self) -> tabpilot_core::Result<FlowRegistry> {
        let mut registry = FlowRegistry::new();
        if let Some(ref dir) = self.flows_dir {
            registry.load_dir(dir)?;
        }
        for flow in &self.flows {
            registry.register(flow.clone())?;
        }
        Ok(registry)
    }
}
