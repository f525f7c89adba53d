use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tabpilot_config::DeviceConfig;
use tabpilot_core::{PilotError, Result};
use tabpilot_device::{CdpClient, CdpPage};
use tabpilot_engine::{Engine, EngineSettings, FlowDefinition, RunReport};

/// A finished run and the tab it drove.
pub(super) struct FlowRun {
    pub page: Arc<CdpPage>,
    pub report: RunReport,
}

/// Runs flows against browser tabs, one run per tab at a time.
pub(super) struct FlowRunner {
    client: Arc<CdpClient>,
    tab_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FlowRunner {
    pub fn new(device: &DeviceConfig) -> Self {
        Self {
            client: Arc::new(CdpClient::new(
                &device.cdp_host,
                device.cdp_port,
                Duration::from_secs(device.command_timeout_secs),
            )),
            tab_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn tab_lock(&self, tab_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.tab_locks.lock().await;
        Arc::clone(locks.entry(tab_id.to_string()).or_default())
    }

    /// Find the flow's tab and drive it. Errors only for setup problems
    /// (bad flow, no browser, no matching tab); run failures are in the report.
    pub async fn run(
        &self,
        flow: &FlowDefinition,
        base: &EngineSettings,
        context: &Map<String, Value>,
        abort: &CancellationToken,
    ) -> Result<FlowRun> {
        let steps = flow.build()?;
        let tab = self
            .client
            .find_tab(|url| flow.matches_url(url))
            .await?
            .ok_or_else(|| {
                PilotError::TriggerNotFound(format!(
                    "no open tab matches flow '{}' ({})",
                    flow.name,
                    flow.url_pattern.as_deref().unwrap_or("*")
                ))
            })?;

        let lock = self.tab_lock(&tab.id).await;
        if lock.try_lock().is_err() {
            info!(tab = %tab.id, flow = %flow.name, "tab busy, waiting for the current run");
        }
        let _guard = lock.lock().await;

        info!(tab = %tab.id, url = %tab.url, flow = %flow.name, "running flow");
        let page = Arc::new(CdpPage::new(Arc::clone(&self.client), tab));
        let engine = Engine::new(page.clone(), page.clone(), flow.settings(base));
        let report = engine.run(&steps, context, abort).await;
        if !report.is_success() {
            warn!(
                flow = %flow.name,
                result = ?report.result,
                ticks = report.ticks,
                last_step = report.last_step.as_deref().unwrap_or("-"),
                "flow did not succeed"
            );
        }
        Ok(FlowRun { page, report })
    }
}
