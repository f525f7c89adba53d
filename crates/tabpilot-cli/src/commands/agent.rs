use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tabpilot_config::ConfigLoader;
use tabpilot_core::{Command, CommandResult, PilotError, TransferMeta};
use tabpilot_engine::{EngineSettings, FlowDefinition, FlowRegistry};
use tabpilot_relay::{RelayTransport, TransferOutcome, WsConnector};

use super::runner::FlowRunner;

/// Command that re-reads the config file and flow definitions.
const RELOAD_COMMAND: &str = "reload";

/// How long a capturing command waits for the receiver before reporting.
const CAPTURE_VERDICT_WAIT: Duration = Duration::from_secs(120);

pub(super) async fn cmd_agent(config_loader: ConfigLoader) -> tabpilot_core::Result<()> {
    let config = config_loader.get();
    let mut registry = config.flow_registry()?;
    let mut base = config.engine.settings();

    println!("🧭 tabpilot agent v{}", env!("CARGO_PKG_VERSION"));
    println!("   Relay: {}", config.relay.url);
    println!(
        "   Browser: http://{}:{}",
        config.device.cdp_host, config.device.cdp_port
    );
    println!("   Flows: {}", registry.names().join(", "));
    println!();

    let (transport, mut commands) =
        RelayTransport::start(config.relay.settings(), Arc::new(WsConnector));
    let runner = Arc::new(FlowRunner::new(&config.device));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = commands.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };

        if command.command == RELOAD_COMMAND {
            let result = match reload(&config_loader) {
                Ok((new_registry, new_base)) => {
                    let detail = format!("{} flows", new_registry.len());
                    registry = new_registry;
                    base = new_base;
                    CommandResult::ok(RELOAD_COMMAND, Some(detail))
                }
                Err(e) => {
                    warn!(error = %e, "reload failed, keeping current configuration");
                    CommandResult::failed(RELOAD_COMMAND, e.to_string())
                }
            };
            report(&transport, result);
            continue;
        }

        let flow = registry.get(&command.command).cloned();
        let runner = Arc::clone(&runner);
        let transport = transport.clone();
        let abort = shutdown.child_token();
        let base = base.clone();
        tokio::spawn(async move {
            let result = execute(command, flow, &base, &runner, &transport, &abort).await;
            report(&transport, result);
        });
    }

    transport.dispose().await;
    Ok(())
}

fn reload(loader: &ConfigLoader) -> tabpilot_core::Result<(FlowRegistry, EngineSettings)> {
    loader.reload()?;
    let config = loader.get();
    Ok((config.flow_registry()?, config.engine.settings()))
}

fn report(transport: &RelayTransport, result: CommandResult) {
    if result.ok {
        info!(command = %result.command, detail = result.detail.as_deref().unwrap_or(""), "command done");
    } else {
        warn!(command = %result.command, detail = result.detail.as_deref().unwrap_or(""), "command failed");
    }
    if let Err(e) = transport.send_frame(&result.into_frame()) {
        error!(error = %e, "could not queue command result");
    }
}

/// Run the flow a command names and describe the outcome.
async fn execute(
    command: Command,
    flow: Option<FlowDefinition>,
    base: &EngineSettings,
    runner: &FlowRunner,
    transport: &RelayTransport,
    abort: &CancellationToken,
) -> CommandResult {
    let name = command.command.clone();
    let Some(flow) = flow else {
        let err = PilotError::TriggerNotFound(format!("no flow named '{name}'"));
        return CommandResult::failed(name, err.to_string());
    };

    let run = match runner.run(&flow, base, &command.context(), abort).await {
        Ok(run) => run,
        Err(e) => return CommandResult::failed(name, e.to_string()),
    };
    let executed = match run.report.into_result() {
        Ok(executed) => executed,
        Err(e) => return CommandResult::failed(name, e.to_string()),
    };

    let detail = format!("executed {}", executed.join(", "));
    if !flow.capture {
        return CommandResult::ok(name, Some(detail));
    }
    let captured = capture(&run.page, &flow, transport).await;
    if let Err(ref e) = captured {
        warn!(flow = %flow.name, error = %e, "capture failed");
    }
    capture_result(name, detail, captured)
}

/// Fold the receiver's verdict on a capture into the command result.
fn capture_result(
    name: String,
    detail: String,
    captured: tabpilot_core::Result<TransferOutcome>,
) -> CommandResult {
    match captured {
        Ok(TransferOutcome::Saved { id, path }) => {
            let stored = path.unwrap_or_else(|| "already saved".into());
            CommandResult::ok(name, Some(format!("{detail}; captured as {id} ({stored})")))
        }
        Ok(TransferOutcome::Deduped { id }) => {
            CommandResult::ok(name, Some(format!("{detail}; already relayed as {id}")))
        }
        Ok(TransferOutcome::Failed { reason, .. }) => {
            CommandResult::failed(name, format!("{detail}; capture failed: {reason}"))
        }
        Err(e) => CommandResult::failed(name, format!("{detail}; capture failed: {e}")),
    }
}

/// Send the tab's document upstream and wait for the receiver's verdict.
async fn capture(
    page: &tabpilot_device::CdpPage,
    flow: &FlowDefinition,
    transport: &RelayTransport,
) -> tabpilot_core::Result<TransferOutcome> {
    let html = page.outer_html().await?;
    let url = page.current_url().await?;
    let meta = match flow.doc_type {
        Some(ref doc_type) => TransferMeta::default().with_doc_type(doc_type.as_str()),
        None => TransferMeta::default(),
    };

    let outcome = transport
        .send_and_wait(&url, &html, meta, CAPTURE_VERDICT_WAIT)
        .await?;
    info!(url = %url, outcome = ?outcome, "capture relayed");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executed() -> String {
        "executed fill, submit".to_string()
    }

    #[test]
    fn saved_capture_reports_ok_with_path() {
        let result = capture_result(
            "post".into(),
            executed(),
            Ok(TransferOutcome::Saved {
                id: "abc".into(),
                path: Some("/data/inbox/p_abc.html".into()),
            }),
        );
        assert!(result.ok);
        assert_eq!(
            result.detail.as_deref(),
            Some("executed fill, submit; captured as abc (/data/inbox/p_abc.html)")
        );
    }

    #[test]
    fn rejected_capture_fails_the_command() {
        let rejected = Err(PilotError::TransferRejected {
            id: "abc".into(),
            reason: "missing_chunks (1 missing)".into(),
        });
        let result = capture_result("post".into(), executed(), rejected);
        assert!(!result.ok);
        let detail = result.detail.unwrap_or_default();
        assert!(detail.starts_with("executed fill, submit; capture failed"));
        assert!(detail.contains("missing_chunks"));
    }

    #[test]
    fn capture_without_verdict_fails_the_command() {
        let silent = Err(PilotError::TransportDisconnected("no verdict for abc".into()));
        let result = capture_result("post".into(), executed(), silent);
        assert!(!result.ok);
    }
}
