use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio_util::sync::CancellationToken;

use tabpilot_config::TabpilotConfig;
use tabpilot_core::{Command, PilotError};
use tabpilot_engine::RunResult;

use super::runner::FlowRunner;

pub(super) async fn cmd_run(
    config: TabpilotConfig,
    flow_name: String,
    text: Option<String>,
    image_file: Option<PathBuf>,
) -> tabpilot_core::Result<()> {
    let registry = config.flow_registry()?;
    let flow = registry.get(&flow_name).ok_or_else(|| {
        PilotError::TriggerNotFound(format!(
            "no flow named '{flow_name}' (known: {})",
            registry.names().join(", ")
        ))
    })?;

    let mut command = Command::new(flow_name.as_str());
    if let Some(text) = text {
        command = command.with_text(text);
    }
    if let Some(ref path) = image_file {
        let bytes = std::fs::read(path).map_err(|e| {
            PilotError::Config(format!("cannot read image {}: {e}", path.display()))
        })?;
        command = command.with_image(STANDARD.encode(bytes));
    }

    let abort = CancellationToken::new();
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                abort.cancel();
            }
        });
    }

    let runner = FlowRunner::new(&config.device);
    let run = runner
        .run(flow, &config.engine.settings(), &command.context(), &abort)
        .await?;
    let report = run.report;

    let verdict = match report.result {
        RunResult::Success => "✅ success".to_string(),
        RunResult::Timeout => "⏱️  timed out".to_string(),
        RunResult::Failed { ref step, ref reason } => format!("❌ failed at {step}: {reason}"),
        RunResult::Aborted => "🛑 aborted".to_string(),
    };
    println!("{verdict}");
    println!(
        "   {} ticks in {:.1}s, executed: {}",
        report.ticks,
        report.elapsed.as_secs_f64(),
        if report.executed.is_empty() {
            "-".to_string()
        } else {
            report.executed.join(", ")
        }
    );
    if flow.capture {
        println!("   capture is relayed by `tabpilot agent` only");
    }

    report.into_result().map(|_| ())
}
