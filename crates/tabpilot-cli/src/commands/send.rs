use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tabpilot_config::TabpilotConfig;
use tabpilot_core::{PilotError, TransferMeta};
use tabpilot_relay::{RelayTransport, TransferOutcome, WsConnector};

pub(super) async fn cmd_send(
    config: TabpilotConfig,
    file: PathBuf,
    key: Option<String>,
    doc_type: Option<String>,
    timeout_secs: u64,
) -> tabpilot_core::Result<()> {
    let bytes = std::fs::read(&file)
        .map_err(|e| PilotError::Config(format!("cannot read {}: {e}", file.display())))?;
    let payload = String::from_utf8_lossy(&bytes);
    let key = key.unwrap_or_else(|| format!("file://{}", file.display()));
    let meta = match doc_type {
        Some(doc_type) => TransferMeta::default().with_doc_type(doc_type),
        None => TransferMeta::default(),
    };

    let (transport, _commands) =
        RelayTransport::start(config.relay.settings(), Arc::new(WsConnector));
    println!("📤 Sending {} ({} bytes) to {}", file.display(), payload.len(), config.relay.url);

    let result = transport
        .send_and_wait(&key, &payload, meta, Duration::from_secs(timeout_secs))
        .await;
    transport.dispose().await;

    match result? {
        TransferOutcome::Saved { id, path } => match path {
            Some(path) => println!("✅ {id} saved to {path}"),
            None => println!("✅ {id} was already saved"),
        },
        TransferOutcome::Deduped { id } => println!("♻️  {id} was sent recently, skipped"),
        TransferOutcome::Failed { .. } => {}
    }
    Ok(())
}
