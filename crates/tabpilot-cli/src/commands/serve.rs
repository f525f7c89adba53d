use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tabpilot_config::TabpilotConfig;
use tabpilot_core::Command;
use tabpilot_relay::RelayHub;

use crate::console::{ConsoleInput, parse_console_line};

/// Command name agents map to their default posting flow.
const SEND_COMMAND: &str = "send";

pub(super) async fn cmd_serve(
    config: TabpilotConfig,
    listen: Option<String>,
) -> tabpilot_core::Result<()> {
    let settings = config.receiver.settings();
    let listen = listen.unwrap_or_else(|| config.receiver.listen.clone());

    let hub = RelayHub::new(settings.clone());
    let listener = RelayHub::bind(&listen).await?;

    println!("🛰️  tabpilot relay hub v{}", env!("CARGO_PKG_VERSION"));
    println!("   Listening: ws://{listen}");
    println!("   Inbox: {}", settings.inbox_dir.display());
    println!("   Products: {}", settings.product_dir.display());
    println!("   Type `b <text>` to broadcast, `r <flow>` to trigger a flow, `q` to quit");
    println!();

    let shutdown = CancellationToken::new();
    let server = {
        let hub = hub.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { hub.serve(listener, shutdown).await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        };

        let command = match parse_console_line(&line) {
            ConsoleInput::Empty => continue,
            ConsoleInput::Quit => break,
            ConsoleInput::Broadcast(text) => Command::new(SEND_COMMAND).with_text(text),
            ConsoleInput::Trigger(flow) => Command::new(flow),
        };
        let delivered = hub.broadcast(&command);
        info!(command = %command.command, clients = delivered, "broadcast");
        if delivered == 0 {
            println!("   no agents connected");
        }
    }

    shutdown.cancel();
    match server.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "relay hub task panicked");
            Ok(())
        }
    }
}
