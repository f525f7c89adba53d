//! Operator console for `tabpilot serve`: one line of stdin per input.

/// What one console line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    /// Broadcast a `send` command carrying this text.
    Broadcast(String),
    /// Run a named flow on every agent.
    Trigger(String),
    Quit,
    Empty,
}

/// `b <text>` broadcasts, `r <flow>` triggers, `q` quits; any other
/// non-empty line is broadcast as-is.
pub fn parse_console_line(line: &str) -> ConsoleInput {
    let line = line.trim();
    match line {
        "" => ConsoleInput::Empty,
        "q" | "quit" | "exit" => ConsoleInput::Quit,
        _ => {
            if let Some(text) = line.strip_prefix("b ") {
                ConsoleInput::Broadcast(text.trim_start().to_string())
            } else if let Some(flow) = line.strip_prefix("r ") {
                ConsoleInput::Trigger(flow.trim().to_string())
            } else {
                ConsoleInput::Broadcast(line.to_string())
            }
        }
    }
}
