//! Minimal Chrome DevTools Protocol client.
//!
//! Tabs are discovered over the `/json/list` HTTP endpoint; commands go over
//! the tab's WebSocket debugger URL, one short-lived connection per command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use tabpilot_core::{PilotError, Result};

/// A page target exposed by the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: String,
    pub url: String,
    pub title: String,
    pub ws_url: String,
}

/// Keep only `page` targets that expose a debugger URL.
pub fn parse_tabs(list: &[Value]) -> Vec<TabInfo> {
    list.iter()
        .filter(|t| t["type"].as_str() == Some("page"))
        .filter_map(|t| {
            let ws_url = t["webSocketDebuggerUrl"].as_str()?;
            Some(TabInfo {
                id: t["id"].as_str().unwrap_or("").to_string(),
                url: t["url"].as_str().unwrap_or("").to_string(),
                title: t["title"].as_str().unwrap_or("").to_string(),
                ws_url: ws_url.to_string(),
            })
        })
        .collect()
}

/// Pull the value out of a `Runtime.evaluate` response, turning protocol
/// errors and script exceptions into [`PilotError::Device`].
pub fn eval_value(response: &Value) -> Result<Value> {
    if let Some(err) = response.get("error") {
        return Err(PilotError::Device(format!(
            "CDP error: {}",
            err["message"].as_str().unwrap_or("unknown")
        )));
    }
    let result = &response["result"];
    if let Some(details) = result.get("exceptionDetails") {
        let text = details["exception"]["description"]
            .as_str()
            .or_else(|| details["text"].as_str())
            .unwrap_or("script threw");
        return Err(PilotError::Device(format!("script exception: {text}")));
    }
    Ok(result["result"]["value"].clone())
}

pub struct CdpClient {
    /// Base HTTP URL for the DevTools API (e.g. http://127.0.0.1:9222).
    base_url: String,
    http: reqwest::Client,
    command_timeout: Duration,
    next_id: AtomicU64,
}

impl CdpClient {
    pub fn new(host: &str, port: u16, command_timeout: Duration) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            http: reqwest::Client::new(),
            command_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List open page tabs.
    pub async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        let url = format!("{}/json/list", self.base_url);
        let list: Vec<Value> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PilotError::Device(format!("CDP list tabs failed: {e}")))?
            .json()
            .await
            .map_err(|e| PilotError::Device(format!("CDP parse tabs failed: {e}")))?;
        Ok(parse_tabs(&list))
    }

    /// First tab whose URL satisfies `matches`.
    pub async fn find_tab(&self, matches: impl Fn(&str) -> bool) -> Result<Option<TabInfo>> {
        Ok(self.list_tabs().await?.into_iter().find(|t| matches(&t.url)))
    }

    /// Send one CDP command to a tab and wait for its response.
    pub async fn send_command(&self, tab: &TabInfo, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = json!({ "id": id, "method": method, "params": params });

        let (mut ws, _) = connect_async(tab.ws_url.as_str())
            .await
            .map_err(|e| PilotError::Device(format!("WebSocket connect failed: {e}")))?;

        ws.send(Message::Text(message.to_string().into()))
            .await
            .map_err(|e| PilotError::Device(format!("WebSocket send failed: {e}")))?;

        // Chrome may send event notifications before our response.
        let result = tokio::time::timeout(self.command_timeout, async {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(resp) = serde_json::from_str::<Value>(text.as_str())
                            && resp["id"].as_u64() == Some(id)
                        {
                            return Ok(resp);
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(PilotError::Device(format!("WebSocket read error: {e}")));
                    }
                }
            }
            Err(PilotError::Device(
                "WebSocket closed before response received".into(),
            ))
        })
        .await;

        let _ = ws.close(None).await;

        match result {
            Ok(resp) => {
                debug!(tab = %tab.id, method, "CDP command answered");
                resp
            }
            Err(_) => Err(PilotError::Device(format!(
                "CDP command {method} timed out ({}s)",
                self.command_timeout.as_secs()
            ))),
        }
    }

    /// Evaluate `expression` in the tab and return its JSON value.
    pub async fn evaluate(&self, tab: &TabInfo, expression: &str) -> Result<Value> {
        let response = self
            .send_command(
                tab,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        eval_value(&response)
    }
}
