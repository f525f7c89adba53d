//! A live tab as the engine's [`Locator`] and [`Actuator`].
//!
//! Element handles are the serialized [`Query`] itself: locating never
//! marks the document, and every action re-resolves its element so a node
//! replaced between ticks is found again (or reported gone).

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tracing::{debug, trace};

use tabpilot_core::{PilotError, Result};
use tabpilot_engine::{Actuator, ElementRef, Located, Locator, Query};

use crate::cdp::{CdpClient, TabInfo};

/// Resolves `q` to `{ el }` or `{ error }` inside the page.
const FIND_JS: &str = r#"
  const find = (q) => {
    let nodes;
    try { nodes = Array.from(document.querySelectorAll(q.css)); }
    catch (e) { return { error: 'bad selector: ' + e.message }; }
    if (q.text) {
      const needle = q.text.toLowerCase();
      nodes = nodes.filter((n) => {
        const t = n.innerText || n.textContent || n.value || n.getAttribute('aria-label') || '';
        return String(t).toLowerCase().includes(needle);
      });
    }
    return { el: nodes[q.index || 0] || null };
  };
"#;

/// Wrap `body` so it runs with `el` bound to the element matching `query`.
/// Evaluates to `{ found: false }` when nothing matches.
pub fn element_script(query: &Query, body: &str) -> String {
    let q = serde_json::to_string(query).unwrap_or_else(|_| "{}".into());
    format!(
        r#"(() => {{
  {FIND_JS}
  const found = find({q});
  if (found.error) return {{ error: found.error }};
  const el = found.el;
  if (!el) return {{ found: false }};
  {body}
}})()"#
    )
}

pub fn locate_script(query: &Query) -> String {
    element_script(
        query,
        r#"const disabled = el.disabled === true || el.getAttribute('aria-disabled') === 'true';
  const visible = el.getClientRects().length > 0;
  const text = String(el.innerText || el.value || '').trim().slice(0, 40);
  return { found: true, ready: visible && !disabled, label: el.tagName.toLowerCase() + (text ? ' "' + text + '"' : '') };"#,
    )
}

pub fn click_script(query: &Query) -> String {
    element_script(
        query,
        "el.scrollIntoView({ block: 'center' });\n  el.click();\n  return { found: true };",
    )
}

/// Focus the element and select its current content so inserted text replaces it.
pub fn focus_script(query: &Query) -> String {
    element_script(
        query,
        r#"el.scrollIntoView({ block: 'center' });
  el.focus();
  if (el.isContentEditable) { document.execCommand('selectAll', false, null); }
  else if (typeof el.select === 'function') { el.select(); }
  return { found: true };"#,
    )
}

pub fn paste_image_script(query: &Query, image_base64: &str, mime: &str) -> String {
    let data = serde_json::to_string(image_base64).unwrap_or_else(|_| "\"\"".into());
    let mime = serde_json::to_string(mime).unwrap_or_else(|_| "\"image/png\"".into());
    element_script(
        query,
        &format!(
            r#"const bytes = Uint8Array.from(atob({data}), (c) => c.charCodeAt(0));
  const file = new File([bytes], 'image', {{ type: {mime} }});
  const dt = new DataTransfer();
  dt.items.add(file);
  el.focus();
  el.dispatchEvent(new ClipboardEvent('paste', {{ clipboardData: dt, bubbles: true, cancelable: true }}));
  return {{ found: true }};"#
        ),
    )
}

/// Interpret the value a locate script evaluated to.
pub fn parse_located(handle: &str, value: &Value) -> Result<Located> {
    if let Some(err) = value["error"].as_str() {
        return Err(PilotError::Device(err.to_string()));
    }
    if !value["found"].as_bool().unwrap_or(false) {
        return Ok(Located::Absent);
    }
    let element = ElementRef::new(handle);
    let element = match value["label"].as_str() {
        Some(label) => element.with_label(label),
        None => element,
    };
    if value["ready"].as_bool().unwrap_or(false) {
        Ok(Located::Ready(element))
    } else {
        Ok(Located::NotReady(element))
    }
}

/// Guess an image MIME type from its leading bytes.
pub fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/png",
    }
}

/// One browser tab driven over CDP.
#[derive(Clone)]
pub struct CdpPage {
    client: Arc<CdpClient>,
    tab: TabInfo,
}

impl CdpPage {
    pub fn new(client: Arc<CdpClient>, tab: TabInfo) -> Self {
        Self { client, tab }
    }

    pub fn tab(&self) -> &TabInfo {
        &self.tab
    }

    /// Current document HTML.
    pub async fn outer_html(&self) -> Result<String> {
        let value = self
            .client
            .evaluate(&self.tab, "document.documentElement.outerHTML")
            .await?;
        value
            .as_str()
            .map(String::from)
            .ok_or_else(|| PilotError::Device("outerHTML did not return a string".into()))
    }

    /// Current document URL (may differ from the URL the tab was found under).
    pub async fn current_url(&self) -> Result<String> {
        let value = self.client.evaluate(&self.tab, "location.href").await?;
        Ok(value.as_str().unwrap_or(&self.tab.url).to_string())
    }

    fn query_of(target: &ElementRef) -> Result<Query> {
        serde_json::from_str(&target.handle)
            .map_err(|e| PilotError::Device(format!("invalid element handle: {e}")))
    }

    /// Run an element script and fail unless the element was still there.
    async fn on_element(&self, target: &ElementRef, script: String) -> Result<()> {
        let value = self.client.evaluate(&self.tab, &script).await?;
        if let Some(err) = value["error"].as_str() {
            return Err(PilotError::Device(err.to_string()));
        }
        if !value["found"].as_bool().unwrap_or(false) {
            return Err(PilotError::Device(format!(
                "element {} is no longer in the document",
                target.label
            )));
        }
        Ok(())
    }

    async fn press_enter(&self) -> Result<()> {
        for kind in ["keyDown", "keyUp"] {
            let mut params = json!({
                "type": kind,
                "key": "Enter",
                "code": "Enter",
                "windowsVirtualKeyCode": 13,
            });
            if kind == "keyDown" {
                params["text"] = json!("\r");
            }
            self.client
                .send_command(&self.tab, "Input.dispatchKeyEvent", params)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Locator for CdpPage {
    async fn locate(&self, query: &Query) -> Result<Located> {
        let handle = serde_json::to_string(query)?;
        let value = self.client.evaluate(&self.tab, &locate_script(query)).await?;
        let located = parse_located(&handle, &value)?;
        trace!(tab = %self.tab.id, query = %query, ready = located.is_ready(), "located");
        Ok(located)
    }
}

#[async_trait]
impl Actuator for CdpPage {
    async fn click(&self, target: &ElementRef) -> Result<()> {
        let query = Self::query_of(target)?;
        self.on_element(target, click_script(&query)).await?;
        debug!(tab = %self.tab.id, element = %target.label, "clicked");
        Ok(())
    }

    async fn set_text(&self, target: &ElementRef, text: &str) -> Result<()> {
        let query = Self::query_of(target)?;
        self.on_element(target, focus_script(&query)).await?;
        self.client
            .send_command(&self.tab, "Input.insertText", json!({ "text": text }))
            .await?;
        debug!(tab = %self.tab.id, element = %target.label, chars = text.chars().count(), "text inserted");
        Ok(())
    }

    async fn activate(&self, target: &ElementRef) -> Result<()> {
        let query = Self::query_of(target)?;
        self.on_element(target, focus_script(&query)).await?;
        self.press_enter().await?;
        debug!(tab = %self.tab.id, element = %target.label, "activated");
        Ok(())
    }

    async fn paste_image(&self, target: &ElementRef, image_base64: &str) -> Result<()> {
        let bytes = STANDARD
            .decode(image_base64)
            .map_err(|e| PilotError::Device(format!("image is not valid base64: {e}")))?;
        let mime = sniff_image_mime(&bytes);
        let query = Self::query_of(target)?;
        self.on_element(target, paste_image_script(&query, image_base64, mime))
            .await?;
        debug!(tab = %self.tab.id, element = %target.label, bytes = bytes.len(), mime, "image pasted");
        Ok(())
    }
}
