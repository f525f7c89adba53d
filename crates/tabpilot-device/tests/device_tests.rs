#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tabpilot_core::PilotError;
    use tabpilot_device::cdp::{eval_value, parse_tabs};
    use tabpilot_device::page::*;
    use tabpilot_device::{CdpClient, CdpPage, TabInfo};
    use tabpilot_engine::{Actuator, ElementRef, Located, Query};

    // ── Tab discovery ──────────────────────────────────────────

    #[test]
    fn test_parse_tabs_keeps_debuggable_pages() {
        let list = vec![
            json!({
                "id": "A1",
                "type": "page",
                "url": "https://www.example.com/groups/1",
                "title": "Group",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/A1"
            }),
            json!({
                "id": "W1",
                "type": "service_worker",
                "url": "https://www.example.com/sw.js",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/W1"
            }),
            json!({ "id": "B1", "type": "page", "url": "about:blank" }),
        ];
        let tabs = parse_tabs(&list);
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].id, "A1");
        assert_eq!(tabs[0].title, "Group");
    }

    #[test]
    fn test_client_base_url() {
        let client = CdpClient::new("localhost", 9333, Duration::from_secs(5));
        assert_eq!(client.base_url(), "http://localhost:9333");
    }

    // ── Runtime.evaluate responses ─────────────────────────────

    #[test]
    fn test_eval_value_returns_result_value() {
        let resp = json!({
            "id": 4,
            "result": { "result": { "type": "object", "value": { "found": true } } }
        });
        assert_eq!(eval_value(&resp).unwrap(), json!({ "found": true }));
    }

    #[test]
    fn test_eval_value_surfaces_protocol_error() {
        let resp = json!({ "id": 4, "error": { "code": -32000, "message": "No target" } });
        match eval_value(&resp) {
            Err(PilotError::Device(msg)) => assert!(msg.contains("No target")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_eval_value_surfaces_script_exception() {
        let resp = json!({
            "id": 4,
            "result": {
                "result": { "type": "object" },
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": { "description": "TypeError: el is null" }
                }
            }
        });
        let err = eval_value(&resp).unwrap_err();
        assert!(err.to_string().contains("TypeError: el is null"));
    }

    // ── Locate results ─────────────────────────────────────────

    #[test]
    fn test_parse_located_variants() {
        let absent = parse_located("h", &json!({ "found": false })).unwrap();
        assert_eq!(absent, Located::Absent);

        let waiting =
            parse_located("h", &json!({ "found": true, "ready": false, "label": "button" }))
                .unwrap();
        assert_eq!(
            waiting,
            Located::NotReady(ElementRef::new("h").with_label("button"))
        );

        let ready = parse_located("h", &json!({ "found": true, "ready": true })).unwrap();
        assert!(ready.is_ready());
    }

    #[test]
    fn test_parse_located_bad_selector_is_error() {
        let err = parse_located("h", &json!({ "error": "bad selector: ::nope" })).unwrap_err();
        assert!(matches!(err, PilotError::Device(_)));
    }

    // ── Script builders ────────────────────────────────────────

    #[test]
    fn test_scripts_embed_query_as_json() {
        let query = Query::css(r#"div[aria-label="Post"]"#).with_text("Send").nth(1);
        let script = locate_script(&query);
        assert!(script.contains(r#""css":"div[aria-label=\"Post\"]""#));
        assert!(script.contains(r#""text":"Send""#));
        assert!(script.contains(r#""index":1"#));
        assert!(script.contains("ready: visible && !disabled"));
    }

    #[test]
    fn test_locate_script_does_not_write_to_document() {
        let script = locate_script(&Query::css("button"));
        assert!(!script.contains("setAttribute"));
        assert!(!script.contains(".click()"));
    }

    #[test]
    fn test_click_and_focus_scripts() {
        let query = Query::css("textarea");
        assert!(click_script(&query).contains("el.click()"));
        let focus = focus_script(&query);
        assert!(focus.contains("el.focus()"));
        assert!(focus.contains("selectAll"));
    }

    #[test]
    fn test_paste_script_quotes_payload() {
        let script = paste_image_script(&Query::css("div"), "iVBORw0KGgo=", "image/png");
        assert!(script.contains(r#"atob("iVBORw0KGgo=")"#));
        assert!(script.contains(r#"type: "image/png""#));
        assert!(script.contains("ClipboardEvent('paste'"));
    }

    #[test]
    fn test_sniff_image_mime() {
        assert_eq!(sniff_image_mime(&[0x89, b'P', b'N', b'G', 0x0D]), "image/png");
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_image_mime(b"GIF89a"), "image/gif");
        assert_eq!(sniff_image_mime(b"RIFF\0\0\0\0WEBPVP8"), "image/webp");
        assert_eq!(sniff_image_mime(b"??"), "image/png");
    }

    // ── Page capability errors ─────────────────────────────────

    fn offline_page() -> CdpPage {
        let client = Arc::new(CdpClient::new("127.0.0.1", 1, Duration::from_millis(200)));
        CdpPage::new(
            client,
            TabInfo {
                id: "T".into(),
                url: "https://x/".into(),
                title: String::new(),
                ws_url: "ws://127.0.0.1:1/devtools/page/T".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_paste_rejects_invalid_base64_before_touching_tab() {
        let page = offline_page();
        let target = ElementRef::new(serde_json::to_string(&Query::css("div")).unwrap());
        let err = page.paste_image(&target, "%%%").await.unwrap_err();
        assert!(err.to_string().contains("not valid base64"));
    }

    #[tokio::test]
    async fn test_foreign_handle_is_rejected() {
        let page = offline_page();
        let err = page.click(&ElementRef::new("#not-json")).await.unwrap_err();
        assert!(err.to_string().contains("invalid element handle"));
    }
}
