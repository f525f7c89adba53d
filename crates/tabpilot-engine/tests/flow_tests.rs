#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tabpilot_core::PilotError;
    use tabpilot_engine::*;

    const POST_FLOW: &str = r#"
name = "post"
url_pattern = "https://www.example.com/groups/*"
max_duration_secs = 45
capture = false

[[steps]]
name = "open-composer"
selector = "div[role='button']"
text = "Write something"
action = "click"

[[steps]]
name = "fill"
selector = "div[role='dialog'] div[contenteditable='true']"
action = "set_text"
from = "text"

[[steps]]
name = "submit"
selector = "div[aria-label='Post']"
action = "click"
then = "terminate"
fatal = true
"#;

    fn post_flow() -> FlowDefinition {
        toml::from_str(POST_FLOW).unwrap()
    }

    #[test]
    fn test_flow_builds_steps_in_order() {
        let steps = post_flow().build().unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].name, "open-composer");
        assert_eq!(steps[0].trigger.text.as_deref(), Some("Write something"));
        assert_eq!(steps[0].action, StepAction::Click);
        assert_eq!(steps[0].then, Transition::Advance);
        assert_eq!(
            steps[1].action,
            StepAction::SetText(TextSource::Context("text".into()))
        );
        assert_eq!(steps[2].then, Transition::Terminate);
        assert!(steps[2].fatal);
    }

    #[test]
    fn test_flow_settings_override_budget() {
        let base = EngineSettings::default();
        let s = post_flow().settings(&base);
        assert_eq!(s.max_duration, Duration::from_secs(45));
        assert_eq!(s.max_ticks, base.max_ticks);
        assert_eq!(s.poll_min, base.poll_min);
    }

    #[test]
    fn test_url_pattern_glob() {
        let flow = post_flow();
        assert!(flow.matches_url("https://www.example.com/groups/12345"));
        assert!(!flow.matches_url("https://www.example.com/marketplace"));
        assert!(!flow.matches_url("http://www.example.com/groups/1"));
    }

    #[test]
    fn test_flow_without_pattern_matches_anything() {
        let mut flow = post_flow();
        flow.url_pattern = None;
        assert!(flow.matches_url("about:blank"));
    }

    #[test]
    fn test_set_text_requires_one_source() {
        let mut flow = post_flow();
        flow.steps[1].from = None;
        match flow.build() {
            Err(PilotError::ConfigValidation { field, .. }) => assert!(field.ends_with("fill")),
            other => panic!("unexpected {other:?}"),
        }

        let mut flow = post_flow();
        flow.steps[1].value = Some("literal".into());
        assert!(flow.build().is_err());
    }

    #[test]
    fn test_empty_flow_rejected() {
        let mut flow = post_flow();
        flow.steps.clear();
        assert!(flow.build().is_err());
    }

    #[test]
    fn test_empty_selector_rejected() {
        let mut flow = post_flow();
        flow.steps[0].selector = "  ".into();
        assert!(flow.build().is_err());
    }

    #[test]
    fn test_registry_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("post.toml")).unwrap();
        f.write_all(POST_FLOW.as_bytes()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = FlowRegistry::new();
        let loaded = registry.load_dir(dir.path()).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(registry.names(), vec!["post"]);
        assert!(registry.get("post").is_some());
    }

    #[test]
    fn test_registry_load_dir_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();
        let mut registry = FlowRegistry::new();
        match registry.load_dir(dir.path()) {
            Err(PilotError::Config(msg)) => assert!(msg.contains("broken.toml")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_registry_missing_dir_is_empty() {
        let mut registry = FlowRegistry::new();
        let loaded = registry
            .load_dir(std::path::Path::new("/nonexistent/tabpilot/flows"))
            .unwrap();
        assert_eq!(loaded, 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_rejects_invalid_flow() {
        let mut flow = post_flow();
        flow.steps.clear();
        let mut registry = FlowRegistry::new();
        assert!(registry.register(flow).is_err());
        assert!(registry.is_empty());
    }
}
