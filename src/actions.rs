//! The action engine: executes a watch's scripted interaction in order.

use std::path::Path;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::browser::{FrameId, Locator, Page};
use crate::error::{Result, WatchError};
use crate::watch::{Action, ActionKind, Condition};

/// Default wait for selector/navigation actions (30s)
const DEFAULT_WAIT_MS: u64 = 30_000;

/// Mutable state threaded through an action script.
/// `setVariable` writes slots; `evaluate` stores its result at `evalResult`.
#[derive(Debug, Default)]
pub struct ActionContext {
    pub vars: Map<String, Value>,
}

impl ActionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    fn truthy(&self, name: &str) -> bool {
        match self.vars.get(name) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}

/// Run the script. A failing action aborts unless it is `optional`.
pub fn run_actions(
    page: &mut dyn Page,
    actions: &[Action],
    ctx: &mut ActionContext,
    screenshot_dir: &Path,
) -> Result<()> {
    for action in actions {
        if let Some(condition) = &action.condition {
            if !eval_condition(page, condition, ctx) {
                log::debug!("skipping {} action, condition false", describe(&action.kind));
                continue;
            }
        }

        match execute(page, &action.kind, ctx, screenshot_dir) {
            Ok(()) => {}
            Err(e) if action.optional => {
                log::warn!("optional {} action failed: {}", describe(&action.kind), e);
                continue;
            }
            Err(e) => {
                return Err(WatchError::ActionError(format!(
                    "{} action: {}",
                    describe(&action.kind),
                    e
                )))
            }
        }

        if let Some(delay) = action.delay {
            std::thread::sleep(Duration::from_millis(delay));
        }
    }
    Ok(())
}

fn execute(
    page: &mut dyn Page,
    kind: &ActionKind,
    ctx: &mut ActionContext,
    screenshot_dir: &Path,
) -> Result<()> {
    match kind {
        ActionKind::Wait { ms } => {
            std::thread::sleep(Duration::from_millis(*ms));
            Ok(())
        }
        ActionKind::WaitForSelector { selector, timeout } => Ok(page.wait_for_selector(
            &Locator::auto(selector),
            Duration::from_millis(timeout.unwrap_or(DEFAULT_WAIT_MS)),
        )?),
        ActionKind::WaitForXPath { xpath, timeout } => Ok(page.wait_for_selector(
            &Locator::xpath(xpath.clone()),
            Duration::from_millis(timeout.unwrap_or(DEFAULT_WAIT_MS)),
        )?),
        ActionKind::WaitForNavigation { timeout } => Ok(page.wait_for_navigation(
            Duration::from_millis(timeout.unwrap_or(DEFAULT_WAIT_MS)),
        )?),
        ActionKind::Click {
            selector,
            check_frames,
        } => click_with_frames(page, selector, check_frames.unwrap_or(true)),
        ActionKind::Type { selector, text } => Ok(page.fill(&Locator::auto(selector), text)?),
        ActionKind::TypeSlowly {
            selector,
            text,
            key_delay,
        } => Ok(page.type_text(
            &Locator::auto(selector),
            text,
            Duration::from_millis(*key_delay),
        )?),
        ActionKind::PressKey { key } => Ok(page.press_key(key)?),
        ActionKind::Select { selector, value } => {
            Ok(page.select_option(&Locator::auto(selector), value)?)
        }
        ActionKind::Hover { selector } => Ok(page.hover(&Locator::auto(selector))?),
        ActionKind::Scroll { selector, x, y } => match selector {
            Some(selector) => Ok(page.scroll_into_view(&Locator::auto(selector))?),
            None => Ok(page.scroll_by(*x, *y)?),
        },
        ActionKind::Evaluate { script } => {
            let result = page.evaluate(script)?;
            ctx.set("evalResult", result);
            Ok(())
        }
        ActionKind::Screenshot { path } => {
            let path = match path {
                Some(path) => std::path::PathBuf::from(path),
                None => {
                    std::fs::create_dir_all(screenshot_dir)?;
                    screenshot_dir.join(format!(
                        "action-{}.png",
                        chrono::Utc::now().timestamp_millis()
                    ))
                }
            };
            Ok(page.screenshot(&path, false)?)
        }
        ActionKind::SetVariable { name, value } => {
            ctx.set(name, value.clone());
            Ok(())
        }
        ActionKind::Login {
            username_selector,
            username,
            password_selector,
            password,
            submit_selector,
        } => {
            if let (Some(selector), Some(username)) = (username_selector, username) {
                page.fill(&Locator::auto(selector), username)?;
            }
            if let (Some(selector), Some(password)) = (password_selector, password) {
                page.fill(&Locator::auto(selector), password)?;
            }
            if let Some(selector) = submit_selector {
                click_with_frames(page, selector, true)?;
            }
            // navigation after submit is best-effort
            if page
                .wait_for_navigation(Duration::from_millis(DEFAULT_WAIT_MS))
                .is_err()
            {
                log::debug!("login: no navigation observed after submit");
            }
            Ok(())
        }
        ActionKind::Unknown => {
            log::debug!("ignoring unknown action type");
            Ok(())
        }
    }
}

/// Probe the main frame first; fall back to child frames unless disabled.
fn click_with_frames(page: &mut dyn Page, selector: &str, check_frames: bool) -> Result<()> {
    let locator = Locator::auto(selector);
    if !page.query(FrameId::Main, &locator)?.is_empty() {
        return Ok(page.click(FrameId::Main, &locator)?);
    }
    if check_frames {
        for frame in 0..page.child_frames() {
            let frame = FrameId::Child(frame);
            if !page.query(frame, &locator).unwrap_or_default().is_empty() {
                return Ok(page.click(frame, &locator)?);
            }
        }
    }
    Err(WatchError::ActionError(format!(
        "no element matched '{}'",
        selector
    )))
}

/// Evaluate an action's `if` condition. Unknown types pass; a condition
/// that cannot be evaluated counts as false.
fn eval_condition(page: &mut dyn Page, condition: &Condition, ctx: &ActionContext) -> bool {
    match condition {
        Condition::Exists { selector } => page
            .query(FrameId::Main, &Locator::auto(selector))
            .map(|els| !els.is_empty())
            .unwrap_or(false),
        Condition::NotExists { selector } => page
            .query(FrameId::Main, &Locator::auto(selector))
            .map(|els| els.is_empty())
            .unwrap_or(false),
        Condition::TextContains { selector, text } => page
            .query(FrameId::Main, &Locator::auto(selector))
            .ok()
            .and_then(|els| els.into_iter().next())
            .map(|el| el.text.contains(text.as_str()))
            .unwrap_or(false),
        Condition::Variable { name } => ctx.truthy(name),
        Condition::Evaluate { script } => match page.evaluate(script) {
            Ok(Value::Bool(b)) => b,
            Ok(Value::Null) => false,
            Ok(_) => true,
            Err(e) => {
                log::debug!("condition script failed: {}", e);
                false
            }
        },
        Condition::Unknown => true,
    }
}

fn describe(kind: &ActionKind) -> &'static str {
    match kind {
        ActionKind::Wait { .. } => "wait",
        ActionKind::WaitForSelector { .. } => "waitForSelector",
        ActionKind::WaitForXPath { .. } => "waitForXPath",
        ActionKind::WaitForNavigation { .. } => "waitForNavigation",
        ActionKind::Click { .. } => "click",
        ActionKind::Type { .. } => "type",
        ActionKind::TypeSlowly { .. } => "typeSlowly",
        ActionKind::PressKey { .. } => "pressKey",
        ActionKind::Select { .. } => "select",
        ActionKind::Hover { .. } => "hover",
        ActionKind::Scroll { .. } => "scroll",
        ActionKind::Evaluate { .. } => "evaluate",
        ActionKind::Screenshot { .. } => "screenshot",
        ActionKind::SetVariable { .. } => "setVariable",
        ActionKind::Login { .. } => "login",
        ActionKind::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::StubPage;
    use serde_json::json;

    fn actions(value: serde_json::Value) -> Vec<Action> {
        serde_json::from_value(value).unwrap()
    }

    fn run(page: &mut StubPage, script: serde_json::Value) -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ActionContext::new();
        run_actions(page, &actions(script), &mut ctx, dir.path())
    }

    #[test]
    fn test_actions_run_in_order() {
        let mut page = StubPage::default();
        page.add_elements("#accept", vec!["Accept"]);
        run(
            &mut page,
            json!([
                {"type": "click", "selector": "#accept"},
                {"type": "type", "selector": "input[name=q]", "text": "rust"},
                {"type": "pressKey", "key": "Enter"}
            ]),
        )
        .unwrap();
        assert_eq!(
            page.events(),
            vec!["click:#accept@main", "fill:input[name=q]=rust", "press:Enter"]
        );
    }

    #[test]
    fn test_failed_action_aborts() {
        let mut page = StubPage::default();
        let err = run(
            &mut page,
            json!([
                {"type": "click", "selector": "#missing"},
                {"type": "pressKey", "key": "Enter"}
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("click"));
        assert!(page.events().is_empty());
    }

    #[test]
    fn test_optional_failure_continues() {
        let mut page = StubPage::default();
        run(
            &mut page,
            json!([
                {"type": "click", "selector": "#cookie-banner", "optional": true},
                {"type": "pressKey", "key": "Escape"}
            ]),
        )
        .unwrap();
        assert_eq!(page.events(), vec!["press:Escape"]);
    }

    #[test]
    fn test_condition_skips_action() {
        let mut page = StubPage::default();
        page.add_elements("#next", vec!["Next"]);
        run(
            &mut page,
            json!([
                {"type": "click", "selector": "#next",
                 "if": {"type": "exists", "selector": "#next"}},
                {"type": "click", "selector": "#next",
                 "if": {"type": "exists", "selector": "#absent"}},
                {"type": "click", "selector": "#next",
                 "if": {"type": "notExists", "selector": "#absent"}}
            ]),
        )
        .unwrap();
        assert_eq!(page.events().len(), 2);
    }

    #[test]
    fn test_unknown_condition_passes() {
        let mut page = StubPage::default();
        run(
            &mut page,
            json!([
                {"type": "pressKey", "key": "a", "if": {"type": "newFangled"}}
            ]),
        )
        .unwrap();
        assert_eq!(page.events(), vec!["press:a"]);
    }

    #[test]
    fn test_variable_condition() {
        let mut page = StubPage::default();
        run(
            &mut page,
            json!([
                {"type": "setVariable", "name": "loggedIn", "value": false},
                {"type": "pressKey", "key": "l", "if": {"type": "variable", "name": "loggedIn"}},
                {"type": "setVariable", "name": "loggedIn", "value": true},
                {"type": "pressKey", "key": "m", "if": {"type": "variable", "name": "loggedIn"}}
            ]),
        )
        .unwrap();
        assert_eq!(page.events(), vec!["press:m"]);
    }

    #[test]
    fn test_evaluate_stores_result() {
        let mut page = StubPage::default();
        page.eval_results
            .insert("document.readyState".to_string(), json!("complete"));
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ActionContext::new();
        run_actions(
            &mut page,
            &actions(json!([{"type": "evaluate", "script": "document.readyState"}])),
            &mut ctx,
            dir.path(),
        )
        .unwrap();
        assert_eq!(ctx.vars.get("evalResult"), Some(&json!("complete")));
    }

    #[test]
    fn test_click_falls_back_to_frames() {
        let mut page = StubPage::default();
        page.add_frame_elements(1, "#inner", vec!["x"]);
        run(&mut page, json!([{"type": "click", "selector": "#inner"}])).unwrap();
        assert_eq!(page.events(), vec!["click:#inner@frame1"]);
    }

    #[test]
    fn test_click_frames_disabled() {
        let mut page = StubPage::default();
        page.add_frame_elements(0, "#inner", vec!["x"]);
        let err = run(
            &mut page,
            json!([{"type": "click", "selector": "#inner", "checkFrames": false}]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no element matched"));
    }

    #[test]
    fn test_xpath_auto_detection() {
        let mut page = StubPage::default();
        page.add_elements("//button[text()='Go']", vec!["Go"]);
        run(
            &mut page,
            json!([{"type": "click", "selector": "//button[text()='Go']"}]),
        )
        .unwrap();
        assert_eq!(page.events(), vec!["click://button[text()='Go']@main"]);
    }

    #[test]
    fn test_login_composite() {
        let mut page = StubPage::default();
        page.add_elements("#submit", vec!["Sign in"]);
        run(
            &mut page,
            json!([{
                "type": "login",
                "usernameSelector": "#user",
                "username": "alice",
                "passwordSelector": "#pass",
                "password": "hunter2",
                "submitSelector": "#submit"
            }]),
        )
        .unwrap();
        assert_eq!(
            page.events(),
            vec![
                "fill:#user=alice",
                "fill:#pass=hunter2",
                "click:#submit@main",
                "waitForNavigation"
            ]
        );
    }

    #[test]
    fn test_login_partial_fields() {
        let mut page = StubPage::default();
        run(
            &mut page,
            json!([{"type": "login", "usernameSelector": "#user", "username": "alice"}]),
        )
        .unwrap();
        assert_eq!(page.events(), vec!["fill:#user=alice", "waitForNavigation"]);
    }

    #[test]
    fn test_unknown_action_is_noop() {
        let mut page = StubPage::default();
        run(&mut page, json!([{"type": "somethingFromTheFuture"}])).unwrap();
        assert!(page.events().is_empty());
    }
}
