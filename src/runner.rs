//! One end-to-end pipeline run for a single watch.
//!
//! `Runner::run` never returns an error: every failure is captured in the
//! returned [`RunOutcome`] and fed into the consecutive-error machinery.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::actions::{self, ActionContext};
use crate::browser::{Browser, ContextOptions, GotoOptions, Locator, Page, WaitUntil};
use crate::compare::{self, ChangeRecord};
use crate::error::Result;
use crate::extract;
use crate::notify::Notifier;
use crate::settings::Settings;
use crate::state::{now_iso, StateStore};
use crate::watch::WatchConfig;

/// Default navigation timeout (60s)
const DEFAULT_NAV_TIMEOUT_MS: u64 = 60_000;

/// Post-action settle wait for `waitForSelector` (30s)
const SETTLE_TIMEOUT_MS: u64 = 30_000;

/// The result record of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub success: bool,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<ChangeRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_screenshot: Option<String>,
    /// ISO-8601 instant the run finished
    pub timestamp: String,
}

pub struct Runner {
    pub settings: Settings,
    browser: Arc<dyn Browser>,
    store: StateStore,
    notifier: Notifier,
    error_counts: Mutex<HashMap<String, u32>>,
}

impl Runner {
    pub fn new(settings: Settings, browser: Arc<dyn Browser>) -> Self {
        let store = StateStore::new(settings.state_dir.clone());
        let notifier = Notifier::new(&settings);
        Self {
            settings,
            browser,
            store,
            notifier,
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn consecutive_errors(&self, watch_id: &str) -> u32 {
        *self.error_counts.lock().unwrap().get(watch_id).unwrap_or(&0)
    }

    /// Run the full pipeline, dispatching notifications.
    pub fn run(&self, watch: &WatchConfig) -> RunOutcome {
        self.run_with_options(watch, true)
    }

    /// Run the full pipeline; `dispatch_notifications: false` is used by the
    /// CLI `test` command to dry-run a watch.
    pub fn run_with_options(&self, watch: &WatchConfig, dispatch_notifications: bool) -> RunOutcome {
        let id = watch.watch_id();
        log::info!("checking '{}' ({})", watch.name, id);

        let mut context = match self.browser.new_context(&self.context_options(watch, &id)) {
            Ok(context) => context,
            Err(e) => return self.failure(watch, &id, e.to_string(), None, dispatch_notifications),
        };

        let mut page = match context.new_page() {
            Ok(page) => page,
            Err(e) => {
                context.close();
                return self.failure(watch, &id, e.to_string(), None, dispatch_notifications);
            }
        };

        let outcome = match self.pipeline(page.as_mut(), watch, &id) {
            Ok((data, changes, previous)) => {
                if watch.persist_session {
                    let path = self.session_state_path(&id);
                    if let Err(e) = context.storage_state(&path) {
                        log::warn!("watch '{}': session persist failed: {}", watch.name, e);
                    }
                }
                self.error_counts.lock().unwrap().insert(id.clone(), 0);

                match (&changes, &previous) {
                    (Some(changes), Some(previous)) if !changes.is_empty() => {
                        log::info!(
                            "watch '{}': {} change(s) detected",
                            watch.name,
                            changes.len()
                        );
                        if dispatch_notifications {
                            self.notifier
                                .notify_changes(watch, &id, changes, &data, previous);
                        }
                    }
                    _ => log::info!("watch '{}': no changes", watch.name),
                }

                RunOutcome {
                    success: true,
                    id: id.clone(),
                    data: Some(data),
                    changes,
                    error: None,
                    error_screenshot: None,
                    timestamp: now_iso(),
                }
            }
            Err(e) => {
                let screenshot = if watch.screenshot_on_error {
                    self.error_screenshot(page.as_mut(), &id)
                } else {
                    None
                };
                self.failure(watch, &id, e.to_string(), screenshot, dispatch_notifications)
            }
        };

        page.close();
        context.close();
        outcome
    }

    /// fetch -> act -> settle -> extract -> compare -> persist
    fn pipeline(
        &self,
        page: &mut dyn Page,
        watch: &WatchConfig,
        id: &str,
    ) -> Result<(
        Map<String, Value>,
        Option<Vec<ChangeRecord>>,
        Option<Map<String, Value>>,
    )> {
        if !watch.block_resources.is_empty() {
            page.block_resources(&watch.block_resources)?;
        }

        self.navigate(page, watch)?;

        let mut action_ctx = ActionContext::new();
        actions::run_actions(
            page,
            &watch.actions,
            &mut action_ctx,
            &self.settings.screenshot_dir,
        )?;

        if let Some(selector) = &watch.wait_for_selector {
            // settle wait; failure is silent
            if let Err(e) = page.wait_for_selector(
                &Locator::auto(selector),
                Duration::from_millis(SETTLE_TIMEOUT_MS),
            ) {
                log::debug!("watch '{}': settle wait gave up: {}", watch.name, e);
            }
        }
        if let Some(ms) = watch.wait_ms {
            std::thread::sleep(Duration::from_millis(ms));
        }

        let data = extract::run_extractors(page, watch, id, &self.settings.screenshot_dir);

        let previous = self.store.load(id).and_then(|s| s.data);
        let changes = previous
            .as_ref()
            .map(|prev| compare::compute_changes(watch, &data, prev));

        self.store.record_success(id, data.clone())?;

        Ok((data, changes, previous))
    }

    /// Navigate under the retry policy: up to `retries` attempts with
    /// exponential backoff `base * 2^(attempt-1)`.
    fn navigate(&self, page: &mut dyn Page, watch: &WatchConfig) -> Result<()> {
        let attempts = watch.retries.unwrap_or(self.settings.max_retries).max(1);
        let opts = GotoOptions {
            timeout: Duration::from_millis(watch.timeout.unwrap_or(DEFAULT_NAV_TIMEOUT_MS)),
            wait_until: watch
                .wait_until
                .as_deref()
                .map(WaitUntil::parse)
                .unwrap_or_default(),
        };

        for attempt in 1..=attempts {
            match page.goto(&watch.url, &opts) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let backoff = self.settings.retry_base_delay_ms * (1u64 << (attempt - 1));
                    log::warn!(
                        "watch '{}': navigation attempt {}/{} failed ({}), retrying in {}ms",
                        watch.name,
                        attempt,
                        attempts,
                        e,
                        backoff
                    );
                    std::thread::sleep(Duration::from_millis(backoff));
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("attempts >= 1")
    }

    fn failure(
        &self,
        watch: &WatchConfig,
        id: &str,
        error: String,
        screenshot: Option<String>,
        dispatch_notifications: bool,
    ) -> RunOutcome {
        let failures = {
            let mut counts = self.error_counts.lock().unwrap();
            let count = counts.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        log::error!(
            "watch '{}': run failed ({} consecutive): {}",
            watch.name,
            failures,
            error
        );

        if let Err(e) = self.store.record_failure(id, &error) {
            log::warn!("watch '{}': could not persist error state: {}", watch.name, e);
        }

        let threshold = watch
            .error_threshold
            .unwrap_or(self.settings.error_notify_threshold);
        if dispatch_notifications && watch.notify_on_error && failures >= threshold {
            self.notifier.notify_error(watch, id, failures, &error);
        }

        RunOutcome {
            success: false,
            id: id.to_string(),
            data: None,
            changes: None,
            error: Some(error),
            error_screenshot: screenshot,
            timestamp: now_iso(),
        }
    }

    /// Best-effort full-page screenshot on failure.
    fn error_screenshot(&self, page: &mut dyn Page, id: &str) -> Option<String> {
        if std::fs::create_dir_all(&self.settings.screenshot_dir).is_err() {
            return None;
        }
        let path = self.settings.screenshot_dir.join(format!(
            "error-{}-{}.png",
            id,
            chrono::Utc::now().timestamp_millis()
        ));
        match page.screenshot(&path, true) {
            Ok(()) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                log::debug!("error screenshot failed: {}", e);
                None
            }
        }
    }

    fn session_state_path(&self, id: &str) -> PathBuf {
        self.settings.session_dir.join(id).join("state.json")
    }

    fn context_options(&self, watch: &WatchConfig, id: &str) -> ContextOptions {
        let storage_state = if watch.persist_session {
            let path = self.session_state_path(id);
            path.exists().then_some(path)
        } else {
            None
        };
        ContextOptions {
            user_agent: watch.user_agent.clone(),
            viewport: watch.viewport.as_ref().map(|v| (v.width, v.height)),
            locale: watch.locale.clone(),
            timezone: watch.timezone.clone(),
            headers: watch.headers.clone(),
            cookies: watch.cookies.clone(),
            proxy: watch.proxy.clone(),
            storage_state,
        }
    }
}
