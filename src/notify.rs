//! Message rendering, throttling, and fan-out to notification transports.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::compare::ChangeRecord;
use crate::error::{Result, WatchError};
use crate::settings::Settings;
use crate::state::now_iso;
use crate::transform::{fmt_number, js_parse_float, scalar_string};
use crate::watch::{Channel, NtfyChannel, TelegramChannel, WatchConfig, WebhookChannel};

/// `{{name}}`, `{{current.price}}`, `{{diff.count}}`, ...
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{([A-Za-z]+)(?:\.([A-Za-z0-9_-]+))?\}\}").expect("Invalid placeholder regex")
});

/// Precompiled regex for stripping HTML tags from plain-text transports
static HTML_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]+>").expect("Invalid HTML tag regex"));

pub struct Notifier {
    throttle: Duration,
    telegram: Option<crate::settings::TelegramSettings>,
    ntfy_url: Option<String>,
    webhook_url: Option<String>,
    /// instant of the last accepted change notification, per watch id
    timestamps: Mutex<HashMap<String, Instant>>,
}

impl Notifier {
    pub fn new(settings: &Settings) -> Self {
        Self {
            throttle: Duration::from_millis(settings.notification_throttle_ms),
            telegram: settings.telegram.clone(),
            ntfy_url: settings.ntfy_url.clone(),
            webhook_url: settings.webhook_url.clone(),
            timestamps: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a change notification for this watch falls inside the
    /// throttle window.
    pub fn is_throttled(&self, watch_id: &str) -> bool {
        let timestamps = self.timestamps.lock().unwrap();
        timestamps
            .get(watch_id)
            .map(|last| last.elapsed() < self.throttle)
            .unwrap_or(false)
    }

    /// Record an accepted change notification for throttling purposes.
    pub fn mark_notified(&self, watch_id: &str) {
        self.timestamps
            .lock()
            .unwrap()
            .insert(watch_id.to_string(), Instant::now());
    }

    /// Render and dispatch a change notification, subject to throttling.
    pub fn notify_changes(
        &self,
        watch: &WatchConfig,
        watch_id: &str,
        changes: &[ChangeRecord],
        current: &Map<String, Value>,
        previous: &Map<String, Value>,
    ) {
        if self.is_throttled(watch_id) {
            log::info!("watch '{}': change notification throttled", watch.name);
            return;
        }

        let message = match &watch.message_template {
            Some(template) => render_template(template, watch, changes, current, previous),
            None => default_message(watch, changes),
        };
        let title = format!("pagewatch: {}", watch.name);

        let accepted = self.dispatch_all(watch, watch_id, &title, &message);
        if accepted > 0 {
            self.mark_notified(watch_id);
        }
    }

    /// Error notifications bypass the throttle window.
    pub fn notify_error(&self, watch: &WatchConfig, watch_id: &str, failures: u32, error: &str) {
        let title = format!("pagewatch: {} is failing", watch.name);
        let message = format!(
            "{} has failed {} consecutive check(s).\nLast error: {}\n\n{}",
            watch.name, failures, error, watch.url
        );
        self.dispatch_all(watch, watch_id, &title, &message);
    }

    /// Fan out to the watch's channels, or the global transports when the
    /// watch declares none. Returns the number of transports that accepted.
    fn dispatch_all(&self, watch: &WatchConfig, watch_id: &str, title: &str, message: &str) -> usize {
        let mut accepted = 0;

        if watch.notifications.is_empty() {
            if let Some(telegram) = &self.telegram {
                let channel = TelegramChannel {
                    bot_token: telegram.bot_token.clone(),
                    chat_id: telegram.chat_id.clone(),
                    enable_preview: false,
                };
                accepted += self.try_send(watch, "telegram", send_telegram(&channel, title, message));
            }
            if let Some(url) = &self.ntfy_url {
                let channel = NtfyChannel {
                    url: url.clone(),
                    title: None,
                    priority: None,
                    tags: None,
                };
                accepted += self.try_send(watch, "ntfy", send_ntfy(&channel, title, message));
            }
            if let Some(url) = &self.webhook_url {
                let channel = WebhookChannel {
                    url: url.clone(),
                    headers: HashMap::new(),
                };
                accepted += self.try_send(
                    watch,
                    "webhook",
                    send_webhook(&channel, watch, watch_id, message),
                );
            }
            return accepted;
        }

        for channel in &watch.notifications {
            let result = dispatch_channel(channel, watch, watch_id, title, message);
            accepted += self.try_send(watch, channel_kind(channel), result);
        }
        accepted
    }

    fn try_send(&self, watch: &WatchConfig, transport: &str, result: Result<()>) -> usize {
        match result {
            Ok(()) => {
                log::info!("watch '{}': notified via {}", watch.name, transport);
                1
            }
            Err(e) => {
                log::error!("watch '{}': {} dispatch failed: {}", watch.name, transport, e);
                0
            }
        }
    }
}

fn channel_kind(channel: &Channel) -> &str {
    if let Some(kind) = &channel.kind {
        return kind;
    }
    if channel.telegram.is_some() {
        "telegram"
    } else if channel.ntfy.is_some() {
        "ntfy"
    } else if channel.webhook.is_some() {
        "webhook"
    } else {
        "unknown"
    }
}

fn dispatch_channel(
    channel: &Channel,
    watch: &WatchConfig,
    watch_id: &str,
    title: &str,
    message: &str,
) -> Result<()> {
    match channel_kind(channel) {
        "telegram" => {
            let telegram = channel.telegram.as_ref().ok_or_else(|| {
                WatchError::NotificationError("telegram channel without settings".into())
            })?;
            send_telegram(telegram, title, message)
        }
        "ntfy" => {
            let ntfy = channel.ntfy.as_ref().ok_or_else(|| {
                WatchError::NotificationError("ntfy channel without settings".into())
            })?;
            send_ntfy(ntfy, title, message)
        }
        "webhook" => {
            let webhook = channel.webhook.as_ref().ok_or_else(|| {
                WatchError::NotificationError("webhook channel without settings".into())
            })?;
            send_webhook(webhook, watch, watch_id, message)
        }
        other => Err(WatchError::NotificationError(format!(
            "unknown channel type '{}'",
            other
        ))),
    }
}

/// Send via the Telegram Bot API
fn send_telegram(channel: &TelegramChannel, title: &str, message: &str) -> Result<()> {
    let url = format!("https://api.telegram.org/bot{}/sendMessage", channel.bot_token);
    let text = format!("<b>{}</b>\n\n{}", title, message);

    let payload = serde_json::json!({
        "chat_id": channel.chat_id,
        "text": text,
        "parse_mode": "HTML",
        "disable_web_page_preview": !channel.enable_preview,
    });

    ureq::post(&url)
        .header("Content-Type", "application/json")
        .send_json(&payload)?;
    Ok(())
}

/// Send via ntfy; the body is the message with HTML stripped
fn send_ntfy(channel: &NtfyChannel, title: &str, message: &str) -> Result<()> {
    let body = HTML_TAG_RE.replace_all(message, "").into_owned();

    ureq::post(&channel.url)
        .header("Title", channel.title.as_deref().unwrap_or(title))
        .header("Priority", channel.priority.as_deref().unwrap_or("default"))
        .header("Tags", channel.tags.as_deref().unwrap_or("eyes"))
        .send(&body)?;
    Ok(())
}

/// Send a generic webhook with per-channel headers merged over the default
fn send_webhook(
    channel: &WebhookChannel,
    watch: &WatchConfig,
    watch_id: &str,
    message: &str,
) -> Result<()> {
    let payload = serde_json::json!({
        "watch": watch.name,
        "id": watch_id,
        "url": watch.url,
        "message": message,
        "timestamp": now_iso(),
    });

    let mut request = ureq::post(&channel.url).header("Content-Type", "application/json");
    for (key, value) in &channel.headers {
        request = request.header(key, value);
    }
    request.send(&serde_json::to_string(&payload)?)?;
    Ok(())
}

/// The default message: one line per change, set-diff lists for the
/// membership comparators, and a trailing link.
pub fn default_message(watch: &WatchConfig, changes: &[ChangeRecord]) -> String {
    let mut lines = Vec::new();
    for change in changes {
        let added = detail_list(change, "added");
        let removed = detail_list(change, "removed");
        if !added.is_empty() || !removed.is_empty() {
            lines.push(format!("{}:", change.name));
            for item in &added {
                lines.push(format!("  + {}", render_value(item)));
            }
            for item in &removed {
                lines.push(format!("  - {}", render_value(item)));
            }
            continue;
        }

        let diff = change
            .details
            .as_ref()
            .and_then(|d| d.get("diff"))
            .and_then(js_parse_float);
        match diff {
            Some(diff) => lines.push(format!(
                "{}: {} → {} ({})",
                change.name,
                render_value(&change.previous),
                render_value(&change.current),
                signed(diff)
            )),
            None => lines.push(format!(
                "{}: {} → {}",
                change.name,
                render_value(&change.previous),
                render_value(&change.current)
            )),
        }
    }
    lines.push(String::new());
    lines.push(watch.url.clone());
    lines.join("\n")
}

/// Substitute `{{placeholder}}` patterns in a user template.
pub fn render_template(
    template: &str,
    watch: &WatchConfig,
    changes: &[ChangeRecord],
    current: &Map<String, Value>,
    previous: &Map<String, Value>,
) -> String {
    let added: Vec<Value> = changes.iter().flat_map(|c| detail_list(c, "added")).collect();
    let removed: Vec<Value> = changes
        .iter()
        .flat_map(|c| detail_list(c, "removed"))
        .collect();

    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| {
            let head = &caps[1];
            let field = caps.get(2).map(|m| m.as_str());
            match (head, field) {
                ("name", None) => watch.name.clone(),
                ("url", None) => watch.url.clone(),
                ("timestamp", None) => now_iso(),
                ("changes", None) => {
                    serde_json::to_string(changes).unwrap_or_default()
                }
                ("data", None) => {
                    serde_json::to_string(current).unwrap_or_default()
                }
                ("added", None) => join_rendered(&added),
                ("removed", None) => join_rendered(&removed),
                ("addedList", None) => bullet_list(&added),
                ("removedList", None) => bullet_list(&removed),
                ("addedCount", None) => added.len().to_string(),
                ("removedCount", None) => removed.len().to_string(),
                ("current", Some(field)) => {
                    render_value(current.get(field).unwrap_or(&Value::Null))
                }
                ("previous", Some(field)) => {
                    render_value(previous.get(field).unwrap_or(&Value::Null))
                }
                ("diff", Some(field)) => render_diff(
                    previous.get(field).unwrap_or(&Value::Null),
                    current.get(field).unwrap_or(&Value::Null),
                ),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// `prev → curr (+d)` when a prior value exists, else just the current value.
fn render_diff(previous: &Value, current: &Value) -> String {
    if previous.is_null() {
        return render_value(current);
    }
    match (js_parse_float(previous), js_parse_float(current)) {
        (Some(prev), Some(cur)) => format!(
            "{} → {} ({})",
            render_value(previous),
            render_value(current),
            signed(cur - prev)
        ),
        _ => format!("{} → {}", render_value(previous), render_value(current)),
    }
}

fn signed(diff: f64) -> String {
    let rendered = fmt_number(&serde_json::Number::from_f64(diff).unwrap_or_else(|| 0.into()));
    if diff >= 0.0 {
        format!("+{}", rendered)
    } else {
        rendered
    }
}

/// Records render as their `text` or `value` field; everything else is
/// string-coerced (structures serialize as JSON).
fn render_value(value: &Value) -> String {
    if let Value::Object(map) = value {
        for field in ["text", "value"] {
            if let Some(v) = map.get(field) {
                return scalar_string(v);
            }
        }
        return value.to_string();
    }
    scalar_string(value)
}

fn detail_list(change: &ChangeRecord, key: &str) -> Vec<Value> {
    change
        .details
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

fn join_rendered(items: &[Value]) -> String {
    items
        .iter()
        .map(render_value)
        .collect::<Vec<_>>()
        .join(", ")
}

fn bullet_list(items: &[Value]) -> String {
    items
        .iter()
        .map(|item| format!("• {}", render_value(item)))
        .collect::<Vec<_>>()
        .join("\n")
}
