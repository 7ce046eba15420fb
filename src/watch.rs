use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::browser::{Cookie, ProxyConfig};
use crate::cron::CronExpr;
use crate::error::{Result, WatchError};

fn default_true() -> bool {
    true
}

fn default_key_delay() -> u64 {
    100
}

/// One declarative watch document, loaded from `${CONFIG_DIR}/*.json`.
/// Unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Stable identifier; derived from the URL when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// User-friendly name
    pub name: String,
    /// URL to monitor
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Check interval in milliseconds; mutually exclusive with `schedule`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Five-field cron expression; mutually exclusive with `interval`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    // Browser context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<Cookie>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    /// Resource types aborted by the request filter (e.g. "image", "font")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_resources: Vec<String>,
    /// Persist storage state across runs for authenticated sessions
    #[serde(default)]
    pub persist_session: bool,

    // Pipeline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    /// Post-action settle: wait for this selector (silent on timeout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_selector: Option<String>,
    /// Post-action settle: fixed sleep in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extractors: Vec<Extractor>,
    /// Default comparator for all extractors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// User-supplied comparator body; unsupported, degrades to `hash`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_comparator: Option<String>,

    // Reliability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Navigation timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Page-ready criterion: load, domcontentloaded, networkidle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<String>,
    #[serde(default)]
    pub screenshot_on_error: bool,
    #[serde(default)]
    pub notify_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_threshold: Option<u32>,

    // Output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template: Option<String>,

    /// File the document was loaded from
    #[serde(skip)]
    pub source_file: Option<PathBuf>,
    /// md5 of the raw file bytes, for hot-reload change detection
    #[serde(skip)]
    pub config_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl WatchConfig {
    /// The stable watch id: user-supplied, or the 8-hex-char prefix of md5(url).
    pub fn watch_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let digest = format!("{:x}", md5::compute(self.url.as_bytes()));
                digest[..8].to_string()
            }
        }
    }

    /// Structural validation beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(WatchError::ConfigError("watch has no url".into()));
        }
        url::Url::parse(&self.url)?;
        if self.name.trim().is_empty() {
            return Err(WatchError::ConfigError("watch has no name".into()));
        }
        if self.interval.is_some() && self.schedule.is_some() {
            return Err(WatchError::ConfigError(
                "declare either `interval` or `schedule`, not both".into(),
            ));
        }
        if let Some(schedule) = &self.schedule {
            CronExpr::parse(schedule)?;
        }
        if self.extractors.is_empty() {
            return Err(WatchError::ConfigError("watch has no extractors".into()));
        }
        for extractor in &self.extractors {
            extractor.validate()?;
        }
        if self.custom_comparator.is_some() {
            log::warn!(
                "watch '{}': customComparator is not supported and degrades to hash",
                self.name
            );
        }
        Ok(())
    }
}

/// One declared extractor, producing a single named value per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extractor {
    /// Result key in the snapshot
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExtractorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Reinterpret a CSS-typed selector as XPath
    #[serde(default)]
    pub xpath: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// JSON path applied to `json` / `jsonFromScript` results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Retry child frames when the main frame yields nothing
    #[serde(default)]
    pub check_frames: bool,
    /// Fallback value when extraction fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// In-page script for the `evaluate` extractor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Single transform by name; options inline on the extractor or under `filter`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    /// Ordered transform pipeline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformSpec>,
    /// Options for the single `transform`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map<String, Value>>,
    /// Per-field comparator override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Inline options for the single `transform`, plus any ignored unknown fields
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtractorKind {
    Text,
    InnerText,
    Attribute,
    Value,
    Options,
    Html,
    OuterHtml,
    Count,
    Exists,
    Url,
    Title,
    Xpath,
    Evaluate,
    Json,
    JsonFromScript,
    Screenshot,
}

impl ExtractorKind {
    /// Whether this extractor type operates on a selector.
    pub fn needs_selector(&self) -> bool {
        matches!(
            self,
            ExtractorKind::Text
                | ExtractorKind::InnerText
                | ExtractorKind::Attribute
                | ExtractorKind::Value
                | ExtractorKind::Options
                | ExtractorKind::Html
                | ExtractorKind::OuterHtml
                | ExtractorKind::Count
                | ExtractorKind::Exists
                | ExtractorKind::Xpath
        )
    }
}

impl Extractor {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WatchError::ConfigError("extractor has no name".into()));
        }
        if self.kind.needs_selector() && self.selector.as_deref().unwrap_or("").is_empty() {
            return Err(WatchError::ConfigError(format!(
                "extractor '{}' requires a selector",
                self.name
            )));
        }
        if self.kind == ExtractorKind::Attribute && self.attribute.is_none() {
            return Err(WatchError::ConfigError(format!(
                "extractor '{}' requires an attribute",
                self.name
            )));
        }
        if self.kind == ExtractorKind::Evaluate && self.script.is_none() {
            return Err(WatchError::ConfigError(format!(
                "extractor '{}' requires a script",
                self.name
            )));
        }
        Ok(())
    }
}

/// A transform reference: a bare name, or an object with options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformSpec {
    Name(String),
    Detailed {
        #[serde(rename = "type")]
        kind: String,
        #[serde(flatten)]
        options: Map<String, Value>,
    },
}

/// One scripted page interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Condition gating the action; skipped when false
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Suppress failures and continue the script
    #[serde(default)]
    pub optional: bool,
    /// Pause after success, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActionKind {
    #[serde(rename_all = "camelCase")]
    Wait {
        #[serde(default)]
        ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    WaitForSelector {
        selector: String,
        #[serde(default)]
        timeout: Option<u64>,
    },
    #[serde(rename = "waitForXPath", rename_all = "camelCase")]
    WaitForXPath {
        xpath: String,
        #[serde(default)]
        timeout: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    WaitForNavigation {
        #[serde(default)]
        timeout: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Click {
        selector: String,
        #[serde(default)]
        check_frames: Option<bool>,
    },
    /// Fill-replace the element's value
    #[serde(rename_all = "camelCase")]
    Type { selector: String, text: String },
    #[serde(rename_all = "camelCase")]
    TypeSlowly {
        selector: String,
        text: String,
        #[serde(default = "default_key_delay")]
        key_delay: u64,
    },
    #[serde(rename_all = "camelCase")]
    PressKey { key: String },
    #[serde(rename_all = "camelCase")]
    Select { selector: String, value: String },
    #[serde(rename_all = "camelCase")]
    Hover { selector: String },
    /// Element-into-view when `selector` is set, else window scroll by x/y
    #[serde(rename_all = "camelCase")]
    Scroll {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        x: i64,
        #[serde(default)]
        y: i64,
    },
    /// Runs in-page; the result is stored at `evalResult` in the action context
    #[serde(rename_all = "camelCase")]
    Evaluate { script: String },
    #[serde(rename_all = "camelCase")]
    Screenshot {
        #[serde(default)]
        path: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SetVariable { name: String, value: Value },
    /// Composite: fill credentials, submit, best-effort navigation wait.
    /// Any subset of the fields may be omitted.
    #[serde(rename_all = "camelCase")]
    Login {
        #[serde(default)]
        username_selector: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password_selector: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        submit_selector: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Condition on an action's `if` field. Unknown types pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    #[serde(rename_all = "camelCase")]
    Exists { selector: String },
    #[serde(rename_all = "camelCase")]
    NotExists { selector: String },
    /// Substring match on the first match's textContent
    #[serde(rename_all = "camelCase")]
    TextContains { selector: String, text: String },
    /// Truthiness of an action-context slot
    #[serde(rename_all = "camelCase")]
    Variable { name: String },
    #[serde(rename_all = "camelCase")]
    Evaluate { script: String },
    #[serde(other)]
    Unknown,
}

/// A per-watch notification channel. The transport is selected via `type`
/// or inferred from which sub-object is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntfy: Option<NtfyChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannel {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default)]
    pub enable_preview: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NtfyChannel {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookChannel {
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Load and validate one watch document.
pub fn load_config_file(path: &Path) -> Result<WatchConfig> {
    let bytes = std::fs::read(path)?;
    let mut config: WatchConfig = serde_json::from_slice(&bytes)?;
    config.validate()?;
    config.source_file = Some(path.to_path_buf());
    config.config_hash = format!("{:x}", md5::compute(&bytes));
    Ok(config)
}

/// Scan a config directory for `*.json` watch documents, in filename order.
/// Invalid documents are collected rather than aborting the scan.
pub fn load_config_dir(dir: &Path) -> (Vec<WatchConfig>, Vec<(PathBuf, WatchError)>) {
    let mut configs = Vec::new();
    let mut rejected = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            rejected.push((dir.to_path_buf(), WatchError::IoError(e)));
            return (configs, rejected);
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();

    for path in paths {
        match load_config_file(&path) {
            Ok(config) => configs.push(config),
            Err(e) => rejected.push((path, e)),
        }
    }

    (configs, rejected)
}
