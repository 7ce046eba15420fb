//! The browser driver facade.
//!
//! The watch pipeline is written entirely against these traits so the actual
//! driver is pluggable: the crate bundles a static-page driver
//! ([`crate::static_browser::StaticBrowser`]) and tests script the traits with
//! stub pages. A deployment wrapping a real headless browser implements the
//! same surface.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("no element matched: {0}")]
    NotFound(String),

    #[error("{0} is not supported by this driver")]
    Unsupported(&'static str),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("driver error: {0}")]
    Failed(String),
}

pub type BrowserResult<T> = std::result::Result<T, BrowserError>;

/// Selector language for element queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    Css,
    XPath,
}

/// A selector expression plus its language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub kind: SelectorKind,
    pub expr: String,
}

impl Locator {
    pub fn css(expr: impl Into<String>) -> Self {
        Self {
            kind: SelectorKind::Css,
            expr: expr.into(),
        }
    }

    pub fn xpath(expr: impl Into<String>) -> Self {
        Self {
            kind: SelectorKind::XPath,
            expr: expr.into(),
        }
    }

    /// `//`-prefixed expressions are interpreted as XPath
    pub fn auto(expr: &str) -> Self {
        if expr.starts_with("//") {
            Self::xpath(expr)
        } else {
            Self::css(expr)
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expr)
    }
}

/// Which frame a query or click targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameId {
    Main,
    Child(usize),
}

/// Page-ready criterion for navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitUntil {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
}

impl WaitUntil {
    pub fn parse(s: &str) -> Self {
        match s {
            "domcontentloaded" => WaitUntil::DomContentLoaded,
            "networkidle" => WaitUntil::NetworkIdle,
            _ => WaitUntil::Load,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GotoOptions {
    pub timeout: Duration,
    pub wait_until: WaitUntil,
}

impl Default for GotoOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            wait_until: WaitUntil::Load,
        }
    }
}

/// A cookie pre-added to a browser context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Proxy for a browser or a single context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Per-context configuration assembled from a watch document
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub user_agent: Option<String>,
    pub viewport: Option<(u32, u32)>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub headers: HashMap<String, String>,
    pub cookies: Vec<Cookie>,
    pub proxy: Option<ProxyConfig>,
    /// Storage-state file to restore, when it exists
    pub storage_state: Option<std::path::PathBuf>,
}

/// A snapshot of one matched element, captured at query time
#[derive(Debug, Clone, Default)]
pub struct ElementData {
    /// textContent
    pub text: String,
    /// innerText (visible text)
    pub inner_text: String,
    pub inner_html: String,
    pub outer_html: String,
    /// The `value` property for form elements
    pub value: Option<String>,
    pub attributes: HashMap<String, String>,
    /// `<option>` entries when the element is a `<select>`
    pub select_options: Vec<SelectOptionData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOptionData {
    pub value: String,
    pub text: String,
}

/// The shared driver handle, launched once per process.
/// Only context creation happens through it, so it is `Sync`.
pub trait Browser: Send + Sync {
    fn new_context(&self, opts: &ContextOptions) -> BrowserResult<Box<dyn BrowserContext>>;
}

/// One isolated browsing context, exclusive to a single pipeline run.
pub trait BrowserContext {
    fn new_page(&mut self) -> BrowserResult<Box<dyn Page>>;

    /// Persist the context's cookies/storage to `path`.
    fn storage_state(&mut self, path: &Path) -> BrowserResult<()>;

    fn close(&mut self) {}
}

/// A single page within a context.
pub trait Page {
    /// Install a request filter that aborts the given resource types.
    fn block_resources(&mut self, types: &[String]) -> BrowserResult<()>;

    fn goto(&mut self, url: &str, opts: &GotoOptions) -> BrowserResult<()>;

    fn url(&self) -> String;

    fn title(&self) -> BrowserResult<String>;

    /// Visible text of the document body.
    fn body_text(&self) -> BrowserResult<String>;

    /// Number of child frames in document order.
    fn child_frames(&self) -> usize;

    fn query(&self, frame: FrameId, locator: &Locator) -> BrowserResult<Vec<ElementData>>;

    fn wait_for_selector(&mut self, locator: &Locator, timeout: Duration) -> BrowserResult<()>;

    fn wait_for_navigation(&mut self, timeout: Duration) -> BrowserResult<()>;

    fn click(&mut self, frame: FrameId, locator: &Locator) -> BrowserResult<()>;

    /// Replace the element's value with `text`.
    fn fill(&mut self, locator: &Locator, text: &str) -> BrowserResult<()>;

    /// Type `text` key by key with a delay between keystrokes.
    fn type_text(&mut self, locator: &Locator, text: &str, key_delay: Duration)
        -> BrowserResult<()>;

    fn press_key(&mut self, key: &str) -> BrowserResult<()>;

    fn select_option(&mut self, locator: &Locator, value: &str) -> BrowserResult<()>;

    fn hover(&mut self, locator: &Locator) -> BrowserResult<()>;

    fn scroll_into_view(&mut self, locator: &Locator) -> BrowserResult<()>;

    fn scroll_by(&mut self, x: i64, y: i64) -> BrowserResult<()>;

    /// Run a script inside the page and return its JSON result.
    /// The script string is forwarded verbatim; the core never interprets it.
    fn evaluate(&mut self, script: &str) -> BrowserResult<Value>;

    fn screenshot(&mut self, path: &Path, full_page: bool) -> BrowserResult<()>;

    fn close(&mut self) {}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_auto() {
        assert_eq!(Locator::auto("//div[@id='x']").kind, SelectorKind::XPath);
        assert_eq!(Locator::auto(".price > span").kind, SelectorKind::Css);
    }

    #[test]
    fn test_wait_until_parse() {
        assert_eq!(WaitUntil::parse("domcontentloaded"), WaitUntil::DomContentLoaded);
        assert_eq!(WaitUntil::parse("networkidle"), WaitUntil::NetworkIdle);
        assert_eq!(WaitUntil::parse("load"), WaitUntil::Load);
        assert_eq!(WaitUntil::parse("bogus"), WaitUntil::Load);
    }
}
