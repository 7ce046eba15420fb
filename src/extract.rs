//! The extractor engine: runs each declared extractor against a loaded page
//! and produces the `{name -> value}` snapshot.
//!
//! Per-extractor failures never abort the run: the field falls back to its
//! declared `default`, or null.

use std::path::Path;

use serde_json::{Map, Value};

use crate::browser::{BrowserResult, ElementData, FrameId, Locator, Page, SelectorKind};
use crate::error::{Result, WatchError};
use crate::jsonpath;
use crate::transform;
use crate::watch::{Extractor, ExtractorKind, WatchConfig};

/// Run every extractor in declaration order.
pub fn run_extractors(
    page: &mut dyn Page,
    watch: &WatchConfig,
    watch_id: &str,
    screenshot_dir: &Path,
) -> Map<String, Value> {
    let mut snapshot = Map::new();
    for extractor in &watch.extractors {
        let value = match extract_one(page, extractor, watch_id, screenshot_dir) {
            Ok(value) => apply_transforms(extractor, value),
            Err(e) => {
                log::warn!(
                    "watch '{}': extractor '{}' failed: {}",
                    watch.name,
                    extractor.name,
                    e
                );
                extractor.default.clone().unwrap_or(Value::Null)
            }
        };
        snapshot.insert(extractor.name.clone(), value);
    }
    snapshot
}

fn apply_transforms(extractor: &Extractor, value: Value) -> Value {
    if !extractor.transforms.is_empty() {
        return transform::apply_specs(&extractor.transforms, value);
    }
    if let Some(name) = &extractor.transform {
        let options = extractor
            .filter
            .clone()
            .unwrap_or_else(|| extractor.options.clone());
        return transform::apply(name, &options, value);
    }
    value
}

fn extract_one(
    page: &mut dyn Page,
    extractor: &Extractor,
    watch_id: &str,
    screenshot_dir: &Path,
) -> Result<Value> {
    match extractor.kind {
        ExtractorKind::Text => {
            elements(page, extractor).map(|els| string_seq(&els, |el| el.text.trim().to_string()))
        }
        ExtractorKind::InnerText => elements(page, extractor)
            .map(|els| string_seq(&els, |el| el.inner_text.trim().to_string())),
        ExtractorKind::Attribute => {
            let attribute = extractor.attribute.as_deref().unwrap_or_default();
            elements(page, extractor).map(|els| {
                Value::Array(
                    els.iter()
                        .map(|el| {
                            el.attributes
                                .get(attribute)
                                .map(|v| Value::String(v.clone()))
                                .unwrap_or(Value::Null)
                        })
                        .collect(),
                )
            })
        }
        ExtractorKind::Value => elements(page, extractor).map(|els| {
            Value::Array(
                els.iter()
                    .map(|el| {
                        el.value
                            .as_ref()
                            .map(|v| Value::String(v.clone()))
                            .unwrap_or(Value::Null)
                    })
                    .collect(),
            )
        }),
        ExtractorKind::Options => elements(page, extractor).map(|els| {
            Value::Array(
                els.iter()
                    .flat_map(|el| &el.select_options)
                    .map(|opt| {
                        serde_json::json!({ "value": opt.value, "text": opt.text })
                    })
                    .collect(),
            )
        }),
        ExtractorKind::Html => {
            elements(page, extractor).map(|els| string_seq(&els, |el| el.inner_html.clone()))
        }
        ExtractorKind::OuterHtml => {
            elements(page, extractor).map(|els| string_seq(&els, |el| el.outer_html.clone()))
        }
        ExtractorKind::Count => elements(page, extractor).map(|els| Value::from(els.len())),
        ExtractorKind::Exists => elements(page, extractor).map(|els| Value::from(!els.is_empty())),
        ExtractorKind::Url => Ok(Value::String(page.url())),
        ExtractorKind::Title => Ok(Value::String(page.title().map_err(extraction_err)?)),
        ExtractorKind::Xpath => {
            elements(page, extractor).map(|els| string_seq(&els, |el| el.text.trim().to_string()))
        }
        ExtractorKind::Evaluate => {
            let script = extractor.script.as_deref().unwrap_or_default();
            page.evaluate(script).map_err(extraction_err)
        }
        ExtractorKind::Json => {
            let body = page.body_text().map_err(extraction_err)?;
            let parsed: Value = serde_json::from_str(body.trim()).map_err(|e| {
                WatchError::ExtractionError(format!("body is not JSON: {}", e))
            })?;
            Ok(apply_path(extractor, parsed))
        }
        ExtractorKind::JsonFromScript => {
            let selector = extractor
                .selector
                .clone()
                .unwrap_or_else(|| r#"script[type="application/json"]"#.to_string());
            let locator = Locator::css(selector);
            let els = query_with_frames(page, &locator, extractor.check_frames)
                .map_err(extraction_err)?;
            let script = els.first().ok_or_else(|| {
                WatchError::ExtractionError("no matching script element".into())
            })?;
            let parsed: Value = serde_json::from_str(script.inner_html.trim()).map_err(|e| {
                WatchError::ExtractionError(format!("script body is not JSON: {}", e))
            })?;
            Ok(apply_path(extractor, parsed))
        }
        ExtractorKind::Screenshot => {
            std::fs::create_dir_all(screenshot_dir)?;
            let path = screenshot_dir.join(format!("{}-{}.png", watch_id, extractor.name));
            page.screenshot(&path, true).map_err(extraction_err)?;
            Ok(Value::String(path.to_string_lossy().into_owned()))
        }
    }
}

fn extraction_err(e: crate::browser::BrowserError) -> WatchError {
    WatchError::ExtractionError(e.to_string())
}

fn apply_path(extractor: &Extractor, value: Value) -> Value {
    match &extractor.path {
        Some(path) => jsonpath::lookup(&value, path),
        None => value,
    }
}

fn string_seq(els: &[ElementData], f: impl Fn(&ElementData) -> String) -> Value {
    Value::Array(els.iter().map(|el| Value::String(f(el))).collect())
}

fn locator_for(extractor: &Extractor) -> Locator {
    let expr = extractor.selector.clone().unwrap_or_default();
    if extractor.kind == ExtractorKind::Xpath || extractor.xpath {
        Locator {
            kind: SelectorKind::XPath,
            expr,
        }
    } else {
        Locator::auto(&expr)
    }
}

fn elements(page: &dyn Page, extractor: &Extractor) -> Result<Vec<ElementData>> {
    query_with_frames(page, &locator_for(extractor), extractor.check_frames)
        .map_err(extraction_err)
}

/// Query the main frame; when it yields nothing and frames are enabled,
/// retry each child frame in document order and take the first non-empty hit.
fn query_with_frames(
    page: &dyn Page,
    locator: &Locator,
    check_frames: bool,
) -> BrowserResult<Vec<ElementData>> {
    let main = page.query(FrameId::Main, locator)?;
    if !main.is_empty() || !check_frames {
        return Ok(main);
    }
    for frame in 0..page.child_frames() {
        if let Ok(els) = page.query(FrameId::Child(frame), locator) {
            if !els.is_empty() {
                return Ok(els);
            }
        }
    }
    Ok(Vec::new())
}
