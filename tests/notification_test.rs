//! Notification routing tests against a local capture server: webhook wire
//! format, first-run suppression, throttling, and error-threshold behavior.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde_json::json;

use pagewatch::runner::Runner;
use pagewatch::settings::Settings;
use pagewatch::static_browser::StaticBrowser;
use pagewatch::watch::WatchConfig;

/// Records every JSON body POSTed to it.
struct CaptureServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl CaptureServer {
    fn start() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        std::thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let mut body = String::new();
                let _ = std::io::Read::read_to_string(request.as_reader(), &mut body);
                if let Ok(value) = serde_json::from_str(&body) {
                    sink.lock().unwrap().push(value);
                }
                let _ = request.respond(tiny_http::Response::from_string("ok"));
            }
        });
        Self { addr, received }
    }

    fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    fn received(&self) -> Vec<serde_json::Value> {
        self.received.lock().unwrap().clone()
    }
}

struct PageServer {
    addr: SocketAddr,
    body: Arc<Mutex<String>>,
}

impl PageServer {
    fn serve(initial: &str) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let body = Arc::new(Mutex::new(initial.to_string()));
        let serving = body.clone();
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                let body = serving.lock().unwrap().clone();
                let _ = request.respond(tiny_http::Response::from_string(body));
            }
        });
        Self { addr, body }
    }

    fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    fn set_body(&self, body: &str) {
        *self.body.lock().unwrap() = body.to_string();
    }
}

fn runner_with_throttle(dir: &std::path::Path, throttle_ms: u64) -> Runner {
    let mut settings = Settings::default();
    settings.state_dir = dir.join("state");
    settings.screenshot_dir = dir.join("screenshots");
    settings.session_dir = dir.join("sessions");
    settings.retry_base_delay_ms = 10;
    settings.notification_throttle_ms = throttle_ms;
    Runner::new(settings, Arc::new(StaticBrowser::launch(None)))
}

fn webhook_watch(page_url: &str, hook_url: &str, extra: serde_json::Value) -> WatchConfig {
    let mut base = json!({
        "name": "Notify Test",
        "url": page_url,
        "extractors": [{"name": "title", "type": "title"}],
        "notifications": [{"webhook": {"url": hook_url}}]
    });
    base.as_object_mut()
        .unwrap()
        .extend(extra.as_object().cloned().unwrap_or_default());
    serde_json::from_value(base).unwrap()
}

fn titled(title: &str) -> String {
    format!("<html><head><title>{}</title></head><body></body></html>", title)
}

#[test]
fn first_run_never_notifies() {
    let site = PageServer::serve(&titled("v1"));
    let hook = CaptureServer::start();
    let dir = tempfile::tempdir().unwrap();
    let runner = runner_with_throttle(dir.path(), 0);
    let watch = webhook_watch(&site.url(), &hook.url(), json!({}));

    let outcome = runner.run(&watch);
    assert!(outcome.success);
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert!(hook.received().is_empty());
}

#[test]
fn change_notification_carries_wire_format() {
    let site = PageServer::serve(&titled("v1"));
    let hook = CaptureServer::start();
    let dir = tempfile::tempdir().unwrap();
    let runner = runner_with_throttle(dir.path(), 0);
    let watch = webhook_watch(&site.url(), &hook.url(), json!({}));

    runner.run(&watch);
    site.set_body(&titled("v2"));
    runner.run(&watch);

    std::thread::sleep(std::time::Duration::from_millis(100));
    let received = hook.received();
    assert_eq!(received.len(), 1);
    let payload = &received[0];
    assert_eq!(payload["watch"], "Notify Test");
    assert_eq!(payload["id"], watch.watch_id());
    assert_eq!(payload["url"], site.url());
    assert!(payload["message"].as_str().unwrap().contains("title"));
    assert!(payload["timestamp"].is_string());
}

#[test]
fn message_template_is_rendered() {
    let site = PageServer::serve(
        r#"<html><body><span id="count">5</span></body></html>"#,
    );
    let hook = CaptureServer::start();
    let dir = tempfile::tempdir().unwrap();
    let runner = runner_with_throttle(dir.path(), 0);
    let watch = webhook_watch(
        &site.url(),
        &hook.url(),
        json!({
            "name": "My Watch",
            "messageTemplate": "{{name}}: {{diff.count}}",
            "extractors": [{
                "name": "count",
                "type": "text",
                "selector": "#count",
                "transforms": ["first", "parseNumber"],
                "comparator": "increased"
            }]
        }),
    );

    runner.run(&watch);
    site.set_body(r#"<html><body><span id="count">8</span></body></html>"#);
    runner.run(&watch);

    std::thread::sleep(std::time::Duration::from_millis(100));
    let received = hook.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["message"], "My Watch: 5 → 8 (+3)");
}

#[test]
fn rapid_changes_are_throttled() {
    let site = PageServer::serve(&titled("v1"));
    let hook = CaptureServer::start();
    let dir = tempfile::tempdir().unwrap();
    // 60s throttle window: the second change must be suppressed
    let runner = runner_with_throttle(dir.path(), 60_000);
    let watch = webhook_watch(&site.url(), &hook.url(), json!({}));

    runner.run(&watch);
    site.set_body(&titled("v2"));
    runner.run(&watch);
    site.set_body(&titled("v3"));
    runner.run(&watch);

    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(hook.received().len(), 1);
}

#[test]
fn error_threshold_notifications_fire_each_run_past_threshold() {
    let hook = CaptureServer::start();
    let dir = tempfile::tempdir().unwrap();
    let runner = runner_with_throttle(dir.path(), 60_000);
    // nothing listens on port 9; every run fails
    let mut watch = webhook_watch("http://127.0.0.1:9/", &hook.url(), json!({}));
    watch.retries = Some(1);
    watch.notify_on_error = true;
    watch.error_threshold = Some(3);

    for _ in 0..4 {
        assert!(!runner.run(&watch).success);
    }

    std::thread::sleep(std::time::Duration::from_millis(100));
    // failures #3 and #4 notify; error notifications bypass the throttle
    let received = hook.received();
    assert_eq!(received.len(), 2);
    assert!(received[0]["message"]
        .as_str()
        .unwrap()
        .contains("3 consecutive"));
    assert!(received[1]["message"]
        .as_str()
        .unwrap()
        .contains("4 consecutive"));
}

#[test]
fn failed_dispatch_does_not_fail_the_run() {
    let site = PageServer::serve(&titled("v1"));
    let dir = tempfile::tempdir().unwrap();
    let runner = runner_with_throttle(dir.path(), 0);
    // webhook target refuses connections
    let watch = webhook_watch(&site.url(), "http://127.0.0.1:9/hook", json!({}));

    runner.run(&watch);
    site.set_body(&titled("v2"));
    let outcome = runner.run(&watch);
    assert!(outcome.success);
    assert_eq!(outcome.changes.unwrap().len(), 1);
}
