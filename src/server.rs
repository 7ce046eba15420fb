//! The read-only status surface: dashboard, health JSON, Prometheus
//! metrics, and the manual-trigger endpoint.

use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server};

use crate::error::{Result, WatchError};
use crate::scheduler::{Command, Engine};
use crate::state::now_iso;

/// Bind the status server and serve it on a background thread.
/// Returns the bound address (useful when the port is 0).
pub fn spawn(engine: Arc<Engine>, commands: Sender<Command>, port: u16) -> Result<SocketAddr> {
    let server = Server::http(("0.0.0.0", port))
        .map_err(|e| WatchError::ServerError(format!("bind failed: {}", e)))?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| WatchError::ServerError("no ip listen address".into()))?;
    log::info!("status server listening on {}", addr);

    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            handle(&engine, &commands, request);
        }
    });
    Ok(addr)
}

fn handle(engine: &Engine, commands: &Sender<Command>, request: Request) {
    let (path, query) = match request.url().split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (request.url().to_string(), String::new()),
    };

    let response = match (request.method(), path.as_str()) {
        (Method::Get, "/") | (Method::Get, "/dashboard") => {
            html_response(dashboard_html(engine))
        }
        (Method::Get, "/health") | (Method::Get, "/api/health") => {
            json_response(200, health_json(engine))
        }
        (Method::Get, "/metrics") => text_response(metrics_text(engine)),
        (Method::Post, "/api/trigger") => trigger(engine, commands, &query),
        _ => json_response(404, json!({"error": "not found"})),
    };

    if let Err(e) = request.respond(response) {
        log::debug!("status response failed: {}", e);
    }
}

fn trigger(
    engine: &Engine,
    commands: &Sender<Command>,
    query: &str,
) -> Response<std::io::Cursor<Vec<u8>>> {
    let id = query.split('&').find_map(|pair| {
        pair.strip_prefix("id=")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    });
    let id = match id {
        Some(id) => id,
        None => return json_response(400, json!({"error": "missing id"})),
    };
    if !engine.knows_watch(&id) {
        return json_response(404, json!({"error": format!("unknown watch '{}'", id)}));
    }
    if commands.send(Command::Trigger(id.clone())).is_err() {
        return json_response(500, json!({"error": "scheduler unavailable"}));
    }
    json_response(200, json!({"status": "triggered", "watchId": id}))
}

fn health_json(engine: &Engine) -> serde_json::Value {
    let results = engine.last_results.lock().unwrap();
    let totals = engine.error_totals.lock().unwrap();
    let watches: Vec<_> = engine
        .watch_index
        .lock()
        .unwrap()
        .iter()
        .map(|summary| {
            let result = results.get(&summary.id);
            json!({
                "id": summary.id,
                "name": summary.name,
                "success": result.map(|r| r.success),
                "timestamp": result.map(|r| r.timestamp.clone()),
                "errorCount": totals.get(&summary.id).copied().unwrap_or(0),
            })
        })
        .collect();

    json!({
        "status": "ok",
        "uptime": engine.uptime_secs(),
        "watches": watches,
        "timestamp": now_iso(),
    })
}

fn metrics_text(engine: &Engine) -> String {
    let mut out = String::new();
    out.push_str("# TYPE web_monitor_up gauge\n");
    out.push_str("web_monitor_up 1\n");
    out.push_str("# TYPE web_monitor_uptime_seconds counter\n");
    out.push_str(&format!(
        "web_monitor_uptime_seconds {}\n",
        engine.uptime_secs()
    ));

    let results = engine.last_results.lock().unwrap();
    let totals = engine.error_totals.lock().unwrap();
    let index = engine.watch_index.lock().unwrap();

    out.push_str("# TYPE web_monitor_watch_success gauge\n");
    for summary in index.iter() {
        let success = results
            .get(&summary.id)
            .map(|r| if r.success { 1 } else { 0 })
            .unwrap_or(0);
        out.push_str(&format!(
            "web_monitor_watch_success{{watch=\"{}\",name=\"{}\"}} {}\n",
            label(&summary.id),
            label(&summary.name),
            success
        ));
    }

    out.push_str("# TYPE web_monitor_watch_errors_total counter\n");
    for summary in index.iter() {
        out.push_str(&format!(
            "web_monitor_watch_errors_total{{watch=\"{}\",name=\"{}\"}} {}\n",
            label(&summary.id),
            label(&summary.name),
            totals.get(&summary.id).copied().unwrap_or(0)
        ));
    }
    out
}

/// Escape a Prometheus label value
fn label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn dashboard_html(engine: &Engine) -> String {
    let results = engine.last_results.lock().unwrap();
    let totals = engine.error_totals.lock().unwrap();
    let mut rows = String::new();
    for summary in engine.watch_index.lock().unwrap().iter() {
        let result = results.get(&summary.id);
        let (class, status) = match result.map(|r| r.success) {
            Some(true) => ("ok", "ok"),
            Some(false) => ("err", "failing"),
            None => ("pending", "pending"),
        };
        let timestamp = result.map(|r| r.timestamp.as_str()).unwrap_or("-");
        rows.push_str(&format!(
            "<tr class=\"{}\"><td>{}</td><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            class,
            escape_html(&summary.name),
            escape_html(&summary.url),
            escape_html(&summary.url),
            status,
            timestamp,
            totals.get(&summary.id).copied().unwrap_or(0),
        ));
    }

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta http-equiv=\"refresh\" content=\"10\">\
         <title>pagewatch</title>\
         <style>body{{font-family:sans-serif;margin:2em}}table{{border-collapse:collapse;width:100%}}\
         td,th{{border:1px solid #ccc;padding:6px 10px;text-align:left}}\
         tr.ok td{{background:#e8f5e9}}tr.err td{{background:#ffebee}}</style></head>\
         <body><h1>pagewatch</h1><p>uptime {}s</p>\
         <table><tr><th>watch</th><th>url</th><th>status</th><th>last check</th><th>errors</th></tr>\n{}</table>\
         </body></html>",
        engine.uptime_secs(),
        rows
    )
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn content_type(value: &'static str) -> Header {
    Header::from_bytes(&b"Content-Type"[..], value.as_bytes()).expect("valid header")
}

fn json_response(status: u16, body: serde_json::Value) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string(body.to_string())
        .with_status_code(status)
        .with_header(content_type("application/json"))
}

fn text_response(body: String) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string(body).with_header(content_type("text/plain; version=0.0.4"))
}

fn html_response(body: String) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string(body).with_header(content_type("text/html; charset=utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::StubBrowser;
    use crate::runner::{RunOutcome, Runner};
    use crate::scheduler::WatchSummary;
    use crate::settings::Settings;
    use std::sync::mpsc;

    fn test_engine(dir: &std::path::Path) -> Arc<Engine> {
        let mut settings = Settings::default();
        settings.config_dir = dir.join("config");
        settings.state_dir = dir.join("state");
        settings.screenshot_dir = dir.join("screenshots");
        settings.session_dir = dir.join("sessions");
        let runner = Arc::new(Runner::new(
            settings,
            Arc::new(StubBrowser::with_pages(vec![])),
        ));
        Engine::new(runner)
    }

    fn seed(engine: &Engine) {
        engine.watch_index.lock().unwrap().push(WatchSummary {
            id: "cafe0123".into(),
            name: "Example".into(),
            url: "https://example.com".into(),
        });
        engine.record_outcome(RunOutcome {
            success: true,
            id: "cafe0123".into(),
            data: None,
            changes: None,
            error: None,
            error_screenshot: None,
            timestamp: "2026-08-01T00:00:00Z".into(),
        });
    }

    fn agent() -> ureq::Agent {
        ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into()
    }

    #[test]
    fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        seed(&engine);
        let (tx, _rx) = mpsc::channel();
        let addr = spawn(engine, tx, 0).unwrap();

        let body: serde_json::Value = agent()
            .get(&format!("http://{}/api/health", addr))
            .call()
            .unwrap()
            .into_body()
            .read_json()
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["watches"][0]["id"], "cafe0123");
        assert_eq!(body["watches"][0]["success"], true);
        assert_eq!(body["watches"][0]["timestamp"], "2026-08-01T00:00:00Z");
    }

    #[test]
    fn test_metrics_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        seed(&engine);
        let (tx, _rx) = mpsc::channel();
        let addr = spawn(engine, tx, 0).unwrap();

        let body = agent()
            .get(&format!("http://{}/metrics", addr))
            .call()
            .unwrap()
            .into_body()
            .read_to_string()
            .unwrap();
        assert!(body.contains("web_monitor_up 1"));
        assert!(body.contains("web_monitor_uptime_seconds"));
        assert!(body.contains(
            "web_monitor_watch_success{watch=\"cafe0123\",name=\"Example\"} 1"
        ));
        assert!(body.contains(
            "web_monitor_watch_errors_total{watch=\"cafe0123\",name=\"Example\"} 0"
        ));
    }

    #[test]
    fn test_dashboard_served() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        seed(&engine);
        let (tx, _rx) = mpsc::channel();
        let addr = spawn(engine, tx, 0).unwrap();

        let response = agent().get(&format!("http://{}/", addr)).call().unwrap();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/html"));
        let body = response.into_body().read_to_string().unwrap();
        assert!(body.contains("Example"));
        assert!(body.contains("ok"));
    }

    #[test]
    fn test_trigger_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        seed(&engine);
        let (tx, rx) = mpsc::channel();
        let addr = spawn(engine, tx, 0).unwrap();

        // missing id
        let response = agent()
            .post(&format!("http://{}/api/trigger", addr))
            .send("")
            .unwrap();
        assert_eq!(response.status(), 400);

        // unknown id
        let response = agent()
            .post(&format!("http://{}/api/trigger?id=nope", addr))
            .send("")
            .unwrap();
        assert_eq!(response.status(), 404);

        // known id enqueues a command
        let response = agent()
            .post(&format!("http://{}/api/trigger?id=cafe0123", addr))
            .send("")
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.into_body().read_json().unwrap();
        assert_eq!(body["status"], "triggered");
        match rx.try_recv().unwrap() {
            Command::Trigger(id) => assert_eq!(id, "cafe0123"),
        }
    }

    #[test]
    fn test_unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let (tx, _rx) = mpsc::channel();
        let addr = spawn(engine, tx, 0).unwrap();

        let response = agent()
            .get(&format!("http://{}/nope", addr))
            .call()
            .unwrap();
        assert_eq!(response.status(), 404);
    }
}
