// JSON output for structured logging (NDJSON, one event per line)

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde_json::json;

use super::errors::FanoutError;
use super::response::Response;
use super::terminal::RunRecap;

/// JSON event writer. Writes to stdout for `--format json`, or appends to a
/// file when used as the run log.
pub struct JsonOutput {
    sink: Mutex<Box<dyn Write + Send>>,
    quiet: bool,
}

impl JsonOutput {
    pub fn new(quiet: bool) -> Self {
        JsonOutput {
            sink: Mutex::new(Box::new(std::io::stdout())),
            quiet,
        }
    }

    /// Open (or create) an append-only run log at `path`
    pub fn to_file(path: &Path) -> Result<Self, FanoutError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FanoutError::Io {
                message: format!("Failed to open run log: {}", e),
                path: Some(path.to_path_buf()),
            })?;

        Ok(JsonOutput {
            sink: Mutex::new(Box::new(file)),
            quiet: false,
        })
    }

    /// Print a header for a run
    pub fn print_run_header(&self, title: &str, hosts: &[String]) {
        if self.quiet {
            return;
        }

        let event = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "run_start",
            "title": title,
            "hosts": hosts,
            "hosts_count": hosts.len(),
        });

        self.emit_json(&event);
    }

    /// Print one Response
    pub fn print_response(&self, response: &Response) {
        if self.quiet && !response.error {
            return;
        }

        let mut event = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "response",
            "index": response.index,
            "response": response,
        });

        if let (Some(label), Some(obj)) = (&response.label, event.as_object_mut()) {
            obj.insert("label".to_string(), json!(label));
        }
        if let (Some(kind), Some(obj)) = (response.kind, event.as_object_mut()) {
            obj.insert("kind".to_string(), json!(kind));
        }

        self.emit_json(&event);
    }

    /// Print the run recap summary
    pub fn print_recap(&self, recap: &RunRecap) {
        if self.quiet {
            return;
        }

        let mut hosts_stats = serde_json::Map::new();
        for (host, stats) in &recap.hosts {
            hosts_stats.insert(
                host.clone(),
                json!({
                    "ok": stats.ok,
                    "changed": stats.changed,
                    "unreachable": stats.unreachable,
                    "failed": stats.failed,
                }),
            );
        }

        let event = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "run_complete",
            "hosts": hosts_stats,
            "total_duration_ms": recap.total_duration.as_millis(),
            "total_responses": recap.total_responses(),
            "total_failed": recap.total_failed(),
            "total_changed": recap.total_changed(),
            "has_failures": recap.has_failures(),
        });

        self.emit_json(&event);
    }

    /// Emit a JSON object as a single line (NDJSON format)
    fn emit_json(&self, value: &serde_json::Value) {
        if let Ok(json_str) = serde_json::to_string(value) {
            let mut sink = self.sink.lock();
            if writeln!(sink, "{}", json_str).is_err() {
                tracing::warn!("failed to write JSON event");
            }
            sink.flush().ok();
        }
    }
}
