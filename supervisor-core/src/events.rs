//! Structured observability events (NDJSON).
//!
//! Pulse summaries and terminal task events are appended to
//! `<data dir>/events.ndjson`, one JSON object per line. Emission is
//! best-effort and never interrupts the pulse.

use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::task::utc_now;

/// Append one event line. `payload` fields are merged next to `ts`/`event`.
pub fn emit(events_path: &Path, event: &str, payload: Value) {
    let mut record = json!({
        "ts": utc_now(),
        "event": event,
    });
    if let (Some(obj), Some(extra)) = (record.as_object_mut(), payload.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    if let Some(parent) = events_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(events_path) {
        let _ = writeln!(file, "{record}");
    }
}

/// Read all events back (oldest first), skipping unparsable lines.
pub fn read_events(events_path: &Path) -> Vec<Value> {
    let Ok(content) = std::fs::read_to_string(events_path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn events_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.ndjson");

        emit(&path, "pulse", json!({"dispatched": 2, "evaluated": 1}));
        emit(&path, "task_failed", json!({"task": "t1", "reason": "timeout"}));

        let events = read_events(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "pulse");
        assert_eq!(events[0]["dispatched"], 2);
        assert_eq!(events[1]["task"], "t1");
        assert!(events[0]["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.ndjson");
        std::fs::write(&path, "not json\n{\"event\":\"ok\",\"ts\":\"t\"}\n").unwrap();
        assert_eq!(read_events(&path).len(), 1);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_events(&dir.path().join("nope.ndjson")).is_empty());
    }
}
