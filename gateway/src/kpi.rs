//! Windowed KPI aggregation over the event log: counts, per-trace command
//! outcomes, send success rate, error-code histogram and latency percentiles.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use chrono::Utc;
use serde_json::Value;

use crate::error::ERROR_INTERNAL;
use crate::events::EVENTS_LOG_NAME;
use crate::util::parse_iso_ts;

/// Linear-interpolated percentile over unsorted samples; empty input is 0.
pub fn percentile(values: &[i64], pct: f64) -> i64 {
    if values.is_empty() {
        return 0;
    }
    let mut ordered: Vec<i64> = values.to_vec();
    ordered.sort_unstable();
    if ordered.len() == 1 {
        return ordered[0];
    }
    let rank = pct.clamp(0.0, 1.0) * (ordered.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(ordered.len() - 1);
    if lo == hi {
        return ordered[lo];
    }
    let frac = rank - lo as f64;
    ((ordered[lo] as f64) * (1.0 - frac) + (ordered[hi] as f64) * frac).round() as i64
}

#[derive(Debug, Default)]
struct TraceOutcome {
    accepted: bool,
    success: bool,
    failed: bool,
}

/// Scans the current event log and renders the KPI text block for the last
/// `hours` (clamped 1..168).
pub fn summarize_gateway_metrics(team_dir: &Path, project_name: &str, hours: i64) -> String {
    let cap_hours = hours.clamp(1, 168);
    let path = team_dir.join("logs").join(EVENTS_LOG_NAME);
    if !path.exists() {
        return format!(
            "orch: {}\nmetrics: no data file\nwindow_hours: {}",
            project_name, cap_hours
        );
    }

    let cutoff = Utc::now() - chrono::Duration::hours(cap_hours);
    let mut total: u64 = 0;
    let mut incoming: u64 = 0;
    let mut accepted: u64 = 0;
    let mut rejected: u64 = 0;
    let mut sent_ok: u64 = 0;
    let mut sent_fail: u64 = 0;
    let mut dispatch_done: u64 = 0;
    let mut direct_done: u64 = 0;
    let mut errors: u64 = 0;
    let mut error_codes: BTreeMap<String, u64> = BTreeMap::new();
    let mut latencies: Vec<i64> = Vec::new();
    let mut trace_state: BTreeMap<String, TraceOutcome> = BTreeMap::new();

    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(_) => {
            return format!(
                "orch: {}\nmetrics: failed to read log\nwindow_hours: {}",
                project_name, cap_hours
            )
        }
    };

    for line in std::io::BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }
        let Ok(row) = serde_json::from_str::<Value>(raw) else {
            continue;
        };
        if !row.is_object() {
            continue;
        }
        let Some(ts) = parse_iso_ts(row.get("timestamp").and_then(Value::as_str).unwrap_or_default()) else {
            continue;
        };
        if ts.with_timezone(&Utc) < cutoff {
            continue;
        }

        total += 1;
        let event = row.get("event").and_then(Value::as_str).unwrap_or_default().trim();
        let status = row
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        let trace_id = row
            .get("trace_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let trace = if trace_id.is_empty() {
            None
        } else {
            Some(trace_state.entry(trace_id).or_default())
        };

        match event {
            "incoming_message" => incoming += 1,
            "command_resolved" => {
                if status == "accepted" {
                    accepted += 1;
                    if let Some(trace) = trace {
                        trace.accepted = true;
                    }
                }
            }
            "input_rejected" => rejected += 1,
            "send_message" => {
                if status == "sent" {
                    sent_ok += 1;
                    if let Some(trace) = trace {
                        trace.success = true;
                    }
                } else {
                    sent_fail += 1;
                    if let Some(trace) = trace {
                        trace.failed = true;
                    }
                }
            }
            "dispatch_completed" => {
                dispatch_done += 1;
                if let Some(trace) = trace {
                    trace.success = true;
                }
            }
            "direct_reply" => {
                direct_done += 1;
                if let Some(trace) = trace {
                    trace.success = true;
                }
            }
            "dispatch_result" => {
                if let Some(trace) = trace {
                    if status == "failed" {
                        trace.failed = true;
                    } else {
                        trace.success = true;
                    }
                }
            }
            "handler_error" => {
                errors += 1;
                let code = {
                    let c = row
                        .get("error_code")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                    if c.is_empty() {
                        ERROR_INTERNAL.to_string()
                    } else {
                        c
                    }
                };
                *error_codes.entry(code).or_insert(0) += 1;
                if let Some(trace) = trace {
                    trace.failed = true;
                }
            }
            _ => {}
        }

        let latency = row.get("latency_ms").and_then(Value::as_i64).unwrap_or(0);
        if latency > 0 {
            latencies.push(latency);
        }
    }

    let send_total = sent_ok + sent_fail;
    let send_success_rate = if send_total > 0 {
        100.0 * sent_ok as f64 / send_total as f64
    } else {
        0.0
    };

    let mut cmd_success: u64 = 0;
    let mut cmd_failed: u64 = 0;
    let mut cmd_pending: u64 = 0;
    for row in trace_state.values().filter(|t| t.accepted) {
        if row.failed {
            cmd_failed += 1;
        } else if row.success {
            cmd_success += 1;
        } else {
            cmd_pending += 1;
        }
    }
    let cmd_done = cmd_success + cmd_failed;
    let cmd_success_rate = if cmd_done > 0 {
        100.0 * cmd_success as f64 / cmd_done as f64
    } else {
        0.0
    };

    let p50 = percentile(&latencies, 0.50);
    let p95 = percentile(&latencies, 0.95);

    let mut lines = vec![
        format!("orch: {}", project_name),
        format!("window_hours: {}", cap_hours),
        format!(
            "events: total={} incoming={} accepted={} rejected={}",
            total, incoming, accepted, rejected
        ),
        format!(
            "commands: success={} failed={} pending={} success_rate={:.1}%",
            cmd_success, cmd_failed, cmd_pending, cmd_success_rate
        ),
        format!(
            "send: ok={} fail={} success_rate={:.1}%",
            sent_ok, sent_fail, send_success_rate
        ),
        format!(
            "completion: dispatch={} direct={} errors={}",
            dispatch_done, direct_done, errors
        ),
        format!("latency_ms: p50={} p95={} samples={}", p50, p95, latencies.len()),
    ];
    if !error_codes.is_empty() {
        let rows = error_codes
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("error_codes: {}", rows));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_iso;
    use serde_json::json;

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[], 0.5), 0);
        assert_eq!(percentile(&[10], 0.95), 10);
        assert_eq!(percentile(&[10, 20], 0.5), 15);
        assert_eq!(percentile(&[10, 20, 30, 40], 0.5), 25);
        assert_eq!(percentile(&[1, 100], 0.0), 1);
        assert_eq!(percentile(&[1, 100], 1.0), 100);
    }

    fn write_rows(team_dir: &Path, rows: &[Value]) {
        let path = team_dir.join("logs").join(EVENTS_LOG_NAME);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let body = rows
            .iter()
            .map(|r| serde_json::to_string(r).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(&path, format!("{}\n", body)).unwrap();
    }

    #[test]
    fn missing_file_reports_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let text = summarize_gateway_metrics(dir.path(), "default", 24);
        assert!(text.contains("metrics: no data file"));
        assert!(text.contains("window_hours: 24"));
    }

    #[test]
    fn window_hours_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let text = summarize_gateway_metrics(dir.path(), "default", 9999);
        assert!(text.contains("window_hours: 168"));
    }

    #[test]
    fn counts_and_trace_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let ts = now_iso();
        write_rows(
            dir.path(),
            &[
                json!({"timestamp": ts, "event": "incoming_message", "trace_id": "t1", "status": "received", "latency_ms": 0}),
                json!({"timestamp": ts, "event": "command_resolved", "trace_id": "t1", "status": "accepted", "latency_ms": 5}),
                json!({"timestamp": ts, "event": "send_message", "trace_id": "t1", "status": "sent", "latency_ms": 40}),
                json!({"timestamp": ts, "event": "command_resolved", "trace_id": "t2", "status": "accepted", "latency_ms": 3}),
                json!({"timestamp": ts, "event": "handler_error", "trace_id": "t2", "status": "failed", "error_code": "E_ORCH", "latency_ms": 90}),
                json!({"timestamp": ts, "event": "command_resolved", "trace_id": "t3", "status": "accepted", "latency_ms": 2}),
                json!({"timestamp": "2000-01-01T00:00:00+0000", "event": "incoming_message", "trace_id": "old", "latency_ms": 1}),
                json!({"not": "a row"}),
            ],
        );
        let text = summarize_gateway_metrics(dir.path(), "default", 24);
        assert!(text.contains("incoming=1"));
        assert!(text.contains("accepted=3"));
        assert!(text.contains("commands: success=1 failed=1 pending=1"));
        assert!(text.contains("success_rate=50.0%"));
        assert!(text.contains("send: ok=1 fail=0"));
        assert!(text.contains("error_codes: E_ORCH=1"));
        // positive latencies only: 5, 40, 3, 90, 2
        assert!(text.contains("samples=5"));
    }
}
