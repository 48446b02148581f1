//! Opportunistic parsing of stream-JSON agent output.
//!
//! Claude-style agents print one JSON object per line. Tool invocations
//! appear as `tool_use` items inside `assistant` messages and the final
//! `result` object carries `total_cost_usd`. Lines that are not JSON are
//! ignored.

use std::collections::BTreeMap;

use serde_json::Value;

/// Usage gathered from one turn's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnUsage {
    pub tool_calls: BTreeMap<String, u64>,
    pub cost: f64,
    pub result_seen: bool,
    pub api_error: Option<String>,
}

impl TurnUsage {
    pub fn observe_stdout(&mut self, line: &[u8]) {
        let Ok(event) = serde_json::from_slice::<Value>(line) else {
            return;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                for item in content_items(&event) {
                    if item.get("type").and_then(Value::as_str) == Some("tool_use")
                        && let Some(name) = item.get("name").and_then(Value::as_str)
                    {
                        *self.tool_calls.entry(name.to_string()).or_default() += 1;
                    }
                }
            }
            Some("result") => {
                self.result_seen = true;
                if let Some(cost) = event.get("total_cost_usd").and_then(Value::as_f64) {
                    self.cost += cost;
                }
            }
            _ => {}
        }
    }

    pub fn observe_stderr(&mut self, line: &[u8]) {
        if self.api_error.is_none() {
            self.api_error = detect_api_error(&String::from_utf8_lossy(line));
        }
    }
}

fn content_items(event: &Value) -> impl Iterator<Item = &Value> {
    event
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

/// Recognize provider failures in stderr so they can be surfaced in the
/// turn summary.
pub fn detect_api_error(stderr: &str) -> Option<String> {
    if stderr.contains("API Error: 5") {
        Some("API error: server error (5xx)".to_string())
    } else if stderr.contains("rate limit") || stderr.contains("Rate limit") || stderr.contains(" 429") {
        Some("API error: rate limit exceeded".to_string())
    } else if stderr.contains("overloaded") || stderr.contains(" 503") {
        Some("API error: service overloaded".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_tool_uses_and_cost() {
        let mut usage = TurnUsage::default();
        usage.observe_stdout(
            br#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},{"type":"tool_use","name":"Bash","input":{}},{"type":"tool_use","name":"Read","input":{}}]}}"#,
        );
        usage.observe_stdout(br#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash"}]}}"#);
        usage.observe_stdout(br#"{"type":"result","total_cost_usd":0.25}"#);
        usage.observe_stdout(b"plain text line");

        assert_eq!(usage.tool_calls["Bash"], 2);
        assert_eq!(usage.tool_calls["Read"], 1);
        assert!(usage.result_seen);
        assert!((usage.cost - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn first_api_error_sticks() {
        let mut usage = TurnUsage::default();
        usage.observe_stderr(b"harmless");
        assert!(usage.api_error.is_none());
        usage.observe_stderr(b"Rate limit reached");
        usage.observe_stderr(b"API Error: 503 overloaded");
        assert_eq!(usage.api_error.as_deref(), Some("API error: rate limit exceeded"));
    }

    #[test]
    fn detect_api_errors() {
        assert!(detect_api_error("API Error: 500").is_some());
        assert!(detect_api_error("service overloaded").is_some());
        assert!(detect_api_error("some other error").is_none());
    }
}
