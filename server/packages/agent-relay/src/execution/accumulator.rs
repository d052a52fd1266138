//! Line-by-line interpretation of the agent CLI's `stream-json` output.

use serde_json::Value;

use super::{ExecutionResult, ExecutionState};

pub(crate) const NO_OUTPUT: &str = "No output received.";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LineOutcome {
    Continue,
    SessionInit(String),
    Complete(ExecutionResult),
    Failed(String),
}

pub(crate) fn apply_line(state: &ExecutionState, line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Continue;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(error = %err, "skipping non-json output line");
            return LineOutcome::Continue;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("system") if value.get("subtype").and_then(Value::as_str) == Some("init") => {
            match value.get("session_id").and_then(Value::as_str) {
                Some(session_id) => {
                    state.set_session_id(session_id);
                    LineOutcome::SessionInit(session_id.to_string())
                }
                None => LineOutcome::Continue,
            }
        }
        Some("stream_event") => {
            if let Some(delta) = text_delta(&value) {
                state.append_text(delta);
            }
            LineOutcome::Continue
        }
        Some("assistant") => {
            if let Some(turn) = turn_text(&value) {
                state.correct_text(&turn);
            }
            LineOutcome::Continue
        }
        Some("result") => result_outcome(state, &value),
        _ => LineOutcome::Continue,
    }
}

/// Outcome when stdout closes without a result message.
pub(crate) fn end_of_stream(state: &ExecutionState) -> ExecutionResult {
    let text = state.accumulated_text();
    ExecutionResult {
        text: if text.is_empty() {
            NO_OUTPUT.to_string()
        } else {
            text
        },
        ..ExecutionResult::default()
    }
}

fn text_delta(value: &Value) -> Option<&str> {
    let event = value.get("event")?;
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
        return None;
    }
    delta.get("text").and_then(Value::as_str)
}

fn turn_text(value: &Value) -> Option<String> {
    let content = value.get("message")?.get("content")?.as_array()?;
    let blocks = content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>();
    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n"))
    }
}

fn result_outcome(state: &ExecutionState, value: &Value) -> LineOutcome {
    let result_text = value
        .get("result")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty());
    let subtype = value
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    if subtype == "success" {
        LineOutcome::Complete(ExecutionResult {
            text: result_text
                .map(str::to_string)
                .unwrap_or_else(|| state.accumulated_text()),
            cost: value.get("total_cost_usd").and_then(Value::as_f64),
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
            num_turns: value.get("num_turns").and_then(Value::as_u64),
        })
    } else {
        LineOutcome::Failed(
            result_text
                .map(str::to_string)
                .unwrap_or_else(|| format!("Query failed with subtype: {subtype}")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> String {
        serde_json::json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": { "type": "text_delta", "text": text }
            }
        })
        .to_string()
    }

    fn assistant(blocks: &[&str]) -> String {
        let content = blocks
            .iter()
            .map(|text| serde_json::json!({ "type": "text", "text": text }))
            .collect::<Vec<_>>();
        serde_json::json!({ "type": "assistant", "message": { "content": content } }).to_string()
    }

    #[test]
    fn init_line_reports_session() {
        let state = ExecutionState::default();
        let outcome = apply_line(
            &state,
            r#"{"type":"system","subtype":"init","session_id":"abc"}"#,
        );
        assert_eq!(outcome, LineOutcome::SessionInit("abc".to_string()));
        assert_eq!(state.session_id().as_deref(), Some("abc"));
    }

    #[test]
    fn deltas_append_and_matching_turn_keeps_accumulator() {
        let state = ExecutionState::default();
        apply_line(&state, &delta("Hel"));
        apply_line(&state, &delta("lo"));
        assert_eq!(state.accumulated_text(), "Hello");

        apply_line(&state, &assistant(&["Hello"]));
        assert_eq!(state.accumulated_text(), "Hello");
    }

    #[test]
    fn mismatched_turn_replaces_accumulator() {
        let state = ExecutionState::default();
        apply_line(&state, &delta("Hel"));
        apply_line(&state, &delta("XX"));
        apply_line(&state, &assistant(&["Hello", "world"]));
        assert_eq!(state.accumulated_text(), "Hello\nworld");
    }

    #[test]
    fn later_turn_wins_over_earlier_turn() {
        let state = ExecutionState::default();
        apply_line(&state, &assistant(&["first turn"]));
        apply_line(&state, &delta("second"));
        apply_line(&state, &assistant(&["second turn"]));
        assert_eq!(state.accumulated_text(), "second turn");
    }

    #[test]
    fn assistant_without_text_blocks_is_ignored() {
        let state = ExecutionState::default();
        apply_line(&state, &delta("kept"));
        apply_line(
            &state,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t"}]}}"#,
        );
        assert_eq!(state.accumulated_text(), "kept");
    }

    #[test]
    fn success_result_prefers_reported_text() {
        let state = ExecutionState::default();
        apply_line(&state, &delta("streamed"));
        let outcome = apply_line(
            &state,
            r#"{"type":"result","subtype":"success","result":"final","total_cost_usd":0.0125,"duration_ms":900,"num_turns":3}"#,
        );
        assert_eq!(
            outcome,
            LineOutcome::Complete(ExecutionResult {
                text: "final".to_string(),
                cost: Some(0.0125),
                duration_ms: Some(900),
                num_turns: Some(3),
            })
        );
    }

    #[test]
    fn success_result_without_text_uses_accumulator() {
        let state = ExecutionState::default();
        apply_line(&state, &delta("streamed"));
        let outcome = apply_line(&state, r#"{"type":"result","subtype":"success"}"#);
        match outcome {
            LineOutcome::Complete(result) => assert_eq!(result.text, "streamed"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn non_success_result_fails_with_subtype() {
        let state = ExecutionState::default();
        let outcome = apply_line(&state, r#"{"type":"result","subtype":"error_max_turns"}"#);
        assert_eq!(
            outcome,
            LineOutcome::Failed("Query failed with subtype: error_max_turns".to_string())
        );
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let state = ExecutionState::default();
        assert_eq!(apply_line(&state, "warning: something"), LineOutcome::Continue);
        assert_eq!(apply_line(&state, "   "), LineOutcome::Continue);
    }

    #[test]
    fn end_of_stream_falls_back_to_placeholder() {
        let state = ExecutionState::default();
        assert_eq!(end_of_stream(&state).text, NO_OUTPUT);
        state.append_text("partial");
        assert_eq!(end_of_stream(&state).text, "partial");
    }
}
