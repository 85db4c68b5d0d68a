//! Decoding of agent CLI event streams into plain assistant text.
//!
//! Both backends emit one JSON event per line. Lines that are not JSON, or
//! events that carry no assistant text, are skipped.

use serde_json::Value;

/// Text carried by one Claude `stream-json` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaudeEvent {
    Assistant(String),
    Result(String),
}

pub fn decode_claude_line(line: &str) -> Option<ClaudeEvent> {
    let event = parse_line(line)?;
    match event.get("type").and_then(Value::as_str)? {
        "assistant" => {
            let content = event.get("message")?.get("content")?.as_array()?;
            let text: String = content
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then_some(ClaudeEvent::Assistant(text))
        }
        "result" => {
            let text = event.get("result").and_then(Value::as_str)?;
            (!text.is_empty()).then(|| ClaudeEvent::Result(text.to_string()))
        }
        _ => None,
    }
}

/// Assistant text from a full Claude stream. The final `result` event is only
/// used when no assistant message carried text.
pub fn decode_claude_stream(raw: &str) -> String {
    let mut assistant = Vec::new();
    let mut result = None;
    for line in raw.lines() {
        match decode_claude_line(line) {
            Some(ClaudeEvent::Assistant(text)) => assistant.push(text),
            Some(ClaudeEvent::Result(text)) => result = Some(text),
            None => {}
        }
    }
    if assistant.is_empty() {
        result.unwrap_or_default()
    } else {
        assistant.join("\n")
    }
}

/// Text carried by one Codex JSONL line: agent messages verbatim and function
/// calls rendered as `Called: name(args)`.
pub fn decode_codex_line(line: &str) -> Option<String> {
    let event = parse_line(line)?;
    if event.get("type").and_then(Value::as_str)? != "item.completed" {
        return None;
    }
    let item = event.get("item")?;
    let text = match item.get("type").and_then(Value::as_str)? {
        "agent_message" | "assistant_message" => {
            item.get("text").and_then(Value::as_str).map(str::to_string)
        }
        "function_call" => {
            let name = item.get("name").and_then(Value::as_str)?;
            let args = item.get("arguments").and_then(Value::as_str)?;
            Some(format!("Called: {name}({args})"))
        }
        _ => None,
    };
    text.filter(|text| !text.is_empty())
}

pub fn decode_codex_stream(raw: &str) -> String {
    raw.lines()
        .filter_map(decode_codex_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_text_blocks_are_concatenated_and_tools_skipped() {
        let raw = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Start"},{"type":"tool_use","name":"Read","input":{}},{"type":"text","text":"ed"}]}}"#,
            "\nnot json\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Done"}]}}"#,
            "\n",
            r#"{"type":"result","result":"Done"}"#,
        );
        assert_eq!(decode_claude_stream(raw), "Started\nDone");
    }

    #[test]
    fn claude_result_is_a_fallback() {
        let raw = r#"{"type":"result","result":"final answer"}"#;
        assert_eq!(decode_claude_stream(raw), "final answer");
        assert_eq!(decode_claude_stream(""), "");
    }

    #[test]
    fn codex_messages_and_calls() {
        let raw = concat!(
            r#"{"type":"thread.started"}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"function_call","name":"shell","arguments":"{\"cmd\":\"ls\"}"}}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"All tasks done"}}"#,
            "\n",
            r#"{"type":"item.started","item":{"type":"agent_message","text":"ignored"}}"#,
        );
        assert_eq!(
            decode_codex_stream(raw),
            "Called: shell({\"cmd\":\"ls\"})\nAll tasks done"
        );
    }
}
