//! Locate a marked JSON object inside free-form agent output.
//!
//! Agents are asked to end their answer with an object such as
//! `{"RALPH_VALIDATION": {...}}`, but the surrounding text is arbitrary prose,
//! markdown and tool transcripts. Two strategies are tried in order:
//!
//! 1. fenced ```` ```json ```` blocks that mention the marker;
//! 2. brace matching around the first occurrence of the marker, first backward
//!    to the enclosing object and then forward to the next object.
//!
//! Mentioning the marker in prose without any JSON yields `Ok(None)`.

use serde_json::{Map, Value};
use thiserror::Error;

const JSON_FENCE: &str = "```json";
const FENCE: &str = "```";

/// Parse failure for a located envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed JSON for {marker}: {source}")]
    Malformed {
        marker: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unbalanced braces in JSON for {marker}")]
    Unbalanced { marker: String },
}

/// Find the JSON object associated with `marker` in `text`.
///
/// Returns the object as written: either the wrapper containing `marker` as a
/// key, or a bare object that follows the marker.
pub fn extract_object(text: &str, marker: &str) -> Result<Option<Map<String, Value>>, EnvelopeError> {
    if text.is_empty() || marker.is_empty() || !text.contains(marker) {
        return Ok(None);
    }

    for block in fenced_json_blocks(text) {
        if block.contains(marker) {
            return parse_object(block.trim(), marker).map(Some);
        }
    }

    let Some(marker_at) = text.find(marker) else {
        return Ok(None);
    };

    if let Some(open) = text[..marker_at].rfind('{') {
        let candidate = &text[open..];
        if let Some(close) = match_braces(candidate) {
            let json = &candidate[..=close];
            if json.contains(marker)
                && let Ok(object) = serde_json::from_str::<Map<String, Value>>(json)
            {
                return Ok(Some(object));
            }
        }
    }

    let Some(offset) = text[marker_at..].find('{') else {
        return Ok(None);
    };
    let candidate = &text[marker_at + offset..];
    let close = match_braces(candidate).ok_or_else(|| EnvelopeError::Unbalanced {
        marker: marker.to_string(),
    })?;
    parse_object(&candidate[..=close], marker).map(Some)
}

fn parse_object(json: &str, marker: &str) -> Result<Map<String, Value>, EnvelopeError> {
    serde_json::from_str(json).map_err(|source| EnvelopeError::Malformed {
        marker: marker.to_string(),
        source,
    })
}

/// Bodies of every ```` ```json ```` fence, in order of appearance.
fn fenced_json_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(JSON_FENCE) {
        let body = &rest[start + JSON_FENCE.len()..];
        let Some(end) = body.find(FENCE) else {
            break;
        };
        blocks.push(&body[..end]);
        rest = &body[end + FENCE.len()..];
    }
    blocks
}

/// Index of the `}` closing the object that opens at `text[0]`.
///
/// Braces and brackets are tracked separately and anything inside a JSON
/// string (including escaped quotes) is ignored.
fn match_braces(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }

    let mut braces = 0i32;
    let mut brackets = 0i32;
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        if in_string {
            match byte {
                b'\\' => {
                    i += 2;
                    continue;
                }
                b'"' => in_string = false,
                _ => {}
            }
            i += 1;
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => braces += 1,
            b'}' => {
                braces -= 1;
                if braces == 0 && brackets == 0 {
                    return Some(i);
                }
            }
            b'[' => brackets += 1,
            b']' => brackets -= 1,
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "RALPH_VALIDATION";

    #[test]
    fn absent_marker_is_no_signal() {
        assert!(extract_object("", MARKER).unwrap().is_none());
        assert!(extract_object("all done {\"a\": 1}", MARKER).unwrap().is_none());
    }

    #[test]
    fn marker_in_prose_without_json_is_no_signal() {
        let text = "Remember to emit RALPH_VALIDATION at the end of the report.";
        assert!(extract_object(text, MARKER).unwrap().is_none());
    }

    #[test]
    fn finds_fenced_block() {
        let text = "Report\n```json\n{\"RALPH_VALIDATION\": {\"verdict\": \"APPROVED\"}}\n```\ntrailing";
        let object = extract_object(text, MARKER).unwrap().unwrap();
        assert_eq!(object[MARKER]["verdict"], "APPROVED");
    }

    #[test]
    fn skips_fenced_blocks_without_marker() {
        let text = "```json\n{\"other\": true}\n```\nthen\n```json\n{\"RALPH_VALIDATION\": {\"verdict\": \"BLOCKED\"}}\n```";
        let object = extract_object(text, MARKER).unwrap().unwrap();
        assert_eq!(object[MARKER]["verdict"], "BLOCKED");
    }

    #[test]
    fn malformed_fenced_block_is_an_error() {
        let text = "```json\n{\"RALPH_VALIDATION\": {\"verdict\": }\n```";
        let err = extract_object(text, MARKER).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed { .. }));
    }

    #[test]
    fn finds_enclosing_object_in_prose() {
        let text = "I checked everything. {\"RALPH_VALIDATION\": {\"verdict\": \"NEEDS_MORE_WORK\", \"feedback\": \"fix {braces} and \\\"quotes\\\"\"}} Bye.";
        let object = extract_object(text, MARKER).unwrap().unwrap();
        assert_eq!(object[MARKER]["verdict"], "NEEDS_MORE_WORK");
        assert_eq!(object[MARKER]["feedback"], "fix {braces} and \"quotes\"");
    }

    #[test]
    fn falls_forward_to_bare_object_after_marker() {
        let text = "noise {\"a\": [1, 2]} RALPH_VALIDATION: {\"verdict\": \"ESCALATE\", \"blocked_tasks\": [\"T1\"]}";
        let object = extract_object(text, MARKER).unwrap().unwrap();
        assert_eq!(object["verdict"], "ESCALATE");
    }

    #[test]
    fn unbalanced_object_after_marker_is_an_error() {
        let text = "RALPH_VALIDATION: {\"verdict\": \"APPROVED\"";
        let err = extract_object(text, MARKER).unwrap_err();
        assert!(matches!(err, EnvelopeError::Unbalanced { .. }));
    }

    #[test]
    fn match_braces_ignores_brackets_and_strings() {
        assert_eq!(match_braces("{\"a\": [\"}\"]}"), Some(11));
        assert_eq!(match_braces("{\"a\": {}"), None);
        assert_eq!(match_braces("x{}"), None);
    }
}
