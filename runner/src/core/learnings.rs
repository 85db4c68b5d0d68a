//! Extraction of `RALPH_LEARNINGS:` notes from implementation output.

const MARKER: &str = "RALPH_LEARNINGS:";

/// Learnings the agent reported, or an empty string.
///
/// Text on the marker line is returned as is. Otherwise the following lines
/// are collected up to a blank line, a code fence or the end of output.
pub fn extract_learnings(output: &str) -> String {
    let mut lines = output.lines();
    let mut found = false;
    for line in lines.by_ref() {
        if let Some(at) = line.find(MARKER) {
            let inline = line[at + MARKER.len()..].trim();
            if !inline.is_empty() {
                return inline.to_string();
            }
            found = true;
            break;
        }
    }
    if !found {
        return String::new();
    }

    let collected: Vec<&str> = lines
        .take_while(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with("```")
        })
        .collect();
    let result = collected.join("\n").trim().to_string();

    let has_content = result.lines().any(|line| {
        let trimmed = line.trim();
        !trimmed.is_empty() && trimmed != "-"
    });
    if has_content { result } else { String::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_learning() {
        let output = "done\nRALPH_LEARNINGS: use the builder for configs\nmore";
        assert_eq!(extract_learnings(output), "use the builder for configs");
    }

    #[test]
    fn block_learning_stops_at_blank_line_or_fence() {
        let output = "RALPH_LEARNINGS:\n- tests live in tests/\n- run fmt first\n\nignored";
        assert_eq!(extract_learnings(output), "- tests live in tests/\n- run fmt first");

        let output = "RALPH_LEARNINGS:\n- one\n```\n- two";
        assert_eq!(extract_learnings(output), "- one");
    }

    #[test]
    fn placeholder_dashes_are_empty() {
        assert_eq!(extract_learnings("RALPH_LEARNINGS:\n-\n -\n"), "");
        assert_eq!(extract_learnings("no marker here"), "");
        assert_eq!(extract_learnings("RALPH_LEARNINGS:\n\n- late"), "");
    }
}
