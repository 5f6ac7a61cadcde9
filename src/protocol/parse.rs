use anyhow::Result;

use super::types::InboundEvent;

/// Parse a single NDJSON line into an `InboundEvent`.
///
/// Returns `Ok(None)` for empty lines.
/// Returns `Err` for malformed JSON (caller should warn, not crash).
pub fn parse_line(line: &str) -> Result<Option<InboundEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event: InboundEvent = serde_json::from_str(line)?;
    Ok(Some(event))
}

/// Scan assistant-visible text for the "Working on `<id>`: `<title>`" marker
/// and return the story id if found.
///
/// This is the *only* mechanism the runner has for detecting which story the
/// assistant has started; if the assistant renders the announcement
/// differently, the story is never detected as started. That fragility is by
/// design of the wire contract, not a parsing bug to harden around.
pub fn extract_story_marker(text: &str) -> Option<String> {
    const PREFIX: &str = "Working on ";
    for line in text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix(PREFIX) else {
            continue;
        };
        let Some((id, _title)) = rest.split_once(": ") else {
            continue;
        };
        let id = id.trim();
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_line() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("  \n").unwrap().is_none());
    }

    #[test]
    fn unknown_fields_dont_crash() {
        let line = r#"{"type":"result","subtype":"success","total_cost_usd":0.01,"num_turns":1,"duration_ms":100,"result":"ok","session_id":"x","unknown_field":"value","another":123}"#;
        assert!(parse_line(line).is_ok());
    }

    #[test]
    fn extract_story_marker_basic() {
        assert_eq!(
            extract_story_marker("Working on US-001: Login flow"),
            Some("US-001".to_string())
        );
    }

    #[test]
    fn extract_story_marker_in_surrounding_prose() {
        let text = "Let me start.\n\nWorking on US-002: Password reset\n\nI'll begin by...";
        assert_eq!(
            extract_story_marker(text),
            Some("US-002".to_string())
        );
    }

    #[test]
    fn extract_story_marker_absent() {
        assert_eq!(extract_story_marker("I'm looking into this."), None);
    }

    #[test]
    fn extract_story_marker_requires_colon_space() {
        assert_eq!(extract_story_marker("Working on US-001-no-colon"), None);
    }

    #[test]
    fn extract_story_marker_first_match_wins() {
        let text = "Working on US-001: First\nWorking on US-002: Second";
        assert_eq!(
            extract_story_marker(text),
            Some("US-001".to_string())
        );
    }
}
