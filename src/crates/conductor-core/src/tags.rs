//! Dynamic dispatch tags.
//!
//! A strict tag grammar is the only way agent output can reshape the graph
//! at runtime: `<dispatch_task>` re-queues a target node with priority
//! input, `<sleep>` suspends the engine for a parsed duration.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// One parsed instruction from agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchInstruction {
    /// Re-mark a node idle and re-enqueue it with priority input.
    Dispatch { target: String, input: String },
    /// Suspend the engine.
    Sleep { duration: Duration },
}

fn dispatch_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<dispatch_task\s+node=["'](.*?)["'](?:\s+input=["'](.*?)["'])?\s*>(.*?)</dispatch_task>"#,
        )
        .expect("dispatch block pattern")
    })
}

fn dispatch_inline() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<dispatch_task\s+node=["'](.*?)["'](?:\s+input=["'](.*?)["'])?\s*/>"#)
            .expect("dispatch inline pattern")
    })
}

fn sleep_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<sleep\s+duration=["'](.*?)["']\s*/>"#).expect("sleep pattern")
    })
}

/// Parse a duration literal: `90s`, `5m`, `1h`, or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, multiplier) = match raw.as_bytes()[raw.len() - 1] {
        b's' => (&raw[..raw.len() - 1], 1),
        b'm' => (&raw[..raw.len() - 1], 60),
        b'h' => (&raw[..raw.len() - 1], 3600),
        _ => (raw, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .map(|n| Duration::from_secs(n * multiplier))
}

/// Extract every dispatch/sleep instruction from `text`, in order of the
/// tag forms (block dispatches, inline dispatches, sleeps).
pub fn parse_instructions(text: &str) -> Vec<DispatchInstruction> {
    let mut instructions = Vec::new();

    for capture in dispatch_block().captures_iter(text) {
        let target = capture[1].to_string();
        let attr = capture.get(2).map(|m| m.as_str()).unwrap_or("");
        let body = capture[3].trim();
        let input = match (attr.is_empty(), body.is_empty()) {
            (false, false) => format!("{attr}\n{body}"),
            (false, true) => attr.to_string(),
            (true, _) => body.to_string(),
        };
        instructions.push(DispatchInstruction::Dispatch { target, input });
    }

    for capture in dispatch_inline().captures_iter(text) {
        let target = capture[1].to_string();
        let input = capture.get(2).map(|m| m.as_str()).unwrap_or("").to_string();
        instructions.push(DispatchInstruction::Dispatch { target, input });
    }

    for capture in sleep_tag().captures_iter(text) {
        if let Some(duration) = parse_duration(&capture[1]) {
            instructions.push(DispatchInstruction::Sleep { duration });
        }
    }

    instructions
}
