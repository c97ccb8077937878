//! Shared blackboard.
//!
//! The blackboard is the only process-wide mutable state: a string-keyed
//! map written by `<set_state>` tags in agent output and by user
//! interventions. Every write broadcasts the full current map through the
//! event bus so observers never hold live references.

use crate::events::{EngineEvent, EventBus};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::info;

fn short_form() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<set_state\s+key=["']([^"']+)["']\s+value=["']([^"']*)["']\s*/>"#)
            .expect("set_state short pattern")
    })
}

fn long_form() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<set_state\s+key=["']([^"']+)["']\s*>(.*?)</set_state>"#)
            .expect("set_state long pattern")
    })
}

/// Process-local shared state with change notifications.
#[derive(Clone)]
pub struct Blackboard {
    state: Arc<Mutex<Map<String, Value>>>,
    bus: EventBus,
}

impl Blackboard {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(Map::new())),
            bus,
        }
    }

    /// Set a key and broadcast the updated map.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let snapshot = {
            let mut state = self.state.lock().expect("blackboard lock");
            state.insert(key.into(), value);
            state.clone()
        };
        self.bus.emit(EngineEvent::BlackboardUpdate(snapshot));
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().expect("blackboard lock").get(key).cloned()
    }

    /// Read-only copy of the current map.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.state.lock().expect("blackboard lock").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().expect("blackboard lock").is_empty()
    }

    /// Clear all keys and broadcast the empty map.
    pub fn clear(&self) {
        self.state.lock().expect("blackboard lock").clear();
        self.bus.emit(EngineEvent::BlackboardUpdate(Map::new()));
    }

    /// Append intervention feedback under the reserved `{node_id}_feedback`
    /// key; repeated feedback accumulates line by line.
    pub fn append_feedback(&self, node_id: &str, feedback: &str) {
        let key = format!("{node_id}_feedback");
        let merged = {
            let state = self.state.lock().expect("blackboard lock");
            match state.get(&key).and_then(Value::as_str) {
                Some(existing) if !existing.is_empty() => format!("{existing}\n{feedback}"),
                _ => feedback.to_string(),
            }
        };
        self.set(key, Value::String(merged));
    }

    /// The pending feedback for a node, if any.
    pub fn feedback_for(&self, node_id: &str) -> Option<String> {
        self.get(&format!("{node_id}_feedback"))
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Parse every `<set_state>` tag in `text` and apply the writes.
    /// A single update is broadcast after the batch if anything changed.
    pub fn apply_tags(&self, text: &str) -> usize {
        let mut writes: Vec<(String, String)> = Vec::new();

        for capture in short_form().captures_iter(text) {
            writes.push((capture[1].to_string(), capture[2].to_string()));
        }
        for capture in long_form().captures_iter(text) {
            writes.push((capture[1].to_string(), capture[2].trim().to_string()));
        }

        if writes.is_empty() {
            return 0;
        }

        let count = writes.len();
        let snapshot = {
            let mut state = self.state.lock().expect("blackboard lock");
            for (key, value) in writes {
                info!(%key, value = %value.chars().take(40).collect::<String>(), "blackboard set");
                state.insert(key, Value::String(value));
            }
            state.clone()
        };
        self.bus.emit(EngineEvent::BlackboardUpdate(snapshot));
        count
    }

    /// Replace the whole map (snapshot restoration) and broadcast it.
    pub fn restore(&self, map: Map<String, Value>) {
        let snapshot = {
            let mut state = self.state.lock().expect("blackboard lock");
            *state = map;
            state.clone()
        };
        self.bus.emit(EngineEvent::BlackboardUpdate(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn blackboard() -> Blackboard {
        Blackboard::new(EventBus::default())
    }

    #[test]
    fn set_get_and_snapshot() {
        let board = blackboard();
        board.set("phase", Value::String("draft".into()));
        assert_eq!(board.get("phase"), Some(Value::String("draft".into())));
        assert_eq!(board.snapshot().len(), 1);
    }

    #[test]
    fn parses_short_form_tags() {
        let board = blackboard();
        let n = board.apply_tags(r#"done <set_state key="phase" value="review"/> ok"#);
        assert_eq!(n, 1);
        assert_eq!(board.get("phase"), Some(Value::String("review".into())));
    }

    #[test]
    fn parses_long_form_tags() {
        let board = blackboard();
        let text = "<set_state key=\"notes\">line one\nline two</set_state>";
        board.apply_tags(text);
        assert_eq!(
            board.get("notes"),
            Some(Value::String("line one\nline two".into()))
        );
    }

    #[test]
    fn tag_application_is_idempotent() {
        let board = blackboard();
        let text = r#"<set_state key="k" value="v"/>"#;
        board.apply_tags(text);
        let first = board.snapshot();
        board.apply_tags(text);
        assert_eq!(board.snapshot(), first);
    }

    #[test]
    fn no_tags_means_no_broadcast() {
        let bus = EventBus::default();
        let board = Blackboard::new(bus.clone());
        let mut rx = bus.subscribe();
        assert_eq!(board.apply_tags("plain output"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn updates_broadcast_full_map() {
        let bus = EventBus::default();
        let board = Blackboard::new(bus.clone());
        let mut rx = bus.subscribe();

        board.set("a", Value::String("1".into()));
        board.set("b", Value::String("2".into()));

        let _ = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::BlackboardUpdate(map) => {
                assert_eq!(map.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn feedback_appends() {
        let board = blackboard();
        board.append_feedback("n1", "first note");
        board.append_feedback("n1", "second note");
        assert_eq!(
            board.feedback_for("n1").unwrap(),
            "first note\nsecond note"
        );
        assert!(board.feedback_for("other").is_none());
    }

    #[test]
    fn clear_empties_the_map() {
        let board = blackboard();
        board.set("k", Value::String("v".into()));
        board.clear();
        assert!(board.is_empty());
    }
}
