//! Reasoning extraction.
//!
//! Some backends interleave `<think>…</think>` blocks with their answer.
//! [`ThoughtStream`] is a resumable state machine that splits a token stream
//! into passthrough text and thought fragments, tolerating tags split across
//! chunk boundaries. [`strip_thinking`] is the whole-text variant applied as
//! a final catch on completed output.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Outside a think block.
    Text,
    /// Inside a think block.
    Thinking,
}

/// Incremental `<think>` extractor.
///
/// Feed chunks with [`ThoughtStream::push`]; each call returns the text to
/// pass through and any completed thought fragments. Call
/// [`ThoughtStream::finish`] to flush a trailing partial tag.
#[derive(Debug)]
pub struct ThoughtStream {
    state: StreamState,
    /// Holds a possible partial tag prefix carried across chunks.
    carry: String,
    /// Accumulates thought content while inside a block.
    thought: String,
}

impl Default for ThoughtStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ThoughtStream {
    pub fn new() -> Self {
        Self {
            state: StreamState::Text,
            carry: String::new(),
            thought: String::new(),
        }
    }

    /// Process one chunk. Returns `(passthrough, thoughts)`.
    pub fn push(&mut self, chunk: &str) -> (String, Vec<String>) {
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(chunk);

        let mut passthrough = String::new();
        let mut thoughts = Vec::new();

        loop {
            match self.state {
                StreamState::Text => match buffer.find(OPEN_TAG) {
                    Some(at) => {
                        passthrough.push_str(&buffer[..at]);
                        buffer.drain(..at + OPEN_TAG.len());
                        self.state = StreamState::Thinking;
                    }
                    None => {
                        let keep = partial_suffix_len(&buffer, OPEN_TAG);
                        let emit = buffer.len() - keep;
                        passthrough.push_str(&buffer[..emit]);
                        self.carry = buffer[emit..].to_string();
                        break;
                    }
                },
                StreamState::Thinking => match buffer.find(CLOSE_TAG) {
                    Some(at) => {
                        self.thought.push_str(&buffer[..at]);
                        buffer.drain(..at + CLOSE_TAG.len());
                        let done = std::mem::take(&mut self.thought);
                        let done = done.trim();
                        if !done.is_empty() {
                            thoughts.push(done.to_string());
                        }
                        self.state = StreamState::Text;
                    }
                    None => {
                        let keep = partial_suffix_len(&buffer, CLOSE_TAG);
                        let emit = buffer.len() - keep;
                        self.thought.push_str(&buffer[..emit]);
                        self.carry = buffer[emit..].to_string();
                        break;
                    }
                },
            }
        }

        (passthrough, thoughts)
    }

    /// Flush any held partial tag. An unterminated think block is surfaced
    /// as a final thought rather than dropped.
    pub fn finish(&mut self) -> (String, Vec<String>) {
        let carry = std::mem::take(&mut self.carry);
        match self.state {
            StreamState::Text => (carry, Vec::new()),
            StreamState::Thinking => {
                self.thought.push_str(&carry);
                let done = std::mem::take(&mut self.thought);
                self.state = StreamState::Text;
                let done = done.trim();
                if done.is_empty() {
                    (String::new(), Vec::new())
                } else {
                    (String::new(), vec![done.to_string()])
                }
            }
        }
    }
}

/// Length of the longest strict suffix of `buffer` that is a prefix of
/// `tag`. That suffix might complete into the tag with the next chunk, so
/// it must be held back.
fn partial_suffix_len(buffer: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buffer.len());
    for len in (1..=max).rev() {
        if !buffer.is_char_boundary(buffer.len() - len) {
            continue;
        }
        let suffix = &buffer[buffer.len() - len..];
        if tag.starts_with(suffix) {
            return len;
        }
    }
    0
}

/// Remove every `<think>…</think>` block from `text`, returning the cleaned
/// text and the extracted thoughts in order.
pub fn strip_thinking(text: &str) -> (String, Vec<String>) {
    let mut stream = ThoughtStream::new();
    let (mut clean, mut thoughts) = stream.push(text);
    let (tail, trailing) = stream.finish();
    clean.push_str(&tail);
    thoughts.extend(trailing);
    (clean.trim().to_string(), thoughts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_single_block() {
        let (clean, thoughts) = strip_thinking("<think>reasoning here</think>The answer is 4.");
        assert_eq!(clean, "The answer is 4.");
        assert_eq!(thoughts, vec!["reasoning here"]);
    }

    #[test]
    fn strips_multiple_blocks_in_order() {
        let (clean, thoughts) =
            strip_thinking("<think>first</think>A<think>second</think>B");
        assert_eq!(clean, "AB");
        assert_eq!(thoughts, vec!["first", "second"]);
    }

    #[test]
    fn passes_plain_text_through() {
        let (clean, thoughts) = strip_thinking("no reasoning markers at all");
        assert_eq!(clean, "no reasoning markers at all");
        assert!(thoughts.is_empty());
    }

    #[test]
    fn tolerates_tags_split_across_chunks() {
        let mut stream = ThoughtStream::new();
        let mut clean = String::new();
        let mut thoughts = Vec::new();

        for chunk in ["Hello <th", "ink>inner", " thought</thi", "nk> world"] {
            let (text, mut found) = stream.push(chunk);
            clean.push_str(&text);
            thoughts.append(&mut found);
        }
        let (tail, trailing) = stream.finish();
        clean.push_str(&tail);
        thoughts.extend(trailing);

        assert_eq!(clean, "Hello  world");
        assert_eq!(thoughts, vec!["inner thought"]);
    }

    #[test]
    fn single_char_chunks() {
        let input = "<think>ab</think>cd";
        let mut stream = ThoughtStream::new();
        let mut clean = String::new();
        let mut thoughts = Vec::new();
        for ch in input.chars() {
            let (text, mut found) = stream.push(&ch.to_string());
            clean.push_str(&text);
            thoughts.append(&mut found);
        }
        let (tail, trailing) = stream.finish();
        clean.push_str(&tail);
        thoughts.extend(trailing);

        assert_eq!(clean, "cd");
        assert_eq!(thoughts, vec!["ab"]);
    }

    #[test]
    fn unterminated_block_flushes_as_thought() {
        let (clean, thoughts) = strip_thinking("answer<think>never closed");
        assert_eq!(clean, "answer");
        assert_eq!(thoughts, vec!["never closed"]);
    }

    #[test]
    fn angle_bracket_text_is_not_swallowed() {
        let (clean, thoughts) = strip_thinking("a < b and b > c");
        assert_eq!(clean, "a < b and b > c");
        assert!(thoughts.is_empty());
    }
}
