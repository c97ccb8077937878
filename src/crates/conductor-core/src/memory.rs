//! Memory.
//!
//! Two kinds of memory back the engine:
//!
//! - [`MemoryStore`] — a long-term retrieval store scored by a hybrid of
//!   Jaccard overlap, summed IDF, and tag match. Documents live in an
//!   insertion-ordered list so retrieval is deterministic for a given
//!   corpus and query. Persistence is atomic (`memory_store.json`, temp
//!   file + rename).
//! - [`SummaryBufferMemory`] — per-workflow conversation memory holding the
//!   most recent turns verbatim plus a running summary of older turns,
//!   condensed through the node's own provider.

use conductor_llm::{GenerateRequest, Provider};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const MAX_ENTRIES: usize = 10_000;
const MAX_CONTENT_LEN: usize = 50_000;
/// Minimum hybrid score for a retrieval hit.
const SCORE_FLOOR: f64 = 0.05;

/// One stored memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub timestamp: String,
    /// Cached token list; rebuilt on load when absent.
    #[serde(rename = "_tokens", default)]
    pub tokens: Vec<String>,
}

/// A retrieval hit with its score.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f64,
}

fn tokenize(text: &str) -> Vec<String> {
    let capped = if text.len() > 100_000 {
        &text[..text.char_indices().take(100_000).last().map(|(i, c)| i + c.len_utf8()).unwrap_or(0)]
    } else {
        text
    };
    capped
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Long-term retrieval store with hybrid lexical scoring.
pub struct MemoryStore {
    entries: Vec<MemoryEntry>,
    idf: HashMap<String, f64>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MemoryStore {
    /// A store that never persists; used by tests and ephemeral engines.
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            idf: HashMap::new(),
            path: None,
        }
    }

    /// A store backed by `memory_store.json` at `path`. Corrupt or missing
    /// files start empty.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            entries: Vec::new(),
            idf: HashMap::new(),
            path: Some(path.clone()),
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Vec<MemoryEntry>>(&text) {
                Ok(mut entries) => {
                    entries.truncate(MAX_ENTRIES);
                    for entry in &mut entries {
                        if entry.tokens.is_empty() {
                            entry.tokens = tokenize(&entry.content);
                        }
                    }
                    store.entries = entries;
                    store.recalculate_idf();
                }
                Err(e) => warn!(path = %path.display(), error = %e, "corrupt memory store, starting fresh"),
            },
            Err(_) => {}
        }
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn recalculate_idf(&mut self) {
        self.idf.clear();
        let doc_count = self.entries.len();
        if doc_count == 0 {
            return;
        }
        let mut term_counts: HashMap<&str, usize> = HashMap::new();
        for entry in &self.entries {
            let unique: HashSet<&str> = entry.tokens.iter().map(String::as_str).collect();
            for term in unique {
                *term_counts.entry(term).or_insert(0) += 1;
            }
        }
        self.idf = term_counts
            .into_iter()
            .map(|(term, count)| {
                (
                    term.to_string(),
                    (doc_count as f64 / (count as f64 + 1.0)).ln(),
                )
            })
            .collect();
    }

    /// Add a record, persist, and return its id.
    pub fn add(&mut self, content: &str, tags: Vec<String>) -> String {
        let mut content = content.to_string();
        if content.len() > MAX_CONTENT_LEN {
            warn!(len = content.len(), "memory content truncated");
            let cut = content
                .char_indices()
                .take(MAX_CONTENT_LEN)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            content.truncate(cut);
        }
        if self.entries.len() >= MAX_ENTRIES {
            self.entries.remove(0);
        }

        let tags: Vec<String> = tags
            .into_iter()
            .filter(|t| !t.is_empty())
            .take(20)
            .map(|t| t.chars().take(100).collect())
            .collect();

        let id = uuid::Uuid::new_v4().to_string();
        let tokens = tokenize(&content);
        self.entries.push(MemoryEntry {
            id: id.clone(),
            content,
            tags,
            timestamp: chrono::Utc::now().to_rfc3339(),
            tokens,
        });
        self.recalculate_idf();
        self.save();
        id
    }

    /// Top-`limit` entries scored above the noise floor, best first.
    ///
    /// score = 0.4 * Jaccard + 0.4 * sum-IDF + 0.2 * tag-match
    pub fn search(&self, query: &str, limit: usize) -> Vec<ScoredEntry> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let query_set: HashSet<&str> = query_tokens.iter().map(String::as_str).collect();

        let mut scored: Vec<ScoredEntry> = Vec::new();
        for entry in &self.entries {
            let entry_set: HashSet<&str> = entry.tokens.iter().map(String::as_str).collect();
            let intersection: Vec<&str> = query_set.intersection(&entry_set).copied().collect();
            let union_len = query_set.union(&entry_set).count();

            let jaccard = if union_len == 0 {
                0.0
            } else {
                intersection.len() as f64 / union_len as f64
            };
            let tfidf: f64 = intersection
                .iter()
                .map(|t| self.idf.get(*t).copied().unwrap_or(0.0))
                .sum();
            let tag_bonus: f64 = entry
                .tags
                .iter()
                .filter(|tag| query_set.contains(tag.to_lowercase().as_str()))
                .map(|_| 0.5)
                .sum();

            let score = jaccard * 0.4 + tfidf * 0.4 + tag_bonus * 0.2;
            if score > SCORE_FLOOR {
                scored.push(ScoredEntry {
                    entry: entry.clone(),
                    score,
                });
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        scored
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.idf.clear();
        self.save();
    }

    /// Atomic save: write to a temp file in the same directory, then rename.
    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let dir = path.parent().unwrap_or(Path::new("."));
        let tmp = dir.join(format!(
            ".memory_{}.json.tmp",
            uuid::Uuid::new_v4().to_string()[..8].to_string()
        ));
        let write = || -> std::io::Result<()> {
            let text = serde_json::to_string_pretty(&self.entries)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&tmp, text)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(path = %path.display(), error = %e, "failed to save memory store");
            let _ = std::fs::remove_file(&tmp);
        }
    }
}

/// One buffered conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Buffer size that triggers summarization of the oldest turns.
const PRUNE_THRESHOLD: usize = 10;
/// How many of the oldest turns are folded into the summary at once.
const PRUNE_BATCH: usize = 5;

/// Summary-buffer conversation memory.
pub struct SummaryBufferMemory {
    buffer: Vec<ChatTurn>,
    summary: String,
}

impl Default for SummaryBufferMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryBufferMemory {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn add_message(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.buffer.push(ChatTurn {
            role: role.into(),
            content: content.into(),
        });
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Render the summary and buffered turns for prompt injection. Empty
    /// string when there is no history.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.summary.is_empty() {
            out.push_str("## Cumulative Summary of Previous Conversation:\n");
            out.push_str(&self.summary);
            out.push_str("\n\n");
        }
        if !self.buffer.is_empty() {
            out.push_str("## Recent Messages:\n");
            for turn in &self.buffer {
                out.push_str(&format!("{}: {}\n", turn.role.to_uppercase(), turn.content));
            }
        }
        out
    }

    /// When the buffer exceeds the threshold, summarize the oldest turns
    /// through `provider` and drop them. Summarization failure is non-fatal:
    /// the turns are dropped anyway and the summary left unchanged.
    pub async fn prune(&mut self, provider: &Arc<dyn Provider>) {
        if self.buffer.len() <= PRUNE_THRESHOLD {
            return;
        }
        let to_summarize: Vec<ChatTurn> = self.buffer.drain(..PRUNE_BATCH).collect();

        let mut snippet = String::new();
        for turn in &to_summarize {
            snippet.push_str(&format!("{}: {}\n", turn.role, turn.content));
        }
        let request = GenerateRequest::new(
            "You are a context manager. Summarize conversation history.",
            format!(
                "Current Summary: {}\n\nSummarize the following conversation snippet concisely, \
                 preserving key facts and decisions:\n\n{snippet}",
                self.summary
            ),
        );
        let result = provider.generate(request).await;
        if conductor_llm::provider::is_error_result(&result) {
            warn!("conversation summarization failed, dropping oldest turns");
        } else {
            info!(summarized = to_summarize.len(), "conversation history condensed");
            self.summary = result;
        }
    }
}
