//! Category-aware model tiers.
//!
//! The tier manager keeps a static ranking of `provider:model` entries per
//! task category. The failover manager consults it when a task category is
//! known, letting a rate-limited premium tier demote gracefully instead of
//! bouncing between equally exhausted siblings.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Model performance tiers, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    S,
    A,
    B,
    C,
    D,
}

/// Task categories used for model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskCategory {
    Coding,
    Writing,
    Designing,
    Graphics,
    Art,
    General,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Coding => "coding",
            TaskCategory::Writing => "writing",
            TaskCategory::Designing => "designing",
            TaskCategory::Graphics => "graphics",
            TaskCategory::Art => "art",
            TaskCategory::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "coding" => Some(TaskCategory::Coding),
            "writing" => Some(TaskCategory::Writing),
            "designing" => Some(TaskCategory::Designing),
            "graphics" => Some(TaskCategory::Graphics),
            "art" => Some(TaskCategory::Art),
            "general" => Some(TaskCategory::General),
            _ => None,
        }
    }
}

/// Infer a task category from prompt text with a keyword classifier.
pub fn infer_category(text: &str) -> TaskCategory {
    let lower = text.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&["code", "programming", "function", "script", "bug", "debug"]) {
        TaskCategory::Coding
    } else if any(&["write", "story", "article", "essay", "text"]) {
        TaskCategory::Writing
    } else if any(&["design", "ui", "layout", "interface"]) {
        TaskCategory::Designing
    } else if any(&["graphic", "image", "visual", "artwork"]) {
        TaskCategory::Graphics
    } else if any(&["art", "creative", "drawing", "painting"]) {
        TaskCategory::Art
    } else {
        TaskCategory::General
    }
}

/// Static `provider:model` rankings per category.
fn tier_table(category: TaskCategory) -> &'static [(ModelTier, &'static [&'static str])] {
    match category {
        TaskCategory::Coding => &[
            (ModelTier::S, &["cloud:large-coder", "cloud:large-general"]),
            (ModelTier::A, &["hosted:reasoner-32b", "hosted:llama-70b"]),
            (ModelTier::B, &["hosted:coder-14b", "local:coder-7b"]),
            (ModelTier::C, &["local:general-8b"]),
            (ModelTier::D, &["local:tiny-3b"]),
        ],
        TaskCategory::Writing | TaskCategory::Art => &[
            (ModelTier::S, &["cloud:large-general"]),
            (ModelTier::A, &["hosted:llama-70b", "cloud:fast-general"]),
            (ModelTier::B, &["local:general-8b"]),
            (ModelTier::C, &["local:small-4b"]),
            (ModelTier::D, &["local:tiny-3b"]),
        ],
        TaskCategory::Designing | TaskCategory::Graphics => &[
            (ModelTier::S, &["cloud:large-general"]),
            (ModelTier::A, &["cloud:vision-pro", "hosted:reasoner-32b"]),
            (ModelTier::B, &["cloud:fast-general", "local:general-8b"]),
            (ModelTier::C, &["local:small-4b"]),
            (ModelTier::D, &["local:tiny-3b"]),
        ],
        TaskCategory::General => &[
            (ModelTier::S, &["cloud:large-general"]),
            (ModelTier::A, &["hosted:reasoner-32b", "hosted:llama-70b"]),
            (ModelTier::B, &["cloud:fast-general", "local:general-8b"]),
            (ModelTier::C, &["local:small-4b"]),
            (ModelTier::D, &["local:tiny-3b"]),
        ],
    }
}

/// Manages tier selection and per-provider limit cooldowns.
pub struct ModelTierManager {
    limit_cooldowns: Mutex<HashMap<String, Instant>>,
}

impl Default for ModelTierManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelTierManager {
    pub fn new() -> Self {
        Self {
            limit_cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// The best `(provider, model)` for a category, skipping providers on
    /// cooldown. Tiers are scanned best-first, so a cooled-down premium
    /// provider demotes to the next ranked entry.
    pub fn best_available(&self, category: TaskCategory) -> Option<(String, String)> {
        let now = Instant::now();
        let mut cooldowns = self.limit_cooldowns.lock().expect("tier lock");
        cooldowns.retain(|_, until| *until > now);

        // Tables are ordered best tier first.
        for (_, specs) in tier_table(category) {
            for spec in specs.iter() {
                let Some((provider, model)) = spec.split_once(':') else {
                    continue;
                };
                if cooldowns.contains_key(provider) {
                    continue;
                }
                return Some((provider.to_string(), model.to_string()));
            }
        }
        warn!(category = category.as_str(), "no available tier models");
        None
    }

    /// Report that a provider hit its limit; cooled down for one hour.
    pub fn report_limit_hit(&self, provider_id: &str) {
        let until = Instant::now() + Duration::from_secs(3600);
        self.limit_cooldowns
            .lock()
            .expect("tier lock")
            .insert(provider_id.to_string(), until);
        info!(provider_id, "provider hit limit, tier cooldown applied");
    }
}
