//! Automatic failover across providers and models.
//!
//! `execute_with_failover` tries the primary (provider, model), classifies
//! any failure, puts the failed entry on cooldown, and walks an ordered
//! candidate list until a backend succeeds or the attempt budget runs out.
//!
//! Candidate order for a key:
//! 1. an explicit fallback chain configured for the key, verbatim
//! 2. the tier manager, when a task category is known (reports a limit hit
//!    so the tier system can demote)
//! 3. available entries in the same capability group, by (priority,
//!    success rate)
//! 4. any available entry, by priority

use crate::health::{FailoverReason, ProviderHealth};
use crate::provider::is_error_result;
use crate::tiers::{ModelTierManager, TaskCategory};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Callback invoked between attempts with
/// `(old_provider, old_model, new_provider, new_model, reason)`.
pub type FailoverCallback = Arc<dyn Fn(&str, &str, &str, &str, &str) + Send + Sync>;

/// Configuration for failover behavior.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub enabled: bool,
    /// Maximum number of distinct fallback attempts after the primary.
    pub max_retries: usize,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Capability groups: models that can substitute for each other.
    pub model_groups: Vec<(&'static str, Vec<&'static str>)>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            model_groups: vec![
                (
                    "high_capability",
                    vec!["large-general", "large-coder", "reasoner-32b", "llama-70b"],
                ),
                (
                    "balanced",
                    vec!["fast-general", "general-8b", "coder-14b", "coder-7b"],
                ),
                ("fast", vec!["small-4b", "tiny-3b"]),
            ],
        }
    }
}

impl FailoverConfig {
    fn group_of(&self, model: &str) -> Option<&'static str> {
        let model = model.to_lowercase();
        self.model_groups
            .iter()
            .find(|(_, models)| models.iter().any(|m| m.to_lowercase() == model))
            .map(|(name, _)| *name)
    }

    fn group_members(&self, group: &str) -> &[&'static str] {
        self.model_groups
            .iter()
            .find(|(name, _)| *name == group)
            .map(|(_, models)| models.as_slice())
            .unwrap_or(&[])
    }
}

/// Result of a failover-mediated execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverOutcome {
    /// The completion text, or an `"Error: …"` string on exhaustion.
    pub result: String,
    /// The provider that produced the result.
    pub provider_id: String,
    /// The model that produced the result.
    pub model: String,
}

/// Manages health records, fallback chains, and retry execution.
pub struct FailoverManager {
    config: FailoverConfig,
    providers: Mutex<HashMap<String, ProviderHealth>>,
    fallback_chains: Mutex<HashMap<String, Vec<(String, String)>>>,
    tiers: ModelTierManager,
}

impl Default for FailoverManager {
    fn default() -> Self {
        Self::new(FailoverConfig::default())
    }
}

impl FailoverManager {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            providers: Mutex::new(HashMap::new()),
            fallback_chains: Mutex::new(HashMap::new()),
            tiers: ModelTierManager::new(),
        }
    }

    pub fn tiers(&self) -> &ModelTierManager {
        &self.tiers
    }

    /// Register a provider's models for health tracking.
    pub async fn register_provider(&self, provider_id: &str, models: &[&str], priority: u32) {
        let mut providers = self.providers.lock().await;
        for model in models {
            let health = ProviderHealth::new(provider_id, *model, priority);
            info!(key = %health.key(), priority, "registered failover provider");
            providers.insert(health.key(), health);
        }
    }

    /// Set an explicit fallback chain for a (provider, model) key.
    pub async fn set_fallback_chain(
        &self,
        provider_id: &str,
        model: &str,
        fallbacks: Vec<(String, String)>,
    ) {
        let key = format!("{provider_id}/{model}");
        info!(%key, ?fallbacks, "set fallback chain");
        self.fallback_chains.lock().await.insert(key, fallbacks);
    }

    /// Snapshot of a health entry, for assertions and status endpoints.
    pub async fn health_of(&self, provider_id: &str, model: &str) -> Option<ProviderHealth> {
        self.providers
            .lock()
            .await
            .get(&format!("{provider_id}/{model}"))
            .cloned()
    }

    /// Ordered fallback candidates for a key: tier suggestion (when a
    /// category is known), then capability-group siblings, then any
    /// available entry by priority.
    async fn fallback_candidates(
        &self,
        provider_id: &str,
        model: &str,
        category: Option<TaskCategory>,
    ) -> Vec<(String, String)> {
        let key = format!("{provider_id}/{model}");

        if let Some(chain) = self.fallback_chains.lock().await.get(&key) {
            return chain.clone();
        }

        let mut candidates: Vec<(String, String)> = Vec::new();

        if let Some(category) = category {
            if let Some((fb_provider, fb_model)) = self.tiers.best_available(category) {
                if fb_provider != provider_id || fb_model != model {
                    self.tiers.report_limit_hit(provider_id);
                    candidates.push((fb_provider, fb_model));
                }
            }
        }

        let providers = self.providers.lock().await;

        let mut group_members: Vec<&ProviderHealth> = Vec::new();
        if let Some(group) = self.config.group_of(model) {
            let members = self.config.group_members(group);
            group_members = providers
                .values()
                .filter(|h| h.key() != key && h.is_available())
                .filter(|h| {
                    members
                        .iter()
                        .any(|m| m.to_lowercase() == h.model.to_lowercase())
                })
                .collect();
            group_members.sort_by(|a, b| {
                a.priority.cmp(&b.priority).then(
                    b.success_rate()
                        .partial_cmp(&a.success_rate())
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
            });
        }

        if group_members.is_empty() {
            group_members = providers
                .values()
                .filter(|h| h.key() != key && h.is_available())
                .collect();
            group_members.sort_by_key(|h| h.priority);
        }

        for health in group_members {
            let candidate = (health.provider_id.clone(), health.model.clone());
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }

        candidates
    }

    /// Execute `task` with automatic failover on failure.
    ///
    /// `task` is called with the (provider_id, model) to attempt and must
    /// return the completion text, following the `"Error: …"` convention.
    pub async fn execute_with_failover<F, Fut>(
        &self,
        provider_id: &str,
        model: &str,
        task: F,
        on_failover: Option<FailoverCallback>,
        category: Option<TaskCategory>,
    ) -> FailoverOutcome
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = String>,
    {
        if !self.config.enabled {
            let result = task(provider_id.to_string(), model.to_string()).await;
            return FailoverOutcome {
                result,
                provider_id: provider_id.to_string(),
                model: model.to_string(),
            };
        }

        let mut attempts: Vec<(String, String)> = vec![(provider_id.to_string(), model.to_string())];
        let mut last_error = String::new();

        for _ in 0..=self.config.max_retries {
            let (current_provider, current_model) = attempts.last().cloned().expect("attempts");
            let current_key = format!("{current_provider}/{current_model}");

            let start = Instant::now();
            let result = task(current_provider.clone(), current_model.clone()).await;

            if !is_error_result(&result) {
                if let Some(health) = self.providers.lock().await.get_mut(&current_key) {
                    health.record_success(start.elapsed());
                }
                return FailoverOutcome {
                    result,
                    provider_id: current_provider,
                    model: current_model,
                };
            }

            last_error = result;
            let reason = FailoverReason::classify(&last_error);
            warn!(
                key = %current_key,
                reason = reason.as_str(),
                error = %last_error.chars().take(100).collect::<String>(),
                "failover triggered"
            );

            if let Some(health) = self.providers.lock().await.get_mut(&current_key) {
                health.record_failure(reason);
            }

            let fallbacks = self
                .fallback_candidates(&current_provider, &current_model, category)
                .await;

            let next = {
                let providers = self.providers.lock().await;
                fallbacks.into_iter().find(|(p, m)| {
                    let tried = attempts.iter().any(|(ap, am)| ap == p && am == m);
                    let available = providers
                        .get(&format!("{p}/{m}"))
                        .map(|h| h.is_available())
                        .unwrap_or(false);
                    !tried && available
                })
            };

            match next {
                Some((next_provider, next_model)) => {
                    if let Some(callback) = &on_failover {
                        callback(
                            &current_provider,
                            &current_model,
                            &next_provider,
                            &next_model,
                            reason.as_str(),
                        );
                    }
                    info!(
                        from = %current_key,
                        to = %format!("{next_provider}/{next_model}"),
                        "failing over"
                    );
                    attempts.push((next_provider, next_model));
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                None => break,
            }
        }

        let (final_provider, final_model) = attempts.last().cloned().expect("attempts");
        FailoverOutcome {
            result: format!("Error: all failover attempts exhausted. Last error: {last_error}"),
            provider_id: final_provider,
            model: final_model,
        }
    }
}
