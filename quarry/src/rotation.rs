//! Model provider rotation.
//!
//! An ordered candidate list per logical step kind, rate-limit
//! bookkeeping, and pacing. Callers iterate `get_models` in order,
//! attempting each provider until one succeeds. Only detected throttling
//! demotes a provider and forces a cooldown; any other failure just moves
//! on to the next candidate with no delay penalty.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

use crate::config::RotationConfig;

/// Step kind used by the query planner's completion calls.
pub const STEP_KIND_PLANNING: &str = "query-planning";

/// Failure of one completion call.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("provider returned status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("provider call failed: {0}")]
    Other(String),
}

/// One language-model backend, injected per deployment.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, model_id: &str, prompt: &str) -> Result<String, CompletionError>;
}

#[derive(Debug, Default)]
struct ProviderState {
    rate_limited_until: Option<Instant>,
    last_success: Option<Instant>,
}

/// Rolling counters across all rotation activity.
#[derive(Debug, Default)]
pub struct RotationMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    rate_limits: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationMetricsSummary {
    pub attempts: u64,
    pub successes: u64,
    pub rate_limits: u64,
}

pub struct ModelRotator {
    config: RotationConfig,
    states: DashMap<String, ProviderState>,
    /// Earliest moment the next model call may be issued, process-wide.
    next_call_at: Mutex<Instant>,
    metrics: RotationMetrics,
}

impl ModelRotator {
    pub fn new(config: RotationConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
            next_call_at: Mutex::new(Instant::now()),
            metrics: RotationMetrics::default(),
        }
    }

    /// Candidate providers for a step kind, configured order preserved,
    /// currently rate-limited providers stably demoted to the tail.
    pub fn get_models(&self, step_kind: &str, request_id: &str) -> Vec<String> {
        let route = match self.config.routes.get(step_kind) {
            Some(route) => route,
            None => {
                log::warn!("[rotation] no providers configured for step kind {}", step_kind);
                return vec![];
            }
        };

        let now = Instant::now();
        let (mut ordered, demoted): (Vec<String>, Vec<String>) = route
            .iter()
            .cloned()
            .partition(|id| !self.is_demoted(id, now));
        if !demoted.is_empty() {
            log::debug!(
                "[rotation] {}: demoting {} rate-limited provider(s) for {}",
                request_id,
                demoted.len(),
                step_kind
            );
        }
        ordered.extend(demoted);
        ordered
    }

    /// Demote a provider for the cooldown window and push out the global
    /// pacing gate so the next candidate is not tried immediately.
    pub fn mark_rate_limited(&self, provider: &str) {
        self.metrics.rate_limits.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        self.states
            .entry(provider.to_string())
            .or_default()
            .rate_limited_until = Some(now + self.config.demotion_window);

        let mut next = self
            .next_call_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let gated = now + self.config.rate_limit_cooldown;
        if gated > *next {
            *next = gated;
        }
        log::info!(
            "[rotation] provider {} rate limited; demoted for {:?}",
            provider,
            self.config.demotion_window
        );
    }

    /// Restore full priority after a successful call.
    pub fn mark_success(&self, provider: &str) {
        self.metrics.successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.states.entry(provider.to_string()).or_default();
        state.rate_limited_until = None;
        state.last_success = Some(Instant::now());
    }

    /// Distinguish throttling from genuine errors: HTTP 429 equivalents
    /// and provider-specific signature text.
    pub fn is_rate_limit_error(error: &CompletionError) -> bool {
        match error {
            CompletionError::Http { status: 429, .. } => true,
            CompletionError::Http { message, .. } | CompletionError::Other(message) => {
                let lower = message.to_lowercase();
                lower.contains("rate limit")
                    || lower.contains("too many requests")
                    || lower.contains("quota")
                    || lower.contains("429")
            }
        }
    }

    /// Enforce minimum inter-call spacing (and any pending rate-limit
    /// cooldown) before a model call is issued.
    pub async fn pace_before_call(&self) {
        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
        let wait = {
            let mut next = self
                .next_call_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            let start = (*next).max(now);
            *next = start + self.config.min_call_spacing;
            start.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    pub fn metrics(&self) -> RotationMetricsSummary {
        RotationMetricsSummary {
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            rate_limits: self.metrics.rate_limits.load(Ordering::Relaxed),
        }
    }

    fn is_demoted(&self, provider: &str, now: Instant) -> bool {
        self.states
            .get(provider)
            .and_then(|state| state.rate_limited_until)
            .map(|until| until > now)
            .unwrap_or(false)
    }
}
