//! Provider chain: submit a canonical command to one or more LLM
//! validators and produce a decision.
//!
//! Descriptors are tried in configured order; any provider failure,
//! rate-limit hit, empty completion, or parse failure records the error and
//! falls through to the next descriptor. When every descriptor fails, the
//! fail-mode policy collapses the chain into a single decision: `safe`
//! blocks, `open` warns, both with confidence 0 and a reason naming the
//! last error so the operator can diagnose.

pub mod parse;
pub mod prompt;
pub mod providers;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use wardsh_config::{Config, FailMode, Role};
use wardsh_core::Decision;

pub use parse::{ParseFailure, extract_action, parse_decision};
pub use providers::{Completion, Descriptor, ProviderError, api_key, provider_from_model};

/// Commands longer than this are blocked locally, before any network call.
pub const MAX_COMMAND_LENGTH: usize = 4096;

/// Per-descriptor bound for the startup health probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Known-safe probe command used to pin the session chain at startup.
const HEALTH_CHECK_COMMAND: &str = "echo hello";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no usable model descriptors in the configured chain")]
    EmptyChain,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Decision plus the model that produced it (empty for local decisions and
/// fail-mode collapses), for the audit trail.
#[derive(Debug, Clone)]
pub struct ChainDecision {
    pub decision: Decision,
    pub model: String,
}

/// Health probe result for one descriptor.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub model: String,
    pub healthy: bool,
}

// ── Rate limiting ────────────────────────────────────────────────────────────

/// Sliding-window queries-per-minute bound, enforced locally.
#[derive(Debug)]
struct RateLimiter {
    max_per_minute: u32,
    stamps: VecDeque<Instant>,
}

impl RateLimiter {
    fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            stamps: VecDeque::new(),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) >= Duration::from_secs(60) {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        if self.stamps.len() >= self.max_per_minute as usize {
            return false;
        }
        self.stamps.push_back(now);
        true
    }
}

// ── Provider chain ───────────────────────────────────────────────────────────

pub struct ProviderChain {
    descriptors: Vec<Descriptor>,
    client: reqwest::Client,
    timeout: Duration,
    fail_mode: FailMode,
    role: Role,
    filter_sensitive: bool,
    limiter: RateLimiter,
}

impl ProviderChain {
    /// Build the chain from configuration. Descriptors with malformed model
    /// strings, unsupported providers, or providers outside the allow-list
    /// are dropped with a warning; an empty surviving chain is an error.
    pub fn from_config(config: &Config) -> Result<Self, ChainError> {
        let allowed = config.allowed_providers();
        let mut descriptors = Vec::new();
        for model in config.model_chain() {
            if let Err(err) = providers::validate_model_provider(&model, &allowed) {
                warn!(model = model.as_str(), %err, "dropping model from chain");
                continue;
            }
            match Descriptor::from_model(&model) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(err) => warn!(model = model.as_str(), %err, "dropping model from chain"),
            }
        }
        if descriptors.is_empty() {
            return Err(ChainError::EmptyChain);
        }

        Ok(Self {
            descriptors,
            client: reqwest::Client::builder().build()?,
            timeout: config.llm_timeout(),
            fail_mode: config.fail_mode(),
            role: config.role(),
            filter_sensitive: config.filter_sensitive_vars(),
            limiter: RateLimiter::new(config.max_queries_per_minute()),
        })
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    /// Submit a command for classification, walking the fallback chain.
    pub async fn validate(&mut self, command: &str) -> ChainDecision {
        if command.len() > MAX_COMMAND_LENGTH {
            return ChainDecision {
                decision: Decision::block(
                    format!("Command too long ({} chars)", command.len()),
                    1.0,
                ),
                model: String::new(),
            };
        }

        let env = wardsh_env::redacted_env(self.filter_sensitive);
        let system = prompt::system_prompt(self.role);
        let user = prompt::user_message(command, &env);

        let mut last_error: Option<String> = None;
        for descriptor in &self.descriptors {
            if !self.limiter.try_acquire(Instant::now()) {
                last_error = Some(format!("{}: local rate limit exceeded", descriptor.model));
                debug!(model = descriptor.model.as_str(), "rate limit hit, skipping descriptor");
                continue;
            }
            // An operator interrupt aborts the in-flight request and falls
            // through to the next descriptor as if it had errored.
            let outcome = tokio::select! {
                outcome = descriptor.query(&self.client, self.timeout, &system, &user) => outcome,
                _ = tokio::signal::ctrl_c() => {
                    warn!(model = descriptor.model.as_str(), "request interrupted by operator");
                    last_error = Some(format!("{}: interrupted", descriptor.model));
                    continue;
                }
            };
            match outcome {
                Ok(completion) => match parse::parse_completion(&completion) {
                    Ok(decision) => {
                        debug!(
                            model = descriptor.model.as_str(),
                            action = decision.action.as_str(),
                            "validator decision"
                        );
                        return ChainDecision {
                            decision,
                            model: descriptor.model.clone(),
                        };
                    }
                    Err(failure) => {
                        warn!(
                            model = descriptor.model.as_str(),
                            %failure,
                            "unusable completion, trying next descriptor"
                        );
                        last_error = Some(format!("{}: {failure}", descriptor.model));
                    }
                },
                Err(err) => {
                    warn!(model = descriptor.model.as_str(), %err, "provider failed, trying next descriptor");
                    last_error = Some(format!("{}: {err}", descriptor.model));
                }
            }
        }

        self.validation_failed(last_error.unwrap_or_else(|| "all providers failed".to_string()))
    }

    fn validation_failed(&self, last_error: String) -> ChainDecision {
        let reason = format!("Could not validate command: {last_error}");
        let decision = match self.fail_mode {
            FailMode::Safe => Decision::block(reason, 0.0),
            FailMode::Open => Decision::warn(reason, 0.0),
        };
        ChainDecision {
            decision,
            model: String::new(),
        }
    }

    /// Startup health check: probe each descriptor with a known-safe
    /// command and pin the session to the ones that answer sensibly.
    ///
    /// Descriptors that error, time out, or misclassify the probe are
    /// removed from the chain for the remainder of the session — this
    /// prevents oscillating between a broken primary and a slow fallback on
    /// every command. If nothing passes, the full configured chain is kept
    /// and the shell runs in degraded mode.
    pub async fn health_check(&mut self) -> Vec<HealthStatus> {
        let env = wardsh_env::redacted_env(self.filter_sensitive);
        let system = prompt::system_prompt(self.role);
        let user = prompt::user_message(HEALTH_CHECK_COMMAND, &env);

        let mut statuses = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let healthy = match descriptor
                .query(&self.client, HEALTH_CHECK_TIMEOUT, &system, &user)
                .await
            {
                Ok(completion) => matches!(
                    parse::parse_completion(&completion).map(|d| d.action),
                    Ok(wardsh_core::Action::Allow) | Ok(wardsh_core::Action::Warn)
                ),
                Err(err) => {
                    debug!(model = descriptor.model.as_str(), %err, "health check failed");
                    false
                }
            };
            statuses.push(HealthStatus {
                model: descriptor.model.clone(),
                healthy,
            });
        }

        let healthy_count = statuses.iter().filter(|s| s.healthy).count();
        if healthy_count > 0 && healthy_count < self.descriptors.len() {
            let keep: Vec<bool> = statuses.iter().map(|s| s.healthy).collect();
            let mut index = 0;
            self.descriptors.retain(|_| {
                let kept = keep[index];
                index += 1;
                kept
            });
            info!(kept = healthy_count, "session pinned to healthy descriptors");
        } else if healthy_count == 0 {
            warn!("no descriptor passed the health check; keeping full chain (degraded mode)");
        }

        statuses
    }
}

/// Startup credential validation: at least one descriptor in the chain must
/// have a credential (local providers always do).
pub fn validate_credentials(chain: &[String]) -> Result<String, String> {
    let configured: Vec<&str> = chain
        .iter()
        .map(|model| provider_from_model(model))
        .filter(|provider| api_key(provider).is_some())
        .collect();

    if configured.is_empty() {
        return Err(
            "No LLM API credentials configured.\n\n\
             wardsh requires at least one API key to validate commands.\n\n\
             Set one or more of these environment variables:\n\
             \x20 export OPENAI_API_KEY=\"your-key-here\"\n\
             \x20 export ANTHROPIC_API_KEY=\"your-key-here\"\n\
             \x20 export GEMINI_API_KEY=\"your-key-here\"\n\n\
             Or run a local model and point the chain at ollama/<model>."
                .to_string(),
        );
    }

    let mut unique: Vec<&str> = Vec::new();
    for provider in configured {
        if !unique.contains(&provider) {
            unique.push(provider);
        }
    }
    Ok(format!("Using providers: {}", unique.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    fn dev_config(env: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::load_from(Path::new("/nonexistent/wardsh-config"), env).unwrap()
    }

    fn offline_chain(fail_mode: &str) -> ProviderChain {
        // A descriptor with its credential stripped fails before any
        // network I/O, which lets the fail-mode paths run hermetically.
        let config = dev_config(&[
            ("WARDSH_PRIMARY_MODEL", "openai/gpt-4o-mini"),
            ("WARDSH_FALLBACK_MODELS", ""),
            ("WARDSH_FAIL_MODE", fail_mode),
        ]);
        let mut chain = ProviderChain::from_config(&config).unwrap();
        chain.descriptors = chain
            .descriptors
            .into_iter()
            .map(|d| d.with_credential(None))
            .collect();
        chain
    }

    // ── rate limiter ───────────────────────────────────────────────────────

    #[test]
    fn rate_limiter_enforces_window() {
        let mut limiter = RateLimiter::new(2);
        let t0 = Instant::now();
        assert!(limiter.try_acquire(t0));
        assert!(limiter.try_acquire(t0));
        assert!(!limiter.try_acquire(t0));
        // A minute later the window has drained.
        assert!(limiter.try_acquire(t0 + Duration::from_secs(61)));
    }

    // ── chain construction ─────────────────────────────────────────────────

    #[test]
    fn chain_drops_disallowed_providers() {
        let config = dev_config(&[
            ("WARDSH_PRIMARY_MODEL", "openai/gpt-4o-mini"),
            ("WARDSH_FALLBACK_MODELS", "anthropic/claude-3-5-haiku-20241022"),
            ("WARDSH_ALLOWED_PROVIDERS", "anthropic"),
        ]);
        let chain = ProviderChain::from_config(&config).unwrap();
        assert_eq!(chain.descriptors().len(), 1);
        assert_eq!(chain.descriptors()[0].provider, "anthropic");
    }

    #[test]
    fn empty_chain_is_an_error() {
        let config = dev_config(&[
            ("WARDSH_PRIMARY_MODEL", "openai/gpt-4o-mini"),
            ("WARDSH_FALLBACK_MODELS", ""),
            ("WARDSH_ALLOWED_PROVIDERS", "ollama"),
        ]);
        assert!(matches!(
            ProviderChain::from_config(&config),
            Err(ChainError::EmptyChain)
        ));
    }

    // ── local decisions ────────────────────────────────────────────────────

    #[tokio::test]
    async fn overlong_command_blocked_before_dispatch() {
        let mut chain = offline_chain("safe");
        let long = "x".repeat(MAX_COMMAND_LENGTH + 1);
        let outcome = chain.validate(&long).await;
        assert_eq!(outcome.decision.action, wardsh_core::Action::Block);
        assert_eq!(outcome.decision.confidence, 1.0);
        assert!(outcome.decision.reason.contains("too long"));
        assert!(outcome.model.is_empty());
    }

    #[tokio::test]
    async fn command_at_exact_bound_is_processed() {
        let mut chain = offline_chain("open");
        let exact = "x".repeat(MAX_COMMAND_LENGTH);
        // Not blocked for length; the (credential-less) chain then collapses
        // per fail-mode instead.
        let outcome = chain.validate(&exact).await;
        assert_eq!(outcome.decision.action, wardsh_core::Action::Warn);
        assert!(!outcome.decision.reason.contains("too long"));
    }

    #[tokio::test]
    async fn fail_safe_blocks_with_zero_confidence() {
        let mut chain = offline_chain("safe");
        let outcome = chain.validate("ls -la").await;
        assert_eq!(outcome.decision.action, wardsh_core::Action::Block);
        assert_eq!(outcome.decision.confidence, 0.0);
        assert!(outcome.decision.reason.contains("Could not validate command"));
        assert!(outcome.decision.reason.contains("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn fail_open_warns_with_zero_confidence() {
        let mut chain = offline_chain("open");
        let outcome = chain.validate("ls -la").await;
        assert_eq!(outcome.decision.action, wardsh_core::Action::Warn);
        assert_eq!(outcome.decision.confidence, 0.0);
    }

    // ── health check ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn all_failing_health_check_keeps_full_chain() {
        let mut chain = offline_chain("safe");
        let statuses = chain.health_check().await;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].healthy);
        // Degraded mode: nothing passed, so nothing is pruned.
        assert_eq!(chain.descriptors().len(), 1);
    }

    // ── credential validation ──────────────────────────────────────────────

    #[test]
    fn local_provider_satisfies_credential_check() {
        let msg = validate_credentials(&["ollama/llama3.1:8b".to_string()]).unwrap();
        assert!(msg.contains("ollama"));
    }
}
