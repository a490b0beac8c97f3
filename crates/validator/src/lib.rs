//! Command validation pipeline.
//!
//! The public entry point composes canonicalization, the static pre-filter,
//! the substitution resolver, and the provider chain into a single
//! decision:
//!
//! 1. Empty input blocks immediately.
//! 2. The command is canonicalized (pure text transforms).
//! 3. The pre-filter runs on the original and on every brace variant;
//!    a hit short-circuits with confidence 1.0 and no network call.
//! 4. Innermost command substitutions are validated recursively; ALLOWed
//!    inner commands execute sandboxed with a timeout and their stdout is
//!    substituted in. A blocked or warned inner substitution propagates as
//!    the outer decision.
//! 5. The resolved text goes to the provider chain (which enforces the
//!    length bound locally).
//! 6. The resolution log is folded into the decision reason.

pub mod ast;
pub mod prefilter;
pub mod resolver;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tracing::debug;

use wardsh_canon::{CanonicalCommand, canonicalize};
use wardsh_config::Config;
use wardsh_core::{Action, Decision, DecisionSource};
use wardsh_exec::Executor;
use wardsh_llm::{ChainDecision, ProviderChain};

pub use resolver::{ResolutionEntry, ResolutionStatus};

/// The seam between the validation pipeline and whatever answers for the
/// model chain. Production uses [`ProviderChain`]; tests substitute a
/// scripted backend.
#[async_trait]
pub trait DecisionBackend: Send {
    async fn decide(&mut self, command: &str) -> ChainDecision;
}

#[async_trait]
impl DecisionBackend for ProviderChain {
    async fn decide(&mut self, command: &str) -> ChainDecision {
        self.validate(command).await
    }
}

/// Everything the decision loop needs to act on one command.
#[derive(Debug)]
pub struct ValidationResult {
    pub decision: Decision,
    pub source: DecisionSource,
    /// Model that produced the decision; empty for local decisions.
    pub model: String,
    pub canonical: CanonicalCommand,
    /// Canonical text with resolved substitutions spliced in; what the
    /// executor should run on ALLOW.
    pub resolved_text: String,
    pub resolution_log: Vec<ResolutionEntry>,
}

pub struct Validator<B = ProviderChain> {
    config: Config,
    backend: B,
    executor: Executor,
}

impl<B: DecisionBackend> Validator<B> {
    pub fn new(config: Config, backend: B) -> Self {
        let executor = Executor::new(config.clone());
        Self {
            config,
            backend,
            executor,
        }
    }

    /// Validate one operator command.
    pub async fn validate(&mut self, command: &str) -> ValidationResult {
        self.validate_at_depth(command, 0).await
    }

    /// Depth-aware entry point; the substitution resolver re-enters here at
    /// `depth + 1` for inner commands.
    pub fn validate_at_depth<'a>(
        &'a mut self,
        command: &'a str,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = ValidationResult> + Send + 'a>> {
        Box::pin(async move {
            if command.trim().is_empty() {
                return ValidationResult {
                    decision: Decision::block("Empty command", 1.0),
                    source: DecisionSource::Validation,
                    model: String::new(),
                    canonical: CanonicalCommand {
                        original: command.to_string(),
                        text: command.to_string(),
                        ..CanonicalCommand::default()
                    },
                    resolved_text: command.to_string(),
                    resolution_log: Vec::new(),
                };
            }

            let canonical = canonicalize(command);

            // Static pre-filter on the original and every brace variant; a
            // variant-only payload like `{b,a}ash` must not slip past.
            let action = self.config.var_cmd_action();
            let static_hit = prefilter::check(&canonical.original, action)
                .or_else(|| {
                    canonical
                        .variants
                        .iter()
                        .find_map(|variant| prefilter::check(variant, action))
                });
            if let Some(decision) = static_hit {
                debug!(command, "static pre-filter hit");
                return ValidationResult {
                    decision,
                    source: DecisionSource::StaticBlocklist,
                    model: String::new(),
                    resolved_text: canonical.text.clone(),
                    canonical,
                    resolution_log: Vec::new(),
                };
            }

            let (resolved_text, resolution_log, propagated) =
                self.resolve_substitutions(&canonical.text, depth).await;
            if let Some((decision, model)) = propagated {
                return ValidationResult {
                    decision,
                    source: DecisionSource::Validation,
                    model,
                    resolved_text,
                    canonical,
                    resolution_log,
                };
            }

            let ChainDecision { decision, model } = self.backend.decide(&resolved_text).await;
            let decision = merge_resolution_notes(decision, &resolution_log);

            ValidationResult {
                decision,
                source: DecisionSource::Validation,
                model,
                resolved_text,
                canonical,
                resolution_log,
            }
        })
    }

    /// Validate and (when allowed) execute each innermost substitution.
    /// Returns the rewritten command, the log, and the propagated decision
    /// when an inner substitution was blocked or warned.
    async fn resolve_substitutions(
        &mut self,
        text: &str,
        depth: usize,
    ) -> (
        String,
        Vec<ResolutionEntry>,
        Option<(Decision, String)>,
    ) {
        let substitutions = resolver::extract_innermost_substitutions(text);
        let mut resolved = text.to_string();
        let mut log = Vec::new();
        let mut propagated: Option<(Decision, String)> = None;

        let max_depth = self.config.max_resolve_depth();
        let timeout = self.config.resolve_timeout();

        for (pattern, inner) in substitutions {
            if depth >= max_depth {
                log.push(ResolutionEntry {
                    pattern,
                    inner_command: inner,
                    status: ResolutionStatus::DepthExceeded,
                    output: None,
                    reason: Some(format!("Recursion depth {depth} >= max {max_depth}")),
                });
                continue;
            }

            let inner_result = self.validate_at_depth(&inner, depth + 1).await;
            match inner_result.decision.action {
                Action::Block => {
                    let reason = inner_result.decision.reason.clone();
                    // Worst inner status wins; a block outranks a warn.
                    let outer = Decision::block(
                        format!("Command substitution `{pattern}` blocked: {reason}"),
                        inner_result.decision.confidence,
                    );
                    propagated = Some((outer, inner_result.model));
                    log.push(ResolutionEntry {
                        pattern,
                        inner_command: inner,
                        status: ResolutionStatus::Blocked,
                        output: None,
                        reason: Some(reason),
                    });
                }
                Action::Warn => {
                    let reason = inner_result.decision.reason.clone();
                    if !matches!(&propagated, Some((Decision { action: Action::Block, .. }, _))) {
                        let outer = Decision::warn(
                            format!("Command substitution `{pattern}` warned: {reason}"),
                            inner_result.decision.confidence,
                        );
                        propagated = Some((outer, inner_result.model));
                    }
                    log.push(ResolutionEntry {
                        pattern,
                        inner_command: inner,
                        status: ResolutionStatus::Warned,
                        output: None,
                        reason: Some(reason),
                    });
                }
                Action::Allow => match self.executor.execute_captured(&inner, timeout).await {
                    Ok(output) => {
                        let stdout =
                            resolver::strip_one_trailing_newline(&output.stdout).to_string();
                        resolved = resolved.replacen(&pattern, &stdout, 1);
                        log.push(ResolutionEntry {
                            pattern,
                            inner_command: inner,
                            status: ResolutionStatus::Resolved,
                            output: Some(stdout),
                            reason: None,
                        });
                    }
                    Err(err) => {
                        log.push(ResolutionEntry {
                            pattern,
                            inner_command: inner,
                            status: ResolutionStatus::Error,
                            output: None,
                            reason: Some(format!("Execution error: {err}")),
                        });
                    }
                },
            }
        }

        (resolved, log, propagated)
    }
}

/// Fold the resolution log into the decision reason so the operator sees
/// what happened to the substitutions ("resolved 2 substitutions, 1 error").
fn merge_resolution_notes(decision: Decision, log: &[ResolutionEntry]) -> Decision {
    if log.is_empty() {
        return decision;
    }
    let mut counts: Vec<String> = Vec::new();
    for status in [
        ResolutionStatus::Resolved,
        ResolutionStatus::Error,
        ResolutionStatus::DepthExceeded,
    ] {
        let n = log.iter().filter(|entry| entry.status == status).count();
        if n > 0 {
            counts.push(format!("{n} {}", status.as_str()));
        }
    }
    if counts.is_empty() {
        return decision;
    }
    Decision::new(
        decision.action,
        format!("{} [substitutions: {}]", decision.reason, counts.join(", ")),
        decision.confidence,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    struct MockBackend {
        decisions: HashMap<String, Decision>,
        default: Decision,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DecisionBackend for MockBackend {
        async fn decide(&mut self, command: &str) -> ChainDecision {
            self.calls.lock().unwrap().push(command.to_string());
            let decision = self
                .decisions
                .get(command)
                .cloned()
                .unwrap_or_else(|| self.default.clone());
            ChainDecision {
                decision,
                model: "mock/model".to_string(),
            }
        }
    }

    fn validator_with(
        env: &[(&str, &str)],
        decisions: &[(&str, Decision)],
    ) -> (Validator<MockBackend>, Arc<Mutex<Vec<String>>>) {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let config = Config::load_from(Path::new("/nonexistent/wardsh-config"), env).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let backend = MockBackend {
            decisions: decisions
                .iter()
                .map(|(cmd, d)| ((*cmd).to_string(), d.clone()))
                .collect(),
            default: Decision::allow("Safe command", 0.9),
            calls: Arc::clone(&calls),
        };
        (Validator::new(config, backend), calls)
    }

    // ── entry conditions ───────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_command_blocks_without_model_call() {
        let (mut validator, calls) = validator_with(&[], &[]);
        for input in ["", "   ", "\t"] {
            let result = validator.validate(input).await;
            assert_eq!(result.decision.action, Action::Block);
            assert_eq!(result.decision.reason, "Empty command");
            assert_eq!(result.decision.confidence, 1.0);
        }
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn simple_command_allowed_with_canonical_text() {
        let (mut validator, _) = validator_with(&[], &[]);
        let result = validator.validate("echo hello").await;
        assert_eq!(result.decision.action, Action::Allow);
        assert_eq!(result.canonical.text, "echo hello");
        assert_eq!(result.resolved_text, "echo hello");
        assert_eq!(result.model, "mock/model");
        assert_eq!(result.source, DecisionSource::Validation);
    }

    // ── static pre-filter integration ──────────────────────────────────────

    #[tokio::test]
    async fn variable_in_command_position_short_circuits() {
        let (mut validator, calls) = validator_with(&[], &[]);
        let result = validator.validate("a=ba; b=sh; $a$b").await;
        assert_eq!(result.decision.action, Action::Block);
        assert_eq!(result.decision.confidence, 1.0);
        assert!(
            result
                .decision
                .reason
                .contains("Variable expansion in command position")
        );
        assert_eq!(result.source, DecisionSource::StaticBlocklist);
        // No model was consulted.
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn configured_warn_action_applies() {
        let (mut validator, _) =
            validator_with(&[("WARDSH_VAR_CMD_ACTION", "warn")], &[]);
        let result = validator.validate("$CMD").await;
        assert_eq!(result.decision.action, Action::Warn);
        assert_eq!(result.decision.confidence, 1.0);
    }

    #[tokio::test]
    async fn brace_payload_with_expansion_is_caught() {
        // Brace expansion of `{a,$A}ash` yields a variant that executes a
        // constructed name; the pre-filter sees it before any model does.
        let (mut validator, calls) = validator_with(&[], &[]);
        let result = validator.validate("A=b; {a,$A}ash").await;
        assert_eq!(result.decision.action, Action::Block);
        assert!(calls.lock().unwrap().is_empty());
    }

    // ── substitution resolution ────────────────────────────────────────────

    #[tokio::test]
    async fn literal_quoted_substitution_is_not_resolved() {
        let (mut validator, calls) = validator_with(&[], &[]);
        let result = validator.validate(r"echo $'$(whoami)'").await;
        assert_eq!(result.decision.action, Action::Allow);
        assert_eq!(result.canonical.text, "echo '$(whoami)'");
        assert!(result.resolution_log.is_empty());
        // whoami was never validated, let alone executed.
        assert_eq!(calls.lock().unwrap().as_slice(), ["echo '$(whoami)'"]);
    }

    #[tokio::test]
    async fn allowed_substitution_resolves_and_substitutes() {
        let (mut validator, calls) = validator_with(&[], &[]);
        let result = validator.validate("ls $(whoami)").await;
        assert_eq!(result.decision.action, Action::Allow);
        assert_eq!(result.resolution_log.len(), 1);
        let entry = &result.resolution_log[0];
        assert_eq!(entry.status, ResolutionStatus::Resolved);
        assert_eq!(entry.inner_command, "whoami");
        let output = entry.output.as_deref().unwrap();
        assert!(!output.contains('\n'));
        assert_eq!(result.resolved_text, format!("ls {output}"));
        // Inner command first, then the resolved outer command.
        let calls = calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["whoami", &format!("ls {output}")]);
        assert!(result.decision.reason.contains("1 resolved"));
    }

    #[tokio::test]
    async fn blocked_substitution_propagates_and_never_executes() {
        let marker = tempdir_marker();
        let inner = format!("touch {marker}");
        let command = format!("ls $({inner})");
        let (mut validator, calls) = validator_with(
            &[],
            &[(inner.as_str(), Decision::block("Destructive command", 0.98))],
        );
        let result = validator.validate(&command).await;
        assert_eq!(result.decision.action, Action::Block);
        assert!(result.decision.reason.contains("Command substitution"));
        assert_eq!(result.resolution_log[0].status, ResolutionStatus::Blocked);
        // Only the inner command was sent to the backend; the outer never was.
        assert_eq!(calls.lock().unwrap().as_slice(), [inner.as_str()]);
        // The blocked inner command did not run.
        assert!(!Path::new(&marker).exists());
    }

    #[tokio::test]
    async fn warned_substitution_propagates_warn() {
        let (mut validator, _) = validator_with(
            &[],
            &[("whoami", Decision::warn("Identity probe", 0.7))],
        );
        let result = validator.validate("ls $(whoami)").await;
        assert_eq!(result.decision.action, Action::Warn);
        assert_eq!(result.resolution_log[0].status, ResolutionStatus::Warned);
    }

    #[tokio::test]
    async fn failing_substitution_logs_error_and_continues() {
        let (mut validator, _) = validator_with(
            &[("WARDSH_RESOLVE_TIMEOUT", "1")],
            &[],
        );
        let result = validator.validate("echo $(sleep 5)").await;
        // The timeout is an entry, not an abort; the outer decision stands.
        assert_eq!(result.resolution_log[0].status, ResolutionStatus::Error);
        assert_eq!(result.decision.action, Action::Allow);
        assert!(result.decision.reason.contains("1 error"));
        // The unresolved pattern stays in the text.
        assert_eq!(result.resolved_text, "echo $(sleep 5)");
    }

    // ── depth bounds ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn below_max_depth_resolves() {
        let (mut validator, _) = validator_with(&[], &[]);
        let result = validator.validate_at_depth("ls $(whoami)", 1).await;
        assert_eq!(result.resolution_log[0].status, ResolutionStatus::Resolved);
    }

    #[tokio::test]
    async fn at_max_depth_is_depth_exceeded() {
        let (mut validator, calls) = validator_with(&[], &[]);
        let result = validator.validate_at_depth("ls $(whoami)", 2).await;
        let entry = &result.resolution_log[0];
        assert_eq!(entry.status, ResolutionStatus::DepthExceeded);
        assert!(entry.reason.as_deref().unwrap().contains("depth"));
        // Unresolved: the inner command was never validated.
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(result.resolved_text, "ls $(whoami)");
    }

    fn tempdir_marker() -> String {
        format!(
            "{}/wardsh-test-marker-{}",
            std::env::temp_dir().display(),
            std::process::id()
        )
    }
}
