//! Environment sanitisation.
//!
//! Two projections of the process environment:
//!
//! * [`safe_env`] — the allow-listed mapping handed to every subprocess
//!   launch. Allow-list, not block-list: fuzzing a block-list predecessor
//!   showed dozens of security-sensitive variables (library preload, shell
//!   options, interpreter startup hooks, VCS transport, pager pipes)
//!   slipping through, and enumerating them all is brittle. Only names on
//!   the list, or carrying a listed prefix, survive.
//! * [`redacted_env`] — the mapping used when composing LLM prompts; names
//!   matching the sensitive patterns are dropped so secret values never
//!   leave the machine.
//!
//! Both are rebuilt from the current process environment per use and never
//! stored.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Variables passed through to subprocess launches, by exact name.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "PWD",
    "OLDPWD",
    "LANG",
    "TZ",
    "TMPDIR",
    "HOSTNAME",
    "COLUMNS",
    "LINES",
];

/// Prefixes passed through to subprocess launches (locale family).
pub const ENV_ALLOWLIST_PREFIXES: &[&str] = &["LC_"];

/// Name substrings that mark a variable as secret-bearing. Matched
/// case-insensitively against the variable name, never the value.
pub const SENSITIVE_VAR_PATTERNS: &[&str] = &[
    "key", "secret", "token", "password", "passwd", "credential", "auth",
];

/// True when `name` survives the subprocess allow-list.
pub fn is_allowed_name(name: &str) -> bool {
    ENV_ALLOWLIST.contains(&name)
        || ENV_ALLOWLIST_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// True when `name` matches a sensitive pattern and must be redacted from
/// anything shipped to a provider.
pub fn is_sensitive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_VAR_PATTERNS.iter().any(|pat| lower.contains(pat))
}

/// Allow-listed environment for a subprocess launch, built from the current
/// process environment.
pub fn safe_env() -> HashMap<String, String> {
    safe_env_from(std::env::vars())
}

pub fn safe_env_from(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.filter(|(name, _)| is_allowed_name(name)).collect()
}

/// Environment projection for prompt composition. When `filter` is off the
/// full environment is returned (full expansion); when on, secret-bearing
/// names are dropped.
pub fn redacted_env(filter: bool) -> HashMap<String, String> {
    redacted_env_from(std::env::vars(), filter)
}

pub fn redacted_env_from(
    vars: impl Iterator<Item = (String, String)>,
    filter: bool,
) -> HashMap<String, String> {
    vars.filter(|(name, _)| !filter || !is_sensitive_name(name)).collect()
}

// ── Variable expansion ───────────────────────────────────────────────────────

fn var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

/// Expand `$NAME` / `${NAME}` against `env`. Unset names expand to the
/// empty string (shell behaviour without `nounset`). Pure text transform;
/// nothing is executed. Used only to build the "after environment
/// expansion" note for the validator prompt.
pub fn expand_vars(command: &str, env: &HashMap<String, String>) -> String {
    if !command.contains('$') {
        return command.to_string();
    }
    var_regex()
        .replace_all(command, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            env.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Iterator<Item = (String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    // ── allow-list ─────────────────────────────────────────────────────────

    #[test]
    fn allowlist_keeps_basics_drops_everything_else() {
        let env = safe_env_from(vars(&[
            ("PATH", "/usr/bin"),
            ("HOME", "/home/op"),
            ("LD_PRELOAD", "/tmp/evil.so"),
            ("BASH_ENV", "/tmp/hook.sh"),
            ("PROMPT_COMMAND", "curl evil"),
            ("GIT_SSH_COMMAND", "sh -c id"),
            ("PYTHONSTARTUP", "/tmp/x.py"),
            ("LESSOPEN", "|id"),
        ]));
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("PATH").unwrap(), "/usr/bin");
        assert_eq!(env.get("HOME").unwrap(), "/home/op");
    }

    #[test]
    fn allowlist_prefix_passes_locale_family() {
        let env = safe_env_from(vars(&[("LC_ALL", "C.UTF-8"), ("LC_TIME", "en_US")]));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn exported_shell_functions_never_survive() {
        let env = safe_env_from(vars(&[("BASH_FUNC_ls%%", "() { rm -rf /; }")]));
        assert!(env.is_empty());
    }

    // ── redaction ──────────────────────────────────────────────────────────

    #[test]
    fn sensitive_names_detected_case_insensitively() {
        assert!(is_sensitive_name("OPENAI_API_KEY"));
        assert!(is_sensitive_name("aws_secret_access_key"));
        assert!(is_sensitive_name("GITHUB_TOKEN"));
        assert!(is_sensitive_name("DB_PASSWORD"));
        assert!(!is_sensitive_name("HOME"));
        assert!(!is_sensitive_name("PATH"));
    }

    #[test]
    fn redaction_only_applies_when_filtering_enabled() {
        let pairs = [("OPENAI_API_KEY", "sk-secret"), ("HOME", "/home/op")];
        let unfiltered = redacted_env_from(vars(&pairs), false);
        assert!(unfiltered.contains_key("OPENAI_API_KEY"));
        let filtered = redacted_env_from(vars(&pairs), true);
        assert!(!filtered.contains_key("OPENAI_API_KEY"));
        assert_eq!(filtered.get("HOME").unwrap(), "/home/op");
    }

    // ── expansion ──────────────────────────────────────────────────────────

    #[test]
    fn expands_both_variable_forms() {
        let env = vars(&[("SHELL", "/bin/zsh"), ("USER", "op")]).collect();
        assert_eq!(expand_vars("exec $SHELL", &env), "exec /bin/zsh");
        assert_eq!(expand_vars("echo ${USER}!", &env), "echo op!");
    }

    #[test]
    fn unset_variables_expand_to_empty() {
        let env = HashMap::new();
        assert_eq!(expand_vars("ls $NOPE/bin", &env), "ls /bin");
    }

    #[test]
    fn no_dollar_is_returned_verbatim() {
        let env = vars(&[("X", "y")]).collect();
        assert_eq!(expand_vars("ls -la /tmp", &env), "ls -la /tmp");
    }

    #[test]
    fn redacted_value_absent_from_expansion() {
        let env = redacted_env_from(vars(&[("MY_API_KEY", "sk-123"), ("HOME", "/h")]), true);
        // The secret name expands to empty, not to its value.
        assert_eq!(expand_vars("echo $MY_API_KEY in $HOME", &env), "echo  in /h");
    }
}
