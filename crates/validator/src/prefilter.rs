//! Static pre-filter: variable expansion in command position.
//!
//! Parses the *original* command with the minimal shell grammar and walks
//! the tree looking for a parameter expansion as the command word of any
//! simple command or pipeline segment — the `a=ba; b=sh; $a$b` family that
//! must never reach a model. `eval`/`exec` with an expansion argument count
//! too.
//!
//! Only [`AstError`] is caught here; a fuzzing campaign against an earlier
//! walker showed that swallowing anything broader silently reopens every
//! known evasion. Parse failures return `None` and the LLM path remains.

use tracing::debug;

use wardsh_core::{Action, Decision};

use crate::ast::{self, AstError, Node, Word};

/// Check a command for variable-in-command-position. Returns the decision
/// to short-circuit with (configured action, confidence 1.0), or `None`
/// when the command is clean or unparseable.
pub fn check(command: &str, action: Action) -> Option<Decision> {
    // The only failure handled here is the parser's own error type; the
    // signature guarantees nothing broader can be swallowed.
    let nodes = match ast::parse(command) {
        Ok(nodes) => nodes,
        Err(err @ AstError::UnterminatedQuote)
        | Err(err @ AstError::Unexpected(_))
        | Err(err @ AstError::UnexpectedEof(_)) => {
            debug!(%err, "pre-filter parse failed; falling through to model validation");
            return None;
        }
    };

    let has_assignment = any_assignment(&nodes);
    let reason = scan_nodes(&nodes, has_assignment)?;
    Some(Decision::new(action, reason, 1.0))
}

fn any_assignment(nodes: &[Node]) -> bool {
    nodes.iter().any(|node| match node {
        Node::Command { words } => words.iter().any(Word::is_assignment),
        Node::Pipeline { segments } => any_assignment(segments),
        Node::List { nodes } => any_assignment(nodes),
        Node::If { arms, else_body } => {
            arms.iter()
                .any(|(cond, body)| any_assignment(cond) || any_assignment(body))
                || else_body.as_deref().is_some_and(any_assignment)
        }
        Node::For { body, .. } => any_assignment(body),
        Node::While { cond, body } | Node::Until { cond, body } => {
            any_assignment(cond) || any_assignment(body)
        }
        Node::Case { arms, .. } => arms.iter().any(|arm| any_assignment(&arm.body)),
        Node::BraceGroup { body } | Node::Subshell { body } => any_assignment(body),
        Node::FunctionDef { body, .. } => any_assignment(std::slice::from_ref(body)),
    })
}

fn scan_nodes(nodes: &[Node], has_assignment: bool) -> Option<String> {
    for node in nodes {
        if let Some(reason) = scan_node(node, has_assignment) {
            return Some(reason);
        }
    }
    None
}

fn scan_node(node: &Node, has_assignment: bool) -> Option<String> {
    match node {
        Node::Command { words } => scan_command(words, has_assignment, false),
        Node::Pipeline { segments } => {
            for segment in segments {
                let found = match segment {
                    Node::Command { words } => scan_command(words, has_assignment, true),
                    other => scan_node(other, has_assignment),
                };
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        Node::List { nodes } => {
            let scoped = has_assignment || any_assignment(nodes);
            scan_nodes(nodes, scoped)
        }
        Node::If { arms, else_body } => {
            for (cond, body) in arms {
                if let Some(reason) =
                    scan_nodes(cond, has_assignment).or_else(|| scan_nodes(body, has_assignment))
                {
                    return Some(reason);
                }
            }
            else_body
                .as_deref()
                .and_then(|body| scan_nodes(body, has_assignment))
        }
        Node::For { body, .. } => scan_nodes(body, has_assignment),
        Node::While { cond, body } | Node::Until { cond, body } => {
            scan_nodes(cond, has_assignment).or_else(|| scan_nodes(body, has_assignment))
        }
        Node::Case { arms, .. } => arms
            .iter()
            .find_map(|arm| scan_nodes(&arm.body, has_assignment)),
        Node::BraceGroup { body } | Node::Subshell { body } => {
            let scoped = has_assignment || any_assignment(body);
            scan_nodes(body, scoped)
        }
        Node::FunctionDef { body, .. } => scan_node(body, has_assignment),
    }
}

fn scan_command(words: &[Word], has_assignment: bool, in_pipeline: bool) -> Option<String> {
    // The command word is the first non-assignment word; leading inline
    // assignments (`FOO=bar $CMD`) don't count.
    let mut iter = words.iter();
    let command_word = loop {
        match iter.next() {
            Some(word) if word.is_assignment() => continue,
            Some(word) => break word,
            None => return None,
        }
    };

    if command_word.has_param_expansion {
        if in_pipeline {
            return Some("Variable expansion in command position in pipeline".to_string());
        }
        if has_assignment {
            return Some(
                "Variable expansion in command position with preceding assignment".to_string(),
            );
        }
        return Some("Variable expansion in command position".to_string());
    }

    // eval/exec launder a variable into command position one step later.
    if matches!(command_word.text.as_str(), "eval" | "exec")
        && iter.clone().any(|word| word.has_param_expansion)
    {
        return Some(format!(
            "Variable expansion passed to {}",
            command_word.text
        ));
    }

    None
}
