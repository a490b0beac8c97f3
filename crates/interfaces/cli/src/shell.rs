//! The interactive decision loop: read → validate → act → log.
//!
//! Single-threaded and cooperative; exactly one command is in flight at a
//! time, so audit entries are naturally ordered by submission. Ctrl+C
//! during an input read cancels that line; end-of-input terminates the
//! loop. Exit-code sentinels: 1 blocked, 2 cancelled WARN, 130 interrupt.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::debug;

use wardsh_audit::AuditLog;
use wardsh_config::{Config, Mode};
use wardsh_core::Action;
use wardsh_exec::Executor;
use wardsh_llm::{HealthStatus, ProviderChain};
use wardsh_validator::Validator;

pub const EXIT_BLOCKED: i32 = 1;
pub const EXIT_CANCELLED: i32 = 2;
pub const EXIT_INTERRUPT: i32 = 130;

const EXIT_WORD: &str = "exit";

pub fn print_banner(config: &Config, credentials: &str, sandbox_status: &str, health: &[HealthStatus]) {
    println!("wardsh - LLM-mediated shell with security validation");
    println!(
        "Mode: {} | fail-mode: {} | sandbox: {} | {}",
        config.mode().as_str(),
        config.fail_mode().as_str(),
        sandbox_status,
        credentials
    );
    let chain_display: Vec<String> = health
        .iter()
        .map(|status| {
            let marker = if status.healthy { "active" } else { "--" };
            format!("{} ({marker})", status.model)
        })
        .collect();
    println!("Model chain: {}", chain_display.join(" > "));
    if let Some(primary) = health.first() {
        if !primary.healthy {
            println!("warning: primary model failed its health check; relying on fallbacks");
        }
    }
    println!("Type 'exit' or press Ctrl+D to quit.\n");
}

fn prompt(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

enum Input {
    Line(String),
    Interrupt,
    Eof,
}

async fn read_input(lines: &mut Lines<BufReader<Stdin>>) -> Input {
    tokio::select! {
        line = lines.next_line() => match line {
            Ok(Some(line)) => Input::Line(line),
            _ => Input::Eof,
        },
        _ = tokio::signal::ctrl_c() => Input::Interrupt,
    }
}

pub async fn run_shell(
    config: &Config,
    mut validator: Validator<ProviderChain>,
    mut executor: Executor,
    mut audit: AuditLog,
) -> i32 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_exit_code = 0i32;

    loop {
        prompt("wardsh> ");
        let command = match read_input(&mut lines).await {
            Input::Line(line) => line,
            Input::Interrupt => {
                println!();
                last_exit_code = EXIT_INTERRUPT;
                continue;
            }
            Input::Eof => {
                println!();
                break;
            }
        };
        let command = command.trim();

        if command.is_empty() {
            continue;
        }
        if command == EXIT_WORD {
            break;
        }

        let result = validator.validate(command).await;
        debug!(
            action = result.decision.action.as_str(),
            confidence = result.decision.confidence,
            "validation decision"
        );

        match result.decision.action {
            Action::Allow => {
                last_exit_code = execute(&mut executor, &result.resolved_text, last_exit_code).await;
                audit.log_validation(command, &result.decision, result.source, &result.model);
            }
            Action::Block => {
                println!("\nBLOCKED: {}", result.decision.reason);
                last_exit_code = EXIT_BLOCKED;
                audit.log_validation(command, &result.decision, result.source, &result.model);
            }
            Action::Warn => {
                println!(
                    "\nWARNING: {} (confidence {:.2})",
                    result.decision.reason, result.decision.confidence
                );
                prompt("Proceed anyway? [y/N]: ");
                match read_input(&mut lines).await {
                    Input::Line(answer)
                        if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") =>
                    {
                        last_exit_code =
                            execute(&mut executor, &result.resolved_text, last_exit_code).await;
                        audit.log_warn_override(command, &result.decision.reason);
                    }
                    Input::Line(_) | Input::Eof => {
                        println!("Command cancelled.\n");
                        last_exit_code = EXIT_CANCELLED;
                        audit.log_validation(command, &result.decision, result.source, &result.model);
                    }
                    Input::Interrupt => {
                        println!("\nCommand cancelled.\n");
                        last_exit_code = EXIT_INTERRUPT;
                        audit.log_validation(command, &result.decision, result.source, &result.model);
                    }
                }
            }
        }
    }

    if config.mode() == Mode::Production {
        // A production session never drops back to an unmonitored parent
        // shell; end the process here.
        std::process::exit(last_exit_code);
    }
    last_exit_code
}

async fn execute(executor: &mut Executor, command: &str, last_exit_code: i32) -> i32 {
    match executor.execute_interactive(command, last_exit_code).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("wardsh: execution failed: {err}");
            EXIT_BLOCKED
        }
    }
}
