//! wardsh entry point: startup checks, banner, then the decision loop.

mod shell;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use wardsh_audit::AuditLog;
use wardsh_config::{Config, Mode};
use wardsh_exec::Executor;
use wardsh_llm::ProviderChain;
use wardsh_validator::Validator;

/// LLM-mediated shell with security validation.
#[derive(Parser, Debug)]
#[command(name = "wardsh", about, disable_version_flag = true)]
struct Cli {
    /// Alternate config file path (development use).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Show version and configured providers, then exit.
    #[arg(short = 'v', long)]
    version: bool,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("wardsh: fatal: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let env: HashMap<String, String> = std::env::vars().collect();
    let config = match cli.config {
        Some(path) => Config::load_from(&path, env)?,
        None => Config::load_from(Path::new(wardsh_config::CONFIG_FILE_PATH), env)?,
    };

    if cli.version {
        println!("wardsh {}", env!("CARGO_PKG_VERSION"));
        let chain = config.model_chain();
        let mut providers: Vec<&str> = Vec::new();
        for model in &chain {
            let provider = wardsh_llm::provider_from_model(model);
            if wardsh_llm::api_key(provider).is_some() && !providers.contains(&provider) {
                providers.push(provider);
            }
        }
        if providers.is_empty() {
            println!("Configured providers: none (set an API key to enable)");
        } else {
            println!("Configured providers: {}", providers.join(", "));
        }
        return Ok(0);
    }

    run_integrity_gate(&config)?;

    let chain_models = config.model_chain();
    let credentials = wardsh_llm::validate_credentials(&chain_models)
        .map_err(|message| anyhow::anyhow!("{message}"))?;

    let mut chain = ProviderChain::from_config(&config).context("building provider chain")?;
    let health = chain.health_check().await;

    let audit = AuditLog::init(&config);
    if !audit.is_available() {
        warn!("audit logging unavailable for this session");
    }

    let sandbox_status = match config.validate_sandboxer_library() {
        Ok(_) => format!(
            "enforcing ({} shell interpreters denied)",
            wardsh_exec::DENIED_SHELLS.len()
        ),
        Err(_) => "unavailable".to_string(),
    };
    shell::print_banner(&config, &credentials, &sandbox_status, &health);

    let executor = Executor::new(config.clone());
    let validator = Validator::new(config.clone(), chain);
    let code = shell::run_shell(&config, validator, executor, audit).await;

    if config.mode() == Mode::Development {
        println!("wardsh: exiting to parent shell (not monitored)");
    }
    Ok(code)
}

/// Production refuses to enter the command loop unless both runtime
/// binaries verify; development degrades with warnings.
fn run_integrity_gate(config: &Config) -> Result<()> {
    match config.mode() {
        Mode::Production => {
            config
                .validate_shell_binary()
                .context("shell binary integrity check failed")?;
            config
                .validate_sandboxer_library()
                .context("sandbox library integrity check failed")?;
        }
        Mode::Development => {
            if let Err(err) = config.validate_shell_binary() {
                warn!(%err, "shell binary check failed");
            }
            if let Err(err) = config.validate_sandboxer_library() {
                warn!(%err, "sandbox library unavailable; children run without Landlock");
            }
        }
    }
    Ok(())
}
