//! Configuration view and validation commands: `phasequeue config`.

use std::path::Path;

use anyhow::Result;

use phasequeue::config::{self, PhaseQueueConfig};

use super::super::ConfigCommands;

pub fn cmd_config(config: &PhaseQueueConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => show(config),
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config.config_path.exists() {
                println!(
                    "No phasequeue.toml found at {}. Checking defaults.",
                    config.config_path.display()
                );
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        // Handled before the config is loaded; see main.
        Some(ConfigCommands::Init) => cmd_config_init(&config.config_path)?,
    }

    Ok(())
}

fn show(config: &PhaseQueueConfig) {
    let toml = &config.toml;

    println!();
    println!("phasequeue configuration");
    println!("========================");
    println!();
    if config.config_path.exists() {
        println!("Config file: {}", config.config_path.display());
    } else {
        println!(
            "No phasequeue.toml found at {} (using defaults)",
            config.config_path.display()
        );
    }
    println!();
    println!("Effective values (with env/CLI overrides):");
    println!();

    println!("[queue]");
    println!("  max_chain_length = {}", toml.queue.max_chain_length);
    println!("  db_path = \"{}\"", toml.queue.db_path.display());
    println!();

    println!("[coordinator]");
    println!("  poll_interval_secs = {}", toml.coordinator.poll_interval_secs);
    println!(
        "  provider_timeout_secs = {}",
        toml.coordinator.provider_timeout_secs
    );
    println!(
        "  notify_timeout_secs = {}",
        toml.coordinator.notify_timeout_secs
    );
    println!();

    println!("[provider]");
    match &toml.provider.base_url {
        Some(url) => println!("  base_url = \"{}\"", url),
        None => println!("  base_url = (unset)"),
    }
    println!();

    println!("[github]");
    match &toml.github.repo {
        Some(repo) => println!("  repo = \"{}\"", repo),
        None => println!("  repo = (unset)"),
    }
    println!(
        "  token_env = \"{}\" ({})",
        toml.github.token_env,
        if config.github_token().is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!("  api_base = \"{}\"", toml.github.api_base);
    println!();

    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!("  dev_mode = {}", toml.server.dev_mode);
    println!();

    let logging = config.logging();
    println!("[logging]");
    println!("  level = \"{}\"", logging.level);
    println!("  json = {}", logging.json);
    if let Some(dir) = &logging.dir {
        println!("  dir = \"{}\"", dir.display());
    }
    println!();

    if !config.config_path.exists() {
        println!("Run 'phasequeue config init' to create a phasequeue.toml file.");
        println!();
    }
}

pub fn cmd_config_init(path: &Path) -> Result<()> {
    config::init_config(path)?;

    println!("Created phasequeue.toml at {}", path.display());
    println!();
    println!("You can now customize:");
    println!("  - [queue] max_chain_length, db_path");
    println!("  - [provider] base_url of the run-status service");
    println!("  - [github] repo and token_env for issue comments");
    println!();
    Ok(())
}
