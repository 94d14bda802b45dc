use anyhow::Result;
use console::style;

use phasequeue::config::PhaseQueueConfig;
use phasequeue::queue::server::{self, ServerConfig};
use phasequeue::queue::ws::WsBroadcaster;

pub async fn cmd_serve(config: &PhaseQueueConfig, port: Option<u16>) -> Result<()> {
    let mut server_config = ServerConfig::from_config(config);
    if let Some(port) = port {
        server_config.port = port;
    }
    server::start_server(server_config).await
}

/// One reconciliation pass without the server, for cron-style use.
pub async fn cmd_reconcile(config: &PhaseQueueConfig) -> Result<()> {
    let server_config = ServerConfig::from_config(config);
    let store = server::open_store(&server_config.db_path, server_config.max_chain_length)?;
    let coordinator = server::build_coordinator(&server_config, store, WsBroadcaster::new())?;

    let report = coordinator.run_cycle().await;

    println!();
    println!("Reconciled {} running phase(s)", report.polled);
    println!("  {:<14} {}", "completed", style(report.completed).green());
    println!("  {:<14} {}", "failed", style(report.failed).red());
    println!("  {:<14} {}", "blocked", style(report.blocked).red());
    println!("  {:<14} {}", "still running", report.still_running);
    println!("  {:<14} {}", "not found", report.not_found);
    if report.errors > 0 {
        println!("  {:<14} {}", "errors", style(report.errors).yellow().bold());
    }
    println!();
    Ok(())
}
