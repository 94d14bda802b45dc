//! Scheduling commands that operate directly on the queue database.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use phasequeue::config::PhaseQueueConfig;
use phasequeue::queue::models::{NewPhase, PhaseQueueItem, PhaseStatus};
use phasequeue::queue::server::open_store;
use phasequeue::queue::store::PhaseQueueStore;

fn store(config: &PhaseQueueConfig) -> Result<PhaseQueueStore> {
    open_store(config.db_path(), config.max_chain_length())
}

/// Accepts either a bare JSON array or `{"phases": [...]}`.
fn read_payload_file(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    match value {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut obj) => match obj.remove("phases") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => anyhow::bail!("{} has no \"phases\" array", path.display()),
        },
        _ => anyhow::bail!("{} must contain a JSON array of phases", path.display()),
    }
}

fn styled_status(status: PhaseStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        PhaseStatus::Completed => s.green(),
        PhaseStatus::Running => s.cyan(),
        PhaseStatus::Ready => s.yellow(),
        PhaseStatus::Failed => s.red().bold(),
        PhaseStatus::Blocked => s.red(),
        PhaseStatus::Queued => s.dim(),
    }
}

fn describe(item: &PhaseQueueItem) -> String {
    match item.title() {
        Some(title) => format!("phase {} ({})", item.phase_number, title),
        None => format!("phase {}", item.phase_number),
    }
}

pub async fn cmd_enqueue(
    config: &PhaseQueueConfig,
    group_id: i64,
    titles: &[String],
    file: Option<&Path>,
) -> Result<()> {
    let store = store(config)?;
    let ids = match file {
        Some(path) => store.enqueue(group_id, read_payload_file(path)?).await?,
        None if titles.is_empty() => {
            anyhow::bail!("Provide at least one --phase or a --file with phase payloads")
        }
        None => {
            let phases = titles.iter().map(|t| NewPhase::titled(t)).collect();
            store
                .enqueue_phases(group_id, phases)
                .await?
                .into_iter()
                .map(|item| item.queue_id)
                .collect()
        }
    };

    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

pub async fn cmd_status(config: &PhaseQueueConfig, group_id: i64, json: bool) -> Result<()> {
    let view = store(config)?.group_view(group_id).await?;
    if view.phases.is_empty() {
        anyhow::bail!("No phases found for group {}", group_id);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let summary = &view.summary;
    println!();
    println!(
        "Group {}: {}/{} completed",
        style(group_id).bold(),
        summary.completed,
        summary.total
    );
    println!();
    println!(
        "  {:>3}  {:<10} {:>8}  {:<36}  TITLE",
        "#", "STATUS", "REF", "QUEUE ID"
    );
    for item in &view.phases {
        let external_ref = item
            .external_ref
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>3}  {:<10} {:>8}  {:<36}  {}",
            item.phase_number,
            styled_status(item.status),
            external_ref,
            item.queue_id,
            item.title().unwrap_or("")
        );
        if let Some(msg) = &item.error_message {
            println!("       {}", style(msg).dim());
        }
    }
    println!();
    if summary.has_failure() {
        println!("{}", style("Group failed.").red());
    } else if summary.is_finished() {
        println!("{}", style("Group finished.").green());
    }
    Ok(())
}

pub async fn cmd_dispatch(config: &PhaseQueueConfig, queue_id: &str, external_ref: i64) -> Result<()> {
    let item = store(config)?.mark_running(queue_id, external_ref).await?;
    println!(
        "{} of group {} is running (ref {})",
        describe(&item),
        item.group_id,
        external_ref
    );
    Ok(())
}

pub async fn cmd_complete(config: &PhaseQueueConfig, queue_id: &str) -> Result<()> {
    let outcome = store(config)?.mark_complete(queue_id).await?;
    if !outcome.changed {
        println!("{} was already completed", describe(&outcome.item));
        return Ok(());
    }
    println!("{} completed", describe(&outcome.item));
    match &outcome.promoted {
        Some(next) => println!("{} is ready: {}", describe(next), next.queue_id),
        None => println!("No more phases in group {}", outcome.item.group_id),
    }
    Ok(())
}

pub async fn cmd_fail(config: &PhaseQueueConfig, queue_id: &str, error: &str) -> Result<()> {
    let outcome = store(config)?.mark_failed(queue_id, error).await?;
    if !outcome.changed {
        println!("{} had already failed", describe(&outcome.item));
        return Ok(());
    }
    println!("{} failed", describe(&outcome.item));
    for blocked in &outcome.blocked {
        println!("  {} {}", style("blocked").red(), describe(blocked));
    }
    Ok(())
}

pub async fn cmd_cancel(config: &PhaseQueueConfig, queue_id: &str, force: bool) -> Result<()> {
    let outcome = store(config)?.remove(queue_id, force).await?;
    println!("Removed {} phase(s)", outcome.removed.len());
    Ok(())
}

pub async fn cmd_cancel_group(config: &PhaseQueueConfig, group_id: i64, force: bool) -> Result<()> {
    let outcome = store(config)?.cancel_group(group_id, force).await?;
    if outcome.removed.is_empty() {
        println!("Nothing to remove in group {}", group_id);
    } else {
        println!(
            "Removed {} phase(s) from group {}",
            outcome.removed.len(),
            group_id
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_payload_file_accepts_array_and_object() {
        let dir = tempdir().unwrap();
        let array = dir.path().join("a.json");
        std::fs::write(&array, r#"[{"title": "x"}, {"title": "y"}]"#).unwrap();
        assert_eq!(read_payload_file(&array).unwrap().len(), 2);

        let object = dir.path().join("o.json");
        std::fs::write(&object, r#"{"phases": [{"title": "x"}]}"#).unwrap();
        assert_eq!(read_payload_file(&object).unwrap().len(), 1);
    }

    #[test]
    fn test_read_payload_file_rejects_other_shapes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"steps": []}"#).unwrap();
        assert!(read_payload_file(&path).is_err());
        std::fs::write(&path, "42").unwrap();
        assert!(read_payload_file(&path).is_err());
        std::fs::write(&path, "not json").unwrap();
        assert!(read_payload_file(&path).is_err());
    }
}
