//! Offline inspection and maintenance of persisted upload tasks.
//!
//! `rshare tasks` prints what a server restart would reload; `rshare purge`
//! deletes terminal rows that have aged past the retention window.

use anyhow::Result;
use chrono::Utc;

use resource_share_core::models::UploadTask;
use resource_share_core::store::TaskStore;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::{SqliteResourceStore, SqliteTaskStore};

/// Run the tasks command: print every task a recovery scan would load.
pub async fn run_tasks(config: &Config, owner: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let tasks = SqliteTaskStore::new(pool.clone());
    let resources = SqliteResourceStore::new(pool.clone());

    let cutoff = Utc::now() - config.upload.retention();
    let mut loaded: Vec<UploadTask> = match owner {
        Some(owner_id) => tasks
            .list_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|t| t.is_recoverable(cutoff))
            .collect(),
        None => tasks.load_recoverable(cutoff).await?,
    };
    loaded.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    println!("Upload tasks ({})", config.db.path.display());
    println!();
    if loaded.is_empty() {
        println!("  (none)");
    } else {
        println!(
            "  {:<36} {:>6} {:<10} {:>5} {:>8}  {}",
            "TASK", "OWNER", "STATUS", "PCT", "SIZE", "FILE"
        );
        println!("  {}", "-".repeat(90));
        for task in &loaded {
            println!("  {}", format_task_line(task));
        }
    }
    println!();
    println!("  Resources:   {}", resources.count().await?);

    pool.close().await;
    Ok(())
}

/// Run the purge command: delete terminal tasks older than the retention window.
pub async fn run_purge(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let tasks = SqliteTaskStore::new(pool.clone());

    let cutoff = Utc::now() - config.upload.retention();
    let removed = tasks.purge_stale(cutoff).await?;
    tracing::info!(removed, "Purged stale upload tasks");
    println!(
        "Purged {} task{} finished before {}",
        removed,
        if removed == 1 { "" } else { "s" },
        cutoff.format("%Y-%m-%d %H:%M")
    );

    pool.close().await;
    Ok(())
}

fn format_task_line(task: &UploadTask) -> String {
    let mut line = format!(
        "{:<36} {:>6} {:<10} {:>4}% {:>8}  {}",
        task.id,
        task.owner_id,
        task.status.as_str(),
        task.progress,
        format_bytes(task.file_size),
        task.file_name
    );
    if let Some(error) = &task.error {
        line.push_str(&format!("  ({})", error));
    }
    line
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(7 * 1024 * 1024 * 1024), "7.0 GB");
    }

    #[test]
    fn failed_task_line_shows_error() {
        let mut task = UploadTask::new(4, "a.zip", 2048, None, 0).unwrap();
        task.record_chunk(0).unwrap();
        task.fail("merge failed").unwrap();
        let line = format_task_line(&task);
        assert!(line.contains("failed"));
        assert!(line.contains("2.0 KB"));
        assert!(line.ends_with("(merge failed)"));
    }
}
